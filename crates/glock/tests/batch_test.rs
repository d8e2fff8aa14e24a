// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod common;

use common::{RecordingOps, ScriptedClient, manager_with};
use rustfs_glock::{GlockError, HolderFlags, LockState, OwnerId, ResourceType};

#[tokio::test]
async fn test_batch_acquires_in_key_order() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let g1 = mgr
        .get(5, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G1");
    let g2 = mgr
        .get(3, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G2");

    // Caller order is G1 then G2.
    let mut holders = vec![
        g1.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1)),
        g2.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1)),
    ];
    mgr.acquire_many(&mut holders).await.expect("batch should be granted");

    let numbers: Vec<u64> = client.requests().iter().map(|r| r.key.number).collect();
    assert_eq!(numbers, vec![3, 5], "G2 (id 3) must be requested before G1 (id 5)");
    assert!(holders.iter().all(|h| h.is_granted()));
    assert!(
        holders.iter().all(|h| !h.flags().contains(HolderFlags::ASYNC)),
        "caller flags are restored"
    );

    mgr.dq_m(&mut holders).await;
    assert_eq!(g1.holder_count() + g2.holder_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_batch_leaves_nothing_attached() {
    let client = ScriptedClient::new();
    client.hold_replies(true);
    let mgr = manager_with(client.clone());
    let g1 = mgr
        .get(8, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G1");
    let g2 = mgr
        .get(9, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G2");

    let mut holders = vec![
        g1.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1)),
        g2.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1)),
    ];
    let err = mgr.acquire_many(&mut holders).await.expect_err("unanswered batch goes stale");
    assert!(matches!(err, GlockError::Stale { .. }), "unexpected error: {err}");
    assert!(err.is_retryable());
    assert!(holders.iter().all(|h| !h.is_queued()));
    assert_eq!(g1.holder_count() + g2.holder_count(), 0);
    assert_eq!(mgr.metrics().snapshot().stale_batches, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_batch_releases_granted_member() {
    let client = ScriptedClient::new();
    client.hold_replies(true);
    let mgr = manager_with(client.clone());
    let g1 = mgr
        .get(11, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G1");
    let g2 = mgr
        .get(12, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G2");

    let holders = vec![
        g2.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1)),
        g1.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1)),
    ];
    let batch = {
        let mgr = mgr.clone();
        tokio::spawn(async move {
            let mut holders = holders;
            let result = mgr.acquire_many(&mut holders).await;
            (result, holders)
        })
    };

    client.wait_pending(2).await;
    let granted = client.grant_next().expect("G1 request is outstanding");
    assert_eq!(granted.key, g1.key(), "lowest key is requested first");

    let (result, holders) = batch.await.expect("batch task should finish");
    let err = result.expect_err("half-answered batch goes stale");
    assert!(matches!(err, GlockError::Stale { .. }), "unexpected error: {err}");
    assert!(holders.iter().all(|h| !h.is_queued() && !h.is_granted()));
    assert_eq!(g1.holder_count() + g2.holder_count(), 0);
    assert_eq!(g1.state(), LockState::Shared, "granted member stays cached after release");
    assert_eq!(g2.state(), LockState::Unlocked);
    assert_eq!(mgr.metrics().snapshot().stale_batches, 1);
}

#[tokio::test]
async fn test_batch_failure_releases_granted_members() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let g1 = mgr
        .get(14, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G1");
    let g2 = mgr
        .get(15, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create G2");
    client.fail_target(g2.key(), LockState::Exclusive);

    let mut holders = vec![
        g2.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1)),
        g1.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1)),
    ];
    let err = mgr.acquire_many(&mut holders).await.expect_err("one refusal fails the batch");
    assert!(matches!(err, GlockError::RemoteProtocol { .. }), "unexpected error: {err}");
    assert!(holders.iter().all(|h| !h.is_queued()));
    assert_eq!(g1.holder_count() + g2.holder_count(), 0);
    assert_eq!(g1.state(), LockState::Exclusive, "granted member stays cached after release");
}

#[tokio::test]
async fn test_nq_m_sorts_and_strips_try() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let mut refs = Vec::new();
    for number in [30u64, 10, 20] {
        refs.push(
            mgr.get(number, RecordingOps::new(ResourceType::Rgrp), true)
                .await
                .expect("Should create glock"),
        );
    }
    let mut holders: Vec<_> = refs
        .iter()
        .map(|gl| gl.holder(LockState::Exclusive, HolderFlags::TRY).with_owner(OwnerId::new(1)))
        .collect();

    mgr.nq_m(&mut holders).await.expect("all holders should be granted");
    let numbers: Vec<u64> = client.requests().iter().map(|r| r.key.number).collect();
    assert_eq!(numbers, vec![10, 20, 30]);
    assert!(holders.iter().all(|h| h.is_granted() && !h.flags().is_try()));

    mgr.dq_m(&mut holders).await;
    assert!(refs.iter().all(|gl| gl.holder_count() == 0));
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    mgr.acquire_many(&mut []).await.expect("empty batch succeeds");
    assert!(client.requests().is_empty());
}
