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

use common::{RecordingOps, ScriptedClient, eventually, manager_with, test_config};
use rustfs_glock::{GlockError, GlockFlags, GlockManager, HolderFlags, LockState, OwnerId, ResourceType, WithdrawState};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_withdrawn_filesystem_refuses_new_holders() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let gl = mgr
        .get(1, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");

    mgr.withdraw();
    assert_eq!(mgr.withdraw_state(), WithdrawState::Withdrawing);

    let mut h1 = gl.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1));
    let err = h1.nq().await.expect_err("withdrawn filesystem fails fast");
    assert!(matches!(err, GlockError::Withdrawn { .. }), "unexpected error: {err}");

    let mut h2 = gl.holder(LockState::Shared, HolderFlags::NOEXP).with_owner(OwnerId::new(2));
    h2.nq().await.expect("recovery holders are exempt");
    assert_eq!(gl.state(), LockState::Shared);
}

#[tokio::test]
async fn test_nondisk_and_own_journal_are_exempt() {
    let client = ScriptedClient::new();
    let mgr = GlockManager::new(test_config().with_journal_id(77), client.clone()).expect("manager should start");
    mgr.withdraw();

    let flock = mgr
        .get(1, RecordingOps::new(ResourceType::Flock), true)
        .await
        .expect("Should create glock");
    let mut h1 = flock.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("non-disk locks keep working");

    let journal = mgr
        .get(77, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h2 = journal.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(2));
    h2.nq().await.expect("own journal lock keeps working");

    let other = mgr
        .get(78, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h3 = other.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(3));
    assert!(h3.nq().await.is_err());

    other.allow_during_withdraw();
    h3.nq().await.expect("explicitly allowed glock keeps working");
}

#[tokio::test]
async fn test_release_waits_for_recovery() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let gl = mgr
        .get(2, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h1 = gl.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("H1 should be granted");

    mgr.withdraw();
    let release = tokio::spawn(async move {
        h1.dq().await;
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!release.is_finished(), "release must wait for journal recovery");
    assert_eq!(gl.holder_count(), 1);

    assert!(mgr.recovery_complete());
    release.await.expect("release should finish");
    assert_eq!(gl.holder_count(), 0);
}

#[tokio::test]
async fn test_unlock_deferred_until_recovery() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let gl = mgr
        .get(3, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h1 = gl.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("H1 should be granted");
    h1.dq().await;

    mgr.withdraw();
    mgr.remote_callback(3, ResourceType::Inode, LockState::Unlocked)
        .await
        .expect("callback should find the glock");
    eventually(|| mgr.metrics().snapshot().withdraw_deferred == 1).await;
    assert_eq!(gl.state(), LockState::Exclusive);
    assert_eq!(client.targets_for(gl.key()), vec![LockState::Exclusive]);

    mgr.recovery_complete();
    eventually(|| gl.state() == LockState::Unlocked).await;
    assert_eq!(client.targets_for(gl.key()), vec![LockState::Exclusive, LockState::Unlocked]);
}

#[tokio::test]
async fn test_flush_failure_withdraws_and_fails_waiter() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let ops = RecordingOps::new(ResourceType::Inode);
    let gl = mgr.get(4, ops.clone(), true).await.expect("Should create glock");

    let mut h1 = gl.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("H1 should be granted");
    ops.fail_sync.store(true, Ordering::SeqCst);

    let mut h2 = gl
        .holder(LockState::Shared, HolderFlags::ASYNC | HolderFlags::EXACT)
        .with_owner(OwnerId::new(2));
    h2.nq().await.expect("H2 should be queued");
    h1.dq().await;

    let err = h2.wait().await.expect_err("write-back failure reaches the waiter");
    assert!(matches!(err, GlockError::Flush { .. }), "unexpected error: {err}");
    assert_eq!(gl.state(), LockState::Exclusive);
    assert_eq!(mgr.withdraw_state(), WithdrawState::Withdrawing);
    assert!(matches!(
        mgr.withdraw_coordinator().first_error(),
        Some(GlockError::Flush { .. })
    ));
}

#[tokio::test]
async fn test_demote_flush_failure_waits_for_recovery() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let ops = RecordingOps::new(ResourceType::Inode);
    let gl = mgr.get(5, ops.clone(), true).await.expect("Should create glock");

    let mut h1 = gl.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("H1 should be granted");
    h1.dq().await;
    ops.fail_sync.store(true, Ordering::SeqCst);

    mgr.force_demote(5, ResourceType::Inode, LockState::Unlocked)
        .await
        .expect("force demote should be accepted");
    eventually(|| mgr.withdraw_state() == WithdrawState::Withdrawing).await;
    eventually(|| mgr.metrics().snapshot().withdraw_deferred == 1).await;
    assert_eq!(gl.state(), LockState::Exclusive, "nothing is released before recovery");

    mgr.recovery_complete();
    eventually(|| gl.state() == LockState::Unlocked).await;
    assert_eq!(ops.syncs.load(Ordering::SeqCst), 1, "no second write-back after recovery");
}

#[tokio::test]
async fn test_withdraw_is_monotonic() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let mut states = mgr.withdraw_coordinator().subscribe();

    mgr.withdraw();
    mgr.withdraw();
    assert!(!mgr.reset_withdraw(), "reset needs recovery first");
    assert_eq!(mgr.withdraw_state(), WithdrawState::Withdrawing);
    assert!(states.has_changed().expect("sender is alive"));
    assert_eq!(*states.borrow_and_update(), WithdrawState::Withdrawing);

    assert!(mgr.recovery_complete());
    assert!(!mgr.recovery_complete());
    assert_eq!(mgr.withdraw_state(), WithdrawState::Withdrawn);
    let gl = mgr
        .get(6, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h0 = gl.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(1));
    assert!(h0.nq().await.is_err(), "withdrawn stays withdrawn until reset");

    assert!(mgr.reset_withdraw());
    assert_eq!(mgr.withdraw_state(), WithdrawState::Normal);

    let mut h1 = gl.holder(LockState::Shared, HolderFlags::empty()).with_owner(OwnerId::new(2));
    h1.nq().await.expect("reset filesystem accepts holders again");
}

#[tokio::test]
async fn test_blocked_demote_becomes_unlock_after_recovery() {
    let client = ScriptedClient::new();
    let mgr = manager_with(client.clone());
    let gl = mgr
        .get(7, RecordingOps::new(ResourceType::Inode), true)
        .await
        .expect("Should create glock");
    let mut h1 = gl.holder(LockState::Exclusive, HolderFlags::empty()).with_owner(OwnerId::new(1));
    h1.nq().await.expect("H1 should be granted");
    h1.dq().await;

    mgr.withdraw();
    mgr.remote_callback(7, ResourceType::Inode, LockState::Shared)
        .await
        .expect("callback should find the glock");
    eventually(|| mgr.metrics().snapshot().withdraw_deferred == 1).await;
    assert_eq!(gl.state(), LockState::Exclusive);
    assert_eq!(client.targets_for(gl.key()), vec![LockState::Exclusive]);

    assert!(mgr.recovery_complete());
    eventually(|| gl.state() == LockState::Unlocked).await;
    assert_eq!(client.targets_for(gl.key()), vec![LockState::Exclusive, LockState::Unlocked]);
    assert!(!gl.flags().intersects(GlockFlags::DEMOTE | GlockFlags::DEMOTE_IN_PROGRESS));
}
