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

use crate::client::LockClient;
use crate::error::Result;
use crate::types::{GlockKey, LmFlags, LockState, ReplyCode};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::trace;

/// Single-node lock client
///
/// Every request is granted as asked. Tracks the state the "cluster" believes
/// each lock is in, which is useful for tests and tooling. Value blocks
/// outlive releases, so managers sharing one client see each other's.
#[derive(Debug, Default)]
pub struct LocalClient {
    granted: Mutex<HashMap<GlockKey, LockState>>,
    lvbs: Mutex<HashMap<GlockKey, Vec<u8>>>,
}

impl LocalClient {
    /// Create new local client
    pub fn new() -> Self {
        Self::default()
    }

    /// State most recently granted for `key`, if the resource is known
    pub fn granted_state(&self, key: &GlockKey) -> Option<LockState> {
        self.granted.lock().get(key).copied()
    }

    pub fn resource_count(&self) -> usize {
        self.granted.lock().len()
    }
}

#[async_trait::async_trait]
impl LockClient for LocalClient {
    async fn request_state_change(&self, key: &GlockKey, target: LockState, flags: LmFlags) -> Result<ReplyCode> {
        trace!(glock = %key, %target, ?flags, "local lock request");
        self.granted.lock().insert(*key, target);
        Ok(ReplyCode::granted(target))
    }

    async fn cancel_pending(&self, _key: &GlockKey) -> Result<()> {
        Ok(())
    }

    async fn release(&self, key: &GlockKey) -> Result<()> {
        self.granted.lock().remove(key);
        Ok(())
    }

    async fn write_lvb(&self, key: &GlockKey, lvb: &[u8]) -> Result<()> {
        self.lvbs.lock().insert(*key, lvb.to_vec());
        Ok(())
    }

    async fn read_lvb(&self, key: &GlockKey) -> Result<Option<Vec<u8>>> {
        Ok(self.lvbs.lock().get(key).cloned())
    }

    fn is_local(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FsId, ResourceType};

    #[tokio::test]
    async fn test_local_client_grants_and_releases() {
        let client = LocalClient::new();
        let key = GlockKey::new(11, ResourceType::Inode, FsId(0));

        let reply = client
            .request_state_change(&key, LockState::Shared, LmFlags::empty())
            .await
            .unwrap();
        assert_eq!(reply.state(), LockState::Shared);
        assert!(!reply.is_error());
        assert_eq!(client.granted_state(&key), Some(LockState::Shared));

        client.release(&key).await.unwrap();
        assert_eq!(client.resource_count(), 0);
        assert!(client.is_online().await);
    }

    #[tokio::test]
    async fn test_local_client_keeps_value_blocks() {
        let client = LocalClient::new();
        let key = GlockKey::new(12, ResourceType::Rgrp, FsId(0));
        assert_eq!(client.read_lvb(&key).await.unwrap(), None);

        client.write_lvb(&key, b"free=42").await.unwrap();
        client.release(&key).await.unwrap();
        assert_eq!(client.read_lvb(&key).await.unwrap().as_deref(), Some(&b"free=42"[..]));
    }
}
