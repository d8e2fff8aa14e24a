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

pub mod local;

use crate::error::Result;
use crate::types::{GlockKey, LmFlags, LockState, ReplyCode};
use async_trait::async_trait;
use std::sync::Arc;

/// Cluster lock service boundary.
///
/// Each request future resolves with the reply for that request; the
/// manager feeds it back into the glock state machine.
#[async_trait]
pub trait LockClient: Send + Sync + std::fmt::Debug {
    /// Ask the cluster to move the lock for `key` to `target`
    async fn request_state_change(&self, key: &GlockKey, target: LockState, flags: LmFlags) -> Result<ReplyCode>;

    /// Best-effort cancel of an outstanding request; its reply is then `CANCELED`
    async fn cancel_pending(&self, key: &GlockKey) -> Result<()>;

    /// Forget the lock resource entirely
    async fn release(&self, key: &GlockKey) -> Result<()>;

    /// Publish the value block for `key`; sent before a request that gives
    /// up exclusive access
    async fn write_lvb(&self, _key: &GlockKey, _lvb: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Value block last published for `key`, read after each grant
    async fn read_lvb(&self, _key: &GlockKey) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Check if the service is reachable
    async fn is_online(&self) -> bool {
        true
    }

    /// Single-node service that never contends
    fn is_local(&self) -> bool {
        false
    }
}

/// Client factory
pub struct ClientFactory;

impl ClientFactory {
    /// Create local (single node) client
    pub fn create_local() -> Arc<dyn LockClient> {
        Arc::new(local::LocalClient::new())
    }
}
