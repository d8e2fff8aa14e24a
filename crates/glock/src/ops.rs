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

//! Per resource-kind behaviour plugged into the state machine.

use crate::error::{GlockError, Result};
use crate::types::{GlockKey, HolderFlags, InvalidateFlags, LockState, OpsFlags, OwnerId, ResourceType};
use std::fmt::Debug;

/// Snapshot of a glock handed to resource hooks.
#[derive(Debug, Clone, Copy)]
pub struct GlockView {
    pub key: GlockKey,
    pub state: LockState,
    pub target: LockState,
    pub dirty: bool,
}

/// Snapshot of the holder an acquire hook runs for.
#[derive(Debug, Clone, Copy)]
pub struct HolderView {
    pub state: LockState,
    pub flags: HolderFlags,
    pub owner: OwnerId,
}

/// Result of the first-holder acquire hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    /// Lock ordering conflict; the queue scan restarts.
    RetryableConflict,
    Fatal(GlockError),
}

/// Resource-kind operations.
///
/// `sync`, `invalidate`, `post_grant_refresh` and `acquire` run with the
/// glock lock released. `demote_ok` and `on_remote_callback` run with it
/// held and must not block.
pub trait GlockOperations: Send + Sync + Debug {
    fn resource_type(&self) -> ResourceType;

    fn flags(&self) -> OpsFlags {
        self.resource_type().default_ops_flags()
    }

    /// Write back dirty cached state before the lock is downgraded.
    fn sync(&self, _gl: &GlockView) -> Result<()> {
        Ok(())
    }

    /// Drop cached state before the lock goes to Unlocked or Deferred.
    fn invalidate(&self, _gl: &GlockView, _flags: InvalidateFlags) -> Result<()> {
        Ok(())
    }

    /// Re-read cached state after a remote grant.
    fn post_grant_refresh(&self, _gl: &GlockView) -> Result<()> {
        Ok(())
    }

    fn has_acquire_hook(&self) -> bool {
        false
    }

    fn acquire(&self, _gl: &GlockView, _holder: &HolderView) -> AcquireOutcome {
        AcquireOutcome::Granted
    }

    fn demote_ok(&self, _gl: &GlockView) -> bool {
        true
    }

    fn on_remote_callback(&self, _gl: &GlockView, _requested: LockState, _remote: bool) {}
}

/// Operations for resource kinds that keep no cached state of their own.
#[derive(Debug, Clone, Copy)]
pub struct BasicOps {
    kind: ResourceType,
    flags: OpsFlags,
}

impl BasicOps {
    pub fn new(kind: ResourceType) -> Self {
        Self {
            kind,
            flags: kind.default_ops_flags(),
        }
    }

    pub fn with_flags(mut self, flags: OpsFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl GlockOperations for BasicOps {
    fn resource_type(&self) -> ResourceType {
        self.kind
    }

    fn flags(&self) -> OpsFlags {
        self.flags
    }
}
