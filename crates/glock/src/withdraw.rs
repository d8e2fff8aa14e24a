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

//! Filesystem-wide fault state.
//!
//! Normal -> WithdrawRequested -> Withdrawing -> Withdrawn. The only way
//! back to Normal is an explicit [`WithdrawCoordinator::reset`] after
//! journal recovery has completed.

use crate::error::GlockError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WithdrawState {
    Normal,
    WithdrawRequested,
    /// Own journal is being recovered by the cluster.
    Withdrawing,
    Withdrawn,
}

impl fmt::Display for WithdrawState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WithdrawState::Normal => "normal",
            WithdrawState::WithdrawRequested => "withdraw_requested",
            WithdrawState::Withdrawing => "withdrawing",
            WithdrawState::Withdrawn => "withdrawn",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct WithdrawCoordinator {
    state: watch::Sender<WithdrawState>,
    first_error: Mutex<Option<GlockError>>,
}

impl Default for WithdrawCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl WithdrawCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(WithdrawState::Normal);
        Self {
            state,
            first_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WithdrawState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WithdrawState> {
        self.state.subscribe()
    }

    /// Remember a fatal error. Only the first one is kept; returns whether
    /// this call recorded it.
    pub fn record_error(&self, err: GlockError) -> bool {
        let mut first = self.first_error.lock();
        if first.is_some() {
            warn!("additional withdraw-class error ignored: {}", err);
            return false;
        }
        error!("fatal glock error recorded: {}", err);
        *first = Some(err);
        true
    }

    pub fn first_error(&self) -> Option<GlockError> {
        self.first_error.lock().clone()
    }

    pub fn request(&self) -> bool {
        self.transition(&[WithdrawState::Normal], WithdrawState::WithdrawRequested)
    }

    /// Stop trusting local state and wait for journal recovery.
    pub fn begin(&self) -> bool {
        self.transition(
            &[WithdrawState::Normal, WithdrawState::WithdrawRequested],
            WithdrawState::Withdrawing,
        )
    }

    pub fn recovery_complete(&self) -> bool {
        self.transition(&[WithdrawState::Withdrawing], WithdrawState::Withdrawn)
    }

    pub fn reset(&self) -> bool {
        let reset = self.transition(&[WithdrawState::Withdrawn], WithdrawState::Normal);
        if reset {
            self.first_error.lock().take();
        }
        reset
    }

    /// Withdrawing or Withdrawn.
    pub fn is_withdrawn(&self) -> bool {
        matches!(self.state(), WithdrawState::Withdrawing | WithdrawState::Withdrawn)
    }

    pub fn in_recovery(&self) -> bool {
        self.state() == WithdrawState::Withdrawing
    }

    pub async fn wait_recovery(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|state| *state != WithdrawState::Withdrawing).await;
    }

    fn transition(&self, from: &[WithdrawState], to: WithdrawState) -> bool {
        let mut prev = None;
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                prev = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(prev) = prev {
            info!("withdraw state {} -> {}", prev, to);
        }
        changed
    }
}
