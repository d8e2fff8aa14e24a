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

//! Lock requests against a glock.

use crate::error::{GlockError, Result};
use crate::manager::GlockRef;
use crate::ops::HolderView;
use crate::types::{HolderFlags, LockState, OwnerId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio::time::Instant;

static NEXT_HOLDER_ID: AtomicU64 = AtomicU64::new(1);

const HIF_WAIT: u8 = 1 << 0;
const HIF_HOLDER: u8 = 1 << 1;

/// Queue entry shared between a [`Holder`] and its glock's holder queue.
#[derive(Debug)]
pub(crate) struct HolderShared {
    pub(crate) id: u64,
    pub(crate) state: LockState,
    pub(crate) flags: HolderFlags,
    pub(crate) owner: OwnerId,
    iflags: AtomicU8,
    error: Mutex<Option<GlockError>>,
    notify: Notify,
}

impl HolderShared {
    pub(crate) fn new(state: LockState, flags: HolderFlags, owner: OwnerId) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HOLDER_ID.fetch_add(1, Ordering::Relaxed),
            state,
            flags,
            owner,
            iflags: AtomicU8::new(HIF_WAIT),
            error: Mutex::new(None),
            notify: Notify::new(),
        })
    }

    pub(crate) fn is_holder(&self) -> bool {
        self.iflags.load(Ordering::Acquire) & HIF_HOLDER != 0
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.iflags.load(Ordering::Acquire) & HIF_WAIT != 0
    }

    pub(crate) fn set_holder(&self) {
        self.iflags.fetch_or(HIF_HOLDER, Ordering::AcqRel);
    }

    pub(crate) fn clear_holder(&self) {
        self.iflags.fetch_and(!HIF_HOLDER, Ordering::AcqRel);
    }

    /// Record the outcome and wake the waiting caller.
    pub(crate) fn complete(&self, error: Option<GlockError>) {
        if let Some(err) = error {
            *self.error.lock() = Some(err);
        }
        self.iflags.fetch_and(!HIF_WAIT, Ordering::AcqRel);
        self.notify.notify_one();
    }

    pub(crate) fn take_error(&self) -> Option<GlockError> {
        self.error.lock().take()
    }

    pub(crate) fn view(&self) -> HolderView {
        HolderView {
            state: self.state,
            flags: self.flags,
            owner: self.owner,
        }
    }

    async fn wait_done(&self) {
        while self.is_waiting() {
            self.notify.notified().await;
        }
    }
}

/// One caller's request for, or grant of, a state on a glock.
///
/// Dropping a queued holder releases it.
#[derive(Debug)]
pub struct Holder {
    gl: GlockRef,
    state: LockState,
    flags: HolderFlags,
    owner: OwnerId,
    pub(crate) shared: Option<Arc<HolderShared>>,
}

impl Holder {
    pub fn new(gl: &GlockRef, state: LockState, flags: HolderFlags) -> Self {
        Self {
            gl: gl.clone(),
            state,
            flags,
            owner: OwnerId::current(),
            shared: None,
        }
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner = owner;
        self
    }

    /// Change the request of an idle holder.
    pub fn reinit(&mut self, state: LockState, flags: HolderFlags) -> Result<()> {
        if self.shared.is_some() {
            return Err(GlockError::invariant(self.gl.key(), "reinit of a queued holder"));
        }
        self.state = state;
        self.flags = flags;
        Ok(())
    }

    pub fn glock(&self) -> &GlockRef {
        &self.gl
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn flags(&self) -> HolderFlags {
        self.flags
    }

    pub(crate) fn set_flags(&mut self, flags: HolderFlags) {
        self.flags = flags;
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn is_queued(&self) -> bool {
        self.shared.is_some()
    }

    pub fn is_granted(&self) -> bool {
        self.shared.as_ref().is_some_and(|gh| gh.is_holder())
    }

    pub fn is_waiting(&self) -> bool {
        self.shared.as_ref().is_some_and(|gh| gh.is_waiting())
    }

    /// True once an asynchronous request has been answered.
    pub fn poll(&self) -> bool {
        !self.is_waiting()
    }

    /// Queue the request. Waits for the outcome unless `ASYNC` is set.
    pub async fn nq(&mut self) -> Result<()> {
        let mgr = self.gl.manager().clone();
        mgr.nq(self).await
    }

    /// Wait for a queued request to be granted or failed.
    pub async fn wait(&mut self) -> Result<()> {
        self.wait_since(Instant::now()).await
    }

    pub(crate) async fn wait_since(&mut self, start: Instant) -> Result<()> {
        let Some(shared) = self.shared.clone() else {
            return Err(GlockError::Dequeued { key: self.gl.key() });
        };
        shared.wait_done().await;
        self.gl.manager().update_hold_time(self.gl.glock(), start);
        self.finish()
    }

    /// Collect the outcome of an answered request.
    pub(crate) fn finish(&mut self) -> Result<()> {
        let Some(shared) = self.shared.as_ref() else {
            return Err(GlockError::Dequeued { key: self.gl.key() });
        };
        match shared.take_error() {
            Some(err) => {
                self.shared = None;
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Release the holder, or withdraw it from the queue if still waiting.
    pub async fn dq(&mut self) {
        if let Some(shared) = self.shared.take() {
            self.gl.manager().dq(self.gl.glock(), &shared).await;
        }
    }

    /// Release, then wait for any demote in progress to finish.
    pub async fn dq_wait(&mut self) {
        self.dq().await;
        self.gl.manager().wait_on_demote(self.gl.glock()).await;
    }
}

impl Drop for Holder {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            self.gl.manager().dq_detached(&self.gl, shared);
        }
    }
}
