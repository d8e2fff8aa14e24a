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

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rustfs_glock::{
    AcquireOutcome, GlockConfig, GlockError, GlockKey, GlockManager, GlockOperations, GlockView, HolderView, InvalidateFlags,
    LmFlags, LockClient, LockState, OpsFlags, ReplyCode, ResourceType, Result,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Small, fast configuration for tests.
pub fn test_config() -> GlockConfig {
    GlockConfig {
        hold_time: Duration::from_millis(20),
        ..GlockConfig::minimal()
    }
}

pub fn manager_with(client: Arc<ScriptedClient>) -> Arc<GlockManager> {
    GlockManager::new(test_config(), client).expect("manager should start")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub key: GlockKey,
    pub target: LockState,
    pub flags: LmFlags,
}

struct Pending {
    request: Request,
    reply: oneshot::Sender<ReplyCode>,
}

/// Lock service double. Grants immediately unless replies are held, and
/// records every request, cancel and release it sees.
#[derive(Default)]
pub struct ScriptedClient {
    granted: Mutex<HashMap<GlockKey, LockState>>,
    requests: Mutex<Vec<Request>>,
    cancels: Mutex<Vec<GlockKey>>,
    releases: Mutex<Vec<GlockKey>>,
    failing: Mutex<HashSet<(GlockKey, LockState)>>,
    pending: Mutex<VecDeque<Pending>>,
    hold: AtomicBool,
    arrived: Notify,
    request_count: AtomicUsize,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("requests", &self.requests.lock().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Keep replies until the test releases them.
    pub fn hold_replies(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Reply with an error whenever `key` is asked for `target`.
    pub fn fail_target(&self, key: GlockKey, target: LockState) {
        self.failing.lock().insert((key, target));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn targets_for(&self, key: GlockKey) -> Vec<LockState> {
        self.requests.lock().iter().filter(|r| r.key == key).map(|r| r.target).collect()
    }

    pub fn cancels(&self) -> Vec<GlockKey> {
        self.cancels.lock().clone()
    }

    pub fn releases(&self) -> Vec<GlockKey> {
        self.releases.lock().clone()
    }

    pub fn granted_state(&self, key: &GlockKey) -> Option<LockState> {
        self.granted.lock().get(key).copied()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until at least `count` held requests are outstanding.
    pub async fn wait_pending(&self, count: usize) {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_count() >= count {
                return;
            }
            tokio::time::timeout(Duration::from_secs(5), notified)
                .await
                .expect("lock request should arrive");
        }
    }

    /// Answer the oldest held request.
    pub fn reply_next(&self, reply: impl FnOnce(&Request) -> ReplyCode) -> Option<Request> {
        let pending = self.pending.lock().pop_front()?;
        let code = reply(&pending.request);
        if !code.is_error() && !code.is_canceled() {
            self.granted.lock().insert(pending.request.key, code.state());
        }
        let _ = pending.reply.send(code);
        Some(pending.request)
    }

    /// Grant the oldest held request as asked.
    pub fn grant_next(&self) -> Option<Request> {
        self.reply_next(|req| ReplyCode::granted(req.target))
    }

    fn current(&self, key: &GlockKey) -> LockState {
        self.granted.lock().get(key).copied().unwrap_or(LockState::Unlocked)
    }
}

#[async_trait]
impl LockClient for ScriptedClient {
    async fn request_state_change(&self, key: &GlockKey, target: LockState, flags: LmFlags) -> Result<ReplyCode> {
        let request = Request { key: *key, target, flags };
        self.requests.lock().push(request.clone());
        self.request_count.fetch_add(1, Ordering::SeqCst);

        if self.failing.lock().contains(&(*key, target)) {
            return Ok(ReplyCode::error(self.current(key)));
        }
        if !self.hold.load(Ordering::SeqCst) {
            self.granted.lock().insert(*key, target);
            return Ok(ReplyCode::granted(target));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(Pending { request, reply: tx });
        self.arrived.notify_waiters();
        rx.await.map_err(|_| GlockError::configuration("scripted reply dropped"))
    }

    async fn cancel_pending(&self, key: &GlockKey) -> Result<()> {
        self.cancels.lock().push(*key);
        let cancelled = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|p| p.request.key == *key)
                .and_then(|pos| pending.remove(pos))
        };
        if let Some(pending) = cancelled {
            let _ = pending.reply.send(ReplyCode::canceled(self.current(key)));
        }
        Ok(())
    }

    async fn release(&self, key: &GlockKey) -> Result<()> {
        self.releases.lock().push(*key);
        self.granted.lock().remove(key);
        Ok(())
    }
}

/// Resource operations that count hook calls and fail on demand.
#[derive(Debug)]
pub struct RecordingOps {
    kind: ResourceType,
    flags: OpsFlags,
    pub syncs: AtomicUsize,
    pub invalidates: Mutex<Vec<InvalidateFlags>>,
    pub refreshes: AtomicUsize,
    pub callbacks: Mutex<Vec<(LockState, bool)>>,
    pub fail_sync: AtomicBool,
    pub fail_refresh: AtomicBool,
    pub refuse_demote: AtomicBool,
    acquire: Mutex<Option<VecDeque<AcquireOutcome>>>,
    pub acquire_calls: AtomicUsize,
}

impl RecordingOps {
    pub fn new(kind: ResourceType) -> Arc<Self> {
        Arc::new(Self::build(kind, kind.default_ops_flags()))
    }

    pub fn with_flags(kind: ResourceType, flags: OpsFlags) -> Arc<Self> {
        Arc::new(Self::build(kind, flags))
    }

    /// Enable the acquire hook; it answers from `outcomes`, then grants.
    pub fn with_acquire(kind: ResourceType, outcomes: Vec<AcquireOutcome>) -> Arc<Self> {
        let ops = Self::build(kind, kind.default_ops_flags());
        *ops.acquire.lock() = Some(outcomes.into());
        Arc::new(ops)
    }

    fn build(kind: ResourceType, flags: OpsFlags) -> Self {
        Self {
            kind,
            flags,
            syncs: AtomicUsize::new(0),
            invalidates: Mutex::new(Vec::new()),
            refreshes: AtomicUsize::new(0),
            callbacks: Mutex::new(Vec::new()),
            fail_sync: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            refuse_demote: AtomicBool::new(false),
            acquire: Mutex::new(None),
            acquire_calls: AtomicUsize::new(0),
        }
    }
}

impl GlockOperations for RecordingOps {
    fn resource_type(&self) -> ResourceType {
        self.kind
    }

    fn flags(&self) -> OpsFlags {
        self.flags
    }

    fn sync(&self, gl: &GlockView) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(GlockError::flush(gl.key, "injected write-back failure"));
        }
        Ok(())
    }

    fn invalidate(&self, _gl: &GlockView, flags: InvalidateFlags) -> Result<()> {
        self.invalidates.lock().push(flags);
        Ok(())
    }

    fn post_grant_refresh(&self, gl: &GlockView) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(GlockError::hook(gl.key, "injected refresh failure"));
        }
        Ok(())
    }

    fn has_acquire_hook(&self) -> bool {
        self.acquire.lock().is_some()
    }

    fn acquire(&self, _gl: &GlockView, _holder: &HolderView) -> AcquireOutcome {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.acquire
            .lock()
            .as_mut()
            .and_then(VecDeque::pop_front)
            .unwrap_or(AcquireOutcome::Granted)
    }

    fn demote_ok(&self, _gl: &GlockView) -> bool {
        !self.refuse_demote.load(Ordering::SeqCst)
    }

    fn on_remote_callback(&self, _gl: &GlockView, requested: LockState, remote: bool) {
        self.callbacks.lock().push((requested, remote));
    }
}

/// Poll `cond` on the runtime until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(cond(), "condition not reached in time");
}
