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

//! Deferred work and lock service requests.
//!
//! Each glock has at most one work unit queued and one running. Queueing
//! while a unit is already queued merges into it. Lock service requests and
//! teardown run as spawned tasks and are counted so `flush` can wait for
//! them.

use crate::glock::{Glock, GlockFlags, GlockInner};
use crate::manager::GlockManager;
use crate::state_machine::GlockGuard;
use crate::types::{LVB_SIZE, LmFlags, LockState, OpsFlags, ReplyCode};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
pub(crate) struct Scheduler {
    handle: Handle,
    outstanding: AtomicUsize,
    idle: Notify,
}

impl Scheduler {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn begin_unit(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn end_unit(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no spawned unit is running or queued.
    pub(crate) async fn flush(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a spawned unit finished even if it panics.
struct UnitGuard(Arc<GlockManager>);

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.0.scheduler().end_unit();
    }
}

impl GlockManager {
    pub(crate) fn spawn_unit<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(mgr) = self.arc() else {
            return;
        };
        self.scheduler().begin_unit();
        let guard = UnitGuard(mgr);
        self.scheduler().handle().spawn(async move {
            let _guard = guard;
            fut.await;
        });
    }

    /// Queue a work unit for `gl` after `delay`. The caller hands over one
    /// reference; it is dropped here if a unit is already queued.
    pub(crate) fn queue_work(&self, gl: &Arc<Glock>, inner: &mut GlockInner, delay: Duration) {
        if inner.work.queued {
            if gl.lockref.sub_locked(1) {
                error!(glock = %gl.key(), "merged work unit held the last reference");
            }
            return;
        }
        inner.work.queued = true;
        inner.work.delay = delay;
        if inner.work.running {
            return;
        }
        inner.work.running = true;

        let Some(mgr) = self.arc() else {
            inner.work.running = false;
            return;
        };
        let gl = gl.clone();
        self.spawn_unit(async move { mgr.run_work(gl, delay).await });
    }

    async fn run_work(&self, gl: Arc<Glock>, mut delay: Duration) {
        loop {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.glock_work(&gl);

            let next = {
                let mut inner = gl.inner.lock();
                if inner.work.queued {
                    Some(inner.work.delay)
                } else {
                    inner.work.running = false;
                    None
                }
            };
            match next {
                Some(next) => delay = next,
                None => return,
            }
        }
    }

    /// Ask the lock service for `target`. The caller has taken a reference
    /// for the request; the reply carries it back through `complete`.
    pub(crate) fn submit_request(&self, gl: &Arc<Glock>, inner: &mut GlockInner, target: LockState, flags: LmFlags) {
        self.metrics().record_remote_request();
        trace!(glock = %gl.key(), %target, ?flags, "lock request");
        inner.stats.request_sent(Instant::now());
        let publish = inner
            .lvb
            .filter(|_| inner.state == LockState::Exclusive && target != LockState::Exclusive);
        let Some(mgr) = self.arc() else {
            return;
        };
        let gl = gl.clone();
        self.spawn_unit(async move {
            let key = gl.key();
            let reply = if target == LockState::Unlocked && mgr.skip_unlock() {
                ReplyCode::granted(LockState::Unlocked)
            } else {
                if let Some(lvb) = publish
                    && let Err(err) = mgr.client().write_lvb(&key, &lvb).await
                {
                    warn!(glock = %key, "lock value block write failed: {}", err);
                }
                match mgr.client().request_state_change(&key, target, flags).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(glock = %key, %target, "lock request failed: {}", err);
                        ReplyCode::error(gl.state())
                    }
                }
            };
            if gl.ops_flags().contains(OpsFlags::LVB) && reply.state().is_held() && !reply.is_error() && !reply.is_canceled() {
                mgr.refresh_lvb(&gl).await;
            }
            mgr.complete(&gl, reply);
        });
    }

    /// Copy the value block the lock service holds into the glock.
    async fn refresh_lvb(&self, gl: &Glock) {
        let key = gl.key();
        match self.client().read_lvb(&key).await {
            Ok(Some(value)) => {
                let mut inner = gl.inner.lock();
                if let Some(lvb) = inner.lvb.as_mut() {
                    let len = value.len().min(LVB_SIZE);
                    lvb[..len].copy_from_slice(&value[..len]);
                    lvb[len..].fill(0);
                }
            }
            Ok(None) => {}
            Err(err) => warn!(glock = %key, "lock value block read failed: {}", err),
        }
    }

    /// Cancel the lock service request in flight for `gl`, if any.
    pub(crate) fn cancel_request(&self, gl: &Glock) {
        self.metrics().record_cancel();
        let Some(mgr) = self.arc() else {
            return;
        };
        let key = gl.key();
        debug!(glock = %key, "cancelling in-flight request");
        self.spawn_unit(async move {
            if let Err(err) = mgr.client().cancel_pending(&key).await {
                warn!(glock = %key, "cancel failed: {}", err);
            }
        });
    }

    /// Drop one reference.
    pub(crate) fn glock_put(&self, gl: &Arc<Glock>) {
        if gl.lockref.put_fast() {
            return;
        }
        let inner = gl.inner.lock();
        if gl.lockref.sub_locked(1) {
            self.glock_put_final(gl, inner);
        }
    }

    /// Tear down a glock whose last reference is gone.
    pub(crate) fn glock_put_final(&self, gl: &Arc<Glock>, inner: GlockGuard<'_>) {
        gl.flags.set(GlockFlags::FREEING);
        self.lru_remove(gl);
        if !inner.holders.is_empty() {
            error!(glock = %gl.key(), holders = inner.holders.len(), "glock freed with queued holders");
        }
        drop(inner);
        trace!(glock = %gl.key(), "glock released");

        let Some(mgr) = self.arc() else {
            self.free_glock(gl);
            return;
        };
        let gl = gl.clone();
        self.spawn_unit(async move {
            if !mgr.skip_unlock()
                && let Err(err) = mgr.client().release(&gl.key()).await
            {
                warn!(glock = %gl.key(), "lock service release failed: {}", err);
            }
            mgr.free_glock(&gl);
        });
    }
}
