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

//! Glock state machine.
//!
//! A glock moves between lock states one remote request at a time. The
//! `LOCKED` flag marks a transition in progress: whoever sets it owns the
//! glock until it is cleared, including while hooks run with the glock lock
//! released.
//!
//! ```text
//! run_queue -> do_promote ---------------------------> (granted from cache)
//!           \-> do_xmote -> sync/invalidate -> submit -> complete
//!                                                          |
//! glock_work <- queue_work <-------------------------------/
//!     \-> finish_xmote -> do_promote / do_xmote (retry or relock)
//! ```

use crate::error::GlockError;
use crate::glock::{DeferredXmote, Glock, GlockFlags, GlockInner};
use crate::holder::HolderShared;
use crate::manager::GlockManager;
use crate::ops::AcquireOutcome;
use crate::queue::may_grant;
use crate::types::{HolderFlags, InvalidateFlags, LmFlags, LockState, OpsFlags, ReplyCode};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

pub(crate) type GlockGuard<'a> = MutexGuard<'a, GlockInner>;

impl GlockManager {
    /// Grant what can be granted from the cached state, otherwise start the
    /// transition the queue needs. `nonblock` pushes demotes to the work
    /// queue instead of running them in the caller.
    pub(crate) fn run_queue(&self, gl: &Arc<Glock>, inner: &mut GlockGuard<'_>, nonblock: bool) {
        if gl.flags.test(GlockFlags::FATAL) {
            return;
        }
        if gl.flags.test_and_set(GlockFlags::LOCKED) {
            return;
        }
        if gl.flags.test(GlockFlags::DEMOTE_IN_PROGRESS) {
            self.glock_bug(gl, inner, "queue run with a demote in progress");
            return;
        }

        if gl.flags.test(GlockFlags::DEMOTE) && inner.demote_state != inner.state {
            if inner.has_granted() {
                gl.flags.clear(GlockFlags::LOCKED);
                return;
            }
            if nonblock {
                gl.flags.clear(GlockFlags::LOCKED);
                gl.lockref.get();
                self.queue_work(gl, inner, Duration::ZERO);
                return;
            }
            if inner.demote_state == LockState::Exclusive {
                self.glock_bug(gl, inner, "demote to exclusive");
                return;
            }
            gl.flags.set(GlockFlags::DEMOTE_IN_PROGRESS);
            inner.target = inner.demote_state;
            let target = inner.target;
            self.do_xmote(gl, inner, None, target);
            return;
        }

        if gl.flags.test(GlockFlags::DEMOTE) {
            self.demote_wake(gl, inner);
        }
        if !self.do_promote(gl, inner) {
            gl.flags.clear(GlockFlags::LOCKED);
            return;
        }
        let Some(gh) = inner.first_waiter().cloned() else {
            gl.flags.clear(GlockFlags::LOCKED);
            return;
        };
        inner.target = gh.state;
        if !gh.flags.is_try() {
            self.do_error(gl, inner, None);
        }
        let target = inner.target;
        self.do_xmote(gl, inner, Some(&gh), target);
    }

    /// Walk the queue granting compatible waiters. Returns true when the
    /// first waiter is the head of the queue and cannot be granted, i.e. a
    /// state change is needed.
    pub(crate) fn do_promote(&self, gl: &Arc<Glock>, inner: &mut GlockGuard<'_>) -> bool {
        let mut conflicts = 0u32;
        'restart: loop {
            let mut index = 0;
            while index < inner.holders.len() {
                let gh = inner.holders[index].clone();
                if gh.is_holder() {
                    index += 1;
                    continue;
                }
                if !may_grant(inner, &gh) {
                    if index == 0 {
                        return true;
                    }
                    self.do_error(gl, inner, None);
                    return false;
                }
                if index == 0 && gl.ops().has_acquire_hook() && !gh.flags.contains(HolderFlags::SKIP) {
                    let ops = gl.ops().clone();
                    let view = gl.view(inner);
                    let holder = gh.view();
                    let outcome = MutexGuard::unlocked(inner, || ops.acquire(&view, &holder));

                    // The queue may have moved while unlocked.
                    if inner.position(&gh).is_none() || gh.is_holder() {
                        continue 'restart;
                    }
                    match outcome {
                        AcquireOutcome::Granted => self.grant(&gh),
                        AcquireOutcome::RetryableConflict => {
                            conflicts += 1;
                            if conflicts > self.config().acquire_hook_retries {
                                warn!(glock = %gl.key(), attempts = conflicts, "acquire hook kept conflicting");
                                self.remove_and_fail(
                                    inner,
                                    &gh,
                                    GlockError::AcquireConflict {
                                        key: gl.key(),
                                        attempts: conflicts,
                                    },
                                );
                                conflicts = 0;
                            }
                        }
                        AcquireOutcome::Fatal(err) => {
                            warn!(glock = %gl.key(), "acquire hook failed: {}", err);
                            self.remove_and_fail(inner, &gh, err);
                        }
                    }
                    continue 'restart;
                }
                self.grant(&gh);
                index += 1;
            }
            return false;
        }
    }

    fn remove_and_fail(&self, inner: &mut GlockInner, gh: &Arc<HolderShared>, err: GlockError) {
        if let Some(pos) = inner.position(gh) {
            inner.holders.remove(pos);
        }
        self.wake_holder(gh, Some(err));
    }

    /// Prepare the local cache for `target` and ask the lock service for it.
    pub(crate) fn do_xmote(&self, gl: &Arc<Glock>, inner: &mut GlockGuard<'_>, gh: Option<&Arc<HolderShared>>, target: LockState) {
        let key = gl.key();
        let gh_flags = gh.map(|gh| gh.flags).unwrap_or_default();

        if target != LockState::Unlocked && !gh_flags.contains(HolderFlags::NOEXP) && self.blocked_by_withdraw(gl) {
            if gh.is_some() {
                debug!(glock = %key, %target, "state change refused while withdrawn");
                self.fail_withdrawn(gl, inner);
                gl.flags.clear(GlockFlags::DEMOTE_IN_PROGRESS);
                inner.target = inner.state;
                gl.flags.clear(GlockFlags::LOCKED);
                return;
            }
            // A demote that cannot be sent as asked becomes a full release,
            // which may still go out once recovery allows it.
            debug!(glock = %key, %target, "demote widened to unlock while withdrawn");
            inner.demote_state = LockState::Unlocked;
            self.set_demote(gl);
            gl.flags.clear(GlockFlags::DEMOTE_IN_PROGRESS);
            inner.target = inner.state;
            gl.flags.clear(GlockFlags::LOCKED);
            gl.lockref.get();
            let delay = inner.hold_time;
            self.queue_work(gl, inner, delay);
            return;
        }

        let lm_flags = LmFlags::from(gh_flags);
        if inner.state == target {
            self.glock_bug(gl, inner, format!("transition to current state {target}"));
            return;
        }
        if inner.state == inner.target {
            self.glock_bug(gl, inner, format!("transition with target equal to state {target}"));
            return;
        }

        let mut owns_invalidate = false;
        if matches!(target, LockState::Unlocked | LockState::Deferred) {
            owns_invalidate = !gl.flags.test_and_set(GlockFlags::INVALIDATE_IN_PROGRESS);
            self.do_error(gl, inner, None);
        }

        inner.req = target;
        if target == LockState::Unlocked
            || inner.state == LockState::Exclusive
            || lm_flags.intersects(LmFlags::TRY | LmFlags::TRY_1CB)
        {
            gl.flags.clear(GlockFlags::BLOCKING);
        } else {
            gl.flags.set(GlockFlags::BLOCKING);
        }

        let ops = gl.ops().clone();
        let mut failure = None;
        if inner.state.is_held() {
            let view = gl.view(inner);
            match MutexGuard::unlocked(inner, || ops.sync(&view)) {
                Ok(()) => gl.flags.clear(GlockFlags::DIRTY),
                Err(err) => failure = Some(flush_error(gl, err)),
            }
        }
        if owns_invalidate {
            if failure.is_none() {
                let flags = match target {
                    LockState::Deferred => InvalidateFlags::empty(),
                    _ => InvalidateFlags::METADATA,
                };
                let view = gl.view(inner);
                if let Err(err) = MutexGuard::unlocked(inner, || ops.invalidate(&view, flags)) {
                    failure = Some(invalidate_error(gl, err));
                }
            }
            gl.flags.clear(GlockFlags::INVALIDATE_IN_PROGRESS);
        }

        if let Some(err) = failure {
            error!(glock = %key, state = %inner.state, %target, "cache preparation failed: {}", err);
            self.withdraw_now(err.clone());
            if gh.is_some() && !gl.flags.test(GlockFlags::DEMOTE_IN_PROGRESS) {
                inner.target = inner.state;
                self.do_error(gl, inner, Some(err));
                gl.flags.clear(GlockFlags::LOCKED);
                return;
            }
            // Nothing has been written back; release only once the journal
            // has been recovered elsewhere.
            self.defer_until_recovered(gl, inner, target, lm_flags);
            return;
        }

        if target == LockState::Unlocked && self.withdraw_state_in_recovery() && self.blocked_by_withdraw(gl) {
            self.defer_until_recovered(gl, inner, target, lm_flags);
            return;
        }

        gl.lockref.get();
        self.submit_request(gl, inner, target, lm_flags);
    }

    /// Park the transition until journal recovery finishes. A reference is
    /// held by the waiting task and handed to the work unit it queues.
    fn defer_until_recovered(&self, gl: &Arc<Glock>, inner: &mut GlockInner, target: LockState, flags: LmFlags) {
        warn!(glock = %gl.key(), %target, "state change deferred until recovery completes");
        self.metrics().record_withdraw_deferred();
        inner.deferred = Some(DeferredXmote { target, flags });
        let Some(mgr) = self.arc() else {
            return;
        };
        gl.lockref.get();
        let gl = gl.clone();
        self.spawn_unit(async move {
            mgr.withdraw_coordinator().wait_recovery().await;
            let mut inner = gl.inner.lock();
            mgr.queue_work(&gl, &mut inner, Duration::ZERO);
        });
    }

    fn retry_deferred(&self, gl: &Arc<Glock>, inner: &mut GlockGuard<'_>, deferred: DeferredXmote) {
        inner.deferred = None;
        if deferred.target == LockState::Unlocked && self.withdraw_state_in_recovery() && self.blocked_by_withdraw(gl) {
            self.defer_until_recovered(gl, inner, deferred.target, deferred.flags);
            return;
        }
        if deferred.target != LockState::Unlocked && self.blocked_by_withdraw(gl) {
            self.fail_withdrawn(gl, inner);
            gl.flags.clear(GlockFlags::DEMOTE_IN_PROGRESS);
            inner.target = inner.state;
            gl.flags.clear(GlockFlags::LOCKED);
            return;
        }
        debug!(glock = %gl.key(), target = %deferred.target, "resuming deferred state change");
        gl.lockref.get();
        self.submit_request(gl, inner, deferred.target, deferred.flags);
    }

    /// Fail every waiter that is not exempt from withdrawal.
    pub(crate) fn fail_withdrawn(&self, gl: &Glock, inner: &mut GlockInner) {
        let key = gl.key();
        self.fail_waiters(inner, |gh| {
            (!gh.flags.contains(HolderFlags::NOEXP)).then_some(GlockError::Withdrawn { key })
        });
    }

    /// Apply a reply from the lock service.
    pub(crate) fn finish_xmote(&self, gl: &Arc<Glock>, inner: &mut GlockGuard<'_>, reply: ReplyCode) {
        let key = gl.key();
        let state = reply.state();
        self.metrics().record_remote_reply(reply.is_error());
        trace!(glock = %key, %reply, target = %inner.target, "lock reply");

        self.state_change(gl, inner, state);
        let demoting = gl.flags.test(GlockFlags::DEMOTE_IN_PROGRESS);
        if demoting && state != LockState::Unlocked && inner.demote_state == LockState::Unlocked {
            inner.target = LockState::Unlocked;
        }

        if state != inner.target {
            let waiter = if demoting { None } else { inner.first_waiter().cloned() };
            if let Some(gh) = waiter.as_ref() {
                if reply.is_canceled() {
                    if !gh.flags.contains(HolderFlags::PRIORITY)
                        && let Some(pos) = inner.position(gh)
                    {
                        let moved = inner.holders.remove(pos);
                        inner.holders.push(moved);
                    }
                    if let Some(next) = inner.first_waiter().cloned() {
                        inner.target = next.state;
                    }
                    if !self.do_promote(gl, inner) {
                        gl.flags.clear(GlockFlags::LOCKED);
                        return;
                    }
                    if let Some(next) = inner.first_waiter().cloned() {
                        inner.target = next.state;
                        self.do_xmote(gl, inner, Some(&next), next.state);
                        return;
                    }
                }
                if reply.is_error() || gh.flags.is_try() {
                    inner.target = state;
                    let err = if reply.is_error() {
                        warn!(glock = %key, %reply, "lock service refused request");
                        Some(GlockError::remote(key, reply))
                    } else {
                        None
                    };
                    self.do_error(gl, inner, err);
                    gl.flags.clear(GlockFlags::LOCKED);
                    return;
                }
            } else if reply.is_error() || reply.is_canceled() {
                warn!(glock = %key, %reply, "demote refused, retrying later");
                gl.flags.clear(GlockFlags::DEMOTE_IN_PROGRESS);
                inner.target = state;
                gl.flags.clear(GlockFlags::LOCKED);
                gl.lockref.get();
                let delay = inner.hold_time;
                self.queue_work(gl, inner, delay);
                return;
            }

            let gh = inner.first_waiter().cloned();
            match state {
                LockState::Unlocked => {
                    let target = inner.target;
                    self.do_xmote(gl, inner, gh.as_ref(), target);
                }
                LockState::Shared | LockState::Deferred => {
                    self.do_xmote(gl, inner, gh.as_ref(), LockState::Unlocked);
                }
                LockState::Exclusive => {
                    let message = format!("wanted {} got {}", inner.target, state);
                    self.glock_bug(gl, inner, message);
                }
            }
            return;
        }

        if gl.flags.test_and_clear(GlockFlags::DEMOTE_IN_PROGRESS) {
            self.demote_wake(gl, inner);
        }
        if state != LockState::Unlocked {
            let ops = gl.ops().clone();
            let view = gl.view(inner);
            if let Err(err) = MutexGuard::unlocked(inner, || ops.post_grant_refresh(&view)) {
                warn!(glock = %key, %state, "refresh after grant failed: {}", err);
                self.do_error(gl, inner, Some(err));
                gl.flags.clear(GlockFlags::LOCKED);
                return;
            }
            if self.do_promote(gl, inner) {
                // Head changed while the request was in flight.
                gl.flags.clear(GlockFlags::LOCKED);
                gl.lockref.get();
                self.queue_work(gl, inner, Duration::ZERO);
                return;
            }
        }
        gl.flags.clear(GlockFlags::LOCKED);
    }

    fn state_change(&self, gl: &Glock, inner: &mut GlockInner, new_state: LockState) {
        let was_held = inner.state.is_held();
        if was_held != new_state.is_held() {
            if new_state.is_held() {
                gl.lockref.get();
            } else if gl.lockref.sub_locked(1) {
                error!(glock = %gl.key(), "cached state released the last reference");
            }
        }
        if new_state != inner.target {
            let cfg = self.config();
            inner.hold_time = inner.hold_time.saturating_sub(cfg.hold_time_decr).max(cfg.hold_time_min);
        }
        inner.state = new_state;
        inner.tchange = Instant::now();
    }

    /// Record a demote request. A non-zero `delay` only marks it pending so
    /// recent holders keep the lock for a while.
    pub(crate) fn handle_callback(&self, gl: &Glock, inner: &mut GlockInner, state: LockState, delay: Duration, remote: bool) {
        if delay.is_zero() {
            self.set_demote(gl);
        } else {
            gl.flags.set(GlockFlags::PENDING_DEMOTE);
        }
        if inner.demote_state == LockState::Exclusive {
            inner.demote_state = state;
            inner.demote_time = Some(Instant::now());
        } else if inner.demote_state != LockState::Unlocked && inner.demote_state != state {
            inner.demote_state = LockState::Unlocked;
        }
        let view = gl.view(inner);
        gl.ops().on_remote_callback(&view, state, remote);
        inner.stats.dcount += 1;
        self.metrics().record_demote_request();
        trace!(glock = %gl.key(), requested = %state, ?delay, remote, "demote request");
    }

    fn set_demote(&self, gl: &Glock) {
        gl.flags.set(GlockFlags::DEMOTE);
        self.async_wait.notify_waiters();
    }

    fn demote_wake(&self, gl: &Glock, inner: &mut GlockInner) {
        inner.demote_state = LockState::Exclusive;
        gl.flags.clear(GlockFlags::DEMOTE);
        gl.demote_notify.notify_waiters();
    }

    /// Whether an idle glock may be dropped from the cache.
    pub(crate) fn demote_ok(&self, gl: &Glock, inner: &GlockInner) -> bool {
        if inner.state == LockState::Unlocked || !inner.holders.is_empty() {
            return false;
        }
        gl.ops().demote_ok(&gl.view(inner))
    }

    /// Put an idle cached glock back on the LRU after its queue emptied
    /// without a release, e.g. when every waiter failed. Glocks in
    /// transition are picked up once the transition settles.
    pub(crate) fn lru_add_if_idle(&self, gl: &Arc<Glock>, inner: &GlockInner) {
        let flags = gl.flags();
        if flags.intersects(GlockFlags::LRU | GlockFlags::LFLUSH | GlockFlags::FREEING | GlockFlags::LOCKED) {
            return;
        }
        if self.demote_ok(gl, inner) {
            self.lru_add(gl);
        }
    }

    /// Deliver a reply from the lock service. The request's reference is
    /// passed on to the work unit, or kept by the glock while frozen.
    pub(crate) fn complete(&self, gl: &Arc<Glock>, reply: ReplyCode) {
        let mut inner = gl.inner.lock();
        inner.reply = reply;
        inner.stats.reply_received(Instant::now(), gl.flags.test(GlockFlags::BLOCKING));
        gl.flags.clear(GlockFlags::INITIAL);

        if self.block_locks() && self.should_freeze(gl, &inner, reply) {
            debug!(glock = %gl.key(), %reply, "reply frozen");
            gl.flags.set(GlockFlags::FROZEN);
            return;
        }
        gl.lockref.get();
        gl.flags.set(GlockFlags::REPLY_PENDING);
        self.queue_work(gl, &mut inner, Duration::ZERO);
    }

    fn should_freeze(&self, _gl: &Glock, inner: &GlockInner, reply: ReplyCode) -> bool {
        if reply.is_error() || reply.is_canceled() {
            return false;
        }
        if inner.target == LockState::Unlocked {
            return false;
        }
        !inner
            .holders
            .iter()
            .any(|gh| !gh.is_holder() && gh.flags.contains(HolderFlags::NOEXP))
    }

    /// One pass of deferred work for a glock. Each queued unit carries one
    /// reference; a pending reply carries the request's.
    pub(crate) fn glock_work(&self, gl: &Arc<Glock>) {
        let mut inner = gl.inner.lock();
        inner.work.queued = false;
        let mut drop_refs: i64 = 1;

        if gl.flags.test_and_clear(GlockFlags::REPLY_PENDING) {
            let reply = inner.reply;
            self.finish_xmote(gl, &mut inner, reply);
            drop_refs += 1;
        }

        if let Some(deferred) = inner.deferred
            && !self.withdraw_state_in_recovery()
        {
            self.retry_deferred(gl, &mut inner, deferred);
        }

        let mut delay = Duration::ZERO;
        if gl.flags.test(GlockFlags::PENDING_DEMOTE)
            && inner.state != LockState::Unlocked
            && inner.demote_state != LockState::Exclusive
        {
            let hold_until = inner.tchange + inner.hold_time;
            delay = hold_until.saturating_duration_since(Instant::now());
            if delay.is_zero() {
                gl.flags.clear(GlockFlags::PENDING_DEMOTE);
                self.set_demote(gl);
            }
        }

        self.run_queue(gl, &mut inner, false);

        if !delay.is_zero() {
            drop_refs -= 1;
            if !gl.kind().honors_hold_time() {
                delay = Duration::ZERO;
            }
            self.queue_work(gl, &mut inner, delay);
        }

        self.lru_add_if_idle(gl, &inner);
        if drop_refs > 0 && gl.lockref.sub_locked(drop_refs) {
            self.glock_put_final(gl, inner);
        }
    }

    /// Poison the glock after a broken invariant and start withdrawal.
    pub(crate) fn glock_bug(&self, gl: &Glock, inner: &mut GlockInner, message: impl Into<String>) -> GlockError {
        let err = GlockError::invariant(gl.key(), message);
        error!(
            glock = %gl.key(),
            state = %inner.state,
            target = %inner.target,
            demote_state = %inner.demote_state,
            flags = ?gl.flags().names(),
            holders = inner.holders.len(),
            "{}",
            err
        );
        gl.flags.set(GlockFlags::FATAL);
        let failed = err.clone();
        self.fail_waiters(inner, |_| Some(failed.clone()));
        self.withdraw_now(err.clone());
        err
    }

    /// Whether remote requests for `gl` must wait out a withdrawal.
    pub(crate) fn blocked_by_withdraw(&self, gl: &Glock) -> bool {
        if !self.withdraw_coordinator().is_withdrawn() {
            return false;
        }
        if gl.ops_flags().contains(OpsFlags::NONDISK) || gl.flags.test(GlockFlags::ALLOW_WITHDRAW) {
            return false;
        }
        self.config().journal_id != Some(gl.key().number)
    }

    fn withdraw_state_in_recovery(&self) -> bool {
        self.withdraw_coordinator().in_recovery()
    }
}

fn flush_error(gl: &Glock, err: GlockError) -> GlockError {
    match err {
        GlockError::Flush { .. } => err,
        other => GlockError::flush(gl.key(), other.to_string()),
    }
}

fn invalidate_error(gl: &Glock, err: GlockError) -> GlockError {
    match err {
        GlockError::Invalidate { .. } => err,
        other => GlockError::invalidate(gl.key(), other.to_string()),
    }
}
