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

//! The cached lock object for one cluster resource.

use crate::error::{GlockError, Result};
use crate::holder::HolderShared;
use crate::info::{GlockInfo, GlockTiming, HolderInfo};
use crate::ops::{GlockOperations, GlockView};
use crate::types::{GlockKey, LVB_SIZE, LmFlags, LockState, OpsFlags, ReplyCode, ResourceType};
use bitflags::bitflags;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

bitflags! {
    /// Glock state bits. Stored atomically so the LRU and lookup paths can
    /// test them without the glock lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GlockFlags: u32 {
        /// A state transition owns the glock.
        const LOCKED = 1 << 0;
        const DEMOTE = 1 << 1;
        const PENDING_DEMOTE = 1 << 2;
        const DEMOTE_IN_PROGRESS = 1 << 3;
        const DIRTY = 1 << 4;
        /// Needs a log flush before it may be released.
        const LFLUSH = 1 << 5;
        const INVALIDATE_IN_PROGRESS = 1 << 6;
        const REPLY_PENDING = 1 << 7;
        /// No reply has been received from the lock service yet.
        const INITIAL = 1 << 8;
        const FROZEN = 1 << 9;
        const LRU = 1 << 10;
        const BLOCKING = 1 << 11;
        const PENDING_DELETE = 1 << 12;
        const FREEING = 1 << 13;
        /// Bookkeeping went inconsistent; no further transitions.
        const FATAL = 1 << 14;
        /// Remote requests keep flowing while the filesystem is withdrawn.
        const ALLOW_WITHDRAW = 1 << 15;
    }
}

const FLAG_NAMES: &[(GlockFlags, &str)] = &[
    (GlockFlags::LOCKED, "locked"),
    (GlockFlags::DEMOTE, "demote"),
    (GlockFlags::PENDING_DEMOTE, "pending_demote"),
    (GlockFlags::DEMOTE_IN_PROGRESS, "demote_in_progress"),
    (GlockFlags::DIRTY, "dirty"),
    (GlockFlags::LFLUSH, "lflush"),
    (GlockFlags::INVALIDATE_IN_PROGRESS, "invalidate_in_progress"),
    (GlockFlags::REPLY_PENDING, "reply_pending"),
    (GlockFlags::INITIAL, "initial"),
    (GlockFlags::FROZEN, "frozen"),
    (GlockFlags::LRU, "lru"),
    (GlockFlags::BLOCKING, "blocking"),
    (GlockFlags::PENDING_DELETE, "pending_delete"),
    (GlockFlags::FREEING, "freeing"),
    (GlockFlags::FATAL, "fatal"),
    (GlockFlags::ALLOW_WITHDRAW, "allow_withdraw"),
];

impl GlockFlags {
    pub fn names(self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct AtomicGlockFlags(AtomicU32);

impl AtomicGlockFlags {
    fn new(flags: GlockFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    pub(crate) fn load(&self) -> GlockFlags {
        GlockFlags::from_bits_truncate(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn test(&self, flag: GlockFlags) -> bool {
        self.load().contains(flag)
    }

    pub(crate) fn set(&self, flag: GlockFlags) {
        self.0.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, flag: GlockFlags) {
        self.0.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Returns whether the flag was already set.
    pub(crate) fn test_and_set(&self, flag: GlockFlags) -> bool {
        self.0.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Returns whether the flag was set before clearing.
    pub(crate) fn test_and_clear(&self, flag: GlockFlags) -> bool {
        self.0.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }
}

const LOCKREF_DEAD: i64 = -128;

/// Reference count with a dead marker. Once dead, lookups can no longer
/// take references and the glock is on its way out of the table.
#[derive(Debug)]
pub(crate) struct Lockref {
    count: AtomicI64,
}

impl Lockref {
    fn new() -> Self {
        Self { count: AtomicI64::new(1) }
    }

    /// Caller already owns a reference.
    pub(crate) fn get(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "lockref get on dead or unreferenced glock");
    }

    pub(crate) fn get_not_dead(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return false;
            }
            match self
                .count
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference unless it is the last one.
    pub(crate) fn put_fast(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 1 {
                return false;
            }
            match self
                .count
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop `n` references with the glock lock held. Returns true when the
    /// count reached zero, in which case the lockref is now dead.
    pub(crate) fn sub_locked(&self, n: i64) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current < n {
                debug_assert!(false, "lockref underflow: {current} - {n}");
                return false;
            }
            let next = if current == n { LOCKREF_DEAD } else { current - n };
            match self
                .count
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return current == n,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire).max(0)
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.count.load(Ordering::Acquire) < 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct DeferredXmote {
    pub(crate) target: LockState,
    pub(crate) flags: LmFlags,
}

#[derive(Debug, Default)]
pub(crate) struct WorkState {
    pub(crate) queued: bool,
    pub(crate) running: bool,
    pub(crate) delay: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GlockStats {
    /// Holders queued.
    pub(crate) qcount: u64,
    /// Demote requests recorded.
    pub(crate) dcount: u64,
    pub(crate) timing: GlockTiming,
    last_request: Option<Instant>,
}

impl GlockStats {
    pub(crate) fn request_sent(&mut self, now: Instant) {
        if let Some(last) = self.last_request {
            self.timing.record_interval(now.saturating_duration_since(last));
        }
        self.last_request = Some(now);
    }

    pub(crate) fn reply_received(&mut self, now: Instant, blocking: bool) {
        if let Some(sent) = self.last_request {
            self.timing.record_reply(now.saturating_duration_since(sent), blocking);
        }
    }
}

/// Mutable glock state; only touched with the glock lock held.
#[derive(Debug)]
pub(crate) struct GlockInner {
    pub(crate) state: LockState,
    pub(crate) target: LockState,
    pub(crate) demote_state: LockState,
    pub(crate) req: LockState,
    pub(crate) reply: ReplyCode,
    pub(crate) holders: Vec<Arc<HolderShared>>,
    pub(crate) hold_time: Duration,
    pub(crate) tchange: Instant,
    pub(crate) demote_time: Option<Instant>,
    pub(crate) deferred: Option<DeferredXmote>,
    pub(crate) work: WorkState,
    pub(crate) stats: GlockStats,
    pub(crate) lvb: Option<[u8; LVB_SIZE]>,
}

impl GlockInner {
    pub(crate) fn first_waiter(&self) -> Option<&Arc<HolderShared>> {
        self.holders.iter().find(|gh| !gh.is_holder())
    }

    pub(crate) fn has_granted(&self) -> bool {
        self.holders.first().is_some_and(|gh| gh.is_holder())
    }

    pub(crate) fn position(&self, gh: &Arc<HolderShared>) -> Option<usize> {
        self.holders.iter().position(|queued| Arc::ptr_eq(queued, gh))
    }
}

/// Local cache entry for one cluster-wide resource lock.
#[derive(Debug)]
pub struct Glock {
    key: GlockKey,
    ops: Arc<dyn GlockOperations>,
    ops_flags: OpsFlags,
    pub(crate) flags: AtomicGlockFlags,
    pub(crate) lockref: Lockref,
    pub(crate) lru_seq: AtomicU64,
    pub(crate) inner: Mutex<GlockInner>,
    pub(crate) demote_notify: Notify,
}

impl Glock {
    pub(crate) fn new(key: GlockKey, ops: Arc<dyn GlockOperations>, hold_time: Duration) -> Self {
        let ops_flags = ops.flags();
        Self {
            key,
            ops,
            ops_flags,
            flags: AtomicGlockFlags::new(GlockFlags::INITIAL),
            lockref: Lockref::new(),
            lru_seq: AtomicU64::new(0),
            inner: Mutex::new(GlockInner {
                state: LockState::Unlocked,
                target: LockState::Unlocked,
                // Exclusive means no demote has been requested.
                demote_state: LockState::Exclusive,
                req: LockState::Unlocked,
                reply: ReplyCode::default(),
                holders: Vec::new(),
                hold_time,
                tchange: Instant::now(),
                demote_time: None,
                deferred: None,
                work: WorkState::default(),
                stats: GlockStats::default(),
                lvb: ops_flags.contains(OpsFlags::LVB).then_some([0; LVB_SIZE]),
            }),
            demote_notify: Notify::new(),
        }
    }

    pub fn key(&self) -> GlockKey {
        self.key
    }

    pub fn kind(&self) -> ResourceType {
        self.key.kind
    }

    pub fn ops(&self) -> &Arc<dyn GlockOperations> {
        &self.ops
    }

    pub fn ops_flags(&self) -> OpsFlags {
        self.ops_flags
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    pub fn target(&self) -> LockState {
        self.inner.lock().target
    }

    pub fn demote_state(&self) -> LockState {
        self.inner.lock().demote_state
    }

    pub fn hold_time(&self) -> Duration {
        self.inner.lock().hold_time
    }

    pub fn holder_count(&self) -> usize {
        self.inner.lock().holders.len()
    }

    pub fn flags(&self) -> GlockFlags {
        self.flags.load()
    }

    pub fn ref_count(&self) -> i64 {
        self.lockref.count()
    }

    pub fn is_fatal(&self) -> bool {
        self.flags.test(GlockFlags::FATAL)
    }

    /// Cached data was modified and must be synced before a downgrade.
    pub fn mark_dirty(&self) {
        self.flags.set(GlockFlags::DIRTY);
    }

    /// Keep the glock off the LRU until the log has been flushed.
    pub fn set_needs_flush(&self, needs_flush: bool) {
        if needs_flush {
            self.flags.set(GlockFlags::LFLUSH);
        } else {
            self.flags.clear(GlockFlags::LFLUSH);
        }
    }

    pub fn set_pending_delete(&self, pending: bool) {
        if pending {
            self.flags.set(GlockFlags::PENDING_DELETE);
        } else {
            self.flags.clear(GlockFlags::PENDING_DELETE);
        }
    }

    /// Copy of the lock value block, if this kind of glock carries one.
    pub fn lvb(&self) -> Option<[u8; LVB_SIZE]> {
        self.inner.lock().lvb
    }

    /// Replace the start of the lock value block with `data`. Needs the lock
    /// held exclusively; the value reaches the lock service when the glock
    /// next gives up exclusive access.
    pub fn set_lvb(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.state;
        let Some(lvb) = inner.lvb.as_mut() else {
            return Err(GlockError::configuration(format!("glock {} has no lock value block", self.key)));
        };
        if data.len() > LVB_SIZE {
            return Err(GlockError::configuration(format!(
                "lock value block holds {LVB_SIZE} bytes, got {}",
                data.len()
            )));
        }
        if state != LockState::Exclusive {
            return Err(GlockError::invariant(self.key, format!("lock value block written in state {state}")));
        }
        lvb[..data.len()].copy_from_slice(data);
        lvb[data.len()..].fill(0);
        Ok(())
    }

    /// Let remote requests for this glock through while withdrawn.
    pub fn allow_during_withdraw(&self) {
        self.flags.set(GlockFlags::ALLOW_WITHDRAW);
    }

    pub(crate) fn view(&self, inner: &GlockInner) -> GlockView {
        GlockView {
            key: self.key,
            state: inner.state,
            target: inner.target,
            dirty: self.flags.test(GlockFlags::DIRTY),
        }
    }

    pub fn info(&self) -> GlockInfo {
        let inner = self.inner.lock();
        GlockInfo {
            key: self.key,
            state: inner.state,
            target: inner.target,
            demote_state: inner.demote_state,
            flags: self.flags().names(),
            ref_count: self.lockref.count(),
            hold_time_ms: inner.hold_time.as_millis() as u64,
            last_reply: inner.reply,
            queued: inner.stats.qcount,
            demotes: inner.stats.dcount,
            timing: inner.stats.timing,
            holders: inner.holders.iter().map(|gh| HolderInfo::from_shared(gh)).collect(),
        }
    }
}
