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

//! Per-filesystem glock manager.

use crate::client::LockClient;
use crate::client::local::LocalClient;
use crate::config::GlockConfig;
use crate::error::{GlockError, Result};
use crate::glock::{Glock, GlockFlags};
use crate::holder::{Holder, HolderShared};
use crate::info::GlockInfo;
use crate::lru::GlockLru;
use crate::metrics::GlockMetrics;
use crate::ops::GlockOperations;
use crate::scheduler::Scheduler;
use crate::table::LockTable;
use crate::types::{FsId, GlockKey, HolderFlags, LockState, ResourceType};
use crate::withdraw::{WithdrawCoordinator, WithdrawState};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A counted reference to a cached glock. Cloning takes another reference;
/// dropping the last one lets the glock be torn down.
pub struct GlockRef {
    mgr: Arc<GlockManager>,
    gl: Arc<Glock>,
}

impl GlockRef {
    /// Wrap a glock whose reference has already been taken.
    pub(crate) fn from_counted(mgr: Arc<GlockManager>, gl: Arc<Glock>) -> Self {
        Self { mgr, gl }
    }

    pub fn manager(&self) -> &Arc<GlockManager> {
        &self.mgr
    }

    pub fn glock(&self) -> &Arc<Glock> {
        &self.gl
    }

    /// Create an unqueued holder for this glock.
    pub fn holder(&self, state: LockState, flags: HolderFlags) -> Holder {
        Holder::new(self, state, flags)
    }
}

impl Deref for GlockRef {
    type Target = Glock;

    fn deref(&self) -> &Glock {
        &self.gl
    }
}

impl Clone for GlockRef {
    fn clone(&self) -> Self {
        self.gl.lockref.get();
        Self {
            mgr: self.mgr.clone(),
            gl: self.gl.clone(),
        }
    }
}

impl Drop for GlockRef {
    fn drop(&mut self) {
        self.mgr.glock_put(&self.gl);
    }
}

impl fmt::Debug for GlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlockRef")
            .field("key", &self.gl.key())
            .field("state", &self.gl.state())
            .finish()
    }
}

/// Owns the lock table, the idle cache and the work scheduler for one
/// filesystem, and is the entry point for every lock operation.
#[derive(Debug)]
pub struct GlockManager {
    config: GlockConfig,
    client: Arc<dyn LockClient>,
    table: LockTable,
    lru: GlockLru,
    scheduler: Scheduler,
    withdraw: WithdrawCoordinator,
    metrics: GlockMetrics,
    /// Woken when an async holder completes or a demote is requested.
    pub(crate) async_wait: Notify,
    block_locks: AtomicBool,
    skip_unlock: AtomicBool,
    /// Glocks allocated and not yet freed.
    live: AtomicUsize,
    live_notify: Notify,
    shrinker: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<GlockManager>,
}

impl GlockManager {
    /// Create a manager on the current tokio runtime.
    pub fn new(config: GlockConfig, client: Arc<dyn LockClient>) -> Result<Arc<Self>> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| GlockError::configuration("glock manager needs a tokio runtime"))?;

        let manager = Arc::new_cyclic(|self_ref| Self {
            table: LockTable::new(config.shard_count, config.wait_table_bits),
            lru: GlockLru::new(),
            scheduler: Scheduler::new(handle),
            withdraw: WithdrawCoordinator::new(),
            metrics: GlockMetrics::new(),
            async_wait: Notify::new(),
            block_locks: AtomicBool::new(false),
            skip_unlock: AtomicBool::new(false),
            live: AtomicUsize::new(0),
            live_notify: Notify::new(),
            shrinker: Mutex::new(None),
            self_ref: self_ref.clone(),
            client,
            config,
        });
        manager.start_shrinker();
        info!(
            fs = %manager.config.fs_id,
            shards = manager.config.shard_count,
            local = manager.client.is_local(),
            "glock manager started"
        );
        Ok(manager)
    }

    /// Manager backed by an in-process lock service.
    pub fn with_local_client(config: GlockConfig) -> Result<Arc<Self>> {
        Self::new(config, Arc::new(LocalClient::new()))
    }

    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn config(&self) -> &GlockConfig {
        &self.config
    }

    pub fn fs_id(&self) -> FsId {
        self.config.fs_id
    }

    pub fn client(&self) -> &Arc<dyn LockClient> {
        &self.client
    }

    pub fn metrics(&self) -> &GlockMetrics {
        &self.metrics
    }

    pub fn withdraw_coordinator(&self) -> &WithdrawCoordinator {
        &self.withdraw
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn skip_unlock(&self) -> bool {
        self.skip_unlock.load(Ordering::Acquire)
    }

    /// Glocks currently in the lock table.
    pub fn glock_count(&self) -> usize {
        self.table.len()
    }

    // ---------------------------------------------------------------------
    // Lookup
    // ---------------------------------------------------------------------

    /// Find or create the glock for `number` with the resource type of `ops`.
    pub async fn get(&self, number: u64, ops: Arc<dyn GlockOperations>, create: bool) -> Result<GlockRef> {
        let mgr = self.arc().ok_or_else(|| GlockError::configuration("glock manager is shutting down"))?;
        let key = GlockKey::new(number, ops.resource_type(), self.config.fs_id);

        if let Some(gl) = self.table.find_insert(&key, None).await? {
            return Ok(GlockRef::from_counted(mgr, gl));
        }
        if !create {
            return Err(GlockError::NotFound { key });
        }

        let gl = Arc::new(Glock::new(key, ops, self.config.hold_time));
        self.live.fetch_add(1, Ordering::AcqRel);
        match self.table.find_insert(&key, Some(&gl)).await {
            Ok(None) => {
                self.metrics.record_created();
                debug!(glock = %key, "glock created");
                Ok(GlockRef::from_counted(mgr, gl))
            }
            Ok(Some(existing)) => {
                self.forget_allocation();
                Ok(GlockRef::from_counted(mgr, existing))
            }
            Err(err) => {
                self.forget_allocation();
                Err(err)
            }
        }
    }

    /// Find an existing glock.
    pub async fn find(&self, number: u64, kind: ResourceType) -> Result<GlockRef> {
        let mgr = self.arc().ok_or_else(|| GlockError::configuration("glock manager is shutting down"))?;
        let key = GlockKey::new(number, kind, self.config.fs_id);
        match self.table.find_insert(&key, None).await? {
            Some(gl) => Ok(GlockRef::from_counted(mgr, gl)),
            None => Err(GlockError::NotFound { key }),
        }
    }

    fn forget_allocation(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.live_notify.notify_waiters();
        }
    }

    pub(crate) fn free_glock(&self, gl: &Arc<Glock>) {
        match self.table.remove(gl) {
            Ok(removed) => drop(removed),
            Err(err) => error!(glock = %gl.key(), "{}", err),
        }
        self.metrics.record_freed();
        self.forget_allocation();
    }

    pub(crate) fn lru_add(&self, gl: &Arc<Glock>) {
        let len = self.lru.add(gl);
        self.metrics.record_lru_size(len);
    }

    pub(crate) fn lru_remove(&self, gl: &Glock) {
        if gl.flags.test(GlockFlags::LRU) {
            let len = self.lru.remove(gl);
            self.metrics.record_lru_size(len);
        }
    }

    // ---------------------------------------------------------------------
    // Holders
    // ---------------------------------------------------------------------

    pub(crate) async fn nq(&self, holder: &mut Holder) -> Result<()> {
        let gl = holder.glock().glock().clone();
        let key = gl.key();
        if holder.is_queued() {
            return Err(GlockError::invariant(key, "holder queued twice"));
        }
        if gl.is_fatal() {
            return Err(GlockError::invariant(key, "glock is poisoned"));
        }
        if !holder.flags().contains(HolderFlags::NOEXP) && self.blocked_by_withdraw(&gl) {
            return Err(GlockError::Withdrawn { key });
        }

        let gh = HolderShared::new(holder.state(), holder.flags(), holder.owner());
        {
            let mut inner = gl.inner.lock();
            self.lru_remove(&gl);
            if let Err(err) = self.add_to_queue(&gl, &mut inner, &gh) {
                self.lru_add_if_idle(&gl, &inner);
                return Err(err);
            }
            if gh.flags.contains(HolderFlags::NOEXP) && gl.flags.test_and_clear(GlockFlags::FROZEN) {
                gl.flags.set(GlockFlags::REPLY_PENDING);
                gl.lockref.get();
                self.queue_work(&gl, &mut inner, Duration::ZERO);
            }
            self.run_queue(&gl, &mut inner, true);
            self.lru_add_if_idle(&gl, &inner);
        }
        holder.shared = Some(gh);

        if holder.flags().contains(HolderFlags::ASYNC) {
            return Ok(());
        }
        holder.wait().await
    }

    fn must_wait_recovery(&self, gl: &Glock) -> bool {
        self.withdraw.in_recovery() && self.blocked_by_withdraw(gl)
    }

    pub(crate) async fn dq(&self, gl: &Arc<Glock>, gh: &Arc<HolderShared>) {
        if self.must_wait_recovery(gl) {
            debug!(glock = %gl.key(), "release waiting for journal recovery");
            self.withdraw.wait_recovery().await;
        }
        self.dq_now(gl, gh);
    }

    /// Release from a context that cannot wait, such as a holder's drop.
    pub(crate) fn dq_detached(&self, glref: &GlockRef, gh: Arc<HolderShared>) {
        if self.must_wait_recovery(glref.glock())
            && let Some(mgr) = self.arc()
        {
            let glref = glref.clone();
            self.spawn_unit(async move {
                mgr.dq(glref.glock(), &gh).await;
                drop(glref);
            });
            return;
        }
        self.dq_now(glref.glock(), &gh);
    }

    fn dq_now(&self, gl: &Arc<Glock>, gh: &Arc<HolderShared>) {
        let mut inner = gl.inner.lock();
        if gh.flags.contains(HolderFlags::NOCACHE) {
            self.handle_callback(gl, &mut inner, LockState::Unlocked, Duration::ZERO, false);
        }
        let Some(pos) = inner.position(gh) else {
            return;
        };
        inner.holders.remove(pos);
        if gh.is_waiting() {
            self.wake_holder(gh, Some(GlockError::Dequeued { key: gl.key() }));
        }
        gh.clear_holder();

        let flags = gl.flags();
        let fast_path =
            inner.holders.is_empty() && !flags.intersects(GlockFlags::PENDING_DEMOTE | GlockFlags::DEMOTE);
        if !flags.contains(GlockFlags::LFLUSH) && self.demote_ok(gl, &inner) {
            self.lru_add(gl);
        }
        if !fast_path {
            let delay = if flags.contains(GlockFlags::PENDING_DEMOTE)
                && !flags.contains(GlockFlags::DEMOTE)
                && gl.kind().honors_hold_time()
            {
                inner.hold_time
            } else {
                Duration::ZERO
            };
            gl.lockref.get();
            self.queue_work(gl, &mut inner, delay);
        }
    }

    /// Lengthen the hold time of a glock whose request had to wait longer
    /// than the contention threshold.
    pub(crate) fn update_hold_time(&self, gl: &Glock, start: Instant) {
        if start.elapsed() <= self.config.contention_threshold {
            return;
        }
        let mut inner = gl.inner.lock();
        inner.hold_time = (inner.hold_time + self.config.hold_time_incr).min(self.config.hold_time_max);
    }

    pub(crate) async fn wait_on_demote(&self, gl: &Glock) {
        loop {
            let notified = gl.demote_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !gl.flags.test(GlockFlags::DEMOTE) {
                return;
            }
            notified.await;
        }
    }

    /// Look up `number`, then queue and wait for one holder on it.
    pub async fn nq_num(
        &self,
        number: u64,
        ops: Arc<dyn GlockOperations>,
        state: LockState,
        flags: HolderFlags,
    ) -> Result<Holder> {
        let gl = self.get(number, ops, true).await?;
        let mut holder = Holder::new(&gl, state, flags);
        holder.nq().await?;
        Ok(holder)
    }

    /// Queue holders one at a time in key order. On failure the holders
    /// already granted are released.
    pub async fn nq_m(&self, holders: &mut [Holder]) -> Result<()> {
        let order = sorted_order(holders);
        for (pos, &i) in order.iter().enumerate() {
            let holder = &mut holders[i];
            holder.set_flags(holder.flags() - (HolderFlags::TRY | HolderFlags::TRY_1CB | HolderFlags::ASYNC));
            if let Err(err) = holder.nq().await {
                for &j in order[..pos].iter().rev() {
                    holders[j].dq().await;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub async fn dq_m(&self, holders: &mut [Holder]) {
        for holder in holders.iter_mut().rev() {
            holder.dq().await;
        }
    }

    /// Acquire all of `holders` or none. Requests are queued in key order
    /// without waiting, then waited for together. If they are not all
    /// answered within twice the summed hold time the batch is released and
    /// `Stale` returned; if any failed the rest are released and the first
    /// error returned.
    pub async fn acquire_many(&self, holders: &mut [Holder]) -> Result<()> {
        if holders.is_empty() {
            return Ok(());
        }
        let order = sorted_order(holders);
        let saved: SmallVec<[HolderFlags; 4]> = holders.iter().map(Holder::flags).collect();

        for (pos, &i) in order.iter().enumerate() {
            let holder = &mut holders[i];
            holder.set_flags(holder.flags() | HolderFlags::ASYNC);
            if let Err(err) = holder.nq().await {
                for &j in order[..pos].iter().rev() {
                    holders[j].dq().await;
                }
                restore_flags(holders, &saved);
                return Err(err);
            }
        }

        let timeout: Duration = holders.iter().map(|h| h.glock().hold_time() * 2).sum();
        let start = Instant::now();
        let answered = self.wait_answered(holders, start + timeout).await;
        restore_flags(holders, &saved);

        if !answered {
            for &i in order.iter().rev() {
                holders[i].dq().await;
            }
            self.metrics.record_stale_batch();
            warn!(holders = holders.len(), ?timeout, "batch acquire went stale");
            return Err(GlockError::Stale { timeout });
        }

        let mut first_err = None;
        for &i in order.iter() {
            let holder = &mut holders[i];
            self.update_hold_time(holder.glock(), start);
            if let Err(err) = holder.finish() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => {
                for &i in order.iter().rev() {
                    holders[i].dq().await;
                }
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn wait_answered(&self, holders: &[Holder], deadline: Instant) -> bool {
        loop {
            let notified = self.async_wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if holders.iter().all(Holder::poll) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return holders.iter().all(Holder::poll);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Lock service callbacks
    // ---------------------------------------------------------------------

    /// Another node wants `number` in `state`. Recently changed glocks that
    /// honor the hold time are demoted only once it has passed.
    pub async fn remote_callback(&self, number: u64, kind: ResourceType, state: LockState) -> Result<()> {
        let gl = self.find(number, kind).await?;
        self.glock_cb(gl.glock(), state);
        Ok(())
    }

    pub(crate) fn glock_cb(&self, gl: &Arc<Glock>, state: LockState) {
        let mut inner = gl.inner.lock();
        let mut delay = Duration::ZERO;
        if !inner.holders.is_empty() && gl.kind().honors_hold_time() {
            delay = (inner.tchange + inner.hold_time).saturating_duration_since(Instant::now());
            if gl.flags.test(GlockFlags::REPLY_PENDING) {
                delay = inner.hold_time;
            }
        }
        self.handle_callback(gl, &mut inner, state, delay, true);
        gl.lockref.get();
        self.queue_work(gl, &mut inner, delay);
    }

    /// Demote a cached glock to `target` on behalf of the local node.
    pub async fn force_demote(&self, number: u64, kind: ResourceType, target: LockState) -> Result<()> {
        let gl = self.find(number, kind).await?;
        if target == LockState::Exclusive {
            return Err(GlockError::configuration("cannot demote to exclusive"));
        }
        let mut inner = gl.inner.lock();
        self.handle_callback(gl.glock(), &mut inner, target, Duration::ZERO, false);
        gl.lockref.get();
        self.queue_work(gl.glock(), &mut inner, Duration::ZERO);
        Ok(())
    }

    /// Hold lock service replies instead of applying them.
    pub fn set_block_locks(&self, block: bool) {
        self.block_locks.store(block, Ordering::Release);
        if !block {
            self.thaw();
        }
    }

    pub fn block_locks(&self) -> bool {
        self.block_locks.load(Ordering::Acquire)
    }

    /// Apply every held reply.
    pub fn thaw(&self) {
        for gl in self.table.snapshot() {
            let mut inner = gl.inner.lock();
            if gl.flags.test_and_clear(GlockFlags::FROZEN) {
                gl.flags.set(GlockFlags::REPLY_PENDING);
                self.queue_work(&gl, &mut inner, Duration::ZERO);
            } else if gl.lockref.sub_locked(1) {
                self.glock_put_final(&gl, inner);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Withdrawal
    // ---------------------------------------------------------------------

    /// Stop trusting local state: in-flight state raises are refused and
    /// releases wait for journal recovery.
    pub fn withdraw(&self) {
        self.withdraw.request();
        if self.withdraw.begin() {
            error!(fs = %self.config.fs_id, "filesystem withdrawn");
            self.async_wait.notify_waiters();
        }
    }

    pub(crate) fn withdraw_now(&self, err: GlockError) {
        if err.triggers_withdraw() || err.is_fatal() {
            self.withdraw.record_error(err);
            self.withdraw();
        }
    }

    pub fn recovery_complete(&self) -> bool {
        let done = self.withdraw.recovery_complete();
        if done {
            info!(fs = %self.config.fs_id, "journal recovery complete");
        }
        done
    }

    pub fn reset_withdraw(&self) -> bool {
        self.withdraw.reset()
    }

    pub fn withdraw_state(&self) -> WithdrawState {
        self.withdraw.state()
    }

    // ---------------------------------------------------------------------
    // Cache management
    // ---------------------------------------------------------------------

    /// Demote up to `nr` idle glocks from the cold end of the cache.
    pub fn shrink(&self, nr: usize) -> usize {
        let freed = self.lru.scan(self, nr);
        self.metrics.record_lru_disposed(freed);
        self.metrics.record_lru_size(self.lru.len());
        freed
    }

    pub fn lru_count(&self) -> usize {
        self.lru.len()
    }

    /// Keys in the idle cache, coldest first.
    pub fn lru_keys(&self) -> Vec<GlockKey> {
        self.lru.keys()
    }

    /// Whether every cached entry is idle and flagged as cached.
    pub fn lru_consistent(&self) -> bool {
        self.lru.entries().iter().all(|gl| {
            let inner = gl.inner.lock();
            gl.flags.test(GlockFlags::LRU) && inner.holders.is_empty()
        })
    }

    fn start_shrinker(&self) {
        let limit = self.config.lru_max_entries;
        if limit == 0 {
            return;
        }
        let weak = self.self_ref.clone();
        let period = self.config.shrink_interval;
        let task = self.scheduler.handle().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(mgr) = weak.upgrade() else {
                    return;
                };
                let count = mgr.lru_count();
                if count > limit {
                    let freed = mgr.shrink(count - limit);
                    debug!(count, limit, freed, "periodic glock shrink");
                }
            }
        });
        *self.shrinker.lock() = Some(task);
    }

    /// Wait for queued work and in-flight requests to finish.
    pub async fn flush(&self) {
        self.scheduler.flush().await;
    }

    /// Release every glock and wait until all have been freed. Used at
    /// unmount; lock service unlocks are skipped from here on.
    pub async fn clear(&self) -> Result<()> {
        self.skip_unlock.store(true, Ordering::Release);
        for gl in self.table.snapshot() {
            let mut inner = gl.inner.lock();
            self.lru_remove(&gl);
            if inner.state != LockState::Unlocked {
                self.handle_callback(&gl, &mut inner, LockState::Unlocked, Duration::ZERO, false);
            }
            self.queue_work(&gl, &mut inner, Duration::ZERO);
        }

        let timeout = self.config.clear_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.live_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live.load(Ordering::Acquire) == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let remaining = self.live.load(Ordering::Acquire);
                if remaining == 0 {
                    break;
                }
                for info in self.dump() {
                    warn!(glock = %info.key, state = %info.state, holders = info.holders.len(), refs = info.ref_count, "glock still in use");
                }
                return Err(GlockError::timeout(format!("{remaining} glocks still in use"), timeout));
            }
        }
        info!(fs = %self.config.fs_id, "glock table cleared");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    /// Snapshot of every live glock, ordered by key.
    pub fn dump(&self) -> Vec<GlockInfo> {
        let mut infos = Vec::new();
        for gl in self.table.snapshot() {
            infos.push(gl.info());
            self.glock_put(&gl);
        }
        infos.sort_by_key(|info| info.key);
        infos
    }

    pub fn dump_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.dump())?)
    }
}

impl Drop for GlockManager {
    fn drop(&mut self) {
        if let Some(task) = self.shrinker.lock().take() {
            task.abort();
        }
    }
}

fn sorted_order(holders: &[Holder]) -> SmallVec<[usize; 4]> {
    let mut order: SmallVec<[usize; 4]> = (0..holders.len()).collect();
    order.sort_by_key(|&i| holders[i].glock().key());
    order
}

fn restore_flags(holders: &mut [Holder], saved: &[HolderFlags]) {
    for (holder, flags) in holders.iter_mut().zip(saved) {
        holder.set_flags(*flags);
    }
}
