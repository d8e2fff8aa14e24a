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

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-manager counters, mirrored into the `metrics` facade.
#[derive(Debug, Default)]
pub struct GlockMetrics {
    created: AtomicU64,
    freed: AtomicU64,
    remote_requests: AtomicU64,
    remote_replies: AtomicU64,
    remote_errors: AtomicU64,
    cancels: AtomicU64,
    demote_requests: AtomicU64,
    try_failures: AtomicU64,
    lru_disposed: AtomicU64,
    withdraw_deferred: AtomicU64,
    stale_batches: AtomicU64,
}

/// Point-in-time copy of [`GlockMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub freed: u64,
    pub remote_requests: u64,
    pub remote_replies: u64,
    pub remote_errors: u64,
    pub cancels: u64,
    pub demote_requests: u64,
    pub try_failures: u64,
    pub lru_disposed: u64,
    pub withdraw_deferred: u64,
    pub stale_batches: u64,
}

impl GlockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.created.total").increment(1);
    }

    pub(crate) fn record_freed(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.freed.total").increment(1);
    }

    pub(crate) fn record_remote_request(&self) {
        self.remote_requests.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.remote.requests.total").increment(1);
    }

    pub(crate) fn record_remote_reply(&self, error: bool) {
        self.remote_replies.fetch_add(1, Ordering::Relaxed);
        if error {
            self.remote_errors.fetch_add(1, Ordering::Relaxed);
            counter!("rustfs.glock.remote.errors.total").increment(1);
        }
    }

    pub(crate) fn record_cancel(&self) {
        self.cancels.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_demote_request(&self) {
        self.demote_requests.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.demote.requests.total").increment(1);
    }

    pub(crate) fn record_try_failure(&self) {
        self.try_failures.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.try.failures.total").increment(1);
    }

    pub(crate) fn record_lru_disposed(&self, count: usize) {
        self.lru_disposed.fetch_add(count as u64, Ordering::Relaxed);
        counter!("rustfs.glock.lru.disposed.total").increment(count as u64);
    }

    pub(crate) fn record_lru_size(&self, size: usize) {
        gauge!("rustfs.glock.lru.size").set(size as f64);
    }

    pub(crate) fn record_withdraw_deferred(&self) {
        self.withdraw_deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale_batch(&self) {
        self.stale_batches.fetch_add(1, Ordering::Relaxed);
        counter!("rustfs.glock.batch.stale.total").increment(1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            remote_requests: self.remote_requests.load(Ordering::Relaxed),
            remote_replies: self.remote_replies.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            cancels: self.cancels.load(Ordering::Relaxed),
            demote_requests: self.demote_requests.load(Ordering::Relaxed),
            try_failures: self.try_failures.load(Ordering::Relaxed),
            lru_disposed: self.lru_disposed.load(Ordering::Relaxed),
            withdraw_deferred: self.withdraw_deferred.load(Ordering::Relaxed),
            stale_batches: self.stale_batches.load(Ordering::Relaxed),
        }
    }
}
