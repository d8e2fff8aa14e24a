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

//! Idle glock cache and the memory-pressure shrinker.
//!
//! Entries are added and removed with the glock lock held, so under that
//! lock the `LRU` flag is authoritative. The shrinker takes the LRU lock
//! first and only ever try-locks glocks.

use crate::glock::{Glock, GlockFlags};
use crate::manager::GlockManager;
use crate::types::{GlockKey, LockState, OpsFlags};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::debug;

const SEQ_ORIGIN: u64 = 1 << 62;

#[derive(Debug)]
struct LruInner {
    list: BTreeMap<u64, Arc<Glock>>,
    head: u64,
    tail: u64,
}

impl LruInner {
    fn push_back(&mut self, gl: Arc<Glock>) {
        self.tail += 1;
        gl.lru_seq.store(self.tail, Ordering::Release);
        self.list.insert(self.tail, gl);
    }

    fn push_front(&mut self, gl: Arc<Glock>) {
        self.head -= 1;
        gl.lru_seq.store(self.head, Ordering::Release);
        self.list.insert(self.head, gl);
    }

    fn unlink(&mut self, gl: &Glock) -> bool {
        let seq = gl.lru_seq.swap(0, Ordering::AcqRel);
        seq != 0 && self.list.remove(&seq).is_some()
    }
}

#[derive(Debug)]
pub(crate) struct GlockLru {
    inner: Mutex<LruInner>,
}

impl GlockLru {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(LruInner {
                list: BTreeMap::new(),
                head: SEQ_ORIGIN,
                tail: SEQ_ORIGIN,
            }),
        }
    }

    /// Move to the most-recently-used end. Glock lock held.
    pub(crate) fn add(&self, gl: &Arc<Glock>) -> usize {
        if !gl.ops_flags().contains(OpsFlags::LRU) {
            return self.len();
        }
        let mut inner = self.inner.lock();
        inner.unlink(gl);
        inner.push_back(gl.clone());
        gl.flags.set(GlockFlags::LRU);
        inner.list.len()
    }

    /// Glock lock held.
    pub(crate) fn remove(&self, gl: &Glock) -> usize {
        let mut inner = self.inner.lock();
        if inner.unlink(gl) {
            gl.flags.clear(GlockFlags::LRU);
        }
        inner.list.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub(crate) fn keys(&self) -> Vec<GlockKey> {
        self.inner.lock().list.values().map(|gl| gl.key()).collect()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<Glock>> {
        self.inner.lock().list.values().cloned().collect()
    }

    /// Take up to `nr` entries from the cold end and demote them. Entries in
    /// transition or with a contended lock go back to the cold end.
    pub(crate) fn scan(&self, mgr: &GlockManager, nr: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut dispose = Vec::new();
        let mut skipped = Vec::new();

        while dispose.len() + skipped.len() < nr {
            let Some((_, gl)) = inner.list.pop_first() else {
                break;
            };
            gl.lru_seq.store(0, Ordering::Release);
            if gl.flags.test(GlockFlags::LOCKED) {
                skipped.push(gl);
            } else {
                dispose.push(gl);
            }
        }
        for gl in skipped.into_iter().rev() {
            inner.push_front(gl);
        }

        dispose.sort_by_key(|gl| gl.key());
        let mut freed = 0;
        for gl in dispose {
            let Some(mut guard) = gl.inner.try_lock() else {
                inner.push_front(gl.clone());
                continue;
            };
            if gl.flags.test_and_set(GlockFlags::LOCKED) {
                drop(guard);
                inner.push_front(gl);
                continue;
            }
            gl.flags.clear(GlockFlags::LRU);
            if !gl.lockref.get_not_dead() {
                gl.flags.clear(GlockFlags::LOCKED);
                continue;
            }
            if mgr.demote_ok(&gl, &guard) {
                mgr.handle_callback(&gl, &mut guard, LockState::Unlocked, Duration::ZERO, false);
            }
            gl.flags.clear(GlockFlags::LOCKED);
            mgr.queue_work(&gl, &mut guard, Duration::ZERO);
            freed += 1;
        }

        debug!(requested = nr, freed, remaining = inner.list.len(), "glock lru scan");
        freed
    }
}
