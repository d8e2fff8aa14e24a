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

//! Sharded map from key to glock, plus hashed per-key wait queues used
//! while a dying glock is being unlinked.

use crate::error::{GlockError, Result};
use crate::glock::Glock;
use crate::types::GlockKey;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
struct WaitEntry {
    key: GlockKey,
    id: u64,
    notify: Arc<Notify>,
}

#[derive(Debug)]
pub(crate) struct WaitTicket {
    bucket: usize,
    id: u64,
    notify: Arc<Notify>,
}

/// Waiters hashed by key. A wake only reaches entries for that exact key.
#[derive(Debug)]
pub(crate) struct WaitTable {
    buckets: Vec<Mutex<Vec<WaitEntry>>>,
    mask: usize,
    next_id: AtomicU64,
}

impl WaitTable {
    pub(crate) fn new(bits: u32) -> Self {
        let size = 1usize << bits;
        Self {
            buckets: (0..size).map(|_| Mutex::new(Vec::new())).collect(),
            mask: size - 1,
            next_id: AtomicU64::new(1),
        }
    }

    fn bucket(&self, key: &GlockKey) -> usize {
        (key.hash_value() as usize) & self.mask
    }

    /// Register before checking the condition so a wake in between is not lost.
    pub(crate) fn prepare(&self, key: &GlockKey) -> WaitTicket {
        let bucket = self.bucket(key);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = Arc::new(Notify::new());
        self.buckets[bucket].lock().push(WaitEntry {
            key: *key,
            id,
            notify: notify.clone(),
        });
        WaitTicket { bucket, id, notify }
    }

    pub(crate) fn cancel(&self, ticket: &WaitTicket) {
        self.buckets[ticket.bucket].lock().retain(|entry| entry.id != ticket.id);
    }

    pub(crate) async fn wait(&self, ticket: WaitTicket) {
        ticket.notify.notified().await;
    }

    pub(crate) fn wake(&self, key: &GlockKey) -> usize {
        let mut woken = 0;
        self.buckets[self.bucket(key)].lock().retain(|entry| {
            if entry.key == *key {
                entry.notify.notify_one();
                woken += 1;
                false
            } else {
                true
            }
        });
        woken
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}

type Shard = RwLock<HashMap<GlockKey, Arc<Glock>>>;

#[derive(Debug)]
pub(crate) struct LockTable {
    shards: Vec<Shard>,
    shard_mask: usize,
    waits: WaitTable,
}

impl LockTable {
    pub(crate) fn new(shard_count: usize, wait_table_bits: u32) -> Self {
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            shard_mask: shard_count - 1,
            waits: WaitTable::new(wait_table_bits),
        }
    }

    fn shard(&self, key: &GlockKey) -> &Shard {
        &self.shards[key.shard_index(self.shard_mask)]
    }

    /// Find a live glock, inserting `new` when there is none. Returns the
    /// existing glock with a reference taken, or `None` when `new` went in
    /// (or nothing was found and `new` was not given). A dying entry is
    /// waited out and the lookup retried.
    pub(crate) async fn find_insert(&self, key: &GlockKey, new: Option<&Arc<Glock>>) -> Result<Option<Arc<Glock>>> {
        loop {
            let ticket = self.waits.prepare(key);
            let found = match new {
                Some(new) => {
                    let mut map = self.shard(key).write();
                    match map.get(key) {
                        Some(existing) => Ok(Some(existing.clone())),
                        None => match map.try_reserve(1) {
                            Ok(()) => {
                                map.insert(*key, new.clone());
                                Ok(None)
                            }
                            Err(_) => Err(GlockError::out_of_memory(format!("lock table insert for {key}"))),
                        },
                    }
                }
                None => Ok(self.shard(key).read().get(key).cloned()),
            };

            match found {
                Ok(Some(gl)) if !gl.lockref.get_not_dead() => {
                    self.waits.wait(ticket).await;
                }
                other => {
                    self.waits.cancel(&ticket);
                    return other;
                }
            }
        }
    }

    /// Unlink a dead glock and wake anyone waiting on its key. The caller
    /// drops the returned entry outside the shard lock.
    pub(crate) fn remove(&self, gl: &Arc<Glock>) -> Result<Option<Arc<Glock>>> {
        let key = gl.key();
        if !gl.lockref.is_dead() {
            return Err(GlockError::invariant(key, "unlink of a referenced glock"));
        }
        let removed = {
            let mut map = self.shard(&key).write();
            match map.get(&key) {
                Some(existing) if Arc::ptr_eq(existing, gl) => map.remove(&key),
                _ => None,
            }
        };
        self.waits.wake(&key);
        Ok(removed)
    }

    /// Live glocks, each with a reference taken.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Glock>> {
        let mut live = Vec::new();
        for shard in &self.shards {
            let map = shard.read();
            live.extend(map.values().filter(|gl| gl.lockref.get_not_dead()).cloned());
        }
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BasicOps;
    use crate::types::{FsId, ResourceType};
    use std::time::Duration;

    fn make(number: u64) -> Arc<Glock> {
        let key = GlockKey::new(number, ResourceType::Inode, FsId(0));
        Arc::new(Glock::new(key, Arc::new(BasicOps::new(ResourceType::Inode)), Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_insert_then_lookup() {
        let table = LockTable::new(4, 2);
        let gl = make(1);
        let key = gl.key();

        assert!(table.find_insert(&key, None).await.unwrap().is_none());
        assert!(table.find_insert(&key, Some(&gl)).await.unwrap().is_none());

        let found = table.find_insert(&key, None).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &gl));
        assert_eq!(gl.ref_count(), 2);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_second_insert_returns_existing() {
        let table = LockTable::new(4, 2);
        let first = make(9);
        let second = make(9);
        let key = first.key();

        assert!(table.find_insert(&key, Some(&first)).await.unwrap().is_none());
        let existing = table.find_insert(&key, Some(&second)).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_requires_dead_glock() {
        let table = LockTable::new(4, 2);
        let gl = make(3);
        table.find_insert(&gl.key(), Some(&gl)).await.unwrap();

        assert!(table.remove(&gl).unwrap_err().is_fatal());
        assert!(gl.lockref.sub_locked(1));
        assert!(table.remove(&gl).unwrap().is_some());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_lookup_waits_for_dying_glock() {
        let table = Arc::new(LockTable::new(4, 2));
        let gl = make(5);
        let key = gl.key();
        table.find_insert(&key, Some(&gl)).await.unwrap();
        assert!(gl.lockref.sub_locked(1));

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move { table.find_insert(&key, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        table.remove(&gl).unwrap();
        let found = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_wait_table_wakes_only_matching_key() {
        let waits = WaitTable::new(1);
        let a = GlockKey::new(1, ResourceType::Inode, FsId(0));
        let b = GlockKey::new(2, ResourceType::Inode, FsId(0));
        let ta = waits.prepare(&a);
        let _tb = waits.prepare(&b);

        assert_eq!(waits.wake(&a), 1);
        assert_eq!(waits.pending(), 1);
        waits.cancel(&ta);
        assert_eq!(waits.pending(), 1);
    }
}
