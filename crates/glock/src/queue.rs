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

//! Holder queue admission and the compatibility rule.

use crate::error::{GlockError, Result};
use crate::glock::{Glock, GlockFlags, GlockInner};
use crate::holder::HolderShared;
use crate::manager::GlockManager;
use crate::types::{HolderFlags, LockState};
use std::sync::Arc;
use tracing::error;

/// Whether `gh` can be granted against the cached state and the head of
/// the queue. A holder not yet queued is checked as if it were the head of
/// an empty queue.
pub(crate) fn may_grant(inner: &GlockInner, gh: &HolderShared) -> bool {
    let head: &HolderShared = inner.holders.first().map(Arc::as_ref).unwrap_or(gh);

    if !std::ptr::eq(head, gh) {
        if head.state == LockState::Exclusive
            && head.flags.contains(HolderFlags::NODE_SCOPE)
            && gh.state == LockState::Exclusive
            && gh.flags.contains(HolderFlags::NODE_SCOPE)
        {
            return true;
        }
        if gh.state == LockState::Exclusive || head.state == LockState::Exclusive {
            return false;
        }
    }
    if inner.state == gh.state {
        return true;
    }
    if gh.flags.contains(HolderFlags::EXACT) {
        return false;
    }
    if inner.state == LockState::Exclusive {
        if gh.state == LockState::Shared && head.state == LockState::Shared {
            return true;
        }
        if gh.state == LockState::Deferred && head.state == LockState::Deferred {
            return true;
        }
    }
    inner.state != LockState::Unlocked && gh.flags.contains(HolderFlags::ANY)
}

enum Admission {
    Insert { at: Option<usize> },
    TryFailed,
    Recursive,
}

impl GlockManager {
    /// Insert a new holder at its admission position. Try requests that
    /// cannot succeed are failed here without being queued.
    pub(crate) fn add_to_queue(&self, gl: &Arc<Glock>, inner: &mut GlockInner, gh: &Arc<HolderShared>) -> Result<()> {
        let mut try_futile = false;
        if gh.flags.is_try() {
            if gl.flags.test(GlockFlags::LOCKED) {
                try_futile = !may_grant(inner, gh);
            }
            if gl.flags.test(GlockFlags::INVALIDATE_IN_PROGRESS) {
                self.fail_try(gl, gh);
                return Ok(());
            }
        }

        let recursion_allowed = gl.kind().allows_owner_recursion();
        let priority = gh.flags.contains(HolderFlags::PRIORITY);
        let mut admission = Admission::Insert { at: None };
        for (i, queued) in inner.holders.iter().enumerate() {
            if queued.owner == gh.owner && !recursion_allowed {
                admission = Admission::Recursive;
                break;
            }
            if try_futile && !queued.flags.is_try() {
                admission = Admission::TryFailed;
                break;
            }
            if queued.is_holder() {
                continue;
            }
            if priority && matches!(admission, Admission::Insert { at: None }) {
                admission = Admission::Insert { at: Some(i) };
            }
        }

        let at = match admission {
            Admission::Recursive => {
                error!(glock = %gl.key(), owner = %gh.owner, state = %gh.state, "recursive glock request");
                return Err(self.glock_bug(gl, inner, format!("recursive request by owner {}", gh.owner)));
            }
            Admission::TryFailed => {
                self.fail_try(gl, gh);
                return Ok(());
            }
            Admission::Insert { at } => at,
        };

        inner.stats.qcount += 1;
        let Some(pos) = at else {
            inner.holders.push(gh.clone());
            return Ok(());
        };

        // A transition in flight for a displaced non-priority waiter is
        // cancelled so the priority holder does not wait behind it.
        let displaced_priority = inner.holders[pos].flags.contains(HolderFlags::PRIORITY);
        inner.holders.insert(pos, gh.clone());
        if !displaced_priority
            && gl.flags.test(GlockFlags::LOCKED)
            && !gl.flags.test(GlockFlags::DEMOTE_IN_PROGRESS)
        {
            self.cancel_request(gl);
        }
        Ok(())
    }

    fn fail_try(&self, gl: &Glock, gh: &Arc<HolderShared>) {
        self.metrics().record_try_failure();
        self.wake_holder(gh, Some(GlockError::try_failed(gl.key())));
    }

    /// Fail waiting holders. With no error only try holders fail, with
    /// `TryFailed`; otherwise every waiter gets the error.
    pub(crate) fn do_error(&self, gl: &Glock, inner: &mut GlockInner, error: Option<GlockError>) {
        let key = gl.key();
        self.fail_waiters(inner, |gh| match &error {
            Some(err) => Some(err.clone()),
            None if gh.flags.is_try() => Some(GlockError::try_failed(key)),
            None => None,
        });
    }

    /// Remove and wake every waiting holder `pick` returns an error for.
    pub(crate) fn fail_waiters<F>(&self, inner: &mut GlockInner, mut pick: F)
    where
        F: FnMut(&HolderShared) -> Option<GlockError>,
    {
        let mut failed = Vec::new();
        inner.holders.retain(|gh| {
            if gh.is_holder() {
                return true;
            }
            match pick(gh) {
                Some(err) => {
                    failed.push((gh.clone(), err));
                    false
                }
                None => true,
            }
        });
        for (gh, err) in failed {
            if matches!(err, GlockError::TryFailed { .. }) {
                self.metrics().record_try_failure();
            }
            self.wake_holder(&gh, Some(err));
        }
    }

    pub(crate) fn wake_holder(&self, gh: &HolderShared, error: Option<GlockError>) {
        gh.complete(error);
        if gh.flags.contains(HolderFlags::ASYNC) {
            self.async_wait.notify_waiters();
        }
    }

    /// Grant `gh`. It must be queued and waiting.
    pub(crate) fn grant(&self, gh: &HolderShared) {
        gh.set_holder();
        self.wake_holder(gh, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::BasicOps;
    use crate::types::{FsId, GlockKey, OwnerId, ResourceType};
    use std::time::Duration;

    fn inner_with(state: LockState, holders: &[(LockState, HolderFlags, bool)]) -> (Glock, Vec<Arc<HolderShared>>) {
        let key = GlockKey::new(1, ResourceType::Inode, FsId(0));
        let gl = Glock::new(key, Arc::new(BasicOps::new(ResourceType::Inode)), Duration::from_millis(10));
        let mut queued = Vec::new();
        {
            let mut inner = gl.inner.lock();
            inner.state = state;
            for (i, (st, flags, granted)) in holders.iter().enumerate() {
                let gh = HolderShared::new(*st, *flags, OwnerId::new(i as u64));
                if *granted {
                    gh.set_holder();
                }
                inner.holders.push(gh.clone());
                queued.push(gh);
            }
        }
        (gl, queued)
    }

    #[test]
    fn test_head_cache_hit() {
        let (gl, q) = inner_with(LockState::Shared, &[(LockState::Shared, HolderFlags::empty(), false)]);
        assert!(may_grant(&gl.inner.lock(), &q[0]));
    }

    #[test]
    fn test_exclusive_blocks_followers() {
        let (gl, q) = inner_with(
            LockState::Exclusive,
            &[
                (LockState::Exclusive, HolderFlags::empty(), true),
                (LockState::Shared, HolderFlags::empty(), false),
            ],
        );
        assert!(!may_grant(&gl.inner.lock(), &q[1]));
    }

    #[test]
    fn test_node_scope_exclusive_shares() {
        let (gl, q) = inner_with(
            LockState::Exclusive,
            &[
                (LockState::Exclusive, HolderFlags::NODE_SCOPE, true),
                (LockState::Exclusive, HolderFlags::NODE_SCOPE, false),
                (LockState::Exclusive, HolderFlags::empty(), false),
            ],
        );
        let inner = gl.inner.lock();
        assert!(may_grant(&inner, &q[1]));
        assert!(!may_grant(&inner, &q[2]));
    }

    #[test]
    fn test_shared_from_exclusive_cache() {
        let (gl, q) = inner_with(
            LockState::Exclusive,
            &[
                (LockState::Shared, HolderFlags::empty(), false),
                (LockState::Shared, HolderFlags::empty(), false),
                (LockState::Deferred, HolderFlags::empty(), false),
            ],
        );
        let inner = gl.inner.lock();
        assert!(may_grant(&inner, &q[0]));
        assert!(may_grant(&inner, &q[1]));
        assert!(!may_grant(&inner, &q[2]));
    }

    #[test]
    fn test_exact_refuses_compatible_cache() {
        let (gl, q) = inner_with(LockState::Exclusive, &[(LockState::Shared, HolderFlags::EXACT, false)]);
        assert!(!may_grant(&gl.inner.lock(), &q[0]));
    }

    #[test]
    fn test_any_accepts_held_cache() {
        let (gl, q) = inner_with(LockState::Deferred, &[(LockState::Shared, HolderFlags::ANY, false)]);
        assert!(may_grant(&gl.inner.lock(), &q[0]));

        let (gl, q) = inner_with(LockState::Unlocked, &[(LockState::Shared, HolderFlags::ANY, false)]);
        assert!(!may_grant(&gl.inner.lock(), &q[0]));
    }

    #[test]
    fn test_unqueued_holder_checked_as_head() {
        let (gl, _) = inner_with(LockState::Shared, &[]);
        let gh = HolderShared::new(LockState::Shared, HolderFlags::TRY, OwnerId::new(9));
        assert!(may_grant(&gl.inner.lock(), &gh));
    }
}
