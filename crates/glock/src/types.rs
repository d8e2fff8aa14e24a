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

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Cluster lock modes, ordered by their wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockState {
    #[default]
    Unlocked = 0,
    Exclusive = 1,
    Deferred = 2,
    Shared = 3,
}

impl LockState {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Self {
        match code & ReplyCode::STATE_MASK {
            1 => LockState::Exclusive,
            2 => LockState::Deferred,
            3 => LockState::Shared,
            _ => LockState::Unlocked,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            LockState::Unlocked => "UN",
            LockState::Exclusive => "EX",
            LockState::Deferred => "DF",
            LockState::Shared => "SH",
        }
    }

    pub fn is_held(self) -> bool {
        self != LockState::Unlocked
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of on-disk (or not) resource a glock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceType {
    Nondisk = 1,
    Inode = 2,
    Rgrp = 3,
    Meta = 4,
    Iopen = 5,
    Flock = 6,
    Plock = 7,
    Quota = 8,
    Journal = 9,
}

impl ResourceType {
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Capabilities an operations set of this kind starts from.
    pub fn default_ops_flags(self) -> OpsFlags {
        match self {
            ResourceType::Inode => OpsFlags::ASPACE | OpsFlags::LRU | OpsFlags::LVB,
            ResourceType::Rgrp => OpsFlags::LVB,
            ResourceType::Quota => OpsFlags::LVB | OpsFlags::LRU | OpsFlags::NONDISK,
            ResourceType::Meta => OpsFlags::LRU,
            ResourceType::Nondisk | ResourceType::Iopen | ResourceType::Flock | ResourceType::Plock | ResourceType::Journal => {
                OpsFlags::NONDISK
            }
        }
    }

    /// Whether remote demote requests honor the local minimum hold time.
    pub fn honors_hold_time(self) -> bool {
        matches!(self, ResourceType::Inode)
    }

    /// Flock-style resources legitimately see one owner queue several holders.
    pub fn allows_owner_recursion(self) -> bool {
        matches!(self, ResourceType::Flock)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Identifies one mounted filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FsId(pub u32);

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs{}", self.0)
    }
}

/// Lock table key. Ordering is by resource number first, which is the
/// order batch acquisition uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlockKey {
    pub number: u64,
    pub kind: ResourceType,
    pub fs: FsId,
}

impl GlockKey {
    pub fn new(number: u64, kind: ResourceType, fs: FsId) -> Self {
        Self { number, kind, fs }
    }

    pub fn hash_value(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn shard_index(&self, shard_mask: usize) -> usize {
        (self.hash_value() as usize) & shard_mask
    }
}

impl fmt::Display for GlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:x}", self.kind, self.number)
    }
}

/// Raw result of a lock service round trip: granted state in the low bits
/// plus cancel/error markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplyCode(pub u32);

impl ReplyCode {
    pub const STATE_MASK: u32 = 0x03;
    pub const ERROR: u32 = 0x04;
    pub const CANCELED: u32 = 0x08;

    pub const fn granted(state: LockState) -> Self {
        Self(state.code())
    }

    pub const fn canceled(state: LockState) -> Self {
        Self(state.code() | Self::CANCELED)
    }

    pub const fn error(state: LockState) -> Self {
        Self(state.code() | Self::ERROR)
    }

    pub const fn state(self) -> LockState {
        LockState::from_code(self.0)
    }

    pub const fn is_canceled(self) -> bool {
        self.0 & Self::CANCELED != 0
    }

    pub const fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Caller-visible request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HolderFlags: u32 {
        /// Fail instead of waiting when not immediately grantable.
        const TRY = 1 << 0;
        /// Like TRY, but the lock service sends at most one callback.
        const TRY_1CB = 1 << 1;
        /// Any compatible cached state satisfies the request.
        const ANY = 1 << 2;
        /// Jump ahead of waiting non-priority holders.
        const PRIORITY = 1 << 3;
        /// Allowed while the filesystem is withdrawn or locks are blocked.
        const NOEXP = 1 << 4;
        /// Exclusive only with respect to other nodes.
        const NODE_SCOPE = 1 << 5;
        /// Do not wait in nq; the caller polls or waits later.
        const ASYNC = 1 << 6;
        /// Only the exact requested state satisfies the request.
        const EXACT = 1 << 7;
        /// Drop the cached lock as soon as this holder is released.
        const NOCACHE = 1 << 8;
        /// Do not run the acquire hook for this holder.
        const SKIP = 1 << 9;
    }
}

impl HolderFlags {
    pub fn is_try(self) -> bool {
        self.intersects(HolderFlags::TRY | HolderFlags::TRY_1CB)
    }
}

bitflags! {
    /// Flags forwarded to the lock service with a state change request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LmFlags: u32 {
        const TRY = 1 << 0;
        const TRY_1CB = 1 << 1;
        const NOEXP = 1 << 2;
        const PRIORITY = 1 << 3;
    }
}

impl From<HolderFlags> for LmFlags {
    fn from(flags: HolderFlags) -> Self {
        let mut lm = LmFlags::empty();
        lm.set(LmFlags::TRY, flags.contains(HolderFlags::TRY));
        lm.set(LmFlags::TRY_1CB, flags.contains(HolderFlags::TRY_1CB));
        lm.set(LmFlags::NOEXP, flags.contains(HolderFlags::NOEXP));
        lm.set(LmFlags::PRIORITY, flags.contains(HolderFlags::PRIORITY));
        lm
    }
}

/// Bytes in a lock value block.
pub const LVB_SIZE: usize = 32;

bitflags! {
    /// Capabilities of a resource operations set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpsFlags: u32 {
        /// Idle glocks of this kind are cached on the LRU.
        const LRU = 1 << 0;
        /// Carries an attached page cache / address space.
        const ASPACE = 1 << 1;
        /// Does not touch the storage medium; exempt from withdraw blocking.
        const NONDISK = 1 << 2;
        /// Carries a lock value block of `LVB_SIZE` bytes.
        const LVB = 1 << 3;
    }
}

bitflags! {
    /// Scope handed to the invalidate hook.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InvalidateFlags: u32 {
        const METADATA = 1 << 0;
    }
}

/// Identity used only for recursion detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

impl OwnerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The current tokio task if there is one, otherwise the current thread.
    pub fn current() -> Self {
        let mut hasher = DefaultHasher::new();
        match tokio::task::try_id() {
            Some(id) => id.hash(&mut hasher),
            None => std::thread::current().id().hash(&mut hasher),
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}
