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

use crate::types::{GlockKey, ReplyCode};
use std::time::Duration;
use thiserror::Error;

/// Glock operation related error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GlockError {
    /// A try request could not be granted immediately
    #[error("Try lock failed on glock {key}")]
    TryFailed { key: GlockKey },

    /// The lock service answered with an error
    #[error("Lock service error on glock {key}: reply {code}")]
    RemoteProtocol { key: GlockKey, code: ReplyCode },

    /// The sync hook could not write back dirty state
    #[error("Flush failed on glock {key}: {message}")]
    Flush { key: GlockKey, message: String },

    /// The invalidate hook could not drop cached state
    #[error("Invalidate failed on glock {key}: {message}")]
    Invalidate { key: GlockKey, message: String },

    /// Internal bookkeeping is inconsistent; the filesystem must stop using this glock
    #[error("Glock invariant violated on {key}: {message}")]
    InvariantViolation { key: GlockKey, message: String },

    /// Allocation failed while creating a glock
    #[error("Out of memory: {message}")]
    OutOfMemory { message: String },

    /// Lookup without create found nothing
    #[error("Glock not found: {key}")]
    NotFound { key: GlockKey },

    /// The filesystem is withdrawn and the request is not exempt
    #[error("Filesystem withdrawn, glock {key} is blocked")]
    Withdrawn { key: GlockKey },

    /// Batch acquisition timed out; the whole batch should be retried
    #[error("Batch acquisition went stale after {timeout:?}")]
    Stale { timeout: Duration },

    /// The acquire hook kept reporting lock ordering conflicts
    #[error("Acquire hook on glock {key} conflicted {attempts} times")]
    AcquireConflict { key: GlockKey, attempts: u32 },

    /// A resource hook failed with a non-I/O error
    #[error("Hook error on glock {key}: {message}")]
    Hook { key: GlockKey, message: String },

    /// The holder was removed from the queue before it was granted
    #[error("Holder on glock {key} was dequeued while waiting")]
    Dequeued { key: GlockKey },

    /// Bounded wait expired
    #[error("Timed out after {timeout:?}: {message}")]
    Timeout { message: String, timeout: Duration },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Serialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl GlockError {
    pub fn try_failed(key: GlockKey) -> Self {
        GlockError::TryFailed { key }
    }

    pub fn remote(key: GlockKey, code: ReplyCode) -> Self {
        GlockError::RemoteProtocol { key, code }
    }

    pub fn flush(key: GlockKey, message: impl Into<String>) -> Self {
        GlockError::Flush {
            key,
            message: message.into(),
        }
    }

    pub fn invalidate(key: GlockKey, message: impl Into<String>) -> Self {
        GlockError::Invalidate {
            key,
            message: message.into(),
        }
    }

    pub fn invariant(key: GlockKey, message: impl Into<String>) -> Self {
        GlockError::InvariantViolation {
            key,
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        GlockError::OutOfMemory { message: message.into() }
    }

    pub fn hook(key: GlockKey, message: impl Into<String>) -> Self {
        GlockError::Hook {
            key,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>, timeout: Duration) -> Self {
        GlockError::Timeout {
            message: message.into(),
            timeout,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        GlockError::Configuration { message: message.into() }
    }

    /// Check if the caller may sensibly retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GlockError::TryFailed { .. }
                | GlockError::RemoteProtocol { .. }
                | GlockError::OutOfMemory { .. }
                | GlockError::Stale { .. }
                | GlockError::AcquireConflict { .. }
                | GlockError::Timeout { .. }
        )
    }

    /// Fatal errors require the caller to stop using this filesystem instance
    pub fn is_fatal(&self) -> bool {
        matches!(self, GlockError::InvariantViolation { .. })
    }

    /// Errors that move the filesystem towards withdrawal
    pub fn triggers_withdraw(&self) -> bool {
        matches!(self, GlockError::Flush { .. } | GlockError::Invalidate { .. })
    }
}

/// Result type for glock operations
pub type Result<T> = std::result::Result<T, GlockError>;

impl From<serde_json::Error> for GlockError {
    fn from(err: serde_json::Error) -> Self {
        GlockError::Serialization { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FsId, ResourceType};

    fn key() -> GlockKey {
        GlockKey::new(0x42, ResourceType::Inode, FsId(0))
    }

    #[test]
    fn test_error_classification() {
        assert!(GlockError::try_failed(key()).is_retryable());
        assert!(!GlockError::try_failed(key()).is_fatal());
        assert!(GlockError::invariant(key(), "double grant").is_fatal());
        assert!(!GlockError::invariant(key(), "double grant").is_retryable());
        assert!(GlockError::flush(key(), "eio").triggers_withdraw());
        assert!(!GlockError::Withdrawn { key: key() }.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = GlockError::remote(key(), ReplyCode::error(crate::types::LockState::Shared));
        assert_eq!(err.to_string(), "Lock service error on glock 2/42: reply 0x7");

        let err = GlockError::Stale {
            timeout: Duration::from_millis(400),
        };
        assert!(err.to_string().contains("400ms"));
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not json");
        let err: GlockError = parse.unwrap_err().into();
        assert!(matches!(err, GlockError::Serialization { .. }));
    }
}
