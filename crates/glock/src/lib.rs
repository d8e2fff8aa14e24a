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

// ============================================================================
// Core Module Declarations
// ============================================================================

// Application Layer Modules
pub mod manager;

// Abstraction Layer Modules
pub mod client;
pub mod ops;

// Cache Layer Modules
pub mod glock;
pub mod holder;
mod lru;
mod table;

// State Machine Modules
mod queue;
mod scheduler;
mod state_machine;
pub mod withdraw;

// Core Modules
pub mod config;
pub mod error;
pub mod info;
pub mod metrics;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    // Client interfaces
    client::{ClientFactory, LockClient, local::LocalClient},
    // Configuration
    config::GlockConfig,
    // Error types
    error::{GlockError, Result},
    // Main components
    glock::{Glock, GlockFlags},
    holder::Holder,
    info::{GlockInfo, GlockTiming, HolderInfo},
    manager::{GlockManager, GlockRef},
    metrics::{GlockMetrics, MetricsSnapshot},
    ops::{AcquireOutcome, BasicOps, GlockOperations, GlockView, HolderView},
    // Core types
    types::{
        FsId, GlockKey, HolderFlags, InvalidateFlags, LVB_SIZE, LmFlags, LockState, OpsFlags, OwnerId, ReplyCode, ResourceType,
    },
    withdraw::{WithdrawCoordinator, WithdrawState},
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the glock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
