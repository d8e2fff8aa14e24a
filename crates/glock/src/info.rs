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

use crate::holder::HolderShared;
use crate::types::{GlockKey, LockState, OwnerId, ReplyCode};
use serde::Serialize;
use std::time::Duration;

/// Diagnostic record for one glock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GlockInfo {
    pub key: GlockKey,
    pub state: LockState,
    pub target: LockState,
    pub demote_state: LockState,
    pub flags: Vec<&'static str>,
    pub ref_count: i64,
    pub hold_time_ms: u64,
    pub last_reply: ReplyCode,
    pub queued: u64,
    pub demotes: u64,
    pub timing: GlockTiming,
    pub holders: Vec<HolderInfo>,
}

/// Smoothed lock service latencies, in nanoseconds. Each mean moves an
/// eighth of the way towards a new sample and each variance a quarter of
/// the way towards the sample's distance from the mean.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GlockTiming {
    /// Round trip of requests that could not block in the lock service.
    pub srtt: i64,
    pub srttvar: i64,
    /// Round trip of blocking requests.
    pub srttb: i64,
    pub srttvarb: i64,
    /// Interval between successive requests.
    pub sirt: i64,
    pub sirtvar: i64,
}

impl GlockTiming {
    pub(crate) fn record_reply(&mut self, rtt: Duration, blocking: bool) {
        if blocking {
            smooth(&mut self.srttb, &mut self.srttvarb, rtt);
        } else {
            smooth(&mut self.srtt, &mut self.srttvar, rtt);
        }
    }

    pub(crate) fn record_interval(&mut self, interval: Duration) {
        smooth(&mut self.sirt, &mut self.sirtvar, interval);
    }
}

fn smooth(mean: &mut i64, var: &mut i64, sample: Duration) {
    let sample = i64::try_from(sample.as_nanos()).unwrap_or(i64::MAX);
    let delta = sample.saturating_sub(*mean);
    *mean += delta >> 3;
    *var += (delta.saturating_abs() - *var) >> 2;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderInfo {
    pub id: u64,
    pub state: LockState,
    pub flags: Vec<&'static str>,
    pub owner: OwnerId,
    pub granted: bool,
    pub waiting: bool,
}

impl HolderInfo {
    pub(crate) fn from_shared(gh: &HolderShared) -> Self {
        HolderInfo {
            id: gh.id,
            state: gh.state,
            flags: gh.flags.iter_names().map(|(name, _)| name).collect(),
            owner: gh.owner,
            granted: gh.is_holder(),
            waiting: gh.is_waiting(),
        }
    }
}
