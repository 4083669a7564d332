// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 itsakeyfut
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

//! Cache statistics

use serde::Serialize;

use crate::core::mem::packet::Command;
use crate::core::sim::stats::StatsSink;

/// Per-cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: [u64; Command::COUNT],
    pub misses: [u64; Command::COUNT],
    /// Misses that merged into an outstanding entry
    pub mshr_hits: [u64; Command::COUNT],
    pub uncacheable: [u64; Command::COUNT],
    pub fast_writes: u64,
    pub snoops: u64,
    pub snoops_nacked: u64,
    pub snoop_supplies: u64,
    /// Invalidates queued behind an in-service fill
    pub snoop_invalidates_appended: u64,
    /// Store-conditionals failed by a snoop before reaching the bus
    pub sc_failures: u64,
    /// Upgrades whose line was evicted in flight and went out again as fills
    pub upgrade_refetches: u64,
    pub writebacks: u64,
    pub replacements: u64,
    pub blocked_events: u64,
    pub retries_sent: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_hits(&self) -> u64 {
        self.hits.iter().sum()
    }

    pub fn total_misses(&self) -> u64 {
        self.misses.iter().sum()
    }

    pub fn dump(&self, name: &str, sink: &mut dyn StatsSink) {
        for cmd in Command::ALL {
            let i = cmd.index();
            let counters = [
                ("hits", self.hits[i]),
                ("misses", self.misses[i]),
                ("mshr_hits", self.mshr_hits[i]),
                ("uncacheable", self.uncacheable[i]),
            ];
            for (what, value) in counters {
                if value > 0 {
                    sink.record(&format!("{}.{}_{}", name, cmd, what), value);
                }
            }
        }
        sink.record(&format!("{}.hits", name), self.total_hits());
        sink.record(&format!("{}.misses", name), self.total_misses());
        sink.record(&format!("{}.fast_writes", name), self.fast_writes);
        sink.record(&format!("{}.snoops", name), self.snoops);
        sink.record(&format!("{}.snoops_nacked", name), self.snoops_nacked);
        sink.record(&format!("{}.snoop_supplies", name), self.snoop_supplies);
        sink.record(
            &format!("{}.snoop_invalidates_appended", name),
            self.snoop_invalidates_appended,
        );
        sink.record(&format!("{}.sc_failures", name), self.sc_failures);
        sink.record(&format!("{}.upgrade_refetches", name), self.upgrade_refetches);
        sink.record(&format!("{}.writebacks", name), self.writebacks);
        sink.record(&format!("{}.replacements", name), self.replacements);
        sink.record(&format!("{}.blocked_events", name), self.blocked_events);
        sink.record(&format!("{}.retries_sent", name), self.retries_sent);
    }
}
