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

//! Statistics collection
//!
//! Components push named counters into a [`StatsSink`]. Names are dotted
//! paths rooted at the component name, e.g. `l1d0.ReadReq_misses`.

use std::collections::BTreeMap;

use serde::Serialize;

/// Receiver of named statistics
pub trait StatsSink {
    fn record(&mut self, name: &str, value: u64);
}

/// Sorted map of every recorded statistic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsCollector {
    values: BTreeMap<String, u64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Sum of every statistic whose name ends with `suffix`
    pub fn sum_suffix(&self, suffix: &str) -> u64 {
        self.values
            .iter()
            .filter(|(k, _)| k.ends_with(suffix))
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.values)
    }
}

impl StatsSink for StatsCollector {
    fn record(&mut self, name: &str, value: u64) {
        *self.values.entry(name.to_string()).or_insert(0) += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accumulates() {
        let mut stats = StatsCollector::new();
        stats.record("cpu.num_insts", 3);
        stats.record("cpu.num_insts", 4);
        stats.record("l1.ReadReq_hits", 1);

        assert_eq!(stats.get("cpu.num_insts"), Some(7));
        assert_eq!(stats.get("missing"), None);
        assert_eq!(stats.len(), 2);
    }

    #[test]
    fn test_sum_suffix_and_json() {
        let mut stats = StatsCollector::new();
        stats.record("l1d0.ReadReq_misses", 2);
        stats.record("l1d1.ReadReq_misses", 5);
        stats.record("l1d1.ReadReq_hits", 9);

        assert_eq!(stats.sum_suffix("_misses"), 7);

        let json = stats.to_json().unwrap();
        assert!(json.contains("\"l1d1.ReadReq_hits\": 9"));
    }
}
