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

//! Block store
//!
//! [`TagStore`] is the narrow interface the cache needs from its storage:
//! lookup, allocate and evict. [`LruTags`] is a set-associative store with
//! least-recently-used replacement.

use super::blk::{BlkStatus, CacheBlk};
use crate::core::error::{Result, SimError};
use crate::core::mem::Addr;
use crate::core::timing::Tick;

/// A line pushed out of the store to make room for another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted {
    pub addr: Addr,
    pub status: BlkStatus,
    pub data: Vec<u8>,
}

/// Associative storage of fixed-size lines
pub trait TagStore {
    fn blk_size(&self) -> usize;

    /// Line address containing `addr`
    fn block_addr(&self, addr: Addr) -> Addr {
        addr & !(self.blk_size() as Addr - 1)
    }

    /// Find the valid line holding `addr` without touching replacement state
    fn find_block(&self, addr: Addr) -> Option<&CacheBlk>;

    fn find_block_mut(&mut self, addr: Addr) -> Option<&mut CacheBlk>;

    /// Find the valid line holding `addr` and mark it most recently used
    fn access_block(&mut self, addr: Addr, now: Tick) -> Option<&mut CacheBlk>;

    /// Make room for the line holding `addr`
    ///
    /// The returned line is reset to Invalid with its address set; the caller
    /// fills in data and state. A valid victim is handed back.
    fn allocate(&mut self, addr: Addr, now: Tick) -> (&mut CacheBlk, Option<Evicted>);

    /// Invalidate the line holding `addr`
    ///
    /// # Returns
    ///
    /// true if a valid line was invalidated; invalidating an absent line is
    /// a no-op
    fn invalidate(&mut self, addr: Addr) -> bool;

    /// Current state of the line holding `addr` (Invalid if absent)
    fn status(&self, addr: Addr) -> BlkStatus {
        self.find_block(addr)
            .map(|blk| blk.status)
            .unwrap_or(BlkStatus::INVALID)
    }

    /// Number of valid lines
    fn num_valid(&self) -> usize;
}

/// Set-associative LRU block store
///
/// Each set keeps its ways ordered most recently used first.
#[derive(Debug, Clone)]
pub struct LruTags {
    blk_size: usize,
    assoc: usize,
    num_sets: usize,
    sets: Vec<Vec<CacheBlk>>,
}

impl LruTags {
    /// Create a store of `size` bytes
    ///
    /// # Errors
    ///
    /// `blk_size` must be a power of two and `size` a multiple of
    /// `assoc * blk_size` with a power-of-two set count.
    pub fn new(size: usize, assoc: usize, blk_size: usize) -> Result<Self> {
        if blk_size == 0 || !blk_size.is_power_of_two() {
            return Err(SimError::Config(format!(
                "block size {} is not a power of two",
                blk_size
            )));
        }
        if assoc == 0 || size == 0 || size % (assoc * blk_size) != 0 {
            return Err(SimError::Config(format!(
                "cache size {} is not a multiple of {} ways x {} bytes",
                size, assoc, blk_size
            )));
        }
        let num_sets = size / (assoc * blk_size);
        if !num_sets.is_power_of_two() {
            return Err(SimError::Config(format!(
                "set count {} is not a power of two",
                num_sets
            )));
        }

        let sets = (0..num_sets)
            .map(|_| (0..assoc).map(|_| CacheBlk::new(blk_size)).collect())
            .collect();

        Ok(Self {
            blk_size,
            assoc,
            num_sets,
            sets,
        })
    }

    pub fn assoc(&self) -> usize {
        self.assoc
    }

    pub fn num_sets(&self) -> usize {
        self.num_sets
    }

    #[inline]
    fn set_index(&self, addr: Addr) -> usize {
        ((addr / self.blk_size as Addr) as usize) & (self.num_sets - 1)
    }

    fn way_of(&self, addr: Addr) -> (usize, Option<usize>) {
        let blk_addr = self.block_addr(addr);
        let set = self.set_index(addr);
        let way = self.sets[set]
            .iter()
            .position(|blk| blk.is_valid() && blk.addr == blk_addr);
        (set, way)
    }

    fn move_to_front(&mut self, set: usize, way: usize) {
        self.sets[set][..=way].rotate_right(1);
    }
}

impl TagStore for LruTags {
    fn blk_size(&self) -> usize {
        self.blk_size
    }

    fn find_block(&self, addr: Addr) -> Option<&CacheBlk> {
        let (set, way) = self.way_of(addr);
        way.map(|w| &self.sets[set][w])
    }

    fn find_block_mut(&mut self, addr: Addr) -> Option<&mut CacheBlk> {
        let (set, way) = self.way_of(addr);
        way.map(move |w| &mut self.sets[set][w])
    }

    fn access_block(&mut self, addr: Addr, now: Tick) -> Option<&mut CacheBlk> {
        let (set, way) = self.way_of(addr);
        let way = way?;
        self.move_to_front(set, way);
        let blk = &mut self.sets[set][0];
        blk.last_touch = now;
        Some(blk)
    }

    fn allocate(&mut self, addr: Addr, now: Tick) -> (&mut CacheBlk, Option<Evicted>) {
        let blk_addr = self.block_addr(addr);
        let (set, way) = self.way_of(addr);

        let (way, evicted) = match way {
            Some(way) => (way, None),
            None => {
                // Prefer an invalid way, else the LRU one at the back.
                let ways = &mut self.sets[set];
                let victim = ways
                    .iter()
                    .rposition(|blk| !blk.is_valid())
                    .unwrap_or(ways.len() - 1);
                let blk = &mut ways[victim];
                let evicted = blk.is_valid().then(|| Evicted {
                    addr: blk.addr,
                    status: blk.status,
                    data: blk.data.clone(),
                });
                blk.addr = blk_addr;
                blk.invalidate();
                blk.data.fill(0);
                (victim, evicted)
            }
        };

        self.move_to_front(set, way);
        let blk = &mut self.sets[set][0];
        blk.last_touch = now;
        (blk, evicted)
    }

    fn invalidate(&mut self, addr: Addr) -> bool {
        match self.find_block_mut(addr) {
            Some(blk) => {
                blk.invalidate();
                true
            }
            None => false,
        }
    }

    fn num_valid(&self) -> usize {
        self.sets
            .iter()
            .flat_map(|set| set.iter())
            .filter(|blk| blk.is_valid())
            .count()
    }
}
