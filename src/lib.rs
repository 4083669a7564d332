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

//! Cycle-level model of a CPU-to-memory request path
//!
//! This library simulates timing CPUs and memory testers issuing accesses
//! through private caches that keep each other coherent by snooping a
//! shared bus. Everything runs on a single discrete-event queue.
//!
//! # Example
//!
//! ```
//! use snoopsim::core::cpu::mem_tester::MemTester;
//! use snoopsim::core::sim::{Smp, SmpParams};
//!
//! let mut smp = Smp::with_testers(&SmpParams::default(), vec![None, None]).unwrap();
//! let tester = smp.agents[0];
//! smp.system
//!     .with_object::<MemTester, _>(tester, |t, f| t.write(f, 0x1000, 4, 0xCAFE))
//!     .unwrap();
//! smp.system.run(None).unwrap();
//!
//! let value = smp
//!     .system
//!     .with_object::<MemTester, _>(tester, |t, f| t.functional_read(f, 0x1000, 4))
//!     .unwrap();
//! assert_eq!(value, 0xCAFE);
//! ```

pub mod core;
