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

/// Simulator error types
use thiserror::Error;

use super::mem::packet::Command;
use super::mem::Addr;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Main error type for the simulator
///
/// Only unrecoverable conditions end up here. Refused sends, cache misses and
/// merges into an outstanding miss are ordinary control flow and never produce
/// an error.
#[derive(Error, Debug)]
pub enum SimError {
    #[error("{component}: protocol violation at 0x{addr:08X} ({cmd}, state {state}): {detail}")]
    ProtocolViolation {
        component: String,
        addr: Addr,
        cmd: Command,
        state: String,
        detail: String,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Re-entrant call into {0}")]
    Reentrant(String),

    #[error("{component}: port '{port}' is not bound")]
    UnboundPort { component: String, port: String },

    #[error("{component}: no port named '{port}'")]
    UnknownPort { component: String, port: String },

    #[error("No simulation object with id {0}")]
    UnknownObject(usize),

    #[error("No link with id {0}")]
    UnknownLink(usize),

    #[error("Cannot schedule an event at tick {when}, current tick is {now}")]
    EventInPast { when: u64, now: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SimError {
    /// Build a [`SimError::ProtocolViolation`] with full diagnostic context
    ///
    /// # Arguments
    ///
    /// * `component` - Name of the component that detected the violation
    /// * `addr` - Address of the offending transaction
    /// * `cmd` - Command of the offending transaction
    /// * `state` - Human-readable state of the component at the time
    /// * `detail` - What went wrong
    pub fn violation(
        component: &str,
        addr: Addr,
        cmd: Command,
        state: impl std::fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        SimError::ProtocolViolation {
            component: component.to_string(),
            addr,
            cmd,
            state: state.to_string(),
            detail: detail.into(),
        }
    }
}

/// Translation and access faults
///
/// Faults are values, not errors: they are handed back to the CPU pipeline,
/// which completes the faulting instruction through its fault path instead of
/// issuing a memory access.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("page fault at virtual address 0x{vaddr:08X}")]
    PageFault { vaddr: Addr },

    #[error("unaligned {size}-byte access at 0x{vaddr:08X}")]
    Alignment { vaddr: Addr, size: usize },

    #[error("bad physical address 0x{paddr:08X}")]
    BadAddress { paddr: Addr },

    #[error("illegal instruction 0x{word:08X} at 0x{pc:08X}")]
    IllegalInstruction { pc: Addr, word: u32 },
}
