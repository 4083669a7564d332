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

//! Registry of live systems
//!
//! The driver creates one [`SystemRegistry`] and registers every system it
//! builds. Systems are dropped in registration order when the registry goes
//! away.

use super::system::System;
use crate::core::error::{Result, SimError};

#[derive(Debug, Default)]
pub struct SystemRegistry {
    systems: Vec<System>,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a system
    ///
    /// # Returns
    ///
    /// Index of the system in registration order
    ///
    /// # Errors
    ///
    /// System names must be unique.
    pub fn register(&mut self, system: System) -> Result<usize> {
        if self.get(system.name()).is_some() {
            return Err(SimError::Config(format!(
                "a system named '{}' is already registered",
                system.name()
            )));
        }
        log::debug!("Registry: registered {}", system.name());
        self.systems.push(system);
        Ok(self.systems.len() - 1)
    }

    /// Take a system out of the registry
    pub fn remove(&mut self, name: &str) -> Option<System> {
        let pos = self.systems.iter().position(|s| s.name() == name)?;
        Some(self.systems.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<&System> {
        self.systems.iter().find(|s| s.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut System> {
        self.systems.iter_mut().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &System> {
        self.systems.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut System> {
        self.systems.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Running thread contexts across every system
    pub fn num_running(&self) -> usize {
        self.systems.iter().map(System::num_running_contexts).sum()
    }

    /// One line per system: name, tick and context counts
    pub fn print_systems(&self) -> String {
        let mut out = String::new();
        for system in &self.systems {
            let line = format!(
                "{}: tick {}, {} contexts ({} running)",
                system.name(),
                system.now(),
                system.num_contexts(),
                system.num_running_contexts()
            );
            log::info!("{}", line);
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}
