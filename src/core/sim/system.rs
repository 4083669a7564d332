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

//! System container
//!
//! A [`System`] owns one [`Fabric`] and everything that is global to a
//! simulated machine: the memory mode, the cache line size, the thread
//! context table and the requester (master) names used in statistics.

use std::fmt;

use serde::Serialize;

use super::fabric::{ExitReason, Fabric, MemoryMode, SimObject};
use super::stats::StatsSink;
use crate::core::cpu::TimingCpu;
use crate::core::error::{Result, SimError};
use crate::core::mem::port::{LinkId, ObjectId};
use crate::core::timing::Tick;

/// Why and when [`System::run`] returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitEvent {
    pub tick: Tick,
    pub reason: ExitReason,
}

impl fmt::Display for ExitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exiting @ tick {} because {}", self.tick, self.reason)
    }
}

/// A simulated machine
pub struct System {
    name: String,
    fabric: Fabric,
    cache_line_size: usize,
    initialized: bool,
    /// Context id -> CPU object currently running it
    thread_contexts: Vec<ObjectId>,
    master_names: Vec<String>,
}

impl System {
    pub fn new(name: &str, memory_mode: MemoryMode, cache_line_size: usize) -> Self {
        Self {
            name: name.to_string(),
            fabric: Fabric::new(memory_mode),
            cache_line_size,
            initialized: false,
            thread_contexts: Vec::new(),
            // Master 0 is anonymous traffic.
            master_names: vec![format!("{}.anonymous", name)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fabric(&self) -> &Fabric {
        &self.fabric
    }

    pub fn fabric_mut(&mut self) -> &mut Fabric {
        &mut self.fabric
    }

    pub fn now(&self) -> Tick {
        self.fabric.now()
    }

    pub fn cache_line_size(&self) -> usize {
        self.cache_line_size
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    // Construction

    pub fn add_object(&mut self, object: Box<dyn SimObject>) -> ObjectId {
        self.fabric.add_object(object)
    }

    /// Add a CPU and register its thread (if it has one) as a new context
    pub fn add_cpu(&mut self, cpu: TimingCpu) -> Result<ObjectId> {
        let has_thread = cpu.thread().is_some();
        let id = self.fabric.add_object(Box::new(cpu));
        if has_thread {
            self.register_thread_context(id)?;
        }
        Ok(id)
    }

    pub fn connect(&mut self, a: ObjectId, a_port: &str, b: ObjectId, b_port: &str) -> Result<LinkId> {
        self.fabric.connect(a, a_port, b, b_port)
    }

    /// Initialize every object once all links are in place
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Err(SimError::Config(format!("{}: initialized twice", self.name)));
        }
        self.check_memory_mode(self.fabric.memory_mode())?;
        for id in self.fabric.object_ids() {
            self.fabric.with_object(id, |obj, fabric| obj.init(id, fabric))?;
        }
        self.initialized = true;
        log::info!(
            "{}: initialized {} objects, {} mode",
            self.name,
            self.fabric.num_objects(),
            match self.fabric.memory_mode() {
                MemoryMode::Atomic => "atomic",
                MemoryMode::Timing => "timing",
                MemoryMode::AtomicNoncaching => "atomic_noncaching",
            }
        );
        Ok(())
    }

    // Running

    /// Simulate until something asks to exit, the queue empties or `limit`
    /// is passed
    pub fn run(&mut self, limit: Option<Tick>) -> Result<ExitEvent> {
        if !self.initialized {
            return Err(SimError::Config(format!("{}: run before init", self.name)));
        }
        loop {
            if let Some(reason) = self.fabric.take_exit() {
                return Ok(self.exit_event(reason));
            }
            match self.fabric.next_event_time() {
                None => {
                    log::info!("{}: event queue empty @ tick {}", self.name, self.now());
                    return Ok(self.exit_event(ExitReason::EventQueueEmpty));
                }
                Some(when) => {
                    if let Some(limit) = limit.filter(|&limit| when > limit) {
                        self.fabric.advance_to(limit);
                        log::info!("{}: tick limit {} reached", self.name, limit);
                        return Ok(self.exit_event(ExitReason::TickLimit));
                    }
                }
            }
            self.fabric.step()?;
        }
    }

    fn exit_event(&self, reason: ExitReason) -> ExitEvent {
        ExitEvent {
            tick: self.now(),
            reason,
        }
    }

    /// Bring every object to a quiescent state
    ///
    /// Runs the simulation until all in-flight transactions have completed.
    /// Nothing issues new work until [`resume`](Self::resume).
    pub fn drain(&mut self) -> Result<()> {
        let mut outstanding = 0;
        for id in self.fabric.object_ids() {
            outstanding += self.fabric.with_object(id, |obj, fabric| obj.drain(fabric))?;
        }
        log::info!("{}: draining, {} objects busy", self.name, outstanding);
        if outstanding == 0 {
            return Ok(());
        }

        self.fabric.begin_drain(outstanding);
        let exit = self.run(None)?;
        match exit.reason {
            ExitReason::Drained => {
                log::info!("{}: drained @ tick {}", self.name, exit.tick);
                Ok(())
            }
            other => Err(SimError::Config(format!(
                "{}: drain interrupted: {}",
                self.name, other
            ))),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        for id in self.fabric.object_ids() {
            self.fabric.with_object(id, |obj, fabric| obj.resume(fabric))?;
        }
        log::info!("{}: resumed @ tick {}", self.name, self.now());
        Ok(())
    }

    /// Move the running thread of CPU `old` to CPU `new`
    ///
    /// Drains the system, hands the thread and both cache links over, and
    /// resumes. `new` must have been created without a thread.
    pub fn switch_cpus(&mut self, old: ObjectId, new: ObjectId) -> Result<()> {
        log::info!(
            "{}: switching {} -> {}",
            self.name,
            self.fabric.object_name(old).unwrap_or("?"),
            self.fabric.object_name(new).unwrap_or("?")
        );
        self.drain()?;

        self.fabric.with::<TimingCpu, _>(old, |cpu, fabric| cpu.switch_out(fabric))?;
        let (thread, icache, dcache) = self.fabric.with::<TimingCpu, _>(old, |cpu, _| cpu.hand_over())?;
        let context = thread.context_id();

        self.fabric.rebind_port(icache, new)?;
        self.fabric.rebind_port(dcache, new)?;
        self.fabric
            .with::<TimingCpu, _>(new, |cpu, fabric| cpu.take_over(fabric, thread, icache, dcache))?;
        if let Some(context) = context {
            self.replace_thread_context(context, new)?;
        }

        self.resume()
    }

    /// Start the thread on CPU `cpu` after `delay` cycles
    pub fn activate_cpu(&mut self, cpu: ObjectId, delay: u64) -> Result<()> {
        self.fabric
            .with::<TimingCpu, _>(cpu, |cpu, fabric| cpu.activate_context(fabric, delay))
    }

    // Memory mode

    pub fn memory_mode(&self) -> MemoryMode {
        self.fabric.memory_mode()
    }

    /// Change the memory mode
    ///
    /// # Errors
    ///
    /// Timing CPUs only work in timing mode; asking for an atomic mode
    /// while one is active is a configuration error.
    pub fn set_memory_mode(&mut self, mode: MemoryMode) -> Result<()> {
        self.check_memory_mode(mode)?;
        log::info!("{}: memory mode {:?}", self.name, mode);
        self.fabric.set_memory_mode(mode);
        Ok(())
    }

    fn check_memory_mode(&self, mode: MemoryMode) -> Result<()> {
        if mode.is_timing_mode() {
            return Ok(());
        }
        let timing_cpu = self.fabric.object_ids().find(|&id| {
            self.fabric
                .object::<TimingCpu>(id)
                .is_some_and(|cpu| cpu.status() != crate::core::cpu::CpuStatus::SwitchedOut)
        });
        match timing_cpu {
            Some(id) => Err(SimError::Config(format!(
                "{}: {} requires timing mode, not {:?}",
                self.name,
                self.fabric.object_name(id).unwrap_or("cpu"),
                mode
            ))),
            None => Ok(()),
        }
    }

    // Thread contexts

    /// Give the thread on `cpu` the next context id
    pub fn register_thread_context(&mut self, cpu: ObjectId) -> Result<usize> {
        let context = self.thread_contexts.len();
        let name = self.name.clone();
        let thread = self
            .fabric
            .object_mut::<TimingCpu>(cpu)
            .and_then(|cpu| cpu.thread_mut())
            .ok_or_else(|| SimError::Config(format!("{}: object {} has no thread", name, cpu)))?;
        thread.set_context_id(context);
        self.thread_contexts.push(cpu);
        log::debug!("{}: context {} on object {}", self.name, context, cpu);
        Ok(context)
    }

    /// Point context `context` at a different CPU
    pub fn replace_thread_context(&mut self, context: usize, cpu: ObjectId) -> Result<()> {
        if cpu >= self.fabric.num_objects() {
            return Err(SimError::UnknownObject(cpu));
        }
        let slot = self.thread_contexts.get_mut(context).ok_or_else(|| {
            SimError::Config(format!("{}: no thread context {}", self.name, context))
        })?;
        *slot = cpu;
        Ok(())
    }

    /// CPU running context `context`
    pub fn thread_context(&self, context: usize) -> Option<ObjectId> {
        self.thread_contexts.get(context).copied()
    }

    pub fn num_contexts(&self) -> usize {
        self.thread_contexts.len()
    }

    /// Contexts whose thread is active
    pub fn num_running_contexts(&self) -> usize {
        self.thread_contexts
            .iter()
            .filter(|&&cpu| {
                self.fabric
                    .object::<TimingCpu>(cpu)
                    .and_then(|cpu| cpu.thread())
                    .is_some_and(|thread| thread.is_active())
            })
            .count()
    }

    /// Instructions committed by every registered thread
    pub fn total_num_insts(&self) -> u64 {
        self.thread_contexts
            .iter()
            .filter_map(|&cpu| self.fabric.object::<TimingCpu>(cpu)?.thread())
            .map(|thread| thread.num_insts())
            .sum()
    }

    // Requester ids

    /// Id of the requester called `name`, allocating one on first use
    pub fn get_master_id(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.master_names.iter().position(|n| n == name) {
            return pos as u32;
        }
        self.master_names.push(name.to_string());
        (self.master_names.len() - 1) as u32
    }

    pub fn master_name(&self, id: u32) -> Option<&str> {
        self.master_names.get(id as usize).map(String::as_str)
    }

    pub fn num_masters(&self) -> usize {
        self.master_names.len()
    }

    // Object access

    /// Run `f` on object `id` as a `T`
    pub fn with_object<T: SimObject, R>(
        &mut self,
        id: ObjectId,
        f: impl FnOnce(&mut T, &mut Fabric) -> Result<R>,
    ) -> Result<R> {
        self.fabric.with::<T, R>(id, f)
    }

    pub fn object<T: SimObject>(&self, id: ObjectId) -> Option<&T> {
        self.fabric.object::<T>(id)
    }

    pub fn object_mut<T: SimObject>(&mut self, id: ObjectId) -> Option<&mut T> {
        self.fabric.object_mut::<T>(id)
    }

    pub fn dump_stats(&self, sink: &mut dyn StatsSink) {
        sink.record(&format!("{}.ticks", self.name), self.now());
        sink.record(&format!("{}.total_insts", self.name), self.total_num_insts());
        self.fabric.dump_stats(sink);
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("name", &self.name)
            .field("fabric", &self.fabric)
            .field("contexts", &self.thread_contexts.len())
            .finish()
    }
}
