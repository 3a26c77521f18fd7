//! Main emulation engine.
//!
//! The engine owns the CPU and drives it, handling:
//! - Step execution (one step = one instruction or interrupt delivery)
//! - Breakpoints and debug controls
//! - Step limits and fault capture
//!
//! # Usage
//!
//! ```ignore
//! let mut engine = Engine::new(cpu);
//! engine.step();       // Execute one instruction
//! engine.run(100_000); // Run for up to 100k instructions
//! ```

use crate::cpu::{Cpu, StepResult};
use crate::error::EmuError;

/// Breakpoint definition.
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Instruction-pointer address.
    pub rip: u64,
    /// Whether this breakpoint is enabled.
    pub enabled: bool,
}

impl Breakpoint {
    /// Create a new enabled breakpoint.
    pub fn new(rip: u64) -> Self {
        Self { rip, enabled: true }
    }
}

/// Engine execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Engine has not run yet.
    Idle,
    /// Engine is running.
    Running,
    /// Engine is paused (explicitly, or by the step limit).
    Paused,
    /// Hit a breakpoint.
    Breakpoint {
        /// The address that matched.
        rip: u64,
    },
    /// The CPU halted with nothing pending.
    Halted,
    /// A fatal error stopped the run; see `Engine::last_error`.
    Fault,
}

/// Main emulation engine.
pub struct Engine {
    /// The CPU being driven.
    pub cpu: Cpu,
    /// Breakpoints.
    pub breakpoints: Vec<Breakpoint>,
    /// Current engine status.
    pub status: EngineStatus,
    /// Total steps executed.
    pub total_steps: u64,
    /// Maximum steps before auto-pause (0 = unlimited).
    pub max_steps: u64,
    /// The error that produced a `Fault` status, if any.
    pub last_error: Option<EmuError>,
}

impl Engine {
    /// Create a new engine around a prepared CPU.
    pub fn new(cpu: Cpu) -> Self {
        Self {
            cpu,
            breakpoints: Vec::new(),
            status: EngineStatus::Idle,
            total_steps: 0,
            max_steps: 0,
            last_error: None,
        }
    }

    /// Add a breakpoint.
    pub fn add_breakpoint(&mut self, rip: u64) {
        self.breakpoints.push(Breakpoint::new(rip));
    }

    /// Remove all breakpoints.
    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    fn check_breakpoints(&self) -> Option<u64> {
        let rip = self.cpu.regs.rip;
        self.breakpoints
            .iter()
            .find(|bp| bp.enabled && bp.rip == rip)
            .map(|bp| bp.rip)
    }

    /// Execute one step.
    ///
    /// Returns true if the CPU can make further progress.
    pub fn step(&mut self) -> bool {
        if self.status == EngineStatus::Paused {
            return false;
        }

        // Check for breakpoints before stepping.
        if let Some(rip) = self.check_breakpoints() {
            self.status = EngineStatus::Breakpoint { rip };
            return false;
        }

        match self.cpu.step() {
            Ok(StepResult::Running) => {
                self.total_steps += 1;
                self.status = EngineStatus::Running;

                if self.max_steps > 0 && self.total_steps >= self.max_steps {
                    log::warn!("step limit of {} reached, pausing", self.max_steps);
                    self.status = EngineStatus::Paused;
                    return false;
                }
                true
            }
            Ok(StepResult::Halted) => {
                self.status = EngineStatus::Halted;
                false
            }
            Err(error) => {
                log::error!("fatal fault at 0x{:016X}: {}", self.cpu.regs.rip, error);
                self.last_error = Some(error);
                self.status = EngineStatus::Fault;
                false
            }
        }
    }

    /// Run for up to `max_steps` steps.
    ///
    /// Stops early on halt, breakpoint, or fault. Returns the number of
    /// steps actually executed.
    pub fn run(&mut self, max_steps: u64) -> u64 {
        let start = self.total_steps;
        let limit = self.total_steps.saturating_add(max_steps);

        self.status = EngineStatus::Running;

        while self.total_steps < limit {
            if !self.step() {
                break;
            }
        }

        self.total_steps - start
    }

    /// Pause execution.
    pub fn pause(&mut self) {
        if self.status == EngineStatus::Running {
            self.status = EngineStatus::Paused;
        }
    }

    /// Resume from paused/breakpoint state.
    pub fn resume(&mut self) {
        match self.status {
            EngineStatus::Paused | EngineStatus::Breakpoint { .. } => {
                self.status = EngineStatus::Running;
            }
            _ => {}
        }
    }
}
