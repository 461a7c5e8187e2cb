//! Render safety guard.
//!
//! ## Guard Invariants
//!
//! 1. **Depth bound**: a subtree deeper than `max_depth` is never
//!    interpreted. At most `max_fallbacks_per_tick` visible fallbacks are
//!    produced per tick; the rest render nothing.
//! 2. **Tick budget**: every interpreter invocation counts. Once
//!    `max_calls_per_tick` is exceeded the guard stays halted until the next
//!    tick boundary, and the trip is logged once.
//! 3. **Bounded cadence**: counters reset on the configured `TickCadence`,
//!    never from inside the interpreter's recursion.

use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crate::config::{RenderConfig, TickCadence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Proceed,
    DepthExceeded { show_fallback: bool },
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardSnapshot {
    pub calls: usize,
    pub fallbacks_shown: usize,
    pub halted: bool,
    /// Tick boundaries observed since construction.
    pub ticks: u64,
}

#[derive(Debug)]
struct GuardState {
    calls: usize,
    fallbacks_shown: usize,
    halted: bool,
    ticks: u64,
    window_start: Instant,
}

impl GuardState {
    fn reset(&mut self, now: Instant) {
        self.calls = 0;
        self.fallbacks_shown = 0;
        self.halted = false;
        self.ticks += 1;
        self.window_start = now;
    }
}

#[derive(Debug)]
pub struct RenderGuard {
    max_depth: usize,
    max_calls: usize,
    max_fallbacks: usize,
    cadence: TickCadence,
    state: Mutex<GuardState>,
}

impl RenderGuard {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_calls: config.max_calls_per_tick,
            max_fallbacks: config.max_fallbacks_per_tick,
            cadence: config.tick,
            state: Mutex::new(GuardState {
                calls: 0,
                fallbacks_shown: 0,
                halted: false,
                ticks: 0,
                window_start: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interval cadence resets lazily, on the first pass boundary after the
    /// window. A pass that outlives the window keeps its budget.
    fn roll_interval(&self, state: &mut GuardState) {
        if let Some(interval) = self.cadence.interval() {
            let now = Instant::now();
            if now.duration_since(state.window_start) >= interval {
                state.reset(now);
            }
        }
    }

    /// Account for one interpreter invocation at `depth`.
    pub fn enter(&self, depth: usize) -> GuardDecision {
        let mut state = self.lock();
        if state.halted {
            return GuardDecision::Halted;
        }

        state.calls += 1;
        if state.calls > self.max_calls {
            state.halted = true;
            tracing::error!(
                calls = state.calls,
                limit = self.max_calls,
                "render budget exceeded; halting interpretation until the next tick"
            );
            return GuardDecision::Halted;
        }

        if depth > self.max_depth {
            let show_fallback = state.fallbacks_shown < self.max_fallbacks;
            if show_fallback {
                state.fallbacks_shown += 1;
            }
            return GuardDecision::DepthExceeded { show_fallback };
        }

        GuardDecision::Proceed
    }

    /// Host tick boundary. Always resets, whatever the cadence.
    pub fn tick(&self) {
        self.lock().reset(Instant::now());
    }

    /// Called at the start of every top-level render.
    pub fn begin_render(&self) {
        let mut state = self.lock();
        match self.cadence {
            TickCadence::PerRender => state.reset(Instant::now()),
            TickCadence::Interval { .. } => self.roll_interval(&mut state),
            TickCadence::Manual => {}
        }
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let state = self.lock();
        GuardSnapshot {
            calls: state.calls,
            fallbacks_shown: state.fallbacks_shown,
            halted: state.halted,
            ticks: state.ticks,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }
}
