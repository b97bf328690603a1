//! Per-backend circuit breaker.
//!
//! Three states: `Closed` passes traffic, `Open` fails fast until the reset
//! timeout elapses, `HalfOpen` admits a bounded number of probes. Failures
//! are remembered as timestamps pruned to the trailing monitor window, so a
//! burst of old failures cannot trip the breaker later. Every mutator
//! serialises on one internal mutex; distinct breakers are independent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerSettings;
use portcullis_core::clock::Clock;

const TRANSITION_LOG_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// One recorded state change, kept in a bounded log for the health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at_millis: u64,
}

/// Point-in-time view exposed through `/gateway/health`.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub recent_failures: usize,
    pub rejected: u64,
    pub opened_at_millis: Option<u64>,
    pub transitions: Vec<TransitionRecord>,
}

struct Inner {
    state: BreakerState,
    failures: VecDeque<u64>,
    opened_at: u64,
    half_open_attempts: u32,
    rejected: u64,
    transitions: VecDeque<TransitionRecord>,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            settings,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: 0,
                half_open_attempts: 0,
                rejected: 0,
                transitions: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gate called before each proxy attempt. In `Open`, the caller that
    /// observes the reset timeout expiring is admitted as the single probe.
    pub fn can_request(&self) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.tick(&mut inner, now);

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                inner.rejected += 1;
                false
            }
            BreakerState::HalfOpen => {
                if inner.half_open_attempts < self.settings.half_open_max {
                    inner.half_open_attempts += 1;
                    true
                } else {
                    inner.rejected += 1;
                    false
                }
            }
        }
    }

    pub fn on_success(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");

        if inner.state == BreakerState::HalfOpen {
            inner.failures.clear();
            inner.half_open_attempts = 0;
            self.transition(&mut inner, BreakerState::Closed, now);
        }
    }

    pub fn on_failure(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");

        inner.failures.push_back(now);
        self.prune(&mut inner, now);

        match inner.state {
            BreakerState::HalfOpen => {
                inner.opened_at = now;
                self.transition(&mut inner, BreakerState::Open, now);
            }
            BreakerState::Closed => {
                if inner.failures.len() as u32 >= self.settings.failure_threshold {
                    inner.opened_at = now;
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state; observing it may fire the timed `Open -> HalfOpen`
    /// transition, in which case no probe slot is consumed here.
    pub fn state(&self) -> BreakerState {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.tick(&mut inner, now);
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.tick(&mut inner, now);
        self.prune(&mut inner, now);

        BreakerStats {
            state: inner.state,
            recent_failures: inner.failures.len(),
            rejected: inner.rejected,
            opened_at_millis: match inner.state {
                BreakerState::Closed => None,
                _ => Some(inner.opened_at),
            },
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    /// Forces the breaker back to `Closed` and clears its failure log.
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.failures.clear();
        inner.half_open_attempts = 0;
        inner.opened_at = 0;
        self.transition(&mut inner, BreakerState::Closed, now);
    }

    fn tick(&self, inner: &mut Inner, now: u64) {
        if inner.state == BreakerState::Open
            && now.saturating_sub(inner.opened_at) >= self.settings.reset_timeout.as_millis() as u64
        {
            inner.half_open_attempts = 0;
            self.transition(inner, BreakerState::HalfOpen, now);
        }
    }

    fn prune(&self, inner: &mut Inner, now: u64) {
        let window = self.settings.monitor_window.as_millis() as u64;
        while inner
            .failures
            .front()
            .is_some_and(|&at| at + window <= now)
        {
            inner.failures.pop_front();
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: u64) {
        if inner.state == to {
            return;
        }
        let record = TransitionRecord {
            from: inner.state,
            to,
            at_millis: now,
        };
        if inner.transitions.len() == TRANSITION_LOG_CAPACITY {
            inner.transitions.pop_front();
        }
        inner.transitions.push_back(record);

        match to {
            BreakerState::Open => warn!(backend = %self.name, from = %inner.state, "circuit opened"),
            _ => info!(backend = %self.name, from = %inner.state, to = %to, "circuit transition"),
        }
        inner.state = to;
    }
}
