// Per-order tracking health
//
// Healthy --(N consecutive poll failures)--> Degraded --(poll ok)--> Healthy
// Any state --(order gone / credentials refused)--> Halted

use serde::{Deserialize, Serialize};
use statig::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthEvent {
    PollSucceeded,
    PollFailed,
    Halt,
}

#[derive(Debug, Default)]
pub struct TrackingHealth {
    pub order_id: String,
    pub consecutive_failures: u32,
    pub degraded_threshold: u32,
    pub degraded: bool,
    pub halted: bool,
}

impl TrackingHealth {
    pub fn new(order_id: String, degraded_threshold: u32) -> Self {
        Self {
            order_id,
            consecutive_failures: 0,
            degraded_threshold: degraded_threshold.max(1),
            degraded: false,
            halted: false,
        }
    }
}

#[state_machine(initial = "State::healthy()", state(derive(Debug, Clone, PartialEq, Eq)))]
impl TrackingHealth {
    #[state]
    fn healthy(&mut self, event: &HealthEvent) -> Outcome<State> {
        match event {
            HealthEvent::PollSucceeded => {
                self.consecutive_failures = 0;
                Handled
            }
            HealthEvent::PollFailed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.degraded_threshold {
                    tracing::error!(
                        order_id = %self.order_id,
                        consecutive_failures = self.consecutive_failures,
                        "Order tracking degraded"
                    );
                    self.degraded = true;
                    Transition(State::degraded())
                } else {
                    Handled
                }
            }
            HealthEvent::Halt => {
                self.halted = true;
                Transition(State::halted())
            }
        }
    }

    #[state]
    fn degraded(&mut self, event: &HealthEvent) -> Outcome<State> {
        match event {
            HealthEvent::PollSucceeded => {
                tracing::info!(
                    order_id = %self.order_id,
                    after_failures = self.consecutive_failures,
                    "Order tracking recovered"
                );
                self.consecutive_failures = 0;
                self.degraded = false;
                Transition(State::healthy())
            }
            HealthEvent::PollFailed => {
                self.consecutive_failures += 1;
                Handled
            }
            HealthEvent::Halt => {
                self.halted = true;
                Transition(State::halted())
            }
        }
    }

    #[state]
    fn halted(&mut self, event: &HealthEvent) -> Outcome<State> {
        let _ = event;
        Handled
    }
}

impl TrackingHealth {
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }
}
