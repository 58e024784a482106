//! Idle strategies for cooperative poll loops.
//!
//! Stages never block on an empty or full queue; they call `Idler::idle()` and
//! poll again. The strategy decides how that wait is spent.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// How a poll loop waits between unproductive iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum IdleStrategy {
    /// Sleep a fixed number of microseconds.
    Sleep { micros: u64 },
    /// Sleep, doubling from `min_micros` up to `max_micros` while idle.
    Backoff { min_micros: u64, max_micros: u64 },
    /// Give up the time slice.
    Yield,
    /// Busy-spin with a CPU hint.
    Spin,
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Sleep {
            micros: defaults::IDLE_SLEEP_MICROS,
        }
    }
}

impl IdleStrategy {
    /// Creates the stateful waiter for one poll loop.
    pub fn idler(self) -> Idler {
        Idler {
            strategy: self,
            current_micros: 0,
        }
    }
}

/// Per-loop idle state (backoff progress).
#[derive(Debug, Clone)]
pub struct Idler {
    strategy: IdleStrategy,
    current_micros: u64,
}

impl Idler {
    /// Waits once according to the strategy.
    pub fn idle(&mut self) {
        match self.strategy {
            IdleStrategy::Sleep { micros } => thread::sleep(Duration::from_micros(micros)),
            IdleStrategy::Backoff {
                min_micros,
                max_micros,
            } => {
                self.current_micros = if self.current_micros == 0 {
                    min_micros.max(1)
                } else {
                    self.current_micros.saturating_mul(2).min(max_micros.max(1))
                };
                thread::sleep(Duration::from_micros(self.current_micros));
            }
            IdleStrategy::Yield => thread::yield_now(),
            IdleStrategy::Spin => std::hint::spin_loop(),
        }
    }

    /// Resets backoff after a productive iteration.
    pub fn reset(&mut self) {
        self.current_micros = 0;
    }

    /// Current backoff step in microseconds (0 when not backing off).
    pub fn current_micros(&self) -> u64 {
        self.current_micros
    }
}
