//! Probabilistic decision machinery for fault injection.

use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of uniform random draws.
///
/// One instance is shared by every in-flight request; implementations must
/// support concurrent draws without skewing the distribution. Substitutable
/// so a test run can script its draws.
pub trait DrawSource: Send + Sync {
    /// Uniform draw from the closed interval `[0, upper]`.
    fn draw(&self, upper: u64) -> u64;
}

/// Default draw source backed by the thread-local generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRngSource;

impl DrawSource for ThreadRngSource {
    fn draw(&self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..=upper)
    }
}

/// Deterministic draw source replaying a fixed script of values.
///
/// Intended for tests; panics when the script runs dry or a scripted value
/// falls outside the requested range.
pub struct ScriptedDraws {
    script: Mutex<VecDeque<u64>>,
}

impl ScriptedDraws {
    pub fn new(values: impl IntoIterator<Item = u64>) -> Self {
        Self {
            script: Mutex::new(values.into_iter().collect()),
        }
    }
}

impl DrawSource for ScriptedDraws {
    fn draw(&self, upper: u64) -> u64 {
        let value = self
            .script
            .lock()
            .expect("draw script lock poisoned")
            .pop_front()
            .expect("draw script exhausted");
        assert!(
            value <= upper,
            "scripted draw {value} outside 0..={upper}"
        );
        value
    }
}

/// How a failing request is failed.
///
/// Chosen per failing decision, independent of the percent draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Tear the connection down with no response.
    AbortConnection,
    /// Answer with 503, or overwrite an existing answer with it.
    ServiceUnavailable,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::AbortConnection => "abort_connection",
            FailureKind::ServiceUnavailable => "service_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stateless chaos decisions over a shared draw source.
#[derive(Clone)]
pub struct DecisionEngine {
    draws: Arc<dyn DrawSource>,
}

impl DecisionEngine {
    pub fn new(draws: Arc<dyn DrawSource>) -> Self {
        Self { draws }
    }

    /// Whether a request should fail at the given percentage.
    ///
    /// Draws over exactly 100 values, so 0 never fails and 100 always does.
    pub fn should_fail(&self, percent: u8) -> bool {
        self.draws.draw(99) < u64::from(percent)
    }

    /// Uniform 50/50 choice between the two failure kinds.
    pub fn pick_failure_kind(&self) -> FailureKind {
        if self.draws.draw(1) == 0 {
            FailureKind::AbortConnection
        } else {
            FailureKind::ServiceUnavailable
        }
    }

    /// Uniform delay from `[0, max]` at millisecond granularity.
    ///
    /// The configured maximum itself is reachable.
    pub fn sample_latency(&self, max: Duration) -> Duration {
        let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(self.draws.draw(max_ms))
    }
}
