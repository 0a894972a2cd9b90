//! Structured events emitted at every evaluated chaos stage.
//!
//! One event per evaluated stage, failing or not, so a downstream sink can
//! compute observed-vs-configured rates. Transporting events beyond the
//! [`EventSink`] boundary is the observability stack's concern.

use crate::decision::FailureKind;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::info;

/// The four injection points around upstream forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LatencyBeforeRequest,
    FailureBeforeRequest,
    FailureAfterResponse,
    LatencyAfterResponse,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::LatencyBeforeRequest => "latency_before_request",
            Stage::FailureBeforeRequest => "failure_before_request",
            Stage::FailureAfterResponse => "failure_after_response",
            Stage::LatencyAfterResponse => "latency_after_response",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDecision {
    /// Latency stage: the sampled delay.
    Delay { delay_ms: u64 },
    /// Failure stage: the draw failed the request.
    Fail,
    /// Failure stage: the draw let the request pass.
    Pass,
}

/// One evaluated chaos stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageEvent {
    pub stage: Stage,
    pub route: String,
    /// The configured parameter: a percentage or a maximum latency.
    pub parameter_value: String,
    pub decision: StageDecision,
    /// Present only on failing draws.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

/// Destination for stage events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: StageEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: StageEvent) {
        match event.failure_kind {
            Some(kind) => info!(
                stage = %event.stage,
                route = %event.route,
                parameter = %event.parameter_value,
                decision = ?event.decision,
                failure_kind = %kind,
                "chaos stage evaluated"
            ),
            None => info!(
                stage = %event.stage,
                route = %event.route,
                parameter = %event.parameter_value,
                decision = ?event.decision,
                "chaos stage evaluated"
            ),
        }
    }
}

/// Recording sink for tests and embedders that batch events themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<StageEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<StageEvent> {
        self.events.lock().expect("event sink lock poisoned").clone()
    }

    /// Drain the recorded events.
    pub fn take(&self) -> Vec<StageEvent> {
        std::mem::take(&mut *self.events.lock().expect("event sink lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: StageEvent) {
        self.events
            .lock()
            .expect("event sink lock poisoned")
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_without_kind_when_passing() {
        let event = StageEvent {
            stage: Stage::FailureBeforeRequest,
            route: "orders".to_string(),
            parameter_value: "25%".to_string(),
            decision: StageDecision::Pass,
            failure_kind: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "failure_before_request");
        assert_eq!(json["route"], "orders");
        assert_eq!(json["parameter_value"], "25%");
        assert_eq!(json["decision"], "pass");
        assert!(json.get("failure_kind").is_none());
    }

    #[test]
    fn test_event_serializes_kind_on_failing_draw() {
        let event = StageEvent {
            stage: Stage::FailureAfterResponse,
            route: "orders".to_string(),
            parameter_value: "100%".to_string(),
            decision: StageDecision::Fail,
            failure_kind: Some(FailureKind::ServiceUnavailable),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["decision"], "fail");
        assert_eq!(json["failure_kind"], "service_unavailable");
    }

    #[test]
    fn test_delay_decision_carries_sampled_millis() {
        let event = StageEvent {
            stage: Stage::LatencyAfterResponse,
            route: "menu".to_string(),
            parameter_value: "2000ms".to_string(),
            decision: StageDecision::Delay { delay_ms: 371 },
            failure_kind: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["decision"]["delay"]["delay_ms"], 371);
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        for stage in [Stage::LatencyBeforeRequest, Stage::FailureBeforeRequest] {
            sink.record(StageEvent {
                stage,
                route: "orders".to_string(),
                parameter_value: String::new(),
                decision: StageDecision::Pass,
                failure_kind: None,
            });
        }

        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, Stage::LatencyBeforeRequest);
        assert_eq!(events[1].stage, Stage::FailureBeforeRequest);
        assert!(sink.is_empty());
    }
}
