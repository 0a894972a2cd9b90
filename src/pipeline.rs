//! The ordered fault-injection pipeline wrapped around upstream forwarding.
//!
//! Stages run in a fixed order within a single request's flow: latency
//! before the request, failure before the request, the external forward,
//! failure after the response, latency after the response. A stage runs only
//! when configured and only while the request is neither cancelled nor
//! bypassed; cancellation during a latency wait unwinds immediately with no
//! further stage.

use crate::config::RouteChaos;
use crate::decision::{DecisionEngine, FailureKind};
use crate::telemetry::{EventSink, Stage, StageDecision, StageEvent};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Request header that disables every chaos stage for one request.
///
/// Lets internal health and validation traffic traverse the gateway
/// untouched while real traffic stays subject to chaos.
pub const STAND_DOWN_HEADER: &str = "x-chaos-stand-down";

/// Whether the request asked the gateway to stand down.
///
/// Only a value that reads as boolean `true` counts; any other value,
/// malformed value, or absence of the header leaves chaos on.
pub fn stand_down_requested(headers: &HashMap<String, String>) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(STAND_DOWN_HEADER))
        .is_some_and(|(_, value)| value.trim().eq_ignore_ascii_case("true"))
}

/// Cancels its paired [`RequestContext`]. The routing engine holds this and
/// fires it on client disconnect.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Per-request state threaded through the pipeline.
///
/// Created when the request arrives, destroyed when it completes.
pub struct RequestContext {
    cancel_rx: watch::Receiver<bool>,
    /// Chaos disabled for this request via the stand-down header.
    pub bypass: bool,
    /// Response status as the caller will see it; `None` until one exists.
    pub status: Option<u16>,
    pub(crate) forwarded: bool,
}

impl RequestContext {
    /// Build a context for one inbound request from its headers.
    pub fn new(headers: &HashMap<String, String>) -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        let handle = CancelHandle { tx: Arc::new(tx) };
        let cx = Self {
            cancel_rx: rx,
            bypass: stand_down_requested(headers),
            status: None,
            forwarded: false,
        };
        (handle, cx)
    }

    /// Whether the client has gone away.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Record the response status produced so far.
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    /// Whether the request reached upstream forwarding.
    pub fn forwarded(&self) -> bool {
        self.forwarded
    }

    /// Resolves when the request is cancelled; pends forever otherwise.
    async fn cancelled(&mut self) {
        while !*self.cancel_rx.borrow() {
            if self.cancel_rx.changed().await.is_err() {
                // Handle dropped without cancelling; nothing left to signal.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// The externally supplied "forward to upstream" call.
///
/// The routing engine owns connection handling, pooling, TLS, and load
/// balancing; the pipeline only decides whether and when to invoke it.
/// Implementations record the upstream status on the context; a forward
/// that records none is treated as 200.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, cx: &mut RequestContext) -> Result<()>;
}

/// Terminal result of running the pipeline for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response goes back to the caller with this status.
    Respond(u16),
    /// The connection is torn down with no response.
    Abort,
    /// The client went away mid-stage; unwound without running later stages.
    Cancelled,
}

enum LatencyWait {
    Completed,
    Cancelled,
}

/// The compiled transform pipeline for one route.
///
/// Immutable after construction and shared by every request on the route.
pub struct RoutePipeline {
    route: String,
    chaos: RouteChaos,
    engine: DecisionEngine,
    sink: Arc<dyn EventSink>,
    dry_run: bool,
    injected: AtomicU64,
}

impl RoutePipeline {
    pub fn new(
        route: impl Into<String>,
        chaos: RouteChaos,
        engine: DecisionEngine,
        sink: Arc<dyn EventSink>,
        dry_run: bool,
    ) -> Self {
        Self {
            route: route.into(),
            chaos,
            engine,
            sink,
            dry_run,
            injected: AtomicU64::new(0),
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn chaos(&self) -> &RouteChaos {
        &self.chaos
    }

    /// Faults this route has injected so far, delays included.
    pub fn injected_count(&self) -> u64 {
        self.injected.load(Ordering::Relaxed)
    }

    /// Run every applicable stage around `upstream` for one request.
    pub async fn run(&self, cx: &mut RequestContext, upstream: &dyn Forwarder) -> Result<Outcome> {
        if cx.bypass {
            debug!(route = %self.route, "stand-down requested, proxying untouched");
            upstream.forward(cx).await?;
            cx.forwarded = true;
            return Ok(Outcome::Respond(cx.status.unwrap_or(200)));
        }

        if let Some(max) = self.chaos.before_request_latency {
            if let LatencyWait::Cancelled = self
                .latency_stage(Stage::LatencyBeforeRequest, max, cx)
                .await
            {
                return Ok(Outcome::Cancelled);
            }
        }

        if let Some(percent) = self.chaos.before_request_failure {
            if cx.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            match self.failure_stage(Stage::FailureBeforeRequest, percent) {
                Some(FailureKind::AbortConnection) => return Ok(Outcome::Abort),
                Some(FailureKind::ServiceUnavailable) => {
                    // Short-circuit: upstream is never consulted.
                    cx.set_status(503);
                    return Ok(Outcome::Respond(503));
                }
                None => {}
            }
        }

        if cx.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        upstream.forward(cx).await?;
        cx.forwarded = true;

        if let Some(percent) = self.chaos.after_response_failure {
            if cx.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            match self.failure_stage(Stage::FailureAfterResponse, percent) {
                // Tearing down after forwarding simulates a truncated response.
                Some(FailureKind::AbortConnection) => return Ok(Outcome::Abort),
                // Overwrites whatever upstream answered; bytes already
                // written to the caller are left as-is.
                Some(FailureKind::ServiceUnavailable) => cx.set_status(503),
                None => {}
            }
        }

        if let Some(max) = self.chaos.after_response_latency {
            if let LatencyWait::Cancelled = self
                .latency_stage(Stage::LatencyAfterResponse, max, cx)
                .await
            {
                return Ok(Outcome::Cancelled);
            }
        }

        Ok(Outcome::Respond(cx.status.unwrap_or(200)))
    }

    /// Sample and apply one latency stage, racing the wait against the
    /// request's cancellation signal.
    async fn latency_stage(
        &self,
        stage: Stage,
        max: Duration,
        cx: &mut RequestContext,
    ) -> LatencyWait {
        if cx.is_cancelled() {
            return LatencyWait::Cancelled;
        }

        let delay = self.engine.sample_latency(max);
        self.sink.record(StageEvent {
            stage,
            route: self.route.clone(),
            parameter_value: format!("{}ms", max.as_millis()),
            decision: StageDecision::Delay {
                delay_ms: delay.as_millis() as u64,
            },
            failure_kind: None,
        });

        if delay.is_zero() {
            return LatencyWait::Completed;
        }
        self.injected.fetch_add(1, Ordering::Relaxed);
        if self.dry_run {
            debug!(route = %self.route, stage = %stage, delay_ms = delay.as_millis() as u64, "dry run, delay not applied");
            return LatencyWait::Completed;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => LatencyWait::Completed,
            _ = cx.cancelled() => LatencyWait::Cancelled,
        }
    }

    /// Evaluate one failure stage. Emits an event whether or not the draw
    /// fails; returns the chosen kind only when a fault should be applied.
    fn failure_stage(&self, stage: Stage, percent: u8) -> Option<FailureKind> {
        let failed = self.engine.should_fail(percent);
        let kind = failed.then(|| self.engine.pick_failure_kind());

        self.sink.record(StageEvent {
            stage,
            route: self.route.clone(),
            parameter_value: format!("{percent}%"),
            decision: if failed {
                StageDecision::Fail
            } else {
                StageDecision::Pass
            },
            failure_kind: kind,
        });

        match kind {
            Some(kind) => {
                self.injected.fetch_add(1, Ordering::Relaxed);
                if self.dry_run {
                    debug!(route = %self.route, stage = %stage, kind = %kind, "dry run, fault not applied");
                    None
                } else {
                    Some(kind)
                }
            }
            None => None,
        }
    }
}
