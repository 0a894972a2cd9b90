//! Gateway assembly: compiles the route table and dispatches requests.

use crate::config::{build_chaos, Config, RouteConfig, Settings};
use crate::decision::{DecisionEngine, DrawSource};
use crate::pipeline::{Forwarder, Outcome, RequestContext, RoutePipeline};
use crate::telemetry::EventSink;
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One compiled entry of the route table.
pub struct GatewayRoute {
    config: RouteConfig,
    /// `None` when the route carries no chaos settings: pure pass-through.
    pipeline: Option<RoutePipeline>,
}

impl GatewayRoute {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn upstream(&self) -> &str {
        &self.config.upstream
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Option<&RoutePipeline> {
        self.pipeline.as_ref()
    }

    pub fn injected_count(&self) -> u64 {
        self.pipeline.as_ref().map_or(0, RoutePipeline::injected_count)
    }
}

/// The fault-injection gateway: an immutable route table compiled once at
/// startup and consulted by every request.
pub struct ChaosGateway {
    settings: Settings,
    routes: Vec<GatewayRoute>,
    requests_total: AtomicU64,
}

impl std::fmt::Debug for ChaosGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosGateway")
            .field("settings", &self.settings)
            .field("routes", &self.routes.len())
            .field("requests_total", &self.requests_total)
            .finish()
    }
}

impl ChaosGateway {
    /// Compile every configured route.
    ///
    /// A route with invalid chaos settings is fatal; all such errors across
    /// the whole table are reported together, and the gateway refuses to
    /// start rather than serve a malformed chaos route.
    pub fn new(
        config: Config,
        draws: Arc<dyn DrawSource>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let engine = DecisionEngine::new(draws);
        let mut routes = Vec::with_capacity(config.routes.len());
        let mut errors = Vec::new();

        for route in &config.routes {
            match build_chaos(&route.chaos) {
                Ok(chaos) => {
                    let pipeline = chaos.map(|chaos| {
                        RoutePipeline::new(
                            route.name.clone(),
                            chaos,
                            engine.clone(),
                            Arc::clone(&sink),
                            config.settings.dry_run,
                        )
                    });
                    routes.push(GatewayRoute {
                        config: route.clone(),
                        pipeline,
                    });
                }
                Err(error) => errors.push(format!("route {}: {error}", route.name)),
            }
        }

        if !errors.is_empty() {
            bail!(
                "refusing to start with malformed chaos routes: {}",
                errors.join("; ")
            );
        }

        let chaos_routes = routes.iter().filter(|r| r.pipeline.is_some()).count();
        info!(
            routes = routes.len(),
            chaos_routes,
            enabled = config.settings.enabled,
            dry_run = config.settings.dry_run,
            "chaos gateway initialized"
        );

        Ok(Self {
            settings: config.settings,
            routes,
            requests_total: AtomicU64::new(0),
        })
    }

    /// Look up a compiled route by name.
    pub fn route(&self, name: &str) -> Option<&GatewayRoute> {
        self.routes.iter().find(|r| r.config.name == name)
    }

    pub fn routes(&self) -> &[GatewayRoute] {
        &self.routes
    }

    /// Run the chaos pipeline for one request against a registered route.
    ///
    /// Chaos-free routes and a disabled gateway forward untouched with zero
    /// events. Dispatching an unregistered name is a wiring bug in the
    /// embedding engine and errors out.
    pub async fn dispatch(
        &self,
        route_name: &str,
        cx: &mut RequestContext,
        upstream: &dyn Forwarder,
    ) -> Result<Outcome> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let Some(route) = self.route(route_name) else {
            bail!("dispatch against unregistered route: {route_name}");
        };

        if !self.settings.enabled {
            debug!(route = route_name, "chaos disabled globally");
            return pass_through(cx, upstream).await;
        }

        match &route.pipeline {
            Some(pipeline) => pipeline.run(cx, upstream).await,
            None => {
                debug!(route = route_name, "no chaos configured, proxying untouched");
                pass_through(cx, upstream).await
            }
        }
    }

    /// Total requests dispatched through the gateway.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Total faults injected across all routes, delays included.
    pub fn total_faults_injected(&self) -> u64 {
        self.routes.iter().map(GatewayRoute::injected_count).sum()
    }
}

async fn pass_through(cx: &mut RequestContext, upstream: &dyn Forwarder) -> Result<Outcome> {
    upstream.forward(cx).await?;
    cx.forwarded = true;
    Ok(Outcome::Respond(cx.status.unwrap_or(200)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        RouteChaos, BEFORE_REQUEST_FAILURE_PERCENT, BEFORE_REQUEST_MAX_LATENCY,
    };
    use crate::decision::ThreadRngSource;
    use crate::telemetry::MemorySink;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct CountingForwarder {
        calls: AtomicU64,
        status: u16,
    }

    impl CountingForwarder {
        fn new(status: u16) -> Self {
            Self {
                calls: AtomicU64::new(0),
                status,
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl Forwarder for CountingForwarder {
        async fn forward(&self, cx: &mut RequestContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            cx.set_status(self.status);
            Ok(())
        }
    }

    fn route_config(name: &str, chaos: &[(&str, &str)]) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            path_prefix: format!("/{name}"),
            methods: vec![],
            upstream: format!("http://{name}:8080"),
            chaos: chaos
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn gateway_config(routes: Vec<RouteConfig>) -> Config {
        Config {
            settings: Settings::default(),
            routes,
        }
    }

    fn build(config: Config, sink: Arc<MemorySink>) -> ChaosGateway {
        ChaosGateway::new(config, Arc::new(ThreadRngSource), sink).unwrap()
    }

    #[test]
    fn test_compiles_chaos_and_pass_through_routes() {
        let config = gateway_config(vec![
            route_config("orders", &[(BEFORE_REQUEST_FAILURE_PERCENT, "25")]),
            route_config("loyalty", &[]),
        ]);
        let gateway = build(config, Arc::new(MemorySink::new()));

        assert_eq!(gateway.routes().len(), 2);
        let orders = gateway.route("orders").unwrap();
        assert_eq!(
            orders.pipeline().unwrap().chaos(),
            &RouteChaos {
                before_request_failure: Some(25),
                ..RouteChaos::default()
            }
        );
        assert!(gateway.route("loyalty").unwrap().pipeline().is_none());
        assert!(gateway.route("missing").is_none());
    }

    #[test]
    fn test_build_aggregates_errors_across_routes() {
        let config = gateway_config(vec![
            route_config("orders", &[(BEFORE_REQUEST_FAILURE_PERCENT, "150")]),
            route_config("menu", &[(BEFORE_REQUEST_MAX_LATENCY, "-1s")]),
        ]);
        let error = ChaosGateway::new(
            config,
            Arc::new(ThreadRngSource),
            Arc::new(MemorySink::new()),
        )
        .unwrap_err()
        .to_string();

        assert!(error.contains("orders"));
        assert!(error.contains(BEFORE_REQUEST_FAILURE_PERCENT));
        assert!(error.contains("menu"));
        assert!(error.contains(BEFORE_REQUEST_MAX_LATENCY));
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_route_errors() {
        let gateway = build(gateway_config(vec![]), Arc::new(MemorySink::new()));
        let upstream = CountingForwarder::new(200);
        let (_handle, mut cx) = RequestContext::new(&HashMap::new());

        assert!(gateway.dispatch("ghost", &mut cx, &upstream).await.is_err());
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_chaos_free_route_passes_through() {
        let sink = Arc::new(MemorySink::new());
        let gateway = build(
            gateway_config(vec![route_config("loyalty", &[])]),
            Arc::clone(&sink),
        );
        let upstream = CountingForwarder::new(200);
        let (_handle, mut cx) = RequestContext::new(&HashMap::new());

        let outcome = gateway.dispatch("loyalty", &mut cx, &upstream).await.unwrap();

        assert_eq!(outcome, Outcome::Respond(200));
        assert_eq!(cx.status, Some(200));
        assert_eq!(upstream.calls(), 1);
        assert!(sink.is_empty());
        assert_eq!(gateway.total_requests(), 1);
        assert_eq!(gateway.total_faults_injected(), 0);
    }

    #[tokio::test]
    async fn test_always_failing_route_never_reaches_upstream() {
        let sink = Arc::new(MemorySink::new());
        let gateway = build(
            gateway_config(vec![route_config(
                "orders",
                &[(BEFORE_REQUEST_FAILURE_PERCENT, "100")],
            )]),
            Arc::clone(&sink),
        );
        let upstream = CountingForwarder::new(200);

        for _ in 0..20 {
            let (_handle, mut cx) = RequestContext::new(&HashMap::new());
            let outcome = gateway.dispatch("orders", &mut cx, &upstream).await.unwrap();
            assert!(
                matches!(outcome, Outcome::Abort | Outcome::Respond(503)),
                "unexpected outcome: {outcome:?}"
            );
        }

        assert_eq!(upstream.calls(), 0);
        assert_eq!(gateway.total_requests(), 20);
        assert_eq!(gateway.total_faults_injected(), 20);
        assert_eq!(sink.len(), 20);
    }

    #[tokio::test]
    async fn test_kill_switch_disables_all_chaos() {
        let sink = Arc::new(MemorySink::new());
        let mut config = gateway_config(vec![route_config(
            "orders",
            &[(BEFORE_REQUEST_FAILURE_PERCENT, "100")],
        )]);
        config.settings.enabled = false;
        let gateway = build(config, Arc::clone(&sink));
        let upstream = CountingForwarder::new(200);
        let (_handle, mut cx) = RequestContext::new(&HashMap::new());

        let outcome = gateway.dispatch("orders", &mut cx, &upstream).await.unwrap();

        assert_eq!(outcome, Outcome::Respond(200));
        assert_eq!(upstream.calls(), 1);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_forwards_despite_certain_failure() {
        let sink = Arc::new(MemorySink::new());
        let mut config = gateway_config(vec![route_config(
            "orders",
            &[(BEFORE_REQUEST_FAILURE_PERCENT, "100")],
        )]);
        config.settings.dry_run = true;
        let gateway = build(config, Arc::clone(&sink));
        let upstream = CountingForwarder::new(200);
        let (_handle, mut cx) = RequestContext::new(&HashMap::new());

        let outcome = gateway.dispatch("orders", &mut cx, &upstream).await.unwrap();

        assert_eq!(outcome, Outcome::Respond(200));
        assert_eq!(upstream.calls(), 1);
        // The draw still happened and was recorded.
        assert_eq!(sink.len(), 1);
        assert_eq!(gateway.total_faults_injected(), 1);
    }

    #[tokio::test]
    async fn test_bypass_header_on_always_failing_route() {
        let sink = Arc::new(MemorySink::new());
        let gateway = build(
            gateway_config(vec![route_config(
                "orders",
                &[(BEFORE_REQUEST_FAILURE_PERCENT, "100")],
            )]),
            Arc::clone(&sink),
        );
        let upstream = CountingForwarder::new(200);
        let headers = HashMap::from([(
            crate::pipeline::STAND_DOWN_HEADER.to_string(),
            "true".to_string(),
        )]);
        let (_handle, mut cx) = RequestContext::new(&headers);

        let outcome = gateway.dispatch("orders", &mut cx, &upstream).await.unwrap();

        assert_eq!(outcome, Outcome::Respond(200));
        assert_eq!(cx.status, Some(200));
        assert_eq!(upstream.calls(), 1);
        assert!(sink.is_empty());
    }
}
