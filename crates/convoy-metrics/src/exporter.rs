//! Scrape endpoint
//!
//! Serves current metrics in a text exposition format over HTTP, plus
//! `/health` and `/info`. Security headers go on every response; access
//! can be gated by basic auth or an IP allowlist.

use crate::collector::{MetricsSnapshot, MetricsSource};
use crate::store::TimeSeriesStore;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Requests slower than this land in the slow-request log
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(2);
/// Slow-request log bound
const SLOW_LOG_CAPACITY: usize = 10;

/// Scrape server configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Scrape path
    pub path: String,
    pub port: u16,
    /// Environment name echoed on `/health`
    pub environment: String,
    /// Optional `(user, password)` gate
    pub basic_auth: Option<(String, String)>,
    /// Optional client allowlist; loopback is always allowed
    pub ip_allowlist: Option<Vec<std::net::IpAddr>>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            path: "/metrics".into(),
            port: 9090,
            environment: "development".into(),
            basic_auth: None,
            ip_allowlist: None,
        }
    }
}

/// Server startup or runtime error
#[derive(Debug, Error)]
pub enum ServerError {
    /// Port could not be bound; surfaced immediately
    #[error("server startup error: failed to bind port {port}: {message}")]
    Bind { port: u16, message: String },
    /// Serve loop failed
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// One slow request
#[derive(Debug, Clone, Serialize)]
pub struct SlowRequest {
    pub path: String,
    pub duration_ms: u64,
    /// Unix seconds
    pub timestamp: i64,
}

struct AppState {
    source: Arc<dyn MetricsSource>,
    store: Option<Arc<TimeSeriesStore>>,
    config: ExporterConfig,
    started_at: Instant,
    slow_log: RwLock<VecDeque<SlowRequest>>,
}

impl AppState {
    fn degraded(&self) -> bool {
        match &self.store {
            Some(store) => store.stats().is_err(),
            None => false,
        }
    }
}

/// Pull-scrape HTTP server
pub struct ScrapeServer {
    state: Arc<AppState>,
}

impl ScrapeServer {
    /// Server over a metrics source, optionally backed by the store for
    /// degradation reporting
    pub fn new(
        source: Arc<dyn MetricsSource>,
        store: Option<Arc<TimeSeriesStore>>,
        config: ExporterConfig,
    ) -> Self {
        Self {
            state: Arc::new(AppState {
                source,
                store,
                config,
                started_at: Instant::now(),
                slow_log: RwLock::new(VecDeque::new()),
            }),
        }
    }

    /// The router, for embedding or tests
    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let scrape_path = state.config.path.clone();
        Router::new()
            .route(&scrape_path, get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/info", get(info_handler))
            .layer(middleware::from_fn_with_state(state.clone(), access_gate))
            .layer(middleware::from_fn_with_state(state.clone(), observe_request))
            .layer(tower_http::cors::CorsLayer::permissive())
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind and serve until shutdown
    pub async fn serve(self) -> Result<(), ServerError> {
        let port = self.state.config.port;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind { port, message: e.to_string() })?;
        tracing::info!(%addr, "scrape endpoint listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.degraded() {
        return (StatusCode::SERVICE_UNAVAILABLE, "storage degraded\n").into_response();
    }
    let body = match state.source.latest() {
        Some(snapshot) => render_exposition(&snapshot),
        None => String::new(),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let now = chrono::Utc::now().timestamp();
    if state.degraded() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(json!({
                "status": "degraded",
                "timestamp": now,
                "version": env!("CARGO_PKG_VERSION"),
                "environment": state.config.environment,
            })),
        )
            .into_response();
    }
    axum::Json(json!({
        "status": "healthy",
        "timestamp": now,
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
    }))
    .into_response()
}

async fn info_handler(State(state): State<Arc<AppState>>) -> Response {
    let slow: Vec<SlowRequest> = state.slow_log.read().iter().cloned().collect();
    axum::Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.config.port,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "slow_requests": slow,
    }))
    .into_response()
}

/// Basic-auth / IP-allowlist gate
async fn access_gate(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Some(allowlist) = &state.config.ip_allowlist {
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        // absent connect info means an embedded router; treat as loopback
        let allowed = match client {
            Some(ip) => ip.is_loopback() || allowlist.contains(&ip),
            None => true,
        };
        if !allowed {
            return (StatusCode::FORBIDDEN, "forbidden\n").into_response();
        }
    }

    if let Some((user, password)) = &state.config.basic_auth {
        let expected = format!("Basic {}", basic_credentials(user, password));
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"convoy\"")],
                "unauthorized\n",
            )
                .into_response();
        }
    }

    next.run(request).await
}

/// Security headers plus the slow-request log
async fn observe_request(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let mut response = next.run(request).await;

    let elapsed = started.elapsed();
    if elapsed > SLOW_REQUEST_THRESHOLD {
        let mut log = state.slow_log.write();
        log.push_back(SlowRequest {
            path,
            duration_ms: elapsed.as_millis() as u64,
            timestamp: chrono::Utc::now().timestamp(),
        });
        while log.len() > SLOW_LOG_CAPACITY {
            log.pop_front();
        }
    }

    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

fn basic_credentials(user: &str, password: &str) -> String {
    use base64::Engine as _;
    // RFC 7617 credentials form
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
}

/// Render a snapshot as text exposition lines with `# HELP` / `# TYPE`
/// directives per family, `{service="…"}` labels, and ms timestamps
pub fn render_exposition(snapshot: &MetricsSnapshot) -> String {
    let ts_ms = snapshot.meta.collected_at * 1000;
    let mut out = String::new();

    struct Family<'a> {
        name: &'a str,
        help: &'a str,
        value: Box<dyn Fn(&crate::collector::ServiceMetrics) -> Option<f64> + 'a>,
    }
    let families = [
        Family {
            name: "convoy_cpu_percent",
            help: "Container CPU usage percent",
            value: Box::new(|m| m.stats.as_ref().map(|s| s.cpu_percent)),
        },
        Family {
            name: "convoy_memory_percent",
            help: "Container memory usage percent",
            value: Box::new(|m| m.stats.as_ref().map(|s| s.memory_percent)),
        },
        Family {
            name: "convoy_memory_used_bytes",
            help: "Container memory used in bytes",
            value: Box::new(|m| m.stats.as_ref().map(|s| s.memory_used_bytes as f64)),
        },
        Family {
            name: "convoy_network_rx_bytes",
            help: "Network bytes received",
            value: Box::new(|m| m.stats.as_ref().map(|s| s.net_rx_bytes as f64)),
        },
        Family {
            name: "convoy_network_tx_bytes",
            help: "Network bytes transmitted",
            value: Box::new(|m| m.stats.as_ref().map(|s| s.net_tx_bytes as f64)),
        },
        Family {
            name: "convoy_response_time_ms",
            help: "Health endpoint response time in milliseconds",
            value: Box::new(|m| m.probe.response_time_ms),
        },
        Family {
            name: "convoy_service_up",
            help: "Whether the service answered its health probe",
            value: Box::new(|m| Some(if m.probe.is_ok() { 1.0 } else { 0.0 })),
        },
    ];

    for family in &families {
        let lines: Vec<String> = snapshot
            .services
            .iter()
            .filter_map(|(service, metrics)| {
                (family.value)(metrics).map(|value| {
                    format!(
                        "{}{{service=\"{service}\"}} {value} {ts_ms}\n",
                        family.name
                    )
                })
            })
            .collect();
        if lines.is_empty() {
            continue;
        }
        out.push_str(&format!("# HELP {} {}\n", family.name, family.help));
        out.push_str(&format!("# TYPE {} gauge\n", family.name));
        for line in lines {
            out.push_str(&line);
        }
    }

    out.push_str("# HELP convoy_system_avg_cpu_percent Average CPU across services\n");
    out.push_str("# TYPE convoy_system_avg_cpu_percent gauge\n");
    out.push_str(&format!(
        "convoy_system_avg_cpu_percent {} {ts_ms}\n",
        snapshot.system.avg_cpu_percent
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{ServiceMetrics, ServiceProbe, SnapshotMeta, SystemAverages};
    use crate::store::MemoryKeyspace;
    use axum_test::TestServer;
    use convoy_compose::ContainerStats;
    use std::collections::BTreeMap;

    struct FixedSource(Option<Arc<MetricsSnapshot>>);

    impl MetricsSource for FixedSource {
        fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
            self.0.clone()
        }
    }

    fn snapshot() -> Arc<MetricsSnapshot> {
        let mut services = BTreeMap::new();
        services.insert(
            "gateway".to_string(),
            ServiceMetrics {
                service: "gateway".into(),
                stats: Some(ContainerStats {
                    cpu_percent: 12.5,
                    memory_percent: 40.0,
                    memory_used_bytes: 1024,
                    ..Default::default()
                }),
                probe: ServiceProbe {
                    response_time_ms: Some(8.0),
                    status: "ok".into(),
                    http_status: Some(200),
                },
                custom: Default::default(),
                error: None,
            },
        );
        Arc::new(MetricsSnapshot {
            services,
            system: SystemAverages {
                avg_cpu_percent: 12.5,
                avg_memory_percent: 40.0,
                avg_response_time_ms: 8.0,
            },
            meta: SnapshotMeta {
                collected_at: 1_000,
                duration_ms: 5,
                services_total: 1,
                healthy: 1,
                unhealthy: 0,
                from_cache: false,
            },
        })
    }

    fn server(config: ExporterConfig) -> TestServer {
        let store = Arc::new(TimeSeriesStore::new(Arc::new(MemoryKeyspace::new())));
        let scrape = ScrapeServer::new(Arc::new(FixedSource(Some(snapshot()))), Some(store), config);
        TestServer::new(scrape.router()).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let server = server(ExporterConfig::default());
        let response = server.get("/metrics").await;
        response.assert_status_ok();

        let body = response.text();
        assert!(body.contains("# HELP convoy_cpu_percent"));
        assert!(body.contains("# TYPE convoy_cpu_percent gauge"));
        assert!(body.contains("convoy_cpu_percent{service=\"gateway\"} 12.5 1000000"));
        assert!(body.contains("convoy_service_up{service=\"gateway\"} 1"));
    }

    #[tokio::test]
    async fn test_security_headers_on_every_response() {
        let server = server(ExporterConfig::default());
        for path in ["/metrics", "/health", "/info"] {
            let response = server.get(path).await;
            assert_eq!(
                response.headers().get("x-content-type-options").unwrap(),
                "nosniff"
            );
            assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
            assert!(response.headers().get("referrer-policy").is_some());
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let server = server(ExporterConfig {
            environment: "test".into(),
            ..Default::default()
        });
        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["environment"], "test");
    }

    #[tokio::test]
    async fn test_info_reports_uptime_and_port() {
        let server = server(ExporterConfig { port: 9191, ..Default::default() });
        let body: serde_json::Value = server.get("/info").await.json();
        assert_eq!(body["port"], 9191);
        assert!(body["uptime_seconds"].is_number());
        assert!(body["slow_requests"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_basic_auth_gate() {
        let server = server(ExporterConfig {
            basic_auth: Some(("metrics".into(), "s3cret".into())),
            ..Default::default()
        });
        let denied = server.get("/metrics").await;
        denied.assert_status(StatusCode::UNAUTHORIZED);

        let allowed = server
            .get("/metrics")
            .add_header(
                header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Basic {}", basic_credentials("metrics", "s3cret")))
                    .unwrap(),
            )
            .await;
        allowed.assert_status_ok();
    }

    #[tokio::test]
    async fn test_ip_allowlist_permits_embedded_router() {
        // without connect info the router is embedded; the gate lets it through
        let server = server(ExporterConfig {
            ip_allowlist: Some(vec!["10.0.0.8".parse().unwrap()]),
            ..Default::default()
        });
        server.get("/metrics").await.assert_status_ok();
    }

    #[test]
    fn test_basic_credentials_encoding() {
        assert_eq!(basic_credentials("metrics", "s3cret"), "bWV0cmljczpzM2NyZXQ=");
    }

    #[tokio::test]
    async fn test_empty_source_serves_empty_body() {
        let scrape = ScrapeServer::new(
            Arc::new(FixedSource(None)),
            None,
            ExporterConfig::default(),
        );
        let server = TestServer::new(scrape.router()).unwrap();
        let response = server.get("/metrics").await;
        response.assert_status_ok();
        assert!(response.text().is_empty());
    }
}
