//! HTTP endpoint manager
//!
//! Each configured HTTP endpoint owns one listener. The bind happens
//! synchronously inside [`HttpEndpoint::start`] so a bind failure surfaces
//! immediately and never produces a half-started endpoint. Every request
//! flows auth -> context -> HTML route match -> main pipeline -> templated
//! response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_server::tls_rustls::RustlsConfig;
use regex::Regex;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EndpointConfig, EndpointStatus, HtmlRoute};
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::expr::{self, SubstituteMode};
use crate::pipeline::{self, ContextBuilder, PipelineMode, WebhookRequest};
use crate::tools::ToolRegistry;

/// Maximum accepted request body
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Drain window for graceful stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// An HTML route with its pattern compiled to an anchored regex
struct CompiledRoute {
    regex: Regex,
    param_names: Vec<String>,
    route: HtmlRoute,
}

#[derive(Default)]
struct HttpMetrics {
    requests: AtomicU64,
    auth_failures: AtomicU64,
    pipeline_failures: AtomicU64,
    last_request_at: parking_lot::Mutex<Option<OffsetDateTime>>,
}

/// State shared between the listener task and the request handler
struct HttpShared {
    config: EndpointConfig,
    tools: Arc<ToolRegistry>,
    routes: Vec<CompiledRoute>,
    metrics: HttpMetrics,
}

/// A running HTTP endpoint
pub struct HttpEndpoint {
    shared: Arc<HttpShared>,
    handle: axum_server::Handle,
    cancel: CancellationToken,
    status: parking_lot::Mutex<EndpointStatus>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HttpEndpoint {
    /// Bind the listener and start serving.
    ///
    /// Binding is synchronous: on failure the caller gets `BindError` and
    /// nothing was started.
    pub async fn start(
        config: EndpointConfig,
        tools: Arc<ToolRegistry>,
    ) -> GatewayResult<Arc<Self>> {
        let routes = compile_routes(&config.html_routes)?;

        let address = config.address();
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;

        let tls_config = match &config.tls {
            Some(tls) if tls.enabled => Some(
                RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                    .await
                    .map_err(|e| GatewayError::TlsError {
                        endpoint: config.name.clone(),
                        error: e.to_string(),
                    })?,
            ),
            _ => None,
        };

        let name = config.name.clone();
        let shared = Arc::new(HttpShared {
            config,
            tools,
            routes,
            metrics: HttpMetrics::default(),
        });

        let app = router(shared.clone());
        let handle = axum_server::Handle::new();
        let serve_handle = handle.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let result = match tls_config {
                Some(tls) => {
                    axum_server::from_tcp_rustls(listener, tls)
                        .handle(serve_handle)
                        .serve(service)
                        .await
                }
                None => {
                    axum_server::from_tcp(listener)
                        .handle(serve_handle)
                        .serve(service)
                        .await
                }
            };
            if let Err(e) = result {
                error!(endpoint = %task_name, error = %e, "HTTP listener exited with error");
            }
        });

        info!(
            endpoint = %name,
            address = %address,
            tls = shared.config.is_tls_enabled(),
            "HTTP endpoint listening"
        );

        Ok(Arc::new(Self {
            shared,
            handle,
            cancel: CancellationToken::new(),
            status: parking_lot::Mutex::new(EndpointStatus::Running),
            task: parking_lot::Mutex::new(Some(task)),
        }))
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn status(&self) -> EndpointStatus {
        *self.status.lock()
    }

    /// Stop accepting, drain in-flight requests, release the socket
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        let task = self.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), task)
                .await
                .is_err()
        {
            warn!(endpoint = %self.shared.config.name, "HTTP listener did not drain in time");
        }
        *self.status.lock() = EndpointStatus::Stopped;
        info!(endpoint = %self.shared.config.name, "HTTP endpoint stopped");
    }

    pub fn metrics(&self) -> Value {
        let metrics = &self.shared.metrics;
        json!({
            "requests": metrics.requests.load(Ordering::Relaxed),
            "auth_failures": metrics.auth_failures.load(Ordering::Relaxed),
            "pipeline_failures": metrics.pipeline_failures.load(Ordering::Relaxed),
            "last_request_at": metrics.last_request_at.lock().and_then(|t| {
                t.format(&time::format_description::well_known::Rfc3339).ok()
            }),
        })
    }
}

/// Build the endpoint's router; every path goes through the one handler
fn router(shared: Arc<HttpShared>) -> Router {
    Router::new().fallback(handle_request).with_state(shared)
}

/// Compile `{name}` patterns into anchored regexes
fn compile_routes(routes: &[HtmlRoute]) -> GatewayResult<Vec<CompiledRoute>> {
    static PARAM_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("param regex"));

    routes
        .iter()
        .map(|route| {
            let mut param_names = Vec::new();
            let mut pattern = String::from("^");
            let mut last = 0;
            for caps in PARAM_RE.captures_iter(&route.url_pattern) {
                let m = caps.get(0).expect("whole match");
                pattern.push_str(&regex::escape(&route.url_pattern[last..m.start()]));
                let name = caps.get(1).expect("param name").as_str();
                param_names.push(name.to_string());
                pattern.push_str("(?P<");
                pattern.push_str(name);
                pattern.push_str(">[^/]+)");
                last = m.end();
            }
            pattern.push_str(&regex::escape(&route.url_pattern[last..]));
            pattern.push('$');

            let regex = Regex::new(&pattern).map_err(|e| {
                GatewayError::Config(ConfigError::invalid("html_routes", e))
            })?;
            Ok(CompiledRoute {
                regex,
                param_names,
                route: route.clone(),
            })
        })
        .collect()
}

async fn handle_request(
    State(shared): State<Arc<HttpShared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.to_string();
    let path = parts.uri.path().to_string();

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_lowercase(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let query: Vec<(String, String)> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    shared.metrics.requests.fetch_add(1, Ordering::Relaxed);
    *shared.metrics.last_request_at.lock() = Some(OffsetDateTime::now_utc());

    // Auth happens before any pipeline work and before route matching
    let auth = match shared.config.auth.verify(&headers, &query, &bytes) {
        Ok(outcome) => outcome,
        Err(e) => {
            shared.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %shared.config.name, path = %path, error = %e, "Request rejected at auth");
            return e.into_response();
        }
    };

    let remote_addr = addr.to_string();
    let webhook = WebhookRequest {
        endpoint: &shared.config.name,
        method: &method,
        path: &path,
        remote_addr: &remote_addr,
        headers: &headers,
        query: &query,
        body: parse_body(&bytes),
        auth: serde_json::to_value(&auth).unwrap_or(Value::Null),
    };

    let matched = shared
        .routes
        .iter()
        .find_map(|compiled| compiled.regex.captures(&path).map(|caps| (compiled, caps)));
    if let Some((compiled, caps)) = matched {
        return serve_html(&shared, compiled, caps, webhook).await;
    }

    if path != shared.config.path {
        return error_response(StatusCode::NOT_FOUND, "no such route");
    }

    let ctx = ContextBuilder::new()
        .webhook(webhook)
        .query(&query)
        .build();

    let timeout = Duration::from_secs(shared.config.pipeline_timeout_secs);

    if shared.config.async_mode {
        // Respond first; outputs are absent in the template context, so the
        // lenient render keeps only what the request itself provides
        let response = render_response(&shared.config, &ctx, StatusCode::ACCEPTED);
        let background = shared.clone();
        let background_ctx = ctx;
        tokio::spawn(async move {
            match pipeline::run(
                &background.config.pipeline,
                background_ctx,
                &background.tools,
                PipelineMode::Strict,
                timeout,
            )
            .await
            {
                Ok(outcome) => debug!(
                    endpoint = %background.config.name,
                    steps = outcome.steps.len(),
                    duration_ms = outcome.duration_ms,
                    "Async pipeline completed"
                ),
                Err(e) => {
                    background
                        .metrics
                        .pipeline_failures
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(endpoint = %background.config.name, error = %e, "Async pipeline failed");
                }
            }
        });
        return response;
    }

    match pipeline::run(
        &shared.config.pipeline,
        ctx,
        &shared.tools,
        PipelineMode::Strict,
        timeout,
    )
    .await
    {
        Ok(outcome) => {
            let status = StatusCode::from_u16(shared.config.response_status)
                .unwrap_or(StatusCode::OK);
            render_response(&shared.config, &outcome.context, status)
        }
        Err(e) => {
            shared
                .metrics
                .pipeline_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %shared.config.name, error = %e, "Pipeline failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Run an HTML route's pipeline and render its template file
async fn serve_html(
    shared: &Arc<HttpShared>,
    compiled: &CompiledRoute,
    caps: regex::Captures<'_>,
    webhook: WebhookRequest<'_>,
) -> Response {
    let params: Vec<(&str, &str)> = compiled
        .param_names
        .iter()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.as_str(), m.as_str()))
        })
        .collect();

    let query = webhook.query;
    let ctx = ContextBuilder::new()
        .webhook(webhook)
        .url_params(params)
        .query(query)
        .build();

    let outcome = match pipeline::run(
        &compiled.route.pipeline,
        ctx,
        &shared.tools,
        PipelineMode::Strict,
        Duration::from_secs(shared.config.pipeline_timeout_secs),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            shared
                .metrics
                .pipeline_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(endpoint = %shared.config.name, route = %compiled.route.url_pattern, error = %e, "HTML route pipeline failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let template = match tokio::fs::read_to_string(&compiled.route.template_file).await {
        Ok(template) => template,
        Err(e) => {
            error!(
                endpoint = %shared.config.name,
                template = %compiled.route.template_file.display(),
                error = %e,
                "Failed to read HTML template"
            );
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "template unavailable");
        }
    };

    let mut html = template;
    for (placeholder, template_str) in &compiled.route.placeholder_map {
        let rendered = match expr::substitute(
            &Value::String(template_str.clone()),
            &outcome.context,
            SubstituteMode::Lenient,
        ) {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(_) => template_str.clone(),
        };
        html = html.replace(&format!("{{{{{placeholder}}}}}"), &rendered);
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

/// Render the configured response template against a context.
///
/// Rendering is lenient: a failed expression keeps its template text rather
/// than dropping the response.
fn render_response(
    config: &EndpointConfig,
    ctx: &serde_json::Map<String, Value>,
    status: StatusCode,
) -> Response {
    let body = match &config.response_template {
        Some(template) => expr::substitute(template, ctx, SubstituteMode::Lenient)
            .unwrap_or_else(|_| template.clone()),
        None => json!({"success": true}),
    };

    let mut response = match body {
        Value::String(text) => (status, text).into_response(),
        other => (status, axum::Json(other)).into_response(),
    };

    for (name, value_template) in &config.response_headers {
        let value = match expr::substitute(
            &Value::String(value_template.clone()),
            ctx,
            SubstituteMode::Lenient,
        ) {
            Ok(Value::String(s)) => s,
            Ok(other) => other.to_string(),
            Err(_) => value_template.clone(),
        };
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => debug!(header = %name, "Skipping invalid response header"),
        }
    }

    response
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(json!({"success": false, "error": message})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthScheme;
    use crate::config::{EndpointKind, StepConfig};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn shared(mut config: EndpointConfig) -> Arc<HttpShared> {
        config.port = 9001;
        let routes = compile_routes(&config.html_routes).unwrap();
        Arc::new(HttpShared {
            config,
            tools: Arc::new(ToolRegistry::with_builtins()),
            routes,
            metrics: HttpMetrics::default(),
        })
    }

    fn test_router(shared: Arc<HttpShared>) -> Router {
        let addr: SocketAddr = "10.0.0.7:51000".parse().unwrap();
        router(shared).layer(axum::extract::connect_info::MockConnectInfo(addr))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(path: &str, body: Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_pipeline_and_template_response() {
        let mut config = EndpointConfig::new("hooks", EndpointKind::Http);
        config.pipeline = vec![StepConfig {
            tool: "word_stats".to_string(),
            params: json!({"text": "{! webhook.body.message !}"}),
            output: "stats".to_string(),
        }];
        config.response_template = Some(json!({
            "count": "{! stats.count !}",
            "summary": "[! stats.count !] words received"
        }));

        let response = test_router(shared(config))
            .oneshot(post("/", json!({"message": "a b c"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body, json!({"count": 3, "summary": "3 words received"}));
    }

    #[tokio::test]
    async fn test_webhook_context_carries_request_metadata() {
        let mut config = EndpointConfig::new("hooks", EndpointKind::Http);
        config.auth = AuthScheme::BearerToken {
            token: "s3cret".into(),
        };
        config.response_template = Some(json!({
            "endpoint": "{! webhook.endpoint !}",
            "remote": "{! webhook.remote_addr !}",
            "verified": "{! webhook.auth.verified !}",
            "stamped": "{! length(webhook.received_at) > 0 !}",
        }));

        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header("authorization", "Bearer s3cret")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = test_router(shared(config)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body,
            json!({
                "endpoint": "hooks",
                "remote": "10.0.0.7:51000",
                "verified": true,
                "stamped": true,
            })
        );
    }

    #[tokio::test]
    async fn test_auth_rejected_before_pipeline() {
        let mut config = EndpointConfig::new("hooks", EndpointKind::Http);
        config.auth = AuthScheme::BearerToken {
            token: "s3cret".into(),
        };
        config.pipeline = vec![StepConfig {
            tool: "no_such_tool".to_string(),
            params: json!({}),
            output: "out".to_string(),
        }];

        let state = shared(config);
        let response = test_router(state.clone())
            .oneshot(post("/", json!({})))
            .await
            .unwrap();

        // The broken pipeline never ran
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(state.metrics.auth_failures.load(Ordering::Relaxed), 1);
        assert_eq!(state.metrics.pipeline_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let config = EndpointConfig::new("hooks", EndpointKind::Http);
        let response = test_router(shared(config))
            .oneshot(post("/elsewhere", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_async_mode_responds_202_immediately() {
        let mut config = EndpointConfig::new("hooks", EndpointKind::Http);
        config.async_mode = true;
        config.response_template = Some(json!({"accepted": true}));
        config.pipeline = vec![StepConfig {
            tool: "echo".to_string(),
            params: json!({"ok": true}),
            output: "out".to_string(),
        }];

        let response = test_router(shared(config))
            .oneshot(post("/", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await, json!({"accepted": true}));
    }

    #[tokio::test]
    async fn test_html_route_renders_template() {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("user.html");
        std::fs::write(&template_path, "<h1>{{title}}</h1><p>{{count}}</p>").unwrap();

        let mut config = EndpointConfig::new("pages", EndpointKind::Http);
        config.html_routes = vec![HtmlRoute {
            url_pattern: "/users/{id}".to_string(),
            template_file: template_path,
            pipeline: vec![StepConfig {
                tool: "word_stats".to_string(),
                params: json!({"text": "one two"}),
                output: "stats".to_string(),
            }],
            placeholder_map: [
                ("title".to_string(), "User [! url.id !]".to_string()),
                ("count".to_string(), "[! stats.count !]".to_string()),
            ]
            .into_iter()
            .collect(),
        }];

        let request = Request::builder()
            .method("GET")
            .uri("/users/42")
            .body(Body::empty())
            .unwrap();
        let response = test_router(shared(config)).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(html, "<h1>User 42</h1><p>2</p>");
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_500() {
        let mut config = EndpointConfig::new("hooks", EndpointKind::Http);
        config.pipeline = vec![StepConfig {
            tool: "word_stats".to_string(),
            params: json!({"text": "{! webhook.body.missing.deep !}"}),
            output: "stats".to_string(),
        }];

        let state = shared(config);
        let response = test_router(state.clone())
            .oneshot(post("/", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.metrics.pipeline_failures.load(Ordering::Relaxed), 1);
        let body = body_json(response).await;
        assert_eq!(body["success"], json!(false));
    }

    #[test]
    fn test_compile_route_patterns() {
        let routes = vec![HtmlRoute {
            url_pattern: "/rooms/{room}/users/{user}".to_string(),
            template_file: "t.html".into(),
            pipeline: vec![],
            placeholder_map: Default::default(),
        }];
        let compiled = compile_routes(&routes).unwrap();
        let caps = compiled[0].regex.captures("/rooms/lobby/users/ada").unwrap();
        assert_eq!(&caps["room"], "lobby");
        assert_eq!(&caps["user"], "ada");
        assert!(compiled[0].regex.captures("/rooms/lobby").is_none());
        assert!(compiled[0].regex.captures("/rooms/a/b/users/c").is_none());
    }
}
