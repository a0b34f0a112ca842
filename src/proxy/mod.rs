use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes, to_bytes};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use axum::routing::{any, get};
use reqwest::Client;
use tracing::{debug, warn};

mod affinity;
mod fields;
mod headers;
mod target;

use crate::logging::{log_proxy_request, redacted_header_entries};

use self::affinity::{cookie_value, resolve_candidate_order, set_cookie_header, should_write_cookie};
use self::fields::{credential_field, looks_like_json};
use self::headers::{filter_request_headers, filter_response_headers, spoof_browser_headers};
use self::target::{build_upstream_url, upstream_origin, with_trailing_slash};

/// Affinity cookie for the generic API route.
pub const API_AFFINITY_COOKIE: &str = "opengater_upstream";
/// Affinity cookie for the auth route. Distinct key so the two failover
/// histories never interfere.
pub const AUTH_AFFINITY_COOKIE: &str = "opengater_auth_upstream";
/// Winning auth upstream, echoed back for observability.
pub const AUTH_UPSTREAM_HEADER: &str = "x-auth-upstream";

/// Statuses treated as "this mirror is unavailable, try the next one".
/// 401/403 are deliberately absent: a definitive denial is returned as-is.
const RETRYABLE_STATUS: [u16; 5] = [404, 500, 502, 503, 504];

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

fn is_denied_status(status: u16) -> bool {
    matches!(status, 401 | 403)
}

/// Per-route policy. Both routes share one failover engine; the historical
/// behavioural differences between them live entirely in these knobs.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub name: &'static str,
    /// Path prefix this route is mounted under; everything after it is
    /// forwarded to the upstream.
    pub mount: &'static str,
    /// Ordered candidate list; first entry is tried first absent affinity.
    pub upstreams: Vec<String>,
    pub cookie_name: &'static str,
    /// Retry `path + "/"` once when a candidate answers 404. Some API mirrors
    /// route trailing slashes inconsistently.
    pub retry_trailing_slash: bool,
    /// Persist the affinity cookie even on 401/403. For the auth route a
    /// denial is still a definitive answer from a working upstream.
    pub sticky_on_denied: bool,
    /// Response header naming the winning upstream, when set.
    pub upstream_header: Option<&'static str>,
    /// Debug-log which credential field a JSON response carried (name only).
    pub observe_credentials: bool,
}

impl RouteConfig {
    pub fn api(upstreams: Vec<String>) -> Self {
        Self {
            name: "api",
            mount: "/api/proxy",
            upstreams,
            cookie_name: API_AFFINITY_COOKIE,
            retry_trailing_slash: true,
            sticky_on_denied: false,
            upstream_header: None,
            observe_credentials: false,
        }
    }

    pub fn auth(upstreams: Vec<String>) -> Self {
        Self {
            name: "auth",
            mount: "/api/auth",
            upstreams,
            cookie_name: AUTH_AFFINITY_COOKIE,
            retry_trailing_slash: false,
            sticky_on_denied: true,
            upstream_header: Some(AUTH_UPSTREAM_HEADER),
            observe_credentials: true,
        }
    }
}

#[derive(Clone)]
pub struct ProxyService {
    client: Client,
    route: Arc<RouteConfig>,
    attempt_timeout: Option<Duration>,
    max_body_bytes: usize,
}

impl ProxyService {
    pub fn new(
        client: Client,
        route: RouteConfig,
        attempt_timeout: Option<Duration>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            client,
            route: Arc::new(route),
            attempt_timeout,
            max_body_bytes,
        }
    }

    /// One upstream attempt: filtered client headers re-spoofed for this
    /// candidate, buffered body replayed, optional per-attempt timeout.
    async fn send_attempt(
        &self,
        method: &Method,
        url: reqwest::Url,
        filtered_headers: &HeaderMap,
        base: &str,
        body: &Bytes,
        send_body: bool,
    ) -> reqwest::Result<reqwest::Response> {
        let mut headers = filtered_headers.clone();
        if let Some(origin) = upstream_origin(base) {
            spoof_browser_headers(&mut headers, &origin);
        }
        debug!(
            url = %url,
            headers = ?redacted_header_entries(&headers),
            "dispatching upstream attempt"
        );
        let mut builder = self.client.request(method.clone(), url).headers(headers);
        if send_body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = self.attempt_timeout {
            builder = builder.timeout(timeout);
        }
        builder.send().await
    }
}

/// Failover handler shared by both routes: walk the resolved candidate order
/// sequentially until one answers with a terminal status, then relay that
/// response; exhaustion yields the JSON 502 envelope.
pub async fn handle_proxy(
    proxy: ProxyService,
    req: Request<Body>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let client_headers = parts.headers;

    let path = uri.path().to_string();
    let rest = path.strip_prefix(proxy.route.mount).unwrap_or("");
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let query = uri.query();

    // Buffer the body once so it can be replayed identically across
    // candidates; a consumed stream cannot be re-read.
    let send_body = method != Method::GET && method != Method::HEAD;
    let body_bytes = if send_body {
        match to_bytes(body, proxy.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) if is_length_limit_error(&e) => {
                return Err((
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {} bytes", proxy.max_body_bytes),
                ));
            }
            Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string())),
        }
    } else {
        Bytes::new()
    };

    let cookie = cookie_value(&client_headers, proxy.route.cookie_name);
    let candidates = resolve_candidate_order(&proxy.route.upstreams, cookie.as_deref());

    let filtered_headers = filter_request_headers(&client_headers);

    let mut last_err: Option<String> = None;
    let mut attempts: u32 = 0;

    for base in &candidates {
        let url = match build_upstream_url(base, &segments, query) {
            Ok(url) => url,
            Err(e) => {
                warn!(upstream = %base, error = %e, "skipping candidate with unbuildable url");
                last_err = Some(e.to_string());
                continue;
            }
        };

        attempts += 1;
        let mut resp = match proxy
            .send_attempt(&method, url.clone(), &filtered_headers, base, &body_bytes, send_body)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!(upstream = %base, error = %e, "upstream attempt failed");
                last_err = Some(e.to_string());
                continue;
            }
        };

        // The outbound path is what the upstream actually routed, so the
        // retry decision looks at it rather than the inbound path; a built
        // path already ending in `/` (bare mount) has nothing to retry.
        if proxy.route.retry_trailing_slash
            && resp.status() == StatusCode::NOT_FOUND
            && !url.path().ends_with('/')
        {
            // Exactly one extra fetch against `path + "/"`, same candidate.
            // Whatever it answers replaces the 404; a transport failure on
            // the retry keeps the original 404 response.
            match proxy
                .send_attempt(
                    &method,
                    with_trailing_slash(&url),
                    &filtered_headers,
                    base,
                    &body_bytes,
                    send_body,
                )
                .await
            {
                Ok(retried) => resp = retried,
                Err(e) => debug!(upstream = %base, error = %e, "trailing-slash retry failed"),
            }
        }

        let status = resp.status();
        if is_retryable_status(status.as_u16()) {
            debug!(upstream = %base, status = status.as_u16(), "candidate unavailable, trying next");
            last_err = Some(format!("upstream {base} returned {status}"));
            continue;
        }

        // Terminal: read the body here so a mid-body transport failure still
        // advances the failover loop instead of aborting the request.
        let upstream_headers = resp.headers().clone();
        match resp.bytes().await {
            Ok(bytes) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                log_proxy_request(
                    proxy.route.name,
                    method.as_str(),
                    &path,
                    status.as_u16(),
                    attempts,
                    base,
                    duration_ms,
                );
                if proxy.route.observe_credentials
                    && looks_like_json(&upstream_headers)
                    && let Some(field) = credential_field(&bytes)
                {
                    debug!(field, "auth response carries credential field");
                }
                return Ok(relay_response(
                    &proxy.route,
                    status,
                    &upstream_headers,
                    bytes,
                    base,
                    cookie.as_deref(),
                ));
            }
            Err(e) => {
                warn!(upstream = %base, error = %e, "failed reading upstream body");
                last_err = Some(e.to_string());
                continue;
            }
        }
    }

    let message = last_err.unwrap_or_else(|| "Unknown proxy error".to_string());
    let duration_ms = start.elapsed().as_millis() as u64;
    log_proxy_request(
        proxy.route.name,
        method.as_str(),
        &path,
        StatusCode::BAD_GATEWAY.as_u16(),
        attempts,
        "-",
        duration_ms,
    );
    Ok(error_envelope(&message))
}

/// A body read can fail because the client hit the buffering cap or because
/// the connection broke mid-body; only the former is the caller's fault in a
/// way 413 describes. The cap marker sits somewhere down the error chain.
fn is_length_limit_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Relay a terminal upstream response: hop-by-hop headers stripped, winning
/// upstream echoed when configured, affinity cookie appended when it changes.
/// This is the only place client-visible cookie state is touched.
fn relay_response(
    route: &RouteConfig,
    status: StatusCode,
    upstream_headers: &HeaderMap,
    bytes: Bytes,
    winner: &str,
    cookie: Option<&str>,
) -> Response<Body> {
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = filter_response_headers(upstream_headers);

    if let Some(name) = route.upstream_header
        && let Ok(value) = HeaderValue::from_str(winner)
    {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }

    let sticky = !is_denied_status(status.as_u16()) || route.sticky_on_denied;
    if sticky
        && should_write_cookie(cookie, winner)
        && let Ok(value) = HeaderValue::from_str(&set_cookie_header(route.cookie_name, winner))
    {
        response.headers_mut().append(header::SET_COOKIE, value);
    }

    response
}

/// Uniform envelope for total exhaustion (including an empty candidate list).
fn error_envelope(message: &str) -> Response<Body> {
    let body = serde_json::json!({
        "error": "Proxy request failed",
        "message": message,
    });
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

pub fn router(api: ProxyService, auth: ProxyService) -> Router {
    // axum 0.8 wildcard segments use `/{*path}`; the bare mount is routed
    // separately because the wildcard requires at least one segment.
    let api_root = api.clone();
    let auth_root = auth.clone();
    Router::new()
        .route(
            "/healthz",
            get(|| async { Json(serde_json::json!({ "status": "ok" })) }),
        )
        .route(
            "/api/proxy",
            any(move |req| handle_proxy(api_root.clone(), req)),
        )
        .route(
            "/api/proxy/{*path}",
            any(move |req| handle_proxy(api.clone(), req)),
        )
        .route(
            "/api/auth",
            any(move |req| handle_proxy(auth_root.clone(), req)),
        )
        .route(
            "/api/auth/{*path}",
            any(move |req| handle_proxy(auth.clone(), req)),
        )
}
