use axum::http::HeaderMap;
use tracing::info;

#[derive(Debug)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

fn is_sensitive(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie" | "x-api-key"
    )
}

/// Header dump for debug logs with credential-bearing values masked.
pub fn redacted_header_entries(headers: &HeaderMap) -> Vec<HeaderEntry> {
    let mut out = Vec::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        let value = if is_sensitive(&name_lower) {
            "[REDACTED]".to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.push(HeaderEntry {
            name: name.as_str().to_string(),
            value,
        });
    }
    out
}

/// One line per proxied request, after the failover loop settles.
pub fn log_proxy_request(
    route: &str,
    method: &str,
    path: &str,
    status: u16,
    attempts: u32,
    upstream: &str,
    duration_ms: u64,
) {
    info!(
        route,
        method, path, status, attempts, upstream, duration_ms, "request proxied"
    );
}
