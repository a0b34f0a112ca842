use axum::http::{HeaderMap, HeaderValue};

/// Fixed desktop-Chrome identity presented to every upstream. Some mirrors
/// reject requests that do not look like they came from a browser.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

const BROWSER_ACCEPT: &str = "application/json, text/plain, */*";

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Header names listed in `Connection:` are hop-by-hop too, whatever they are.
fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all("connection").iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for token in s.split(',').map(|t| t.trim()).filter(|t| !t.is_empty()) {
            out.push(token.to_ascii_lowercase());
        }
    }
    out
}

/// Copy client headers for the outbound leg, dropping hop-by-hop headers plus
/// `host` and `content-length` (the client layer recomputes both).
pub(super) fn filter_request_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if name_lower == "host"
            || name_lower == "content-length"
            || is_hop_by_hop_header(&name_lower)
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Copy upstream response headers for the caller, dropping hop-by-hop headers.
/// The client layer decodes compressed bodies before we see them, so a
/// leftover `content-length`/`content-encoding` would misdescribe the bytes we
/// actually relay.
pub(super) fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
        {
            continue;
        }
        if extra.iter().any(|t| t == &name_lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Make the outbound request look same-origin to the candidate: `origin` and
/// `referer` point at the candidate itself, identity headers are fixed.
/// `accept-encoding` is dropped so the client layer negotiates an encoding it
/// can actually decode.
pub(super) fn spoof_browser_headers(headers: &mut HeaderMap, candidate_origin: &str) {
    headers.remove("accept-encoding");
    if let Ok(v) = HeaderValue::from_str(candidate_origin) {
        headers.insert("origin", v);
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{candidate_origin}/")) {
        headers.insert("referer", v);
    }
    headers.insert("user-agent", HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert("accept", HeaderValue::from_static(BROWSER_ACCEPT));
}
