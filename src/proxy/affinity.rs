use axum::http::{HeaderMap, header};
use percent_encoding::{NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

/// Affinity cookies live for one day and cover the whole site.
pub(super) const AFFINITY_TTL_SECS: u64 = 86_400;

/// Read and decode the named cookie from the request, if present. Values that
/// fail to percent-decode cleanly are used as-is rather than discarded.
pub(super) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE).iter() {
        let Ok(s) = value.to_str() else {
            continue;
        };
        for pair in s.split(';') {
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            if k.trim() == name {
                return Some(decode_cookie_value(v.trim()));
            }
        }
    }
    None
}

fn decode_cookie_value(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8() {
        Ok(s) => s.into_owned(),
        Err(_) => raw.to_string(),
    }
}

fn encode_cookie_value(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Order the configured candidates for this request. A preferred upstream that
/// is still a member of the configured list moves to the front; anything else
/// (no cookie, stale value after a config change, forged value) leaves the
/// configured order untouched.
pub(super) fn resolve_candidate_order<'a>(
    configured: &'a [String],
    preferred: Option<&str>,
) -> Vec<&'a str> {
    let default_order = || configured.iter().map(String::as_str).collect::<Vec<_>>();
    let Some(pref) = preferred else {
        return default_order();
    };
    let mut out: Vec<&str> = Vec::with_capacity(configured.len());
    let mut rest: Vec<&str> = Vec::with_capacity(configured.len());
    let mut found = false;
    for candidate in configured {
        if !found && candidate == pref {
            out.push(candidate.as_str());
            found = true;
        } else {
            rest.push(candidate.as_str());
        }
    }
    if !found {
        return default_order();
    }
    out.extend(rest);
    out
}

/// `Set-Cookie` header value pinning the winning upstream.
pub(super) fn set_cookie_header(name: &str, upstream: &str) -> String {
    format!(
        "{name}={}; Path=/; Max-Age={AFFINITY_TTL_SECS}; SameSite=Lax",
        encode_cookie_value(upstream)
    )
}

/// A rewrite is only needed when the winner differs from what the client
/// already has.
pub(super) fn should_write_cookie(current: Option<&str>, winner: &str) -> bool {
    current != Some(winner)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    fn configured() -> Vec<String> {
        vec![
            "https://a.example".to_string(),
            "https://b.example".to_string(),
            "https://c.example".to_string(),
        ]
    }

    fn request_headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(cookie).expect("cookie"));
        headers
    }

    #[test]
    fn no_cookie_keeps_configured_order() {
        let list = configured();
        let order = resolve_candidate_order(&list, None);
        assert_eq!(order, vec!["https://a.example", "https://b.example", "https://c.example"]);
    }

    #[test]
    fn preferred_member_moves_to_front_keeping_relative_order() {
        let list = configured();
        let order = resolve_candidate_order(&list, Some("https://b.example"));
        assert_eq!(order, vec!["https://b.example", "https://a.example", "https://c.example"]);
    }

    #[test]
    fn stale_preference_falls_back_to_full_configured_list() {
        let list = configured();
        let order = resolve_candidate_order(&list, Some("https://gone.example"));
        assert_eq!(order, vec!["https://a.example", "https://b.example", "https://c.example"]);
    }

    #[test]
    fn cookie_value_is_percent_decoded() {
        let headers = request_headers(
            "theme=dark; opengater_upstream=https%3A%2F%2Fb%2Eexample; other=1",
        );
        assert_eq!(
            cookie_value(&headers, "opengater_upstream").as_deref(),
            Some("https://b.example")
        );
    }

    #[test]
    fn malformed_percent_encoding_falls_back_to_raw_string() {
        let headers = request_headers("opengater_upstream=https%ZZbroken");
        assert_eq!(
            cookie_value(&headers, "opengater_upstream").as_deref(),
            Some("https%ZZbroken")
        );
    }

    #[test]
    fn missing_cookie_yields_none() {
        let headers = request_headers("theme=dark");
        assert_eq!(cookie_value(&headers, "opengater_upstream"), None);
    }

    #[test]
    fn set_cookie_round_trips_through_cookie_value() {
        let header_str = set_cookie_header("opengater_upstream", "http://127.0.0.1:8080");
        let value = header_str.split(';').next().expect("pair");
        let headers = request_headers(value);
        assert_eq!(
            cookie_value(&headers, "opengater_upstream").as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert!(header_str.ends_with("Path=/; Max-Age=86400; SameSite=Lax"));
    }

    #[test]
    fn cookie_write_is_idempotent_for_matching_value() {
        assert!(!should_write_cookie(Some("https://a.example"), "https://a.example"));
        assert!(should_write_cookie(Some("https://a.example"), "https://b.example"));
        assert!(should_write_cookie(None, "https://a.example"));
    }
}
