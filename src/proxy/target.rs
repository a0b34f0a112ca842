use anyhow::{Result, anyhow};

/// Join a candidate base URL with the forwarded path segments and query
/// string: `base/seg1/seg2?query`. The query is copied verbatim, so parameter
/// order and repeated keys survive. An empty segment list yields `base/`.
pub(super) fn build_upstream_url(
    base: &str,
    segments: &[&str],
    query: Option<&str>,
) -> Result<reqwest::Url> {
    let base = base.trim_end_matches('/');
    let mut full = String::with_capacity(base.len() + 32);
    full.push_str(base);
    full.push('/');
    full.push_str(&segments.join("/"));
    if let Some(q) = query
        && !q.is_empty()
    {
        full.push('?');
        full.push_str(q);
    }
    reqwest::Url::parse(&full).map_err(|e| anyhow!("invalid upstream url {full}: {e}"))
}

/// The same URL with a trailing slash on the path, for the single 404 retry.
pub(super) fn with_trailing_slash(url: &reqwest::Url) -> reqwest::Url {
    let mut out = url.clone();
    let path = out.path().to_string();
    if !path.ends_with('/') {
        out.set_path(&format!("{path}/"));
    }
    out
}

/// Origin of a candidate base URL (`scheme://host[:port]`), used to spoof
/// same-origin request headers.
pub(super) fn upstream_origin(base: &str) -> Option<String> {
    let url = reqwest::Url::parse(base).ok()?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return None;
    }
    Some(origin.ascii_serialization())
}
