use axum::http::HeaderMap;
use serde_json::Value;

/// Ordered probes for credential material in auth responses. Auth backends
/// have shipped the token under several names over time; the first non-null
/// hit wins. Only the label is ever logged, never the value.
const CREDENTIAL_FIELDS: &[(&str, &[&str])] = &[
    ("access_token", &["access_token"]),
    ("accessToken", &["accessToken"]),
    ("token", &["token"]),
    ("jwt", &["jwt"]),
    ("id_token", &["id_token"]),
    ("data.access_token", &["data", "access_token"]),
    ("data.token", &["data", "token"]),
    ("result.token", &["result", "token"]),
];

pub(super) fn looks_like_json(headers: &HeaderMap) -> bool {
    let ct = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    ct.contains("application/json") || ct.contains("+json")
}

/// Name of the first credential field present in a JSON response body, in
/// probe priority order. Non-JSON bodies and null fields yield `None`.
pub(super) fn credential_field(body: &[u8]) -> Option<&'static str> {
    let root: Value = serde_json::from_slice(body).ok()?;
    CREDENTIAL_FIELDS.iter().find_map(|(label, path)| {
        let mut cursor = &root;
        for key in *path {
            cursor = cursor.get(key)?;
        }
        if cursor.is_null() { None } else { Some(*label) }
    })
}
