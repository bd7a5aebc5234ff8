//! URL sanitisation for logs and metrics.
//!
//! Upstream URLs routinely embed API keys as path segments
//! (`https://mainnet.example.io/v3/<key>`). Any segment of 20 or more
//! alphanumeric/`_`/`-` characters is rewritten to `[API_KEY]` before the URL
//! reaches a log line or the health endpoint.

/// Minimum segment length treated as a credential.
const KEY_SEGMENT_MIN_LEN: usize = 20;

fn looks_like_key(segment: &str) -> bool {
    segment.len() >= KEY_SEGMENT_MIN_LEN &&
        segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Rewrites API-key-looking path segments of `url` to `[API_KEY]`.
///
/// Falls back to returning the input unchanged when it does not parse as a
/// URL; never panics on operator-supplied strings.
#[must_use]
pub fn sanitize_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };

    let sanitized: Vec<String> = match parsed.path_segments() {
        Some(segments) => segments
            .map(|seg| {
                if looks_like_key(seg) {
                    "[API_KEY]".to_string()
                } else {
                    seg.to_string()
                }
            })
            .collect(),
        None => return raw.to_string(),
    };

    parsed.set_path(&sanitized.join("/"));
    // Query strings can carry keys too; drop them wholesale.
    if parsed.query().is_some() {
        parsed.set_query(None);
    }
    parsed.to_string()
}
