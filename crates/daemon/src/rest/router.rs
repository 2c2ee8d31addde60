//! # Router Assembly
//!
//! One router per endpoint, assembled from resource groups. Beyond
//! mounting, the router owns three behaviors every listener shares:
//!
//! - `GET /` answers with the supported API versions.
//! - Unmatched routes produce the JSON 404 envelope, never a bare
//!   hyper 404.
//! - Percent-encoding in request paths is preserved verbatim: routes
//!   match the raw path, and handlers that need a path segment take it
//!   from the raw URI via [`raw_trailing_segment`], decoding exactly
//!   once with [`percent_decode`]. Remote names containing `/` (or
//!   anything else) survive the round trip.

use axum::extract::Request;
use axum::http::Uri;
use axum::routing::get;
use axum::Router;
use syndic_common::{Envelope, API_VERSIONS};
use tracing::info;

use super::Resources;
use crate::state::State;

/// Builds the router for one listener from the given groups.
pub(crate) fn build_router(state: &State, groups: &[Resources]) -> Router {
    let mut router = Router::new().route("/", get(root_versions));
    for group in groups {
        router = router.merge(group.build(state.clone()));
    }

    router.fallback(not_found)
}

async fn root_versions() -> Envelope {
    Envelope::sync(&API_VERSIONS)
}

async fn not_found(request: Request) -> Envelope {
    info!(url = %request.uri(), "sending top level 404");
    Envelope::not_found()
}

/// Returns the raw (still percent-encoded) remainder of the request
/// path after `prefix`. `None` when the path does not start with the
/// prefix or the remainder is empty.
pub(crate) fn raw_trailing_segment(uri: &Uri, prefix: &str) -> Option<String> {
    let rest = uri.path().strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }

    Some(rest.to_string())
}

/// Decodes `%XX` escapes once. Invalid escapes pass through verbatim
/// rather than erroring: the segment was produced by a peer client and
/// a stray `%` must not make the entry unaddressable.
pub(crate) fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    fn hex_val(byte: u8) -> Option<u8> {
        match byte {
            b'0'..=b'9' => Some(byte - b'0'),
            b'a'..=b'f' => Some(byte - b'a' + 10),
            b'A'..=b'F' => Some(byte - b'A' + 10),
            _ => None,
        }
    }

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }

        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
