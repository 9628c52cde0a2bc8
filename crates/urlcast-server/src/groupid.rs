//! Device grouping: a short stable hash of (origin, identifier) so clients
//! can cluster beacons that point at the same logical page.

use sha1::{Digest, Sha1};
use url::Url;

const GROUP_ID_HEX_CHARS: usize = 16;

/// `first 16 hex chars of SHA-1(netloc ++ "\0" ++ identifier)`.
pub fn group_id(netloc: &str, identifier: &str) -> String {
    let mut h = Sha1::new();
    h.update(netloc.as_bytes());
    h.update(b"\0");
    h.update(identifier.as_bytes());
    let digest = hex::encode(h.finalize());
    digest[..GROUP_ID_HEX_CHARS].to_string()
}

/// `host[:port]` of a URL, the way urlparse calls it netloc.
pub fn netloc(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}
