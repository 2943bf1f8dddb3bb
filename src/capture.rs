//! Request-bin endpoints and the redirect table.
//!
//! - `/_/{bin}` and `/_/{bin}/...` capture the request and answer with it as JSON
//! - `/api/bins` lists live bins, `/api/bins/{bin}` the latest requests of one
//! - `/{bin}/redirect/{kind}` captures the request and redirects to a well-known
//!   internal location, so a fetcher that follows redirects can be steered there

use crate::bins::{BinStore, CapturedRequest};
use crate::protocol::{HttpRequest, Response};
use std::net::SocketAddr;
use tracing::debug;

/// Redirect kinds and their targets
const REDIRECTS: &[(&str, &str)] = &[
    ("file/passwd", "file:///etc/passwd"),
    ("file/hosts", "file:///etc/hosts"),
    ("google/metadata", "http://169.254.169.254/computeMetadata/v1/"),
    ("openstack/metadata", "http://169.254.169.254/openstack"),
    ("rackspace/metadata", "http://169.254.169.254/openstack"),
    ("hp/metadata", "http://169.254.169.254/2009-04-04/meta-data/"),
    ("aws/userdata", "http://169.254.169.254/latest/user-data/"),
    ("aws/hostname", "http://169.254.169.254/latest/meta-data/hostname/"),
    ("aws/credentials", "http://169.254.169.254/latest/meta-data/iam/security-credentials/"),
    // 169.254.169.254 in octal
    ("google/metadata/oct", "http://0251.0376.0251.0376/computeMetadata/v1/"),
    ("openstack/metadata/oct", "http://0251.0376.0251.0376/openstack"),
    ("rackspace/metadata/oct", "http://0251.0376.0251.0376/openstack"),
    ("hp/metadata/oct", "http://0251.0376.0251.0376/2009-04-04/meta-data/"),
    ("aws/userdata/oct", "http://0251.0376.0251.0376/latest/user-data/"),
    ("aws/hostname/oct", "http://0251.0376.0251.0376/latest/meta-data/hostname/"),
    ("aws/credentials/oct", "http://0251.0376.0251.0376/latest/meta-data/iam/security-credentials/"),
    // and as one hex number
    ("google/metadata/hex", "http://0xA9FEA9FE/computeMetadata/v1/"),
    ("openstack/metadata/hex", "http://0xA9FEA9FE/openstack"),
    ("rackspace/metadata/hex", "http://0xA9FEA9FE/openstack"),
    ("hp/metadata/hex", "http://0xA9FEA9FE/2009-04-04/meta-data/"),
    ("aws/userdata/hex", "http://0xA9FEA9FE/latest/user-data/"),
    ("aws/hostname/hex", "http://0xA9FEA9FE/latest/meta-data/hostname/"),
    ("aws/credentials/hex", "http://0xA9FEA9FE/latest/meta-data/iam/security-credentials/"),
];

/// Redirect kind that points back into the bin itself
const SELF_REDIRECT: &str = "self";

/// A request-bin endpoint matched from a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    Capture { bin: &'a str },
    ListBins,
    ListRequests { bin: &'a str },
    Redirect { bin: &'a str, kind: &'a str },
}

impl<'a> Route<'a> {
    /// Match a request path, or `None` when it is not a bin endpoint
    pub fn parse(path: &'a str) -> Option<Self> {
        if let Some(rest) = path.strip_prefix("/_/") {
            let bin = rest.split('/').next().unwrap_or("");
            return non_empty(bin).map(|bin| Route::Capture { bin });
        }

        if path == "/api/bins" || path == "/api/bins/" {
            return Some(Route::ListBins);
        }
        if let Some(bin) = path.strip_prefix("/api/bins/") {
            if bin.contains('/') {
                return None;
            }
            return non_empty(bin).map(|bin| Route::ListRequests { bin });
        }

        let mut parts = path.strip_prefix('/')?.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(bin), Some("redirect"), Some(kind)) if !bin.is_empty() && !kind.is_empty() => {
                Some(Route::Redirect { bin, kind })
            }
            _ => None,
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Location a redirect kind points at
pub fn redirect_target(kind: &str) -> Option<&'static str> {
    REDIRECTS
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, target)| *target)
}

/// Produce the response for a bin endpoint
pub fn respond(route: Route<'_>, request: &HttpRequest, peer: SocketAddr, bins: &BinStore) -> Response {
    match route {
        Route::Capture { bin } => {
            let captured = CapturedRequest::new(request, bin, peer);
            let response = Response::json(&captured);
            bins.record(captured);
            response
        }
        Route::ListBins => Response::json(&bins.bins()),
        Route::ListRequests { bin } => Response::json(&bins.requests(bin)),
        Route::Redirect { bin, kind } => {
            let location = if kind == SELF_REDIRECT {
                let host = request.head.header("host").unwrap_or("localhost");
                format!("http://{}/_/{}/postredirect", host, bin)
            } else {
                match redirect_target(kind) {
                    Some(target) => target.to_string(),
                    None => return Response::not_found(&request.head.path),
                }
            };

            bins.record(CapturedRequest::new(request, bin, peer));
            debug!(bin, kind, location = %location, "Redirecting");
            Response::redirect(location)
        }
    }
}
