//! Raw-input target: echo the body, then list its character data.

use super::Transcript;
use crate::xml::TextFragments;
use bytes::Bytes;
use tracing::debug;

/// Build the response body for a request body.
///
/// Malformed input ends the listing early without any message; lines
/// emitted before the error are kept.
pub fn handle(body: &[u8]) -> Bytes {
    let mut out = Transcript::new(false);
    out.echo(body);

    for fragment in TextFragments::new(body) {
        match fragment {
            Ok(text) => out.line(&text),
            Err(e) => {
                debug!(error = %e, "Text extraction stopped");
                break;
            }
        }
    }

    out.finish()
}
