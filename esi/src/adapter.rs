//! Helpers for hosting the [`Processor`] behind an HTTP endpoint.
//!
//! The server itself is left to the host application; these functions cover
//! turning a request path into a document and deciding what to send back.

use log::{error, warn};

use crate::{Processor, Result};

fn from_hex(x: u8) -> Option<u8> {
    match x {
        b'0'..=b'9' => Some(x - b'0'),
        b'a'..=b'f' => Some(10 + x - b'a'),
        b'A'..=b'F' => Some(10 + x - b'A'),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'%' && i + 2 < b.len() {
            if let (Some(h), Some(l)) = (from_hex(b[i + 1]), from_hex(b[i + 2])) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(b[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Reads an ESI document carried in a request path, e.g. `/%3Cesi%3Avars%3E...`.
///
/// The path is percent-decoded, then one leading and one trailing `/` are removed.
pub fn document_from_path(path: &str) -> String {
    let decoded = percent_decode(path);
    let document = decoded.strip_prefix('/').unwrap_or(&decoded);
    let document = document.strip_suffix('/').unwrap_or(document);
    document.to_string()
}

/// Processes `document` with a fresh variable context and returns the response body.
///
/// With [`crate::Configuration::passthrough_on_error`] enabled, a document
/// that cannot be assembled is returned unprocessed instead of as an error.
pub async fn respond(processor: &Processor, document: &str) -> Result<String> {
    match processor.process_document(document).await {
        Ok(output) => Ok(output),
        Err(err) if processor.configuration().passthrough_on_error => {
            warn!("error processing ESI document, returning it unprocessed: {}", err);
            Ok(document.to_string())
        }
        Err(err) => {
            error!("error processing ESI document: {}", err);
            Err(err)
        }
    }
}
