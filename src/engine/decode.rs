use std::io::Read;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

/// Decode a response body according to its `Content-Encoding`. Returns
/// `None` when the frame is malformed so the caller can fall back to the
/// raw bytes, and for encodings the pipeline does not understand.
pub fn decode_content(bytes: &[u8], content_encoding: Option<&str>) -> Option<Vec<u8>> {
    let encoding = content_encoding
        .map(|e| {
            // With stacked encodings the outermost one is listed last.
            e.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .next_back()
                .unwrap_or("")
                .to_ascii_lowercase()
        })
        .unwrap_or_default();

    match encoding.as_str() {
        "" | "identity" => Some(bytes.to_vec()),
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut out).ok()?;
            Some(out)
        }
        "deflate" => {
            // Servers send both zlib-wrapped and raw deflate streams under
            // the same token; try the wrapped form first.
            let mut out = Vec::new();
            if ZlibDecoder::new(bytes).read_to_end(&mut out).is_ok() {
                return Some(out);
            }
            let mut out = Vec::new();
            DeflateDecoder::new(bytes).read_to_end(&mut out).ok()?;
            Some(out)
        }
        "br" => {
            let mut out = Vec::new();
            brotli::Decompressor::new(bytes, 4096)
                .read_to_end(&mut out)
                .ok()?;
            Some(out)
        }
        _ => None,
    }
}
