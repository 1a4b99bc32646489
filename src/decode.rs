//! Incremental `content-encoding` decoding.
//!
//! Decoders consume compressed chunks as they arrive and emit whatever
//! plaintext is available so far, so both buffered collection and streamed
//! reads can share one code path.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};
use http::HeaderMap;
use http::header::CONTENT_ENCODING;

/// A response `content-encoding` recognized by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    /// No encoding, or an encoding the client does not decode.
    Identity,
    /// `gzip`
    Gzip,
    /// `deflate` (zlib stream)
    Deflate,
}

impl ContentEncoding {
    /// Classify the `content-encoding` header of a response.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map_or(Self::Identity, Self::from_token)
    }

    /// Classify a single encoding token.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case("gzip") {
            Self::Gzip
        } else if token.eq_ignore_ascii_case("deflate") {
            Self::Deflate
        } else {
            Self::Identity
        }
    }
}

/// Streaming decoder for one response body.
pub(crate) enum ContentDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl ContentDecoder {
    pub(crate) fn new(encoding: ContentEncoding) -> Self {
        match encoding {
            ContentEncoding::Identity => Self::Identity,
            ContentEncoding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => Self::Deflate(ZlibDecoder::new(Vec::new())),
        }
    }

    /// Feed one encoded chunk; returns the plaintext produced so far (may be
    /// empty while the decoder is still filling its window).
    ///
    /// Input past the point where more than `max_output` bytes came out is
    /// dropped, so a small compressed chunk cannot inflate without bound.
    pub(crate) fn decode(&mut self, chunk: Bytes, max_output: usize) -> io::Result<Bytes> {
        match self {
            Self::Identity => Ok(chunk),
            Self::Gzip(decoder) => {
                feed(decoder, |d| d.get_ref().len(), &chunk, max_output)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            Self::Deflate(decoder) => {
                feed(decoder, |d| d.get_ref().len(), &chunk, max_output)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    /// Flush the decoder at end of body.
    pub(crate) fn finish(&mut self) -> io::Result<Bytes> {
        match self {
            Self::Identity => Ok(Bytes::new()),
            Self::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            Self::Deflate(decoder) => {
                decoder.try_finish()?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }
}

// Each `write` inflates into a bounded internal buffer, so checking between
// writes bounds the overshoot.
fn feed<W: Write>(
    decoder: &mut W,
    produced: impl Fn(&W) -> usize,
    mut input: &[u8],
    max_output: usize,
) -> io::Result<()> {
    while !input.is_empty() {
        let n = decoder.write(input)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        input = &input[n..];
        if produced(decoder) > max_output {
            break;
        }
    }
    Ok(())
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Identity => "Identity",
            Self::Gzip(_) => "Gzip",
            Self::Deflate(_) => "Deflate",
        };
        f.debug_tuple("ContentDecoder").field(&name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use http::HeaderValue;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn decode_in_chunks(encoding: ContentEncoding, encoded: &[u8], chunk: usize) -> Vec<u8> {
        let mut decoder = ContentDecoder::new(encoding);
        let mut out = Vec::new();
        for piece in encoded.chunks(chunk) {
            out.extend_from_slice(&decoder.decode(Bytes::copy_from_slice(piece), usize::MAX).unwrap());
        }
        out.extend_from_slice(&decoder.finish().unwrap());
        out
    }

    #[test]
    fn classifies_header_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(ContentEncoding::from_headers(&headers), ContentEncoding::Identity);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        assert_eq!(ContentEncoding::from_headers(&headers), ContentEncoding::Gzip);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(" deflate"));
        assert_eq!(ContentEncoding::from_headers(&headers), ContentEncoding::Deflate);
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(ContentEncoding::from_headers(&headers), ContentEncoding::Identity);
    }

    #[test]
    fn gzip_decodes_across_chunk_boundaries() {
        let plain = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let encoded = gzip(&plain);
        for chunk in [1, 7, 64, encoded.len()] {
            assert_eq!(decode_in_chunks(ContentEncoding::Gzip, &encoded, chunk), plain);
        }
    }

    #[test]
    fn deflate_decodes_zlib_stream() {
        let encoded = zlib(b"ok");
        assert_eq!(decode_in_chunks(ContentEncoding::Deflate, &encoded, 3), b"ok");
    }

    #[test]
    fn identity_passes_through() {
        let mut decoder = ContentDecoder::new(ContentEncoding::Identity);
        let chunk = Bytes::from_static(b"raw");
        assert_eq!(decoder.decode(chunk.clone(), 1).unwrap(), chunk);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn output_cap_stops_a_decompression_bomb() {
        let encoded = zlib(&vec![b'a'; 16 * 1024 * 1024]);
        let mut decoder = ContentDecoder::new(ContentEncoding::Deflate);
        let out = decoder.decode(Bytes::from(encoded), 4096).unwrap();
        assert!(out.len() > 4096);
        assert!(out.len() < 256 * 1024, "inflated {} bytes", out.len());
    }

    #[test]
    fn corrupt_gzip_is_an_error() {
        let mut decoder = ContentDecoder::new(ContentEncoding::Gzip);
        let result = decoder
            .decode(Bytes::from_static(b"definitely not gzip data"), usize::MAX)
            .and_then(|_| decoder.finish());
        assert!(result.is_err());
    }
}
