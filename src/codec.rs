use crate::document::Document;
use crate::{Error, Result};
use std::io::{Read, Write};

/// Header byte distinguishing the two blob encodings a collection's
/// `__json__` column may hold. Kept as the first byte so that documents
/// written by an older version of the codec remain decodable.
const TAG_RAW: u8 = 0;
const TAG_DEFLATE: u8 = 1;

/// Below this serialized size, compression isn't worth the CPU or the
/// two-byte-minimum overhead zlib adds; store the JSON bytes as-is.
const COMPRESS_THRESHOLD: usize = 256;

/// Encodes documents to bytes and back. Pure: it has no knowledge of rows,
/// columns, or the store it's used from.
///
/// `decode(encode(d)) == d` holds up to document-equality semantics (key
/// order is insignificant, see [`Document`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, document: &Document) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(document.as_map())
            .map_err(|err| Error::InvalidSqlArgument(format!("document is not valid JSON: {err}")))?;

        if json.len() < COMPRESS_THRESHOLD {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(&json);
            return Ok(out);
        }

        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&json)
            .map_err(|err| Error::InvalidSqlResult(format!("failed to compress document: {err}")))?;
        let compressed = encoder
            .finish()
            .map_err(|err| Error::InvalidSqlResult(format!("failed to compress document: {err}")))?;

        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(TAG_DEFLATE);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Document> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::InvalidSqlResult("empty document blob".to_string()))?;

        let json = match *tag {
            TAG_RAW => body.to_vec(),
            TAG_DEFLATE => {
                let mut decoder = flate2::read::DeflateDecoder::new(body);
                let mut json = Vec::new();
                decoder.read_to_end(&mut json).map_err(|err| {
                    Error::InvalidSqlResult(format!("failed to decompress document: {err}"))
                })?;
                json
            }
            other => {
                return Err(Error::InvalidSqlResult(format!(
                    "unrecognized document encoding tag {other}"
                )))
            }
        };

        let value: serde_json::Value = serde_json::from_slice(&json)
            .map_err(|err| Error::InvalidSqlResult(format!("corrupt document blob: {err}")))?;

        Document::from_value(value)
    }
}
