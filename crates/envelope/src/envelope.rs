//! Envelope parsing and serialization

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{EnvelopeError, EnvelopeResult};
use crate::item::{EnvelopeItem, ItemHeader, ItemPayload, ItemType};

/// Envelope header line carrying routing metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,

    /// Dynamic sampling context propagated with the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<serde_json::Map<String, Value>>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One header record followed by N `(item header, payload)` pairs.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub items: Vec<EnvelopeItem>,
}

impl Envelope {
    pub fn new(header: EnvelopeHeader) -> Self {
        Self { header, items: Vec::new() }
    }

    /// Decode an envelope from a raw request body.
    ///
    /// Framing rules: one JSON header line, then for each item one JSON
    /// item-header line followed by either exactly `length` raw bytes (the
    /// binary-safe path) or, when `length` is absent, one newline-terminated
    /// line. Every violation is a hard decode error: a declared length
    /// overrunning the buffer, a missing payload, an unparseable header
    /// line, or invalid JSON in a JSON-typed payload.
    pub fn parse(bytes: &[u8]) -> EnvelopeResult<Self> {
        let mut cur = Cursor::new(bytes);

        let header_line = cur
            .read_line()
            .ok_or_else(|| EnvelopeError::Decode("empty body, missing envelope header".into()))?;
        let header: EnvelopeHeader = serde_json::from_slice(header_line)
            .map_err(|e| EnvelopeError::Decode(format!("envelope header is not valid JSON: {}", e)))?;

        let mut items = Vec::new();
        loop {
            let line = match cur.read_line() {
                Some(line) => line,
                None => break,
            };
            // A trailing newline after the final payload yields one empty
            // line at the very end; anywhere else an empty header line is
            // a framing violation.
            if line.is_empty() {
                if cur.at_end() {
                    break;
                }
                return Err(EnvelopeError::Decode(format!(
                    "empty item header line at byte offset {}",
                    cur.pos
                )));
            }

            let item_header: ItemHeader = serde_json::from_slice(line).map_err(|e| {
                EnvelopeError::Decode(format!("item header is not valid JSON: {}", e))
            })?;

            let raw = match item_header.length {
                Some(len) => cur.read_exact(len).ok_or_else(|| {
                    EnvelopeError::Decode(format!(
                        "item of type '{}' declares length {} but only {} bytes remain",
                        item_header.ty,
                        len,
                        cur.remaining()
                    ))
                })?,
                None => cur.read_line().ok_or_else(|| {
                    EnvelopeError::Decode(format!(
                        "item of type '{}' has no payload line",
                        item_header.ty
                    ))
                })?,
            };

            items.push(EnvelopeItem::decode(item_header, Bytes::copy_from_slice(raw))?);
        }

        if items.is_empty() {
            return Err(EnvelopeError::Decode("envelope contains no items".into()));
        }

        trace!(items = items.len(), "decoded envelope");
        Ok(Self { header, items })
    }

    /// Re-encode this envelope.
    ///
    /// Items are written from their exact framed bytes, so for every item
    /// with an explicit length prefix the output reproduces the input.
    pub fn serialize(&self) -> EnvelopeResult<Vec<u8>> {
        let mut out = serde_json::to_vec(&self.header)?;
        out.push(b'\n');
        for item in &self.items {
            out.extend_from_slice(&serde_json::to_vec(&item.header)?);
            out.push(b'\n');
            out.extend_from_slice(&item.raw);
            out.push(b'\n');
        }
        Ok(out)
    }

    /// First item whose declared type matches, or `None` when absent.
    /// Absence is an assertable outcome, not an error.
    pub fn item_of_type(&self, ty: &ItemType) -> Option<&EnvelopeItem> {
        self.items.iter().find(|item| &item.header.ty == ty)
    }

    /// All items of the given declared type, in wire order.
    pub fn items_of_type<'a>(
        &'a self,
        ty: &'a ItemType,
    ) -> impl Iterator<Item = &'a EnvelopeItem> + 'a {
        self.items.iter().filter(move |item| &item.header.ty == ty)
    }

    /// Declared type of the first item, used for coarse envelope routing.
    pub fn event_type(&self) -> Option<&ItemType> {
        self.items.first().map(|item| &item.header.ty)
    }

    /// Append a JSON item, computing its length prefix.
    pub fn push_json_item(&mut self, ty: ItemType, value: Value) -> EnvelopeResult<()> {
        let raw = serde_json::to_vec(&value)?;
        let mut header = ItemHeader::new(ty);
        header.length = Some(raw.len());
        self.items.push(EnvelopeItem {
            header,
            raw: Bytes::from(raw),
            payload: ItemPayload::Json(value),
        });
        Ok(())
    }

    /// Append a plain-text item (metrics line protocol), computing its
    /// length prefix.
    pub fn push_text_item(&mut self, ty: ItemType, text: &str) {
        let mut header = ItemHeader::new(ty);
        header.length = Some(text.len());
        self.items.push(EnvelopeItem {
            header,
            raw: Bytes::copy_from_slice(text.as_bytes()),
            payload: ItemPayload::Text(text.to_string()),
        });
    }

    /// Append a binary item, computing its length prefix.
    pub fn push_binary_item(&mut self, ty: ItemType, bytes: Bytes, content_type: Option<&str>) {
        let mut header = ItemHeader::new(ty);
        header.length = Some(bytes.len());
        header.content_type = content_type.map(str::to_string);
        self.items.push(EnvelopeItem {
            header,
            raw: bytes.clone(),
            payload: ItemPayload::Binary(bytes),
        });
    }
}

/// Byte cursor over an envelope body. Newlines delimit JSON records;
/// length-prefixed payloads are consumed byte-exact regardless of content.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Read up to the next newline (consumed, not returned), or to the end
    /// of the buffer. `None` once the buffer is exhausted.
    fn read_line(&mut self) -> Option<&'a [u8]> {
        if self.at_end() {
            return None;
        }
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                self.pos += idx + 1;
                Some(&rest[..idx])
            }
            None => {
                self.pos = self.buf.len();
                Some(rest)
            }
        }
    }

    /// Consume exactly `len` bytes plus the newline that separates the
    /// payload from the next record. `None` if fewer than `len` bytes
    /// remain -- a truncated payload.
    fn read_exact(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        if !self.at_end() && self.buf[self.pos] == b'\n' {
            self.pos += 1;
        }
        Some(out)
    }
}
