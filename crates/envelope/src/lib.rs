//! Envelope wire codec
//!
//! The ingestion protocol batches one or more telemetry payloads (events,
//! transactions, sessions, replay data, metrics, logs) into a single HTTP
//! request body called an envelope:
//!
//! ```text
//! {envelope header JSON}\n
//! {item header JSON}\n
//! <payload: `length` raw bytes, or one newline-terminated line>\n
//! {item header JSON}\n
//! <payload>\n
//! ...
//! ```
//!
//! Item payloads are not uniformly JSON: metrics items carry a StatsD-like
//! text line, replay recordings carry (possibly gzip-compressed) binary
//! data. Decoding therefore keeps the exact framed bytes of every item next
//! to a typed view, so that re-encoding a decoded envelope reproduces the
//! original bytes.
//!
//! A malformed length prefix, a truncated payload, or invalid JSON where
//! JSON is declared is a hard [`EnvelopeError::Decode`] -- never a
//! silently-empty result.

pub mod dsn;
pub mod envelope;
pub mod error;
pub mod item;

pub use dsn::{Dsn, IngestMatcher};
pub use envelope::{Envelope, EnvelopeHeader};
pub use error::{EnvelopeError, EnvelopeResult};
pub use item::{EnvelopeItem, ItemHeader, ItemPayload, ItemType};
