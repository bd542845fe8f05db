//! Encrypted message envelope protocol
//!
//! Encodes and decodes the logical messages exchanged between pipeline
//! steps:
//! - AES-256-CBC cipher keyed by SHA-256 of a shared password, fixed IV
//! - Two wire protocol versions: v1 carries base64 text, v2+ raw binary
//! - Two inbound formats: a plain envelope, or an error wrapper whose
//!   parts are encrypted independently

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod cipher;
pub mod codec;
pub mod envelope;
pub mod error;

pub use cipher::MessageCipher;
pub use codec::{Encoding, EnvelopeCodec, InputFormat};
pub use envelope::{Envelope, ErrorReport};
pub use error::{Error, Result};
