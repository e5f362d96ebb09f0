//! On-disk recording formats

pub mod codec;
mod reader;
mod writer;

pub use codec::{encode, persisted_body, MOCKTAIL_BASE64_MARKER};
pub use reader::{
    decode_base64, parse_http_message, parse_mocktail, read_body_only, read_recording,
    RecordedResponse,
};
pub use writer::{check_writable, write_atomic};
