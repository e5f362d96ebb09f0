//! Trafficrec - records outbound HTTP traffic as replayable fixtures
//!
//! A [`Recorder`](recording::Recorder) installs itself on a transport, follows
//! every request through to the end of its response body, and writes each
//! completed exchange to its own file in one of the supported formats
//! (raw body, Mocktail, HTTP message, or a caller-supplied format).

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod exchange;
pub mod naming;
pub mod policy;
pub mod recording;
pub mod storage;
pub mod transport;

pub use error::{RecorderError, Result};
