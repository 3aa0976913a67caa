//! Wire bridge between the host and the render worker.
//!
//! - **codec**: frame decoder for worker output, raw request encoder for
//!   worker input
//! - **envelope**: JSON-line-plus-trailer split of a frame payload
//! - **protocol**: command bodies, the readiness sentinel, render timings

pub mod codec;
pub mod envelope;
pub mod protocol;
