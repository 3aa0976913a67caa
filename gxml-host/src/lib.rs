//! gxml-host: the host side of the GXML render worker channel.
//!
//! A long-lived editor process offloads geometry computation to a
//! persistent worker subprocess. This crate supervises that worker and
//! multiplexes request traffic over its stdio: raw newline-terminated
//! requests go down unframed, length-prefixed response frames come back,
//! and because the protocol has no correlation ids, strictly one request
//! is in flight at a time.

mod dispatcher;
mod host;
mod supervisor;

pub mod bridge;

pub use dispatcher::RequestError;
pub use host::{HostConfig, RenderWorker, WorkerStatus};
pub use supervisor::{
    PythonWorkerLauncher, SpawnError, WorkerLauncher, WorkerState, configure_stdio,
};

pub use bridge::codec::{FrameDecoder, MAX_FRAME_BYTES, RequestEncoder};
pub use bridge::envelope::{Envelope, EnvelopeError};
pub use bridge::protocol::{BackendInfo, READY_MARKER, RenderReply, RenderTimings, WorkerCommand};

pub const GXML_HOST_VERSION: &str = env!("CARGO_PKG_VERSION");
