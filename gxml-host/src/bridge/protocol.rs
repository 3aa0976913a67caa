//! Protocol types shared with the render worker.
//!
//! Requests are single lines: either a raw scene document or a JSON command
//! object. Responses come back as envelopes; the types here describe the
//! JSON halves of that traffic plus the out-of-band readiness sentinel the
//! worker prints on its diagnostic stream.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gxml_wire::{Geometry, WireError};

/// Token the worker prints to its diagnostic stream once its compute
/// backends are initialized and it will accept requests.
pub const READY_MARKER: &str = "GXML_WORKER_READY";

/// Control commands understood by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Report the active backend and the availability map.
    GetBackendInfo,
    /// Switch geometry computation to another backend.
    SetBackend { backend: String },
}

/// Compute backend report: the active backend plus which backends the
/// worker managed to load.
///
/// Appears twice in a worker's life: parsed out of the readiness sentinel
/// at startup, and returned by the `get_backend_info` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend: String,
    #[serde(rename = "backends", default)]
    pub available: BTreeMap<String, bool>,
}

impl BackendInfo {
    /// Parse a diagnostic line if it carries the readiness sentinel.
    ///
    /// Tokens after the marker are `key=value` pairs: `backend=<name>`
    /// names the active backend, `True`/`False` values fill the
    /// availability map, anything else is ignored.
    pub fn from_sentinel(line: &str) -> Option<BackendInfo> {
        let at = line.find(READY_MARKER)?;
        let mut info = BackendInfo::default();
        for token in line[at + READY_MARKER.len()..].split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match (key, value) {
                ("backend", name) => info.backend = name.to_string(),
                (name, "True") => {
                    info.available.insert(name.to_string(), true);
                }
                (name, "False") => {
                    info.available.insert(name.to_string(), false);
                }
                _ => {}
            }
        }
        Some(info)
    }
}

/// Per-phase pipeline timings reported with a render response, in seconds.
///
/// A phase the worker skipped is absent rather than zero. Keys this host
/// does not know about are kept under `extra` instead of dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prelayout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postlayout: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intersection: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fastmesh: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialize: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A resolved render request: pipeline timings plus the geometry trailer.
///
/// The trailer is kept as raw bytes so callers that hand it straight to the
/// GPU or to disk never pay for decoding.
#[derive(Debug, Clone)]
pub struct RenderReply {
    pub timings: RenderTimings,
    pub geometry: Bytes,
}

impl RenderReply {
    /// Decode the geometry trailer into typed form.
    pub fn decode_geometry(&self) -> Result<Geometry, WireError> {
        Geometry::decode(self.geometry.clone())
    }
}
