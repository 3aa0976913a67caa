//! gxml-wire: binary geometry formats produced by the GXML render worker.
//!
//! A render response's binary trailer is one of two payloads, distinguished
//! by a 4-byte magic tag:
//!
//! - **per-panel** (`GXML`): each panel owns its vertex run, color, and id
//! - **indexed** (`GXMF`): one shared vertex/index buffer with per-quad ids
//!
//! Decoding is pure and allocation-light: vertex and index data remain
//! zero-copy views over the input buffer, which matters because payloads can
//! be large and decode sits on the hot path of interactive editing.

mod reader;

pub mod color;
pub mod indexed;
pub mod panel;

pub use color::color_for_id;
pub use indexed::IndexedGeometry;
pub use panel::{Panel, PanelEndpoints, PanelGeometry};

use bytes::Bytes;

/// Magic tag opening a per-panel payload.
pub const PANEL_MAGIC: [u8; 4] = *b"GXML";

/// Magic tag opening an indexed payload.
pub const INDEXED_MAGIC: [u8; 4] = *b"GXMF";

/// Bytes of zero padding that follow an identifier of length `len`,
/// aligning the next field to a 4-byte boundary.
pub(crate) fn id_padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unrecognized format: magic {0:?}")]
    UnrecognizedFormat([u8; 4]),
    #[error("unsupported {format} format version {version}")]
    UnsupportedVersion { format: &'static str, version: u32 },
    #[error("truncated payload: {context} needs {needed} more bytes")]
    Truncated { context: &'static str, needed: usize },
    #[error("identifier is not valid UTF-8")]
    InvalidId,
    #[error("identifier too long for the wire: {0} bytes")]
    IdTooLong(usize),
    #[error("vertex run too long for the wire: {0} vertices")]
    TooManyVertices(usize),
}

/// A decoded geometry payload, either variant.
#[derive(Debug, Clone)]
pub enum Geometry {
    Panels(PanelGeometry),
    Indexed(IndexedGeometry),
}

impl Geometry {
    /// Decode a payload by its leading magic tag.
    pub fn decode(payload: Bytes) -> Result<Geometry, WireError> {
        if payload.len() < 4 {
            return Err(WireError::Truncated {
                context: "magic tag",
                needed: 4 - payload.len(),
            });
        }
        let magic = [payload[0], payload[1], payload[2], payload[3]];
        match magic {
            PANEL_MAGIC => PanelGeometry::decode(payload).map(Geometry::Panels),
            INDEXED_MAGIC => IndexedGeometry::decode(payload).map(Geometry::Indexed),
            other => Err(WireError::UnrecognizedFormat(other)),
        }
    }

    /// Total number of vertices carried by the payload.
    pub fn vertex_count(&self) -> usize {
        match self {
            Geometry::Panels(p) => p.panels.iter().map(Panel::vertex_count).sum(),
            Geometry::Indexed(m) => m.vertex_count(),
        }
    }
}
