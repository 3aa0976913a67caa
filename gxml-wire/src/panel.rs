//! Per-panel geometry payloads (magic `GXML`).
//!
//! Layout, all integers and floats little-endian:
//!
//! ```text
//! Header (16B): magic[4]="GXML", version:u32, panelCount:u32, totalVertexCount:u32
//! Per panel (20B): idLen:u16, vertexCount:u16, colorR:f32, colorG:f32, colorB:f32,
//!                  then version 1: reserved[4B]
//!                       version 2: hasEndpoints:u8, pad[3B]
//!                                  (+ start/end 3xf32 points when the flag is set)
//! Panel id: idLen bytes UTF-8, zero-padded to 4-byte alignment
//! Vertices: vertexCount x 3 x f32
//! ```
//!
//! Versions 1 and 2 are supported; version 2 adds the optional straight-edge
//! endpoints used for edge snapping in viewers.

use bytes::{BufMut, Bytes, BytesMut};

use crate::reader::Reader;
use crate::{PANEL_MAGIC, WireError, id_padding};

/// Optional straight-edge endpoints attached to a panel (format version 2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelEndpoints {
    pub start: [f32; 3],
    pub end: [f32; 3],
}

/// One panel: an identifier, a display color, and a flat vertex run.
///
/// `positions` stays a view over the decoded buffer; use [`Panel::position`]
/// or [`Panel::positions`] for typed access.
#[derive(Debug, Clone)]
pub struct Panel {
    pub id: String,
    pub color: [f32; 3],
    pub endpoints: Option<PanelEndpoints>,
    vertex_count: usize,
    positions: Bytes,
}

impl Panel {
    /// Build a panel from explicit points.
    pub fn new(id: impl Into<String>, color: [f32; 3], points: &[[f32; 3]]) -> Panel {
        let mut buf = BytesMut::with_capacity(points.len() * 12);
        for p in points {
            for c in *p {
                buf.put_f32_le(c);
            }
        }
        Panel {
            id: id.into(),
            color,
            endpoints: None,
            vertex_count: points.len(),
            positions: buf.freeze(),
        }
    }

    pub fn with_endpoints(mut self, start: [f32; 3], end: [f32; 3]) -> Panel {
        self.endpoints = Some(PanelEndpoints { start, end });
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Raw position bytes, a zero-copy view over the source buffer.
    pub fn position_bytes(&self) -> &Bytes {
        &self.positions
    }

    /// The `i`-th vertex position, if in range.
    pub fn position(&self, i: usize) -> Option<[f32; 3]> {
        let at = i.checked_mul(12)?;
        let b = self.positions.get(at..at + 12)?;
        Some([
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            f32::from_le_bytes([b[8], b[9], b[10], b[11]]),
        ])
    }

    /// Iterate vertex positions in order.
    pub fn positions(&self) -> impl Iterator<Item = [f32; 3]> + '_ {
        (0..self.vertex_count).filter_map(|i| self.position(i))
    }
}

/// A per-panel payload, decoded from or encodable to the wire layout above.
#[derive(Debug, Clone)]
pub struct PanelGeometry {
    pub version: u32,
    pub panels: Vec<Panel>,
    total_vertex_count: u32,
}

impl PanelGeometry {
    pub fn new(version: u32, panels: Vec<Panel>) -> PanelGeometry {
        let total_vertex_count = panels.iter().map(|p| p.vertex_count as u32).sum();
        PanelGeometry {
            version,
            panels,
            total_vertex_count,
        }
    }

    /// Vertex total as stated by the header.
    ///
    /// Kept for preallocation hints only; the per-panel counts are
    /// authoritative and are not cross-checked against this value.
    pub fn total_vertex_count(&self) -> u32 {
        self.total_vertex_count
    }

    pub fn decode(payload: Bytes) -> Result<PanelGeometry, WireError> {
        let mut r = Reader::new(payload);
        let magic = r.take(4, "magic tag")?;
        if magic[..] != PANEL_MAGIC {
            return Err(WireError::UnrecognizedFormat([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }
        let version = r.u32_le("format version")?;
        if !(1..=2).contains(&version) {
            return Err(WireError::UnsupportedVersion {
                format: "per-panel",
                version,
            });
        }
        let panel_count = r.u32_le("panel count")? as usize;
        let total_vertex_count = r.u32_le("vertex total")?;

        // A panel occupies at least 20 bytes, which bounds how much the
        // count field can make us preallocate.
        let mut panels = Vec::with_capacity(panel_count.min(r.remaining() / 20));
        for _ in 0..panel_count {
            panels.push(decode_panel(&mut r, version)?);
        }
        Ok(PanelGeometry {
            version,
            panels,
            total_vertex_count,
        })
    }

    /// Encode with this message's `version` layout.
    ///
    /// Version 1 has no endpoint slot, so any `endpoints` on a panel are not
    /// representable and are omitted.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if !(1..=2).contains(&self.version) {
            return Err(WireError::UnsupportedVersion {
                format: "per-panel",
                version: self.version,
            });
        }
        for p in &self.panels {
            if p.id.len() > u16::MAX as usize {
                return Err(WireError::IdTooLong(p.id.len()));
            }
            if p.vertex_count > u16::MAX as usize {
                return Err(WireError::TooManyVertices(p.vertex_count));
            }
        }

        let mut buf = BytesMut::with_capacity(16 + self.panels.len() * 32);
        buf.put_slice(&PANEL_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.panels.len() as u32);
        buf.put_u32_le(self.panels.iter().map(|p| p.vertex_count as u32).sum());

        for p in &self.panels {
            buf.put_u16_le(p.id.len() as u16);
            buf.put_u16_le(p.vertex_count as u16);
            for c in p.color {
                buf.put_f32_le(c);
            }
            if self.version == 1 {
                buf.put_slice(&[0u8; 4]);
            } else {
                match p.endpoints {
                    Some(ep) => {
                        buf.put_u8(1);
                        buf.put_slice(&[0u8; 3]);
                        for c in ep.start {
                            buf.put_f32_le(c);
                        }
                        for c in ep.end {
                            buf.put_f32_le(c);
                        }
                    }
                    None => {
                        buf.put_u8(0);
                        buf.put_slice(&[0u8; 3]);
                    }
                }
            }
            buf.put_slice(p.id.as_bytes());
            buf.put_bytes(0, id_padding(p.id.len()));
            buf.put_slice(&p.positions);
        }
        Ok(buf.freeze())
    }
}

fn decode_panel(r: &mut Reader, version: u32) -> Result<Panel, WireError> {
    let id_len = r.u16_le("panel id length")? as usize;
    let vertex_count = r.u16_le("panel vertex count")? as usize;
    let color = r.point3("panel color")?;

    let endpoints = if version >= 2 {
        let flag = r.u8("endpoint flag")?;
        r.skip(3, "panel header padding")?;
        if flag != 0 {
            Some(PanelEndpoints {
                start: r.point3("endpoint start")?,
                end: r.point3("endpoint end")?,
            })
        } else {
            None
        }
    } else {
        r.skip(4, "reserved header bytes")?;
        None
    };

    let id_bytes = r.take(id_len, "panel id")?;
    let id = std::str::from_utf8(&id_bytes)
        .map_err(|_| WireError::InvalidId)?
        .to_owned();
    r.skip(id_padding(id_len), "panel id padding")?;

    let positions = r.run(vertex_count, 12, "panel vertices")?;
    Ok(Panel {
        id,
        color,
        endpoints,
        vertex_count,
        positions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_points() -> Vec<[f32; 3]> {
        vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
        ]
    }

    fn assert_close(a: [f32; 3], b: [f32; 3]) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn round_trip_preserves_panel_fields() {
        let msg = PanelGeometry::new(
            2,
            vec![Panel::new("0-test", [0.9, 0.2, 0.3], &quad_points())],
        );
        let decoded = PanelGeometry::decode(msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.panels.len(), 1);
        assert_eq!(decoded.total_vertex_count(), 4);

        let panel = &decoded.panels[0];
        assert_eq!(panel.id, "0-test");
        assert_eq!(panel.vertex_count(), 4);
        assert_close(panel.position(0).unwrap(), [0.0, 0.0, 0.0]);
        assert_close(panel.position(1).unwrap(), [1.0, 0.0, 0.0]);
        assert_close(panel.color, [0.9, 0.2, 0.3]);
        assert!(panel.endpoints.is_none());
    }

    #[test]
    fn version_1_ignores_reserved_bytes() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"GXML");
        buf.put_u32_le(1);
        buf.put_u32_le(1);
        buf.put_u32_le(1);
        buf.put_u16_le(1); // id length
        buf.put_u16_le(1); // vertex count
        for c in [0.5f32, 0.5, 0.5] {
            buf.put_f32_le(c);
        }
        buf.put_slice(&[9, 9, 9, 9]); // reserved, content is arbitrary
        buf.put_slice(b"a\0\0\0");
        for c in [1.0f32, 2.0, 3.0] {
            buf.put_f32_le(c);
        }

        let decoded = PanelGeometry::decode(buf.freeze()).unwrap();
        let panel = &decoded.panels[0];
        assert_eq!(panel.id, "a");
        assert!(panel.endpoints.is_none());
        assert_close(panel.position(0).unwrap(), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn endpoints_round_trip_in_version_2() {
        let panel = Panel::new("edge", [0.1, 0.2, 0.3], &quad_points())
            .with_endpoints([0.0, 0.5, 0.0], [1.0, 0.5, 0.0]);
        let decoded = PanelGeometry::decode(PanelGeometry::new(2, vec![panel]).encode().unwrap())
            .unwrap();

        let ep = decoded.panels[0].endpoints.expect("endpoints survive");
        assert_close(ep.start, [0.0, 0.5, 0.0]);
        assert_close(ep.end, [1.0, 0.5, 0.0]);
    }

    #[test]
    fn id_padding_follows_alignment_rule() {
        for len in [0usize, 1, 2, 3, 4, 5, 8] {
            let id = "x".repeat(len);
            let pad = (4 - len % 4) % 4;
            let msg = PanelGeometry::new(
                2,
                vec![Panel::new(id.clone(), [0.0, 0.0, 0.0], &[[0.0, 0.0, 0.0]])],
            );
            let encoded = msg.encode().unwrap();
            assert_eq!(
                encoded.len(),
                16 + 20 + len + pad + 12,
                "unexpected size for id length {len}"
            );

            let decoded = PanelGeometry::decode(encoded).unwrap();
            assert_eq!(decoded.panels[0].id, id);
            assert_eq!(decoded.panels[0].vertex_count(), 1);
        }
    }

    #[test]
    fn unsupported_version_is_an_error() {
        let mut encoded = BytesMut::from(
            &PanelGeometry::new(2, vec![Panel::new("p", [0.0; 3], &quad_points())])
                .encode()
                .unwrap()[..],
        );
        encoded[4..8].copy_from_slice(&3u32.to_le_bytes());

        let err = PanelGeometry::decode(encoded.freeze()).unwrap_err();
        assert_eq!(
            err,
            WireError::UnsupportedVersion {
                format: "per-panel",
                version: 3
            }
        );
    }

    #[test]
    fn truncated_buffers_error_at_every_cut() {
        let encoded = PanelGeometry::new(
            2,
            vec![Panel::new("0-test", [0.9, 0.2, 0.3], &quad_points())],
        )
        .encode()
        .unwrap();

        for cut in [3, 10, 16, 17, 30, encoded.len() - 1] {
            let err = PanelGeometry::decode(encoded.slice(..cut)).unwrap_err();
            assert!(
                matches!(err, WireError::Truncated { .. }),
                "cut {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn invalid_utf8_id_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"GXML");
        buf.put_u32_le(2);
        buf.put_u32_le(1);
        buf.put_u32_le(0);
        buf.put_u16_le(2);
        buf.put_u16_le(0);
        for c in [0.0f32; 3] {
            buf.put_f32_le(c);
        }
        buf.put_slice(&[0, 0, 0, 0]); // no endpoints
        buf.put_slice(&[0xff, 0xfe, 0, 0]); // id + padding

        assert_eq!(
            PanelGeometry::decode(buf.freeze()).unwrap_err(),
            WireError::InvalidId
        );
    }

    #[test]
    fn empty_message_round_trips() {
        let decoded = PanelGeometry::decode(PanelGeometry::new(2, vec![]).encode().unwrap())
            .unwrap();
        assert!(decoded.panels.is_empty());
        assert_eq!(decoded.total_vertex_count(), 0);
    }
}
