//! Indexed mesh payloads (magic `GXMF`).
//!
//! One shared vertex buffer plus a u32 triangle index buffer, followed by a
//! run of quad identifiers. Each quad is emitted as two triangles, so the id
//! run holds `indexCount / 6` entries. Quads carry no color on the wire;
//! viewers derive one with [`crate::color_for_id`].
//!
//! ```text
//! Header (16B): magic[4]="GXMF", version:u32(=1), vertexCount:u32, indexCount:u32
//! Vertices: vertexCount x 3 x f32
//! Indices:  indexCount x u32
//! Per quad: idLen:u16, id bytes UTF-8, zero-padded to 4-byte alignment
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::reader::Reader;
use crate::{INDEXED_MAGIC, WireError, id_padding};

/// An indexed payload, decoded from or encodable to the wire layout above.
///
/// Vertex and index data stay views over the source buffer. Encoding writes
/// one id per quad; callers constructing a message by hand must supply
/// `indexCount / 6` ids or the result will not decode.
#[derive(Debug, Clone)]
pub struct IndexedGeometry {
    vertex_count: usize,
    positions: Bytes,
    indices: Bytes,
    quad_ids: Vec<String>,
}

impl IndexedGeometry {
    pub const VERSION: u32 = 1;

    /// Build from explicit buffers.
    pub fn new(
        points: &[[f32; 3]],
        triangle_indices: &[u32],
        quad_ids: Vec<String>,
    ) -> IndexedGeometry {
        let mut positions = BytesMut::with_capacity(points.len() * 12);
        for p in points {
            for c in *p {
                positions.put_f32_le(c);
            }
        }
        let mut indices = BytesMut::with_capacity(triangle_indices.len() * 4);
        for i in triangle_indices {
            indices.put_u32_le(*i);
        }
        IndexedGeometry {
            vertex_count: points.len(),
            positions: positions.freeze(),
            indices: indices.freeze(),
            quad_ids,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn index_count(&self) -> usize {
        self.indices.len() / 4
    }

    /// Quads represented by the index buffer, two triangles each.
    pub fn quad_count(&self) -> usize {
        self.index_count() / 6
    }

    pub fn quad_ids(&self) -> &[String] {
        &self.quad_ids
    }

    /// Raw position bytes, a zero-copy view over the source buffer.
    pub fn position_bytes(&self) -> &Bytes {
        &self.positions
    }

    /// Raw index bytes, a zero-copy view over the source buffer.
    pub fn index_bytes(&self) -> &Bytes {
        &self.indices
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

    /// The `i`-th triangle index, if in range.
    pub fn index(&self, i: usize) -> Option<u32> {
        let at = i.checked_mul(4)?;
        let b = self.indices.get(at..at + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Iterate triangle indices in order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.index_count()).filter_map(|i| self.index(i))
    }

    pub fn decode(payload: Bytes) -> Result<IndexedGeometry, WireError> {
        let mut r = Reader::new(payload);
        let magic = r.take(4, "magic tag")?;
        if magic[..] != INDEXED_MAGIC {
            return Err(WireError::UnrecognizedFormat([
                magic[0], magic[1], magic[2], magic[3],
            ]));
        }
        let version = r.u32_le("format version")?;
        if version != Self::VERSION {
            return Err(WireError::UnsupportedVersion {
                format: "indexed",
                version,
            });
        }
        let vertex_count = r.u32_le("vertex count")? as usize;
        let index_count = r.u32_le("index count")? as usize;

        let positions = r.run(vertex_count, 12, "vertex positions")?;
        let indices = r.run(index_count, 4, "triangle indices")?;

        let quad_count = index_count / 6;
        let mut quad_ids = Vec::with_capacity(quad_count.min(r.remaining() / 2));
        for _ in 0..quad_count {
            let id_len = r.u16_le("quad id length")? as usize;
            let id_bytes = r.take(id_len, "quad id")?;
            let id = std::str::from_utf8(&id_bytes)
                .map_err(|_| WireError::InvalidId)?
                .to_owned();
            r.skip(id_padding(id_len), "quad id padding")?;
            quad_ids.push(id);
        }

        Ok(IndexedGeometry {
            vertex_count,
            positions,
            indices,
            quad_ids,
        })
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        for id in &self.quad_ids {
            if id.len() > u16::MAX as usize {
                return Err(WireError::IdTooLong(id.len()));
            }
        }
        let mut buf =
            BytesMut::with_capacity(16 + self.positions.len() + self.indices.len());
        buf.put_slice(&INDEXED_MAGIC);
        buf.put_u32_le(Self::VERSION);
        buf.put_u32_le(self.vertex_count as u32);
        buf.put_u32_le(self.index_count() as u32);
        buf.put_slice(&self.positions);
        buf.put_slice(&self.indices);
        for id in &self.quad_ids {
            buf.put_u16_le(id.len() as u16);
            buf.put_slice(id.as_bytes());
            buf.put_bytes(0, id_padding(id.len()));
        }
        Ok(buf.freeze())
    }
}
