//! Bounds-checked little-endian reads over a shared byte buffer.

use bytes::Bytes;

use crate::WireError;

/// Cursor over `Bytes` that reports truncation instead of panicking and
/// hands out zero-copy slices of the underlying buffer.
pub(crate) struct Reader {
    buf: Bytes,
    pos: usize,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Reader { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, n: usize, context: &'static str) -> Result<(), WireError> {
        if self.remaining() < n {
            Err(WireError::Truncated {
                context,
                needed: n - self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub(crate) fn u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        self.ensure(1, context)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub(crate) fn u16_le(&mut self, context: &'static str) -> Result<u16, WireError> {
        self.ensure(2, context)?;
        let v = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub(crate) fn u32_le(&mut self, context: &'static str) -> Result<u32, WireError> {
        self.ensure(4, context)?;
        let b = &self.buf[self.pos..self.pos + 4];
        let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn f32_le(&mut self, context: &'static str) -> Result<f32, WireError> {
        self.ensure(4, context)?;
        let b = &self.buf[self.pos..self.pos + 4];
        let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        self.pos += 4;
        Ok(v)
    }

    pub(crate) fn point3(&mut self, context: &'static str) -> Result<[f32; 3], WireError> {
        Ok([
            self.f32_le(context)?,
            self.f32_le(context)?,
            self.f32_le(context)?,
        ])
    }

    /// Zero-copy slice of the next `n` bytes.
    pub(crate) fn take(&mut self, n: usize, context: &'static str) -> Result<Bytes, WireError> {
        self.ensure(n, context)?;
        let out = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    /// Zero-copy slice of `count` items of `item_size` bytes each.
    ///
    /// Counts come straight off the wire, so the length math is done in u64
    /// before any allocation or slicing happens.
    pub(crate) fn run(
        &mut self,
        count: usize,
        item_size: usize,
        context: &'static str,
    ) -> Result<Bytes, WireError> {
        let need = (count as u64).saturating_mul(item_size as u64);
        let have = self.remaining() as u64;
        if need > have {
            return Err(WireError::Truncated {
                context,
                needed: (need - have).min(usize::MAX as u64) as usize,
            });
        }
        self.take(need as usize, context)
    }

    pub(crate) fn skip(&mut self, n: usize, context: &'static str) -> Result<(), WireError> {
        self.ensure(n, context)?;
        self.pos += n;
        Ok(())
    }
}
