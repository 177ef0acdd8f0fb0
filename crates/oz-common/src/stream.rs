// stream.rs: Little-endian binary streams for assets, saves and update packets.

use crate::error::{OzError, OzResult};
use crate::math::Vec3;

// ============================================================
// Raw readers (callers check bounds)
// ============================================================

#[inline]
pub fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn read_vec3_le(data: &[u8], offset: usize) -> Vec3 {
    [
        read_f32_le(data, offset),
        read_f32_le(data, offset + 4),
        read_f32_le(data, offset + 8),
    ]
}

// ============================================================
// InputStream
// ============================================================

/// Cursor over a byte slice. Every read is bounds checked and reports the
/// asset name and offset on truncation.
pub struct InputStream<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> InputStream<'a> {
    pub fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn require(&self, n: usize) -> OzResult<()> {
        if self.remaining() < n {
            return Err(OzError::Truncated {
                what: self.what,
                offset: self.pos,
            });
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> OzResult<&'a [u8]> {
        self.require(n)?;
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take `count` records of `stride` bytes as one block, for lump parsers
    /// that index into it directly.
    pub fn read_block(&mut self, count: usize, stride: usize) -> OzResult<&'a [u8]> {
        let len = count.checked_mul(stride).ok_or_else(|| {
            OzError::bad_asset(self.what, format!("lump of {} x {} overflows", count, stride))
        })?;
        self.read_bytes(len)
    }

    /// Fails unless the next bytes equal `magic`.
    pub fn expect_magic(&mut self, magic: &[u8]) -> OzResult<()> {
        let found = self.read_bytes(magic.len())?;
        if found != magic {
            return Err(OzError::bad_asset(self.what, "bad magic"));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> OzResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> OzResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> OzResult<i32> {
        let b = self.read_bytes(4)?;
        Ok(read_i32_le(b, 0))
    }

    pub fn read_u32(&mut self) -> OzResult<u32> {
        Ok(self.read_i32()? as u32)
    }

    /// Reads a non-negative count.
    pub fn read_count(&mut self) -> OzResult<usize> {
        let offset = self.pos;
        let n = self.read_i32()?;
        if n < 0 {
            return Err(OzError::bad_asset(
                self.what,
                format!("negative count {} at offset {}", n, offset),
            ));
        }
        Ok(n as usize)
    }

    /// Reads an optional index stored as -1 for none.
    pub fn read_index(&mut self) -> OzResult<Option<usize>> {
        let n = self.read_i32()?;
        Ok(if n < 0 { None } else { Some(n as usize) })
    }

    pub fn read_f32(&mut self) -> OzResult<f32> {
        let b = self.read_bytes(4)?;
        Ok(read_f32_le(b, 0))
    }

    pub fn read_vec3(&mut self) -> OzResult<Vec3> {
        let b = self.read_bytes(12)?;
        Ok(read_vec3_le(b, 0))
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> OzResult<String> {
        let len = self.read_count()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| OzError::bad_asset(self.what, "string is not UTF-8"))
    }
}

// ============================================================
// OutputStream
// ============================================================

#[derive(Default)]
pub struct OutputStream {
    buf: Vec<u8>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_count(&mut self, n: usize) {
        debug_assert!(n <= i32::MAX as usize);
        self.write_i32(n as i32);
    }

    pub fn write_index(&mut self, index: Option<usize>) {
        match index {
            Some(i) => self.write_count(i),
            None => self.write_i32(-1),
        }
    }

    pub fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_vec3(&mut self, v: &Vec3) {
        for c in v {
            self.write_f32(*c);
        }
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_count(s.len());
        self.write_bytes(s.as_bytes());
    }
}
