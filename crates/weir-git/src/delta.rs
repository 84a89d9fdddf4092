//! Git delta encoding.
//!
//! A delta starts with the base size and the result size as little-endian
//! base-128 varints, followed by instructions. An instruction byte with the
//! high bit set copies a range of the base; its low bits say which offset and
//! size bytes follow. Any other non-zero byte inserts that many literal
//! bytes. Opcode zero is reserved.

use crate::{GitError, Result};

/// Largest range a single copy instruction can express.
const MAX_COPY: usize = 0x10000;
/// Largest literal run a single insert instruction can carry.
const MAX_INSERT: usize = 0x7f;

/// Applies `delta` to `base`.
pub fn apply_delta(base: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;
    if base_size != base.len() {
        return Err(invalid(format!(
            "base size {} does not match base of {} bytes",
            base_size,
            base.len()
        )));
    }

    let mut out = Vec::with_capacity(result_size.min(1 << 24));
    while pos < delta.len() {
        let opcode = delta[pos];
        pos += 1;

        if opcode & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if opcode & (1 << i) != 0 {
                    offset |= (byte_at(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            for i in 0..3 {
                if opcode & (0x10 << i) != 0 {
                    size |= (byte_at(delta, &mut pos)? as usize) << (8 * i);
                }
            }
            if size == 0 {
                size = MAX_COPY;
            }
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| invalid("copy outside of base"))?;
            out.extend_from_slice(&base[offset..end]);
        } else if opcode != 0 {
            let len = opcode as usize;
            let end = pos + len;
            if end > delta.len() {
                return Err(invalid("insert past end of delta"));
            }
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(invalid("reserved opcode 0"));
        }

        if out.len() > result_size {
            return Err(invalid("result larger than declared"));
        }
    }

    if out.len() != result_size {
        return Err(invalid(format!(
            "result is {} bytes, expected {}",
            out.len(),
            result_size
        )));
    }
    Ok(out)
}

/// Reads the result size header of a delta without applying it.
pub fn result_size(delta: &[u8]) -> Result<usize> {
    let mut pos = 0;
    read_varint(delta, &mut pos)?;
    read_varint(delta, &mut pos)
}

/// Writes deltas instruction by instruction.
#[derive(Debug, Clone)]
pub struct DeltaBuilder {
    base_len: usize,
    result_len: usize,
    ops: Vec<u8>,
}

impl DeltaBuilder {
    /// Starts a delta against a base of `base_len` bytes.
    pub fn new(base_len: usize) -> Self {
        Self {
            base_len,
            result_len: 0,
            ops: Vec::new(),
        }
    }

    /// Copies `len` bytes of the base starting at `offset`.
    pub fn copy(mut self, mut offset: usize, mut len: usize) -> Self {
        while len > 0 {
            let chunk = len.min(MAX_COPY);
            let mut opcode = 0x80u8;
            let mut args = Vec::with_capacity(7);
            for i in 0..4 {
                let byte = (offset >> (8 * i)) as u8;
                if byte != 0 {
                    opcode |= 1 << i;
                    args.push(byte);
                }
            }
            // A zero size field means MAX_COPY.
            if chunk != MAX_COPY {
                for i in 0..3 {
                    let byte = (chunk >> (8 * i)) as u8;
                    if byte != 0 {
                        opcode |= 0x10 << i;
                        args.push(byte);
                    }
                }
            }
            self.ops.push(opcode);
            self.ops.extend_from_slice(&args);
            self.result_len += chunk;
            offset += chunk;
            len -= chunk;
        }
        self
    }

    /// Inserts literal bytes.
    pub fn insert(mut self, data: &[u8]) -> Self {
        for chunk in data.chunks(MAX_INSERT) {
            self.ops.push(chunk.len() as u8);
            self.ops.extend_from_slice(chunk);
            self.result_len += chunk.len();
        }
        self
    }

    /// Finishes the delta.
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ops.len() + 10);
        write_varint(&mut out, self.base_len);
        write_varint(&mut out, self.result_len);
        out.extend_from_slice(&self.ops);
        out
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<usize> {
    let mut value = 0usize;
    let mut shift = 0;
    loop {
        let byte = byte_at(data, pos)?;
        if shift > 63 {
            return Err(invalid("varint overflow"));
        }
        value |= ((byte & 0x7f) as usize) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn byte_at(data: &[u8], pos: &mut usize) -> Result<u8> {
    let byte = *data.get(*pos).ok_or_else(|| invalid("truncated delta"))?;
    *pos += 1;
    Ok(byte)
}

fn invalid(msg: impl Into<String>) -> GitError {
    GitError::InvalidPack(format!("bad delta: {}", msg.into()))
}
