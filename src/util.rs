//! Small shared utilities.

/// Little-endian byte sink over a growable buffer.
///
/// Shared by the machine-code emitter and the ELF serialisation passes;
/// every multi-byte write is little-endian.
pub struct ByteEncoder<'b> {
    out: &'b mut Vec<u8>,
}

impl<'b> ByteEncoder<'b> {
    pub fn new(out: &'b mut Vec<u8>) -> Self {
        Self { out }
    }

    /// Current offset, i.e. the number of bytes emitted so far.
    pub fn offset(&self) -> usize {
        self.out.len()
    }

    pub fn encode8(&mut self, v: u8) {
        self.out.push(v);
    }

    pub fn encode16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn encode32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn encode64(&mut self, v: u64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn encode_chars(&mut self, v: &str) {
        self.out.extend_from_slice(v.as_bytes());
    }
}
