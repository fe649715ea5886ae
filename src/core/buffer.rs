// This module provides CodeBuffer, the append-only byte emitter that backs both the .text
// and the .data streams of an executable. It knows nothing about instructions: callers
// append bytes, little-endian dwords and qwords, ask for the current position (which doubles
// as an address relative to the start of the section) and overwrite a previously reserved
// 4-byte field once a forward reference becomes known. Positions are plain indices, so the
// growth of the underlying Vec never invalidates an offset handed out earlier.

//! Growable byte buffer with absolute-offset bookkeeping.

/// Append-only byte buffer for one output section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Create an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    /// Append one byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Append a slice of raw bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Append a 32-bit little-endian value.
    pub fn emit_u32(&mut self, dword: u32) {
        self.bytes.extend_from_slice(&dword.to_le_bytes());
    }

    /// Append a signed 32-bit little-endian value.
    pub fn emit_i32(&mut self, dword: i32) {
        self.bytes.extend_from_slice(&dword.to_le_bytes());
    }

    /// Append a 64-bit little-endian value.
    pub fn emit_u64(&mut self, qword: u64) {
        self.bytes.extend_from_slice(&qword.to_le_bytes());
    }

    /// Current length, used as the offset of the next emitted byte.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// Overwrite four already-emitted bytes at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` lies past the end of the buffer. That can only
    /// happen through a bookkeeping bug in the caller.
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        assert!(
            offset + 4 <= self.bytes.len(),
            "patch at {offset:#x} runs past end of buffer ({:#x} bytes)",
            self.bytes.len()
        );
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read back the four bytes at `offset` as a signed value.
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let field = self.bytes.get(offset..offset + 4)?;
        Some(i32::from_le_bytes([field[0], field[1], field[2], field[3]]))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::CodeBuffer;

    #[test]
    fn test_little_endian_appends() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xAA);
        buf.emit_u32(0x1122_3344);
        buf.emit_u64(0x0102_0304_0506_0708);

        assert_eq!(buf.position(), 13);
        assert_eq!(
            buf.as_bytes(),
            &[0xAA, 0x44, 0x33, 0x22, 0x11, 0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_offsets_survive_growth() {
        let mut buf = CodeBuffer::with_capacity(1);
        buf.emit_u8(0xE9);
        let field = buf.position();
        buf.emit_i32(0);
        for _ in 0..10_000 {
            buf.emit_u8(0x90);
        }

        buf.patch_i32(field, -5);
        assert_eq!(buf.read_i32(field), Some(-5));
        assert_eq!(buf.as_bytes()[0], 0xE9);
    }

    #[test]
    fn test_patch_last_field() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.patch_i32(0, 0x7F00_0001);
        assert_eq!(buf.as_bytes(), &[0x01, 0x00, 0x00, 0x7F]);
    }

    #[test]
    #[should_panic(expected = "runs past end of buffer")]
    fn test_patch_out_of_bounds_panics() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0);
        buf.emit_u8(0);
        buf.emit_u8(0);
        buf.patch_i32(0, 1);
    }
}
