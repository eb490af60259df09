//! Attribute buffer encoding.
//!
//! The wire format is deliberately C-ABI shaped: each top-level attribute
//! occupies a fixed 16-byte slot. Fixed-width scalars sit at offset 0 of
//! their slot with the upper bytes undefined; strings and arrays store a
//! `{pointer, length}` pair instead, with array elements following the
//! element's native stride and no slot padding applied to *inner* elements
//! (only top-level attributes are slot-aligned).
//!
//! Decoding a slot requires knowing its expected shape (scalar kind, or
//! array-of-what), which the op descriptor in `tensor-runtime::registry`
//! supplies — there is no self-describing tag byte in the wire format
//! itself.

use std::convert::TryInto;

/// Byte width of one top-level attribute slot.
pub const ATTR_SLOT_BYTES: usize = 16;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Bool(bool),
    I64(i64),
    F32(f32),
    String(Vec<u8>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
}

/// Describes how to interpret one attribute slot when decoding an
/// [`AttrValue`] out of a raw 16-byte buffer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AttrKind {
    Bool,
    I64,
    F32,
    String,
    I64Array,
    F32Array,
}

/// A packed attribute buffer: a flat sequence of 16-byte slots.
#[derive(Debug, Clone, Default)]
pub struct AttrBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> AttrBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        debug_assert_eq!(
            bytes.len() % ATTR_SLOT_BYTES,
            0,
            "attribute buffer length must be a multiple of {ATTR_SLOT_BYTES} bytes"
        );
        Self { bytes }
    }

    pub fn slot_count(&self) -> usize {
        self.bytes.len() / ATTR_SLOT_BYTES
    }

    fn slot(&self, index: usize) -> &'a [u8] {
        let start = index * ATTR_SLOT_BYTES;
        &self.bytes[start..start + ATTR_SLOT_BYTES]
    }

    /// Decode the slot at `index` according to `kind`.
    ///
    /// # Panics
    /// Panics (a contract violation, not a recoverable `Error`) if `index`
    /// is out of range or a `{pointer, length}` slot's pointer does not
    /// resolve within `arena` — the attribute encoder and decoder are
    /// expected to agree on the schema out of band (via the op descriptor).
    pub fn decode(&self, index: usize, kind: AttrKind, arena: &'a [u8]) -> AttrValue {
        let slot = self.slot(index);
        match kind {
            AttrKind::Bool => AttrValue::Bool(slot[0] != 0),
            AttrKind::I64 => AttrValue::I64(i64::from_le_bytes(slot[0..8].try_into().unwrap())),
            AttrKind::F32 => AttrValue::F32(f32::from_le_bytes(slot[0..4].try_into().unwrap())),
            AttrKind::String => {
                let (ptr, len) = decode_ptr_len(slot);
                AttrValue::String(arena[ptr..ptr + len].to_vec())
            }
            AttrKind::I64Array => {
                let (ptr, len) = decode_ptr_len(slot);
                let raw = &arena[ptr..ptr + len * 8];
                AttrValue::I64Array(
                    raw.chunks_exact(8)
                        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
                        .collect(),
                )
            }
            AttrKind::F32Array => {
                let (ptr, len) = decode_ptr_len(slot);
                let raw = &arena[ptr..ptr + len * 4];
                AttrValue::F32Array(
                    raw.chunks_exact(4)
                        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
                        .collect(),
                )
            }
        }
    }
}

/// `{pointer, length}` pairs store the pointer as a byte offset into the
/// caller-supplied arena (rather than a raw machine pointer) so that the
/// encode/decode round trip is representable — and testable — entirely in
/// safe Rust.
fn decode_ptr_len(slot: &[u8]) -> (usize, usize) {
    let ptr = u64::from_le_bytes(slot[0..8].try_into().unwrap()) as usize;
    let len = u64::from_le_bytes(slot[8..16].try_into().unwrap()) as usize;
    (ptr, len)
}

/// Encodes attribute values into the wire format, for use by tests and by
/// any in-process frontend that wants to exercise the real decode path
/// instead of calling typed constructors directly.
#[derive(Debug, Default)]
pub struct AttrEncoder {
    slots: Vec<u8>,
    arena: Vec<u8>,
}

impl AttrEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_slot(&mut self, slot: [u8; ATTR_SLOT_BYTES]) {
        self.slots.extend_from_slice(&slot);
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        let mut slot = [0u8; ATTR_SLOT_BYTES];
        slot[0] = v as u8;
        self.push_slot(slot);
        self
    }

    pub fn push_i64(&mut self, v: i64) -> &mut Self {
        let mut slot = [0u8; ATTR_SLOT_BYTES];
        slot[0..8].copy_from_slice(&v.to_le_bytes());
        self.push_slot(slot);
        self
    }

    pub fn push_f32(&mut self, v: f32) -> &mut Self {
        let mut slot = [0u8; ATTR_SLOT_BYTES];
        slot[0..4].copy_from_slice(&v.to_le_bytes());
        self.push_slot(slot);
        self
    }

    pub fn push_string(&mut self, v: &[u8]) -> &mut Self {
        self.push_ptr_len(v);
        self
    }

    pub fn push_i64_array(&mut self, v: &[i64]) -> &mut Self {
        let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        self.push_ptr_len_raw(&bytes, v.len());
        self
    }

    pub fn push_f32_array(&mut self, v: &[f32]) -> &mut Self {
        let bytes: Vec<u8> = v.iter().flat_map(|x| x.to_le_bytes()).collect();
        self.push_ptr_len_raw(&bytes, v.len());
        self
    }

    fn push_ptr_len(&mut self, bytes: &[u8]) {
        self.push_ptr_len_raw(bytes, bytes.len());
    }

    fn push_ptr_len_raw(&mut self, bytes: &[u8], element_count: usize) {
        let ptr = self.arena.len() as u64;
        self.arena.extend_from_slice(bytes);
        let mut slot = [0u8; ATTR_SLOT_BYTES];
        slot[0..8].copy_from_slice(&ptr.to_le_bytes());
        slot[8..16].copy_from_slice(&(element_count as u64).to_le_bytes());
        self.push_slot(slot);
    }

    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.slots, self.arena)
    }
}
