//! Binary layout of hardware match descriptors.
//!
//! A descriptor is an attribute header followed by a packed list of
//! match fragments. Structural fields (tags, sizes, counts, priorities)
//! are little-endian; protocol header bytes inside fragments stay in
//! network order. The layout is append-only, fragments are never
//! reordered once written.

use byteorder::{ByteOrder, LittleEndian};

/// Attribute header length. Layout:
/// `[0..2)` descriptor type, `[2..4)` priority, `[4..6)` fragment
/// count, `[6..8)` reserved.
pub(crate) const ATTR_LEN: usize = 8;

/// Descriptor type tag for a normal steering rule.
pub(crate) const DESC_TYPE_NORMAL: u16 = 1;

/// Fragment length of a fragment header: `[0..2)` fragment type,
/// `[2..4)` total fragment size including this header.
pub(crate) const FRAG_HDR_LEN: usize = 4;

/// Flag OR'ed into a fragment type when it matches inner (tunnelled)
/// headers.
pub(crate) const SPEC_INNER: u16 = 0x0100;

/// Fragment type tags.
pub(crate) mod frag {
    pub const ETH: u16 = 0x20;
    pub const IPV4: u16 = 0x30;
    pub const IPV6: u16 = 0x31;
    pub const TCP: u16 = 0x40;
    pub const UDP: u16 = 0x41;
    pub const TUNNEL: u16 = 0x50;
    pub const TAG: u16 = 0x1000;
    pub const DROP: u16 = 0x1001;
    pub const COUNT: u16 = 0x1002;
}

/// Fragment sizes, header included. Value and mask halves are the same
/// width; action fragments carry their payload directly.
pub(crate) const ETH_SPEC_SIZE: usize = FRAG_HDR_LEN + 16 + 16;
pub(crate) const IPV4_SPEC_SIZE: usize = FRAG_HDR_LEN + 12 + 12;
pub(crate) const IPV6_SPEC_SIZE: usize = FRAG_HDR_LEN + 40 + 40;
pub(crate) const TCP_UDP_SPEC_SIZE: usize = FRAG_HDR_LEN + 4 + 4;
pub(crate) const TUNNEL_SPEC_SIZE: usize = FRAG_HDR_LEN + 4 + 4;
pub(crate) const TAG_SPEC_SIZE: usize = FRAG_HDR_LEN + 4;
pub(crate) const DROP_SPEC_SIZE: usize = FRAG_HDR_LEN + 4;
pub(crate) const COUNT_SPEC_SIZE: usize = FRAG_HDR_LEN + 8;

/// Builder for one match fragment: zero-filled to its final size so
/// untouched value and mask bytes wildcard.
pub(crate) struct SpecFragment {
    bytes: Vec<u8>,
}

impl SpecFragment {
    pub(crate) fn new(ty: u16, size: usize) -> Self {
        let mut bytes = vec![0u8; size];
        LittleEndian::write_u16(&mut bytes[0..2], ty);
        LittleEndian::write_u16(&mut bytes[2..4], size as u16);
        Self { bytes }
    }

    /// Write `data` at `offset` past the fragment header.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) {
        let start = FRAG_HDR_LEN + offset;
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub(crate) fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// A hardware match descriptor under construction or ready to program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Descriptor {
    buf: Vec<u8>,
}

impl Descriptor {
    /// Start a descriptor with room for `fragment_bytes` of fragments.
    pub(crate) fn new(fragment_bytes: usize) -> Self {
        let mut buf = Vec::with_capacity(ATTR_LEN + fragment_bytes);
        buf.resize(ATTR_LEN, 0);
        LittleEndian::write_u16(&mut buf[0..2], DESC_TYPE_NORMAL);
        Self { buf }
    }

    pub(crate) fn set_priority(&mut self, priority: u16) {
        LittleEndian::write_u16(&mut self.buf[2..4], priority);
    }

    pub(crate) fn priority(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[2..4])
    }

    pub(crate) fn fragment_count(&self) -> u16 {
        LittleEndian::read_u16(&self.buf[4..6])
    }

    /// Append one finished fragment and bump the fragment count.
    pub(crate) fn append(&mut self, fragment: &[u8]) {
        self.buf.extend_from_slice(fragment);
        let n = self.fragment_count() + 1;
        LittleEndian::write_u16(&mut self.buf[4..6], n);
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn attr_bytes(&self) -> &[u8] {
        &self.buf[..ATTR_LEN]
    }

    /// Mutable view of the most recently appended fragment, header
    /// included. Used to merge VLAN tags into an Ethernet fragment
    /// already written out.
    pub(crate) fn last_fragment_mut(&mut self) -> Option<&mut [u8]> {
        let mut cursor = ATTR_LEN;
        let mut last = None;
        while cursor + FRAG_HDR_LEN <= self.buf.len() {
            let size = LittleEndian::read_u16(&self.buf[cursor + 2..cursor + 4]) as usize;
            if size < FRAG_HDR_LEN || cursor + size > self.buf.len() {
                break;
            }
            last = Some((cursor, size));
            cursor += size;
        }
        last.map(move |(off, size)| &mut self.buf[off..off + size])
    }

    /// Iterate the packed fragments in order.
    pub(crate) fn fragments(&self) -> Fragments<'_> {
        Fragments {
            buf: &self.buf,
            cursor: ATTR_LEN,
        }
    }
}

/// One decoded fragment view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FragmentRef<'a> {
    pub ty: u16,
    pub bytes: &'a [u8],
}

pub(crate) struct Fragments<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> Iterator for Fragments<'a> {
    type Item = FragmentRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor + FRAG_HDR_LEN > self.buf.len() {
            return None;
        }
        let ty = LittleEndian::read_u16(&self.buf[self.cursor..self.cursor + 2]);
        let size = LittleEndian::read_u16(&self.buf[self.cursor + 2..self.cursor + 4]) as usize;
        if size < FRAG_HDR_LEN || self.cursor + size > self.buf.len() {
            return None;
        }
        let bytes = &self.buf[self.cursor..self.cursor + size];
        self.cursor += size;
        Some(FragmentRef { ty, bytes })
    }
}

/// Empty (wildcard) filler fragment for a missing protocol layer.
pub(crate) fn filler(ty: u16, size: usize) -> Vec<u8> {
    SpecFragment::new(ty, size).finish()
}
