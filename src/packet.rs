//! Copy-on-write packet buffers
//!
//! A [`Packet`] is a payload window inside a shared buffer, with
//! headroom before the window and tailroom after it, plus a fixed-size
//! annotation block that travels with the handle. Cloning a packet is
//! O(1) and shares the payload; mutating the payload goes through
//! [`Packet::data_mut`], which copies the buffer first if it is shared.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Size of the annotation block, in bytes.
pub const ANNO_SIZE: usize = 48;

/// Default headroom reserved when a packet is created, leaving room to
/// prepend encapsulation headers without reallocating.
pub const DEFAULT_HEADROOM: usize = 64;

const ANNO_DST_IP: usize = 0; // u32, network order
const ANNO_TIMESTAMP: usize = 4; // u64, microseconds
const ANNO_EXTRA_LENGTH: usize = 12; // u32, virtual padding bytes
const ANNO_DST_MAC: usize = 16; // 6 bytes
const ANNO_PAINT: usize = 22; // u8
const ANNO_USER: usize = 24; // scratch from here to ANNO_SIZE

/// Per-handle packet metadata. Copied on clone, never shared.
#[derive(Clone)]
pub struct Annotations {
    bytes: [u8; ANNO_SIZE],
}

impl Annotations {
    fn new() -> Self {
        Annotations {
            bytes: [0; ANNO_SIZE],
        }
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        let raw: [u8; 4] = self.bytes[ANNO_DST_IP..ANNO_DST_IP + 4]
            .try_into()
            .unwrap_or([0; 4]);
        Ipv4Addr::from(raw)
    }

    pub fn set_dst_ip(&mut self, addr: Ipv4Addr) {
        self.bytes[ANNO_DST_IP..ANNO_DST_IP + 4].copy_from_slice(&addr.octets());
    }

    /// Timestamp in microseconds. Zero means unset.
    pub fn timestamp_usec(&self) -> u64 {
        u64::from_ne_bytes(
            self.bytes[ANNO_TIMESTAMP..ANNO_TIMESTAMP + 8]
                .try_into()
                .unwrap_or([0; 8]),
        )
    }

    pub fn set_timestamp_usec(&mut self, usec: u64) {
        self.bytes[ANNO_TIMESTAMP..ANNO_TIMESTAMP + 8].copy_from_slice(&usec.to_ne_bytes());
    }

    /// Extra length: bytes the packet counts as carrying beyond its
    /// real payload, used by link emulators for virtual padding.
    pub fn extra_length(&self) -> u32 {
        u32::from_ne_bytes(
            self.bytes[ANNO_EXTRA_LENGTH..ANNO_EXTRA_LENGTH + 4]
                .try_into()
                .unwrap_or([0; 4]),
        )
    }

    pub fn set_extra_length(&mut self, len: u32) {
        self.bytes[ANNO_EXTRA_LENGTH..ANNO_EXTRA_LENGTH + 4].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn dst_mac(&self) -> [u8; 6] {
        self.bytes[ANNO_DST_MAC..ANNO_DST_MAC + 6]
            .try_into()
            .unwrap_or([0; 6])
    }

    pub fn set_dst_mac(&mut self, mac: [u8; 6]) {
        self.bytes[ANNO_DST_MAC..ANNO_DST_MAC + 6].copy_from_slice(&mac);
    }

    pub fn paint(&self) -> u8 {
        self.bytes[ANNO_PAINT]
    }

    pub fn set_paint(&mut self, color: u8) {
        self.bytes[ANNO_PAINT] = color;
    }

    /// Raw scratch area for per-subsystem use.
    pub fn user(&self) -> &[u8] {
        &self.bytes[ANNO_USER..]
    }

    pub fn user_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[ANNO_USER..]
    }
}

/// An opaque packet: shared payload window plus per-handle annotations.
pub struct Packet {
    buf: Arc<Vec<u8>>,
    head: usize,
    len: usize,
    anno: Annotations,
}

impl Packet {
    /// Allocate a packet with the given payload and default headroom.
    pub fn new(payload: &[u8]) -> Self {
        Self::with_headroom(payload, DEFAULT_HEADROOM, 0)
    }

    /// Allocate a zero-filled packet of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        let buf = vec![0u8; DEFAULT_HEADROOM + len];
        Packet {
            buf: Arc::new(buf),
            head: DEFAULT_HEADROOM,
            len,
            anno: Annotations::new(),
        }
    }

    pub fn with_headroom(payload: &[u8], headroom: usize, tailroom: usize) -> Self {
        let mut buf = vec![0u8; headroom + payload.len() + tailroom];
        buf[headroom..headroom + payload.len()].copy_from_slice(payload);
        Packet {
            buf: Arc::new(buf),
            head: headroom,
            len: payload.len(),
            anno: Annotations::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.head - self.len
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }

    /// True while this handle is the only owner of the buffer.
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.buf) == 1
    }

    /// Make this handle the sole owner of its buffer, copying it if
    /// any other handle still shares it. Required before payload
    /// mutation; [`Packet::data_mut`] calls it for you.
    pub fn uniqueify(&mut self) {
        if !self.is_unique() {
            self.buf = Arc::new(self.buf.as_ref().clone());
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.uniqueify();
        let (head, len) = (self.head, self.len);
        // strong_count == 1 after uniqueify, so get_mut cannot fail
        let buf = Arc::get_mut(&mut self.buf).expect("uniqueified packet still shared");
        &mut buf[head..head + len]
    }

    /// Extend the payload window backwards into headroom, returning the
    /// newly exposed prefix. Fails when headroom is exhausted.
    pub fn push_header(&mut self, nbytes: usize) -> Option<&mut [u8]> {
        if self.head < nbytes {
            return None;
        }
        self.uniqueify();
        self.head -= nbytes;
        self.len += nbytes;
        let (head, _) = (self.head, self.len);
        let buf = Arc::get_mut(&mut self.buf).expect("uniqueified packet still shared");
        Some(&mut buf[head..head + nbytes])
    }

    /// Strip `nbytes` from the front of the payload window. Window
    /// bookkeeping is per-handle, so no copy happens.
    pub fn pull_header(&mut self, nbytes: usize) -> bool {
        if self.len < nbytes {
            return false;
        }
        self.head += nbytes;
        self.len -= nbytes;
        true
    }

    /// Extend the payload window into tailroom, returning the newly
    /// exposed suffix.
    pub fn put(&mut self, nbytes: usize) -> Option<&mut [u8]> {
        if self.tailroom() < nbytes {
            return None;
        }
        self.uniqueify();
        let start = self.head + self.len;
        self.len += nbytes;
        let buf = Arc::get_mut(&mut self.buf).expect("uniqueified packet still shared");
        Some(&mut buf[start..start + nbytes])
    }

    /// Trim `nbytes` off the tail of the payload window.
    pub fn take(&mut self, nbytes: usize) -> bool {
        if self.len < nbytes {
            return false;
        }
        self.len -= nbytes;
        true
    }

    pub fn anno(&self) -> &Annotations {
        &self.anno
    }

    pub fn anno_mut(&mut self) -> &mut Annotations {
        &mut self.anno
    }
}

impl Clone for Packet {
    /// Shared view of the same payload; annotations are copied so each
    /// handle scribbles on its own block.
    fn clone(&self) -> Self {
        Packet {
            buf: Arc::clone(&self.buf),
            head: self.head,
            len: self.len,
            anno: self.anno.clone(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .field("shared", &!self.is_unique())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accounting() {
        let p = Packet::with_headroom(b"hello", 16, 8);
        assert_eq!(p.len(), 5);
        assert_eq!(p.headroom(), 16);
        assert_eq!(p.tailroom(), 8);
        assert_eq!(p.data(), b"hello");
    }

    #[test]
    fn test_clone_shares_until_write() {
        let mut a = Packet::new(b"abcd");
        let b = a.clone();
        assert!(!a.is_unique());
        assert!(!b.is_unique());

        a.data_mut()[0] = b'X';
        assert_eq!(a.data(), b"Xbcd");
        // the other handle kept the original bytes
        assert_eq!(b.data(), b"abcd");
        assert!(b.is_unique());
    }

    #[test]
    fn test_pull_header_needs_no_copy() {
        let mut a = Packet::new(b"eth-hdr:payload");
        let b = a.clone();
        assert!(a.pull_header(8));
        assert_eq!(a.data(), b"payload");
        assert_eq!(b.data(), b"eth-hdr:payload");
        // still sharing: pull only moved this handle's window
        assert!(!a.is_unique());
    }

    #[test]
    fn test_push_header_and_put() {
        let mut p = Packet::with_headroom(b"ip", 4, 4);
        p.push_header(4).unwrap().copy_from_slice(b"mac_");
        assert_eq!(p.data(), b"mac_ip");
        assert!(p.push_header(1).is_none());

        p.put(2).unwrap().copy_from_slice(b"ck");
        assert_eq!(p.data(), b"mac_ipck");
        assert!(p.take(6));
        assert_eq!(p.data(), b"ma");
    }

    #[test]
    fn test_annotations_copied_per_handle() {
        let mut a = Packet::new(b"x");
        a.anno_mut().set_paint(7);
        a.anno_mut().set_dst_ip(Ipv4Addr::new(10, 0, 0, 1));

        let mut b = a.clone();
        b.anno_mut().set_paint(9);

        assert_eq!(a.anno().paint(), 7);
        assert_eq!(b.anno().paint(), 9);
        assert_eq!(b.anno().dst_ip(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn test_extra_length_round_trip() {
        let mut p = Packet::zeroed(64);
        assert_eq!(p.anno().extra_length(), 0);
        p.anno_mut().set_extra_length(1436);
        assert_eq!(p.anno().extra_length(), 1436);
        assert_eq!(p.len(), 64);
    }
}
