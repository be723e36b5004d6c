// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Packet framing: `{opcode: u32 LE, packet_len: u32 LE, payload, checksum trailer}`.
//!
//! Fixed-size primitives are little-endian.  Arrays and strings carry a big-endian `u32`
//! length marker followed by raw bytes; strings are not NUL terminated on the wire and the
//! decoder appends the terminator.

use std::convert::TryInto;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::gfxstream_utils::ProtocolError;
use crate::wire::ChecksumCalculator;

pub const PACKET_HEADER_SIZE: usize = 8;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct PacketHeader {
    opcode: u32,
    packet_len: u32,
}

impl PacketHeader {
    pub fn new(opcode: u32, packet_len: u32) -> PacketHeader {
        PacketHeader {
            opcode: opcode.to_le(),
            packet_len: packet_len.to_le(),
        }
    }

    pub fn read(bytes: &[u8]) -> Option<PacketHeader> {
        PacketHeader::read_from_prefix(bytes)
    }

    pub fn opcode(&self) -> u32 {
        u32::from_le(self.opcode)
    }

    /// Total length including the header and any checksum trailer.
    pub fn packet_len(&self) -> usize {
        u32::from_le(self.packet_len) as usize
    }
}

/// Looks for one complete packet at the front of `buf`.
///
/// Returns `Ok(None)` until enough bytes are buffered.  `trailer_size` is the checksum size
/// under the stream's current version.
pub fn next_packet(
    buf: &[u8],
    trailer_size: usize,
) -> Result<Option<PacketHeader>, ProtocolError> {
    let header = match PacketHeader::read(buf) {
        Some(h) => h,
        None => return Ok(None),
    };

    let minimum = PACKET_HEADER_SIZE + trailer_size;
    if header.packet_len() < minimum {
        return Err(ProtocolError::PacketTooShort {
            needed: minimum - header.packet_len(),
        });
    }

    if buf.len() < header.packet_len() {
        return Ok(None);
    }

    Ok(Some(header))
}

/// Serializes the arguments of one call, or the return values of one call when built with
/// `reply()`.
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new(opcode: u32) -> Encoder {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(PacketHeader::new(opcode, 0).as_bytes());
        Encoder { buf }
    }

    /// Replies carry no header; the guest knows their layout from the call it made.
    pub fn reply() -> Encoder {
        Encoder { buf: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn put_f32(&mut self, v: f32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// An optional handle; `None` travels as the null sentinel 0.
    pub fn put_handle(&mut self, v: Option<u64>) -> &mut Self {
        self.put_u64(v.unwrap_or(0))
    }

    fn put_marker(&mut self, len: usize) -> &mut Self {
        self.buf.extend_from_slice(&(len as u32).to_be_bytes());
        self
    }

    /// A variable-length byte array.
    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.put_marker(v.len());
        self.buf.extend_from_slice(v);
        self
    }

    pub fn put_u32_array(&mut self, v: &[u32]) -> &mut Self {
        self.put_marker(v.len());
        for e in v {
            self.put_u32(*e);
        }
        self
    }

    pub fn put_u64_array(&mut self, v: &[u64]) -> &mut Self {
        self.put_marker(v.len());
        for e in v {
            self.put_u64(*e);
        }
        self
    }

    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.put_bytes(v.as_bytes())
    }

    pub fn put_string_array(&mut self, v: &[&str]) -> &mut Self {
        self.put_marker(v.len());
        for s in v {
            self.put_string(s);
        }
        self
    }

    /// Patches the header length, appends the checksum trailer and returns the packet.
    pub fn finish(mut self, checksum: &mut ChecksumCalculator) -> Vec<u8> {
        let total = self.buf.len() + checksum.checksum_byte_size();
        let header = PacketHeader::new(self.opcode(), total as u32);
        self.buf[..PACKET_HEADER_SIZE].copy_from_slice(header.as_bytes());

        let mut trailer = Vec::new();
        checksum.write_checksum(&self.buf, &mut trailer);
        self.buf.extend_from_slice(&trailer);
        self.buf
    }

    /// Appends the checksum trailer to a reply.  Calls without return values produce no bytes
    /// at all, and so no trailer.
    pub fn finish_reply(mut self, checksum: &mut ChecksumCalculator) -> Vec<u8> {
        if self.buf.is_empty() {
            return self.buf;
        }
        let mut trailer = Vec::new();
        checksum.write_checksum(&self.buf, &mut trailer);
        self.buf.extend_from_slice(&trailer);
        self.buf
    }

    fn opcode(&self) -> u32 {
        PacketHeader::read(&self.buf)
            .map(|h| h.opcode())
            .unwrap_or_default()
    }
}

/// Reads the arguments of one call out of its payload.
pub struct Decoder<'a> {
    opcode: u32,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(opcode: u32, payload: &'a [u8]) -> Decoder<'a> {
        Decoder {
            opcode,
            buf: payload,
            pos: 0,
        }
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Discards the undecoded arguments of a call the server will not run.
    pub fn skip_remaining(&mut self) {
        self.pos = self.buf.len();
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::PacketTooShort {
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let bytes = self.take(N)?;
        // The slice is exactly N bytes long.
        Ok(bytes.try_into().unwrap_or([0u8; N]))
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn get_handle(&mut self) -> Result<Option<u64>, ProtocolError> {
        let v = self.get_u64()?;
        Ok(if v == 0 { None } else { Some(v) })
    }

    fn get_marker(&mut self, element_size: usize) -> Result<usize, ProtocolError> {
        let count = u32::from_be_bytes(self.take_array()?) as usize;
        let declared = count.saturating_mul(element_size);
        if declared > self.remaining() {
            return Err(ProtocolError::StringOverflow {
                declared,
                available: self.remaining(),
            });
        }
        Ok(count)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.get_marker(1)?;
        self.take(len)
    }

    pub fn get_u32_array(&mut self) -> Result<Vec<u32>, ProtocolError> {
        let count = self.get_marker(4)?;
        (0..count).map(|_| self.get_u32()).collect()
    }

    pub fn get_u64_array(&mut self) -> Result<Vec<u64>, ProtocolError> {
        let count = self.get_marker(8)?;
        (0..count).map(|_| self.get_u64()).collect()
    }

    /// Returns the string bytes with a NUL terminator appended.
    pub fn get_string(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut s = self.get_bytes()?.to_vec();
        s.push(0);
        Ok(s)
    }

    /// Convenience for callers that only want text; invalid UTF-8 is replaced.
    pub fn get_str(&mut self) -> Result<String, ProtocolError> {
        let s = self.get_bytes()?;
        Ok(String::from_utf8_lossy(s).into_owned())
    }

    pub fn get_string_array(&mut self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        // Every string needs at least its own marker.
        let count = self.get_marker(4)?;
        (0..count).map(|_| self.get_string()).collect()
    }

    /// Fails unless every payload byte was consumed.
    pub fn finish(self) -> Result<(), ProtocolError> {
        if self.pos != self.buf.len() {
            return Err(ProtocolError::PayloadLength {
                opcode: self.opcode,
                declared: self.buf.len(),
                decoded: self.pos,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(packet: &[u8]) -> &[u8] {
        &packet[PACKET_HEADER_SIZE..]
    }

    #[test]
    fn primitives_and_markers() {
        let mut checksum = ChecksumCalculator::new();
        let mut enc = Encoder::new(10000);
        enc.put_u32(0xdead_beef)
            .put_i32(-7)
            .put_u64(u64::MAX - 1)
            .put_f32(1.5)
            .put_handle(None)
            .put_handle(Some(9))
            .put_string("abc")
            .put_u32_array(&[1, 2, 3])
            .put_string_array(&["x", "yz"]);
        let packet = enc.finish(&mut checksum);

        let header = PacketHeader::read(&packet).unwrap();
        assert_eq!(header.opcode(), 10000);
        assert_eq!(header.packet_len(), packet.len());

        let mut dec = Decoder::new(header.opcode(), payload(&packet));
        assert_eq!(dec.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(dec.get_i32().unwrap(), -7);
        assert_eq!(dec.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(dec.get_f32().unwrap(), 1.5);
        assert_eq!(dec.get_handle().unwrap(), None);
        assert_eq!(dec.get_handle().unwrap(), Some(9));
        assert_eq!(dec.get_string().unwrap(), b"abc\0");
        assert_eq!(dec.get_u32_array().unwrap(), vec![1, 2, 3]);
        assert_eq!(
            dec.get_string_array().unwrap(),
            vec![b"x\0".to_vec(), b"yz\0".to_vec()]
        );
        dec.finish().unwrap();
    }

    #[test]
    fn strings_are_big_endian_and_unterminated() {
        let mut checksum = ChecksumCalculator::new();
        let mut enc = Encoder::new(1);
        enc.put_string("hi");
        let packet = enc.finish(&mut checksum);
        assert_eq!(payload(&packet), &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn leftover_payload_is_a_length_error() {
        let mut dec = Decoder::new(5, &[1, 0, 0, 0, 9]);
        assert_eq!(dec.get_u32().unwrap(), 1);
        assert_eq!(
            dec.finish(),
            Err(ProtocolError::PayloadLength {
                opcode: 5,
                declared: 5,
                decoded: 4
            })
        );
    }

    #[test]
    fn overflowing_marker() {
        let mut dec = Decoder::new(5, &[0, 0, 1, 0, 1, 2]);
        assert_eq!(
            dec.get_bytes(),
            Err(ProtocolError::StringOverflow {
                declared: 256,
                available: 2
            })
        );
    }

    #[test]
    fn short_reads() {
        let mut dec = Decoder::new(5, &[1, 2]);
        assert_eq!(
            dec.get_u32(),
            Err(ProtocolError::PacketTooShort { needed: 2 })
        );
    }

    #[test]
    fn framing_waits_for_complete_packets() {
        let mut checksum = ChecksumCalculator::new();
        checksum.set_version(1);
        let mut enc = Encoder::new(7);
        enc.put_u32(3);
        let packet = enc.finish(&mut checksum);
        assert_eq!(packet.len(), PACKET_HEADER_SIZE + 4 + 8);

        assert!(next_packet(&packet[..4], 8).unwrap().is_none());
        assert!(next_packet(&packet[..15], 8).unwrap().is_none());
        let header = next_packet(&packet, 8).unwrap().unwrap();
        assert_eq!(header.packet_len(), packet.len());

        let bogus = PacketHeader::new(7, 4);
        assert!(next_packet(bogus.as_bytes(), 0).is_err());
    }

    #[test]
    fn replies_are_unframed() {
        let mut host = ChecksumCalculator::new();
        host.set_version(1);
        assert!(Encoder::reply().finish_reply(&mut host).is_empty());

        let mut enc = Encoder::reply();
        enc.put_i32(-1);
        let reply = enc.finish_reply(&mut host);
        assert_eq!(reply.len(), 4 + 8);

        let mut guest = ChecksumCalculator::new();
        guest.set_version(1);
        assert!(guest.validate(&reply[..4], &reply[4..]));
    }
}
