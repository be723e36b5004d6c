// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Address-space graphics (ASG) rings laid over a ring blob.
//!
//! ```text
//! [0, 16)         to_host_write, to_host_read, from_host_write, from_host_read (u32 each)
//! [16, 64)        reserved
//! [64, 64+cap)    to-host ring
//! [64+cap, 64+2*cap) from-host ring
//! ```
//!
//! Cursors are free-running `u32` byte positions.  The guest produces into the to-host ring and
//! consumes the from-host ring; the host does the opposite.  Each side only stores to its own
//! cursors and reads the peer's with acquire ordering.  The peer's cursors are validated on
//! every load; a distance larger than the ring is reported as [`ProtocolError::RingOverrun`].

use std::marker::PhantomData;
use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;
use crate::gfxstream_utils::ProtocolError;
use crate::ring_blob::RingBlob;

pub const ASG_HEADER_SIZE: usize = 64;

const TO_HOST_WRITE: usize = 0;
const TO_HOST_READ: usize = 4;
const FROM_HOST_WRITE: usize = 8;
const FROM_HOST_READ: usize = 12;

/// The two rings of one transport blob.
pub struct AsgRing {
    base: NonNull<u8>,
    capacity: usize,
    _backing: Option<Arc<RingBlob>>,
}

// Safe because all shared state is accessed through atomics or disjoint ring regions.
unsafe impl Send for AsgRing {}
unsafe impl Sync for AsgRing {}

impl AsgRing {
    /// Largest power of two that fits both rings behind the header.
    pub fn capacity_for(size: usize) -> usize {
        let per_ring = size.saturating_sub(ASG_HEADER_SIZE) / 2;
        if per_ring == 0 {
            0
        } else {
            1usize << (usize::BITS - 1 - per_ring.leading_zeros())
        }
    }

    pub fn new(blob: Arc<RingBlob>) -> GfxstreamResult<AsgRing> {
        let size = blob.size().try_into()?;
        // Safe because the blob mapping lives as long as the Arc we keep.
        let mut ring = unsafe { AsgRing::from_raw(blob.map(), size)? };
        ring._backing = Some(blob);
        Ok(ring)
    }

    /// # Safety
    /// `ptr` must be valid for reads and writes of `size` bytes for the lifetime of the ring.
    pub unsafe fn from_raw(ptr: *mut u8, size: usize) -> GfxstreamResult<AsgRing> {
        let base = NonNull::new(ptr).ok_or(GfxstreamError::InvalidIovec)?;
        if (ptr as usize) % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(GfxstreamError::InvalidIovec);
        }

        let capacity = AsgRing::capacity_for(size);
        if capacity == 0 || capacity > (1 << 31) {
            return Err(GfxstreamError::InvalidCommandSize(size));
        }

        Ok(AsgRing {
            base,
            capacity,
            _backing: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn cursor(&self, offset: usize) -> &AtomicU32 {
        // Safe because the header is in bounds, aligned and only accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn ring(&self, write: usize, read: usize, data_offset: usize) -> ByteRing<'_> {
        ByteRing {
            write_pos: self.cursor(write),
            read_pos: self.cursor(read),
            // Safe because both rings lie within the mapping.
            data: unsafe { self.base.as_ptr().add(data_offset) },
            capacity: self.capacity,
            _marker: PhantomData,
        }
    }

    /// Guest to host commands.
    pub fn to_host(&self) -> ByteRing<'_> {
        self.ring(TO_HOST_WRITE, TO_HOST_READ, ASG_HEADER_SIZE)
    }

    /// Host to guest replies.
    pub fn from_host(&self) -> ByteRing<'_> {
        self.ring(
            FROM_HOST_WRITE,
            FROM_HOST_READ,
            ASG_HEADER_SIZE + self.capacity,
        )
    }
}

/// Single-producer single-consumer byte ring.
pub struct ByteRing<'a> {
    write_pos: &'a AtomicU32,
    read_pos: &'a AtomicU32,
    data: *mut u8,
    capacity: usize,
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> ByteRing<'a> {
    fn mask(&self, pos: u32) -> usize {
        pos as usize & (self.capacity - 1)
    }

    /// Bytes the consumer may read.
    pub fn available(&self) -> GfxstreamResult<usize> {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        let available = write.wrapping_sub(read) as usize;
        if available > self.capacity {
            return Err(ProtocolError::RingOverrun {
                available,
                capacity: self.capacity,
            }
            .into());
        }
        Ok(available)
    }

    /// Bytes the producer may write.
    pub fn free(&self) -> GfxstreamResult<usize> {
        Ok(self.capacity - self.available()?)
    }

    /// Producer side.  Copies as much of `bytes` as fits and returns the count.
    pub fn write(&self, bytes: &[u8]) -> GfxstreamResult<usize> {
        let len = bytes.len().min(self.free()?);
        if len == 0 {
            return Ok(0);
        }

        let write = self.write_pos.load(Ordering::Relaxed);
        let start = self.mask(write);
        let first = len.min(self.capacity - start);
        // Safe because len <= capacity, so [start, start + first) and [0, len - first) are
        // inside the ring and not readable by the consumer until the cursor is published.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(start), first);
            ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.data, len - first);
        }
        self.write_pos
            .store(write.wrapping_add(len as u32), Ordering::Release);
        Ok(len)
    }

    /// Consumer side.  Fills as much of `out` as is available and returns the count.
    pub fn read(&self, out: &mut [u8]) -> GfxstreamResult<usize> {
        let len = out.len().min(self.available()?);
        if len == 0 {
            return Ok(0);
        }

        let read = self.read_pos.load(Ordering::Relaxed);
        let start = self.mask(read);
        let first = len.min(self.capacity - start);
        // Safe because len <= capacity keeps both copies inside the ring, and the producer
        // published these bytes before moving its cursor.
        unsafe {
            ptr::copy_nonoverlapping(self.data.add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.data, out.as_mut_ptr().add(first), len - first);
        }
        self.read_pos
            .store(read.wrapping_add(len as u32), Ordering::Release);
        Ok(len)
    }

    /// Consumer side.  Appends everything available to `out`.
    pub fn drain_into(&self, out: &mut Vec<u8>) -> GfxstreamResult<usize> {
        let old_len = out.len();
        out.resize(old_len + self.available()?, 0);
        let n = self.read(&mut out[old_len..])?;
        out.truncate(old_len + n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity() {
        assert_eq!(AsgRing::capacity_for(64), 0);
        assert_eq!(AsgRing::capacity_for(64 + 2 * 1024), 1024);
        assert_eq!(AsgRing::capacity_for(4096), 1024);
        assert_eq!(AsgRing::capacity_for(64 + 2 * 2047), 1024);
    }

    #[test]
    fn guest_and_host_views_share_cursors() {
        let blob = Arc::new(RingBlob::create_with_host_memory(1, 4096, 8).unwrap());
        let host = AsgRing::new(blob.clone()).unwrap();
        let guest = unsafe { AsgRing::from_raw(blob.map(), 4096).unwrap() };
        assert_eq!(host.capacity(), 1024);

        assert_eq!(guest.to_host().write(b"hello").unwrap(), 5);
        assert_eq!(host.to_host().available().unwrap(), 5);

        let mut buf = Vec::new();
        host.to_host().drain_into(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(host.to_host().available().unwrap(), 0);

        host.from_host().write(b"ok").unwrap();
        let mut reply = [0u8; 2];
        assert_eq!(guest.from_host().read(&mut reply).unwrap(), 2);
        assert_eq!(&reply, b"ok");
    }

    #[test]
    fn wraps_and_respects_capacity() {
        let blob = Arc::new(RingBlob::create_with_host_memory(2, 64 + 2 * 16, 8).unwrap());
        let ring = AsgRing::new(blob).unwrap();
        let to_host = ring.to_host();

        assert_eq!(to_host.write(&[1; 12]).unwrap(), 12);
        let mut out = [0u8; 12];
        assert_eq!(to_host.read(&mut out).unwrap(), 12);

        // Crosses the end of the 16 byte ring.
        let data: Vec<u8> = (0..10).collect();
        assert_eq!(to_host.write(&data).unwrap(), 10);
        assert_eq!(to_host.write(&[0xff; 10]).unwrap(), 6);
        assert_eq!(to_host.free().unwrap(), 0);

        let mut out = Vec::new();
        to_host.drain_into(&mut out).unwrap();
        assert_eq!(&out[..10], &data[..]);
        assert_eq!(&out[10..], &[0xff; 6]);
    }

    #[test]
    fn scribbled_cursor_is_an_overrun() {
        let blob = Arc::new(RingBlob::create_with_host_memory(3, 64 + 2 * 16, 8).unwrap());
        let host = AsgRing::new(blob.clone()).unwrap();
        assert_eq!(host.to_host().write(&[7; 4]).unwrap(), 4);

        // The guest owns the blob and can store anything over the header.
        unsafe { (blob.map() as *mut u32).write_volatile(0x1000) };
        let to_host = host.to_host();
        let overrun = ProtocolError::RingOverrun {
            available: 0x1000,
            capacity: 16,
        };
        assert!(matches!(
            to_host.available(),
            Err(GfxstreamError::Protocol(ref e)) if *e == overrun
        ));
        assert!(to_host.free().is_err());
        assert!(to_host.write(&[1]).is_err());

        let mut out = vec![0u8; 3];
        assert!(to_host.read(&mut out).is_err());
        assert_eq!(out, [0u8; 3]);
        let mut drained = Vec::new();
        assert!(to_host.drain_into(&mut drained).is_err());
        assert!(drained.is_empty());
        assert!(to_host.available().unwrap_err().is_fatal());

        unsafe { (blob.map() as *mut u32).write_volatile(0) };
        assert_eq!(to_host.available().unwrap(), 0);

        // A reader ahead of the writer wraps to a huge distance as well.
        unsafe { (blob.map() as *mut u32).add(1).write_volatile(4) };
        assert!(to_host.available().is_err());
    }
}
