// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use libc::c_void;
use log::error;
use nix::sys::mman::mmap;
use nix::sys::mman::mmap_anonymous;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;

use crate::gfxstream_os::descriptor::SafeDescriptor;
use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;

use crate::gfxstream_utils::GFXSTREAM_MAP_ACCESS_MASK;
use crate::gfxstream_utils::GFXSTREAM_MAP_ACCESS_READ;
use crate::gfxstream_utils::GFXSTREAM_MAP_ACCESS_RW;
use crate::gfxstream_utils::GFXSTREAM_MAP_ACCESS_WRITE;

/// Wraps a shared memory mapping in the current process. Provides RAII semantics including
/// munmap when no longer needed.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: NonNull<c_void>,
    size: usize,
}

// Safe because the mapping is owned and only unmapped on drop.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // This is safe because we mmap the area at addr ourselves, and nobody
        // else is holding a reference to it.
        if let Err(e) = unsafe { munmap(self.addr, self.size) } {
            error!("munmap of {} bytes failed: {}", self.size, e);
        }
    }
}

impl MemoryMapping {
    pub fn from_safe_descriptor(
        descriptor: SafeDescriptor,
        size: usize,
        map_info: u32,
    ) -> GfxstreamResult<MemoryMapping> {
        let prot = match map_info & GFXSTREAM_MAP_ACCESS_MASK {
            GFXSTREAM_MAP_ACCESS_READ => ProtFlags::PROT_READ,
            GFXSTREAM_MAP_ACCESS_WRITE => ProtFlags::PROT_WRITE,
            GFXSTREAM_MAP_ACCESS_RW => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            _ => return Err(GfxstreamError::VirtioViolation("incorrect access flags")),
        };

        let non_zero_size =
            NonZeroUsize::new(size).ok_or(GfxstreamError::VirtioViolation("zero size mapping"))?;
        // Safe because we map a fresh region chosen by the kernel and check the result. The
        // descriptor may be closed after mapping.
        let addr = unsafe {
            mmap(
                None,
                non_zero_size,
                prot,
                MapFlags::MAP_SHARED,
                &descriptor,
                0,
            )?
        };
        Ok(MemoryMapping { addr, size })
    }

    pub fn new_anonymous(size: usize) -> GfxstreamResult<MemoryMapping> {
        let non_zero_size =
            NonZeroUsize::new(size).ok_or(GfxstreamError::VirtioViolation("zero size mapping"))?;
        // Safe because we map a fresh region chosen by the kernel and check the result.
        let addr = unsafe {
            mmap_anonymous(
                None,
                non_zero_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };
        Ok(MemoryMapping { addr, size })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr() as *mut u8
    }

    pub fn size(&self) -> usize {
        self.size
    }
}
