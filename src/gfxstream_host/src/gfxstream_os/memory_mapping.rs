// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::gfxstream_os::sys::platform::MemoryMapping as PlatformMapping;
use crate::gfxstream_os::MappedRegion;
use crate::gfxstream_os::SafeDescriptor;
use crate::gfxstream_utils::GfxstreamMapping;
use crate::gfxstream_utils::GfxstreamResult;

pub struct MemoryMapping {
    mapping: PlatformMapping,
}

impl MemoryMapping {
    pub fn from_safe_descriptor(
        descriptor: SafeDescriptor,
        size: usize,
        map_info: u32,
    ) -> GfxstreamResult<MemoryMapping> {
        let mapping = PlatformMapping::from_safe_descriptor(descriptor, size, map_info)?;
        Ok(MemoryMapping { mapping })
    }

    /// Private, zero-filled, read/write memory not backed by any descriptor.
    pub fn new_anonymous(size: usize) -> GfxstreamResult<MemoryMapping> {
        let mapping = PlatformMapping::new_anonymous(size)?;
        Ok(MemoryMapping { mapping })
    }

    pub fn as_gfxstream_mapping(&self) -> GfxstreamMapping {
        GfxstreamMapping {
            ptr: self.mapping.as_ptr() as u64,
            size: self.mapping.size() as u64,
        }
    }

    /// # Safety
    /// The caller must ensure no other thread writes to the region during the borrow.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.size())
    }

    /// # Safety
    /// The caller must ensure nothing else accesses the region during the borrow.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.size())
    }
}

// Safe because the platform mapping stays valid until drop.
unsafe impl MappedRegion for MemoryMapping {
    fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    fn size(&self) -> usize {
        self.mapping.size()
    }
}
