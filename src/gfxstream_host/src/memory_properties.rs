// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The physical-device memory table the guest sees, derived from the host's by policy.

use std::io::Read;
use std::io::Write;

use bitflags::bitflags;

use crate::features::Feature;
use crate::features::FeatureSet;
use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;
use crate::snapshot_io;

bitflags! {
    #[derive(Default)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const HOST_VISIBLE = 0x0000_0002;
        const HOST_COHERENT = 0x0000_0004;
        const HOST_CACHED = 0x0000_0008;
        const LAZILY_ALLOCATED = 0x0000_0010;
        const PROTECTED = 0x0000_0020;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct MemoryHeapFlags: u32 {
        const DEVICE_LOCAL = 0x0000_0001;
        const MULTI_INSTANCE = 0x0000_0002;
    }
}

pub const MAX_MEMORY_TYPES: usize = 32;
pub const MAX_MEMORY_HEAPS: usize = 16;

/// Guest heaps are clamped so 32-bit guests never see bogus sizes.
pub const MAX_SAFE_HEAP_SIZE: u64 = 2 * 1024 * 1024 * 1024;

const INVALID_INDEX: u32 = u32::MAX;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: MemoryHeapFlags,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhysicalDeviceMemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl PhysicalDeviceMemoryProperties {
    fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        snapshot_io::write(w, self.memory_types.len() as u32)?;
        for t in &self.memory_types {
            snapshot_io::write(w, t.property_flags.bits())?;
            snapshot_io::write(w, t.heap_index)?;
        }
        snapshot_io::write(w, self.memory_heaps.len() as u32)?;
        for h in &self.memory_heaps {
            snapshot_io::write(w, h.size)?;
            snapshot_io::write(w, h.flags.bits())?;
        }
        Ok(())
    }

    fn load(r: &mut dyn Read) -> GfxstreamResult<PhysicalDeviceMemoryProperties> {
        let type_count: u32 = snapshot_io::read(r)?;
        if type_count as usize > MAX_MEMORY_TYPES {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "{} memory types",
                type_count
            )));
        }
        let mut memory_types = Vec::with_capacity(type_count as usize);
        for _ in 0..type_count {
            let flags: u32 = snapshot_io::read(r)?;
            memory_types.push(MemoryType {
                property_flags: MemoryPropertyFlags::from_bits_truncate(flags),
                heap_index: snapshot_io::read(r)?,
            });
        }

        let heap_count: u32 = snapshot_io::read(r)?;
        if heap_count as usize > MAX_MEMORY_HEAPS {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "{} memory heaps",
                heap_count
            )));
        }
        let mut memory_heaps = Vec::with_capacity(heap_count as usize);
        for _ in 0..heap_count {
            let size = snapshot_io::read(r)?;
            let flags: u32 = snapshot_io::read(r)?;
            memory_heaps.push(MemoryHeap {
                size,
                flags: MemoryHeapFlags::from_bits_truncate(flags),
            });
        }

        Ok(PhysicalDeviceMemoryProperties {
            memory_types,
            memory_heaps,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

/// A host memory type and its index in the host table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostMemoryInfo {
    pub index: u32,
    pub memory_type: MemoryType,
}

pub struct EmulatedPhysicalDeviceMemoryProperties {
    host: PhysicalDeviceMemoryProperties,
    guest: PhysicalDeviceMemoryProperties,
    guest_to_host: [u32; MAX_MEMORY_TYPES],
    host_to_guest: [u32; MAX_MEMORY_TYPES],
    host_color_buffer_index: u32,
    guest_color_buffer_index: u32,
}

impl EmulatedPhysicalDeviceMemoryProperties {
    pub fn new(
        host: PhysicalDeviceMemoryProperties,
        host_color_buffer_index: u32,
        features: &FeatureSet,
    ) -> GfxstreamResult<EmulatedPhysicalDeviceMemoryProperties> {
        if host.memory_types.len() > MAX_MEMORY_TYPES
            || host.memory_heaps.len() > MAX_MEMORY_HEAPS
            || host_color_buffer_index as usize >= host.memory_types.len()
        {
            return Err(GfxstreamError::InvalidVulkanInfo);
        }

        let mut guest = host.clone();
        let mut guest_to_host = [INVALID_INDEX; MAX_MEMORY_TYPES];
        let mut host_to_guest = [INVALID_INDEX; MAX_MEMORY_TYPES];
        for i in 0..host.memory_types.len() {
            guest_to_host[i] = i as u32;
            host_to_guest[i] = i as u32;
        }

        for heap in guest.memory_heaps.iter_mut() {
            heap.size = heap.size.min(MAX_SAFE_HEAP_SIZE);
        }

        if features.is_enabled(Feature::DeviceMemoryOnly) {
            for t in guest.memory_types.iter_mut() {
                if !t.property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL) {
                    t.property_flags = MemoryPropertyFlags::empty();
                }
            }
        }

        if !features.is_enabled(Feature::GlDirectMem) && !features.is_enabled(Feature::VirtioGpuNext)
        {
            for t in guest.memory_types.iter_mut() {
                t.property_flags.remove(MemoryPropertyFlags::HOST_COHERENT);
            }
        }

        let mut guest_color_buffer_index = host_to_guest[host_color_buffer_index as usize];
        if features.is_enabled(Feature::DedicatedAhbMemoryType) {
            if guest.memory_types.len() >= MAX_MEMORY_TYPES {
                return Err(GfxstreamError::ResourceExhaustion(
                    "no room for the dedicated AHB memory type",
                ));
            }
            let heap_index = host.memory_types[host_color_buffer_index as usize].heap_index;
            let ahb_index = guest.memory_types.len();
            guest.memory_types.push(MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index,
            });
            guest_to_host[ahb_index] = host_color_buffer_index;
            guest_color_buffer_index = ahb_index as u32;
        }

        Ok(EmulatedPhysicalDeviceMemoryProperties {
            host,
            guest,
            guest_to_host,
            host_to_guest,
            host_color_buffer_index,
            guest_color_buffer_index,
        })
    }

    fn host_info(&self, host_index: u32) -> Option<HostMemoryInfo> {
        self.host
            .memory_types
            .get(host_index as usize)
            .map(|memory_type| HostMemoryInfo {
                index: host_index,
                memory_type: *memory_type,
            })
    }

    pub fn get_host_memory_info_from_guest_index(&self, guest_index: u32) -> Option<HostMemoryInfo> {
        let host_index = *self.guest_to_host.get(guest_index as usize)?;
        if host_index == INVALID_INDEX {
            return None;
        }
        self.host_info(host_index)
    }

    pub fn get_host_memory_info_from_host_index(&self, host_index: u32) -> Option<HostMemoryInfo> {
        self.host_info(host_index)
    }

    pub fn guest_memory_properties(&self) -> &PhysicalDeviceMemoryProperties {
        &self.guest
    }

    pub fn host_memory_properties(&self) -> &PhysicalDeviceMemoryProperties {
        &self.host
    }

    pub fn guest_color_buffer_memory_type_index(&self) -> u32 {
        self.guest_color_buffer_index
    }

    pub fn host_color_buffer_memory_type_index(&self) -> u32 {
        self.host_color_buffer_index
    }

    /// Rewrites host `memory_type_bits` into guest indices.  Host types without a guest
    /// counterpart are dropped.
    pub fn transform_to_guest_memory_requirements(
        &self,
        host: MemoryRequirements,
    ) -> MemoryRequirements {
        let mut guest_bits = 0u32;
        for host_index in 0..MAX_MEMORY_TYPES {
            if host.memory_type_bits & (1 << host_index) == 0 {
                continue;
            }
            let guest_index = self.host_to_guest[host_index];
            if guest_index != INVALID_INDEX {
                guest_bits |= 1 << guest_index;
            }
        }

        MemoryRequirements {
            memory_type_bits: guest_bits,
            ..host
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        self.host.save(w)?;
        self.guest.save(w)
    }

    /// Restores cannot rebuild GPU memory on a different device, so the saved tables must
    /// match this host exactly.
    pub fn verify_snapshot(&self, r: &mut dyn Read) -> GfxstreamResult<()> {
        let host = PhysicalDeviceMemoryProperties::load(r)?;
        let guest = PhysicalDeviceMemoryProperties::load(r)?;
        if host != self.host {
            return Err(GfxstreamError::SnapshotMismatch(
                "host memory properties differ".to_string(),
            ));
        }
        if guest != self.guest {
            return Err(GfxstreamError::SnapshotMismatch(
                "guest memory properties differ".to_string(),
            ));
        }
        Ok(())
    }
}
