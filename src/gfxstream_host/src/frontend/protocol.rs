// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hand-written protocol for gfxstream context commands and capsets.  Shared with the guest.

use zerocopy::AsBytes;
use zerocopy::FromBytes;

/// Context commands, submitted through `submit_cmd`.
pub const GFXSTREAM_CONTEXT_CREATE: u32 = 0x1001;
pub const GFXSTREAM_CONTEXT_PING: u32 = 0x1002;
pub const GFXSTREAM_CONTEXT_PING_WITH_RESPONSE: u32 = 0x1003;

/// Native sync commands.
pub const GFXSTREAM_CREATE_EXPORT_SYNC: u32 = 0x9000;
pub const GFXSTREAM_CREATE_IMPORT_SYNC: u32 = 0x9001;

/// Vulkan sync commands.
pub const GFXSTREAM_CREATE_EXPORT_SYNC_VK: u32 = 0xa000;
pub const GFXSTREAM_CREATE_IMPORT_SYNC_VK: u32 = 0xa001;
pub const GFXSTREAM_CREATE_QSRI_EXPORT_VK: u32 = 0xa002;
pub const GFXSTREAM_RESOURCE_CREATE_3D: u32 = 0xa003;
pub const GFXSTREAM_ACQUIRE_SYNC: u32 = 0xa004;

/// Commands that only exist to carry a fence.
pub const GFXSTREAM_PLACEHOLDER_COMMAND_VK: u32 = 0xf002;

/// Ring and staging buffer sizes advertised to every context type.
pub const GFXSTREAM_RING_SIZE: u32 = 12288;
pub const GFXSTREAM_BUFFER_SIZE: u32 = 1048576;
pub const GFXSTREAM_PROTOCOL_VERSION: u32 = 1;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamHeader {
    pub op_code: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamContextCreate {
    pub hdr: GfxstreamHeader,
    pub resource_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamContextPing {
    pub hdr: GfxstreamHeader,
    pub resource_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamCreateExportSync {
    pub hdr: GfxstreamHeader,
    pub sync_handle_lo: u32,
    pub sync_handle_hi: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamCreateExportSyncVk {
    pub hdr: GfxstreamHeader,
    pub device_handle_lo: u32,
    pub device_handle_hi: u32,
    pub fence_handle_lo: u32,
    pub fence_handle_hi: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamCreateQsriExportVk {
    pub hdr: GfxstreamHeader,
    pub image_handle_lo: u32,
    pub image_handle_hi: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamPlaceholderCommandVk {
    pub hdr: GfxstreamHeader,
    pub pad: u32,
    pub padding: u32,
}

/// Creation arguments for the next blob created with `blob_id`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamResourceCreate3d {
    pub hdr: GfxstreamHeader,
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
    pub pad: u32,
    pub blob_id: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamAcquireSync {
    pub hdr: GfxstreamHeader,
    pub padding: u32,
    pub sync_id: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct VulkanCapset {
    pub protocol_version: u32,
    pub ring_size: u32,
    pub buffer_size: u32,
    pub color_buffer_memory_index: u32,
    pub deferred_mapping: u32,
    pub blob_alignment: u32,
    pub no_render_control_enc: u32,
    pub always_blob: u32,
    pub external_sync: u32,
    pub virgl_supported_formats: [u32; 16],
    pub vulkan_batched_descriptor_set_update: u32,
}

impl VulkanCapset {
    pub fn set_format_supported(&mut self, virgl_format: u32, supported: bool) {
        let idx = (virgl_format / 32) as usize;
        let bit = 1u32 << (virgl_format % 32);
        if let Some(mask) = self.virgl_supported_formats.get_mut(idx) {
            if supported {
                *mask |= bit;
            } else {
                *mask &= !bit;
            }
        }
    }

    pub fn is_format_supported(&self, virgl_format: u32) -> bool {
        let idx = (virgl_format / 32) as usize;
        self.virgl_supported_formats
            .get(idx)
            .map(|mask| mask & (1u32 << (virgl_format % 32)) != 0)
            .unwrap_or(false)
    }
}

/// Capset layout shared by the magma, GLES and composer context types.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, AsBytes, FromBytes)]
pub struct GfxstreamCapset {
    pub protocol_version: u32,
    pub ring_size: u32,
    pub buffer_size: u32,
    pub blob_alignment: u32,
}

pub fn convert_32_to_64(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

pub fn convert_64_to_32(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_sizes() {
        assert_eq!(std::mem::size_of::<GfxstreamContextCreate>(), 8);
        assert_eq!(std::mem::size_of::<GfxstreamCreateExportSyncVk>(), 20);
        assert_eq!(std::mem::size_of::<GfxstreamResourceCreate3d>(), 56);
        assert_eq!(std::mem::size_of::<GfxstreamAcquireSync>(), 16);
    }

    #[test]
    fn format_bitmask() {
        let mut capset = VulkanCapset::default();
        capset.set_format_supported(67, true);
        capset.set_format_supported(314, true);
        assert!(capset.is_format_supported(67));
        assert!(capset.is_format_supported(314));
        assert!(!capset.is_format_supported(66));
        assert_eq!(capset.virgl_supported_formats[2], 1 << 3);
        capset.set_format_supported(67, false);
        assert!(!capset.is_format_supported(67));
        // Out of range formats are never supported.
        assert!(!capset.is_format_supported(4096));
    }

    #[test]
    fn handle_halves() {
        let (lo, hi) = convert_64_to_32(0x1234_5678_9abc_def0);
        assert_eq!((lo, hi), (0x9abc_def0, 0x1234_5678));
        assert_eq!(convert_32_to_64(lo, hi), 0x1234_5678_9abc_def0);
    }
}
