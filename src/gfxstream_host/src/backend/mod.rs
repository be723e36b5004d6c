// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The interfaces through which the host core reaches the GLES, Vulkan and Magma
//! implementations.  Back-ends report failures as `GfxstreamError::BackendFailure` carrying the
//! API's native error code, so server contexts can hand the same value back to the guest.

mod stub;

pub use stub::StubGlBackend;
pub use stub::StubMagmaBackend;
pub use stub::StubVkBackend;

use crate::gfxstream_utils::*;
use crate::memory_properties::MemoryRequirements;
use crate::memory_properties::PhysicalDeviceMemoryProperties;

pub const GL_NO_ERROR: u32 = 0;
pub const GL_INVALID_ENUM: u32 = 0x0500;
pub const GL_INVALID_VALUE: u32 = 0x0501;
pub const GL_INVALID_OPERATION: u32 = 0x0502;
pub const GL_OUT_OF_MEMORY: u32 = 0x0505;

pub const VK_SUCCESS: i32 = 0;
pub const VK_ERROR_OUT_OF_HOST_MEMORY: i32 = -1;
pub const VK_ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
pub const VK_ERROR_INITIALIZATION_FAILED: i32 = -3;
pub const VK_ERROR_DEVICE_LOST: i32 = -4;

pub const MAGMA_STATUS_OK: i32 = 0;
pub const MAGMA_STATUS_INTERNAL_ERROR: i32 = -1;
pub const MAGMA_STATUS_INVALID_ARGS: i32 = -2;
pub const MAGMA_STATUS_ACCESS_DENIED: i32 = -3;
pub const MAGMA_STATUS_MEMORY_ERROR: i32 = -4;
pub const MAGMA_STATUS_CONTEXT_KILLED: i32 = -5;
pub const MAGMA_STATUS_CONNECTION_LOST: i32 = -6;
pub const MAGMA_STATUS_TIMED_OUT: i32 = -7;
pub const MAGMA_STATUS_UNIMPLEMENTED: i32 = -8;

/// Which back-end a borrowed color buffer image belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsedApi {
    Gl,
    Vk,
}

/// An exported allocation that another back-end may import.
#[derive(Debug)]
pub struct MemoryExport {
    pub handle: GfxstreamHandle,
    pub size: u64,
    pub linear_tiling: bool,
}

/// OpenGL ES as seen by the host core.  Texture contents are addressed with the texture's own
/// internal format; callers convert before calling in.
pub trait GlBackend: Send + Sync {
    /// `(vendor, renderer, version)` of the host GL implementation.
    fn renderer_strings(&self) -> (String, String, String);

    fn create_texture(&self, width: u32, height: u32, internal_format: u32) -> GfxstreamResult<u32>;

    fn destroy_texture(&self, texture: u32);

    #[allow(clippy::too_many_arguments)]
    fn read_texture(
        &self,
        texture: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
    ) -> GfxstreamResult<()>;

    fn update_texture(
        &self,
        texture: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GfxstreamResult<()>;

    /// Rebinds the texture's storage to memory exported by another back-end.
    fn import_memory(&self, _texture: u32, _memory: &MemoryExport) -> GfxstreamResult<()> {
        Err(GfxstreamError::Unsupported)
    }

    fn create_buffer(&self, size: u64) -> GfxstreamResult<u32>;

    fn destroy_buffer(&self, buffer: u32);

    fn read_buffer(&self, buffer: u32, offset: u64, out: &mut [u8]) -> GfxstreamResult<()>;

    fn update_buffer(&self, buffer: u32, offset: u64, bytes: &[u8]) -> GfxstreamResult<()>;

    /// Blocks until the GPU reaches the sync object `sync`.
    fn client_wait_sync(&self, _sync: u64) -> GfxstreamResult<()> {
        Ok(())
    }
}

/// Vulkan as seen by the host core.  Handles are the driver's own (unboxed) values.
pub trait VkBackend: Send + Sync {
    fn memory_properties(&self) -> PhysicalDeviceMemoryProperties;

    /// Host memory type used for color buffer images.
    fn color_buffer_memory_type_index(&self) -> u32;

    fn create_instance(&self) -> GfxstreamResult<u64>;

    fn destroy_instance(&self, instance: u64);

    fn create_device(&self, instance: u64) -> GfxstreamResult<u64>;

    fn destroy_device(&self, device: u64);

    fn allocate_memory(&self, device: u64, size: u64, host_type_index: u32)
        -> GfxstreamResult<u64>;

    fn free_memory(&self, device: u64, memory: u64);

    fn create_buffer(&self, device: u64, size: u64) -> GfxstreamResult<u64>;

    fn destroy_buffer(&self, device: u64, buffer: u64);

    fn buffer_memory_requirements(&self, device: u64, buffer: u64)
        -> GfxstreamResult<MemoryRequirements>;

    fn bind_buffer_memory(
        &self,
        device: u64,
        buffer: u64,
        memory: u64,
        offset: u64,
    ) -> GfxstreamResult<()>;

    /// Creates the image backing a color buffer.  `size` is the byte size of its contents in
    /// the color buffer's native layout.
    fn create_image(&self, width: u32, height: u32, size: usize) -> GfxstreamResult<u64>;

    fn destroy_image(&self, image: u64);

    /// Copies the whole image out in its native layout.
    fn read_image(&self, image: u64, out: &mut [u8]) -> GfxstreamResult<()>;

    fn write_image(&self, image: u64, bytes: &[u8]) -> GfxstreamResult<()>;

    /// Exports the image's memory.  `None` when the driver cannot share it.
    fn export_image_memory(&self, _image: u64) -> Option<MemoryExport> {
        None
    }

    /// Blocks until `fence` signals.
    fn wait_fence(&self, _device: u64, _fence: u64) -> GfxstreamResult<()> {
        Ok(())
    }
}

/// One entry of a Magma poll request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MagmaPollItem {
    pub semaphore: u64,
    pub condition: u32,
    pub result: u32,
}

pub const MAGMA_POLL_CONDITION_SIGNALED: u32 = 3;

/// Magma as seen by the host core.  All calls are non-blocking.
pub trait MagmaBackend: Send + Sync {
    fn query(&self, query_id: u64) -> GfxstreamResult<u64>;

    fn create_context(&self) -> GfxstreamResult<u64>;

    fn release_context(&self, context: u64);

    /// Returns the native buffer and its actual size.
    fn create_buffer(&self, size: u64) -> GfxstreamResult<(u64, u64)>;

    fn release_buffer(&self, buffer: u64);

    fn create_semaphore(&self) -> GfxstreamResult<u64>;

    fn release_semaphore(&self, semaphore: u64);

    fn signal_semaphore(&self, semaphore: u64);

    fn reset_semaphore(&self, semaphore: u64);

    /// Zero-timeout poll.  Sets `result` on every item whose condition holds and returns
    /// `MAGMA_STATUS_OK` if any did, `MAGMA_STATUS_TIMED_OUT` otherwise.
    fn poll(&self, items: &mut [MagmaPollItem]) -> i32;
}

/// Maps a back-end failure onto a `VkResult`.
pub fn to_vk_result(e: &GfxstreamError) -> i32 {
    match e {
        GfxstreamError::BackendFailure(code) if *code < 0 => *code,
        GfxstreamError::ResourceExhaustion(_) => VK_ERROR_OUT_OF_HOST_MEMORY,
        _ => VK_ERROR_INITIALIZATION_FAILED,
    }
}

/// Maps a back-end failure onto a `magma_status_t`.
pub fn to_magma_status(e: &GfxstreamError) -> i32 {
    match e {
        GfxstreamError::BackendFailure(code) if *code < 0 => *code,
        GfxstreamError::ResourceExhaustion(_) => MAGMA_STATUS_MEMORY_ERROR,
        GfxstreamError::InvalidGfxstreamHandle | GfxstreamError::InvalidResourceId => {
            MAGMA_STATUS_INVALID_ARGS
        }
        GfxstreamError::Timeout => MAGMA_STATUS_TIMED_OUT,
        GfxstreamError::Unsupported => MAGMA_STATUS_UNIMPLEMENTED,
        _ => MAGMA_STATUS_INTERNAL_ERROR,
    }
}

/// Maps a back-end failure onto a GL error flag.
pub fn to_gl_error(e: &GfxstreamError) -> u32 {
    match e {
        GfxstreamError::BackendFailure(code) if *code > 0 => *code as u32,
        GfxstreamError::ResourceExhaustion(_) => GL_OUT_OF_MEMORY,
        GfxstreamError::CheckedRange { .. } | GfxstreamError::CheckedArithmetic { .. } => {
            GL_INVALID_VALUE
        }
        _ => GL_INVALID_OPERATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_error_mapping() {
        assert_eq!(
            to_vk_result(&GfxstreamError::BackendFailure(VK_ERROR_DEVICE_LOST)),
            VK_ERROR_DEVICE_LOST
        );
        assert_eq!(
            to_vk_result(&GfxstreamError::ResourceExhaustion("oom")),
            VK_ERROR_OUT_OF_HOST_MEMORY
        );
        assert_eq!(
            to_magma_status(&GfxstreamError::InvalidGfxstreamHandle),
            MAGMA_STATUS_INVALID_ARGS
        );
        assert_eq!(
            to_gl_error(&GfxstreamError::BackendFailure(GL_OUT_OF_MEMORY as i32)),
            GL_OUT_OF_MEMORY
        );
        assert_eq!(to_gl_error(&GfxstreamError::Unsupported), GL_INVALID_OPERATION);
    }
}
