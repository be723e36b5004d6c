// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gfxstream_utils: Utility enums, structs, and implementations needed by the rest of the crate.

use std::ffi::NulError;
use std::fmt;
use std::io::Error as IoError;
use std::num::TryFromIntError;
use std::os::raw::c_void;
use std::str::Utf8Error;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[cfg(unix)]
use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

use crate::gfxstream_os::SafeDescriptor;

/// Represents a buffer.  `base` contains the address of a buffer, while `len` contains the length
/// of the buffer.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct GfxstreamIovec {
    pub base: *mut c_void,
    pub len: usize,
}

unsafe impl Send for GfxstreamIovec {}
unsafe impl Sync for GfxstreamIovec {}

/// Gallium targets and virgl bind flags understood by the host resource classifier.
pub const GFXSTREAM_PIPE_BUFFER: u32 = 0;
pub const GFXSTREAM_PIPE_TEXTURE_2D: u32 = 2;

pub const VIRGL_BIND_DEPTH_STENCIL: u32 = 1 << 0;
pub const VIRGL_BIND_RENDER_TARGET: u32 = 1 << 1;
pub const VIRGL_BIND_SAMPLER_VIEW: u32 = 1 << 3;
pub const VIRGL_BIND_CURSOR: u32 = 1 << 16;
pub const VIRGL_BIND_CUSTOM: u32 = 1 << 17;
pub const VIRGL_BIND_SCANOUT: u32 = 1 << 18;
pub const VIRGL_BIND_LINEAR: u32 = 1 << 22;

/// Subset of virgl formats the host knows how to back.
pub const VIRGL_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRGL_FORMAT_B8G8R8X8_UNORM: u32 = 2;
pub const VIRGL_FORMAT_B5G6R5_UNORM: u32 = 7;
pub const VIRGL_FORMAT_R8_UNORM: u32 = 64;
pub const VIRGL_FORMAT_R8G8B8A8_UNORM: u32 = 67;
pub const VIRGL_FORMAT_R8G8B8X8_UNORM: u32 = 134;
pub const VIRGL_FORMAT_YV12: u32 = 163;
pub const VIRGL_FORMAT_NV12: u32 = 166;
pub const VIRGL_FORMAT_P010: u32 = 314;

/// 3D resource creation parameters.  Constants based on Mesa's (internal) Gallium interface.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCreate3D {
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
}

/// Blob resource creation parameters.
pub const GFXSTREAM_BLOB_MEM_GUEST: u32 = 0x0001;
pub const GFXSTREAM_BLOB_MEM_HOST3D: u32 = 0x0002;
pub const GFXSTREAM_BLOB_MEM_HOST3D_GUEST: u32 = 0x0003;

pub const GFXSTREAM_BLOB_FLAG_USE_MAPPABLE: u32 = 0x0001;
pub const GFXSTREAM_BLOB_FLAG_USE_SHAREABLE: u32 = 0x0002;
pub const GFXSTREAM_BLOB_FLAG_USE_CROSS_DEVICE: u32 = 0x0004;
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCreateBlob {
    pub blob_mem: u32,
    pub blob_flags: u32,
    pub blob_id: u64,
    pub size: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxstreamMapping {
    pub ptr: u64,
    pub size: u64,
}

/// Metadata associated with a 3D resource.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resource3DInfo {
    pub width: u32,
    pub height: u32,
    pub drm_fourcc: u32,
    pub strides: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: u64,
}

/// Memory index and size of the device memory backing an exported blob.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VulkanInfo {
    pub memory_idx: u32,
    pub device_memory_size: u64,
    pub dedicated: bool,
}

/// Context init capset id mask.
pub const GFXSTREAM_CONTEXT_INIT_CAPSET_ID_MASK: u32 = 0x00ff;

/// Flags for creating fences.
pub const GFXSTREAM_FLAG_FENCE: u32 = 1 << 0;
pub const GFXSTREAM_FLAG_INFO_RING_IDX: u32 = 1 << 1;
pub const GFXSTREAM_FLAG_FENCE_SHAREABLE: u32 = 1 << 2;

/// Convenience struct for gfxstream fences
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GfxstreamFence {
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub ring_idx: u8,
}

/// Mapped memory caching flags (see virtio_gpu spec)
pub const GFXSTREAM_MAP_CACHE_MASK: u32 = 0x0f;
pub const GFXSTREAM_MAP_CACHE_CACHED: u32 = 0x01;
pub const GFXSTREAM_MAP_CACHE_UNCACHED: u32 = 0x02;
pub const GFXSTREAM_MAP_CACHE_WC: u32 = 0x03;
/// Access flags (not in virtio_gpu spec)
pub const GFXSTREAM_MAP_ACCESS_MASK: u32 = 0xf0;
pub const GFXSTREAM_MAP_ACCESS_READ: u32 = 0x10;
pub const GFXSTREAM_MAP_ACCESS_WRITE: u32 = 0x20;
pub const GFXSTREAM_MAP_ACCESS_RW: u32 = 0x30;

/// Gfxstream capsets.
pub const GFXSTREAM_CAPSET_VULKAN: u32 = 3;
pub const GFXSTREAM_CAPSET_MAGMA: u32 = 7;
pub const GFXSTREAM_CAPSET_GLES: u32 = 8;
pub const GFXSTREAM_CAPSET_COMPOSER: u32 = 9;

/// Failures reported by the wire codec.  All of them are fatal to the render thread that
/// observed them.
#[sorted]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The trailing checksum did not match the packet contents.
    #[error("checksum mismatch on packet {sequence}")]
    ChecksumMismatch { sequence: u32 },
    /// A packet was shorter than its header or its arguments.
    #[error("packet too short: needed {needed} more bytes")]
    PacketTooShort { needed: usize },
    /// The declared packet length disagrees with the decoded payload.
    #[error("opcode {opcode}: declared {declared} payload bytes, decoded {decoded}")]
    PayloadLength {
        opcode: u32,
        declared: usize,
        decoded: usize,
    },
    /// A ring cursor claims more unread bytes than the ring holds.
    #[error("ring cursor is {available} bytes ahead of a {capacity} byte ring")]
    RingOverrun { available: usize, capacity: usize },
    /// A string or array marker claims more bytes than the packet holds.
    #[error("length marker {declared} exceeds the {available} remaining bytes")]
    StringOverflow { declared: usize, available: usize },
    /// No server context bound to the stream handles this opcode.
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
}

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum GfxstreamError {
    /// Indicates a process-wide asset was already initialized.
    #[error("attempted to use a gfxstream asset already in use")]
    AlreadyInUse,
    /// A GL, Vulkan or Magma back-end returned an error code.
    #[error("back-end call failed with error {0}")]
    BackendFailure(i32),
    /// A promise was dropped before being fulfilled.
    #[error("the promise backing this future was abandoned")]
    BrokenPromise,
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// Checked Range error
    #[error("range check failed: {}({}) vs {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedRange {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
    },
    /// Invalid Capset
    #[error("invalid capset")]
    InvalidCapset,
    /// Unknown color buffer handle.
    #[error("invalid color buffer {0}")]
    InvalidColorBuffer(u32),
    /// A command buffer with insufficient space was submitted.
    #[error("invalid command buffer submitted")]
    InvalidCommandBuffer,
    /// A command size was submitted that was invalid.
    #[error("command buffer submitted with invalid size: {0}")]
    InvalidCommandSize(usize),
    /// Invalid Context ID
    #[error("invalid context id")]
    InvalidContextId,
    /// Indicates an error in the GfxstreamBuilder.
    #[error("invalid gfxstream build parameters: {0}")]
    InvalidGfxstreamBuild(&'static str),
    /// An error with the GfxstreamHandle
    #[error("invalid gfxstream handle")]
    InvalidGfxstreamHandle,
    /// The indicated region of guest memory is invalid.
    #[error("an iovec is outside of guest memory's range")]
    InvalidIovec,
    /// Invalid Resource ID.
    #[error("invalid resource id")]
    InvalidResourceId,
    /// Invalid Vulkan info
    #[error("invalid vulkan info")]
    InvalidVulkanInfo,
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// The mapping failed.
    #[error("The mapping failed with library error: {0}")]
    MappingFailed(i32),
    /// Nix crate error.
    #[cfg(unix)]
    #[error("The errno is {0}")]
    NixError(NixError),
    #[error("Nul Error occured {0}")]
    NulError(NulError),
    /// Wire framing failure.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    /// An allocation could not be satisfied.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(&'static str),
    /// A snapshot could not be reproduced on this host.
    #[error("snapshot mismatch: {0}")]
    SnapshotMismatch(String),
    /// A fence or QSRI wait expired.
    #[error("timed out")]
    Timeout,
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// The command is unsupported.
    #[error("the requested function is not implemented")]
    Unsupported,
    /// Utf8 error.
    #[error("an utf8 error occured: {0}")]
    Utf8Error(Utf8Error),
    /// Violation of the virtio-gpu protocol occured.
    #[error("violation of the virtio-gpu protocol: {0}")]
    VirtioViolation(&'static str),
}

impl GfxstreamError {
    /// Returns true if the error must abort the surrounding execution (render thread or
    /// snapshot restore) rather than being returned to the guest.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GfxstreamError::Protocol(_) | GfxstreamError::SnapshotMismatch(_)
        )
    }
}

#[cfg(unix)]
impl From<NixError> for GfxstreamError {
    fn from(e: NixError) -> GfxstreamError {
        GfxstreamError::NixError(e)
    }
}

impl From<NulError> for GfxstreamError {
    fn from(e: NulError) -> GfxstreamError {
        GfxstreamError::NulError(e)
    }
}

impl From<IoError> for GfxstreamError {
    fn from(e: IoError) -> GfxstreamError {
        GfxstreamError::IoError(e)
    }
}

impl From<TryFromIntError> for GfxstreamError {
    fn from(e: TryFromIntError) -> GfxstreamError {
        GfxstreamError::TryFromIntError(e)
    }
}

impl From<Utf8Error> for GfxstreamError {
    fn from(e: Utf8Error) -> GfxstreamError {
        GfxstreamError::Utf8Error(e)
    }
}

impl From<ProtocolError> for GfxstreamError {
    fn from(e: ProtocolError) -> GfxstreamError {
        GfxstreamError::Protocol(e)
    }
}

/// The result of an operation in this crate.
pub type GfxstreamResult<T> = std::result::Result<T, GfxstreamError>;

/// Flags for the gfxstream renderer.
const STREAM_RENDERER_FLAGS_USE_EGL: u32 = 1 << 0;
const STREAM_RENDERER_FLAGS_USE_SURFACELESS: u32 = 1 << 3;
const STREAM_RENDERER_FLAGS_USE_GLES: u32 = 1 << 4;
const STREAM_RENDERER_FLAGS_USE_VK_BIT: u32 = 1 << 5;
const STREAM_RENDERER_FLAGS_USE_EXTERNAL_BLOB: u32 = 1 << 6;
const STREAM_RENDERER_FLAGS_USE_SYSTEM_BLOB: u32 = 1 << 7;
const STREAM_RENDERER_FLAGS_VULKAN_NATIVE_SWAPCHAIN_BIT: u32 = 1 << 8;
const STREAM_RENDERER_FLAGS_VULKAN_SNAPSHOTS: u32 = 1 << 9;

/// gfxstream flag struct.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct GfxstreamFlags(u32);

#[derive(Clone, Debug)]
pub enum GfxstreamWsi {
    Surfaceless,
    VulkanSwapchain,
}

impl GfxstreamFlags {
    /// Create new gfxstream flags.
    pub fn new() -> GfxstreamFlags {
        GfxstreamFlags(0)
    }

    fn set_flag(self, bitmask: u32, set: bool) -> GfxstreamFlags {
        if set {
            GfxstreamFlags(self.0 | bitmask)
        } else {
            GfxstreamFlags(self.0 & (!bitmask))
        }
    }

    fn has_flag(&self, bitmask: u32) -> bool {
        self.0 & bitmask != 0
    }

    /// Use EGL for context creation.
    pub fn use_egl(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_EGL, v)
    }

    /// No surfaces required when creating context.
    pub fn use_surfaceless(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_SURFACELESS, v)
    }

    /// Use GLES drivers.
    pub fn use_gles(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_GLES, v)
    }

    /// Support using Vulkan.
    pub fn use_vulkan(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_VK_BIT, v)
    }

    /// Record Vulkan object creation so it can be replayed after a snapshot load.
    pub fn use_vulkan_snapshots(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_VULKAN_SNAPSHOTS, v)
    }

    /// Use the Vulkan swapchain to draw on the host window.
    pub fn set_wsi(self, v: GfxstreamWsi) -> GfxstreamFlags {
        let use_vulkan_swapchain = matches!(v, GfxstreamWsi::VulkanSwapchain);
        self.set_flag(
            STREAM_RENDERER_FLAGS_VULKAN_NATIVE_SWAPCHAIN_BIT,
            use_vulkan_swapchain,
        )
    }

    /// Use external blob when creating resources.
    pub fn use_external_blob(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_EXTERNAL_BLOB, v)
    }

    /// Use system blob when creating resources.
    pub fn use_system_blob(self, v: bool) -> GfxstreamFlags {
        self.set_flag(STREAM_RENDERER_FLAGS_USE_SYSTEM_BLOB, v)
    }

    pub fn uses_gles(&self) -> bool {
        self.has_flag(STREAM_RENDERER_FLAGS_USE_GLES)
    }

    pub fn uses_vulkan(&self) -> bool {
        self.has_flag(STREAM_RENDERER_FLAGS_USE_VK_BIT)
    }

    pub fn uses_vulkan_snapshots(&self) -> bool {
        self.has_flag(STREAM_RENDERER_FLAGS_VULKAN_SNAPSHOTS)
    }

    pub fn uses_external_blob(&self) -> bool {
        self.has_flag(STREAM_RENDERER_FLAGS_USE_EXTERNAL_BLOB)
    }

    pub fn uses_system_blob(&self) -> bool {
        self.has_flag(STREAM_RENDERER_FLAGS_USE_SYSTEM_BLOB)
    }
}

impl From<GfxstreamFlags> for u32 {
    fn from(flags: GfxstreamFlags) -> u32 {
        flags.0
    }
}

impl From<GfxstreamFlags> for u64 {
    fn from(flags: GfxstreamFlags) -> u64 {
        flags.0 as u64
    }
}

/// Transfers {to, from} 1D buffers, 2D textures, 3D textures, and cubemaps.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Transfer3D {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
    pub level: u32,
    pub stride: u32,
    pub layer_stride: u32,
    pub offset: u64,
}

impl Transfer3D {
    /// Constructs a 2 dimensional XY box in 3 dimensional space with unit depth and zero
    /// displacement on the Z axis.
    pub fn new_2d(x: u32, y: u32, w: u32, h: u32) -> Transfer3D {
        Transfer3D {
            x,
            y,
            z: 0,
            w,
            h,
            d: 1,
            level: 0,
            stride: 0,
            layer_stride: 0,
            offset: 0,
        }
    }

    /// A 1D transfer of `size` bytes starting at byte `offset`.
    pub fn new_1d(offset: u32, size: u32) -> Transfer3D {
        Transfer3D::new_2d(offset, 0, size, 1)
    }

    /// Returns true if this box represents a volume of zero.
    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0
    }
}

/// Handle types (memory and sync in same namespace)
pub const GFXSTREAM_MEM_HANDLE_TYPE_OPAQUE_FD: u32 = 0x0001;
pub const GFXSTREAM_MEM_HANDLE_TYPE_DMABUF: u32 = 0x0002;
pub const GFXSTREAM_MEM_HANDLE_TYPE_SHM: u32 = 0x0004;

pub const GFXSTREAM_FENCE_HANDLE_TYPE_OPAQUE_FD: u32 = 0x0006;
pub const GFXSTREAM_FENCE_HANDLE_TYPE_SYNC_FD: u32 = 0x0007;

/// Handle to OS-specific memory or synchronization objects.
#[derive(Debug)]
pub struct GfxstreamHandle {
    pub os_handle: SafeDescriptor,
    pub handle_type: u32,
}

impl GfxstreamHandle {
    /// Clones an existing handle, by using OS specific mechanisms.
    pub fn try_clone(&self) -> GfxstreamResult<GfxstreamHandle> {
        let clone = self
            .os_handle
            .try_clone()
            .map_err(|_| GfxstreamError::InvalidGfxstreamHandle)?;
        Ok(GfxstreamHandle {
            os_handle: clone,
            handle_type: self.handle_type,
        })
    }
}

#[derive(Clone)]
pub struct GfxstreamHandler<S> {
    closure: Arc<dyn Fn(S) + Send + Sync>,
}

impl<S> GfxstreamHandler<S>
where
    S: Send + Sync + Clone + 'static,
{
    pub fn new(closure: impl Fn(S) + Send + Sync + 'static) -> GfxstreamHandler<S> {
        GfxstreamHandler {
            closure: Arc::new(closure),
        }
    }

    pub fn call(&self, data: S) {
        (self.closure)(data)
    }
}

impl<S> fmt::Debug for GfxstreamHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure debug").finish()
    }
}

pub type GfxstreamFenceHandler = GfxstreamHandler<GfxstreamFence>;

/// Rate limits a repetitive log site: the first occurrence is logged, then every `every`-th.
///
/// ```ignore
/// static THROTTLE: LogThrottle = LogThrottle::new(64);
/// if THROTTLE.should_log() {
///     error!("decode failed ({} occurrences)", THROTTLE.count());
/// }
/// ```
pub struct LogThrottle {
    count: AtomicU64,
    every: u64,
}

impl LogThrottle {
    pub const fn new(every: u64) -> LogThrottle {
        LogThrottle {
            count: AtomicU64::new(0),
            every: if every == 0 { 1 } else { every },
        }
    }

    pub fn should_log(&self) -> bool {
        let seen = self.count.fetch_add(1, Ordering::Relaxed);
        seen % self.every == 0
    }

    /// Number of times the site has been hit.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let flags = GfxstreamFlags::new()
            .use_gles(true)
            .use_vulkan(true)
            .use_external_blob(false);
        assert!(flags.uses_gles());
        assert!(flags.uses_vulkan());
        assert!(!flags.uses_external_blob());

        let flags = flags.use_gles(false);
        assert!(!flags.uses_gles());
        assert_eq!(u32::from(flags), STREAM_RENDERER_FLAGS_USE_VK_BIT);
    }

    #[test]
    fn only_protocol_and_snapshot_errors_are_fatal() {
        assert!(GfxstreamError::Protocol(ProtocolError::UnknownOpcode(1)).is_fatal());
        assert!(GfxstreamError::SnapshotMismatch("x".to_string()).is_fatal());
        assert!(!GfxstreamError::Timeout.is_fatal());
        assert!(!GfxstreamError::InvalidResourceId.is_fatal());
        assert!(!GfxstreamError::BackendFailure(-3).is_fatal());
    }

    #[test]
    fn log_throttle() {
        let throttle = LogThrottle::new(3);
        let logged: Vec<bool> = (0..7).map(|_| throttle.should_log()).collect();
        assert_eq!(logged, [true, false, false, true, false, false, true]);
        assert_eq!(throttle.count(), 7);
    }

    #[test]
    fn checked_macros() {
        let a = 5u32;
        let b = u32::MAX;
        assert!(checked_arithmetic!(a + b).is_err());
        assert_eq!(checked_arithmetic!(a * a).unwrap(), 25);
        assert!(checked_range!(a; <= 4u32).is_err());
        assert!(checked_range!(a; <= 5u32).is_ok());
    }
}
