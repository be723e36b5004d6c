// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Byte streams between a guest connection and the render thread serving it.

mod address_space;
mod pipe;

use std::time::Duration;

use gfxstream_host::frontend::protocol::GfxstreamCapset;
use gfxstream_host::frontend::protocol::VulkanCapset;
use gfxstream_host::GFXSTREAM_CAPSET_VULKAN;
use zerocopy::FromBytes;

pub use address_space::AddressSpaceStream;
pub use pipe::process_pipe_init;
pub use pipe::VirtioGpuPipeStream;
pub use pipe::PIPE_BUFFER_SIZE;

use crate::error::GuestError;
use crate::error::GuestResult;

/// How long a read waits for the host before giving up.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_BLOB_ALIGNMENT: u64 = 4096;

/// A bidirectional stream to one render thread.
pub trait GuestStream: Send {
    /// The virtio-gpu context carrying the stream.
    fn context_id(&self) -> u32;

    /// Queues all of `bytes` for the host and makes sure the host will look at them.
    fn write_all(&mut self, bytes: &[u8]) -> GuestResult<()>;

    /// Fills `out` with bytes from the host.  Fails with `Timeout` if the host stays silent for
    /// longer than the read timeout.
    fn read_exact(&mut self, out: &mut [u8]) -> GuestResult<()>;

    fn set_read_timeout(&mut self, timeout: Duration);
}

/// Transport sizing advertised by a capset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub ring_size: u64,
    pub buffer_size: u64,
    pub blob_alignment: u64,
    /// Contexts of this capset speak no render control during setup.
    pub no_render_control_enc: bool,
}

impl StreamParams {
    /// Reads the capset blob of `capset_id` as the device reported it.
    pub fn from_capset(capset_id: u32, caps: &[u8]) -> GuestResult<StreamParams> {
        let (ring_size, buffer_size, blob_alignment, no_render_control_enc) =
            if capset_id == GFXSTREAM_CAPSET_VULKAN {
                let caps = VulkanCapset::read_from_prefix(caps)
                    .ok_or(GuestError::InvalidCapset(capset_id))?;
                (
                    caps.ring_size,
                    caps.buffer_size,
                    caps.blob_alignment,
                    caps.no_render_control_enc != 0,
                )
            } else {
                let caps = GfxstreamCapset::read_from_prefix(caps)
                    .ok_or(GuestError::InvalidCapset(capset_id))?;
                (caps.ring_size, caps.buffer_size, caps.blob_alignment, false)
            };

        let blob_alignment = match blob_alignment as u64 {
            0 => DEFAULT_BLOB_ALIGNMENT,
            a => a,
        };
        Ok(StreamParams {
            ring_size: ring_size as u64,
            buffer_size: buffer_size as u64,
            blob_alignment,
            no_render_control_enc,
        })
    }

    /// Size of the ring blob: both areas, rounded up to the blob alignment.
    pub fn ring_blob_size(&self) -> u64 {
        let size = self.ring_size + self.buffer_size;
        (size + self.blob_alignment - 1) / self.blob_alignment * self.blob_alignment
    }
}
