// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::time::Duration;

use gfxstream_host::pipe::GL_PROCESS_PIPE_CONFIRM;
use gfxstream_host::pipe::PIPE_GL_PROCESS;
use gfxstream_host::GFXSTREAM_PIPE_BUFFER;
use gfxstream_host::VIRGL_BIND_CUSTOM;
use gfxstream_host::VIRGL_FORMAT_R8_UNORM;
use log::debug;
use log::error;
use log::warn;

use crate::emulated::EmulatedVirtioGpu;
use crate::emulated::GuestMapping;
use crate::error::GuestError;
use crate::error::GuestResult;
use crate::stream::GuestStream;

/// Size of the guest buffer shadowing a pipe resource.
pub const PIPE_BUFFER_SIZE: u32 = 1048576;

/// A host pipe reached through a 3D resource: writes are transfers to the host out of the
/// resource's guest memory, reads are transfers back into it.
pub struct VirtioGpuPipeStream {
    gpu: Arc<EmulatedVirtioGpu>,
    ctx_id: u32,
    resource_id: u32,
    mapping: GuestMapping,
    /// Bytes of the buffer holding writes the device may not have transferred yet.
    written: usize,
}

impl VirtioGpuPipeStream {
    /// Opens a context of `capset_id` with a pipe resource and connects it to `service`.
    pub fn connect(
        gpu: Arc<EmulatedVirtioGpu>,
        capset_id: u32,
        service: &str,
    ) -> GuestResult<VirtioGpuPipeStream> {
        let ctx_id = gpu.create_context(capset_id)?;
        let resource_id = match gpu.create_virgl_blob(
            ctx_id,
            PIPE_BUFFER_SIZE,
            1,
            VIRGL_FORMAT_R8_UNORM,
            GFXSTREAM_PIPE_BUFFER,
            VIRGL_BIND_CUSTOM,
            PIPE_BUFFER_SIZE,
        ) {
            Ok(id) => id,
            Err(e) => {
                let _ = gpu.destroy_context(ctx_id);
                return Err(e);
            }
        };

        let mapping = gpu.map(resource_id)?;
        let mut stream = VirtioGpuPipeStream {
            gpu,
            ctx_id,
            resource_id,
            mapping,
            written: 0,
        };

        let mut name = service.as_bytes().to_vec();
        name.push(0);
        stream.write_all(&name)?;
        debug!("ctx {}: pipe connected to {}", ctx_id, service);
        Ok(stream)
    }

    fn capacity(&self) -> usize {
        self.mapping.size()
    }

    /// Waits for the queued transfers.  A failed transfer means the host end of the pipe is
    /// gone.
    fn wait(&self) -> GuestResult<()> {
        self.gpu.wait(self.resource_id).map_err(|e| match e {
            GuestError::Host(e) => {
                error!("ctx {}: pipe transfer failed: {}", self.ctx_id, e);
                GuestError::StreamClosed
            }
            e => e,
        })
    }

    /// Waits until every queued transfer ran, making the whole buffer reusable.
    fn flush(&mut self) -> GuestResult<()> {
        if self.written > 0 {
            self.wait()?;
            self.written = 0;
        }
        Ok(())
    }
}

impl GuestStream for VirtioGpuPipeStream {
    fn context_id(&self) -> u32 {
        self.ctx_id
    }

    fn write_all(&mut self, bytes: &[u8]) -> GuestResult<()> {
        for chunk in bytes.chunks(self.capacity()) {
            if self.written + chunk.len() > self.capacity() {
                self.flush()?;
            }
            self.mapping.write(self.written, chunk)?;
            self.gpu.transfer_to_host(
                self.ctx_id,
                self.resource_id,
                self.written as u32,
                chunk.len() as u32,
            )?;
            self.written += chunk.len();
        }
        Ok(())
    }

    fn read_exact(&mut self, out: &mut [u8]) -> GuestResult<()> {
        self.flush()?;
        let capacity = self.capacity();
        for chunk in out.chunks_mut(capacity) {
            self.gpu
                .transfer_from_host(self.ctx_id, self.resource_id, 0, chunk.len() as u32)?;
            self.wait()?;
            self.mapping.read(0, chunk)?;
        }
        Ok(())
    }

    /// Reads block in the device, which waits for the host up to its own fixed limit.
    fn set_read_timeout(&mut self, timeout: Duration) {
        debug!(
            "ctx {}: pipe reads keep the device timeout, ignoring {:?}",
            self.ctx_id, timeout
        );
    }
}

impl Drop for VirtioGpuPipeStream {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.destroy_resource(self.ctx_id, self.resource_id) {
            warn!("ctx {}: failed to destroy pipe resource: {}", self.ctx_id, e);
        }
        if let Err(e) = self.gpu.destroy_context(self.ctx_id) {
            warn!("ctx {}: failed to destroy context: {}", self.ctx_id, e);
        }
    }
}

/// Asks the host for this process's id over `pipe:GLProcessPipe`.
pub fn process_pipe_init(gpu: Arc<EmulatedVirtioGpu>, capset_id: u32) -> GuestResult<u64> {
    let mut pipe = VirtioGpuPipeStream::connect(gpu, capset_id, PIPE_GL_PROCESS)?;
    pipe.write_all(&GL_PROCESS_PIPE_CONFIRM.to_le_bytes())?;
    let mut puid = [0u8; 8];
    pipe.read_exact(&mut puid).map_err(|e| {
        error!("process pipe handshake: {}", e);
        GuestError::ProcessPipe
    })?;
    Ok(u64::from_le_bytes(puid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatedGpuConfig;
    use gfxstream_host::GFXSTREAM_CAPSET_VULKAN;

    #[test]
    fn process_ids_are_distinct() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = Arc::new(EmulatedVirtioGpu::new(EmulatedGpuConfig::default()).unwrap());
        let a = process_pipe_init(gpu.clone(), GFXSTREAM_CAPSET_VULKAN).unwrap();
        let b = process_pipe_init(gpu.clone(), GFXSTREAM_CAPSET_VULKAN).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn unknown_service_closes_the_stream() {
        let _ = env_logger::builder().is_test(true).try_init();
        let gpu = Arc::new(EmulatedVirtioGpu::new(EmulatedGpuConfig::default()).unwrap());
        let mut pipe = VirtioGpuPipeStream::connect(gpu, GFXSTREAM_CAPSET_VULKAN, "pipe:bogus")
            .unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(
            pipe.read_exact(&mut out),
            Err(GuestError::StreamClosed)
        ));
    }
}
