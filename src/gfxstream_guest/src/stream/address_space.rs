// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use gfxstream_host::asg::AsgRing;
use gfxstream_host::frontend::protocol::*;
use gfxstream_host::GFXSTREAM_BLOB_FLAG_USE_MAPPABLE;
use gfxstream_host::GFXSTREAM_BLOB_MEM_HOST3D;
use log::debug;
use log::warn;
use zerocopy::AsBytes;

use crate::emulated::EmulatedVirtioGpu;
use crate::error::GuestError;
use crate::error::GuestResult;
use crate::stream::GuestStream;
use crate::stream::StreamParams;
use crate::stream::DEFAULT_READ_TIMEOUT;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// A stream over an address-space graphics ring blob shared with a render thread.
pub struct AddressSpaceStream {
    gpu: Arc<EmulatedVirtioGpu>,
    ctx_id: u32,
    ring_resource: u32,
    ring: AsgRing,
    read_timeout: Duration,
}

impl AddressSpaceStream {
    /// Opens a context of `capset_id`, creates its ring blob and starts the render thread.
    pub fn create(gpu: Arc<EmulatedVirtioGpu>, capset_id: u32) -> GuestResult<AddressSpaceStream> {
        let params = StreamParams::from_capset(capset_id, &gpu.get_caps(capset_id)?)?;
        let ctx_id = gpu.create_context(capset_id)?;

        let size = params.ring_blob_size();
        let ring_resource = match gpu.create_blob(
            ctx_id,
            GFXSTREAM_BLOB_MEM_HOST3D,
            GFXSTREAM_BLOB_FLAG_USE_MAPPABLE,
            0,
            size,
        ) {
            Ok(id) => id,
            Err(e) => {
                let _ = gpu.destroy_context(ctx_id);
                return Err(e);
            }
        };

        let ring = match AddressSpaceStream::start(&gpu, ctx_id, ring_resource, size) {
            Ok(ring) => ring,
            Err(e) => {
                let _ = gpu.destroy_resource(ctx_id, ring_resource);
                let _ = gpu.destroy_context(ctx_id);
                return Err(e);
            }
        };

        Ok(AddressSpaceStream {
            gpu,
            ctx_id,
            ring_resource,
            ring,
            read_timeout: DEFAULT_READ_TIMEOUT,
        })
    }

    fn start(
        gpu: &EmulatedVirtioGpu,
        ctx_id: u32,
        ring_resource: u32,
        size: u64,
    ) -> GuestResult<AsgRing> {
        let create = GfxstreamContextCreate {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CONTEXT_CREATE,
            },
            resource_id: ring_resource,
        };
        gpu.submit_cmd(ctx_id, create.as_bytes(), 0, 0, Some(ring_resource))?;
        gpu.wait(ring_resource)?;

        let mapping = gpu.map(ring_resource)?;
        let len = mapping.size().min(size as usize);
        // SAFETY: the ring blob stays mapped until the stream destroys it.
        let ring = unsafe { AsgRing::from_raw(mapping.as_ptr(), len)? };
        debug!(
            "ctx {}: ring blob {} of {} bytes, {} bytes per direction",
            ctx_id,
            ring_resource,
            size,
            ring.capacity()
        );
        Ok(ring)
    }

    fn ping(&self) -> GuestResult<()> {
        let ping = GfxstreamContextPing {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CONTEXT_PING,
            },
            resource_id: self.ring_resource,
        };
        self.gpu
            .submit_cmd(self.ctx_id, ping.as_bytes(), 0, 0, None)?;
        Ok(())
    }
}

impl GuestStream for AddressSpaceStream {
    fn context_id(&self) -> u32 {
        self.ctx_id
    }

    fn write_all(&mut self, bytes: &[u8]) -> GuestResult<()> {
        let start = Instant::now();
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self.ring.to_host().write(rest)?;
            rest = &rest[n..];
            if n == 0 {
                // The render thread drains on its own; a ping only wakes it sooner.
                self.ping()?;
                if start.elapsed() > WRITE_TIMEOUT {
                    warn!("ctx {}: ring full for {:?}", self.ctx_id, WRITE_TIMEOUT);
                    return Err(GuestError::Timeout);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
        self.ping()
    }

    fn read_exact(&mut self, out: &mut [u8]) -> GuestResult<()> {
        let start = Instant::now();
        let mut read = 0;
        while read < out.len() {
            let n = self.ring.from_host().read(&mut out[read..])?;
            read += n;
            if n == 0 {
                if start.elapsed() > self.read_timeout {
                    warn!(
                        "ctx {}: no reply after {:?}, {} of {} bytes read",
                        self.ctx_id,
                        self.read_timeout,
                        read,
                        out.len()
                    );
                    return Err(GuestError::Timeout);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }
}

impl Drop for AddressSpaceStream {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.destroy_resource(self.ctx_id, self.ring_resource) {
            warn!("ctx {}: failed to destroy ring blob: {}", self.ctx_id, e);
        }
        if let Err(e) = self.gpu.destroy_context(self.ctx_id) {
            warn!("ctx {}: failed to destroy context: {}", self.ctx_id, e);
        }
    }
}
