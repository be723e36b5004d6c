// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Magma server context.  Object ids handed to the guest are local to the context.

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use log::debug;

use crate::backend::to_magma_status;
use crate::backend::MagmaBackend;
use crate::backend::MagmaPollItem;
use crate::backend::MAGMA_STATUS_INVALID_ARGS;
use crate::backend::MAGMA_STATUS_OK;
use crate::backend::MAGMA_STATUS_UNIMPLEMENTED;
use crate::gfxstream_utils::*;
use crate::renderer::Renderer;
use crate::server::DispatchContext;
use crate::server::ServerContext;
use crate::wire::Decoder;
use crate::wire::Encoder;

pub const OP_MAGMA_DEVICE_QUERY: u32 = 100000;
pub const OP_MAGMA_CREATE_CONTEXT: u32 = 100001;
pub const OP_MAGMA_RELEASE_CONTEXT: u32 = 100002;
pub const OP_MAGMA_CREATE_BUFFER: u32 = 100003;
pub const OP_MAGMA_RELEASE_BUFFER: u32 = 100004;
pub const OP_MAGMA_CREATE_SEMAPHORE: u32 = 100005;
pub const OP_MAGMA_RELEASE_SEMAPHORE: u32 = 100006;
pub const OP_MAGMA_SEMAPHORE_SIGNAL: u32 = 100007;
pub const OP_MAGMA_SEMAPHORE_RESET: u32 = 100008;
pub const OP_MAGMA_POLL: u32 = 100009;

const MAGMA_OPCODES: &[u32] = &[
    OP_MAGMA_DEVICE_QUERY,
    OP_MAGMA_CREATE_CONTEXT,
    OP_MAGMA_RELEASE_CONTEXT,
    OP_MAGMA_CREATE_BUFFER,
    OP_MAGMA_RELEASE_BUFFER,
    OP_MAGMA_CREATE_SEMAPHORE,
    OP_MAGMA_RELEASE_SEMAPHORE,
    OP_MAGMA_SEMAPHORE_SIGNAL,
    OP_MAGMA_SEMAPHORE_RESET,
    OP_MAGMA_POLL,
];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum MagmaObject {
    Context(u64),
    Buffer(u64),
    Semaphore(u64),
}

#[derive(Default)]
pub struct MagmaServer {
    objects: Map<u64, MagmaObject>,
    next_id: u64,
}

impl MagmaServer {
    pub fn new() -> MagmaServer {
        Default::default()
    }

    fn insert(&mut self, object: MagmaObject) -> u64 {
        self.next_id += 1;
        self.objects.insert(self.next_id, object);
        self.next_id
    }

    fn semaphore(&self, id: u64) -> Option<u64> {
        match self.objects.get(&id) {
            Some(MagmaObject::Semaphore(native)) => Some(*native),
            _ => None,
        }
    }

    fn release(&mut self, magma: &dyn MagmaBackend, id: u64) -> i32 {
        match self.objects.remove(&id) {
            Some(MagmaObject::Context(native)) => magma.release_context(native),
            Some(MagmaObject::Buffer(native)) => magma.release_buffer(native),
            Some(MagmaObject::Semaphore(native)) => magma.release_semaphore(native),
            None => return MAGMA_STATUS_INVALID_ARGS,
        }
        MAGMA_STATUS_OK
    }
}

impl ServerContext for MagmaServer {
    fn name(&self) -> &'static str {
        "magma"
    }

    fn handles(&self, opcode: u32) -> bool {
        MAGMA_OPCODES.contains(&opcode)
    }

    fn dispatch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dec: &mut Decoder<'_>,
        reply: &mut Encoder,
    ) -> GfxstreamResult<()> {
        let opcode = dec.opcode();
        let magma = match ctx.renderer.magma() {
            Some(m) => m.clone(),
            None => {
                // Drain the arguments so framing stays intact.
                dec.skip_remaining();
                reply.put_i32(MAGMA_STATUS_UNIMPLEMENTED);
                return Ok(());
            }
        };

        match opcode {
            OP_MAGMA_DEVICE_QUERY => {
                let query_id = dec.get_u64()?;
                match magma.query(query_id) {
                    Ok(value) => reply.put_i32(MAGMA_STATUS_OK).put_u64(value),
                    Err(e) => reply.put_i32(to_magma_status(&e)).put_u64(0),
                };
            }
            OP_MAGMA_CREATE_CONTEXT => match magma.create_context() {
                Ok(native) => {
                    let id = self.insert(MagmaObject::Context(native));
                    reply.put_i32(MAGMA_STATUS_OK).put_u64(id);
                }
                Err(e) => {
                    reply.put_i32(to_magma_status(&e)).put_u64(0);
                }
            },
            OP_MAGMA_CREATE_BUFFER => {
                let size = dec.get_u64()?;
                match magma.create_buffer(size) {
                    Ok((native, actual)) => {
                        let id = self.insert(MagmaObject::Buffer(native));
                        reply.put_i32(MAGMA_STATUS_OK).put_u64(id).put_u64(actual);
                    }
                    Err(e) => {
                        reply.put_i32(to_magma_status(&e)).put_u64(0).put_u64(0);
                    }
                }
            }
            OP_MAGMA_CREATE_SEMAPHORE => match magma.create_semaphore() {
                Ok(native) => {
                    let id = self.insert(MagmaObject::Semaphore(native));
                    reply.put_i32(MAGMA_STATUS_OK).put_u64(id);
                }
                Err(e) => {
                    reply.put_i32(to_magma_status(&e)).put_u64(0);
                }
            },
            OP_MAGMA_RELEASE_CONTEXT | OP_MAGMA_RELEASE_BUFFER | OP_MAGMA_RELEASE_SEMAPHORE => {
                let id = dec.get_u64()?;
                let status = self.release(magma.as_ref(), id);
                reply.put_i32(status);
            }
            OP_MAGMA_SEMAPHORE_SIGNAL | OP_MAGMA_SEMAPHORE_RESET => {
                let id = dec.get_u64()?;
                match self.semaphore(id) {
                    Some(native) if opcode == OP_MAGMA_SEMAPHORE_SIGNAL => {
                        magma.signal_semaphore(native);
                        reply.put_i32(MAGMA_STATUS_OK);
                    }
                    Some(native) => {
                        magma.reset_semaphore(native);
                        reply.put_i32(MAGMA_STATUS_OK);
                    }
                    None => {
                        reply.put_i32(MAGMA_STATUS_INVALID_ARGS);
                    }
                }
            }
            OP_MAGMA_POLL => {
                let ids = dec.get_u64_array()?;
                let conditions = dec.get_u32_array()?;
                if ids.len() != conditions.len() {
                    reply.put_i32(MAGMA_STATUS_INVALID_ARGS);
                    reply.put_u32_array(&vec![0; ids.len()]);
                    return Ok(());
                }
                let mut items = Vec::with_capacity(ids.len());
                for (id, condition) in ids.iter().zip(conditions.iter()) {
                    match self.semaphore(*id) {
                        Some(semaphore) => items.push(MagmaPollItem {
                            semaphore,
                            condition: *condition,
                            result: 0,
                        }),
                        None => {
                            reply.put_i32(MAGMA_STATUS_INVALID_ARGS);
                            reply.put_u32_array(&vec![0; ids.len()]);
                            return Ok(());
                        }
                    }
                }
                let status = magma.poll(&mut items);
                let results: Vec<u32> = items.iter().map(|i| i.result).collect();
                reply.put_i32(status).put_u32_array(&results);
            }
            opcode => return Err(ProtocolError::UnknownOpcode(opcode).into()),
        }
        Ok(())
    }

    fn on_exit(&mut self, renderer: &Arc<Renderer>) {
        let magma = match renderer.magma() {
            Some(m) => m,
            None => return,
        };
        if !self.objects.is_empty() {
            debug!("magma: releasing {} objects left by the guest", self.objects.len());
        }
        let ids: Vec<u64> = self.objects.keys().rev().copied().collect();
        for id in ids {
            self.release(magma.as_ref(), id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubMagmaBackend;
    use crate::backend::MAGMA_POLL_CONDITION_SIGNALED;
    use crate::backend::MAGMA_STATUS_TIMED_OUT;
    use crate::external_object_manager::ExternalObjectManager;
    use crate::features::FeatureSet;
    use crate::renderer::RendererConfig;
    use crate::wire::ChecksumCalculator;
    use crate::wire::PACKET_HEADER_SIZE;

    fn renderer() -> Arc<Renderer> {
        Renderer::new(RendererConfig {
            features: FeatureSet::new(),
            gl: None,
            vk: None,
            magma: Some(Arc::new(StubMagmaBackend::new())),
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap()
    }

    fn call(server: &mut MagmaServer, renderer: &Arc<Renderer>, call: Encoder) -> Vec<u8> {
        let packet = call.finish(&mut ChecksumCalculator::new());
        let opcode = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let mut dec = Decoder::new(opcode, &packet[PACKET_HEADER_SIZE..]);
        let mut reply = Encoder::reply();
        let mut checksum = ChecksumCalculator::new();
        let mut puid = 0;
        let mut ctx = DispatchContext {
            renderer,
            checksum: &mut checksum,
            ctx_id: 1,
            puid: &mut puid,
            packet: &packet,
            for_snapshot_load: false,
        };
        server.dispatch(&mut ctx, &mut dec, &mut reply).unwrap();
        dec.finish().unwrap();
        reply.finish_reply(&mut checksum)
    }

    fn status_and_id(reply: &[u8]) -> (i32, u64) {
        let mut dec = Decoder::new(0, reply);
        (dec.get_i32().unwrap(), dec.get_u64().unwrap())
    }

    fn poll(server: &mut MagmaServer, r: &Arc<Renderer>, semaphore: u64) -> (i32, Vec<u32>) {
        let mut enc = Encoder::new(OP_MAGMA_POLL);
        enc.put_u64_array(&[semaphore])
            .put_u32_array(&[MAGMA_POLL_CONDITION_SIGNALED]);
        let reply = call(server, r, enc);
        let mut dec = Decoder::new(0, &reply);
        (dec.get_i32().unwrap(), dec.get_u32_array().unwrap())
    }

    #[test]
    fn ids_are_local_to_the_context() {
        let r = renderer();
        let mut a = MagmaServer::new();
        let mut b = MagmaServer::new();
        let (status, ctx_a) = status_and_id(&call(&mut a, &r, Encoder::new(OP_MAGMA_CREATE_CONTEXT)));
        assert_eq!(status, MAGMA_STATUS_OK);
        let (_, ctx_b) = status_and_id(&call(&mut b, &r, Encoder::new(OP_MAGMA_CREATE_CONTEXT)));
        assert_eq!(ctx_a, ctx_b);

        let mut release = Encoder::new(OP_MAGMA_RELEASE_CONTEXT);
        release.put_u64(ctx_a);
        assert_eq!(call(&mut a, &r, release), MAGMA_STATUS_OK.to_le_bytes().to_vec());
        let mut again = Encoder::new(OP_MAGMA_RELEASE_CONTEXT);
        again.put_u64(ctx_a);
        assert_eq!(
            call(&mut a, &r, again),
            MAGMA_STATUS_INVALID_ARGS.to_le_bytes().to_vec()
        );
        assert_eq!(b.objects.len(), 1);
    }

    #[test]
    fn poll_never_blocks() {
        let r = renderer();
        let mut server = MagmaServer::new();
        let (_, semaphore) =
            status_and_id(&call(&mut server, &r, Encoder::new(OP_MAGMA_CREATE_SEMAPHORE)));
        assert_eq!(poll(&mut server, &r, semaphore), (MAGMA_STATUS_TIMED_OUT, vec![0]));

        let mut signal = Encoder::new(OP_MAGMA_SEMAPHORE_SIGNAL);
        signal.put_u64(semaphore);
        call(&mut server, &r, signal);
        assert_eq!(
            poll(&mut server, &r, semaphore),
            (MAGMA_STATUS_OK, vec![MAGMA_POLL_CONDITION_SIGNALED])
        );
        assert_eq!(poll(&mut server, &r, 99).0, MAGMA_STATUS_INVALID_ARGS);
    }

    #[test]
    fn buffers_report_actual_size() {
        let r = renderer();
        let mut server = MagmaServer::new();
        let mut create = Encoder::new(OP_MAGMA_CREATE_BUFFER);
        create.put_u64(100);
        let reply = call(&mut server, &r, create);
        let mut dec = Decoder::new(0, &reply);
        assert_eq!(dec.get_i32().unwrap(), MAGMA_STATUS_OK);
        assert_ne!(dec.get_u64().unwrap(), 0);
        assert_eq!(dec.get_u64().unwrap(), 4096);
        server.on_exit(&r);
        assert!(server.objects.is_empty());
    }
}
