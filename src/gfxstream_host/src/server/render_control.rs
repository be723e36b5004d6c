// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! renderControl: connection setup, color buffer lifetime and host queries.

use std::sync::Arc;

use log::debug;
use log::warn;

use crate::formats::FrameworkFormat;
use crate::gfxstream_utils::*;
use crate::renderer::Renderer;
use crate::server::DispatchContext;
use crate::server::ServerContext;
use crate::wire::Decoder;
use crate::wire::Encoder;

pub const OP_RC_GET_RENDERER_VERSION: u32 = 10000;
pub const OP_RC_GET_GL_STRING: u32 = 10003;
pub const OP_RC_CREATE_COLOR_BUFFER: u32 = 10012;
pub const OP_RC_OPEN_COLOR_BUFFER: u32 = 10013;
pub const OP_RC_CLOSE_COLOR_BUFFER: u32 = 10014;
pub const OP_RC_READ_COLOR_BUFFER: u32 = 10023;
pub const OP_RC_UPDATE_COLOR_BUFFER: u32 = 10024;
pub const OP_RC_SELECT_CHECKSUM_HELPER: u32 = 10028;
pub const OP_RC_SET_PUID: u32 = 10033;
pub const OP_RC_GET_HOST_EXTENSIONS_STRING: u32 = 10069;

const RC_OPCODES: &[u32] = &[
    OP_RC_GET_RENDERER_VERSION,
    OP_RC_GET_GL_STRING,
    OP_RC_CREATE_COLOR_BUFFER,
    OP_RC_OPEN_COLOR_BUFFER,
    OP_RC_CLOSE_COLOR_BUFFER,
    OP_RC_READ_COLOR_BUFFER,
    OP_RC_UPDATE_COLOR_BUFFER,
    OP_RC_SELECT_CHECKSUM_HELPER,
    OP_RC_SET_PUID,
    OP_RC_GET_HOST_EXTENSIONS_STRING,
];

pub const RENDERER_VERSION: u32 = 1;

pub const GL_VENDOR: u32 = 0x1F00;
pub const GL_RENDERER: u32 = 0x1F01;
pub const GL_VERSION: u32 = 0x1F02;
pub const GL_EXTENSIONS: u32 = 0x1F03;

/// Writes `s` NUL-terminated into an out-buffer of `buffer_size` bytes and returns the size the
/// guest needs, negated when its buffer was too small.  A short buffer is left zeroed.
pub(crate) fn put_string_out(reply: &mut Encoder, s: &str, buffer_size: usize) -> i32 {
    let needed = s.len() + 1;
    let mut out = vec![0u8; buffer_size];
    let ret = if buffer_size < needed {
        -(needed as i32)
    } else {
        out[..s.len()].copy_from_slice(s.as_bytes());
        needed as i32
    };
    reply.put_bytes(&out);
    ret
}

#[derive(Default)]
pub struct RenderControlServer {}

impl RenderControlServer {
    pub fn new() -> RenderControlServer {
        RenderControlServer {}
    }

    fn gl_string(renderer: &Renderer, name: u32) -> Option<String> {
        let (vendor, renderer_name, version) = renderer.gl()?.renderer_strings();
        match name {
            GL_VENDOR => Some(vendor),
            GL_RENDERER => Some(renderer_name),
            GL_VERSION => Some(version),
            GL_EXTENSIONS => Some(String::new()),
            _ => None,
        }
    }
}

impl ServerContext for RenderControlServer {
    fn name(&self) -> &'static str {
        "renderControl"
    }

    fn handles(&self, opcode: u32) -> bool {
        RC_OPCODES.contains(&opcode)
    }

    fn dispatch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dec: &mut Decoder<'_>,
        reply: &mut Encoder,
    ) -> GfxstreamResult<()> {
        let renderer: &Arc<Renderer> = ctx.renderer;
        match dec.opcode() {
            OP_RC_GET_RENDERER_VERSION => {
                reply.put_u32(RENDERER_VERSION);
            }
            OP_RC_GET_GL_STRING => {
                let name = dec.get_u32()?;
                let buffer_size = dec.get_u32()? as usize;
                let s = RenderControlServer::gl_string(renderer, name).unwrap_or_default();
                // The guest sizes its buffer from the first answer, so the length is always
                // reported positive here.
                let ret = put_string_out(reply, &s, buffer_size);
                reply.put_i32(ret.abs());
            }
            OP_RC_CREATE_COLOR_BUFFER => {
                let width = dec.get_u32()?;
                let height = dec.get_u32()?;
                let internal_format = dec.get_u32()?;
                let handle = match renderer.create_color_buffer(
                    None,
                    width,
                    height,
                    internal_format,
                    FrameworkFormat::GlCompatible,
                ) {
                    Ok(handle) => {
                        renderer.track_color_buffer(handle, *ctx.puid);
                        handle
                    }
                    Err(e) => {
                        warn!("rcCreateColorBuffer {}x{} failed: {}", width, height, e);
                        0
                    }
                };
                reply.put_u32(handle);
            }
            OP_RC_OPEN_COLOR_BUFFER => {
                let handle = dec.get_u32()?;
                if let Err(e) = renderer.open_color_buffer(handle, *ctx.puid) {
                    warn!("rcOpenColorBuffer: {}", e);
                }
            }
            OP_RC_CLOSE_COLOR_BUFFER => {
                let handle = dec.get_u32()?;
                if let Err(e) = renderer.close_color_buffer(handle, *ctx.puid) {
                    warn!("rcCloseColorBuffer: {}", e);
                }
            }
            OP_RC_READ_COLOR_BUFFER => {
                let handle = dec.get_u32()?;
                let x = dec.get_u32()?;
                let y = dec.get_u32()?;
                let width = dec.get_u32()?;
                let height = dec.get_u32()?;
                let size = dec.get_u32()? as usize;
                let mut pixels = vec![0u8; size];
                if let Err(e) = renderer.read_color_buffer(handle, x, y, width, height, &mut pixels)
                {
                    warn!("rcReadColorBuffer {}: {}", handle, e);
                }
                reply.put_bytes(&pixels);
            }
            OP_RC_UPDATE_COLOR_BUFFER => {
                let handle = dec.get_u32()?;
                let x = dec.get_u32()?;
                let y = dec.get_u32()?;
                let width = dec.get_u32()?;
                let height = dec.get_u32()?;
                let pixels = dec.get_bytes()?;
                let ret = match renderer.update_color_buffer(handle, x, y, width, height, pixels) {
                    Ok(()) => 0,
                    Err(e) => {
                        warn!("rcUpdateColorBuffer {}: {}", handle, e);
                        -1
                    }
                };
                reply.put_i32(ret);
            }
            OP_RC_SELECT_CHECKSUM_HELPER => {
                let protocol = dec.get_u32()?;
                let _reserved = dec.get_u32()?;
                if ctx.checksum.set_version(protocol) {
                    debug!("checksum protocol v{} selected", protocol);
                } else {
                    warn!("unsupported checksum protocol v{}", protocol);
                }
            }
            OP_RC_SET_PUID => {
                *ctx.puid = dec.get_u64()?;
            }
            OP_RC_GET_HOST_EXTENSIONS_STRING => {
                let buffer_size = dec.get_u32()? as usize;
                let extensions = renderer.host_extensions();
                let ret = put_string_out(reply, &extensions, buffer_size);
                reply.put_i32(ret);
            }
            opcode => return Err(ProtocolError::UnknownOpcode(opcode).into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubGlBackend;
    use crate::external_object_manager::ExternalObjectManager;
    use crate::features::Feature;
    use crate::features::FeatureSet;
    use crate::formats::GL_RGBA;
    use crate::renderer::RendererConfig;
    use crate::wire::ChecksumCalculator;
    use crate::wire::PACKET_HEADER_SIZE;

    struct Harness {
        renderer: Arc<Renderer>,
        checksum: ChecksumCalculator,
        puid: u64,
        server: RenderControlServer,
    }

    impl Harness {
        fn new() -> Harness {
            let mut features = FeatureSet::new();
            features.set(Feature::GlPipeChecksum, true);
            Harness {
                renderer: Renderer::new(RendererConfig {
                    features,
                    gl: Some(Arc::new(StubGlBackend::new())),
                    vk: None,
                    magma: None,
                    external_objects: ExternalObjectManager::new(),
                })
                .unwrap(),
                checksum: ChecksumCalculator::new(),
                puid: 0,
                server: RenderControlServer::new(),
            }
        }

        fn call(&mut self, call: Encoder) -> GfxstreamResult<Vec<u8>> {
            let packet = call.finish(&mut ChecksumCalculator::new());
            let opcode = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
            let mut dec = Decoder::new(opcode, &packet[PACKET_HEADER_SIZE..]);
            let mut reply = Encoder::reply();
            let mut ctx = DispatchContext {
                renderer: &self.renderer,
                checksum: &mut self.checksum,
                ctx_id: 1,
                puid: &mut self.puid,
                packet: &packet,
                for_snapshot_load: false,
            };
            self.server.dispatch(&mut ctx, &mut dec, &mut reply)?;
            dec.finish()?;
            Ok(reply.finish_reply(&mut ChecksumCalculator::new()))
        }
    }

    fn reply_i32(reply: &[u8]) -> i32 {
        let tail = &reply[reply.len() - 4..];
        i32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]])
    }

    #[test]
    fn extension_string_size_probe() {
        let mut h = Harness::new();
        let mut probe = Encoder::new(OP_RC_GET_HOST_EXTENSIONS_STRING);
        probe.put_u32(0);
        let needed = -reply_i32(&h.call(probe).unwrap());
        assert!(needed > 1);

        let mut query = Encoder::new(OP_RC_GET_HOST_EXTENSIONS_STRING);
        query.put_u32(needed as u32);
        let reply = h.call(query).unwrap();
        assert_eq!(reply_i32(&reply), needed);
        let text = String::from_utf8_lossy(&reply[4..4 + needed as usize - 1]).into_owned();
        assert!(text.contains("ANDROID_EMU_CHECKSUM_HELPER_v1"));
    }

    #[test]
    fn select_checksum_installs_version() {
        let mut h = Harness::new();
        let mut select = Encoder::new(OP_RC_SELECT_CHECKSUM_HELPER);
        select.put_u32(1).put_u32(0);
        assert!(h.call(select).unwrap().is_empty());
        assert_eq!(h.checksum.version(), 1);
    }

    #[test]
    fn color_buffers_follow_the_process() {
        let mut h = Harness::new();
        let mut set_puid = Encoder::new(OP_RC_SET_PUID);
        set_puid.put_u64(0x99);
        h.call(set_puid).unwrap();
        assert_eq!(h.puid, 0x99);

        let mut create = Encoder::new(OP_RC_CREATE_COLOR_BUFFER);
        create.put_u32(1).put_u32(1).put_u32(GL_RGBA);
        let reply = h.call(create).unwrap();
        let handle = u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]]);
        assert_ne!(handle, 0);

        let mut update = Encoder::new(OP_RC_UPDATE_COLOR_BUFFER);
        update
            .put_u32(handle)
            .put_u32(0)
            .put_u32(0)
            .put_u32(1)
            .put_u32(1)
            .put_bytes(&[9, 8, 7, 6]);
        assert_eq!(reply_i32(&h.call(update).unwrap()), 0);

        let mut read = Encoder::new(OP_RC_READ_COLOR_BUFFER);
        read.put_u32(handle)
            .put_u32(0)
            .put_u32(0)
            .put_u32(1)
            .put_u32(1)
            .put_u32(4);
        assert_eq!(&h.call(read).unwrap()[4..], &[9, 8, 7, 6]);

        h.renderer.cleanup_process(0x99);
        h.renderer.wait_for_workers().unwrap();
        assert_eq!(h.renderer.color_buffer_count(), 0);
    }

    #[test]
    fn trailing_payload_is_a_protocol_error() {
        let mut h = Harness::new();
        let mut version = Encoder::new(OP_RC_GET_RENDERER_VERSION);
        version.put_u32(0);
        assert!(matches!(
            h.call(version),
            Err(GfxstreamError::Protocol(ProtocolError::PayloadLength { .. }))
        ));
    }
}
