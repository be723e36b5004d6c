// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GLESv2 server context.  Carries the texture subset the host core exercises; every failure
//! lands in the context's GL error flag.

use std::collections::BTreeMap as Map;
use std::sync::Arc;

use log::debug;

use crate::backend::to_gl_error;
use crate::backend::GL_INVALID_ENUM;
use crate::backend::GL_INVALID_OPERATION;
use crate::backend::GL_INVALID_VALUE;
use crate::backend::GL_NO_ERROR;
use crate::gfxstream_utils::*;
use crate::renderer::Renderer;
use crate::server::render_control::GL_EXTENSIONS;
use crate::server::render_control::GL_RENDERER;
use crate::server::render_control::GL_VENDOR;
use crate::server::render_control::GL_VERSION;
use crate::server::DispatchContext;
use crate::server::ServerContext;
use crate::wire::Decoder;
use crate::wire::Encoder;

pub const OP_GL_BIND_TEXTURE: u32 = 2053;
pub const OP_GL_DELETE_TEXTURES: u32 = 2071;
pub const OP_GL_FINISH: u32 = 2084;
pub const OP_GL_FLUSH: u32 = 2085;
pub const OP_GL_GEN_TEXTURES: u32 = 2093;
pub const OP_GL_GET_ERROR: u32 = 2099;
pub const OP_GL_GET_STRING: u32 = 2111;
pub const OP_GL_TEX_IMAGE_2D: u32 = 2144;
pub const OP_GL_TEX_SUB_IMAGE_2D: u32 = 2149;

const GLES_OPCODES: &[u32] = &[
    OP_GL_BIND_TEXTURE,
    OP_GL_DELETE_TEXTURES,
    OP_GL_FINISH,
    OP_GL_FLUSH,
    OP_GL_GEN_TEXTURES,
    OP_GL_GET_ERROR,
    OP_GL_GET_STRING,
    OP_GL_TEX_IMAGE_2D,
    OP_GL_TEX_SUB_IMAGE_2D,
];

pub const GL_TEXTURE_2D: u32 = 0x0DE1;

#[derive(Copy, Clone, Debug, Default)]
struct TextureObject {
    /// Back-end texture, allocated by the first `glTexImage2D`.
    storage: Option<u32>,
    width: u32,
    height: u32,
}

#[derive(Default)]
pub struct GlesServer {
    error: u32,
    textures: Map<u32, TextureObject>,
    bound_texture: u32,
    next_name: u32,
}

impl GlesServer {
    pub fn new() -> GlesServer {
        GlesServer {
            error: GL_NO_ERROR,
            next_name: 1,
            ..Default::default()
        }
    }

    /// Only the first error sticks until `glGetError` reads it.
    fn set_error(&mut self, error: u32) {
        if self.error == GL_NO_ERROR {
            debug!("gles: error {:#x}", error);
            self.error = error;
        }
    }

    fn bound(&mut self, target: u32) -> Option<&mut TextureObject> {
        if target != GL_TEXTURE_2D {
            self.set_error(GL_INVALID_ENUM);
            return None;
        }
        if self.bound_texture == 0 {
            self.set_error(GL_INVALID_OPERATION);
            return None;
        }
        self.textures.get_mut(&self.bound_texture)
    }

    fn tex_image_2d(
        &mut self,
        renderer: &Renderer,
        target: u32,
        level: i32,
        internal_format: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) {
        let gl = match renderer.gl() {
            Some(gl) => gl.clone(),
            None => return self.set_error(GL_INVALID_OPERATION),
        };
        if level != 0 {
            return self.set_error(GL_INVALID_VALUE);
        }
        let texture = match self.bound(target) {
            Some(t) => t,
            None => return,
        };

        if let Some(old) = texture.storage.take() {
            gl.destroy_texture(old);
        }
        let result = gl
            .create_texture(width, height, internal_format)
            .and_then(|storage| {
                texture.storage = Some(storage);
                texture.width = width;
                texture.height = height;
                if pixels.is_empty() {
                    Ok(())
                } else {
                    gl.update_texture(storage, 0, 0, width, height, pixels)
                }
            });
        if let Err(e) = result {
            self.set_error(to_gl_error(&e));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn tex_sub_image_2d(
        &mut self,
        renderer: &Renderer,
        target: u32,
        level: i32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) {
        let gl = match renderer.gl() {
            Some(gl) => gl.clone(),
            None => return self.set_error(GL_INVALID_OPERATION),
        };
        if level != 0 {
            return self.set_error(GL_INVALID_VALUE);
        }
        let storage = match self.bound(target) {
            Some(TextureObject {
                storage: Some(s), ..
            }) => *s,
            Some(_) => return self.set_error(GL_INVALID_OPERATION),
            None => return,
        };
        if let Err(e) = gl.update_texture(storage, x, y, width, height, pixels) {
            self.set_error(to_gl_error(&e));
        }
    }

    fn release_all(&mut self, renderer: &Renderer) {
        if let Some(gl) = renderer.gl() {
            for texture in self.textures.values() {
                if let Some(storage) = texture.storage {
                    gl.destroy_texture(storage);
                }
            }
        }
        self.textures.clear();
        self.bound_texture = 0;
    }
}

impl ServerContext for GlesServer {
    fn name(&self) -> &'static str {
        "gles2"
    }

    fn handles(&self, opcode: u32) -> bool {
        GLES_OPCODES.contains(&opcode)
    }

    fn dispatch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dec: &mut Decoder<'_>,
        reply: &mut Encoder,
    ) -> GfxstreamResult<()> {
        let renderer: &Arc<Renderer> = ctx.renderer;
        match dec.opcode() {
            OP_GL_GEN_TEXTURES => {
                let n = dec.get_u32()?;
                let names: Vec<u32> = (0..n)
                    .map(|_| {
                        let name = self.next_name;
                        self.next_name += 1;
                        self.textures.insert(name, TextureObject::default());
                        name
                    })
                    .collect();
                reply.put_u32_array(&names);
            }
            OP_GL_DELETE_TEXTURES => {
                let names = dec.get_u32_array()?;
                for name in names {
                    if let Some(texture) = self.textures.remove(&name) {
                        if let (Some(storage), Some(gl)) = (texture.storage, renderer.gl()) {
                            gl.destroy_texture(storage);
                        }
                    }
                    if self.bound_texture == name {
                        self.bound_texture = 0;
                    }
                }
            }
            OP_GL_BIND_TEXTURE => {
                let target = dec.get_u32()?;
                let name = dec.get_u32()?;
                if target != GL_TEXTURE_2D {
                    self.set_error(GL_INVALID_ENUM);
                } else {
                    // Binding an unused name creates it.
                    if name != 0 {
                        self.textures.entry(name).or_default();
                    }
                    self.bound_texture = name;
                }
            }
            OP_GL_TEX_IMAGE_2D => {
                let target = dec.get_u32()?;
                let level = dec.get_i32()?;
                let internal_format = dec.get_u32()?;
                let width = dec.get_u32()?;
                let height = dec.get_u32()?;
                let _border = dec.get_i32()?;
                let _format = dec.get_u32()?;
                let _type = dec.get_u32()?;
                let pixels = dec.get_bytes()?;
                self.tex_image_2d(
                    renderer,
                    target,
                    level,
                    internal_format,
                    width,
                    height,
                    pixels,
                );
            }
            OP_GL_TEX_SUB_IMAGE_2D => {
                let target = dec.get_u32()?;
                let level = dec.get_i32()?;
                let x = dec.get_u32()?;
                let y = dec.get_u32()?;
                let width = dec.get_u32()?;
                let height = dec.get_u32()?;
                let _format = dec.get_u32()?;
                let _type = dec.get_u32()?;
                let pixels = dec.get_bytes()?;
                self.tex_sub_image_2d(renderer, target, level, x, y, width, height, pixels);
            }
            OP_GL_GET_ERROR => {
                reply.put_u32(std::mem::replace(&mut self.error, GL_NO_ERROR));
            }
            OP_GL_GET_STRING => {
                let name = dec.get_u32()?;
                let s = match (renderer.gl(), name) {
                    (Some(gl), GL_VENDOR) => gl.renderer_strings().0,
                    (Some(gl), GL_RENDERER) => gl.renderer_strings().1,
                    (Some(gl), GL_VERSION) => gl.renderer_strings().2,
                    (Some(_), GL_EXTENSIONS) => String::new(),
                    _ => {
                        self.set_error(GL_INVALID_ENUM);
                        String::new()
                    }
                };
                reply.put_string(&s);
            }
            // The back-ends execute synchronously.
            OP_GL_FLUSH | OP_GL_FINISH => (),
            opcode => return Err(ProtocolError::UnknownOpcode(opcode).into()),
        }
        Ok(())
    }

    fn on_exit(&mut self, renderer: &Arc<Renderer>) {
        self.release_all(renderer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubGlBackend;
    use crate::external_object_manager::ExternalObjectManager;
    use crate::features::FeatureSet;
    use crate::formats::GL_RGBA;
    use crate::renderer::RendererConfig;
    use crate::wire::ChecksumCalculator;
    use crate::wire::PACKET_HEADER_SIZE;

    fn renderer(gl: Arc<StubGlBackend>) -> Arc<Renderer> {
        Renderer::new(RendererConfig {
            features: FeatureSet::new(),
            gl: Some(gl),
            vk: None,
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap()
    }

    fn call(server: &mut GlesServer, renderer: &Arc<Renderer>, call: Encoder) -> Vec<u8> {
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

    fn get_error(server: &mut GlesServer, renderer: &Arc<Renderer>) -> u32 {
        let reply = call(server, renderer, Encoder::new(OP_GL_GET_ERROR));
        u32::from_le_bytes([reply[0], reply[1], reply[2], reply[3]])
    }

    #[test]
    fn texture_lifecycle_and_errors() {
        let gl = Arc::new(StubGlBackend::new());
        let r = renderer(gl.clone());
        let mut server = GlesServer::new();

        let mut gen = Encoder::new(OP_GL_GEN_TEXTURES);
        gen.put_u32(1);
        let reply = call(&mut server, &r, gen);
        // Array marker, then the name.
        let name = u32::from_le_bytes([reply[4], reply[5], reply[6], reply[7]]);
        assert_eq!(name, 1);

        // Nothing bound yet.
        let mut sub = Encoder::new(OP_GL_TEX_SUB_IMAGE_2D);
        sub.put_u32(GL_TEXTURE_2D)
            .put_i32(0)
            .put_u32(0)
            .put_u32(0)
            .put_u32(1)
            .put_u32(1)
            .put_u32(GL_RGBA)
            .put_u32(0)
            .put_bytes(&[0; 4]);
        call(&mut server, &r, sub);
        assert_eq!(get_error(&mut server, &r), GL_INVALID_OPERATION);
        assert_eq!(get_error(&mut server, &r), GL_NO_ERROR);

        let mut bind = Encoder::new(OP_GL_BIND_TEXTURE);
        bind.put_u32(GL_TEXTURE_2D).put_u32(name);
        call(&mut server, &r, bind);

        let mut image = Encoder::new(OP_GL_TEX_IMAGE_2D);
        image
            .put_u32(GL_TEXTURE_2D)
            .put_i32(0)
            .put_u32(GL_RGBA)
            .put_u32(2)
            .put_u32(2)
            .put_i32(0)
            .put_u32(GL_RGBA)
            .put_u32(0)
            .put_bytes(&[]);
        call(&mut server, &r, image);
        assert_eq!(get_error(&mut server, &r), GL_NO_ERROR);
        assert_eq!(gl.texture_count(), 1);

        // Out of bounds update.
        let mut sub = Encoder::new(OP_GL_TEX_SUB_IMAGE_2D);
        sub.put_u32(GL_TEXTURE_2D)
            .put_i32(0)
            .put_u32(1)
            .put_u32(1)
            .put_u32(2)
            .put_u32(2)
            .put_u32(GL_RGBA)
            .put_u32(0)
            .put_bytes(&[0; 16]);
        call(&mut server, &r, sub);
        assert_eq!(get_error(&mut server, &r), GL_INVALID_VALUE);

        server.on_exit(&r);
        assert_eq!(gl.texture_count(), 0);
    }
}
