// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use gfxstream_host::server::gles::*;
use gfxstream_host::wire::Encoder;

use crate::encoder::CallStream;
use crate::error::GuestError;
use crate::error::GuestResult;

/// The subset of GLES 2 the render threads decode.
pub struct GlesEncoder<'a> {
    calls: &'a mut CallStream,
}

impl<'a> GlesEncoder<'a> {
    pub fn new(calls: &'a mut CallStream) -> GlesEncoder<'a> {
        GlesEncoder { calls }
    }

    pub fn gen_textures(&mut self, n: u32) -> GuestResult<Vec<u32>> {
        let opcode = OP_GL_GEN_TEXTURES;
        let mut call = Encoder::new(opcode);
        call.put_u32(n);
        let names = self.calls.call(opcode, call, |r| r.get_u32_array())?;
        if names.len() != n as usize {
            return Err(GuestError::MalformedReply(opcode));
        }
        Ok(names)
    }

    pub fn delete_textures(&mut self, names: &[u32]) -> GuestResult<()> {
        let mut call = Encoder::new(OP_GL_DELETE_TEXTURES);
        call.put_u32_array(names);
        self.calls.send(call)
    }

    pub fn bind_texture(&mut self, target: u32, name: u32) -> GuestResult<()> {
        let mut call = Encoder::new(OP_GL_BIND_TEXTURE);
        call.put_u32(target).put_u32(name);
        self.calls.send(call)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_image_2d(
        &mut self,
        target: u32,
        level: i32,
        internal_format: u32,
        width: u32,
        height: u32,
        format: u32,
        type_: u32,
        pixels: &[u8],
    ) -> GuestResult<()> {
        let mut call = Encoder::new(OP_GL_TEX_IMAGE_2D);
        call.put_u32(target)
            .put_i32(level)
            .put_u32(internal_format)
            .put_u32(width)
            .put_u32(height)
            .put_i32(0)
            .put_u32(format)
            .put_u32(type_)
            .put_bytes(pixels);
        self.calls.send(call)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_sub_image_2d(
        &mut self,
        target: u32,
        level: i32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: u32,
        type_: u32,
        pixels: &[u8],
    ) -> GuestResult<()> {
        let mut call = Encoder::new(OP_GL_TEX_SUB_IMAGE_2D);
        call.put_u32(target)
            .put_i32(level)
            .put_u32(x)
            .put_u32(y)
            .put_u32(width)
            .put_u32(height)
            .put_u32(format)
            .put_u32(type_)
            .put_bytes(pixels);
        self.calls.send(call)
    }

    /// Returns and clears the first error recorded since the last query.
    pub fn get_error(&mut self) -> GuestResult<u32> {
        let opcode = OP_GL_GET_ERROR;
        self.calls.call(opcode, Encoder::new(opcode), |r| r.get_u32())
    }

    pub fn get_string(&mut self, name: u32) -> GuestResult<String> {
        let opcode = OP_GL_GET_STRING;
        let mut call = Encoder::new(opcode);
        call.put_u32(name);
        self.calls.call(opcode, call, |r| r.get_string())
    }

    pub fn flush(&mut self) -> GuestResult<()> {
        self.calls.send(Encoder::new(OP_GL_FLUSH))
    }

    pub fn finish(&mut self) -> GuestResult<()> {
        self.calls.send(Encoder::new(OP_GL_FINISH))
    }
}
