// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use gfxstream_host::server::render_control::*;
use gfxstream_host::wire::Encoder;
use log::warn;

use crate::encoder::CallStream;
use crate::error::GuestError;
use crate::error::GuestResult;

/// Initial out-buffer size for string queries.
const STRING_QUERY_SIZE: usize = 1024;

/// Strips the NUL terminator and anything after it.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub struct RenderControlEncoder<'a> {
    calls: &'a mut CallStream,
}

impl<'a> RenderControlEncoder<'a> {
    pub fn new(calls: &'a mut CallStream) -> RenderControlEncoder<'a> {
        RenderControlEncoder { calls }
    }

    pub fn get_renderer_version(&mut self) -> GuestResult<u32> {
        let opcode = OP_RC_GET_RENDERER_VERSION;
        self.calls.call(opcode, Encoder::new(opcode), |r| r.get_u32())
    }

    /// One string query into an out-buffer of `buffer_size` bytes.  Returns the buffer and the
    /// host's answer: the bytes needed, negated when the buffer was too small.
    fn string_query(&mut self, call: Encoder, opcode: u32) -> GuestResult<(Vec<u8>, i32)> {
        self.calls
            .call(opcode, call, |r| Ok((r.get_bytes()?, r.get_i32()?)))
    }

    pub fn get_host_extensions_string(&mut self, buffer_size: u32) -> GuestResult<(Vec<u8>, i32)> {
        let opcode = OP_RC_GET_HOST_EXTENSIONS_STRING;
        let mut call = Encoder::new(opcode);
        call.put_u32(buffer_size);
        self.string_query(call, opcode)
    }

    /// The host extension string, growing the query buffer once if the first one was short.
    pub fn host_extensions(&mut self) -> GuestResult<String> {
        let (bytes, ret) = self.get_host_extensions_string(STRING_QUERY_SIZE as u32)?;
        if ret >= 0 {
            return Ok(c_string(&bytes));
        }

        let needed = ret.unsigned_abs();
        let (bytes, ret) = self.get_host_extensions_string(needed)?;
        if ret < 0 {
            warn!("host extensions grew to {} bytes while being read", -ret);
            return Err(GuestError::MalformedReply(OP_RC_GET_HOST_EXTENSIONS_STRING));
        }
        Ok(c_string(&bytes))
    }

    pub fn get_gl_string(&mut self, name: u32) -> GuestResult<String> {
        let opcode = OP_RC_GET_GL_STRING;
        let query = |size: u32| {
            let mut call = Encoder::new(opcode);
            call.put_u32(name).put_u32(size);
            call
        };
        let (bytes, needed) = self.string_query(query(STRING_QUERY_SIZE as u32), opcode)?;
        if needed as usize <= STRING_QUERY_SIZE {
            return Ok(c_string(&bytes));
        }
        let (bytes, _) = self.string_query(query(needed as u32), opcode)?;
        Ok(c_string(&bytes))
    }

    pub fn create_color_buffer(
        &mut self,
        width: u32,
        height: u32,
        internal_format: u32,
    ) -> GuestResult<u32> {
        let opcode = OP_RC_CREATE_COLOR_BUFFER;
        let mut call = Encoder::new(opcode);
        call.put_u32(width).put_u32(height).put_u32(internal_format);
        self.calls.call(opcode, call, |r| r.get_u32())
    }

    pub fn open_color_buffer(&mut self, handle: u32) -> GuestResult<()> {
        let mut call = Encoder::new(OP_RC_OPEN_COLOR_BUFFER);
        call.put_u32(handle);
        self.calls.send(call)
    }

    pub fn close_color_buffer(&mut self, handle: u32) -> GuestResult<()> {
        let mut call = Encoder::new(OP_RC_CLOSE_COLOR_BUFFER);
        call.put_u32(handle);
        self.calls.send(call)
    }

    /// Reads a rectangle of the color buffer into `pixels`, which sizes the read.
    pub fn read_color_buffer(
        &mut self,
        handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &mut [u8],
    ) -> GuestResult<()> {
        let opcode = OP_RC_READ_COLOR_BUFFER;
        let mut call = Encoder::new(opcode);
        call.put_u32(handle)
            .put_u32(x)
            .put_u32(y)
            .put_u32(width)
            .put_u32(height)
            .put_u32(pixels.len() as u32);
        let bytes = self.calls.call(opcode, call, |r| r.get_bytes())?;
        if bytes.len() != pixels.len() {
            return Err(GuestError::MalformedReply(opcode));
        }
        pixels.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn update_color_buffer(
        &mut self,
        handle: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GuestResult<i32> {
        let opcode = OP_RC_UPDATE_COLOR_BUFFER;
        let mut call = Encoder::new(opcode);
        call.put_u32(handle)
            .put_u32(x)
            .put_u32(y)
            .put_u32(width)
            .put_u32(height)
            .put_bytes(pixels);
        self.calls.call(opcode, call, |r| r.get_i32())
    }

    /// Asks the host to switch checksum protocol.  The host changes after this packet, so the
    /// caller switches its own calculator only once this returns.
    pub fn select_checksum_helper(&mut self, protocol: u32, reserved: u32) -> GuestResult<()> {
        let mut call = Encoder::new(OP_RC_SELECT_CHECKSUM_HELPER);
        call.put_u32(protocol).put_u32(reserved);
        self.calls.send(call)
    }

    pub fn set_puid(&mut self, puid: u64) -> GuestResult<()> {
        let mut call = Encoder::new(OP_RC_SET_PUID);
        call.put_u64(puid);
        self.calls.send(call)
    }
}
