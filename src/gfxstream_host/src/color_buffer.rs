// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Color buffers: images shared between the GLES back-end, the Vulkan back-end and the display.
//!
//! When both back-ends hold a copy, `dirty` names the one whose bytes are newer.  `flush_from_*`
//! and `invalidate_for_*` are the only operations that move bytes across; both are no-ops when
//! the two sides share external memory.

use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use log::debug;
use log::warn;

use crate::backend::GlBackend;
use crate::backend::UsedApi;
use crate::backend::VkBackend;
use crate::formats::gl_format_bytes_per_pixel;
use crate::formats::virgl_format_total_size;
use crate::formats::FrameworkFormat;
use crate::formats::GL_RGBA;
use crate::gfxstream_utils::*;
use crate::snapshot_io;

struct GlImage {
    backend: Arc<dyn GlBackend>,
    texture: u32,
}

struct VkImage {
    backend: Arc<dyn VkBackend>,
    image: u64,
}

#[derive(Default)]
struct ColorBufferState {
    dirty: Option<UsedApi>,
    /// Contents loaded from a snapshot, uploaded on first use.
    restore: Option<Vec<u8>>,
    /// Native YUV bytes when there is no Vulkan image to hold them.
    yuv_shadow: Option<Vec<u8>>,
}

pub struct ColorBuffer {
    handle: u32,
    width: u32,
    height: u32,
    format: u32,
    fwk_format: FrameworkFormat,
    gl: Option<GlImage>,
    vk: Option<VkImage>,
    shares_external_memory: bool,
    state: Mutex<ColorBufferState>,
}

/// Size of a color buffer's contents in its framework layout.
pub fn native_size(width: u32, height: u32, format: u32, fwk_format: FrameworkFormat) -> usize {
    let yuv_size = |virgl_format| virgl_format_total_size(virgl_format, width, height).unwrap_or(0);
    match fwk_format {
        FrameworkFormat::GlCompatible => {
            width as usize * height as usize * gl_format_bytes_per_pixel(format) as usize
        }
        FrameworkFormat::Yv12 => yuv_size(VIRGL_FORMAT_YV12),
        FrameworkFormat::Yuv420888 | FrameworkFormat::Nv12 => yuv_size(VIRGL_FORMAT_NV12),
        FrameworkFormat::P010 => yuv_size(VIRGL_FORMAT_P010),
    }
}

impl ColorBuffer {
    /// Allocates the GL texture and the Vulkan image for whichever back-ends are live.  Vulkan
    /// memory is shared with GL when the format allows it and the driver can export it.
    pub fn create(
        handle: u32,
        width: u32,
        height: u32,
        format: u32,
        fwk_format: FrameworkFormat,
        gl_backend: Option<Arc<dyn GlBackend>>,
        vk_backend: Option<Arc<dyn VkBackend>>,
    ) -> GfxstreamResult<ColorBuffer> {
        if gl_backend.is_none() && vk_backend.is_none() {
            return Err(GfxstreamError::InvalidGfxstreamBuild(
                "color buffers need a GLES or Vulkan back-end",
            ));
        }

        // YUV is sampled from GL as converted RGBA.
        let gl_format = if fwk_format.is_yuv() { GL_RGBA } else { format };

        let gl = match gl_backend {
            Some(backend) => {
                let texture = backend.create_texture(width, height, gl_format)?;
                Some(GlImage { backend, texture })
            }
            None => None,
        };

        let vk = match vk_backend {
            Some(backend) => {
                let size = native_size(width, height, format, fwk_format);
                let image = backend.create_image(width, height, size)?;
                Some(VkImage { backend, image })
            }
            None => None,
        };

        let mut shares_external_memory = false;
        if let (Some(gl), Some(vk)) = (&gl, &vk) {
            if fwk_format == FrameworkFormat::GlCompatible {
                if let Some(export) = vk.backend.export_image_memory(vk.image) {
                    gl.backend.import_memory(gl.texture, &export)?;
                    shares_external_memory = true;
                }
            }
        }

        debug!(
            "color buffer {}: {}x{} format {:#x} fwk {:?} gl {} vk {} shared {}",
            handle,
            width,
            height,
            format,
            fwk_format,
            gl.is_some(),
            vk.is_some(),
            shares_external_memory
        );

        Ok(ColorBuffer {
            handle,
            width,
            height,
            format: gl_format,
            fwk_format,
            gl,
            vk,
            shares_external_memory,
            state: Mutex::new(Default::default()),
        })
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn fwk_format(&self) -> FrameworkFormat {
        self.fwk_format
    }

    pub fn shares_external_memory(&self) -> bool {
        self.shares_external_memory
    }

    pub fn gl_texture(&self) -> Option<u32> {
        self.gl.as_ref().map(|gl| gl.texture)
    }

    pub fn vk_image(&self) -> Option<u64> {
        self.vk.as_ref().map(|vk| vk.image)
    }

    /// The back-end holding bytes the other one has not seen yet.
    pub fn dirty(&self) -> Option<UsedApi> {
        self.state.lock().unwrap().dirty
    }

    fn bpp(&self) -> usize {
        gl_format_bytes_per_pixel(self.format) as usize
    }

    fn native_size(&self) -> usize {
        native_size(self.width, self.height, self.format, self.fwk_format)
    }

    fn has_both(&self) -> bool {
        self.gl.is_some() && self.vk.is_some()
    }

    fn check_rect(&self, x: u32, y: u32, w: u32, h: u32, len: usize) -> GfxstreamResult<usize> {
        let (width, height) = (self.width, self.height);
        checked_range!(checked_arithmetic!(x + w)?; <= width)?;
        checked_range!(checked_arithmetic!(y + h)?; <= height)?;
        let needed = w as usize * h as usize * self.bpp();
        checked_range!(needed; <= len)?;
        Ok(needed)
    }

    fn lock(&self) -> GfxstreamResult<MutexGuard<'_, ColorBufferState>> {
        let mut state = self.state.lock().unwrap();
        if let Some(bytes) = state.restore.take() {
            debug!("color buffer {}: restoring contents", self.handle);
            self.update_locked(&mut state, 0, 0, self.width, self.height, &bytes)?;
        }
        Ok(state)
    }

    /// Uploads contents loaded from a snapshot, if any are still pending.
    pub fn touch(&self) -> GfxstreamResult<()> {
        self.lock().map(|_| ())
    }

    fn read_native_locked(&self, state: &ColorBufferState) -> GfxstreamResult<Vec<u8>> {
        if let Some(vk) = &self.vk {
            let mut bytes = vec![0; self.native_size()];
            vk.backend.read_image(vk.image, &mut bytes)?;
            return Ok(bytes);
        }
        if let Some(shadow) = &state.yuv_shadow {
            return Ok(shadow.clone());
        }
        Ok(vec![0; self.native_size()])
    }

    fn read_gl_whole(&self, gl: &GlImage) -> GfxstreamResult<Vec<u8>> {
        let mut bytes = vec![0; self.width as usize * self.height as usize * self.bpp()];
        gl.backend
            .read_texture(gl.texture, 0, 0, self.width, self.height, &mut bytes)?;
        Ok(bytes)
    }

    /// Reads `(x, y, w, h)` in the color buffer's format.  YUV buffers always return the whole
    /// image in its framework layout.
    pub fn read_to_bytes(
        &self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        out: &mut [u8],
    ) -> GfxstreamResult<()> {
        let state = self.lock()?;

        if self.fwk_format.is_yuv() {
            let native = self.read_native_locked(&state)?;
            let dst = out
                .get_mut(..native.len())
                .ok_or(GfxstreamError::InvalidIovec)?;
            dst.copy_from_slice(&native);
            return Ok(());
        }

        let needed = self.check_rect(x, y, w, h, out.len())?;
        match (&self.vk, &self.gl) {
            (Some(vk), _) if state.dirty != Some(UsedApi::Gl) => {
                let mut whole = vec![0; self.native_size()];
                vk.backend.read_image(vk.image, &mut whole)?;
                copy_rect_out(&whole, self.width, self.bpp(), x, y, w, h, &mut out[..needed]);
                Ok(())
            }
            (_, Some(gl)) => gl
                .backend
                .read_texture(gl.texture, x, y, w, h, &mut out[..needed]),
            // `create` refuses buffers without any back-end.
            (None, None) => Err(GfxstreamError::Unsupported),
            (Some(_), None) => Err(GfxstreamError::Unsupported),
        }
    }

    /// Writes `(x, y, w, h)` from `bytes` in the color buffer's format.
    pub fn update_from_bytes(
        &self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        bytes: &[u8],
    ) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        self.update_locked(&mut state, x, y, w, h, bytes)
    }

    fn update_locked(
        &self,
        state: &mut ColorBufferState,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        bytes: &[u8],
    ) -> GfxstreamResult<()> {
        if self.fwk_format.is_yuv() {
            let native = bytes
                .get(..self.native_size())
                .ok_or(GfxstreamError::InvalidIovec)?;
            match &self.vk {
                Some(vk) => vk.backend.write_image(vk.image, native)?,
                None => state.yuv_shadow = Some(native.to_vec()),
            }
            if let Some(gl) = &self.gl {
                let rgba = yuv_to_rgba(self.fwk_format, self.width, self.height, native);
                gl.backend
                    .update_texture(gl.texture, 0, 0, self.width, self.height, &rgba)?;
            }
            state.dirty = None;
            return Ok(());
        }

        let needed = self.check_rect(x, y, w, h, bytes.len())?;
        let bytes = &bytes[..needed];
        match &self.vk {
            Some(vk) => {
                // The rest of the image must be current before writing part of it.
                self.pull_into_vk(state)?;
                let mut whole = vec![0; self.native_size()];
                vk.backend.read_image(vk.image, &mut whole)?;
                copy_rect_in(&mut whole, self.width, self.bpp(), x, y, w, h, bytes);
                vk.backend.write_image(vk.image, &whole)?;
                if self.gl.is_some() && !self.shares_external_memory {
                    state.dirty = Some(UsedApi::Vk);
                }
                Ok(())
            }
            None => match &self.gl {
                Some(gl) => gl.backend.update_texture(gl.texture, x, y, w, h, bytes),
                None => Err(GfxstreamError::Unsupported),
            },
        }
    }

    /// A write made through the GL texture, e.g. glTexSubImage2D on a texture bound to this
    /// color buffer.
    pub fn gl_sub_update(
        &self,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        pixels: &[u8],
    ) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        let gl = self.gl.as_ref().ok_or(GfxstreamError::Unsupported)?;
        let needed = self.check_rect(x, y, w, h, pixels.len())?;
        self.pull_into_gl(&mut state)?;
        gl.backend
            .update_texture(gl.texture, x, y, w, h, &pixels[..needed])?;
        if self.vk.is_some() && !self.shares_external_memory {
            state.dirty = Some(UsedApi::Gl);
        }
        Ok(())
    }

    fn pull_into_vk(&self, state: &mut ColorBufferState) -> GfxstreamResult<()> {
        if !self.has_both() || self.shares_external_memory || state.dirty != Some(UsedApi::Gl) {
            return Ok(());
        }
        if let (Some(gl), Some(vk)) = (&self.gl, &self.vk) {
            if self.fwk_format.is_yuv() {
                warn!(
                    "color buffer {}: GL contents of a YUV buffer are not copied to Vulkan",
                    self.handle
                );
            } else {
                let bytes = self.read_gl_whole(gl)?;
                vk.backend.write_image(vk.image, &bytes)?;
            }
        }
        state.dirty = None;
        Ok(())
    }

    fn pull_into_gl(&self, state: &mut ColorBufferState) -> GfxstreamResult<()> {
        if !self.has_both() || self.shares_external_memory || state.dirty != Some(UsedApi::Vk) {
            return Ok(());
        }
        if let (Some(gl), Some(vk)) = (&self.gl, &self.vk) {
            let mut native = vec![0; self.native_size()];
            vk.backend.read_image(vk.image, &mut native)?;
            let bytes = if self.fwk_format.is_yuv() {
                yuv_to_rgba(self.fwk_format, self.width, self.height, &native)
            } else {
                native
            };
            gl.backend
                .update_texture(gl.texture, 0, 0, self.width, self.height, &bytes)?;
        }
        state.dirty = None;
        Ok(())
    }

    /// Publishes bytes written through GL to the Vulkan image.
    pub fn flush_from_gl(&self) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        self.pull_into_vk(&mut state)
    }

    /// Publishes bytes written through Vulkan to the GL texture.
    pub fn flush_from_vk(&self) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        self.pull_into_gl(&mut state)
    }

    /// Makes the GL texture current before GL reads it.
    pub fn invalidate_for_gl(&self) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        self.pull_into_gl(&mut state)
    }

    /// Makes the Vulkan image current before Vulkan reads it.
    pub fn invalidate_for_vk(&self) -> GfxstreamResult<()> {
        let mut state = self.lock()?;
        self.pull_into_vk(&mut state)
    }

    fn borrow(
        self: &Arc<Self>,
        api: UsedApi,
        is_target: bool,
    ) -> GfxstreamResult<BorrowedImage> {
        let object = match api {
            UsedApi::Gl => self.gl_texture().map(u64::from),
            UsedApi::Vk => self.vk_image(),
        }
        .ok_or(GfxstreamError::Unsupported)?;

        match api {
            UsedApi::Gl => self.invalidate_for_gl()?,
            UsedApi::Vk => self.invalidate_for_vk()?,
        }

        Ok(BorrowedImage {
            color_buffer: self.clone(),
            api,
            object,
            is_target,
        })
    }

    /// Hands the compositor the texture or image to sample from, or to render into when
    /// `is_target`.
    pub fn borrow_for_composition(
        self: &Arc<Self>,
        api: UsedApi,
        is_target: bool,
    ) -> GfxstreamResult<BorrowedImage> {
        self.borrow(api, is_target)
    }

    pub fn borrow_for_display(self: &Arc<Self>, api: UsedApi) -> GfxstreamResult<BorrowedImage> {
        self.borrow(api, false)
    }

    /// `{handle, width, height, format, fwk format, contents}`.
    pub fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        let state = self.lock()?;
        let contents = if self.fwk_format.is_yuv() {
            self.read_native_locked(&state)?
        } else {
            drop(state);
            let mut bytes = vec![0; self.width as usize * self.height as usize * self.bpp()];
            self.read_to_bytes(0, 0, self.width, self.height, &mut bytes)?;
            bytes
        };

        snapshot_io::write(w, self.handle)?;
        snapshot_io::write(w, self.width)?;
        snapshot_io::write(w, self.height)?;
        snapshot_io::write(w, self.format)?;
        snapshot_io::write(w, self.fwk_format as u32)?;
        snapshot_io::write_bytes(w, &contents)
    }

    /// Recreates a saved color buffer.  Its contents are uploaded on first use.
    pub fn load(
        r: &mut dyn Read,
        gl_backend: Option<Arc<dyn GlBackend>>,
        vk_backend: Option<Arc<dyn VkBackend>>,
    ) -> GfxstreamResult<ColorBuffer> {
        let handle: u32 = snapshot_io::read(r)?;
        let width: u32 = snapshot_io::read(r)?;
        let height: u32 = snapshot_io::read(r)?;
        let format: u32 = snapshot_io::read(r)?;
        let fwk_format = FrameworkFormat::from_u32(snapshot_io::read(r)?)
            .map_err(|e| GfxstreamError::SnapshotMismatch(e.to_string()))?;
        let contents = snapshot_io::read_bytes(r)?;

        let cb = ColorBuffer::create(
            handle, width, height, format, fwk_format, gl_backend, vk_backend,
        )?;
        if contents.len() != cb.native_size() {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "color buffer {} holds {} bytes, expected {}",
                handle,
                contents.len(),
                cb.native_size()
            )));
        }
        cb.state.lock().unwrap().restore = Some(contents);
        Ok(cb)
    }
}

impl Drop for ColorBuffer {
    fn drop(&mut self) {
        if let Some(gl) = &self.gl {
            gl.backend.destroy_texture(gl.texture);
        }
        if let Some(vk) = &self.vk {
            vk.backend.destroy_image(vk.image);
        }
    }
}

/// A texture or image lent to the compositor or the display.  Keeps the color buffer alive;
/// dropping a render target marks the borrowing back-end as holding the newest bytes.
pub struct BorrowedImage {
    color_buffer: Arc<ColorBuffer>,
    api: UsedApi,
    object: u64,
    is_target: bool,
}

impl BorrowedImage {
    pub fn api(&self) -> UsedApi {
        self.api
    }

    /// The GL texture name or the Vulkan image.
    pub fn object(&self) -> u64 {
        self.object
    }

    pub fn color_buffer(&self) -> &Arc<ColorBuffer> {
        &self.color_buffer
    }
}

impl Drop for BorrowedImage {
    fn drop(&mut self) {
        let cb = &self.color_buffer;
        if self.is_target && cb.has_both() && !cb.shares_external_memory {
            cb.state.lock().unwrap().dirty = Some(self.api);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_rect_out(src: &[u8], width: u32, bpp: usize, x: u32, y: u32, w: u32, h: u32, out: &mut [u8]) {
    let stride = width as usize * bpp;
    let row = w as usize * bpp;
    for r in 0..h as usize {
        let start = (y as usize + r) * stride + x as usize * bpp;
        out[r * row..(r + 1) * row].copy_from_slice(&src[start..start + row]);
    }
}

#[allow(clippy::too_many_arguments)]
fn copy_rect_in(dst: &mut [u8], width: u32, bpp: usize, x: u32, y: u32, w: u32, h: u32, src: &[u8]) {
    let stride = width as usize * bpp;
    let row = w as usize * bpp;
    for r in 0..h as usize {
        let start = (y as usize + r) * stride + x as usize * bpp;
        dst[start..start + row].copy_from_slice(&src[r * row..(r + 1) * row]);
    }
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited range.
fn yuv_pixel_to_rgba(y: u8, u: u8, v: u8) -> [u8; 4] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
        0xff,
    ]
}

/// Software conversion of a framework YUV layout into packed RGBA8888.
pub fn yuv_to_rgba(fwk_format: FrameworkFormat, width: u32, height: u32, src: &[u8]) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; w * h * 4];
    let sample = |offset: usize| -> u8 { src.get(offset).copied().unwrap_or(0) };
    // P010 keeps 10 significant bits at the top of each little-endian u16.
    let sample16 = |offset: usize| -> u8 { sample(offset * 2 + 1) };

    for row in 0..h {
        for col in 0..w {
            let (y, u, v) = match fwk_format {
                FrameworkFormat::Yv12 => {
                    let y_stride = (w + 31) / 32 * 32;
                    let c_stride = y_stride / 2;
                    let v_base = y_stride * h;
                    let u_base = v_base + c_stride * (h / 2);
                    let c = (row / 2) * c_stride + col / 2;
                    (sample(row * y_stride + col), sample(u_base + c), sample(v_base + c))
                }
                FrameworkFormat::Yuv420888 => {
                    let c_stride = w / 2;
                    let u_base = w * h;
                    let v_base = u_base + c_stride * (h / 2);
                    let c = (row / 2) * c_stride + col / 2;
                    (sample(row * w + col), sample(u_base + c), sample(v_base + c))
                }
                FrameworkFormat::Nv12 => {
                    let c = w * h + (row / 2) * w + (col / 2) * 2;
                    (sample(row * w + col), sample(c), sample(c + 1))
                }
                FrameworkFormat::P010 => {
                    let c = w * h + (row / 2) * w + (col / 2) * 2;
                    (sample16(row * w + col), sample16(c), sample16(c + 1))
                }
                FrameworkFormat::GlCompatible => (0, 128, 128),
            };
            let px = yuv_pixel_to_rgba(y, u, v);
            out[(row * w + col) * 4..(row * w + col + 1) * 4].copy_from_slice(&px);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubGlBackend;
    use crate::backend::StubVkBackend;

    const RED: [u8; 4] = [0xff, 0, 0, 0xff];
    const GREEN: [u8; 4] = [0, 0xff, 0, 0xff];
    const BLUE: [u8; 4] = [0, 0, 0xff, 0xff];
    const BLACK: [u8; 4] = [0, 0, 0, 0xff];

    fn pixels() -> Vec<u8> {
        [RED, GREEN, BLUE, BLACK].concat()
    }

    #[test]
    fn gl_writes_reach_vk_only_after_invalidate() {
        let gl = Arc::new(StubGlBackend::new());
        let vk = Arc::new(StubVkBackend::new());
        let cb = ColorBuffer::create(
            1,
            2,
            2,
            GL_RGBA,
            FrameworkFormat::GlCompatible,
            Some(gl),
            Some(vk.clone()),
        )
        .unwrap();
        assert!(!cb.shares_external_memory());

        cb.gl_sub_update(0, 0, 2, 2, &pixels()).unwrap();
        assert_eq!(cb.dirty(), Some(UsedApi::Gl));

        // Vulkan holds nothing newer, so there is nothing to publish.
        cb.flush_from_vk().unwrap();
        let mut raw = [0u8; 16];
        vk.read_image(cb.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(raw, [0u8; 16]);

        cb.invalidate_for_vk().unwrap();
        assert_eq!(cb.dirty(), None);
        let mut out = [0u8; 16];
        cb.read_to_bytes(0, 0, 2, 2, &mut out).unwrap();
        assert_eq!(out.to_vec(), pixels());
        vk.read_image(cb.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(raw.to_vec(), pixels());

        cb.gl_sub_update(0, 0, 1, 1, &BLUE).unwrap();
        cb.flush_from_gl().unwrap();
        assert_eq!(cb.dirty(), None);
        vk.read_image(cb.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(&raw[..4], &BLUE);
    }

    #[test]
    fn shared_memory_makes_sync_a_no_op() {
        let gl = Arc::new(StubGlBackend::new());
        let vk = Arc::new(StubVkBackend::new().with_external_memory(true));
        let cb = ColorBuffer::create(
            2,
            2,
            2,
            GL_RGBA,
            FrameworkFormat::GlCompatible,
            Some(gl),
            Some(vk.clone()),
        )
        .unwrap();
        assert!(cb.shares_external_memory());

        cb.gl_sub_update(1, 1, 1, 1, &BLUE).unwrap();
        assert_eq!(cb.dirty(), None);
        let mut raw = [0u8; 16];
        vk.read_image(cb.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(&raw[12..], &BLUE);
    }

    #[test]
    fn sub_rect_update_and_read() {
        let vk = Arc::new(StubVkBackend::new());
        let cb = ColorBuffer::create(
            3,
            2,
            2,
            GL_RGBA,
            FrameworkFormat::GlCompatible,
            None,
            Some(vk),
        )
        .unwrap();
        cb.update_from_bytes(1, 0, 1, 2, &[GREEN, BLUE].concat()).unwrap();
        let mut out = [0u8; 8];
        cb.read_to_bytes(1, 0, 1, 2, &mut out).unwrap();
        assert_eq!(out.to_vec(), [GREEN, BLUE].concat());
        assert!(cb.update_from_bytes(2, 0, 1, 1, &RED).is_err());
    }

    #[test]
    fn target_borrow_marks_dirty() {
        let gl = Arc::new(StubGlBackend::new());
        let vk = Arc::new(StubVkBackend::new());
        let cb = Arc::new(
            ColorBuffer::create(
                4,
                1,
                1,
                GL_RGBA,
                FrameworkFormat::GlCompatible,
                Some(gl),
                Some(vk),
            )
            .unwrap(),
        );
        {
            let borrowed = cb.borrow_for_composition(UsedApi::Vk, true).unwrap();
            assert_eq!(borrowed.api(), UsedApi::Vk);
            assert_eq!(borrowed.object(), cb.vk_image().unwrap());
        }
        assert_eq!(cb.dirty(), Some(UsedApi::Vk));
        let display = cb.borrow_for_display(UsedApi::Gl).unwrap();
        assert_eq!(cb.dirty(), None);
        drop(display);
        assert_eq!(cb.dirty(), None);
    }

    #[test]
    fn yuv_goes_through_software_conversion() {
        let gl = Arc::new(StubGlBackend::new());
        let vk = Arc::new(StubVkBackend::new());
        let cb = ColorBuffer::create(
            5,
            2,
            2,
            GL_RGBA,
            FrameworkFormat::Nv12,
            Some(gl.clone()),
            Some(vk),
        )
        .unwrap();

        // Mid-grey: Y=126 with neutral chroma.
        let nv12 = [126u8, 126, 126, 126, 128, 128];
        cb.update_from_bytes(0, 0, 2, 2, &nv12).unwrap();

        let mut native = [0u8; 6];
        cb.read_to_bytes(0, 0, 2, 2, &mut native).unwrap();
        assert_eq!(native, nv12);

        let mut rgba = [0u8; 16];
        gl.read_texture(cb.gl_texture().unwrap(), 0, 0, 2, 2, &mut rgba)
            .unwrap();
        assert_eq!(&rgba[..4], &[128, 128, 128, 0xff]);
    }

    #[test]
    fn save_and_lazy_restore() {
        let vk: Arc<StubVkBackend> = Arc::new(StubVkBackend::new());
        let cb = ColorBuffer::create(
            6,
            2,
            2,
            GL_RGBA,
            FrameworkFormat::GlCompatible,
            None,
            Some(vk.clone()),
        )
        .unwrap();
        cb.update_from_bytes(0, 0, 2, 2, &pixels()).unwrap();

        let mut saved = Vec::new();
        cb.save(&mut saved).unwrap();
        drop(cb);

        let restored = ColorBuffer::load(&mut saved.as_slice(), None, Some(vk.clone())).unwrap();
        assert_eq!(restored.handle(), 6);
        let mut raw = [0u8; 16];
        vk.read_image(restored.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(raw, [0u8; 16]);

        restored.touch().unwrap();
        vk.read_image(restored.vk_image().unwrap(), &mut raw).unwrap();
        assert_eq!(raw.to_vec(), pixels());
    }
}
