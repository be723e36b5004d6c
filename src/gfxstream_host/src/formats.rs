// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! formats: virgl format conversions and the linear layout of guest-visible resources.

use crate::gfxstream_utils::*;

pub const DRM_FORMAT_R8: [u8; 4] = [b'R', b'8', b' ', b' '];
pub const DRM_FORMAT_RGB565: [u8; 4] = [b'R', b'G', b'1', b'6'];
pub const DRM_FORMAT_XRGB8888: [u8; 4] = [b'X', b'R', b'2', b'4'];
pub const DRM_FORMAT_XBGR8888: [u8; 4] = [b'X', b'B', b'2', b'4'];
pub const DRM_FORMAT_ARGB8888: [u8; 4] = [b'A', b'R', b'2', b'4'];
pub const DRM_FORMAT_ABGR8888: [u8; 4] = [b'A', b'B', b'2', b'4'];
pub const DRM_FORMAT_NV12: [u8; 4] = [b'N', b'V', b'1', b'2'];
pub const DRM_FORMAT_YVU420: [u8; 4] = [b'Y', b'V', b'1', b'2'];
pub const DRM_FORMAT_P010: [u8; 4] = [b'P', b'0', b'1', b'0'];

pub const GL_RGBA: u32 = 0x1908;
pub const GL_BGRA_EXT: u32 = 0x80e1;
pub const GL_RGB565: u32 = 0x8d62;
pub const GL_R8: u32 = 0x8229;
pub const GL_UNSIGNED_BYTE: u32 = 0x1401;
pub const GL_UNSIGNED_SHORT_5_6_5: u32 = 0x8363;

/// A [fourcc](https://en.wikipedia.org/wiki/FourCC) format identifier.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct DrmFormat(pub u32);

impl DrmFormat {
    pub fn new(a: u8, b: u8, c: u8, d: u8) -> DrmFormat {
        DrmFormat(a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24)
    }

    pub fn from_bytes(bytes: [u8; 4]) -> DrmFormat {
        DrmFormat::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let f = self.0;
        [f as u8, (f >> 8) as u8, (f >> 16) as u8, (f >> 24) as u8]
    }
}

/// How the guest framework interprets a color buffer's bytes.  Anything but `GlCompatible` is
/// converted in software before it reaches GL.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameworkFormat {
    GlCompatible = 0,
    Yv12 = 1,
    Yuv420888 = 2,
    Nv12 = 3,
    P010 = 4,
}

impl FrameworkFormat {
    pub fn from_u32(v: u32) -> GfxstreamResult<FrameworkFormat> {
        match v {
            0 => Ok(FrameworkFormat::GlCompatible),
            1 => Ok(FrameworkFormat::Yv12),
            2 => Ok(FrameworkFormat::Yuv420888),
            3 => Ok(FrameworkFormat::Nv12),
            4 => Ok(FrameworkFormat::P010),
            _ => Err(GfxstreamError::VirtioViolation("unknown framework format")),
        }
    }

    pub fn is_yuv(&self) -> bool {
        *self != FrameworkFormat::GlCompatible
    }
}

pub fn virgl_format_is_yuv(format: u32) -> bool {
    matches!(
        format,
        VIRGL_FORMAT_NV12 | VIRGL_FORMAT_P010 | VIRGL_FORMAT_YV12
    )
}

pub fn virgl_format_to_gl(format: u32) -> u32 {
    match format {
        VIRGL_FORMAT_B8G8R8X8_UNORM | VIRGL_FORMAT_B8G8R8A8_UNORM => GL_BGRA_EXT,
        VIRGL_FORMAT_B5G6R5_UNORM => GL_RGB565,
        VIRGL_FORMAT_R8_UNORM => GL_R8,
        // YUV is emulated as RGBA8888.
        _ => GL_RGBA,
    }
}

pub fn virgl_format_to_fwk_format(format: u32) -> FrameworkFormat {
    match format {
        VIRGL_FORMAT_NV12 => FrameworkFormat::Nv12,
        VIRGL_FORMAT_P010 => FrameworkFormat::P010,
        VIRGL_FORMAT_YV12 => FrameworkFormat::Yv12,
        _ => FrameworkFormat::GlCompatible,
    }
}

pub fn gl_format_to_natural_type(format: u32) -> u32 {
    match format {
        GL_RGB565 => GL_UNSIGNED_SHORT_5_6_5,
        _ => GL_UNSIGNED_BYTE,
    }
}

/// Bytes per pixel of a GL internal format as stored by the back-ends.
pub fn gl_format_bytes_per_pixel(format: u32) -> u32 {
    match format {
        GL_R8 => 1,
        GL_RGB565 => 2,
        _ => 4,
    }
}

/// DRM fourcc and bytes per pixel of the packed formats a 3D resource can report.
pub fn virgl_format_to_drm(format: u32) -> GfxstreamResult<(DrmFormat, u32)> {
    let (fourcc, bpp) = match format {
        VIRGL_FORMAT_B8G8R8A8_UNORM => (DRM_FORMAT_ARGB8888, 4),
        VIRGL_FORMAT_B8G8R8X8_UNORM => (DRM_FORMAT_XRGB8888, 4),
        VIRGL_FORMAT_B5G6R5_UNORM => (DRM_FORMAT_RGB565, 2),
        VIRGL_FORMAT_R8G8B8A8_UNORM => (DRM_FORMAT_ABGR8888, 4),
        VIRGL_FORMAT_R8G8B8X8_UNORM => (DRM_FORMAT_XBGR8888, 4),
        VIRGL_FORMAT_R8_UNORM => (DRM_FORMAT_R8, 1),
        VIRGL_FORMAT_NV12 => (DRM_FORMAT_NV12, 1),
        VIRGL_FORMAT_YV12 => (DRM_FORMAT_YVU420, 1),
        VIRGL_FORMAT_P010 => (DRM_FORMAT_P010, 2),
        _ => return Err(GfxstreamError::VirtioViolation("unsupported virgl format")),
    };
    Ok((DrmFormat::from_bytes(fourcc), bpp))
}

fn packed_bytes_per_pixel(format: u32) -> GfxstreamResult<u32> {
    match format {
        VIRGL_FORMAT_B8G8R8X8_UNORM
        | VIRGL_FORMAT_B8G8R8A8_UNORM
        | VIRGL_FORMAT_R8G8B8X8_UNORM
        | VIRGL_FORMAT_R8G8B8A8_UNORM => Ok(4),
        VIRGL_FORMAT_B5G6R5_UNORM => Ok(2),
        VIRGL_FORMAT_R8_UNORM => Ok(1),
        _ => Err(GfxstreamError::VirtioViolation("unsupported virgl format")),
    }
}

pub fn align_up(n: u32, a: u32) -> u32 {
    ((n + a - 1) / a) * a
}

/// Size of the whole guest-visible image of a `width` x `height` resource.
pub fn virgl_format_total_size(format: u32, width: u32, height: u32) -> GfxstreamResult<usize> {
    if virgl_format_is_yuv(format) {
        return Ok(yuv_total_size(format, width, height));
    }
    let bpp = packed_bytes_per_pixel(format)?;
    Ok(width as usize * height as usize * bpp as usize)
}

fn yuv_total_size(format: u32, width: u32, height: u32) -> usize {
    let bpp = if format == VIRGL_FORMAT_P010 { 2 } else { 1 };
    let y_stride_pixels = if format == VIRGL_FORMAT_YV12 {
        align_up(width, 32)
    } else {
        width
    };
    let y_size = (y_stride_pixels * bpp * height) as usize;

    let (uv_stride_pixels, uv_planes) = if format == VIRGL_FORMAT_YV12 {
        (y_stride_pixels / 2, 2)
    } else {
        (y_stride_pixels, 1)
    };
    let uv_size = (uv_stride_pixels * bpp * (height / 2) * uv_planes) as usize;
    y_size + uv_size
}

/// The `(start, length)` byte range of `transfer` within the linear image of a resource.
/// YUV resources always move the whole image.
pub fn transfer_range(
    format: u32,
    width: u32,
    height: u32,
    transfer: &Transfer3D,
) -> GfxstreamResult<(usize, usize)> {
    if transfer.x > width || transfer.y > height {
        return Err(GfxstreamError::VirtioViolation("box out of range of resource"));
    }
    if transfer.w == 0 || transfer.h == 0 {
        return Err(GfxstreamError::VirtioViolation("empty transfer"));
    }
    if transfer.x as u64 + transfer.w as u64 > width as u64 {
        return Err(GfxstreamError::VirtioViolation("box overflows resource width"));
    }

    if virgl_format_is_yuv(format) {
        return Ok((0, yuv_total_size(format, width, height)));
    }

    let bpp = packed_bytes_per_pixel(format)? as usize;
    let stride = width as usize * bpp;
    let start = transfer.y as usize * stride + transfer.x as usize * bpp;
    // The last row does not occupy the full stride.
    let len = stride * (transfer.h as usize - 1) + transfer.w as usize * bpp;
    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drm_fourcc_values() {
        let (argb, bpp) = virgl_format_to_drm(VIRGL_FORMAT_B8G8R8A8_UNORM).unwrap();
        assert_eq!(argb.0, 0x34325241);
        assert_eq!(bpp, 4);
        assert_eq!(
            virgl_format_to_drm(VIRGL_FORMAT_R8G8B8A8_UNORM).unwrap().0 .0,
            0x34324241
        );
        assert_eq!(virgl_format_to_drm(VIRGL_FORMAT_NV12).unwrap().0 .0, 0x3231564e);
        assert_eq!(virgl_format_to_drm(VIRGL_FORMAT_YV12).unwrap().0 .0, 0x32315659);
        assert_eq!(virgl_format_to_drm(VIRGL_FORMAT_P010).unwrap().0 .0, 0x30313050);
        assert!(virgl_format_to_drm(9999).is_err());
    }

    #[test]
    fn transfer_ranges() {
        let t = Transfer3D::new_2d(1, 1, 2, 2);
        // 4x4 RGBA: start at row 1 col 1, one full stride plus two pixels.
        assert_eq!(
            transfer_range(VIRGL_FORMAT_R8G8B8A8_UNORM, 4, 4, &t).unwrap(),
            (20, 24)
        );
        assert!(transfer_range(VIRGL_FORMAT_R8G8B8A8_UNORM, 2, 2, &t).is_err());
        assert!(transfer_range(
            VIRGL_FORMAT_R8G8B8A8_UNORM,
            4,
            4,
            &Transfer3D::new_2d(0, 0, 0, 1)
        )
        .is_err());
        assert_eq!(
            transfer_range(VIRGL_FORMAT_NV12, 4, 4, &Transfer3D::new_2d(0, 0, 1, 1)).unwrap(),
            (0, 24)
        );
    }

    #[test]
    fn yuv_sizes() {
        // YV12 pads the luma stride to 32 pixels.
        assert_eq!(
            virgl_format_total_size(VIRGL_FORMAT_YV12, 16, 2).unwrap(),
            32 * 2 + 16 * 1 * 2
        );
        assert_eq!(virgl_format_total_size(VIRGL_FORMAT_P010, 2, 2).unwrap(), 8 + 4);
        assert_eq!(
            virgl_format_to_fwk_format(VIRGL_FORMAT_YV12),
            FrameworkFormat::Yv12
        );
        assert_eq!(virgl_format_to_gl(VIRGL_FORMAT_NV12), GL_RGBA);
    }
}
