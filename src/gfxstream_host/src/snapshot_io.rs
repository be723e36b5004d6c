// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Primitive helpers for the snapshot format.  The format is an internal detail: host-native
//! endianness and integer sizes, no versioning, no migration across CPU families.

use std::io::Read;
use std::io::Write;

use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;

pub fn write<W: Write + ?Sized>(w: &mut W, v: impl AsBytes) -> GfxstreamResult<()> {
    w.write_all(v.as_bytes())?;
    Ok(())
}

pub fn read<T: AsBytes + FromBytes + Default, R: Read + ?Sized>(
    r: &mut R,
) -> GfxstreamResult<T> {
    let mut v: T = Default::default();
    r.read_exact(v.as_bytes_mut())
        .map_err(|e| GfxstreamError::SnapshotMismatch(format!("truncated snapshot: {}", e)))?;
    Ok(v)
}

/// A `u64` length prefix followed by the raw bytes.
pub fn write_bytes<W: Write + ?Sized>(w: &mut W, bytes: &[u8]) -> GfxstreamResult<()> {
    write(w, bytes.len() as u64)?;
    w.write_all(bytes)?;
    Ok(())
}

pub fn read_bytes<R: Read + ?Sized>(r: &mut R) -> GfxstreamResult<Vec<u8>> {
    let len: u64 = read(r)?;
    let mut bytes = Vec::new();
    let n = (&mut *r).take(len).read_to_end(&mut bytes)?;
    if n as u64 != len {
        return Err(GfxstreamError::SnapshotMismatch(format!(
            "expected {} bytes, found {}",
            len, n
        )));
    }
    Ok(bytes)
}

/// Fails unless `r` is exhausted.
pub fn expect_eof<R: Read + ?Sized>(r: &mut R) -> GfxstreamResult<()> {
    let mut buf = [0u8];
    if r.read(&mut buf)? != 0 {
        return Err(GfxstreamError::SnapshotMismatch(
            "trailing bytes after snapshot".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_and_eof() {
        let mut buf = Vec::new();
        write(&mut buf, 7u32).unwrap();
        write_bytes(&mut buf, b"ring").unwrap();

        let mut r = &buf[..];
        assert_eq!(read::<u32, _>(&mut r).unwrap(), 7);
        assert_eq!(read_bytes(&mut r).unwrap(), b"ring");
        expect_eof(&mut r).unwrap();

        let mut short = &buf[..6];
        assert_eq!(read::<u32, _>(&mut short).unwrap(), 7);
        assert!(matches!(
            read_bytes(&mut short),
            Err(GfxstreamError::SnapshotMismatch(_))
        ));

        buf.push(0);
        let mut r = &buf[..];
        read::<u32, _>(&mut r).unwrap();
        read_bytes(&mut r).unwrap();
        assert!(expect_eof(&mut r).is_err());
    }
}
