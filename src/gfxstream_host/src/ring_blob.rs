// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory regions used as the byte channel of one context.

use std::io::Read;
use std::io::Write;
use std::sync::Mutex;

use log::debug;

use crate::gfxstream_os::page_size;
use crate::gfxstream_os::MappedRegion;
use crate::gfxstream_os::MemoryMapping;
use crate::gfxstream_os::SafeDescriptor;
use crate::gfxstream_os::SharedMemory;
use crate::gfxstream_utils::*;
use crate::snapshot_io;

const RING_BLOB_SHMEM: u32 = 0;
const RING_BLOB_HOST_MEMORY: u32 = 1;

enum Backing {
    /// `None` once the handle has been released to the guest.
    SharedMemory(Mutex<Option<SharedMemory>>),
    HostMemory,
}

/// A ring blob.  Shared-memory blobs may hand their OS handle to the guest once; host-memory
/// blobs are never exportable and are inlined into snapshots.
pub struct RingBlob {
    id: u64,
    alignment: u64,
    backing: Backing,
    mapping: MemoryMapping,
}

impl RingBlob {
    pub fn create_with_shmem(id: u64, size: u64) -> GfxstreamResult<RingBlob> {
        let shm = SharedMemory::new(format!("gfxstream-ringblob-shmem-{}", id), size)?;
        let mapping = MemoryMapping::from_safe_descriptor(
            shm.try_clone_descriptor()?,
            size.try_into()?,
            GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW,
        )?;

        debug!("created shared-memory ring blob {} ({} bytes)", id, size);
        Ok(RingBlob {
            id,
            alignment: 1,
            backing: Backing::SharedMemory(Mutex::new(Some(shm))),
            mapping,
        })
    }

    /// `alignment` must be a power of two no larger than the page size.
    pub fn create_with_host_memory(id: u64, size: u64, alignment: u64) -> GfxstreamResult<RingBlob> {
        if !alignment.is_power_of_two() || alignment > page_size()? {
            return Err(GfxstreamError::ResourceExhaustion(
                "unsupported ring blob alignment",
            ));
        }

        let mapping = MemoryMapping::new_anonymous(size.try_into()?)?;
        debug!("created host-memory ring blob {} ({} bytes)", id, size);
        Ok(RingBlob {
            id,
            alignment,
            backing: Backing::HostMemory,
            mapping,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.mapping.size() as u64
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn map(&self) -> *mut u8 {
        self.mapping.as_ptr()
    }

    pub fn as_gfxstream_mapping(&self) -> GfxstreamMapping {
        self.mapping.as_gfxstream_mapping()
    }

    pub fn is_exportable(&self) -> bool {
        matches!(self.backing, Backing::SharedMemory(_))
    }

    /// Gives up the OS handle.  The mapping held by the host stays valid.
    pub fn release_handle(&self) -> GfxstreamResult<GfxstreamHandle> {
        let shm = match &self.backing {
            Backing::SharedMemory(shm) => shm.lock().unwrap().take(),
            Backing::HostMemory => None,
        };

        let shm = shm.ok_or(GfxstreamError::InvalidGfxstreamHandle)?;
        Ok(GfxstreamHandle {
            os_handle: SafeDescriptor::from(shm),
            handle_type: GFXSTREAM_MEM_HANDLE_TYPE_SHM,
        })
    }

    pub fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        let tag = match self.backing {
            Backing::SharedMemory(_) => RING_BLOB_SHMEM,
            Backing::HostMemory => RING_BLOB_HOST_MEMORY,
        };

        snapshot_io::write(w, self.id)?;
        snapshot_io::write(w, self.size())?;
        snapshot_io::write(w, self.alignment)?;
        snapshot_io::write(w, tag)?;
        // Safe because render threads are paused while a snapshot is taken.
        snapshot_io::write_bytes(w, unsafe { self.mapping.as_slice() })
    }

    pub fn load(r: &mut dyn Read) -> GfxstreamResult<RingBlob> {
        let id: u64 = snapshot_io::read(r)?;
        let size: u64 = snapshot_io::read(r)?;
        let alignment: u64 = snapshot_io::read(r)?;
        let tag: u32 = snapshot_io::read(r)?;
        let bytes = snapshot_io::read_bytes(r)?;

        if bytes.len() as u64 != size {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "ring blob {} holds {} bytes, expected {}",
                id,
                bytes.len(),
                size
            )));
        }

        let blob = match tag {
            RING_BLOB_SHMEM => RingBlob::create_with_shmem(id, size)?,
            RING_BLOB_HOST_MEMORY => RingBlob::create_with_host_memory(id, size, alignment)?,
            _ => {
                return Err(GfxstreamError::SnapshotMismatch(format!(
                    "unknown ring blob variant {}",
                    tag
                )))
            }
        };

        // Safe because the blob was just created and nothing else references it.
        unsafe { blob.mapping.as_mut_slice() }.copy_from_slice(&bytes);
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_handle_is_released_once() {
        let blob = RingBlob::create_with_shmem(3, 4096).unwrap();
        assert!(blob.is_exportable());
        assert_eq!(blob.alignment(), 1);
        assert_eq!(blob.size(), 4096);

        unsafe { *blob.map() = 0x5a };

        let handle = blob.release_handle().unwrap();
        assert_eq!(handle.handle_type, GFXSTREAM_MEM_HANDLE_TYPE_SHM);
        assert!(blob.release_handle().is_err());

        // The exported handle aliases the same pages.
        let other = MemoryMapping::from_safe_descriptor(
            handle.os_handle,
            4096,
            GFXSTREAM_MAP_ACCESS_RW,
        )
        .unwrap();
        assert_eq!(unsafe { other.as_slice() }[0], 0x5a);
    }

    #[test]
    fn host_memory_alignment() {
        let blob = RingBlob::create_with_host_memory(1, 8192, 64).unwrap();
        assert!(!blob.is_exportable());
        assert!(blob.release_handle().is_err());
        assert_eq!(blob.map() as usize % 64, 0);

        let too_big = page_size().unwrap() * 2;
        assert!(RingBlob::create_with_host_memory(2, 4096, too_big).is_err());
        assert!(RingBlob::create_with_host_memory(2, 4096, 3).is_err());
    }

    #[test]
    fn snapshot_preserves_variant_and_contents() {
        let blob = RingBlob::create_with_host_memory(9, 4096, 16).unwrap();
        unsafe { blob.mapping.as_mut_slice()[100..104].copy_from_slice(&[1, 2, 3, 4]) };

        let mut buf = Vec::new();
        blob.save(&mut buf).unwrap();

        let restored = RingBlob::load(&mut &buf[..]).unwrap();
        assert_eq!(restored.id(), 9);
        assert_eq!(restored.alignment(), 16);
        assert!(!restored.is_exportable());
        assert_eq!(unsafe { &restored.mapping.as_slice()[100..104] }, &[1, 2, 3, 4]);
    }
}
