// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest-side view of the resources of an emulated virtio-gpu device.

use std::collections::BTreeMap as Map;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;

use gfxstream_host::sync::SharedFuture;

use crate::error::GuestError;
use crate::error::GuestResult;

/// Guest memory backing a pipe resource.  The host reads and writes it through an iovec, so the
/// allocation never moves and outlives the host resource.
pub struct GuestBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the allocation is owned by this struct and only accessed through raw pointers whose
// ordering is provided by the device task queue.
unsafe impl Send for GuestBytes {}
unsafe impl Sync for GuestBytes {}

impl GuestBytes {
    pub fn new(len: usize) -> GuestBytes {
        let boxed = vec![0u8; len].into_boxed_slice();
        let raw = Box::into_raw(boxed) as *mut u8;
        GuestBytes {
            // Box::into_raw never returns null.
            ptr: NonNull::new(raw).unwrap_or(NonNull::dangling()),
            len,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for GuestBytes {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: `ptr` and `len` came from `Box::into_raw` of a boxed slice of this length.
        unsafe { drop(Box::from_raw(slice)) };
    }
}

/// A guest mapping of a resource.  Valid until the resource is destroyed.
#[derive(Copy, Clone, Debug)]
pub struct GuestMapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapping is plain memory shared with the host; callers order access through the
// device's transfer and wait operations.
unsafe impl Send for GuestMapping {}
unsafe impl Sync for GuestMapping {}

impl GuestMapping {
    /// # Safety
    ///
    /// `ptr` must point to `size` bytes that stay mapped for the lifetime of the mapping.
    pub unsafe fn from_raw(ptr: *mut u8, size: usize) -> GuestMapping {
        GuestMapping { ptr, size }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, offset: usize, len: usize) -> GuestResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GuestError::TransferOutOfBounds {
                offset: offset as u64,
                size: len as u64,
                limit: self.size as u64,
            }),
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> GuestResult<()> {
        self.check(offset, bytes.len())?;
        // SAFETY: bounds checked above; the region is valid per `from_raw`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> GuestResult<()> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked above; the region is valid per `from_raw`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

pub enum EmulatedResourceKind {
    /// Host memory, exposed through a map task when created mappable.
    Blob {
        size: u64,
        mapped: Option<SharedFuture<u64>>,
    },
    /// A 3D resource shadowed by guest memory.
    Pipe {
        width: u32,
        height: u32,
        format: u32,
        bytes: GuestBytes,
    },
}

pub struct EmulatedResource {
    id: u32,
    kind: EmulatedResourceKind,
    /// Completion of every task that must finish before the resource is read.
    pending: Mutex<Vec<SharedFuture<()>>>,
}

impl EmulatedResource {
    pub fn new(id: u32, kind: EmulatedResourceKind) -> EmulatedResource {
        EmulatedResource {
            id,
            kind,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &EmulatedResourceKind {
        &self.kind
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.kind, EmulatedResourceKind::Pipe { .. })
    }

    /// Bytes a transfer may touch.
    pub fn size(&self) -> u64 {
        match &self.kind {
            EmulatedResourceKind::Blob { size, .. } => *size,
            EmulatedResourceKind::Pipe {
                width,
                height,
                format,
                ..
            } => gfxstream_host::formats::virgl_format_total_size(*format, *width, *height)
                .map(|s| s as u64)
                .unwrap_or_default(),
        }
    }

    pub fn add_pending(&self, waitable: SharedFuture<()>) {
        self.pending.lock().unwrap().push(waitable);
    }

    /// Removes and returns the recorded waitables.
    pub fn take_pending(&self) -> Vec<SharedFuture<()>> {
        std::mem::take(&mut *self.pending.lock().unwrap())
    }

    pub fn set_mapped(&mut self, future: SharedFuture<u64>) {
        if let EmulatedResourceKind::Blob { mapped, .. } = &mut self.kind {
            *mapped = Some(future);
        }
    }
}

/// Resources by id.  One lock guards the table; each resource guards its own waitables.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<Map<u32, Arc<EmulatedResource>>>,
}

impl ResourceRegistry {
    pub fn insert(&self, resource: EmulatedResource) -> Arc<EmulatedResource> {
        let resource = Arc::new(resource);
        let previous = self
            .resources
            .lock()
            .unwrap()
            .insert(resource.id(), resource.clone());
        if previous.is_some() {
            log::error!("resource {} created twice", resource.id());
        }
        resource
    }

    pub fn get(&self, resource_id: u32) -> GuestResult<Arc<EmulatedResource>> {
        self.resources
            .lock()
            .unwrap()
            .get(&resource_id)
            .cloned()
            .ok_or(GuestError::InvalidResourceId(resource_id))
    }

    pub fn remove(&self, resource_id: u32) -> Option<Arc<EmulatedResource>> {
        self.resources.lock().unwrap().remove(&resource_id)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.resources.lock().unwrap().keys().copied().collect()
    }

    /// Replaces the map future of every mappable blob.  `remap` returns the new future.
    pub fn remap_blobs(&self, mut remap: impl FnMut(u32) -> SharedFuture<u64>) {
        let mut resources = self.resources.lock().unwrap();
        for (id, resource) in resources.iter_mut() {
            let mappable = matches!(
                resource.kind(),
                EmulatedResourceKind::Blob {
                    mapped: Some(_),
                    ..
                }
            );
            if !mappable {
                continue;
            }
            match Arc::get_mut(resource) {
                Some(r) => r.set_mapped(remap(*id)),
                None => {
                    // Someone holds the old entry; publish a fresh one.
                    let old = resource.clone();
                    let size = old.size();
                    let mut fresh = EmulatedResource::new(
                        *id,
                        EmulatedResourceKind::Blob { size, mapped: None },
                    );
                    fresh.set_mapped(remap(*id));
                    for waitable in old.take_pending() {
                        fresh.add_pending(waitable);
                    }
                    *resource = Arc::new(fresh);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxstream_host::sync::Promise;
    use gfxstream_host::VIRGL_FORMAT_R8_UNORM;

    #[test]
    fn mapping_bounds() {
        let bytes = GuestBytes::new(8);
        // SAFETY: `bytes` outlives the mapping.
        let mapping = unsafe { GuestMapping::from_raw(bytes.as_ptr(), bytes.len()) };
        mapping.write(4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 2];
        mapping.read(5, &mut out).unwrap();
        assert_eq!(out, [2, 3]);
        assert!(matches!(
            mapping.write(6, &[0; 4]),
            Err(GuestError::TransferOutOfBounds { limit: 8, .. })
        ));
        assert!(mapping.read(usize::MAX, &mut out).is_err());
    }

    #[test]
    fn pending_waitables_drain_once() {
        let registry = ResourceRegistry::default();
        let resource = registry.insert(EmulatedResource::new(
            3,
            EmulatedResourceKind::Pipe {
                width: 16,
                height: 2,
                format: VIRGL_FORMAT_R8_UNORM,
                bytes: GuestBytes::new(16),
            },
        ));
        assert_eq!(resource.size(), 32);
        assert!(resource.is_pipe());

        let (promise, future) = Promise::new();
        resource.add_pending(future);
        promise.set_value(());
        assert_eq!(registry.get(3).unwrap().take_pending().len(), 1);
        assert!(resource.take_pending().is_empty());

        assert!(registry.remove(3).is_some());
        assert!(matches!(registry.get(3), Err(GuestError::InvalidResourceId(3))));
    }

    #[test]
    fn remap_replaces_shared_entries() {
        let registry = ResourceRegistry::default();
        let mut blob = EmulatedResource::new(
            1,
            EmulatedResourceKind::Blob {
                size: 4096,
                mapped: None,
            },
        );
        blob.set_mapped(SharedFuture::ready(0x1000));
        let held = registry.insert(blob);

        registry.remap_blobs(|_| SharedFuture::ready(0x2000));
        let fresh = registry.get(1).unwrap();
        match fresh.kind() {
            EmulatedResourceKind::Blob {
                mapped: Some(m), ..
            } => assert_eq!(m.wait().unwrap(), 0x2000),
            _ => panic!("expected a mapped blob"),
        }
        drop(held);
    }
}
