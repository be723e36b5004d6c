// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Objects registered by a back-end for later pickup by the virtio-gpu frontend, keyed by
//! `(context id, opaque id)`.  Each `add_*` is paired with exactly one `remove_*` by the consumer.

use std::collections::BTreeMap as Map;
use std::sync::Arc;
use std::sync::Mutex;

use log::warn;
use once_cell::sync::OnceCell;

use crate::gfxstream_os::SafeDescriptor;
use crate::gfxstream_utils::VulkanInfo;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostMemInfo {
    pub addr: u64,
    pub caching: u32,
}

#[derive(Debug)]
pub struct BlobDescriptorInfo {
    pub descriptor: SafeDescriptor,
    pub handle_type: u32,
    pub caching: u32,
    pub vulkan_info: Option<VulkanInfo>,
}

#[derive(Debug)]
pub struct SyncDescriptorInfo {
    pub descriptor: SafeDescriptor,
    pub handle_type: u32,
}

type Key = (u32, u64);

#[derive(Default)]
struct Tables {
    mappings: Map<Key, HostMemInfo>,
    blob_descriptors: Map<Key, BlobDescriptorInfo>,
    sync_descriptors: Map<Key, SyncDescriptorInfo>,
}

#[derive(Default)]
pub struct ExternalObjectManager {
    tables: Mutex<Tables>,
}

static GLOBAL: OnceCell<Arc<ExternalObjectManager>> = OnceCell::new();

impl ExternalObjectManager {
    pub fn new() -> Arc<ExternalObjectManager> {
        Default::default()
    }

    /// The process-wide instance.
    pub fn get() -> Arc<ExternalObjectManager> {
        GLOBAL.get_or_init(ExternalObjectManager::new).clone()
    }

    pub fn add_mapping(&self, ctx_id: u32, blob_id: u64, addr: u64, caching: u32) {
        let old = self
            .tables
            .lock()
            .unwrap()
            .mappings
            .insert((ctx_id, blob_id), HostMemInfo { addr, caching });
        if old.is_some() {
            warn!("replacing mapping for ctx {} blob {}", ctx_id, blob_id);
        }
    }

    pub fn remove_mapping(&self, ctx_id: u32, blob_id: u64) -> Option<HostMemInfo> {
        self.tables
            .lock()
            .unwrap()
            .mappings
            .remove(&(ctx_id, blob_id))
    }

    pub fn add_blob_descriptor_info(
        &self,
        ctx_id: u32,
        blob_id: u64,
        descriptor: SafeDescriptor,
        handle_type: u32,
        caching: u32,
        vulkan_info: Option<VulkanInfo>,
    ) {
        let info = BlobDescriptorInfo {
            descriptor,
            handle_type,
            caching,
            vulkan_info,
        };
        if self
            .tables
            .lock()
            .unwrap()
            .blob_descriptors
            .insert((ctx_id, blob_id), info)
            .is_some()
        {
            warn!("replacing blob descriptor for ctx {} blob {}", ctx_id, blob_id);
        }
    }

    pub fn remove_blob_descriptor_info(
        &self,
        ctx_id: u32,
        blob_id: u64,
    ) -> Option<BlobDescriptorInfo> {
        self.tables
            .lock()
            .unwrap()
            .blob_descriptors
            .remove(&(ctx_id, blob_id))
    }

    pub fn add_sync_descriptor_info(
        &self,
        ctx_id: u32,
        sync_id: u64,
        descriptor: SafeDescriptor,
        handle_type: u32,
    ) {
        let info = SyncDescriptorInfo {
            descriptor,
            handle_type,
        };
        self.tables
            .lock()
            .unwrap()
            .sync_descriptors
            .insert((ctx_id, sync_id), info);
    }

    pub fn remove_sync_descriptor_info(
        &self,
        ctx_id: u32,
        sync_id: u64,
    ) -> Option<SyncDescriptorInfo> {
        self.tables
            .lock()
            .unwrap()
            .sync_descriptors
            .remove(&(ctx_id, sync_id))
    }

    /// Number of registrations not yet consumed.
    pub fn outstanding(&self) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.mappings.len() + tables.blob_descriptors.len() + tables.sync_descriptors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfxstream_os::SharedMemory;
    use crate::gfxstream_utils::GFXSTREAM_MEM_HANDLE_TYPE_SHM;

    #[test]
    fn add_and_remove_are_paired() {
        let manager = ExternalObjectManager::new();
        manager.add_mapping(1, 7, 0x1000, 1);
        assert_eq!(manager.remove_mapping(2, 7), None);
        assert_eq!(
            manager.remove_mapping(1, 7),
            Some(HostMemInfo {
                addr: 0x1000,
                caching: 1
            })
        );
        assert_eq!(manager.remove_mapping(1, 7), None);

        let shm = SharedMemory::new("eom-test", 4096).unwrap();
        manager.add_blob_descriptor_info(
            1,
            8,
            shm.into(),
            GFXSTREAM_MEM_HANDLE_TYPE_SHM,
            1,
            Some(VulkanInfo {
                memory_idx: 2,
                device_memory_size: 4096,
                dedicated: false,
            }),
        );
        assert_eq!(manager.outstanding(), 1);
        let info = manager.remove_blob_descriptor_info(1, 8).unwrap();
        assert_eq!(info.vulkan_info.unwrap().memory_idx, 2);
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn sync_descriptors_are_scoped_to_their_context() {
        let manager = ExternalObjectManager::new();
        let shm = SharedMemory::new("eom-sync", 4096).unwrap();
        manager.add_sync_descriptor_info(3, 11, shm.into(), GFXSTREAM_MEM_HANDLE_TYPE_SHM);
        assert_eq!(manager.outstanding(), 1);
        assert!(manager.remove_sync_descriptor_info(4, 11).is_none());

        let info = manager.remove_sync_descriptor_info(3, 11).unwrap();
        assert_eq!(info.handle_type, GFXSTREAM_MEM_HANDLE_TYPE_SHM);
        assert!(manager.remove_sync_descriptor_info(3, 11).is_none());
        assert_eq!(manager.outstanding(), 0);
    }

    #[test]
    fn global_instance_is_shared() {
        assert!(Arc::ptr_eq(
            &ExternalObjectManager::get(),
            &ExternalObjectManager::get()
        ));
    }
}
