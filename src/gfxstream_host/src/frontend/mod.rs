// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host side of the virtio-gpu device: contexts, resources, context commands and fences,
//! on top of a `Renderer`.

mod context;
pub mod protocol;
mod resource;

use std::collections::BTreeMap as Map;
use std::io::Read;
use std::io::Write;
use std::mem::size_of;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

pub use context::VirtioGpuContext;
pub use resource::resource_type_for;
pub use resource::ResourceType;
pub use resource::VirtioGpuResource;

use crate::backend::GlBackend;
use crate::backend::MagmaBackend;
use crate::backend::VkBackend;
use crate::external_object_manager::ExternalObjectManager;
use crate::external_object_manager::SyncDescriptorInfo;
use crate::features::Feature;
use crate::features::FeatureSet;
use crate::formats::virgl_format_to_drm;
use crate::gfxstream_os::page_size;
use crate::gfxstream_utils::*;
use crate::render_thread::RenderThreadState;
use crate::renderer::Renderer;
use crate::renderer::RendererConfig;
use crate::snapshot_io;
use crate::timelines::VirtioGpuRing;
use crate::timelines::VirtioGpuTimelines;
use protocol::*;

const SNAPSHOT_MAGIC: u32 = 0x4753_4e50;

/// Formats a Vulkan context may ask a color buffer for.
const CAPSET_FORMATS: &[u32] = &[
    VIRGL_FORMAT_B5G6R5_UNORM,
    VIRGL_FORMAT_B8G8R8A8_UNORM,
    VIRGL_FORMAT_B8G8R8X8_UNORM,
    VIRGL_FORMAT_NV12,
    VIRGL_FORMAT_P010,
    VIRGL_FORMAT_R8_UNORM,
    VIRGL_FORMAT_R8G8B8A8_UNORM,
    VIRGL_FORMAT_R8G8B8X8_UNORM,
    VIRGL_FORMAT_YV12,
];

fn read_command<T: FromBytes>(commands: &[u8]) -> GfxstreamResult<T> {
    T::read_from_prefix(commands).ok_or(GfxstreamError::InvalidCommandSize(commands.len()))
}

/// The host virtio-gpu device.
pub struct VirtioGpuFrontend {
    resources: Map<u32, VirtioGpuResource>,
    contexts: Map<u32, VirtioGpuContext>,
    /// Sync objects handed out with `export_fence`, keyed by fence id.
    sync_map: Map<u64, SyncDescriptorInfo>,
    capsets: Vec<u32>,
    page_size: u64,
    fence_handler: GfxstreamFenceHandler,
    timelines: Arc<VirtioGpuTimelines>,
    // Declared last so contexts and their render threads go first.
    renderer: Arc<Renderer>,
}

impl VirtioGpuFrontend {
    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn features(&self) -> &FeatureSet {
        self.renderer.features()
    }

    /// Gets the `(capset_id, version, size)` for the capability set at `index`.
    pub fn get_capset_info(&self, index: u32) -> GfxstreamResult<(u32, u32, u32)> {
        let capset_id = *self
            .capsets
            .get(index as usize)
            .ok_or(GfxstreamError::InvalidCapset)?;
        let size = match capset_id {
            GFXSTREAM_CAPSET_VULKAN => size_of::<VulkanCapset>(),
            _ => size_of::<GfxstreamCapset>(),
        };
        Ok((capset_id, GFXSTREAM_PROTOCOL_VERSION, size as u32))
    }

    pub fn get_num_capsets(&self) -> u32 {
        self.capsets.len() as u32
    }

    /// Gets the capability set for `capset_id`.
    pub fn get_capset(&self, capset_id: u32, _version: u32) -> GfxstreamResult<Vec<u8>> {
        if !self.capsets.contains(&capset_id) {
            return Err(GfxstreamError::InvalidCapset);
        }

        if capset_id != GFXSTREAM_CAPSET_VULKAN {
            let capset = GfxstreamCapset {
                protocol_version: GFXSTREAM_PROTOCOL_VERSION,
                ring_size: GFXSTREAM_RING_SIZE,
                buffer_size: GFXSTREAM_BUFFER_SIZE,
                blob_alignment: self.page_size as u32,
            };
            return Ok(capset.as_bytes().to_vec());
        }

        let mut capset = VulkanCapset {
            protocol_version: GFXSTREAM_PROTOCOL_VERSION,
            ring_size: GFXSTREAM_RING_SIZE,
            buffer_size: GFXSTREAM_BUFFER_SIZE,
            no_render_control_enc: 1,
            blob_alignment: self.page_size as u32,
            ..Default::default()
        };
        if let Some(props) = self.renderer.memory_properties() {
            capset.color_buffer_memory_index = props.guest_color_buffer_memory_type_index();
            capset.deferred_mapping = 1;
        }
        if self
            .features()
            .is_enabled(Feature::VulkanBatchedDescriptorSetUpdate)
        {
            capset.vulkan_batched_descriptor_set_update = 1;
        }
        for format in CAPSET_FORMATS {
            let supported = virgl_format_to_drm(*format).is_ok();
            capset.set_format_supported(*format, supported);
        }
        Ok(capset.as_bytes().to_vec())
    }

    /// Creates a context of the capset encoded in `context_init`.
    pub fn create_context(
        &mut self,
        ctx_id: u32,
        context_init: u32,
        context_name: Option<&str>,
    ) -> GfxstreamResult<()> {
        if self.contexts.contains_key(&ctx_id) {
            return Err(GfxstreamError::InvalidContextId);
        }

        let capset_id = context_init & GFXSTREAM_CONTEXT_INIT_CAPSET_ID_MASK;
        if !self.capsets.contains(&capset_id) {
            return Err(GfxstreamError::InvalidCapset);
        }

        let name = context_name.unwrap_or("").to_string();
        info!("ctx {}: created for capset {} ({})", ctx_id, capset_id, name);
        self.contexts.insert(
            ctx_id,
            VirtioGpuContext::new(self.renderer.clone(), ctx_id, capset_id, name),
        );
        Ok(())
    }

    /// Destroys the context given by `ctx_id`, stopping its render threads.
    pub fn destroy_context(&mut self, ctx_id: u32) -> GfxstreamResult<()> {
        let ctx = self
            .contexts
            .remove(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;
        for resource_id in ctx.attached() {
            if let Some(resource) = self.resources.get_mut(resource_id) {
                resource.detach_from_context(ctx_id);
            }
        }
        Ok(())
    }

    pub fn context_attach_resource(&mut self, ctx_id: u32, resource_id: u32) -> GfxstreamResult<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;

        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        ctx.attach(resource_id);
        resource.attach_to_context(ctx_id);
        Ok(())
    }

    pub fn context_detach_resource(&mut self, ctx_id: u32, resource_id: u32) -> GfxstreamResult<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;

        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        ctx.detach(resource_id);
        resource.detach_from_context(ctx_id);
        Ok(())
    }

    /// Creates a 3D resource with the given `resource_id`.
    pub fn resource_create_3d(
        &mut self,
        resource_id: u32,
        resource_create_3d: ResourceCreate3D,
    ) -> GfxstreamResult<()> {
        if self.resources.contains_key(&resource_id) {
            return Err(GfxstreamError::InvalidResourceId);
        }

        let resource =
            VirtioGpuResource::create_3d(&self.renderer, resource_id, resource_create_3d)?;
        self.resources.insert(resource_id, resource);
        Ok(())
    }

    /// Attaches guest memory `vecs` to the resource given by `resource_id`.
    pub fn attach_backing(
        &mut self,
        resource_id: u32,
        vecs: Vec<GfxstreamIovec>,
    ) -> GfxstreamResult<()> {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.attach_iovecs(vecs);
        Ok(())
    }

    /// Detaches any previously attached iovecs from the resource given by `resource_id`.
    pub fn detach_backing(&mut self, resource_id: u32) -> GfxstreamResult<()> {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.detach_iovecs();
        Ok(())
    }

    /// Releases the resource given by `resource_id` and its host objects.
    pub fn unref_resource(&mut self, resource_id: u32) -> GfxstreamResult<()> {
        let resource = self
            .resources
            .remove(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        for ctx_id in resource.attached_contexts() {
            if let Some(ctx) = self.contexts.get_mut(ctx_id) {
                ctx.detach(resource_id);
            }
        }
        resource.destroy(&self.renderer);
        Ok(())
    }

    /// For HOST3D_GUEST resources, copies from the attached iovecs to the host.
    pub fn transfer_write(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        transfer: Transfer3D,
    ) -> GfxstreamResult<()> {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        let pipe_ctx = resource.pipe_context().unwrap_or(ctx_id);
        let pipe = self.contexts.get_mut(&pipe_ctx).map(|c| c.pipe_mut());
        resource.transfer_write(&self.renderer, pipe, &transfer, None)
    }

    /// For HOST3D_GUEST resources, copies from the host to the attached iovecs.
    pub fn transfer_read(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        transfer: Transfer3D,
    ) -> GfxstreamResult<()> {
        let resource = self
            .resources
            .get_mut(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        let pipe_ctx = resource.pipe_context().unwrap_or(ctx_id);
        let pipe = self.contexts.get_mut(&pipe_ctx).map(|c| c.pipe_mut());
        resource.transfer_read(&self.renderer, pipe, &transfer, None)
    }

    /// Creates a blob resource.  A blob id announced with `RESOURCE_CREATE_3D` on `ctx_id` makes
    /// the blob export the memory of a new 3D resource.
    pub fn resource_create_blob(
        &mut self,
        ctx_id: u32,
        resource_id: u32,
        resource_create_blob: ResourceCreateBlob,
        iovec_opt: Option<Vec<GfxstreamIovec>>,
    ) -> GfxstreamResult<()> {
        if self.resources.contains_key(&resource_id) {
            return Err(GfxstreamError::InvalidResourceId);
        }

        let create_3d = match self.contexts.get_mut(&ctx_id) {
            Some(ctx) if resource_create_blob.blob_id != 0 => {
                ctx.take_pending_blob(resource_create_blob.blob_id)
            }
            _ => None,
        };

        let mut resource = VirtioGpuResource::create_blob(
            &self.renderer,
            self.renderer.features(),
            self.page_size,
            ctx_id,
            resource_id,
            create_3d,
            resource_create_blob,
        )?;
        if let Some(iovecs) = iovec_opt {
            resource.attach_iovecs(iovecs);
        }
        self.resources.insert(resource_id, resource);
        Ok(())
    }

    /// Returns the host mapping of a mappable blob.
    pub fn map(&self, resource_id: u32) -> GfxstreamResult<GfxstreamMapping> {
        let resource = self
            .resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.map()
    }

    /// The mapping stays owned by the resource; unmapping only checks the id.
    pub fn unmap(&self, resource_id: u32) -> GfxstreamResult<()> {
        self.resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;
        Ok(())
    }

    /// Returns the caching type of a blob's mapping.
    pub fn map_info(&self, resource_id: u32) -> GfxstreamResult<u32> {
        let resource = self
            .resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        Ok(resource.map_info()? | GFXSTREAM_MAP_ACCESS_RW)
    }

    pub fn vulkan_info(&self, resource_id: u32) -> GfxstreamResult<VulkanInfo> {
        let resource = self
            .resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.vulkan_info()
    }

    /// Returns layout information of a 3D resource.
    pub fn resource_info(&self, resource_id: u32) -> GfxstreamResult<Resource3DInfo> {
        let resource = self
            .resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.info()
    }

    /// Exports the OS handle behind a blob.
    pub fn export_blob(&self, resource_id: u32) -> GfxstreamResult<GfxstreamHandle> {
        let resource = self
            .resources
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?;

        resource.export()
    }

    /// Hands out the sync object bound to `fence_id` by `acquire_context_fence`.
    pub fn export_fence(&mut self, fence_id: u64) -> GfxstreamResult<GfxstreamHandle> {
        let sync = self
            .sync_map
            .remove(&fence_id)
            .ok_or(GfxstreamError::InvalidGfxstreamHandle)?;

        Ok(GfxstreamHandle {
            os_handle: sync.descriptor,
            handle_type: sync.handle_type,
        })
    }

    /// Binds the sync last acquired on `ctx_id` to `fence_id`.
    pub fn acquire_context_fence(&mut self, ctx_id: u32, fence_id: u64) -> GfxstreamResult<()> {
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;

        let sync = ctx.take_latest_sync().ok_or_else(|| {
            error!("ctx {}: no sync acquired for fence {}", ctx_id, fence_id);
            GfxstreamError::InvalidGfxstreamHandle
        })?;
        self.sync_map.insert(fence_id, sync);
        Ok(())
    }

    /// Runs one gfxstream context command.
    pub fn submit_cmd(&mut self, ctx_id: u32, commands: &[u8]) -> GfxstreamResult<()> {
        if commands.len() % size_of::<u32>() != 0 {
            return Err(GfxstreamError::InvalidCommandSize(commands.len()));
        }

        let header: GfxstreamHeader = read_command(commands)?;
        let ctx = self
            .contexts
            .get_mut(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;

        // Sync exports wait on the ring the guest's fence for this command lands on.
        let ctx_ring = VirtioGpuRing::ContextSpecific { ctx_id, ring_idx: 0 };

        match header.op_code {
            GFXSTREAM_CONTEXT_CREATE => {
                let create: GfxstreamContextCreate = read_command(commands)?;
                let ring = self
                    .resources
                    .get(&create.resource_id)
                    .and_then(|r| r.ring_blob())
                    .ok_or(GfxstreamError::InvalidResourceId)?;
                ctx.start_asg(create.resource_id, ring.clone(), None)?;
            }
            GFXSTREAM_CONTEXT_PING | GFXSTREAM_CONTEXT_PING_WITH_RESPONSE => {
                let ping: GfxstreamContextPing = read_command(commands)?;
                ctx.ping_asg(ping.resource_id)?;
            }
            GFXSTREAM_CREATE_EXPORT_SYNC => {
                let export: GfxstreamCreateExportSync = read_command(commands)?;
                let sync = convert_32_to_64(export.sync_handle_lo, export.sync_handle_hi);
                let task = self.timelines.enqueue_task(ctx_ring);
                let timelines = self.timelines.clone();
                self.renderer
                    .async_wait_for_gpu_with_cb(sync, move || {
                        timelines.notify_task_completion(task)
                    })
                    .map_err(|e| self.abandon_task(task, e))?;
            }
            GFXSTREAM_CREATE_EXPORT_SYNC_VK | GFXSTREAM_CREATE_IMPORT_SYNC_VK => {
                let export: GfxstreamCreateExportSyncVk = read_command(commands)?;
                let device = convert_32_to_64(export.device_handle_lo, export.device_handle_hi);
                let fence = convert_32_to_64(export.fence_handle_lo, export.fence_handle_hi);
                let task = self.timelines.enqueue_task(ctx_ring);
                let timelines = self.timelines.clone();
                self.renderer
                    .async_wait_for_gpu_vulkan_with_cb(device, fence, move || {
                        timelines.notify_task_completion(task)
                    })
                    .map_err(|e| self.abandon_task(task, e))?;
            }
            GFXSTREAM_CREATE_QSRI_EXPORT_VK => {
                let export: GfxstreamCreateQsriExportVk = read_command(commands)?;
                let image = convert_32_to_64(export.image_handle_lo, export.image_handle_hi);
                debug!("ctx {}: qsri export for image {:#x}", ctx_id, image);
                let task = self.timelines.enqueue_task(ctx_ring);
                let timelines = self.timelines.clone();
                self.renderer
                    .async_wait_for_gpu_vulkan_qsri_with_cb(image, move || {
                        timelines.notify_task_completion(task)
                    })
                    .map_err(|e| self.abandon_task(task, e))?;
            }
            GFXSTREAM_RESOURCE_CREATE_3D => {
                let create: GfxstreamResourceCreate3d = read_command(commands)?;
                ctx.add_pending_blob(
                    create.blob_id,
                    ResourceCreate3D {
                        target: create.target,
                        format: create.format,
                        bind: create.bind,
                        width: create.width,
                        height: create.height,
                        depth: create.depth,
                        array_size: create.array_size,
                        last_level: create.last_level,
                        nr_samples: create.nr_samples,
                        flags: create.flags,
                    },
                );
            }
            GFXSTREAM_ACQUIRE_SYNC => {
                let acquire: GfxstreamAcquireSync = read_command(commands)?;
                let sync = self
                    .renderer
                    .external_objects()
                    .remove_sync_descriptor_info(ctx_id, acquire.sync_id)
                    .ok_or(GfxstreamError::InvalidGfxstreamHandle)?;
                ctx.set_latest_sync(sync);
            }
            GFXSTREAM_PLACEHOLDER_COMMAND_VK => (),
            _ => return Err(ProtocolError::UnknownOpcode(header.op_code).into()),
        }

        Ok(())
    }

    /// Completes a task whose wait could not be queued so later fences are not held back.
    fn abandon_task(&self, task: u64, e: GfxstreamError) -> GfxstreamError {
        error!("failed to queue wait for task {}: {}", task, e);
        self.timelines.notify_task_completion(task);
        e
    }

    /// Creates a fence that signals once the commands before it on its ring have completed.
    /// With `GFXSTREAM_FLAG_INFO_RING_IDX` the fence lands on the context ring
    /// `(ctx_id, ring_idx)`, otherwise on the global ring.
    pub fn create_fence(&mut self, fence: GfxstreamFence) -> GfxstreamResult<()> {
        let ring = if fence.flags & GFXSTREAM_FLAG_INFO_RING_IDX != 0 {
            if !self.contexts.contains_key(&fence.ctx_id) {
                return Err(GfxstreamError::InvalidContextId);
            }
            VirtioGpuRing::ContextSpecific {
                ctx_id: fence.ctx_id,
                ring_idx: fence.ring_idx,
            }
        } else {
            VirtioGpuRing::Global
        };

        let handler = self.fence_handler.clone();
        let signaled = GfxstreamFence {
            flags: GFXSTREAM_FLAG_FENCE | (fence.flags & GFXSTREAM_FLAG_INFO_RING_IDX),
            ..fence
        };
        debug!("fence {} on {}", fence.fence_id, ring);
        self.timelines.enqueue_fence(
            ring,
            fence.fence_id,
            Box::new(move || handler.call(signaled)),
        );
        Ok(())
    }

    /// Signals the fences whose commands have completed.  Only needed without async callbacks.
    pub fn poll(&self) {
        self.timelines.poll();
    }

    /// Fence ids still pending on `ring`.
    pub fn pending_fences(&self, ring: VirtioGpuRing) -> Vec<u64> {
        self.timelines.pending_fences(ring)
    }

    /// Pauses every render thread and writes ring blobs, contexts and renderer state to `w`.
    ///
    /// Guest iovecs are not saved; the VMM re-attaches backing after `restore`.  Buffer
    /// resources and blobs backed by external memory are skipped.
    pub fn snapshot(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        let guards = self.renderer.pause_all_render_threads()?;

        snapshot_io::write(w, SNAPSHOT_MAGIC)?;

        let resources: Vec<&VirtioGpuResource> = self
            .resources
            .values()
            .filter(|r| {
                let keep = r.is_snapshottable();
                if !keep {
                    warn!("snapshot: skipping resource {} ({:?})", r.id(), r.resource_type());
                }
                keep
            })
            .collect();
        snapshot_io::write(w, resources.len() as u32)?;
        for resource in resources {
            resource.save(w)?;
        }

        snapshot_io::write(w, self.contexts.len() as u32)?;
        for ctx in self.contexts.values() {
            snapshot_io::write(w, ctx.id())?;
            snapshot_io::write(w, ctx.capset_id())?;
            snapshot_io::write_bytes(w, ctx.name().as_bytes())?;
            let attached: Vec<u32> = ctx.attached().iter().copied().collect();
            snapshot_io::write_bytes(w, attached.as_slice().as_bytes())?;

            let threads: Vec<(u32, u64)> = ctx.asg_threads().collect();
            snapshot_io::write(w, threads.len() as u32)?;
            for (resource_id, thread_id) in threads {
                snapshot_io::write(w, resource_id)?;
                // A thread that exited meanwhile restarts from a clean stream.
                match guards.get(&thread_id) {
                    Some(guard) => guard.state().save(w)?,
                    None => RenderThreadState::default().save(w)?,
                }
            }
        }

        self.renderer.save_snapshot(w)?;
        drop(guards);
        Ok(())
    }

    /// Restores a frontend saved with `snapshot`.  Only a fresh frontend can be restored.
    pub fn restore(&mut self, r: &mut dyn Read) -> GfxstreamResult<()> {
        if !(self.resources.is_empty() && self.contexts.is_empty()) {
            return Err(GfxstreamError::Unsupported);
        }

        let magic: u32 = snapshot_io::read(r)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "bad frontend magic {:#x}",
                magic
            )));
        }

        let resource_count: u32 = snapshot_io::read(r)?;
        let mut resources = Map::new();
        for _ in 0..resource_count {
            let resource = VirtioGpuResource::load(r)?;
            resources.insert(resource.id(), resource);
        }

        let context_count: u32 = snapshot_io::read(r)?;
        let mut contexts = Vec::new();
        for _ in 0..context_count {
            let id: u32 = snapshot_io::read(r)?;
            let capset_id: u32 = snapshot_io::read(r)?;
            let name = String::from_utf8(snapshot_io::read_bytes(r)?)
                .map_err(|e| GfxstreamError::SnapshotMismatch(e.to_string()))?;
            let attached: Vec<u32> = snapshot_io::read_bytes(r)?
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let thread_count: u32 = snapshot_io::read(r)?;
            let mut threads = Vec::new();
            for _ in 0..thread_count {
                let resource_id: u32 = snapshot_io::read(r)?;
                threads.push((resource_id, RenderThreadState::load(r)?));
            }
            contexts.push((id, capset_id, name, attached, threads));
        }

        self.renderer.load_snapshot(r)?;
        snapshot_io::expect_eof(r)?;

        for (id, capset_id, name, attached, threads) in contexts {
            let mut ctx = VirtioGpuContext::new(self.renderer.clone(), id, capset_id, name);
            for resource_id in attached {
                ctx.attach(resource_id);
            }
            for (resource_id, state) in threads {
                let ring = resources
                    .get(&resource_id)
                    .and_then(|r| r.ring_blob())
                    .ok_or_else(|| {
                        GfxstreamError::SnapshotMismatch(format!(
                            "ctx {} render thread without ring blob {}",
                            id, resource_id
                        ))
                    })?;
                ctx.start_asg(resource_id, ring.clone(), Some(state))?;
            }
            self.contexts.insert(id, ctx);
        }
        self.resources = resources;
        info!(
            "restored {} contexts and {} resources",
            self.contexts.len(),
            self.resources.len()
        );
        Ok(())
    }

    pub fn context_ids(&self) -> Vec<u32> {
        self.contexts.keys().copied().collect()
    }

    pub fn resource_ids(&self) -> Vec<u32> {
        self.resources.keys().copied().collect()
    }

    /// Resources attached to `ctx_id`.
    pub fn attached_resources(&self, ctx_id: u32) -> GfxstreamResult<Vec<u32>> {
        let ctx = self
            .contexts
            .get(&ctx_id)
            .ok_or(GfxstreamError::InvalidContextId)?;
        Ok(ctx.attached().iter().copied().collect())
    }
}

impl Drop for VirtioGpuFrontend {
    fn drop(&mut self) {
        self.contexts.clear();
        self.resources.clear();
        self.renderer.stop(true);
    }
}

/// Builder for `VirtioGpuFrontend`, following the Rust builder pattern.
#[derive(Clone)]
pub struct GfxstreamBuilder {
    flags: GfxstreamFlags,
    feature_overrides: Option<String>,
    gl: Option<Arc<dyn GlBackend>>,
    vk: Option<Arc<dyn VkBackend>>,
    magma: Option<Arc<dyn MagmaBackend>>,
    external_objects: Option<Arc<ExternalObjectManager>>,
    use_async_fence_cb: bool,
}

impl Default for GfxstreamBuilder {
    fn default() -> GfxstreamBuilder {
        GfxstreamBuilder::new()
    }
}

impl GfxstreamBuilder {
    pub fn new() -> GfxstreamBuilder {
        GfxstreamBuilder {
            flags: GfxstreamFlags::new(),
            feature_overrides: None,
            gl: None,
            vk: None,
            magma: None,
            external_objects: None,
            use_async_fence_cb: true,
        }
    }

    pub fn set_use_egl(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_egl(v);
        self
    }

    pub fn set_use_surfaceless(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_surfaceless(v);
        self
    }

    pub fn set_use_gles(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_gles(v);
        self
    }

    pub fn set_use_vulkan(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_vulkan(v);
        self
    }

    pub fn set_use_vulkan_snapshots(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_vulkan_snapshots(v);
        self
    }

    pub fn set_use_external_blob(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_external_blob(v);
        self
    }

    pub fn set_use_system_blob(mut self, v: bool) -> GfxstreamBuilder {
        self.flags = self.flags.use_system_blob(v);
        self
    }

    /// Use the Vulkan swapchain to draw on the host window.
    pub fn set_wsi(mut self, v: GfxstreamWsi) -> GfxstreamBuilder {
        self.flags = self.flags.set_wsi(v);
        self
    }

    /// `name:enabled,name:disabled` feature overrides applied after the flags.
    pub fn set_feature_overrides(mut self, overrides: &str) -> GfxstreamBuilder {
        self.feature_overrides = Some(overrides.to_string());
        self
    }

    pub fn set_gl_backend(mut self, gl: Arc<dyn GlBackend>) -> GfxstreamBuilder {
        self.gl = Some(gl);
        self
    }

    pub fn set_vk_backend(mut self, vk: Arc<dyn VkBackend>) -> GfxstreamBuilder {
        self.vk = Some(vk);
        self
    }

    pub fn set_magma_backend(mut self, magma: Arc<dyn MagmaBackend>) -> GfxstreamBuilder {
        self.magma = Some(magma);
        self
    }

    /// Uses `eom` instead of the process-wide external-object manager.
    pub fn set_external_object_manager(mut self, eom: Arc<ExternalObjectManager>) -> GfxstreamBuilder {
        self.external_objects = Some(eom);
        self
    }

    /// Without async callbacks, fences only signal from `VirtioGpuFrontend::poll`.
    pub fn set_use_async_fence_cb(mut self, v: bool) -> GfxstreamBuilder {
        self.use_async_fence_cb = v;
        self
    }

    /// Logs what the GL back-end reports about itself.  A failing probe never fails the build.
    fn probe(gl: &dyn GlBackend) {
        let (vendor, renderer, version) = gl.renderer_strings();
        if vendor.is_empty() || renderer.is_empty() {
            debug!("GL probe returned incomplete strings, ignoring");
            return;
        }
        info!("GL: {} {} {}", vendor, renderer, version);
    }

    /// Builds the frontend.  Every API enabled in the flags needs its back-end.
    pub fn build(self, fence_handler: GfxstreamFenceHandler) -> GfxstreamResult<VirtioGpuFrontend> {
        let mut features = FeatureSet::from_flags(self.flags);
        if let Some(overrides) = &self.feature_overrides {
            features.apply_overrides(overrides)?;
        }

        let gl = match (self.flags.uses_gles(), self.gl) {
            (true, Some(gl)) => {
                GfxstreamBuilder::probe(gl.as_ref());
                Some(gl)
            }
            (true, None) => {
                return Err(GfxstreamError::InvalidGfxstreamBuild(
                    "GLES enabled without a GL back-end",
                ))
            }
            (false, _) => None,
        };
        let vk = match (self.flags.uses_vulkan(), self.vk) {
            (true, Some(vk)) => Some(vk),
            (true, None) => {
                return Err(GfxstreamError::InvalidGfxstreamBuild(
                    "Vulkan enabled without a Vulkan back-end",
                ))
            }
            (false, _) => None,
        };

        let mut capsets = Vec::new();
        if vk.is_some() {
            capsets.push(GFXSTREAM_CAPSET_VULKAN);
        }
        if self.magma.is_some() {
            capsets.push(GFXSTREAM_CAPSET_MAGMA);
        }
        if gl.is_some() {
            capsets.push(GFXSTREAM_CAPSET_GLES);
            capsets.push(GFXSTREAM_CAPSET_COMPOSER);
        }
        if capsets.is_empty() {
            return Err(GfxstreamError::InvalidGfxstreamBuild("no back-end enabled"));
        }

        let renderer = Renderer::new(RendererConfig {
            features,
            gl,
            vk,
            magma: self.magma,
            external_objects: self
                .external_objects
                .unwrap_or_else(ExternalObjectManager::get),
        })?;

        Ok(VirtioGpuFrontend {
            resources: Map::new(),
            contexts: Map::new(),
            sync_map: Map::new(),
            capsets,
            page_size: page_size()?,
            fence_handler,
            timelines: Arc::new(VirtioGpuTimelines::new(self.use_async_fence_cb)),
            renderer,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;
    use std::time::Instant;

    use super::*;
    use crate::asg::AsgRing;
    use crate::backend::StubGlBackend;
    use crate::backend::StubVkBackend;
    use crate::server::render_control::OP_RC_GET_RENDERER_VERSION;
    use crate::wire::ChecksumCalculator;
    use crate::wire::Encoder;

    fn frontend(signaled: Arc<Mutex<Vec<u64>>>) -> VirtioGpuFrontend {
        let _ = env_logger::builder().is_test(true).try_init();
        GfxstreamBuilder::new()
            .set_use_gles(true)
            .set_use_vulkan(true)
            .set_gl_backend(Arc::new(StubGlBackend::new()))
            .set_vk_backend(Arc::new(StubVkBackend::new()))
            .set_external_object_manager(ExternalObjectManager::new())
            .build(GfxstreamHandler::new(move |fence: GfxstreamFence| {
                signaled.lock().unwrap().push(fence.fence_id)
            }))
            .unwrap()
    }

    fn ring_blob_args(size: u64) -> ResourceCreateBlob {
        ResourceCreateBlob {
            blob_mem: GFXSTREAM_BLOB_MEM_HOST3D,
            blob_flags: GFXSTREAM_BLOB_FLAG_USE_MAPPABLE,
            blob_id: 0,
            size,
        }
    }

    fn ctx_fence(ctx_id: u32, fence_id: u64) -> GfxstreamFence {
        GfxstreamFence {
            flags: GFXSTREAM_FLAG_FENCE | GFXSTREAM_FLAG_INFO_RING_IDX,
            fence_id,
            ctx_id,
            ring_idx: 0,
        }
    }

    #[test]
    fn capsets() {
        let f = frontend(Default::default());
        assert_eq!(f.get_num_capsets(), 3);
        let (id, version, size) = f.get_capset_info(0).unwrap();
        assert_eq!(id, GFXSTREAM_CAPSET_VULKAN);
        assert_eq!(version, 1);
        assert_eq!(size as usize, size_of::<VulkanCapset>());

        let bytes = f.get_capset(GFXSTREAM_CAPSET_VULKAN, 0).unwrap();
        let capset = VulkanCapset::read_from(bytes.as_slice()).unwrap();
        assert_eq!(capset.ring_size, GFXSTREAM_RING_SIZE);
        assert_eq!(capset.deferred_mapping, 1);
        assert!(capset.is_format_supported(VIRGL_FORMAT_R8G8B8A8_UNORM));
        assert!(!capset.is_format_supported(VIRGL_FORMAT_R8G8B8A8_UNORM + 1));
        assert!(f.get_capset(GFXSTREAM_CAPSET_MAGMA, 0).is_err());
        assert!(f.get_capset_info(3).is_err());
    }

    #[test]
    fn build_needs_backends() {
        let no_gl = GfxstreamBuilder::new()
            .set_use_gles(true)
            .build(GfxstreamHandler::new(|_| ()));
        assert!(no_gl.is_err());
        let nothing = GfxstreamBuilder::new().build(GfxstreamHandler::new(|_| ()));
        assert!(nothing.is_err());
    }

    #[test]
    fn contexts_and_attachments() {
        let mut f = frontend(Default::default());
        f.create_context(1, GFXSTREAM_CAPSET_GLES, Some("test")).unwrap();
        assert!(f.create_context(1, GFXSTREAM_CAPSET_GLES, None).is_err());
        assert!(f.create_context(2, 42, None).is_err());

        f.resource_create_blob(1, 10, ring_blob_args(4096), None)
            .unwrap();
        f.context_attach_resource(1, 10).unwrap();
        assert_eq!(f.attached_resources(1).unwrap(), vec![10]);
        assert!(f.context_attach_resource(1, 11).is_err());

        f.unref_resource(10).unwrap();
        assert!(f.attached_resources(1).unwrap().is_empty());
        assert!(f.unref_resource(10).is_err());

        f.destroy_context(1).unwrap();
        assert!(f.destroy_context(1).is_err());
    }

    #[test]
    fn global_fences_signal_immediately() {
        let signaled = Arc::new(Mutex::new(Vec::new()));
        let mut f = frontend(signaled.clone());
        f.create_fence(GfxstreamFence {
            flags: GFXSTREAM_FLAG_FENCE,
            fence_id: 1,
            ctx_id: 0,
            ring_idx: 0,
        })
        .unwrap();
        assert_eq!(*signaled.lock().unwrap(), vec![1]);
        // Context rings need a context.
        assert!(f.create_fence(ctx_fence(5, 2)).is_err());
    }

    #[test]
    fn qsri_export_holds_back_context_fence() {
        let signaled = Arc::new(Mutex::new(Vec::new()));
        let mut f = frontend(signaled.clone());
        f.create_context(1, GFXSTREAM_CAPSET_VULKAN, None).unwrap();

        let (lo, hi) = convert_64_to_32(0xabcd);
        let cmd = GfxstreamCreateQsriExportVk {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CREATE_QSRI_EXPORT_VK,
            },
            image_handle_lo: lo,
            image_handle_hi: hi,
        };
        f.submit_cmd(1, cmd.as_bytes()).unwrap();
        f.create_fence(ctx_fence(1, 7)).unwrap();
        assert!(signaled.lock().unwrap().is_empty());
        assert_eq!(
            f.pending_fences(VirtioGpuRing::ContextSpecific {
                ctx_id: 1,
                ring_idx: 0
            }),
            vec![7]
        );

        f.renderer().signal_qsri(0xabcd);
        assert_eq!(*signaled.lock().unwrap(), vec![7]);
    }

    #[test]
    fn bad_commands_are_rejected() {
        let mut f = frontend(Default::default());
        f.create_context(1, GFXSTREAM_CAPSET_VULKAN, None).unwrap();
        assert!(f.submit_cmd(1, &[0u8; 3]).is_err());
        assert!(f.submit_cmd(1, &0x1234u32.to_le_bytes()).is_err());
        assert!(f.submit_cmd(2, GfxstreamHeader::default().as_bytes()).is_err());
        // Placeholder commands only carry fences.
        let placeholder = GfxstreamPlaceholderCommandVk {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_PLACEHOLDER_COMMAND_VK,
            },
            ..Default::default()
        };
        f.submit_cmd(1, placeholder.as_bytes()).unwrap();
        // Context create needs a ring blob.
        let create = GfxstreamContextCreate {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CONTEXT_CREATE,
            },
            resource_id: 99,
        };
        assert!(f.submit_cmd(1, create.as_bytes()).is_err());
    }

    #[test]
    fn pending_blob_creates_color_buffer() {
        let mut f = frontend(Default::default());
        f.create_context(1, GFXSTREAM_CAPSET_VULKAN, None).unwrap();
        let create = GfxstreamResourceCreate3d {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_RESOURCE_CREATE_3D,
            },
            target: GFXSTREAM_PIPE_TEXTURE_2D,
            format: VIRGL_FORMAT_R8G8B8A8_UNORM,
            bind: VIRGL_BIND_RENDER_TARGET,
            width: 4,
            height: 4,
            depth: 1,
            array_size: 1,
            blob_id: 3,
            ..Default::default()
        };
        f.submit_cmd(1, create.as_bytes()).unwrap();

        // Without external blobs the blob still needs a mapping registered for it.
        f.renderer()
            .external_objects()
            .add_mapping(1, 3, 0x2000, GFXSTREAM_MAP_CACHE_CACHED);
        let blob = ResourceCreateBlob {
            blob_mem: GFXSTREAM_BLOB_MEM_HOST3D,
            blob_flags: GFXSTREAM_BLOB_FLAG_USE_MAPPABLE,
            blob_id: 3,
            size: 64,
        };
        f.resource_create_blob(1, 20, blob, None).unwrap();
        assert_eq!(f.renderer().color_buffer_count(), 1);
        assert_eq!(f.resource_info(20).unwrap().width, 4);
        assert_eq!(
            f.map_info(20).unwrap(),
            GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW
        );
        f.unref_resource(20).unwrap();
        assert_eq!(f.renderer().color_buffer_count(), 0);
    }

    fn read_reply(ring: &AsgRing, len: usize) -> Vec<u8> {
        let start = Instant::now();
        let mut out = Vec::new();
        while out.len() < len {
            ring.from_host().drain_into(&mut out).unwrap();
            assert!(start.elapsed() < Duration::from_secs(10), "no reply");
            thread::sleep(Duration::from_millis(1));
        }
        out
    }

    #[test]
    fn ring_blob_context_serves_commands_and_survives_snapshot() {
        let mut f = frontend(Default::default());
        f.create_context(1, GFXSTREAM_CAPSET_GLES, Some("asg")).unwrap();
        f.resource_create_blob(1, 10, ring_blob_args(16384), None)
            .unwrap();
        f.context_attach_resource(1, 10).unwrap();

        let create = GfxstreamContextCreate {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CONTEXT_CREATE,
            },
            resource_id: 10,
        };
        f.submit_cmd(1, create.as_bytes()).unwrap();
        assert_eq!(f.renderer().render_thread_count(), 1);

        let mapping = f.map(10).unwrap();
        // Safe because the blob stays alive until the frontend is dropped.
        let ring =
            unsafe { AsgRing::from_raw(mapping.ptr as *mut u8, mapping.size as usize).unwrap() };
        let packet = Encoder::new(OP_RC_GET_RENDERER_VERSION).finish(&mut ChecksumCalculator::new());
        assert_eq!(ring.to_host().write(&packet).unwrap(), packet.len());
        let ping = GfxstreamContextPing {
            hdr: GfxstreamHeader {
                op_code: GFXSTREAM_CONTEXT_PING,
            },
            resource_id: 10,
        };
        f.submit_cmd(1, ping.as_bytes()).unwrap();
        assert_eq!(read_reply(&ring, 4), 1i32.to_le_bytes());

        let mut snapshot = Vec::new();
        f.snapshot(&mut snapshot).unwrap();
        drop(ring);
        drop(f);

        let mut restored = frontend(Default::default());
        restored.restore(&mut snapshot.as_slice()).unwrap();
        assert_eq!(restored.context_ids(), vec![1]);
        assert_eq!(restored.attached_resources(1).unwrap(), vec![10]);
        assert_eq!(restored.renderer().render_thread_count(), 1);

        // The ring contents came back with the blob.
        let mapping = restored.map(10).unwrap();
        let ring =
            unsafe { AsgRing::from_raw(mapping.ptr as *mut u8, mapping.size as usize).unwrap() };
        assert_eq!(ring.to_host().write(&packet).unwrap(), packet.len());
        restored.submit_cmd(1, ping.as_bytes()).unwrap();
        assert_eq!(read_reply(&ring, 4), 1i32.to_le_bytes());

        // Restoring twice is refused.
        assert!(restored.restore(&mut snapshot.as_slice()).is_err());
    }
}
