// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An in-process virtio-gpu device.  Guest calls become tasks on a FIFO queue; one worker thread
//! owns the host frontend and runs the tasks in order, so every host mutation coming from this
//! device is totally ordered.

use std::collections::BTreeMap as Map;
use std::os::raw::c_void;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use gfxstream_host::backend::StubGlBackend;
use gfxstream_host::backend::StubMagmaBackend;
use gfxstream_host::backend::StubVkBackend;
use gfxstream_host::external_object_manager::ExternalObjectManager;
use gfxstream_host::sync::Promise;
use gfxstream_host::sync::SharedFuture;
use gfxstream_host::*;
use log::debug;
use log::error;
use log::info;

use crate::config::EmulatedGpuConfig;
use crate::emulated::fence::FenceTable;
use crate::emulated::resource::EmulatedResource;
use crate::emulated::resource::EmulatedResourceKind;
use crate::emulated::resource::GuestBytes;
use crate::emulated::resource::GuestMapping;
use crate::emulated::resource::ResourceRegistry;
use crate::error::GuestError;
use crate::error::GuestResult;

/// `submit_cmd` fence flags.
pub const VIRTIO_GPU_FLAG_FENCE: u32 = 1 << 0;

#[derive(Copy, Clone, Debug)]
struct VirtioGpuFence {
    fence_id: u32,
    ring_idx: u8,
}

enum VirtioGpuTask {
    CreateContext {
        context_init: u32,
        name: String,
    },
    DestroyContext,
    ContextAttachResource {
        resource_id: u32,
    },
    ContextDetachResource {
        resource_id: u32,
    },
    CreateBlob {
        resource_id: u32,
        create: ResourceCreateBlob,
    },
    CreateResource3D {
        resource: Arc<EmulatedResource>,
        create: ResourceCreate3D,
    },
    Map {
        resource_id: u32,
        mapped: Promise<u64>,
    },
    Unmap {
        resource_id: u32,
    },
    /// Holds the guest side of the resource until the host has let go of its backing.
    UnrefResource {
        resource: Arc<EmulatedResource>,
    },
    SubmitCmd {
        commands: Vec<u8>,
    },
    TransferToHost {
        resource_id: u32,
        offset: u32,
        size: u32,
    },
    TransferFromHost {
        resource_id: u32,
        offset: u32,
        size: u32,
    },
    SnapshotSave {
        saved: Promise<Arc<Vec<u8>>>,
    },
    SnapshotRestore {
        data: Vec<u8>,
        restored: Promise<()>,
    },
}

impl VirtioGpuTask {
    fn name(&self) -> &'static str {
        match self {
            VirtioGpuTask::CreateContext { .. } => "create context",
            VirtioGpuTask::DestroyContext => "destroy context",
            VirtioGpuTask::ContextAttachResource { .. } => "attach resource",
            VirtioGpuTask::ContextDetachResource { .. } => "detach resource",
            VirtioGpuTask::CreateBlob { .. } => "create blob",
            VirtioGpuTask::CreateResource3D { .. } => "create 3d resource",
            VirtioGpuTask::Map { .. } => "map",
            VirtioGpuTask::Unmap { .. } => "unmap",
            VirtioGpuTask::UnrefResource { .. } => "unref resource",
            VirtioGpuTask::SubmitCmd { .. } => "submit command",
            VirtioGpuTask::TransferToHost { .. } => "transfer to host",
            VirtioGpuTask::TransferFromHost { .. } => "transfer from host",
            VirtioGpuTask::SnapshotSave { .. } => "snapshot save",
            VirtioGpuTask::SnapshotRestore { .. } => "snapshot restore",
        }
    }
}

struct QueuedTask {
    ctx_id: u32,
    task: VirtioGpuTask,
    fence: Option<VirtioGpuFence>,
    completed: Promise<()>,
}

/// Owns the host frontend.  Runs on the device's worker thread only.
struct VirtioGpuWorker {
    frontend: VirtioGpuFrontend,
    builder: GfxstreamBuilder,
    fence_handler: GfxstreamFenceHandler,
}

impl VirtioGpuWorker {
    fn run(&mut self, tasks: Receiver<QueuedTask>) {
        for queued in tasks.iter() {
            self.execute(queued);
        }
        debug!("emulated virtio-gpu worker exiting");
    }

    fn execute(&mut self, queued: QueuedTask) {
        let QueuedTask {
            ctx_id,
            task,
            fence,
            completed,
        } = queued;

        let name = task.name();
        let result = self.do_task(ctx_id, task);
        if let Err(e) = &result {
            error!("ctx {}: {} failed: {}", ctx_id, name, e);
        }

        if let Some(fence) = fence {
            let info = GfxstreamFence {
                flags: GFXSTREAM_FLAG_INFO_RING_IDX,
                fence_id: fence.fence_id as u64,
                ctx_id,
                ring_idx: fence.ring_idx,
            };
            if let Err(e) = self.frontend.create_fence(info) {
                error!("ctx {}: failed to create fence {}: {}", ctx_id, fence.fence_id, e);
            }
        }

        // Waiters on a failed task see a broken promise.
        if result.is_ok() {
            completed.set_value(());
        }
    }

    fn do_task(&mut self, ctx_id: u32, task: VirtioGpuTask) -> GfxstreamResult<()> {
        match task {
            VirtioGpuTask::CreateContext { context_init, name } => {
                self.frontend
                    .create_context(ctx_id, context_init, Some(&name))?;
            }
            VirtioGpuTask::DestroyContext => self.frontend.destroy_context(ctx_id)?,
            VirtioGpuTask::ContextAttachResource { resource_id } => {
                self.frontend.context_attach_resource(ctx_id, resource_id)?;
            }
            VirtioGpuTask::ContextDetachResource { resource_id } => {
                self.frontend.context_detach_resource(ctx_id, resource_id)?;
            }
            VirtioGpuTask::CreateBlob {
                resource_id,
                create,
            } => {
                self.frontend
                    .resource_create_blob(ctx_id, resource_id, create, None)?;
            }
            VirtioGpuTask::CreateResource3D { resource, create } => {
                let resource_id = resource.id();
                self.frontend.resource_create_3d(resource_id, create)?;
                if let EmulatedResourceKind::Pipe { bytes, .. } = resource.kind() {
                    // One iovec covering the first row only.
                    let iovec = GfxstreamIovec {
                        base: bytes.as_ptr() as *mut c_void,
                        len: (create.width as usize).min(bytes.len()),
                    };
                    self.frontend.attach_backing(resource_id, vec![iovec])?;
                }
                self.frontend.context_attach_resource(ctx_id, resource_id)?;
            }
            VirtioGpuTask::Map {
                resource_id,
                mapped,
            } => {
                // On failure the promise is dropped and waiters see a broken promise.
                let mapping = self.frontend.map(resource_id)?;
                mapped.set_value(mapping.ptr);
            }
            VirtioGpuTask::Unmap { resource_id } => self.frontend.unmap(resource_id)?,
            VirtioGpuTask::UnrefResource { resource } => {
                self.frontend.unref_resource(resource.id())?;
            }
            VirtioGpuTask::SubmitCmd { commands } => {
                if commands.len() % 4 != 0 {
                    return Err(GfxstreamError::InvalidCommandSize(commands.len()));
                }
                self.frontend.submit_cmd(ctx_id, &commands)?;
            }
            VirtioGpuTask::TransferToHost {
                resource_id,
                offset,
                size,
            } => {
                self.frontend
                    .transfer_write(ctx_id, resource_id, Transfer3D::new_1d(offset, size))?;
            }
            VirtioGpuTask::TransferFromHost {
                resource_id,
                offset,
                size,
            } => {
                self.frontend
                    .transfer_read(ctx_id, resource_id, Transfer3D::new_1d(offset, size))?;
            }
            VirtioGpuTask::SnapshotSave { saved } => {
                let mut out = Vec::new();
                self.frontend.snapshot(&mut out)?;
                info!("snapshot saved, {} bytes", out.len());
                saved.set_value(Arc::new(out));
            }
            VirtioGpuTask::SnapshotRestore { data, restored } => {
                // Only a fresh frontend can be restored; the old one goes once the new one is up.
                let mut fresh = self.builder.clone().build(self.fence_handler.clone())?;
                fresh.restore(&mut data.as_slice())?;
                self.frontend = fresh;
                info!("snapshot restored from {} bytes", data.len());
                restored.set_value(());
            }
        }
        Ok(())
    }
}

/// The emulated virtio-gpu device.
pub struct EmulatedVirtioGpu {
    config: EmulatedGpuConfig,
    capsets: Map<u32, Vec<u8>>,
    resources: ResourceRegistry,
    fences: Arc<FenceTable>,
    fence_handler: GfxstreamFenceHandler,
    next_context_id: AtomicU32,
    next_resource_id: AtomicU32,
    tasks: Option<Sender<QueuedTask>>,
    worker: Option<JoinHandle<()>>,
}

impl EmulatedVirtioGpu {
    fn builder(config: &EmulatedGpuConfig) -> GfxstreamBuilder {
        let mut builder = GfxstreamBuilder::new()
            .set_use_gles(config.with_gl)
            .set_use_vulkan(config.with_vk)
            .set_use_vulkan_snapshots(config.with_vk_snapshots)
            .set_wsi(GfxstreamWsi::Surfaceless)
            .set_magma_backend(Arc::new(StubMagmaBackend::new()))
            .set_external_object_manager(ExternalObjectManager::new());
        if config.with_gl {
            builder = builder.set_gl_backend(Arc::new(StubGlBackend::new()));
        }
        if config.with_vk {
            builder = builder.set_vk_backend(Arc::new(StubVkBackend::new()));
        }
        builder
    }

    /// Brings up a host renderer with the back-ends selected by `config` and starts the worker.
    pub fn new(config: EmulatedGpuConfig) -> GuestResult<EmulatedVirtioGpu> {
        info!(
            "initializing with gl:{} vk:{} vk snapshots:{} icd:{:?}",
            config.with_gl, config.with_vk, config.with_vk_snapshots, config.vk_icd
        );

        let fences = Arc::new(FenceTable::default());
        let signaled = fences.clone();
        let fence_handler = GfxstreamHandler::new(move |fence: GfxstreamFence| {
            signaled.signal(fence.fence_id as u32)
        });

        let builder = EmulatedVirtioGpu::builder(&config);
        let frontend = builder.clone().build(fence_handler.clone())?;

        let mut capsets = Map::new();
        for index in 0..frontend.get_num_capsets() {
            let (capset_id, version, _size) = frontend.get_capset_info(index)?;
            capsets.insert(capset_id, frontend.get_capset(capset_id, version)?);
        }

        let (tasks, receiver) = unbounded();
        let mut worker = VirtioGpuWorker {
            frontend,
            builder,
            fence_handler: fence_handler.clone(),
        };
        let worker = thread::Builder::new()
            .name("emulated-virtio-gpu".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(GfxstreamError::from)?;

        Ok(EmulatedVirtioGpu {
            config,
            capsets,
            resources: ResourceRegistry::default(),
            fences,
            fence_handler,
            next_context_id: AtomicU32::new(1),
            next_resource_id: AtomicU32::new(1),
            tasks: Some(tasks),
            worker: Some(worker),
        })
    }

    pub fn config(&self) -> &EmulatedGpuConfig {
        &self.config
    }

    fn enqueue(
        &self,
        ctx_id: u32,
        task: VirtioGpuTask,
        fence: Option<VirtioGpuFence>,
    ) -> GuestResult<SharedFuture<()>> {
        let (completed, waitable) = Promise::new();
        self.tasks
            .as_ref()
            .ok_or(GuestError::DeviceStopped)?
            .send(QueuedTask {
                ctx_id,
                task,
                fence,
                completed,
            })
            .map_err(|_| GuestError::DeviceStopped)?;
        Ok(waitable)
    }

    pub fn capset_ids(&self) -> Vec<u32> {
        self.capsets.keys().copied().collect()
    }

    /// The capability set `capset_id` as reported by the host at start-up.
    pub fn get_caps(&self, capset_id: u32) -> GuestResult<Vec<u8>> {
        self.capsets
            .get(&capset_id)
            .cloned()
            .ok_or(GuestError::InvalidCapset(capset_id))
    }

    /// Creates a context for the capset in `context_init` and returns its id.
    pub fn create_context(&self, context_init: u32) -> GuestResult<u32> {
        let capset_id = context_init & GFXSTREAM_CONTEXT_INIT_CAPSET_ID_MASK;
        if !self.capsets.contains_key(&capset_id) {
            return Err(GuestError::InvalidCapset(capset_id));
        }

        let ctx_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
        let task = VirtioGpuTask::CreateContext {
            context_init,
            name: format!("EmulatedVirtioGpu Context {}", ctx_id),
        };
        self.enqueue(ctx_id, task, None)?;
        Ok(ctx_id)
    }

    pub fn destroy_context(&self, ctx_id: u32) -> GuestResult<()> {
        self.enqueue(ctx_id, VirtioGpuTask::DestroyContext, None)?;
        Ok(())
    }

    fn next_resource_id(&self) -> u32 {
        self.next_resource_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a blob resource.  A mappable blob gets a map task whose result `map` returns.
    pub fn create_blob(
        &self,
        ctx_id: u32,
        blob_mem: u32,
        blob_flags: u32,
        blob_id: u64,
        size: u64,
    ) -> GuestResult<u32> {
        let resource_id = self.next_resource_id();
        debug!("ctx {}: creating blob {} of {} bytes", ctx_id, resource_id, size);

        let create = VirtioGpuTask::CreateBlob {
            resource_id,
            create: ResourceCreateBlob {
                blob_mem,
                blob_flags,
                blob_id,
                size,
            },
        };
        let created = self.enqueue(ctx_id, create, None)?;

        let mut resource = EmulatedResource::new(
            resource_id,
            EmulatedResourceKind::Blob { size, mapped: None },
        );
        resource.add_pending(created);
        if blob_flags & GFXSTREAM_BLOB_FLAG_USE_MAPPABLE != 0 {
            let (mapped, mapped_future) = Promise::new();
            self.enqueue(ctx_id, VirtioGpuTask::Map { resource_id, mapped }, None)?;
            resource.set_mapped(mapped_future);
        }
        self.resources.insert(resource);

        self.enqueue(
            ctx_id,
            VirtioGpuTask::ContextAttachResource { resource_id },
            None,
        )?;
        Ok(resource_id)
    }

    /// Creates a 3D resource shadowed by `size` bytes of guest memory.
    #[allow(clippy::too_many_arguments)]
    pub fn create_virgl_blob(
        &self,
        ctx_id: u32,
        width: u32,
        height: u32,
        virgl_format: u32,
        target: u32,
        bind: u32,
        size: u32,
    ) -> GuestResult<u32> {
        let resource_id = self.next_resource_id();
        let resource = self.resources.insert(EmulatedResource::new(
            resource_id,
            EmulatedResourceKind::Pipe {
                width,
                height,
                format: virgl_format,
                bytes: GuestBytes::new(size as usize),
            },
        ));

        let create = ResourceCreate3D {
            target,
            format: virgl_format,
            bind,
            width,
            height,
            depth: 1,
            array_size: 1,
            last_level: 0,
            nr_samples: 0,
            flags: 0,
        };
        let created = self.enqueue(
            ctx_id,
            VirtioGpuTask::CreateResource3D {
                resource: resource.clone(),
                create,
            },
            None,
        )?;
        resource.add_pending(created);
        Ok(resource_id)
    }

    /// The guest mapping of a mappable blob, or the shadow memory of a pipe resource.  Blocks
    /// until the blob's map task ran.
    pub fn map(&self, resource_id: u32) -> GuestResult<GuestMapping> {
        let resource = self.resources.get(resource_id)?;
        match resource.kind() {
            EmulatedResourceKind::Blob {
                mapped: Some(mapped),
                size,
            } => {
                let ptr = mapped.wait()?;
                // SAFETY: the host keeps the blob mapped until the resource is unreferenced.
                Ok(unsafe { GuestMapping::from_raw(ptr as *mut u8, *size as usize) })
            }
            EmulatedResourceKind::Blob { mapped: None, .. } => {
                error!("resource {}: mapping a blob created without MAPPABLE", resource_id);
                Err(GuestError::NotMappable(resource_id))
            }
            // SAFETY: the shadow allocation lives as long as the resource.
            EmulatedResourceKind::Pipe { bytes, .. } => {
                Ok(unsafe { GuestMapping::from_raw(bytes.as_ptr(), bytes.len()) })
            }
        }
    }

    pub fn unmap(&self, resource_id: u32) -> GuestResult<()> {
        let resource = self.resources.get(resource_id)?;
        if !resource.is_pipe() {
            self.enqueue(0, VirtioGpuTask::Unmap { resource_id }, None)?;
        }
        Ok(())
    }

    /// Queues `commands` on `ctx_id`.  With `VIRTIO_GPU_FLAG_FENCE` returns the id of a fence on
    /// `ring_idx` that signals once the host finished the commands.  Completion is also recorded
    /// on `blob_resource`.
    pub fn submit_cmd(
        &self,
        ctx_id: u32,
        commands: &[u8],
        ring_idx: u8,
        fence_flags: u32,
        blob_resource: Option<u32>,
    ) -> GuestResult<Option<u32>> {
        if commands.len() % 4 != 0 {
            return Err(GuestError::InvalidCommandSize(commands.len()));
        }
        let blob = blob_resource
            .map(|id| self.resources.get(id))
            .transpose()?;

        let fence = if fence_flags & VIRTIO_GPU_FLAG_FENCE != 0 {
            Some(VirtioGpuFence {
                fence_id: self.fences.create(),
                ring_idx,
            })
        } else {
            None
        };

        let task = VirtioGpuTask::SubmitCmd {
            commands: commands.to_vec(),
        };
        let completed = self.enqueue(ctx_id, task, fence)?;
        if let Some(blob) = blob {
            blob.add_pending(completed);
        }
        Ok(fence.map(|f| f.fence_id))
    }

    /// Waits for every task recorded on the resource so far.
    pub fn wait(&self, resource_id: u32) -> GuestResult<()> {
        let resource = self.resources.get(resource_id)?;
        for waitable in resource.take_pending() {
            waitable.wait()?;
        }
        Ok(())
    }

    fn transfer(
        &self,
        ctx_id: u32,
        resource_id: u32,
        offset: u32,
        size: u32,
        to_host: bool,
    ) -> GuestResult<()> {
        let resource = self.resources.get(resource_id)?;
        let limit = resource.size();
        if offset as u64 + size as u64 > limit {
            return Err(GuestError::TransferOutOfBounds {
                offset: offset as u64,
                size: size as u64,
                limit,
            });
        }

        let task = if to_host {
            VirtioGpuTask::TransferToHost {
                resource_id,
                offset,
                size,
            }
        } else {
            VirtioGpuTask::TransferFromHost {
                resource_id,
                offset,
                size,
            }
        };
        resource.add_pending(self.enqueue(ctx_id, task, None)?);
        Ok(())
    }

    pub fn transfer_to_host(
        &self,
        ctx_id: u32,
        resource_id: u32,
        offset: u32,
        size: u32,
    ) -> GuestResult<()> {
        self.transfer(ctx_id, resource_id, offset, size, true)
    }

    pub fn transfer_from_host(
        &self,
        ctx_id: u32,
        resource_id: u32,
        offset: u32,
        size: u32,
    ) -> GuestResult<()> {
        self.transfer(ctx_id, resource_id, offset, size, false)
    }

    /// Forgets the resource now and releases it on the host in queue order.  Destroying an
    /// unknown resource only warns.
    pub fn destroy_resource(&self, ctx_id: u32, resource_id: u32) -> GuestResult<()> {
        let resource = match self.resources.remove(resource_id) {
            Some(r) => r,
            None => {
                log::warn!("resource {} destroyed twice", resource_id);
                return Ok(());
            }
        };
        self.enqueue(
            ctx_id,
            VirtioGpuTask::ContextDetachResource { resource_id },
            None,
        )?;
        self.enqueue(ctx_id, VirtioGpuTask::UnrefResource { resource }, None)?;
        Ok(())
    }

    pub fn resource_ids(&self) -> Vec<u32> {
        self.resources.ids()
    }

    /// Saves the host state once every task queued before this call has run.
    pub fn snapshot_save(&self) -> GuestResult<Vec<u8>> {
        let (saved, saved_future) = Promise::new();
        let completed = self.enqueue(0, VirtioGpuTask::SnapshotSave { saved }, None)?;
        completed.wait()?;
        let saved = saved_future.wait()?;
        Ok(saved.as_ref().clone())
    }

    /// Replaces the host state with `data`.  Mappable blobs are mapped again; guest mappings taken
    /// before the restore are stale.
    pub fn snapshot_restore(&self, data: &[u8]) -> GuestResult<()> {
        let (restored, restored_future) = Promise::new();
        let task = VirtioGpuTask::SnapshotRestore {
            data: data.to_vec(),
            restored,
        };
        self.enqueue(0, task, None)?.wait()?;
        restored_future.wait()?;

        let mut remap_error = None;
        self.resources.remap_blobs(|resource_id| {
            let (mapped, mapped_future) = Promise::new();
            if let Err(e) = self.enqueue(0, VirtioGpuTask::Map { resource_id, mapped }, None) {
                remap_error = Some(e);
            }
            mapped_future
        });
        match remap_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The callback the host frontend completes fences through.
    pub fn fence_handler(&self) -> GfxstreamFenceHandler {
        self.fence_handler.clone()
    }

    pub fn create_emulated_fence(&self) -> u32 {
        self.fences.create()
    }

    pub fn signal_emulated_fence(&self, fence_id: u32) {
        self.fences.signal(fence_id)
    }

    /// Waits up to `timeout_ms` for the fence.  Unknown fences count as signaled.
    pub fn wait_on_emulated_fence(&self, fence_id: u32, timeout_ms: u64) -> GuestResult<()> {
        self.fences
            .wait(fence_id, Duration::from_millis(timeout_ms))
    }
}

impl Drop for EmulatedVirtioGpu {
    fn drop(&mut self) {
        // Closing the queue ends the worker after the tasks already queued.
        drop(self.tasks.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("emulated virtio-gpu worker panicked");
            }
        }
    }
}
