// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! renderer: host-wide state shared by every render thread.
//!
//! Owns the back-ends, the color buffer and buffer registries, the Vulkan reconstruction state,
//! QSRI timelines, and the registry of live render threads.  Asynchronous GPU waits run on a
//! dedicated sync worker; per-process teardown runs on a cleanup worker so render threads never
//! block on it.

use std::collections::BTreeMap as Map;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;
use zerocopy::AsBytes;

use crate::backend::GlBackend;
use crate::backend::MagmaBackend;
use crate::backend::VkBackend;
use crate::cleanup::CallbackWorker;
use crate::color_buffer::ColorBuffer;
use crate::external_object_manager::BlobDescriptorInfo;
use crate::external_object_manager::ExternalObjectManager;
use crate::features::Feature;
use crate::features::FeatureSet;
use crate::formats::FrameworkFormat;
use crate::gfxstream_os::MappedRegion;
use crate::gfxstream_os::MemoryMapping;
use crate::gfxstream_os::SharedMemory;
use crate::gfxstream_utils::*;
use crate::memory_properties::EmulatedPhysicalDeviceMemoryProperties;
use crate::render_thread::PauseGuard;
use crate::render_thread::RenderThreadControl;
use crate::server::vulkan::VkGlobalState;
use crate::snapshot_io;
use crate::timelines::VkQsriTimeline;
use crate::wire::host_extension_string;

const PAUSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a renderer is built from.
pub struct RendererConfig {
    pub features: FeatureSet,
    pub gl: Option<Arc<dyn GlBackend>>,
    pub vk: Option<Arc<dyn VkBackend>>,
    pub magma: Option<Arc<dyn MagmaBackend>>,
    pub external_objects: Arc<ExternalObjectManager>,
}

struct ColorBufferEntry {
    color_buffer: Arc<ColorBuffer>,
    refcount: u32,
}

enum BufferBacking {
    Gl {
        backend: Arc<dyn GlBackend>,
        name: u32,
    },
    Shared {
        shm: SharedMemory,
        mapping: MemoryMapping,
    },
}

struct HostBuffer {
    size: u64,
    backing: BufferBacking,
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let BufferBacking::Gl { backend, name } = &self.backing {
            backend.destroy_buffer(*name);
        }
    }
}

pub struct Renderer {
    features: FeatureSet,
    gl: Option<Arc<dyn GlBackend>>,
    vk: Option<Arc<dyn VkBackend>>,
    magma: Option<Arc<dyn MagmaBackend>>,
    memory_properties: Option<EmulatedPhysicalDeviceMemoryProperties>,
    external_objects: Arc<ExternalObjectManager>,

    color_buffers: Mutex<Map<u32, ColorBufferEntry>>,
    /// Color buffer references taken by each guest process, released when it goes away.
    process_color_buffers: Mutex<Map<u64, Vec<u32>>>,
    next_color_buffer: AtomicU32,
    buffers: Mutex<Map<u32, HostBuffer>>,

    vk_state: Mutex<VkGlobalState>,
    qsri_timelines: Mutex<Map<u64, Arc<VkQsriTimeline>>>,

    render_threads: Mutex<Map<u64, RenderThreadControl>>,
    next_render_thread: AtomicU64,
    next_puid: AtomicU64,
    stopped: AtomicBool,

    // Workers are dropped last so queued callbacks still see the registries.
    sync_worker: CallbackWorker,
    cleanup_worker: CallbackWorker,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> GfxstreamResult<Arc<Renderer>> {
        let memory_properties = match &config.vk {
            Some(vk) => Some(EmulatedPhysicalDeviceMemoryProperties::new(
                vk.memory_properties(),
                vk.color_buffer_memory_type_index(),
                &config.features,
            )?),
            None => None,
        };

        info!(
            "renderer: gles {} vulkan {} magma {}",
            config.gl.is_some(),
            config.vk.is_some(),
            config.magma.is_some()
        );

        Ok(Arc::new(Renderer {
            features: config.features,
            gl: config.gl,
            vk: config.vk,
            magma: config.magma,
            memory_properties,
            external_objects: config.external_objects,
            color_buffers: Mutex::new(Map::new()),
            process_color_buffers: Mutex::new(Map::new()),
            next_color_buffer: AtomicU32::new(0x10000),
            buffers: Mutex::new(Map::new()),
            vk_state: Mutex::new(VkGlobalState::new()),
            qsri_timelines: Mutex::new(Map::new()),
            render_threads: Mutex::new(Map::new()),
            next_render_thread: AtomicU64::new(1),
            next_puid: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            sync_worker: CallbackWorker::new("gfxstream-sync")?,
            cleanup_worker: CallbackWorker::new("gfxstream-cleanup")?,
        }))
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn gl(&self) -> Option<&Arc<dyn GlBackend>> {
        self.gl.as_ref()
    }

    pub fn vk(&self) -> Option<&Arc<dyn VkBackend>> {
        self.vk.as_ref()
    }

    pub fn magma(&self) -> Option<&Arc<dyn MagmaBackend>> {
        self.magma.as_ref()
    }

    pub fn memory_properties(&self) -> Option<&EmulatedPhysicalDeviceMemoryProperties> {
        self.memory_properties.as_ref()
    }

    pub fn external_objects(&self) -> &Arc<ExternalObjectManager> {
        &self.external_objects
    }

    /// The extension string answered to `rcGetHostExtensionsString`.
    pub fn host_extensions(&self) -> String {
        host_extension_string(&self.features)
    }

    pub fn gen_puid(&self) -> u64 {
        self.next_puid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn vk_state(&self) -> MutexGuard<'_, VkGlobalState> {
        self.vk_state.lock().unwrap()
    }

    /// Creates a color buffer holding one reference.  `handle` of `None` picks a free handle.
    pub fn create_color_buffer(
        &self,
        handle: Option<u32>,
        width: u32,
        height: u32,
        format: u32,
        fwk_format: FrameworkFormat,
    ) -> GfxstreamResult<u32> {
        let mut color_buffers = self.color_buffers.lock().unwrap();
        let handle = match handle {
            Some(h) if color_buffers.contains_key(&h) => {
                return Err(GfxstreamError::AlreadyInUse);
            }
            Some(h) => h,
            None => loop {
                let h = self.next_color_buffer.fetch_add(1, Ordering::SeqCst);
                if h != 0 && !color_buffers.contains_key(&h) {
                    break h;
                }
            },
        };

        let color_buffer = ColorBuffer::create(
            handle,
            width,
            height,
            format,
            fwk_format,
            self.gl.clone(),
            self.vk.clone(),
        )?;
        color_buffers.insert(
            handle,
            ColorBufferEntry {
                color_buffer: Arc::new(color_buffer),
                refcount: 1,
            },
        );
        Ok(handle)
    }

    pub fn color_buffer(&self, handle: u32) -> GfxstreamResult<Arc<ColorBuffer>> {
        self.color_buffers
            .lock()
            .unwrap()
            .get(&handle)
            .map(|entry| entry.color_buffer.clone())
            .ok_or(GfxstreamError::InvalidColorBuffer(handle))
    }

    pub fn color_buffer_count(&self) -> usize {
        self.color_buffers.lock().unwrap().len()
    }

    /// Takes a reference on behalf of `puid`.  A `puid` of 0 is not tracked.
    pub fn open_color_buffer(&self, handle: u32, puid: u64) -> GfxstreamResult<()> {
        {
            let mut color_buffers = self.color_buffers.lock().unwrap();
            let entry = color_buffers
                .get_mut(&handle)
                .ok_or(GfxstreamError::InvalidColorBuffer(handle))?;
            entry.refcount += 1;
        }
        self.track_color_buffer(handle, puid);
        Ok(())
    }

    pub(crate) fn track_color_buffer(&self, handle: u32, puid: u64) {
        if puid != 0 {
            self.process_color_buffers
                .lock()
                .unwrap()
                .entry(puid)
                .or_default()
                .push(handle);
        }
    }

    /// Drops one reference.  The color buffer is destroyed with its last reference.
    pub fn close_color_buffer(&self, handle: u32, puid: u64) -> GfxstreamResult<()> {
        if puid != 0 {
            if let Some(handles) = self.process_color_buffers.lock().unwrap().get_mut(&puid) {
                if let Some(pos) = handles.iter().position(|h| *h == handle) {
                    handles.swap_remove(pos);
                }
            }
        }

        let removed = {
            let mut color_buffers = self.color_buffers.lock().unwrap();
            let entry = color_buffers
                .get_mut(&handle)
                .ok_or(GfxstreamError::InvalidColorBuffer(handle))?;
            entry.refcount -= 1;
            if entry.refcount == 0 {
                color_buffers.remove(&handle)
            } else {
                None
            }
        };

        // Destroyed outside the registry lock; back-end teardown may be slow.
        if removed.is_some() {
            debug!("color buffer {} destroyed", handle);
        }
        drop(removed);
        Ok(())
    }

    pub fn read_color_buffer(
        &self,
        handle: u32,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        out: &mut [u8],
    ) -> GfxstreamResult<()> {
        self.color_buffer(handle)?.read_to_bytes(x, y, w, h, out)
    }

    pub fn update_color_buffer(
        &self,
        handle: u32,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        bytes: &[u8],
    ) -> GfxstreamResult<()> {
        self.color_buffer(handle)?.update_from_bytes(x, y, w, h, bytes)
    }

    /// Exports the memory behind a color buffer so it can back a blob resource.
    pub fn export_color_buffer(&self, handle: u32) -> GfxstreamResult<BlobDescriptorInfo> {
        let color_buffer = self.color_buffer(handle)?;
        let vk = self.vk.as_ref().ok_or(GfxstreamError::Unsupported)?;
        let image = color_buffer.vk_image().ok_or(GfxstreamError::Unsupported)?;
        let export = vk
            .export_image_memory(image)
            .ok_or(GfxstreamError::Unsupported)?;

        let memory_idx = self
            .memory_properties
            .as_ref()
            .map(|m| m.guest_color_buffer_memory_type_index())
            .unwrap_or(0);
        Ok(BlobDescriptorInfo {
            descriptor: export.handle.os_handle,
            handle_type: export.handle.handle_type,
            caching: GFXSTREAM_MAP_CACHE_CACHED,
            vulkan_info: Some(VulkanInfo {
                memory_idx,
                device_memory_size: export.size,
                dedicated: true,
            }),
        })
    }

    /// Buffers live in GL when the GL back-end can hold them and nothing needs to export them,
    /// otherwise in host shared memory.
    pub fn create_buffer(&self, handle: u32, size: u64) -> GfxstreamResult<()> {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.contains_key(&handle) {
            return Err(GfxstreamError::AlreadyInUse);
        }

        let backing = match &self.gl {
            Some(gl) if !self.features.is_enabled(Feature::ExternalBlob) => BufferBacking::Gl {
                backend: gl.clone(),
                name: gl.create_buffer(size)?,
            },
            _ => {
                let shm = SharedMemory::new(format!("gfxstream-buffer-{}", handle), size)?;
                let mapping = MemoryMapping::from_safe_descriptor(
                    shm.try_clone_descriptor()?,
                    size.try_into()?,
                    GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW,
                )?;
                BufferBacking::Shared { shm, mapping }
            }
        };

        buffers.insert(handle, HostBuffer { size, backing });
        Ok(())
    }

    pub fn close_buffer(&self, handle: u32) -> GfxstreamResult<()> {
        self.buffers
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or(GfxstreamError::InvalidResourceId)
    }

    pub fn buffer_size(&self, handle: u32) -> GfxstreamResult<u64> {
        self.buffers
            .lock()
            .unwrap()
            .get(&handle)
            .map(|b| b.size)
            .ok_or(GfxstreamError::InvalidResourceId)
    }

    pub fn read_buffer(&self, handle: u32, offset: u64, out: &mut [u8]) -> GfxstreamResult<()> {
        let buffers = self.buffers.lock().unwrap();
        let buffer = buffers
            .get(&handle)
            .ok_or(GfxstreamError::InvalidResourceId)?;
        let end = offset
            .checked_add(out.len() as u64)
            .filter(|end| *end <= buffer.size)
            .ok_or(GfxstreamError::InvalidIovec)?;

        match &buffer.backing {
            BufferBacking::Gl { backend, name } => backend.read_buffer(*name, offset, out),
            BufferBacking::Shared { mapping, .. } => {
                // Safe because the buffer registry lock serializes access to the mapping.
                let bytes = unsafe { mapping.as_slice() };
                out.copy_from_slice(&bytes[offset as usize..end as usize]);
                Ok(())
            }
        }
    }

    pub fn update_buffer(&self, handle: u32, offset: u64, bytes: &[u8]) -> GfxstreamResult<()> {
        let buffers = self.buffers.lock().unwrap();
        let buffer = buffers
            .get(&handle)
            .ok_or(GfxstreamError::InvalidResourceId)?;
        let end = offset
            .checked_add(bytes.len() as u64)
            .filter(|end| *end <= buffer.size)
            .ok_or(GfxstreamError::InvalidIovec)?;

        match &buffer.backing {
            BufferBacking::Gl { backend, name } => backend.update_buffer(*name, offset, bytes),
            BufferBacking::Shared { mapping, .. } => {
                // Safe because the buffer registry lock serializes access to the mapping.
                let dst = unsafe { mapping.as_mut_slice() };
                dst[offset as usize..end as usize].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    pub fn export_buffer(&self, handle: u32) -> GfxstreamResult<BlobDescriptorInfo> {
        let buffers = self.buffers.lock().unwrap();
        let buffer = buffers
            .get(&handle)
            .ok_or(GfxstreamError::InvalidResourceId)?;
        match &buffer.backing {
            BufferBacking::Shared { shm, mapping } => Ok(BlobDescriptorInfo {
                descriptor: shm.try_clone_descriptor()?,
                handle_type: GFXSTREAM_MEM_HANDLE_TYPE_SHM,
                caching: GFXSTREAM_MAP_CACHE_CACHED,
                vulkan_info: Some(VulkanInfo {
                    memory_idx: 0,
                    device_memory_size: mapping.size() as u64,
                    dedicated: false,
                }),
            }),
            BufferBacking::Gl { .. } => Err(GfxstreamError::Unsupported),
        }
    }

    /// Runs `callback` once the GL sync object `sync` has signaled.
    pub fn async_wait_for_gpu_with_cb(
        &self,
        sync: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> GfxstreamResult<()> {
        let gl = self.gl.clone().ok_or(GfxstreamError::Unsupported)?;
        self.sync_worker.enqueue(move || {
            if let Err(e) = gl.client_wait_sync(sync) {
                error!("wait on GL sync {:#x} failed: {}", sync, e);
            }
            callback();
        })
    }

    /// Runs `callback` once the Vulkan fence has signaled.
    pub fn async_wait_for_gpu_vulkan_with_cb(
        &self,
        device: u64,
        fence: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> GfxstreamResult<()> {
        let vk = self.vk.clone().ok_or(GfxstreamError::Unsupported)?;
        let (device, fence) = {
            let state = self.vk_state();
            (state.unbox(device).unwrap_or(device), fence)
        };
        self.sync_worker.enqueue(move || {
            if let Err(e) = vk.wait_fence(device, fence) {
                error!("wait on Vulkan fence {:#x} failed: {}", fence, e);
            }
            callback();
        })
    }

    fn qsri_timeline(&self, image: u64) -> Arc<VkQsriTimeline> {
        self.qsri_timelines
            .lock()
            .unwrap()
            .entry(image)
            .or_insert_with(|| Arc::new(VkQsriTimeline::new()))
            .clone()
    }

    /// Runs `callback` once the image's next outstanding release has been presented.
    pub fn async_wait_for_gpu_vulkan_qsri_with_cb(
        &self,
        image: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> GfxstreamResult<()> {
        if self.vk.is_none() {
            return Err(GfxstreamError::Unsupported);
        }
        self.qsri_timeline(image)
            .register_callback_to_next_present_and_poll(Box::new(callback));
        Ok(())
    }

    /// Records one release of `image` back to the presentation engine.
    pub fn signal_qsri(&self, image: u64) {
        self.qsri_timeline(image).signal_next_present_and_poll();
    }

    /// Forgets the image's timeline.  Callbacks still pending are fired.
    pub fn destroy_qsri_timeline(&self, image: u64) {
        let timeline = self.qsri_timelines.lock().unwrap().remove(&image);
        drop(timeline);
    }

    /// Releases everything guest process `puid` still holds.  Runs on the cleanup worker.
    pub fn cleanup_process(self: &Arc<Self>, puid: u64) {
        if puid == 0 {
            return;
        }
        // Weak so the worker never ends up holding the last reference to its own owner.
        let renderer = Arc::downgrade(self);
        let result = self.cleanup_worker.enqueue(move || {
            let renderer = match renderer.upgrade() {
                Some(r) => r,
                None => return,
            };
            let handles = renderer
                .process_color_buffers
                .lock()
                .unwrap()
                .remove(&puid)
                .unwrap_or_default();
            debug!(
                "process {:#x} exited, releasing {} color buffer references",
                puid,
                handles.len()
            );
            for handle in handles {
                if let Err(e) = renderer.close_color_buffer(handle, 0) {
                    warn!("process {:#x} cleanup: {}", puid, e);
                }
            }
        });
        if let Err(e) = result {
            error!("failed to queue cleanup for process {:#x}: {}", puid, e);
        }
    }

    /// Blocks until queued cleanups and waits have run.
    pub fn wait_for_workers(&self) -> GfxstreamResult<()> {
        self.sync_worker.wait_idle()?;
        self.cleanup_worker.wait_idle()
    }

    pub fn register_render_thread(&self, control: RenderThreadControl) -> u64 {
        let id = self.next_render_thread.fetch_add(1, Ordering::SeqCst);
        self.render_threads.lock().unwrap().insert(id, control);
        id
    }

    pub fn unregister_render_thread(&self, id: u64) {
        self.render_threads.lock().unwrap().remove(&id);
    }

    pub fn render_thread_count(&self) -> usize {
        self.render_threads.lock().unwrap().len()
    }

    pub fn for_all_render_threads(&self, mut f: impl FnMut(u64, &RenderThreadControl)) {
        for (id, control) in self.render_threads.lock().unwrap().iter() {
            f(*id, control);
        }
    }

    /// Parks every render thread at its next packet boundary.  Threads resume when the guards
    /// are dropped.
    pub fn pause_all_render_threads(&self) -> GfxstreamResult<Map<u64, PauseGuard>> {
        let mut controls: Vec<(u64, RenderThreadControl)> = Vec::new();
        self.for_all_render_threads(|id, control| controls.push((id, control.clone())));

        let mut guards = Map::new();
        for (id, control) in controls {
            match control.pause(PAUSE_TIMEOUT) {
                Ok(guard) => {
                    guards.insert(id, guard);
                }
                // Threads that exited meanwhile have nothing to save.
                Err(GfxstreamError::BrokenPromise) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(guards)
    }

    /// Asks every render thread to exit; with `wait`, blocks until they have.
    pub fn stop(&self, wait: bool) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut controls: Vec<RenderThreadControl> = Vec::new();
        self.for_all_render_threads(|_, control| controls.push(control.clone()));
        for control in &controls {
            control.stop();
        }
        if wait {
            for control in &controls {
                control.wait_exit();
            }
        }
    }

    /// Memory properties, the Vulkan reconstruction log with object owners, color buffers.  Render
    /// threads must be paused.
    pub fn save_snapshot(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        match &self.memory_properties {
            Some(props) => {
                snapshot_io::write(w, 1u32)?;
                props.save(w)?;
            }
            None => snapshot_io::write(w, 0u32)?,
        }

        let vk_state = self.vk_state();
        snapshot_io::write_bytes(w, &vk_state.save_replay_buffers())?;
        vk_state.save_owners(w)?;
        drop(vk_state);

        let color_buffers: Vec<(Arc<ColorBuffer>, u32)> = self
            .color_buffers
            .lock()
            .unwrap()
            .values()
            .map(|e| (e.color_buffer.clone(), e.refcount))
            .collect();
        snapshot_io::write(w, color_buffers.len() as u32)?;
        for (color_buffer, refcount) in color_buffers {
            snapshot_io::write(w, refcount)?;
            color_buffer.save(w)?;
        }

        let process_color_buffers: Vec<(u64, Vec<u32>)> = self
            .process_color_buffers
            .lock()
            .unwrap()
            .iter()
            .map(|(puid, handles)| (*puid, handles.clone()))
            .collect();
        snapshot_io::write(w, process_color_buffers.len() as u32)?;
        for (puid, handles) in process_color_buffers {
            snapshot_io::write(w, puid)?;
            snapshot_io::write_bytes(w, handles.as_slice().as_bytes())?;
        }
        snapshot_io::write(w, self.next_puid.load(Ordering::SeqCst))
    }

    pub fn load_snapshot(self: &Arc<Self>, r: &mut dyn Read) -> GfxstreamResult<()> {
        let has_props: u32 = snapshot_io::read(r)?;
        match (&self.memory_properties, has_props) {
            (Some(props), 1) => props.verify_snapshot(r)?,
            (None, 0) => (),
            _ => {
                return Err(GfxstreamError::SnapshotMismatch(
                    "snapshot and host disagree on Vulkan support".to_string(),
                ))
            }
        }

        let replay = snapshot_io::read_bytes(r)?;
        crate::server::vulkan::replay(self, &replay)?;
        let owners = VkGlobalState::load_owners(r)?;
        self.vk_state().restore_owners(owners);

        let count: u32 = snapshot_io::read(r)?;
        for _ in 0..count {
            let refcount: u32 = snapshot_io::read(r)?;
            let color_buffer = ColorBuffer::load(r, self.gl.clone(), self.vk.clone())?;
            let handle = color_buffer.handle();
            self.color_buffers.lock().unwrap().insert(
                handle,
                ColorBufferEntry {
                    color_buffer: Arc::new(color_buffer),
                    refcount,
                },
            );
        }

        let processes: u32 = snapshot_io::read(r)?;
        for _ in 0..processes {
            let puid: u64 = snapshot_io::read(r)?;
            let raw = snapshot_io::read_bytes(r)?;
            let handles = raw
                .chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            self.process_color_buffers
                .lock()
                .unwrap()
                .insert(puid, handles);
        }

        let next_puid: u64 = snapshot_io::read(r)?;
        self.next_puid.store(next_puid, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
        let remaining = self.render_threads.get_mut().map(|t| t.len()).unwrap_or(0);
        if remaining != 0 {
            warn!("renderer dropped with {} live render threads", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;

    use super::*;
    use crate::backend::StubGlBackend;
    use crate::backend::StubVkBackend;
    use crate::formats::GL_RGBA;

    fn renderer(features: FeatureSet) -> Arc<Renderer> {
        Renderer::new(RendererConfig {
            features,
            gl: Some(Arc::new(StubGlBackend::new())),
            vk: Some(Arc::new(StubVkBackend::new())),
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap()
    }

    #[test]
    fn color_buffer_refcounts() {
        let r = renderer(FeatureSet::new());
        let handle = r
            .create_color_buffer(None, 4, 4, GL_RGBA, FrameworkFormat::GlCompatible)
            .unwrap();
        r.open_color_buffer(handle, 7).unwrap();
        r.close_color_buffer(handle, 0).unwrap();
        assert_eq!(r.color_buffer_count(), 1);

        // Process 7 exits without closing its reference.
        r.cleanup_process(7);
        r.wait_for_workers().unwrap();
        assert_eq!(r.color_buffer_count(), 0);
        assert!(r.close_color_buffer(handle, 0).is_err());
    }

    #[test]
    fn explicit_handles_must_be_free() {
        let r = renderer(FeatureSet::new());
        r.create_color_buffer(Some(5), 1, 1, GL_RGBA, FrameworkFormat::GlCompatible)
            .unwrap();
        assert!(matches!(
            r.create_color_buffer(Some(5), 1, 1, GL_RGBA, FrameworkFormat::GlCompatible),
            Err(GfxstreamError::AlreadyInUse)
        ));
    }

    #[test]
    fn buffers_and_export() {
        let mut features = FeatureSet::new();
        features.set(Feature::ExternalBlob, true);
        let r = renderer(features);
        r.create_buffer(3, 64).unwrap();
        r.update_buffer(3, 8, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        r.read_buffer(3, 8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(r.update_buffer(3, 63, &[1, 2]).is_err());

        let info = r.export_buffer(3).unwrap();
        assert_eq!(info.handle_type, GFXSTREAM_MEM_HANDLE_TYPE_SHM);
        r.close_buffer(3).unwrap();
        assert!(r.close_buffer(3).is_err());
    }

    #[test]
    fn qsri_waits_follow_presents() {
        let r = renderer(FeatureSet::new());
        let (tx, rx) = channel();
        let first = tx.clone();
        r.async_wait_for_gpu_vulkan_qsri_with_cb(9, move || first.send(1).unwrap())
            .unwrap();
        assert!(rx.try_recv().is_err());
        r.signal_qsri(9);
        assert_eq!(rx.try_recv().unwrap(), 1);

        // A release that was already presented completes immediately.
        r.signal_qsri(9);
        r.async_wait_for_gpu_vulkan_qsri_with_cb(9, move || tx.send(2).unwrap())
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), 2);
    }

    #[test]
    fn gl_sync_waits_run_on_the_sync_worker() {
        let r = renderer(FeatureSet::new());
        let (tx, rx) = channel();
        r.async_wait_for_gpu_with_cb(0x42, move || tx.send(()).unwrap())
            .unwrap();
        r.wait_for_workers().unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn snapshot_round_trip_keeps_color_buffers() {
        let r = renderer(FeatureSet::new());
        let handle = r
            .create_color_buffer(None, 1, 1, GL_RGBA, FrameworkFormat::GlCompatible)
            .unwrap();
        r.update_color_buffer(handle, 0, 0, 1, 1, &[1, 2, 3, 4]).unwrap();

        let mut saved = Vec::new();
        r.save_snapshot(&mut saved).unwrap();

        let restored = renderer(FeatureSet::new());
        let mut reader = saved.as_slice();
        restored.load_snapshot(&mut reader).unwrap();
        snapshot_io::expect_eof(&mut reader).unwrap();

        let mut out = [0u8; 4];
        restored
            .read_color_buffer(handle, 0, 0, 1, 1, &mut out)
            .unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }
}
