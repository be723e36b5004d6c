// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software back-ends that keep every object in host memory.  They let the whole host core run
//! without a GPU; the Vulkan one can optionally export image memory through shared memory so
//! that the GL one can import it.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet;
use std::sync::Mutex;

use log::warn;

use crate::backend::*;
use crate::formats::gl_format_bytes_per_pixel;
use crate::gfxstream_os::MappedRegion;
use crate::gfxstream_os::MemoryMapping;
use crate::gfxstream_os::SharedMemory;
use crate::gfxstream_utils::*;
use crate::memory_properties::MemoryHeap;
use crate::memory_properties::MemoryHeapFlags;
use crate::memory_properties::MemoryPropertyFlags;
use crate::memory_properties::MemoryRequirements;
use crate::memory_properties::MemoryType;
use crate::memory_properties::PhysicalDeviceMemoryProperties;

const MAX_ALLOCATION: u64 = 1 << 30;

enum Storage {
    Owned(Vec<u8>),
    Shared(MemoryMapping),
}

impl Storage {
    fn bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v,
            // Safe because accesses are serialized by the owning back-end's lock.
            Storage::Shared(m) => unsafe { m.as_slice() },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(v) => v,
            // Safe because accesses are serialized by the owning back-end's lock.
            Storage::Shared(m) => unsafe { m.as_mut_slice() },
        }
    }
}

fn map_export(memory: &MemoryExport) -> GfxstreamResult<MemoryMapping> {
    let handle = memory.handle.try_clone()?;
    MemoryMapping::from_safe_descriptor(
        handle.os_handle,
        memory.size.try_into()?,
        GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW,
    )
}

struct Texture {
    width: u32,
    height: u32,
    bpp: u32,
    storage: Storage,
}

impl Texture {
    fn rect_range(&self, x: u32, y: u32, w: u32, h: u32, len: usize) -> GfxstreamResult<()> {
        if x as u64 + w as u64 > self.width as u64 || y as u64 + h as u64 > self.height as u64 {
            return Err(GfxstreamError::BackendFailure(GL_INVALID_VALUE as i32));
        }
        if len < (w * h * self.bpp) as usize {
            return Err(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32));
        }
        Ok(())
    }
}

#[derive(Default)]
struct GlState {
    next_name: u32,
    textures: Map<u32, Texture>,
    buffers: Map<u32, Vec<u8>>,
}

impl GlState {
    fn gen_name(&mut self) -> u32 {
        self.next_name += 1;
        self.next_name
    }
}

#[derive(Default)]
pub struct StubGlBackend {
    state: Mutex<GlState>,
}

impl StubGlBackend {
    pub fn new() -> StubGlBackend {
        Default::default()
    }

    pub fn texture_count(&self) -> usize {
        self.state.lock().unwrap().textures.len()
    }
}

impl GlBackend for StubGlBackend {
    fn renderer_strings(&self) -> (String, String, String) {
        (
            "Google (Stub)".to_string(),
            "Stub GLES renderer".to_string(),
            "OpenGL ES 3.0 (stub)".to_string(),
        )
    }

    fn create_texture(&self, width: u32, height: u32, internal_format: u32) -> GfxstreamResult<u32> {
        let bpp = gl_format_bytes_per_pixel(internal_format);
        let size = width as u64 * height as u64 * bpp as u64;
        if size > MAX_ALLOCATION {
            return Err(GfxstreamError::BackendFailure(GL_OUT_OF_MEMORY as i32));
        }

        let mut state = self.state.lock().unwrap();
        let name = state.gen_name();
        state.textures.insert(
            name,
            Texture {
                width,
                height,
                bpp,
                storage: Storage::Owned(vec![0; size as usize]),
            },
        );
        Ok(name)
    }

    fn destroy_texture(&self, texture: u32) {
        if self.state.lock().unwrap().textures.remove(&texture).is_none() {
            warn!("destroying unknown texture {}", texture);
        }
    }

    fn read_texture(
        &self,
        texture: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
    ) -> GfxstreamResult<()> {
        let state = self.state.lock().unwrap();
        let tex = state
            .textures
            .get(&texture)
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32))?;
        tex.rect_range(x, y, width, height, out.len())?;

        let stride = (tex.width * tex.bpp) as usize;
        let row = (width * tex.bpp) as usize;
        let src = tex.storage.bytes();
        for r in 0..height as usize {
            let start = (y as usize + r) * stride + (x * tex.bpp) as usize;
            out[r * row..(r + 1) * row].copy_from_slice(&src[start..start + row]);
        }
        Ok(())
    }

    fn update_texture(
        &self,
        texture: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> GfxstreamResult<()> {
        let mut state = self.state.lock().unwrap();
        let tex = state
            .textures
            .get_mut(&texture)
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32))?;
        tex.rect_range(x, y, width, height, pixels.len())?;

        let stride = (tex.width * tex.bpp) as usize;
        let row = (width * tex.bpp) as usize;
        let bpp = tex.bpp;
        let dst = tex.storage.bytes_mut();
        for r in 0..height as usize {
            let start = (y as usize + r) * stride + (x * bpp) as usize;
            dst[start..start + row].copy_from_slice(&pixels[r * row..(r + 1) * row]);
        }
        Ok(())
    }

    fn import_memory(&self, texture: u32, memory: &MemoryExport) -> GfxstreamResult<()> {
        let mut state = self.state.lock().unwrap();
        let tex = state
            .textures
            .get_mut(&texture)
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32))?;

        let needed = tex.width as u64 * tex.height as u64 * tex.bpp as u64;
        if memory.size < needed {
            return Err(GfxstreamError::BackendFailure(GL_INVALID_VALUE as i32));
        }
        tex.storage = Storage::Shared(map_export(memory)?);
        Ok(())
    }

    fn create_buffer(&self, size: u64) -> GfxstreamResult<u32> {
        if size > MAX_ALLOCATION {
            return Err(GfxstreamError::BackendFailure(GL_OUT_OF_MEMORY as i32));
        }
        let mut state = self.state.lock().unwrap();
        let name = state.gen_name();
        state.buffers.insert(name, vec![0; size as usize]);
        Ok(name)
    }

    fn destroy_buffer(&self, buffer: u32) {
        self.state.lock().unwrap().buffers.remove(&buffer);
    }

    fn read_buffer(&self, buffer: u32, offset: u64, out: &mut [u8]) -> GfxstreamResult<()> {
        let state = self.state.lock().unwrap();
        let data = state
            .buffers
            .get(&buffer)
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32))?;
        let start = offset as usize;
        let end = start
            .checked_add(out.len())
            .filter(|end| *end <= data.len())
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_VALUE as i32))?;
        out.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn update_buffer(&self, buffer: u32, offset: u64, bytes: &[u8]) -> GfxstreamResult<()> {
        let mut state = self.state.lock().unwrap();
        let data = state
            .buffers
            .get_mut(&buffer)
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_OPERATION as i32))?;
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= data.len())
            .ok_or(GfxstreamError::BackendFailure(GL_INVALID_VALUE as i32))?;
        data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

struct VkMemory {
    device: u64,
    size: u64,
}

struct VkBuffer {
    device: u64,
    size: u64,
    bound: Option<(u64, u64)>,
}

struct VkImage {
    storage: Storage,
    shm: Option<SharedMemory>,
}

#[derive(Default)]
struct VkState {
    next_handle: u64,
    instances: BTreeSet<u64>,
    devices: Map<u64, u64>,
    memories: Map<u64, VkMemory>,
    buffers: Map<u64, VkBuffer>,
    images: Map<u64, VkImage>,
}

impl VkState {
    fn gen_handle(&mut self) -> u64 {
        self.next_handle += 1;
        0x1000 + self.next_handle
    }
}

fn vk_error(code: i32) -> GfxstreamError {
    GfxstreamError::BackendFailure(code)
}

const STUB_BUFFER_ALIGNMENT: u64 = 256;

/// Three memory types: device local, host visible coherent, and a cached type that is both.
pub struct StubVkBackend {
    state: Mutex<VkState>,
    external_memory: bool,
}

impl StubVkBackend {
    pub fn new() -> StubVkBackend {
        StubVkBackend {
            state: Mutex::new(Default::default()),
            external_memory: false,
        }
    }

    /// Back color buffer images with shared memory that can be exported to GL.
    pub fn with_external_memory(mut self, v: bool) -> StubVkBackend {
        self.external_memory = v;
        self
    }

    pub fn live_objects(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.instances.len()
            + state.devices.len()
            + state.memories.len()
            + state.buffers.len()
            + state.images.len()
    }
}

impl Default for StubVkBackend {
    fn default() -> StubVkBackend {
        StubVkBackend::new()
    }
}

impl VkBackend for StubVkBackend {
    fn memory_properties(&self) -> PhysicalDeviceMemoryProperties {
        PhysicalDeviceMemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 0,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 8 << 30,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: 4 << 30,
                    flags: MemoryHeapFlags::empty(),
                },
            ],
        }
    }

    fn color_buffer_memory_type_index(&self) -> u32 {
        0
    }

    fn create_instance(&self) -> GfxstreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        let instance = state.gen_handle();
        state.instances.insert(instance);
        Ok(instance)
    }

    fn destroy_instance(&self, instance: u64) {
        self.state.lock().unwrap().instances.remove(&instance);
    }

    fn create_device(&self, instance: u64) -> GfxstreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        if !state.instances.contains(&instance) {
            return Err(vk_error(VK_ERROR_INITIALIZATION_FAILED));
        }
        let device = state.gen_handle();
        state.devices.insert(device, instance);
        Ok(device)
    }

    fn destroy_device(&self, device: u64) {
        self.state.lock().unwrap().devices.remove(&device);
    }

    fn allocate_memory(
        &self,
        device: u64,
        size: u64,
        host_type_index: u32,
    ) -> GfxstreamResult<u64> {
        let props = self.memory_properties();
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(&device) {
            return Err(vk_error(VK_ERROR_DEVICE_LOST));
        }
        if host_type_index as usize >= props.memory_types.len() || size > MAX_ALLOCATION {
            return Err(vk_error(VK_ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let memory = state.gen_handle();
        state.memories.insert(memory, VkMemory { device, size });
        Ok(memory)
    }

    fn free_memory(&self, _device: u64, memory: u64) {
        self.state.lock().unwrap().memories.remove(&memory);
    }

    fn create_buffer(&self, device: u64, size: u64) -> GfxstreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        if !state.devices.contains_key(&device) {
            return Err(vk_error(VK_ERROR_DEVICE_LOST));
        }
        let buffer = state.gen_handle();
        state.buffers.insert(
            buffer,
            VkBuffer {
                device,
                size,
                bound: None,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, _device: u64, buffer: u64) {
        self.state.lock().unwrap().buffers.remove(&buffer);
    }

    fn buffer_memory_requirements(
        &self,
        device: u64,
        buffer: u64,
    ) -> GfxstreamResult<MemoryRequirements> {
        let state = self.state.lock().unwrap();
        let b = state
            .buffers
            .get(&buffer)
            .filter(|b| b.device == device)
            .ok_or(vk_error(VK_ERROR_INITIALIZATION_FAILED))?;
        let size = (b.size + STUB_BUFFER_ALIGNMENT - 1) / STUB_BUFFER_ALIGNMENT
            * STUB_BUFFER_ALIGNMENT;
        Ok(MemoryRequirements {
            size,
            alignment: STUB_BUFFER_ALIGNMENT,
            memory_type_bits: 0b111,
        })
    }

    fn bind_buffer_memory(
        &self,
        device: u64,
        buffer: u64,
        memory: u64,
        offset: u64,
    ) -> GfxstreamResult<()> {
        let mut state = self.state.lock().unwrap();
        let memory_size = state
            .memories
            .get(&memory)
            .filter(|m| m.device == device)
            .map(|m| m.size)
            .ok_or(vk_error(VK_ERROR_INITIALIZATION_FAILED))?;
        let b = state
            .buffers
            .get_mut(&buffer)
            .filter(|b| b.device == device)
            .ok_or(vk_error(VK_ERROR_INITIALIZATION_FAILED))?;
        if b.bound.is_some() || offset.saturating_add(b.size) > memory_size {
            return Err(vk_error(VK_ERROR_OUT_OF_DEVICE_MEMORY));
        }
        b.bound = Some((memory, offset));
        Ok(())
    }

    fn create_image(&self, _width: u32, _height: u32, size: usize) -> GfxstreamResult<u64> {
        if size as u64 > MAX_ALLOCATION {
            return Err(vk_error(VK_ERROR_OUT_OF_DEVICE_MEMORY));
        }

        let image = if self.external_memory {
            let mut state = self.state.lock().unwrap();
            let handle = state.gen_handle();
            let shm = SharedMemory::new(format!("stub-vk-image-{}", handle), size as u64)?;
            let mapping = MemoryMapping::from_safe_descriptor(
                shm.try_clone_descriptor()?,
                size,
                GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW,
            )?;
            state.images.insert(
                handle,
                VkImage {
                    storage: Storage::Shared(mapping),
                    shm: Some(shm),
                },
            );
            handle
        } else {
            let mut state = self.state.lock().unwrap();
            let handle = state.gen_handle();
            state.images.insert(
                handle,
                VkImage {
                    storage: Storage::Owned(vec![0; size]),
                    shm: None,
                },
            );
            handle
        };
        Ok(image)
    }

    fn destroy_image(&self, image: u64) {
        self.state.lock().unwrap().images.remove(&image);
    }

    fn read_image(&self, image: u64, out: &mut [u8]) -> GfxstreamResult<()> {
        let state = self.state.lock().unwrap();
        let img = state
            .images
            .get(&image)
            .ok_or(vk_error(VK_ERROR_INITIALIZATION_FAILED))?;
        let src = img.storage.bytes();
        if out.len() != src.len() {
            return Err(vk_error(VK_ERROR_INITIALIZATION_FAILED));
        }
        out.copy_from_slice(src);
        Ok(())
    }

    fn write_image(&self, image: u64, bytes: &[u8]) -> GfxstreamResult<()> {
        let mut state = self.state.lock().unwrap();
        let img = state
            .images
            .get_mut(&image)
            .ok_or(vk_error(VK_ERROR_INITIALIZATION_FAILED))?;
        let dst = img.storage.bytes_mut();
        if bytes.len() != dst.len() {
            return Err(vk_error(VK_ERROR_INITIALIZATION_FAILED));
        }
        dst.copy_from_slice(bytes);
        Ok(())
    }

    fn export_image_memory(&self, image: u64) -> Option<MemoryExport> {
        let state = self.state.lock().unwrap();
        let img = state.images.get(&image)?;
        let shm = img.shm.as_ref()?;
        let descriptor = shm.try_clone_descriptor().ok()?;
        Some(MemoryExport {
            handle: GfxstreamHandle {
                os_handle: descriptor,
                handle_type: GFXSTREAM_MEM_HANDLE_TYPE_OPAQUE_FD,
            },
            size: shm.size(),
            linear_tiling: true,
        })
    }
}

pub const MAGMA_QUERY_VENDOR_ID: u64 = 0;
pub const MAGMA_QUERY_DEVICE_ID: u64 = 1;

const STUB_MAGMA_VENDOR_ID: u64 = 0x1ae0;
const STUB_MAGMA_PAGE: u64 = 4096;

#[derive(Default)]
struct MagmaState {
    next_handle: u64,
    contexts: BTreeSet<u64>,
    buffers: Map<u64, u64>,
    semaphores: Map<u64, bool>,
}

impl MagmaState {
    fn gen_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Default)]
pub struct StubMagmaBackend {
    state: Mutex<MagmaState>,
}

impl StubMagmaBackend {
    pub fn new() -> StubMagmaBackend {
        Default::default()
    }
}

impl MagmaBackend for StubMagmaBackend {
    fn query(&self, query_id: u64) -> GfxstreamResult<u64> {
        match query_id {
            MAGMA_QUERY_VENDOR_ID => Ok(STUB_MAGMA_VENDOR_ID),
            MAGMA_QUERY_DEVICE_ID => Ok(1),
            _ => Err(GfxstreamError::BackendFailure(MAGMA_STATUS_INVALID_ARGS)),
        }
    }

    fn create_context(&self) -> GfxstreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        let context = state.gen_handle();
        state.contexts.insert(context);
        Ok(context)
    }

    fn release_context(&self, context: u64) {
        self.state.lock().unwrap().contexts.remove(&context);
    }

    fn create_buffer(&self, size: u64) -> GfxstreamResult<(u64, u64)> {
        if size == 0 || size > MAX_ALLOCATION {
            return Err(GfxstreamError::BackendFailure(MAGMA_STATUS_MEMORY_ERROR));
        }
        let actual = (size + STUB_MAGMA_PAGE - 1) / STUB_MAGMA_PAGE * STUB_MAGMA_PAGE;
        let mut state = self.state.lock().unwrap();
        let buffer = state.gen_handle();
        state.buffers.insert(buffer, actual);
        Ok((buffer, actual))
    }

    fn release_buffer(&self, buffer: u64) {
        self.state.lock().unwrap().buffers.remove(&buffer);
    }

    fn create_semaphore(&self) -> GfxstreamResult<u64> {
        let mut state = self.state.lock().unwrap();
        let semaphore = state.gen_handle();
        state.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn release_semaphore(&self, semaphore: u64) {
        self.state.lock().unwrap().semaphores.remove(&semaphore);
    }

    fn signal_semaphore(&self, semaphore: u64) {
        if let Some(s) = self.state.lock().unwrap().semaphores.get_mut(&semaphore) {
            *s = true;
        }
    }

    fn reset_semaphore(&self, semaphore: u64) {
        if let Some(s) = self.state.lock().unwrap().semaphores.get_mut(&semaphore) {
            *s = false;
        }
    }

    fn poll(&self, items: &mut [MagmaPollItem]) -> i32 {
        let state = self.state.lock().unwrap();
        let mut any = false;
        for item in items.iter_mut() {
            item.result = 0;
            if item.condition == MAGMA_POLL_CONDITION_SIGNALED
                && state.semaphores.get(&item.semaphore).copied().unwrap_or(false)
            {
                item.result = MAGMA_POLL_CONDITION_SIGNALED;
                any = true;
            }
        }
        if any {
            MAGMA_STATUS_OK
        } else {
            MAGMA_STATUS_TIMED_OUT
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::GL_RGBA;

    #[test]
    fn gl_texture_sub_rects() {
        let gl = StubGlBackend::new();
        let tex = gl.create_texture(2, 2, GL_RGBA).unwrap();
        gl.update_texture(tex, 1, 1, 1, 1, &[1, 2, 3, 4]).unwrap();

        let mut all = [0u8; 16];
        gl.read_texture(tex, 0, 0, 2, 2, &mut all).unwrap();
        assert_eq!(&all[12..], &[1, 2, 3, 4]);
        assert!(gl.update_texture(tex, 2, 0, 1, 1, &[0; 4]).is_err());

        gl.destroy_texture(tex);
        assert_eq!(gl.texture_count(), 0);
    }

    #[test]
    fn vk_export_is_visible_to_gl() {
        let vk = StubVkBackend::new().with_external_memory(true);
        let gl = StubGlBackend::new();

        let image = vk.create_image(2, 1, 8).unwrap();
        let tex = gl.create_texture(2, 1, GL_RGBA).unwrap();
        let export = vk.export_image_memory(image).unwrap();
        gl.import_memory(tex, &export).unwrap();

        vk.write_image(image, &[9, 8, 7, 6, 5, 4, 3, 2]).unwrap();
        let mut out = [0u8; 8];
        gl.read_texture(tex, 0, 0, 2, 1, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7, 6, 5, 4, 3, 2]);

        // Without external memory nothing is exported.
        let plain = StubVkBackend::new();
        let image = plain.create_image(2, 1, 8).unwrap();
        assert!(plain.export_image_memory(image).is_none());
    }

    #[test]
    fn vk_object_lifetimes() {
        let vk = StubVkBackend::new();
        assert!(vk.create_device(1).is_err());
        let instance = vk.create_instance().unwrap();
        let device = vk.create_device(instance).unwrap();
        let buffer = vk.create_buffer(device, 100).unwrap();
        let reqs = vk.buffer_memory_requirements(device, buffer).unwrap();
        assert_eq!(reqs.size, 256);
        let memory = vk.allocate_memory(device, reqs.size, 0).unwrap();
        vk.bind_buffer_memory(device, buffer, memory, 0).unwrap();
        assert!(vk.bind_buffer_memory(device, buffer, memory, 0).is_err());
        assert_eq!(vk.live_objects(), 4);
    }

    #[test]
    fn magma_poll_is_non_blocking() {
        let magma = StubMagmaBackend::new();
        let sem = magma.create_semaphore().unwrap();
        let mut items = [MagmaPollItem {
            semaphore: sem,
            condition: MAGMA_POLL_CONDITION_SIGNALED,
            result: 0,
        }];
        assert_eq!(magma.poll(&mut items), MAGMA_STATUS_TIMED_OUT);
        magma.signal_semaphore(sem);
        assert_eq!(magma.poll(&mut items), MAGMA_STATUS_OK);
        assert_eq!(items[0].result, MAGMA_POLL_CONDITION_SIGNALED);
        assert_eq!(magma.create_buffer(1).unwrap().1, 4096);
    }
}
