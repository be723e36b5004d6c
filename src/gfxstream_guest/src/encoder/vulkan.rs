// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use gfxstream_host::backend::VK_SUCCESS;
use gfxstream_host::server::vulkan::*;
use gfxstream_host::wire::Encoder;
use log::debug;

use crate::encoder::CallStream;
use crate::encoder::ReplyReader;
use crate::error::GuestResult;

/// Outcome of a Vulkan call: `VK_SUCCESS` or a negative `VkResult`.
pub type VkResult<T> = std::result::Result<T, i32>;

/// Memory type of a `vkGetPhysicalDeviceMemoryProperties` answer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VkMemoryType {
    pub property_flags: u32,
    pub heap_index: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VkMemoryHeap {
    pub size: u64,
    pub flags: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VkMemoryProperties {
    pub memory_types: Vec<VkMemoryType>,
    pub memory_heaps: Vec<VkMemoryHeap>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VkMemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

fn vk_result(result: i32) -> VkResult<()> {
    if result == VK_SUCCESS {
        Ok(())
    } else {
        Err(result)
    }
}

/// `{handle: u64, result: i32}` as returned by every create call.
fn created(r: &mut ReplyReader<'_>) -> GuestResult<VkResult<u64>> {
    let handle = r.get_u64()?;
    let result = r.get_i32()?;
    Ok(vk_result(result).map(|_| handle))
}

/// The Vulkan calls the render threads decode.  Handles are the host's boxed handles.
pub struct VkEncoder<'a> {
    calls: &'a mut CallStream,
}

impl<'a> VkEncoder<'a> {
    pub fn new(calls: &'a mut CallStream) -> VkEncoder<'a> {
        VkEncoder { calls }
    }

    pub fn create_instance(&mut self, application_name: &str) -> GuestResult<VkResult<u64>> {
        let opcode = OP_VK_CREATE_INSTANCE;
        let mut call = Encoder::new(opcode);
        call.put_string(application_name);
        self.calls.call(opcode, call, created)
    }

    pub fn destroy_instance(&mut self, instance: u64) -> GuestResult<()> {
        let mut call = Encoder::new(OP_VK_DESTROY_INSTANCE);
        call.put_u64(instance);
        self.calls.send(call)
    }

    pub fn get_physical_device_memory_properties(
        &mut self,
        instance: u64,
    ) -> GuestResult<VkMemoryProperties> {
        let opcode = OP_VK_GET_PHYSICAL_DEVICE_MEMORY_PROPERTIES;
        let mut call = Encoder::new(opcode);
        call.put_u64(instance);
        self.calls.call(opcode, call, |r| {
            let mut props = VkMemoryProperties::default();
            for _ in 0..r.get_u32()? {
                props.memory_types.push(VkMemoryType {
                    property_flags: r.get_u32()?,
                    heap_index: r.get_u32()?,
                });
            }
            for _ in 0..r.get_u32()? {
                props.memory_heaps.push(VkMemoryHeap {
                    size: r.get_u64()?,
                    flags: r.get_u32()?,
                });
            }
            Ok(props)
        })
    }

    pub fn create_device(&mut self, instance: u64) -> GuestResult<VkResult<u64>> {
        let opcode = OP_VK_CREATE_DEVICE;
        let mut call = Encoder::new(opcode);
        call.put_u64(instance);
        self.calls.call(opcode, call, created)
    }

    pub fn destroy_device(&mut self, device: u64) -> GuestResult<()> {
        let mut call = Encoder::new(OP_VK_DESTROY_DEVICE);
        call.put_u64(device);
        self.calls.send(call)
    }

    /// Allocates device memory.  A non-zero `blob_id` on a host-visible type makes the
    /// allocation available to a blob resource created with the same id on this context.
    pub fn allocate_memory(
        &mut self,
        device: u64,
        size: u64,
        memory_type_index: u32,
        blob_id: u64,
    ) -> GuestResult<VkResult<u64>> {
        let opcode = OP_VK_ALLOCATE_MEMORY;
        let mut call = Encoder::new(opcode);
        call.put_u64(device)
            .put_u64(size)
            .put_u32(memory_type_index)
            .put_u64(blob_id);
        debug!("vkAllocateMemory {} bytes of type {}, blob {}", size, memory_type_index, blob_id);
        self.calls.call(opcode, call, created)
    }

    pub fn free_memory(&mut self, device: u64, memory: u64) -> GuestResult<()> {
        let mut call = Encoder::new(OP_VK_FREE_MEMORY);
        call.put_u64(device).put_u64(memory);
        self.calls.send(call)
    }

    pub fn create_buffer(&mut self, device: u64, size: u64) -> GuestResult<VkResult<u64>> {
        let opcode = OP_VK_CREATE_BUFFER;
        let mut call = Encoder::new(opcode);
        call.put_u64(device).put_u64(size);
        self.calls.call(opcode, call, created)
    }

    pub fn destroy_buffer(&mut self, device: u64, buffer: u64) -> GuestResult<()> {
        let mut call = Encoder::new(OP_VK_DESTROY_BUFFER);
        call.put_u64(device).put_u64(buffer);
        self.calls.send(call)
    }

    pub fn get_buffer_memory_requirements(
        &mut self,
        device: u64,
        buffer: u64,
    ) -> GuestResult<VkMemoryRequirements> {
        let opcode = OP_VK_GET_BUFFER_MEMORY_REQUIREMENTS;
        let mut call = Encoder::new(opcode);
        call.put_u64(device).put_u64(buffer);
        self.calls.call(opcode, call, |r| {
            Ok(VkMemoryRequirements {
                size: r.get_u64()?,
                alignment: r.get_u64()?,
                memory_type_bits: r.get_u32()?,
            })
        })
    }

    pub fn bind_buffer_memory(
        &mut self,
        device: u64,
        buffer: u64,
        memory: u64,
        offset: u64,
    ) -> GuestResult<VkResult<()>> {
        let opcode = OP_VK_BIND_BUFFER_MEMORY;
        let mut call = Encoder::new(opcode);
        call.put_u64(device)
            .put_u64(buffer)
            .put_u64(memory)
            .put_u64(offset);
        self.calls
            .call(opcode, call, |r| Ok(vk_result(r.get_i32()?)))
    }

    /// Tells the host that the presentation engine released `image`, completing every QSRI
    /// export waiting on it.
    pub fn queue_signal_release_image_android(
        &mut self,
        queue: u64,
        image: u64,
    ) -> GuestResult<VkResult<()>> {
        let opcode = OP_VK_QUEUE_SIGNAL_RELEASE_IMAGE_ANDROID;
        let mut call = Encoder::new(opcode);
        call.put_u64(queue).put_u64(image);
        self.calls
            .call(opcode, call, |r| Ok(vk_result(r.get_i32()?)))
    }
}
