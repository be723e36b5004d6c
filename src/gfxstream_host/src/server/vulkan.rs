// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Vulkan server context and the global Vulkan state shared by every context.
//!
//! Guests never see driver handles.  Each object is given a boxed handle whose top bits carry the
//! object type; the boxed value is what the reconstruction log records, so a replay after
//! snapshot load can hand the guest's existing handles back out in front of freshly created
//! driver objects.

use std::collections::BTreeMap as Map;
use std::collections::VecDeque;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;

use crate::backend::to_vk_result;
use crate::backend::VkBackend;
use crate::backend::VK_ERROR_INITIALIZATION_FAILED;
use crate::backend::VK_ERROR_OUT_OF_DEVICE_MEMORY;
use crate::backend::VK_SUCCESS;
use crate::features::Feature;
use crate::gfxstream_os::MappedRegion;
use crate::gfxstream_os::MemoryMapping;
use crate::gfxstream_os::SharedMemory;
use crate::gfxstream_utils::*;
use crate::memory_properties::MemoryPropertyFlags;
use crate::reconstruction::handle_type_tag;
use crate::reconstruction::make_handle;
use crate::reconstruction::HandleState;
use crate::reconstruction::VkReconstruction;
use crate::renderer::Renderer;
use crate::server::DispatchContext;
use crate::server::ServerContext;
use crate::snapshot_io;
use crate::wire::next_packet;
use crate::wire::ChecksumCalculator;
use crate::wire::Decoder;
use crate::wire::Encoder;
use crate::wire::PACKET_HEADER_SIZE;

pub const OP_VK_CREATE_INSTANCE: u32 = 20000;
pub const OP_VK_DESTROY_INSTANCE: u32 = 20001;
pub const OP_VK_GET_PHYSICAL_DEVICE_MEMORY_PROPERTIES: u32 = 20008;
pub const OP_VK_CREATE_DEVICE: u32 = 20011;
pub const OP_VK_DESTROY_DEVICE: u32 = 20012;
pub const OP_VK_ALLOCATE_MEMORY: u32 = 20021;
pub const OP_VK_FREE_MEMORY: u32 = 20022;
pub const OP_VK_BIND_BUFFER_MEMORY: u32 = 20028;
pub const OP_VK_GET_BUFFER_MEMORY_REQUIREMENTS: u32 = 20030;
pub const OP_VK_CREATE_BUFFER: u32 = 20036;
pub const OP_VK_DESTROY_BUFFER: u32 = 20037;
pub const OP_VK_QUEUE_SIGNAL_RELEASE_IMAGE_ANDROID: u32 = 20193;

const VK_OPCODES: &[u32] = &[
    OP_VK_CREATE_INSTANCE,
    OP_VK_DESTROY_INSTANCE,
    OP_VK_GET_PHYSICAL_DEVICE_MEMORY_PROPERTIES,
    OP_VK_CREATE_DEVICE,
    OP_VK_DESTROY_DEVICE,
    OP_VK_ALLOCATE_MEMORY,
    OP_VK_FREE_MEMORY,
    OP_VK_BIND_BUFFER_MEMORY,
    OP_VK_GET_BUFFER_MEMORY_REQUIREMENTS,
    OP_VK_CREATE_BUFFER,
    OP_VK_DESTROY_BUFFER,
    OP_VK_QUEUE_SIGNAL_RELEASE_IMAGE_ANDROID,
];

pub const TAG_INSTANCE: u16 = 1;
pub const TAG_DEVICE: u16 = 2;
pub const TAG_DEVICE_MEMORY: u16 = 3;
pub const TAG_BUFFER: u16 = 4;

struct BoxedObject {
    native: u64,
    /// Boxed handle of the owning instance or device; 0 for instances.
    parent: u64,
}

/// The render thread an object was created through.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VkOwner {
    pub ctx_id: u32,
    pub puid: u64,
}

/// Host memory behind a host-visible allocation that the guest maps through a blob.
struct HostVisibleMemory {
    _mapping: MemoryMapping,
    _shm: Option<SharedMemory>,
}

#[derive(Default)]
pub struct VkGlobalState {
    reconstruction: VkReconstruction,
    objects: Map<u64, BoxedObject>,
    next_index: u64,
    /// Handles recorded at save time, consumed in order by creates during replay.
    replay_handles: VecDeque<u64>,
    host_memory: Map<u64, HostVisibleMemory>,
    owners: Map<u64, VkOwner>,
    /// Restored objects no render thread has taken over yet.
    unclaimed: Map<u64, VkOwner>,
}

impl VkGlobalState {
    pub fn new() -> VkGlobalState {
        Default::default()
    }

    pub fn reconstruction(&self) -> &VkReconstruction {
        &self.reconstruction
    }

    pub fn save_replay_buffers(&self) -> Vec<u8> {
        self.reconstruction.save_replay_buffers()
    }

    pub fn live_handles(&self) -> Vec<u64> {
        self.reconstruction.live_handles()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// The driver handle behind a boxed handle.
    pub fn unbox(&self, boxed: u64) -> Option<u64> {
        self.objects.get(&boxed).map(|o| o.native)
    }

    fn unbox_typed(&self, boxed: u64, tag: u16) -> GfxstreamResult<u64> {
        if handle_type_tag(boxed) != tag {
            return Err(GfxstreamError::InvalidGfxstreamHandle);
        }
        self.unbox(boxed).ok_or(GfxstreamError::InvalidGfxstreamHandle)
    }

    fn box_handle(&mut self, tag: u16, native: u64, parent: u64) -> GfxstreamResult<u64> {
        let boxed = match self.replay_handles.pop_front() {
            Some(recorded) if handle_type_tag(recorded) == tag => recorded,
            Some(recorded) => {
                return Err(GfxstreamError::SnapshotMismatch(format!(
                    "replay expected a handle of type {}, recorded {:#x}",
                    tag, recorded
                )))
            }
            None => {
                self.next_index += 1;
                make_handle(tag, self.next_index)
            }
        };
        // Keep fresh handles clear of restored ones.
        self.next_index = self.next_index.max(boxed & ((1 << 48) - 1));
        self.objects.insert(boxed, BoxedObject { native, parent });
        Ok(boxed)
    }

    fn record_create(&mut self, packet: &[u8], boxed: u64, parent: u64) {
        let r = &mut self.reconstruction;
        let api = r.create_api_call_info();
        r.set_api_trace(api, packet);
        r.add_handles(&[boxed]);
        r.for_each_handle_add_api(&[boxed], api, HandleState::Created);
        r.set_created_handles_for_api(api, &[boxed]);
        r.add_handle_dependency(&[boxed], parent, HandleState::Created, HandleState::Created);
    }

    pub fn owner(&self, boxed: u64) -> Option<VkOwner> {
        self.owners.get(&boxed).copied()
    }

    /// `[count u32][boxed u64, ctx_id u32, puid u64 x count]` for every live object.
    pub fn save_owners(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        let live: Vec<(&u64, &VkOwner)> = self
            .owners
            .iter()
            .filter(|(boxed, _)| self.objects.contains_key(boxed))
            .collect();
        snapshot_io::write(w, live.len() as u32)?;
        for (boxed, owner) in live {
            snapshot_io::write(w, *boxed)?;
            snapshot_io::write(w, owner.ctx_id)?;
            snapshot_io::write(w, owner.puid)?;
        }
        Ok(())
    }

    pub fn load_owners(r: &mut dyn Read) -> GfxstreamResult<Map<u64, VkOwner>> {
        let count: u32 = snapshot_io::read(r)?;
        let mut owners = Map::new();
        for _ in 0..count {
            let boxed: u64 = snapshot_io::read(r)?;
            let ctx_id: u32 = snapshot_io::read(r)?;
            let puid: u64 = snapshot_io::read(r)?;
            owners.insert(boxed, VkOwner { ctx_id, puid });
        }
        Ok(owners)
    }

    /// Hands the owners saved with a snapshot back to the replayed objects.
    pub fn restore_owners(&mut self, owners: Map<u64, VkOwner>) {
        for (boxed, owner) in owners {
            if !self.objects.contains_key(&boxed) {
                warn!("vulkan: owner recorded for unknown object {:#x}", boxed);
                continue;
            }
            self.owners.insert(boxed, owner);
            self.unclaimed.insert(boxed, owner);
        }
    }

    /// Restored objects of `owner`, oldest first.
    fn claim(&mut self, owner: VkOwner) -> Vec<u64> {
        let mut claimed: Vec<u64> = self
            .unclaimed
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(boxed, _)| *boxed)
            .collect();
        for boxed in &claimed {
            self.unclaimed.remove(boxed);
        }
        claimed.sort_by_key(|boxed| boxed & ((1 << 48) - 1));
        claimed
    }

    fn record_modify(&mut self, packet: &[u8], target: u64, depends_on: u64) {
        let r = &mut self.reconstruction;
        let api = r.create_api_call_info();
        r.set_api_trace(api, packet);
        r.for_each_handle_add_modify_api(&[target], api);
        r.add_handle_dependency(&[target], depends_on, HandleState::Created, HandleState::Created);
    }

    pub(crate) fn set_replay_handles(&mut self, handles: Vec<u64>) {
        self.replay_handles = handles.into();
    }

    /// Destroys the driver object behind `boxed` and forgets it.
    fn destroy(&mut self, vk: Option<&Arc<dyn VkBackend>>, boxed: u64) {
        let object = match self.objects.remove(&boxed) {
            Some(o) => o,
            None => return,
        };
        let parent = self.unbox(object.parent).unwrap_or(0);
        if let Some(vk) = vk {
            match handle_type_tag(boxed) {
                TAG_INSTANCE => vk.destroy_instance(object.native),
                TAG_DEVICE => vk.destroy_device(object.native),
                TAG_DEVICE_MEMORY => vk.free_memory(parent, object.native),
                TAG_BUFFER => vk.destroy_buffer(parent, object.native),
                tag => warn!("vulkan: destroying object of unknown type {}", tag),
            }
        }
        self.host_memory.remove(&boxed);
        self.owners.remove(&boxed);
        self.unclaimed.remove(&boxed);
        self.reconstruction.remove_handles(&[boxed], false);
    }
}

#[derive(Default)]
pub struct VulkanServer {
    /// Objects created through this context, oldest first.
    owned: Vec<u64>,
}

impl VulkanServer {
    pub fn new() -> VulkanServer {
        Default::default()
    }

    fn create_failed(
        ctx: &DispatchContext<'_>,
        reply: &mut Encoder,
        opcode: u32,
        e: GfxstreamError,
    ) -> GfxstreamResult<()> {
        if ctx.for_snapshot_load {
            return Err(GfxstreamError::SnapshotMismatch(format!(
                "replayed opcode {} failed: {}",
                opcode, e
            )));
        }
        reply.put_u64(0).put_i32(to_vk_result(&e));
        Ok(())
    }

    fn created(&mut self, ctx: &DispatchContext<'_>, reply: &mut Encoder, boxed: u64) {
        if !ctx.for_snapshot_load {
            let owner = VkOwner {
                ctx_id: ctx.ctx_id,
                puid: *ctx.puid,
            };
            ctx.renderer.vk_state().owners.insert(boxed, owner);
        }
        self.owned.push(boxed);
        reply.put_u64(boxed).put_i32(VK_SUCCESS);
    }

    fn destroy(&mut self, renderer: &Renderer, boxed: u64) {
        if boxed == 0 {
            return;
        }
        self.owned.retain(|h| *h != boxed);
        renderer.vk_state().destroy(renderer.vk(), boxed);
    }

    fn allocate_host_visible(
        renderer: &Renderer,
        ctx_id: u32,
        blob_id: u64,
        size: u64,
        guest_type_index: u32,
        register: bool,
    ) -> GfxstreamResult<HostVisibleMemory> {
        let eom = renderer.external_objects();
        if renderer.features().is_enabled(Feature::ExternalBlob) {
            let shm = SharedMemory::new(format!("gfxstream-vk-memory-{}", blob_id), size)?;
            let mapping = MemoryMapping::from_safe_descriptor(
                shm.try_clone_descriptor()?,
                size.try_into()?,
                GFXSTREAM_MAP_CACHE_CACHED | GFXSTREAM_MAP_ACCESS_RW,
            )?;
            if register {
                eom.add_blob_descriptor_info(
                    ctx_id,
                    blob_id,
                    shm.try_clone_descriptor()?,
                    GFXSTREAM_MEM_HANDLE_TYPE_SHM,
                    GFXSTREAM_MAP_CACHE_CACHED,
                    Some(VulkanInfo {
                        memory_idx: guest_type_index,
                        device_memory_size: size,
                        dedicated: false,
                    }),
                );
            }
            Ok(HostVisibleMemory {
                _mapping: mapping,
                _shm: Some(shm),
            })
        } else {
            let mapping = MemoryMapping::new_anonymous(size.try_into()?)?;
            if register {
                eom.add_mapping(
                    ctx_id,
                    blob_id,
                    mapping.as_ptr() as u64,
                    GFXSTREAM_MAP_CACHE_CACHED,
                );
            }
            Ok(HostVisibleMemory {
                _mapping: mapping,
                _shm: None,
            })
        }
    }

    fn allocate_memory(
        &mut self,
        ctx: &DispatchContext<'_>,
        reply: &mut Encoder,
        device: u64,
        size: u64,
        guest_type_index: u32,
        blob_id: u64,
    ) -> GfxstreamResult<()> {
        let renderer = ctx.renderer;
        let (vk, props) = match (renderer.vk(), renderer.memory_properties()) {
            (Some(vk), Some(props)) => (vk, props),
            _ => {
                let e = GfxstreamError::BackendFailure(VK_ERROR_INITIALIZATION_FAILED);
                return VulkanServer::create_failed(ctx, reply, OP_VK_ALLOCATE_MEMORY, e);
            }
        };
        let host = match props.get_host_memory_info_from_guest_index(guest_type_index) {
            Some(info) => info,
            None => {
                let e = GfxstreamError::BackendFailure(VK_ERROR_OUT_OF_DEVICE_MEMORY);
                return VulkanServer::create_failed(ctx, reply, OP_VK_ALLOCATE_MEMORY, e);
            }
        };

        let mut state = renderer.vk_state();
        let native_device = match state.unbox_typed(device, TAG_DEVICE) {
            Ok(d) => d,
            Err(e) => return VulkanServer::create_failed(ctx, reply, OP_VK_ALLOCATE_MEMORY, e),
        };
        let native = match vk.allocate_memory(native_device, size, host.index) {
            Ok(m) => m,
            Err(e) => return VulkanServer::create_failed(ctx, reply, OP_VK_ALLOCATE_MEMORY, e),
        };

        let host_visible = host
            .memory_type
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE);
        let backing = if blob_id != 0 && host_visible {
            match VulkanServer::allocate_host_visible(
                renderer,
                ctx.ctx_id,
                blob_id,
                size,
                guest_type_index,
                !ctx.for_snapshot_load,
            ) {
                Ok(b) => Some(b),
                Err(e) => {
                    vk.free_memory(native_device, native);
                    return VulkanServer::create_failed(ctx, reply, OP_VK_ALLOCATE_MEMORY, e);
                }
            }
        } else {
            None
        };

        let boxed = state.box_handle(TAG_DEVICE_MEMORY, native, device)?;
        state.record_create(ctx.packet, boxed, device);
        if let Some(backing) = backing {
            debug!("vulkan: memory {:#x} backs blob {}", boxed, blob_id);
            state.host_memory.insert(boxed, backing);
        }
        drop(state);
        self.created(ctx, reply, boxed);
        Ok(())
    }
}

impl ServerContext for VulkanServer {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn handles(&self, opcode: u32) -> bool {
        VK_OPCODES.contains(&opcode)
    }

    fn dispatch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dec: &mut Decoder<'_>,
        reply: &mut Encoder,
    ) -> GfxstreamResult<()> {
        let renderer: &Arc<Renderer> = ctx.renderer;
        let opcode = dec.opcode();
        match opcode {
            OP_VK_CREATE_INSTANCE => {
                let app_name = dec.get_str()?;
                let result = renderer
                    .vk()
                    .ok_or(GfxstreamError::BackendFailure(VK_ERROR_INITIALIZATION_FAILED))
                    .and_then(|vk| vk.create_instance());
                match result {
                    Ok(native) => {
                        let mut state = renderer.vk_state();
                        let boxed = state.box_handle(TAG_INSTANCE, native, 0)?;
                        state.record_create(ctx.packet, boxed, 0);
                        drop(state);
                        debug!("vulkan: instance {:#x} for {:?}", boxed, app_name);
                        self.created(ctx, reply, boxed);
                    }
                    Err(e) => VulkanServer::create_failed(ctx, reply, opcode, e)?,
                }
            }
            OP_VK_DESTROY_INSTANCE => {
                let instance = dec.get_u64()?;
                self.destroy(renderer, instance);
            }
            OP_VK_GET_PHYSICAL_DEVICE_MEMORY_PROPERTIES => {
                let instance = dec.get_u64()?;
                let valid = renderer.vk_state().unbox_typed(instance, TAG_INSTANCE).is_ok();
                match renderer.memory_properties() {
                    Some(props) if valid => {
                        let guest = props.guest_memory_properties();
                        reply.put_u32(guest.memory_types.len() as u32);
                        for t in &guest.memory_types {
                            reply.put_u32(t.property_flags.bits()).put_u32(t.heap_index);
                        }
                        reply.put_u32(guest.memory_heaps.len() as u32);
                        for h in &guest.memory_heaps {
                            reply.put_u64(h.size).put_u32(h.flags.bits());
                        }
                    }
                    _ => {
                        reply.put_u32(0).put_u32(0);
                    }
                }
            }
            OP_VK_CREATE_DEVICE => {
                let instance = dec.get_u64()?;
                let mut state = renderer.vk_state();
                let result = state.unbox_typed(instance, TAG_INSTANCE).and_then(|native| {
                    renderer
                        .vk()
                        .ok_or(GfxstreamError::BackendFailure(VK_ERROR_INITIALIZATION_FAILED))?
                        .create_device(native)
                });
                match result {
                    Ok(native) => {
                        let boxed = state.box_handle(TAG_DEVICE, native, instance)?;
                        state.record_create(ctx.packet, boxed, instance);
                        drop(state);
                        self.created(ctx, reply, boxed);
                    }
                    Err(e) => {
                        drop(state);
                        VulkanServer::create_failed(ctx, reply, opcode, e)?
                    }
                }
            }
            OP_VK_DESTROY_DEVICE => {
                let device = dec.get_u64()?;
                self.destroy(renderer, device);
            }
            OP_VK_ALLOCATE_MEMORY => {
                let device = dec.get_u64()?;
                let size = dec.get_u64()?;
                let guest_type_index = dec.get_u32()?;
                let blob_id = dec.get_u64()?;
                self.allocate_memory(ctx, reply, device, size, guest_type_index, blob_id)?;
            }
            OP_VK_FREE_MEMORY => {
                let _device = dec.get_u64()?;
                let memory = dec.get_u64()?;
                self.destroy(renderer, memory);
            }
            OP_VK_CREATE_BUFFER => {
                let device = dec.get_u64()?;
                let size = dec.get_u64()?;
                let mut state = renderer.vk_state();
                let result = state.unbox_typed(device, TAG_DEVICE).and_then(|native| {
                    renderer
                        .vk()
                        .ok_or(GfxstreamError::BackendFailure(VK_ERROR_INITIALIZATION_FAILED))?
                        .create_buffer(native, size)
                });
                match result {
                    Ok(native) => {
                        let boxed = state.box_handle(TAG_BUFFER, native, device)?;
                        state.record_create(ctx.packet, boxed, device);
                        drop(state);
                        self.created(ctx, reply, boxed);
                    }
                    Err(e) => {
                        drop(state);
                        VulkanServer::create_failed(ctx, reply, opcode, e)?
                    }
                }
            }
            OP_VK_DESTROY_BUFFER => {
                let _device = dec.get_u64()?;
                let buffer = dec.get_u64()?;
                self.destroy(renderer, buffer);
            }
            OP_VK_GET_BUFFER_MEMORY_REQUIREMENTS => {
                let device = dec.get_u64()?;
                let buffer = dec.get_u64()?;
                let state = renderer.vk_state();
                let result = state.unbox_typed(device, TAG_DEVICE).and_then(|d| {
                    let b = state.unbox_typed(buffer, TAG_BUFFER)?;
                    renderer
                        .vk()
                        .ok_or(GfxstreamError::Unsupported)?
                        .buffer_memory_requirements(d, b)
                });
                drop(state);
                let requirements = match (result, renderer.memory_properties()) {
                    (Ok(host), Some(props)) => props.transform_to_guest_memory_requirements(host),
                    (Ok(host), None) => host,
                    (Err(e), _) => {
                        warn!("vkGetBufferMemoryRequirements: {}", e);
                        Default::default()
                    }
                };
                reply
                    .put_u64(requirements.size)
                    .put_u64(requirements.alignment)
                    .put_u32(requirements.memory_type_bits);
            }
            OP_VK_BIND_BUFFER_MEMORY => {
                let device = dec.get_u64()?;
                let buffer = dec.get_u64()?;
                let memory = dec.get_u64()?;
                let offset = dec.get_u64()?;
                let mut state = renderer.vk_state();
                let result = (|| {
                    let d = state.unbox_typed(device, TAG_DEVICE)?;
                    let b = state.unbox_typed(buffer, TAG_BUFFER)?;
                    let m = state.unbox_typed(memory, TAG_DEVICE_MEMORY)?;
                    renderer
                        .vk()
                        .ok_or(GfxstreamError::Unsupported)?
                        .bind_buffer_memory(d, b, m, offset)
                })();
                match result {
                    Ok(()) => {
                        state.record_modify(ctx.packet, buffer, memory);
                        reply.put_i32(VK_SUCCESS);
                    }
                    Err(e) if ctx.for_snapshot_load => {
                        return Err(GfxstreamError::SnapshotMismatch(format!(
                            "replayed vkBindBufferMemory failed: {}",
                            e
                        )))
                    }
                    Err(e) => {
                        reply.put_i32(to_vk_result(&e));
                    }
                }
            }
            OP_VK_QUEUE_SIGNAL_RELEASE_IMAGE_ANDROID => {
                let _queue = dec.get_u64()?;
                let image = dec.get_u64()?;
                renderer.signal_qsri(image);
                reply.put_i32(VK_SUCCESS);
            }
            opcode => return Err(ProtocolError::UnknownOpcode(opcode).into()),
        }
        Ok(())
    }

    fn on_restore(&mut self, renderer: &Arc<Renderer>, ctx_id: u32, puid: u64) {
        let claimed = renderer.vk_state().claim(VkOwner { ctx_id, puid });
        if !claimed.is_empty() {
            debug!(
                "vulkan: ctx {} process {:#x} takes over {} restored objects",
                ctx_id,
                puid,
                claimed.len()
            );
        }
        self.owned.extend(claimed);
    }

    fn on_exit(&mut self, renderer: &Arc<Renderer>) {
        let owned = std::mem::take(&mut self.owned);
        if owned.is_empty() {
            return;
        }
        debug!("vulkan: releasing {} objects left by the guest", owned.len());
        let mut state = renderer.vk_state();
        for boxed in owned.into_iter().rev() {
            state.destroy(renderer.vk(), boxed);
        }
    }
}

/// Rebuilds the Vulkan objects described by a saved reconstruction log.
pub fn replay(renderer: &Arc<Renderer>, saved: &[u8]) -> GfxstreamResult<()> {
    let (handles, trace) = VkReconstruction::load_replay_buffers(saved)?;
    if trace.is_empty() {
        return Ok(());
    }
    if renderer.vk().is_none() {
        return Err(GfxstreamError::SnapshotMismatch(
            "Vulkan objects recorded but no Vulkan back-end".to_string(),
        ));
    }

    info!(
        "vulkan: replaying {} trace bytes for {} handles",
        trace.len(),
        handles.len()
    );
    renderer.vk_state().set_replay_handles(handles);

    let mut server = VulkanServer::new();
    let mut checksum = ChecksumCalculator::new();
    let mut puid = 0;
    let mut pos = 0;
    let result = (|| {
        while pos < trace.len() {
            let header = next_packet(&trace[pos..], 0)
                .map_err(|e| GfxstreamError::SnapshotMismatch(e.to_string()))?
                .ok_or_else(|| {
                    GfxstreamError::SnapshotMismatch("truncated replay trace".to_string())
                })?;
            let end = pos + header.packet_len();
            let packet = &trace[pos..end];
            if !server.handles(header.opcode()) {
                return Err(GfxstreamError::SnapshotMismatch(format!(
                    "replay trace holds foreign opcode {}",
                    header.opcode()
                )));
            }

            let mut dec = Decoder::new(header.opcode(), &packet[PACKET_HEADER_SIZE..]);
            let mut reply = Encoder::reply();
            let mut ctx = DispatchContext {
                renderer,
                checksum: &mut checksum,
                ctx_id: 0,
                puid: &mut puid,
                packet,
                for_snapshot_load: true,
            };
            server.dispatch(&mut ctx, &mut dec, &mut reply)?;
            dec.finish()
                .map_err(|e| GfxstreamError::SnapshotMismatch(e.to_string()))?;
            pos = end;
        }
        Ok(())
    })();

    let mut state = renderer.vk_state();
    let leftover = state.replay_handles.len();
    state.replay_handles.clear();
    result?;
    if leftover != 0 {
        return Err(GfxstreamError::SnapshotMismatch(format!(
            "{} recorded handles were never recreated",
            leftover
        )));
    }
    // The replayed objects belong to the restored guest, not to the replay context.
    server.owned.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubVkBackend;
    use crate::external_object_manager::ExternalObjectManager;
    use crate::features::FeatureSet;
    use crate::renderer::RendererConfig;
    use crate::wire::PacketHeader;

    pub(crate) fn renderer(features: FeatureSet) -> (Arc<Renderer>, Arc<StubVkBackend>) {
        let vk = Arc::new(StubVkBackend::new());
        let renderer = Renderer::new(RendererConfig {
            features,
            gl: None,
            vk: Some(vk.clone()),
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap();
        (renderer, vk)
    }

    fn call(server: &mut VulkanServer, renderer: &Arc<Renderer>, call: Encoder) -> Vec<u8> {
        let packet = call.finish(&mut ChecksumCalculator::new());
        let opcode = u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let mut dec = Decoder::new(opcode, &packet[PACKET_HEADER_SIZE..]);
        let mut reply = Encoder::reply();
        let mut checksum = ChecksumCalculator::new();
        let mut puid = 0;
        let mut ctx = DispatchContext {
            renderer,
            checksum: &mut checksum,
            ctx_id: 3,
            puid: &mut puid,
            packet: &packet,
            for_snapshot_load: false,
        };
        server.dispatch(&mut ctx, &mut dec, &mut reply).unwrap();
        dec.finish().unwrap();
        reply.finish_reply(&mut checksum)
    }

    fn created(reply: &[u8]) -> u64 {
        assert_eq!(i32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]), 0);
        u64::from_le_bytes([
            reply[0], reply[1], reply[2], reply[3], reply[4], reply[5], reply[6], reply[7],
        ])
    }

    struct Objects {
        instance: u64,
        device: u64,
        memory: u64,
        buffer: u64,
    }

    fn build(server: &mut VulkanServer, r: &Arc<Renderer>, blob_id: u64) -> Objects {
        let mut create_instance = Encoder::new(OP_VK_CREATE_INSTANCE);
        create_instance.put_string("test");
        let instance = created(&call(server, r, create_instance));

        let mut create_device = Encoder::new(OP_VK_CREATE_DEVICE);
        create_device.put_u64(instance);
        let device = created(&call(server, r, create_device));

        let mut create_buffer = Encoder::new(OP_VK_CREATE_BUFFER);
        create_buffer.put_u64(device).put_u64(1000);
        let buffer = created(&call(server, r, create_buffer));

        let mut allocate = Encoder::new(OP_VK_ALLOCATE_MEMORY);
        allocate.put_u64(device).put_u64(4096).put_u32(1).put_u64(blob_id);
        let memory = created(&call(server, r, allocate));

        let mut bind = Encoder::new(OP_VK_BIND_BUFFER_MEMORY);
        bind.put_u64(device).put_u64(buffer).put_u64(memory).put_u64(0);
        assert_eq!(call(server, r, bind), VK_SUCCESS.to_le_bytes().to_vec());

        Objects {
            instance,
            device,
            memory,
            buffer,
        }
    }

    fn requirements(server: &mut VulkanServer, r: &Arc<Renderer>, o: &Objects) -> Vec<u8> {
        let mut query = Encoder::new(OP_VK_GET_BUFFER_MEMORY_REQUIREMENTS);
        query.put_u64(o.device).put_u64(o.buffer);
        call(server, r, query)
    }

    fn opcodes(trace: &[u8]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut rest = trace;
        while let Some(header) = PacketHeader::read(rest) {
            out.push(header.opcode());
            rest = &rest[header.packet_len()..];
        }
        out
    }

    #[test]
    fn handles_are_boxed_and_typed() {
        let (r, _vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        let o = build(&mut server, &r, 0);
        assert_eq!(handle_type_tag(o.instance), TAG_INSTANCE);
        assert_eq!(handle_type_tag(o.buffer), TAG_BUFFER);

        // A memory handle where a device is expected.
        let mut create_buffer = Encoder::new(OP_VK_CREATE_BUFFER);
        create_buffer.put_u64(o.memory).put_u64(16);
        let reply = call(&mut server, &r, create_buffer);
        assert_eq!(&reply[..8], &[0; 8]);
        assert_ne!(i32::from_le_bytes([reply[8], reply[9], reply[10], reply[11]]), 0);
    }

    #[test]
    fn host_visible_memory_registers_blob_mapping() {
        let (r, _vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        build(&mut server, &r, 7);
        let mapping = r.external_objects().remove_mapping(3, 7).unwrap();
        assert_ne!(mapping.addr, 0);
        assert_eq!(mapping.caching, GFXSTREAM_MAP_CACHE_CACHED);
    }

    #[test]
    fn exit_releases_driver_objects() {
        let (r, vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        build(&mut server, &r, 0);
        assert_eq!(vk.live_objects(), 4);
        server.on_exit(&r);
        assert_eq!(vk.live_objects(), 0);
        assert!(r.vk_state().live_handles().is_empty());
    }

    #[test]
    fn replay_recreates_objects_under_the_same_handles() {
        let (r, _vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        let o = build(&mut server, &r, 0);
        let before = requirements(&mut server, &r, &o);
        let saved = r.vk_state().save_replay_buffers();

        let (_, trace) = VkReconstruction::load_replay_buffers(&saved).unwrap();
        assert_eq!(
            opcodes(&trace),
            vec![
                OP_VK_CREATE_INSTANCE,
                OP_VK_CREATE_DEVICE,
                OP_VK_ALLOCATE_MEMORY,
                OP_VK_CREATE_BUFFER,
                OP_VK_BIND_BUFFER_MEMORY,
            ]
        );

        let (restored, vk) = renderer(FeatureSet::new());
        replay(&restored, &saved).unwrap();
        assert_eq!(vk.live_objects(), 4);
        let mut live = restored.vk_state().live_handles();
        let mut expected = r.vk_state().live_handles();
        live.sort_unstable();
        expected.sort_unstable();
        assert_eq!(live, expected);

        let mut fresh = VulkanServer::new();
        assert_eq!(requirements(&mut fresh, &restored, &o), before);

        // New objects never collide with restored ones.
        let mut create_buffer = Encoder::new(OP_VK_CREATE_BUFFER);
        create_buffer.put_u64(o.device).put_u64(16);
        let extra = created(&call(&mut fresh, &restored, create_buffer));
        assert!(!expected.contains(&extra));
    }

    #[test]
    fn restored_objects_are_released_by_their_owner() {
        let (r, _vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        let o = build(&mut server, &r, 0);
        let owner = VkOwner { ctx_id: 3, puid: 0 };
        assert_eq!(r.vk_state().owner(o.buffer), Some(owner));

        let mut saved = Vec::new();
        r.save_snapshot(&mut saved).unwrap();
        let (restored, vk) = renderer(FeatureSet::new());
        restored.load_snapshot(&mut saved.as_slice()).unwrap();
        assert_eq!(vk.live_objects(), 4);
        assert_eq!(restored.vk_state().owner(o.memory), Some(owner));

        // A thread of another context takes nothing over.
        let mut other = VulkanServer::new();
        other.on_restore(&restored, 4, 0);
        other.on_exit(&restored);
        assert_eq!(vk.live_objects(), 4);

        let mut resumed = VulkanServer::new();
        resumed.on_restore(&restored, owner.ctx_id, owner.puid);
        resumed.on_exit(&restored);
        assert_eq!(vk.live_objects(), 0);
        let state = restored.vk_state();
        assert!(state.live_handles().is_empty());
        assert_eq!(state.reconstruction().api_call_count(), 0);
        let (handles, trace) =
            VkReconstruction::load_replay_buffers(&state.save_replay_buffers()).unwrap();
        assert!(handles.is_empty());
        assert!(trace.is_empty());
    }

    #[test]
    fn replay_without_vulkan_is_a_mismatch() {
        let (r, _vk) = renderer(FeatureSet::new());
        let mut server = VulkanServer::new();
        build(&mut server, &r, 0);
        let saved = r.vk_state().save_replay_buffers();

        let plain = Renderer::new(RendererConfig {
            features: FeatureSet::new(),
            gl: None,
            vk: None,
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap();
        assert!(matches!(
            replay(&plain, &saved),
            Err(GfxstreamError::SnapshotMismatch(_))
        ));
    }
}
