// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A virtio-gpu resource as the host sees it: what backs it, which contexts it is attached to,
//! and the guest iovecs transfers copy through.

use std::collections::BTreeSet as Set;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use log::debug;
use log::error;

use crate::external_object_manager::BlobDescriptorInfo;
use crate::external_object_manager::HostMemInfo;
use crate::features::Feature;
use crate::features::FeatureSet;
use crate::formats::align_up;
use crate::formats::transfer_range;
use crate::formats::virgl_format_to_drm;
use crate::formats::virgl_format_to_fwk_format;
use crate::formats::virgl_format_to_gl;
use crate::formats::virgl_format_total_size;
use crate::gfxstream_utils::*;
use crate::pipe::HostPipe;
use crate::renderer::Renderer;
use crate::ring_blob::RingBlob;
use crate::snapshot_io;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceType {
    /// Guest bytes forwarded to the owning context's pipe.
    Pipe,
    /// Linear host buffer.
    Buffer,
    /// Backed by a color buffer with the same handle.
    ColorBuffer,
    /// Opaque blob memory.
    Blob,
}

impl ResourceType {
    fn to_u32(self) -> u32 {
        match self {
            ResourceType::Pipe => 0,
            ResourceType::Buffer => 1,
            ResourceType::ColorBuffer => 2,
            ResourceType::Blob => 3,
        }
    }

    fn from_u32(v: u32) -> GfxstreamResult<ResourceType> {
        match v {
            0 => Ok(ResourceType::Pipe),
            1 => Ok(ResourceType::Buffer),
            2 => Ok(ResourceType::ColorBuffer),
            3 => Ok(ResourceType::Blob),
            _ => Err(GfxstreamError::SnapshotMismatch(format!(
                "unknown resource type {}",
                v
            ))),
        }
    }
}

/// Classifies a 3D resource.  Anything that may be sampled, rendered to or scanned out needs a
/// color buffer; plain R8 linear allocations are buffers.
pub fn resource_type_for(args: &ResourceCreate3D) -> ResourceType {
    if args.target == GFXSTREAM_PIPE_BUFFER {
        return ResourceType::Pipe;
    }

    let display_binds =
        VIRGL_BIND_SAMPLER_VIEW | VIRGL_BIND_RENDER_TARGET | VIRGL_BIND_SCANOUT | VIRGL_BIND_CURSOR;
    if args.format != VIRGL_FORMAT_R8_UNORM
        || args.bind & display_binds != 0
        || args.bind & VIRGL_BIND_LINEAR == 0
    {
        return ResourceType::ColorBuffer;
    }

    ResourceType::Buffer
}

pub enum BlobBacking {
    Ring(Arc<RingBlob>),
    Mapping { info: HostMemInfo, size: u64 },
    Descriptor(BlobDescriptorInfo),
}

pub struct VirtioGpuResource {
    id: u32,
    resource_type: ResourceType,
    create_3d: Option<ResourceCreate3D>,
    create_blob: Option<ResourceCreateBlob>,
    iovecs: Vec<GfxstreamIovec>,
    linear: Vec<u8>,
    blob: Option<BlobBacking>,
    attached_contexts: Set<u32>,
    /// Context whose pipe receives transfers; the last attach wins.
    pipe_context: Option<u32>,
}

impl VirtioGpuResource {
    fn empty(id: u32, resource_type: ResourceType) -> VirtioGpuResource {
        VirtioGpuResource {
            id,
            resource_type,
            create_3d: None,
            create_blob: None,
            iovecs: Vec::new(),
            linear: Vec::new(),
            blob: None,
            attached_contexts: Set::new(),
            pipe_context: None,
        }
    }

    /// Creates the host object behind a 3D resource.  Pipes exist only in the frontend.
    pub fn create_3d(
        renderer: &Renderer,
        id: u32,
        args: ResourceCreate3D,
    ) -> GfxstreamResult<VirtioGpuResource> {
        let resource_type = resource_type_for(&args);
        match resource_type {
            ResourceType::Pipe => (),
            ResourceType::Buffer => {
                let width = args.width as u64;
                let height = args.height as u64;
                let size = checked_arithmetic!(width * height)?;
                renderer.create_buffer(id, size)?;
            }
            ResourceType::ColorBuffer => {
                renderer.create_color_buffer(
                    Some(id),
                    args.width,
                    args.height,
                    virgl_format_to_gl(args.format),
                    virgl_format_to_fwk_format(args.format),
                )?;
            }
            ResourceType::Blob => return Err(GfxstreamError::VirtioViolation("unexpected blob")),
        }

        debug!("resource {}: created as {:?}", id, resource_type);
        let mut resource = VirtioGpuResource::empty(id, resource_type);
        resource.create_3d = Some(args);
        Ok(resource)
    }

    /// Creates a blob resource.  With `create_3d`, the blob exports the memory of a freshly
    /// created buffer or color buffer.  A `blob_id` of 0 asks for a ring blob; any other id
    /// consumes what a server context registered under `(ctx_id, blob_id)`.
    pub fn create_blob(
        renderer: &Renderer,
        features: &FeatureSet,
        page_size: u64,
        ctx_id: u32,
        id: u32,
        create_3d: Option<ResourceCreate3D>,
        create_blob: ResourceCreateBlob,
    ) -> GfxstreamResult<VirtioGpuResource> {
        let mut exported = None;
        let mut resource = match create_3d {
            Some(args) => {
                let resource_type = resource_type_for(&args);
                if resource_type != ResourceType::Buffer
                    && resource_type != ResourceType::ColorBuffer
                {
                    return Err(GfxstreamError::VirtioViolation(
                        "blob backed by an unsupported 3d resource",
                    ));
                }
                let resource = VirtioGpuResource::create_3d(renderer, id, args)?;
                let export = match resource_type {
                    ResourceType::Buffer => renderer.export_buffer(id),
                    _ => renderer.export_color_buffer(id),
                };
                match export {
                    Ok(info) => exported = Some(info),
                    Err(e) => debug!("resource {}: not exportable: {}", id, e),
                }
                resource
            }
            None => VirtioGpuResource::empty(id, ResourceType::Blob),
        };
        resource.create_blob = Some(create_blob);

        let eom = renderer.external_objects();
        let backing = if create_blob.blob_id == 0 {
            let ring = if features.is_enabled(Feature::ExternalBlob) {
                RingBlob::create_with_shmem(id as u64, create_blob.size)
            } else {
                RingBlob::create_with_host_memory(id as u64, create_blob.size, page_size)
            };
            match ring {
                Ok(ring) => BlobBacking::Ring(Arc::new(ring)),
                Err(e) => {
                    resource.destroy(renderer);
                    return Err(e);
                }
            }
        } else if features.is_enabled(Feature::ExternalBlob) {
            let info = exported
                .or_else(|| eom.remove_blob_descriptor_info(ctx_id, create_blob.blob_id));
            match info {
                Some(info) => BlobBacking::Descriptor(info),
                None => {
                    error!(
                        "resource {}: no external blob descriptor for ctx {} blob {}",
                        id, ctx_id, create_blob.blob_id
                    );
                    resource.destroy(renderer);
                    return Err(GfxstreamError::InvalidGfxstreamHandle);
                }
            }
        } else {
            match eom.remove_mapping(ctx_id, create_blob.blob_id) {
                Some(info) => BlobBacking::Mapping {
                    info,
                    size: create_blob.size,
                },
                None => {
                    error!(
                        "resource {}: no external mapping for ctx {} blob {}",
                        id, ctx_id, create_blob.blob_id
                    );
                    resource.destroy(renderer);
                    return Err(GfxstreamError::InvalidGfxstreamHandle);
                }
            }
        };

        resource.blob = Some(backing);
        Ok(resource)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn create_args(&self) -> Option<&ResourceCreate3D> {
        self.create_3d.as_ref()
    }

    pub fn ring_blob(&self) -> Option<&Arc<RingBlob>> {
        match &self.blob {
            Some(BlobBacking::Ring(ring)) => Some(ring),
            _ => None,
        }
    }

    pub fn attached_contexts(&self) -> &Set<u32> {
        &self.attached_contexts
    }

    pub fn pipe_context(&self) -> Option<u32> {
        self.pipe_context
    }

    pub fn attach_to_context(&mut self, ctx_id: u32) {
        self.attached_contexts.insert(ctx_id);
        self.pipe_context = Some(ctx_id);
    }

    pub fn detach_from_context(&mut self, ctx_id: u32) {
        self.attached_contexts.remove(&ctx_id);
        if self.pipe_context == Some(ctx_id) {
            self.pipe_context = None;
        }
    }

    /// Replaces the guest backing.  The host keeps a linear shadow of the same total size.
    pub fn attach_iovecs(&mut self, iovecs: Vec<GfxstreamIovec>) {
        let linear_size: usize = iovecs.iter().map(|iov| iov.len).sum();
        self.iovecs = iovecs;
        self.linear = vec![0; linear_size];
    }

    pub fn detach_iovecs(&mut self) {
        self.iovecs.clear();
        self.linear.clear();
    }

    fn checked_create_args(&self) -> GfxstreamResult<ResourceCreate3D> {
        self.create_3d
            .ok_or(GfxstreamError::VirtioViolation("resource has no 3d arguments"))
    }

    /// Host to guest.  `pipe` is the owning context's pipe for PIPE resources.
    pub fn transfer_read(
        &mut self,
        renderer: &Renderer,
        pipe: Option<&mut HostPipe>,
        transfer: &Transfer3D,
        iovecs: Option<&[GfxstreamIovec]>,
    ) -> GfxstreamResult<()> {
        match self.resource_type {
            // Blob memory is shared with the guest through its mapping.
            ResourceType::Blob => return Ok(()),
            ResourceType::Pipe => self.read_from_pipe(pipe, transfer)?,
            ResourceType::Buffer => {
                let args = self.checked_create_args()?;
                let size = args.width as usize * args.height as usize;
                self.ensure_linear(size);
                renderer.read_buffer(self.id, 0, &mut self.linear[..size])?;
            }
            ResourceType::ColorBuffer => {
                let args = self.checked_create_args()?;
                let size = virgl_format_total_size(args.format, args.width, args.height)?;
                self.ensure_linear(size);
                renderer.read_color_buffer(
                    self.id,
                    0,
                    0,
                    args.width,
                    args.height,
                    &mut self.linear[..size],
                )?;
            }
        }
        self.copy_iovecs(transfer, iovecs, Direction::LinearToIov)
    }

    /// Guest to host.
    pub fn transfer_write(
        &mut self,
        renderer: &Renderer,
        pipe: Option<&mut HostPipe>,
        transfer: &Transfer3D,
        iovecs: Option<&[GfxstreamIovec]>,
    ) -> GfxstreamResult<()> {
        if self.resource_type == ResourceType::Blob {
            return Ok(());
        }
        self.copy_iovecs(transfer, iovecs, Direction::IovToLinear)?;

        match self.resource_type {
            ResourceType::Pipe => {
                let pipe = pipe.ok_or(GfxstreamError::VirtioViolation("pipe resource unattached"))?;
                let start = transfer.x as usize;
                let end = start + transfer.w as usize;
                let bytes = self
                    .linear
                    .get(start..end)
                    .ok_or(GfxstreamError::InvalidIovec)?;
                pipe.write(bytes)
            }
            ResourceType::Buffer => {
                let args = self.checked_create_args()?;
                let size = args.width as usize * args.height as usize;
                self.ensure_linear(size);
                renderer.update_buffer(self.id, 0, &self.linear[..size])
            }
            ResourceType::ColorBuffer => {
                let args = self.checked_create_args()?;
                let size = virgl_format_total_size(args.format, args.width, args.height)?;
                self.ensure_linear(size);
                renderer.update_color_buffer(
                    self.id,
                    0,
                    0,
                    args.width,
                    args.height,
                    &self.linear[..size],
                )
            }
            ResourceType::Blob => Ok(()),
        }
    }

    fn ensure_linear(&mut self, size: usize) {
        if self.linear.len() < size {
            self.linear.resize(size, 0);
        }
    }

    fn read_from_pipe(
        &mut self,
        pipe: Option<&mut HostPipe>,
        transfer: &Transfer3D,
    ) -> GfxstreamResult<()> {
        let pipe = pipe.ok_or(GfxstreamError::VirtioViolation("pipe resource unattached"))?;
        let start = transfer.x as usize;
        let wanted = transfer.w as usize;
        let dst = self
            .linear
            .get_mut(start..start + wanted)
            .ok_or(GfxstreamError::InvalidIovec)?;

        let mut read = 0;
        while read < wanted {
            let n = pipe.read(&mut dst[read..])?;
            if n == 0 {
                return Err(GfxstreamError::IoError(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
            read += n;
        }
        Ok(())
    }

    fn copy_iovecs(
        &mut self,
        transfer: &Transfer3D,
        iovecs: Option<&[GfxstreamIovec]>,
        direction: Direction,
    ) -> GfxstreamResult<()> {
        let args = self.checked_create_args()?;
        let (start, length) = transfer_range(args.format, args.width, args.height, transfer)?;
        let end = start + length;
        if length == 0 {
            return Err(GfxstreamError::VirtioViolation("nothing to transfer"));
        }
        if end > self.linear.len() {
            return Err(GfxstreamError::CheckedRange {
                field1: ("end", end),
                field2: ("linear", self.linear.len()),
            });
        }

        let iovecs = iovecs.unwrap_or(&self.iovecs);
        let mut iov_offset = 0;
        let mut copied = 0;
        for iov in iovecs {
            if copied >= length {
                break;
            }
            let iov_end = iov_offset + iov.len;
            let lower = iov_offset.max(start);
            let upper = iov_end.min(end);
            if lower < upper {
                let n = upper - lower;
                // Safe because the guest memory described by the iovecs stays mapped while the
                // resource holds them, and `lower - iov_offset + n <= iov.len`.
                unsafe {
                    let iov_ptr = (iov.base as *mut u8).add(lower - iov_offset);
                    let linear_ptr = self.linear.as_mut_ptr().add(lower);
                    match direction {
                        Direction::IovToLinear => {
                            std::ptr::copy_nonoverlapping(iov_ptr, linear_ptr, n)
                        }
                        Direction::LinearToIov => {
                            std::ptr::copy_nonoverlapping(linear_ptr, iov_ptr, n)
                        }
                    }
                }
                copied += n;
            }
            iov_offset = iov_end;
        }

        if copied < length {
            return Err(GfxstreamError::InvalidIovec);
        }
        Ok(())
    }

    pub fn map(&self) -> GfxstreamResult<GfxstreamMapping> {
        match &self.blob {
            Some(BlobBacking::Ring(ring)) => Ok(ring.as_gfxstream_mapping()),
            Some(BlobBacking::Mapping { info, size }) => Ok(GfxstreamMapping {
                ptr: info.addr,
                size: *size,
            }),
            _ => Err(GfxstreamError::MappingFailed(-libc::EINVAL)),
        }
    }

    pub fn map_info(&self) -> GfxstreamResult<u32> {
        match &self.blob {
            Some(BlobBacking::Ring(_)) => Ok(GFXSTREAM_MAP_CACHE_CACHED),
            Some(BlobBacking::Mapping { info, .. }) => Ok(info.caching),
            Some(BlobBacking::Descriptor(info)) => Ok(info.caching),
            None => Err(GfxstreamError::VirtioViolation("no blob memory")),
        }
    }

    pub fn vulkan_info(&self) -> GfxstreamResult<VulkanInfo> {
        match &self.blob {
            Some(BlobBacking::Descriptor(info)) => {
                info.vulkan_info.ok_or(GfxstreamError::InvalidVulkanInfo)
            }
            _ => Err(GfxstreamError::InvalidVulkanInfo),
        }
    }

    pub fn info(&self) -> GfxstreamResult<Resource3DInfo> {
        let args = self.checked_create_args()?;
        let (fourcc, bpp) = virgl_format_to_drm(args.format)?;
        let mut info = Resource3DInfo {
            width: args.width,
            height: args.height,
            drm_fourcc: fourcc.0,
            ..Default::default()
        };
        info.strides[0] = align_up(args.width * bpp, 16);
        Ok(info)
    }

    /// Hands the blob's OS handle out.  Ring blobs give theirs up for good.
    pub fn export(&self) -> GfxstreamResult<GfxstreamHandle> {
        match &self.blob {
            Some(BlobBacking::Ring(ring)) => {
                if !ring.is_exportable() {
                    return Err(GfxstreamError::InvalidGfxstreamHandle);
                }
                ring.release_handle()
            }
            Some(BlobBacking::Descriptor(info)) => Ok(GfxstreamHandle {
                os_handle: info
                    .descriptor
                    .try_clone()
                    .map_err(|_| GfxstreamError::InvalidGfxstreamHandle)?,
                handle_type: info.handle_type,
            }),
            _ => Err(GfxstreamError::InvalidGfxstreamHandle),
        }
    }

    /// Releases the host object.  Blob memory goes with the resource itself.
    pub fn destroy(&self, renderer: &Renderer) {
        let result = match self.resource_type {
            ResourceType::Buffer => renderer.close_buffer(self.id),
            ResourceType::ColorBuffer => renderer.close_color_buffer(self.id, 0),
            ResourceType::Pipe | ResourceType::Blob => Ok(()),
        };
        if let Err(e) = result {
            error!("resource {}: destroy failed: {}", self.id, e);
        }
    }

    /// Whether the resource survives a snapshot.  Guest iovecs and external blobs do not.
    pub fn is_snapshottable(&self) -> bool {
        match self.resource_type {
            ResourceType::Pipe | ResourceType::ColorBuffer => self.blob.is_none(),
            ResourceType::Buffer => false,
            ResourceType::Blob => self.ring_blob().is_some(),
        }
    }

    pub fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        snapshot_io::write(w, self.id)?;
        snapshot_io::write(w, self.resource_type.to_u32())?;
        match &self.create_3d {
            Some(args) => {
                snapshot_io::write(w, 1u32)?;
                for v in [
                    args.target,
                    args.format,
                    args.bind,
                    args.width,
                    args.height,
                    args.depth,
                    args.array_size,
                    args.last_level,
                    args.nr_samples,
                    args.flags,
                ] {
                    snapshot_io::write(w, v)?;
                }
            }
            None => snapshot_io::write(w, 0u32)?,
        }
        match &self.create_blob {
            Some(args) => {
                snapshot_io::write(w, 1u32)?;
                snapshot_io::write(w, args.blob_mem)?;
                snapshot_io::write(w, args.blob_flags)?;
                snapshot_io::write(w, args.blob_id)?;
                snapshot_io::write(w, args.size)?;
            }
            None => snapshot_io::write(w, 0u32)?,
        }
        snapshot_io::write_bytes(w, self.attached_contexts_bytes().as_slice())?;
        snapshot_io::write(w, self.pipe_context.unwrap_or(0))?;
        match self.ring_blob() {
            Some(ring) => {
                snapshot_io::write(w, 1u32)?;
                ring.save(w)
            }
            None => snapshot_io::write(w, 0u32),
        }
    }

    fn attached_contexts_bytes(&self) -> Vec<u8> {
        self.attached_contexts
            .iter()
            .flat_map(|ctx| ctx.to_ne_bytes())
            .collect()
    }

    /// Rebuilds a resource saved with `save`.  The host objects behind it come back with the
    /// renderer's own snapshot.
    pub fn load(r: &mut dyn Read) -> GfxstreamResult<VirtioGpuResource> {
        let id: u32 = snapshot_io::read(r)?;
        let resource_type = ResourceType::from_u32(snapshot_io::read(r)?)?;
        let mut resource = VirtioGpuResource::empty(id, resource_type);

        let has_3d: u32 = snapshot_io::read(r)?;
        if has_3d != 0 {
            let mut v = [0u32; 10];
            for slot in v.iter_mut() {
                *slot = snapshot_io::read(r)?;
            }
            resource.create_3d = Some(ResourceCreate3D {
                target: v[0],
                format: v[1],
                bind: v[2],
                width: v[3],
                height: v[4],
                depth: v[5],
                array_size: v[6],
                last_level: v[7],
                nr_samples: v[8],
                flags: v[9],
            });
        }

        let has_blob: u32 = snapshot_io::read(r)?;
        if has_blob != 0 {
            resource.create_blob = Some(ResourceCreateBlob {
                blob_mem: snapshot_io::read(r)?,
                blob_flags: snapshot_io::read(r)?,
                blob_id: snapshot_io::read(r)?,
                size: snapshot_io::read(r)?,
            });
        }

        let contexts = snapshot_io::read_bytes(r)?;
        resource.attached_contexts = contexts
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let pipe_context: u32 = snapshot_io::read(r)?;
        resource.pipe_context = (pipe_context != 0).then_some(pipe_context);

        let has_ring: u32 = snapshot_io::read(r)?;
        if has_ring != 0 {
            resource.blob = Some(BlobBacking::Ring(Arc::new(RingBlob::load(r)?)));
        }
        Ok(resource)
    }
}

#[derive(Copy, Clone)]
enum Direction {
    IovToLinear,
    LinearToIov,
}
