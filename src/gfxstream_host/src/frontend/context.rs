// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet as Set;
use std::sync::Arc;

use log::debug;

use crate::asg::AsgRing;
use crate::external_object_manager::SyncDescriptorInfo;
use crate::gfxstream_utils::*;
use crate::pipe::HostPipe;
use crate::render_thread::AsgStream;
use crate::render_thread::RenderThread;
use crate::render_thread::RenderThreadState;
use crate::renderer::Renderer;
use crate::ring_blob::RingBlob;
use crate::server::servers_for_capset;

/// Host state of one virtio-gpu context.
pub struct VirtioGpuContext {
    id: u32,
    name: String,
    capset_id: u32,
    renderer: Arc<Renderer>,
    pipe: HostPipe,
    attached: Set<u32>,
    /// Render threads serving ASG ring blobs, keyed by resource id.
    asg_threads: Map<u32, RenderThread>,
    /// Arguments from `RESOURCE_CREATE_3D`, consumed by the blob with the same id.
    pending_blobs: Map<u64, ResourceCreate3D>,
    latest_sync: Option<SyncDescriptorInfo>,
}

impl VirtioGpuContext {
    pub fn new(renderer: Arc<Renderer>, id: u32, capset_id: u32, name: String) -> VirtioGpuContext {
        VirtioGpuContext {
            id,
            name,
            capset_id,
            pipe: HostPipe::new(renderer.clone(), id),
            renderer,
            attached: Set::new(),
            asg_threads: Map::new(),
            pending_blobs: Map::new(),
            latest_sync: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    pub fn pipe_mut(&mut self) -> &mut HostPipe {
        &mut self.pipe
    }

    pub fn attached(&self) -> &Set<u32> {
        &self.attached
    }

    pub fn attach(&mut self, resource_id: u32) {
        self.attached.insert(resource_id);
    }

    pub fn detach(&mut self, resource_id: u32) {
        self.attached.remove(&resource_id);
    }

    /// Starts a render thread over `ring`.  `restore` resumes a thread captured by a snapshot.
    pub fn start_asg(
        &mut self,
        resource_id: u32,
        ring: Arc<RingBlob>,
        restore: Option<RenderThreadState>,
    ) -> GfxstreamResult<()> {
        if self.asg_threads.contains_key(&resource_id) {
            return Err(GfxstreamError::AlreadyInUse);
        }

        let stream = AsgStream::new(AsgRing::new(ring)?);
        let thread = RenderThread::spawn(
            self.renderer.clone(),
            format!("gfxstream-ctx-{}-{}", self.id, resource_id),
            self.id,
            Box::new(stream),
            servers_for_capset(self.capset_id)?,
            restore,
        )?;
        debug!(
            "ctx {}: render thread {} serving resource {}",
            self.id,
            thread.id(),
            resource_id
        );
        self.asg_threads.insert(resource_id, thread);
        Ok(())
    }

    pub fn ping_asg(&self, resource_id: u32) -> GfxstreamResult<()> {
        self.asg_threads
            .get(&resource_id)
            .ok_or(GfxstreamError::InvalidResourceId)?
            .ping();
        Ok(())
    }

    /// `(resource id, render thread id)` of every ASG thread.
    pub fn asg_threads(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.asg_threads.iter().map(|(res, t)| (*res, t.id()))
    }

    pub fn add_pending_blob(&mut self, blob_id: u64, args: ResourceCreate3D) {
        self.pending_blobs.insert(blob_id, args);
    }

    pub fn take_pending_blob(&mut self, blob_id: u64) -> Option<ResourceCreate3D> {
        self.pending_blobs.remove(&blob_id)
    }

    pub fn set_latest_sync(&mut self, sync: SyncDescriptorInfo) {
        self.latest_sync = Some(sync);
    }

    pub fn take_latest_sync(&mut self) -> Option<SyncDescriptorInfo> {
        self.latest_sync.take()
    }
}

impl Drop for VirtioGpuContext {
    fn drop(&mut self) {
        for (_, mut thread) in std::mem::take(&mut self.asg_threads) {
            thread.stop_and_join();
        }
        self.pipe.close();
        debug!("ctx {} ({}) destroyed", self.id, self.name);
    }
}
