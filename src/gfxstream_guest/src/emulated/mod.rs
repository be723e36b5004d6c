// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A virtio-gpu device emulated in-process on top of the host renderer.

mod fence;
pub mod resource;
pub mod virtio_gpu;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use log::info;
use once_cell::sync::Lazy;

pub use resource::GuestMapping;
pub use virtio_gpu::EmulatedVirtioGpu;
pub use virtio_gpu::VIRTIO_GPU_FLAG_FENCE;

use crate::config::EmulatedGpuConfig;
use crate::error::GuestResult;

static INSTANCE: Lazy<Mutex<Weak<EmulatedVirtioGpu>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// The process-wide device, created from the environment on first use.  The device goes away
/// with its last user and the next call brings up a fresh one.
pub fn get() -> GuestResult<Arc<EmulatedVirtioGpu>> {
    let mut instance = INSTANCE.lock().unwrap();
    if let Some(gpu) = instance.upgrade() {
        return Ok(gpu);
    }

    let gpu = Arc::new(EmulatedVirtioGpu::new(EmulatedGpuConfig::from_env())?);
    *instance = Arc::downgrade(&gpu);
    info!("emulated virtio-gpu device created");
    Ok(gpu)
}

/// Number of live handles on the process-wide device.
pub fn num_active_users() -> usize {
    INSTANCE.lock().unwrap().strong_count()
}
