// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ordering primitives: per-ring fence timelines and per-image present timelines.

mod qsri;
mod virtio_gpu;

pub use qsri::QsriCallback;
pub use qsri::VkQsriTimeline;
pub use virtio_gpu::FenceCompletionCallback;
pub use virtio_gpu::TaskId;
pub use virtio_gpu::VirtioGpuRing;
pub use virtio_gpu::VirtioGpuTimelines;
