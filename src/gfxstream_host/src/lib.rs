// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host side of the gfxstream transport: the virtio-gpu frontend, render threads decoding guest
//! command streams, and the registries and timelines that order access to shared GPU objects.

#[macro_use]
mod macros;

pub mod asg;
pub mod backend;
mod cleanup;
pub mod color_buffer;
pub mod external_object_manager;
pub mod features;
pub mod formats;
pub mod frontend;
mod gfxstream_os;
mod gfxstream_utils;
pub mod memory_properties;
pub mod pipe;
pub mod reconstruction;
pub mod render_thread;
pub mod renderer;
pub mod ring_blob;
pub mod server;
mod snapshot_io;
pub mod sync;
pub mod timelines;
pub mod wire;

pub use crate::frontend::GfxstreamBuilder;
pub use crate::frontend::VirtioGpuFrontend;
pub use crate::gfxstream_os::AsRawDescriptor;
pub use crate::gfxstream_os::FromRawDescriptor as GfxstreamFromRawDescriptor;
pub use crate::gfxstream_os::IntoRawDescriptor as GfxstreamIntoRawDescriptor;
pub use crate::gfxstream_os::MappedRegion as GfxstreamMappedRegion;
pub use crate::gfxstream_os::SafeDescriptor as GfxstreamDescriptor;
pub use crate::gfxstream_utils::*;
