// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest side of the gfxstream transport, running against an in-process emulated virtio-gpu
//! device: the command streams, the API encoders, and the per-process host connection.

pub mod config;
pub mod emulated;
pub mod encoder;
pub mod error;
pub mod host_connection;
pub mod stream;

pub use crate::config::EmulatedGpuConfig;
pub use crate::config::HostConnectionType;
pub use crate::config::VkIcd;
pub use crate::emulated::EmulatedVirtioGpu;
pub use crate::emulated::GuestMapping;
pub use crate::error::GuestError;
pub use crate::error::GuestResult;
pub use crate::host_connection::HostConnection;
pub use crate::host_connection::HostFeatures;
