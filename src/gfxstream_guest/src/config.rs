// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest configuration read from the environment.

use std::env;
use std::path::PathBuf;

use gfxstream_host::GFXSTREAM_CAPSET_VULKAN;

pub const TRANSPORT_ENV: &str = "GFXSTREAM_TRANSPORT";
pub const WITH_GL_ENV: &str = "GFXSTREAM_EMULATED_VIRTIO_GPU_WITH_GL";
pub const WITH_VK_ENV: &str = "GFXSTREAM_EMULATED_VIRTIO_GPU_WITH_VK";
pub const WITH_VK_SNAPSHOTS_ENV: &str = "GFXSTREAM_EMULATED_VIRTIO_GPU_WITH_VK_SNAPSHOTS";
pub const VK_ICD_ENV: &str = "ANDROID_EMU_VK_ICD";
pub const VK_LOADER_PATH_ENV: &str = "ANDROID_EMU_VK_LOADER_PATH";

/// How a host connection reaches the render thread serving it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostConnectionType {
    /// `/dev/qemu_pipe` of older emulators.
    QemuPipe,
    /// The goldfish address-space device.
    AddressSpace,
    /// A virtio-gpu pipe resource carrying `pipe:opengles`.
    VirtioGpuPipe,
    /// A virtio-gpu ring blob shared with a render thread.
    VirtioGpuAddressSpace,
}

impl HostConnectionType {
    /// Maps a `GFXSTREAM_TRANSPORT` value to a connection type for a context of `capset_id`.
    /// Unrecognized values fall back to the QEMU pipe.
    pub fn from_transport(transport: Option<&str>, capset_id: u32) -> HostConnectionType {
        match transport.unwrap_or("") {
            "" => HostConnectionType::VirtioGpuAddressSpace,
            "asg" => HostConnectionType::AddressSpace,
            "pipe" => HostConnectionType::QemuPipe,
            "virtio-gpu-asg" | "virtio-gpu-pipe" => {
                if capset_id == GFXSTREAM_CAPSET_VULKAN {
                    HostConnectionType::VirtioGpuAddressSpace
                } else {
                    HostConnectionType::VirtioGpuPipe
                }
            }
            _ => HostConnectionType::QemuPipe,
        }
    }

    pub fn from_env(capset_id: u32) -> HostConnectionType {
        let transport = env::var(TRANSPORT_ENV).ok();
        HostConnectionType::from_transport(transport.as_deref(), capset_id)
    }
}

/// `Y`/`y` enables, anything else disables, unset keeps `default`.
fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => v.starts_with('Y') || v.starts_with('y'),
        Err(_) => default,
    }
}

/// The Vulkan driver the host renderer is asked to load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VkIcd {
    /// Whatever the system loader picks.
    #[default]
    Native,
    SwiftShader,
    MoltenVk,
    Lavapipe,
    Other(String),
}

impl VkIcd {
    pub fn parse(value: &str) -> VkIcd {
        match value.to_ascii_lowercase().as_str() {
            "" | "native" => VkIcd::Native,
            "swiftshader" => VkIcd::SwiftShader,
            "moltenvk" => VkIcd::MoltenVk,
            "lavapipe" => VkIcd::Lavapipe,
            _ => VkIcd::Other(value.to_string()),
        }
    }
}

/// Back-ends the emulated virtio-gpu device brings up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmulatedGpuConfig {
    pub with_gl: bool,
    pub with_vk: bool,
    pub with_vk_snapshots: bool,
    pub vk_icd: VkIcd,
    pub vk_loader_path: Option<PathBuf>,
}

impl Default for EmulatedGpuConfig {
    fn default() -> EmulatedGpuConfig {
        EmulatedGpuConfig {
            with_gl: false,
            with_vk: true,
            with_vk_snapshots: false,
            vk_icd: VkIcd::Native,
            vk_loader_path: None,
        }
    }
}

impl EmulatedGpuConfig {
    pub fn from_env() -> EmulatedGpuConfig {
        let defaults = EmulatedGpuConfig::default();
        EmulatedGpuConfig {
            with_gl: env_flag(WITH_GL_ENV, defaults.with_gl),
            with_vk: env_flag(WITH_VK_ENV, defaults.with_vk),
            with_vk_snapshots: env_flag(WITH_VK_SNAPSHOTS_ENV, defaults.with_vk_snapshots),
            vk_icd: env::var(VK_ICD_ENV)
                .map(|v| VkIcd::parse(&v))
                .unwrap_or_default(),
            vk_loader_path: env::var_os(VK_LOADER_PATH_ENV).map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gfxstream_host::GFXSTREAM_CAPSET_GLES;
    use gfxstream_host::GFXSTREAM_CAPSET_MAGMA;

    #[test]
    fn transport_selection() {
        use HostConnectionType::*;
        let vk = GFXSTREAM_CAPSET_VULKAN;
        let gles = GFXSTREAM_CAPSET_GLES;

        assert_eq!(HostConnectionType::from_transport(None, gles), VirtioGpuAddressSpace);
        assert_eq!(HostConnectionType::from_transport(Some(""), vk), VirtioGpuAddressSpace);
        assert_eq!(HostConnectionType::from_transport(Some("asg"), vk), AddressSpace);
        assert_eq!(HostConnectionType::from_transport(Some("pipe"), vk), QemuPipe);
        assert_eq!(
            HostConnectionType::from_transport(Some("virtio-gpu-pipe"), vk),
            VirtioGpuAddressSpace
        );
        assert_eq!(
            HostConnectionType::from_transport(Some("virtio-gpu-asg"), gles),
            VirtioGpuPipe
        );
        assert_eq!(
            HostConnectionType::from_transport(Some("virtio-gpu-asg"), GFXSTREAM_CAPSET_MAGMA),
            VirtioGpuPipe
        );
        assert_eq!(HostConnectionType::from_transport(Some("bogus"), vk), QemuPipe);
    }

    #[test]
    fn icd_names() {
        assert_eq!(VkIcd::parse("swiftshader"), VkIcd::SwiftShader);
        assert_eq!(VkIcd::parse("MoltenVK"), VkIcd::MoltenVk);
        assert_eq!(VkIcd::parse(""), VkIcd::Native);
        assert_eq!(VkIcd::parse("mesa"), VkIcd::Other("mesa".to_string()));
    }

    #[test]
    fn emulated_defaults() {
        let config = EmulatedGpuConfig::default();
        assert!(!config.with_gl);
        assert!(config.with_vk);
        assert!(!config.with_vk_snapshots);
    }
}
