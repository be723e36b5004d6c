// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Named host feature toggles.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use log::warn;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamFlags;
use crate::gfxstream_utils::GfxstreamResult;

macro_rules! features {
    ($($variant:ident),* $(,)?) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Feature {
            $($variant),*
        }

        impl Feature {
            pub const ALL: &'static [Feature] = &[$(Feature::$variant),*];

            pub fn name(&self) -> &'static str {
                match self {
                    $(Feature::$variant => stringify!($variant)),*
                }
            }
        }
    };
}

features! {
    AsyncComposeSupport,
    AsyncQsri,
    DedicatedAhbMemoryType,
    DeviceMemoryOnly,
    ExternalBlob,
    GlAsyncSwap,
    GlDirectMem,
    GlPipeChecksum,
    Gles,
    HostComposition,
    NativeTextureDecompression,
    SystemBlob,
    VirtioGpuNativeSync,
    VirtioGpuNext,
    Vulkan,
    VulkanBatchedDescriptorSetUpdate,
    VulkanIgnoredHandles,
    VulkanNullOptionalStrings,
    VulkanQueueSubmitWithCommands,
    VulkanShaderFloat16Int8,
    VulkanSnapshots,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Feature {
    type Err = GfxstreamError;

    fn from_str(s: &str) -> GfxstreamResult<Feature> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or(GfxstreamError::InvalidGfxstreamBuild("unknown feature name"))
    }
}

/// The set of enabled host features.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FeatureSet {
    enabled: BTreeSet<Feature>,
}

impl FeatureSet {
    pub fn new() -> FeatureSet {
        Default::default()
    }

    /// Defaults derived from the renderer flags.
    pub fn from_flags(flags: GfxstreamFlags) -> FeatureSet {
        let mut features = FeatureSet::new();
        features
            .set(Feature::Gles, flags.uses_gles())
            .set(Feature::Vulkan, flags.uses_vulkan())
            .set(Feature::VulkanSnapshots, flags.uses_vulkan_snapshots())
            .set(Feature::ExternalBlob, flags.uses_external_blob())
            .set(Feature::SystemBlob, flags.uses_system_blob())
            .set(Feature::GlPipeChecksum, true)
            .set(Feature::VirtioGpuNext, true)
            .set(Feature::VirtioGpuNativeSync, true)
            .set(Feature::HostComposition, true)
            .set(Feature::AsyncQsri, flags.uses_vulkan());
        features
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) -> &mut FeatureSet {
        if enabled {
            self.enabled.insert(feature);
        } else {
            self.enabled.remove(&feature);
        }
        self
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.enabled.contains(&feature)
    }

    /// Applies overrides of the form `Name:enabled,Other:disabled`.
    ///
    /// Unknown names are logged and skipped so that newer configurations keep working against
    /// older hosts; malformed entries fail.
    pub fn apply_overrides(&mut self, overrides: &str) -> GfxstreamResult<()> {
        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, state) = entry.split_once(':').ok_or(
                GfxstreamError::InvalidGfxstreamBuild("feature override missing ':'"),
            )?;
            let enabled = match state.trim() {
                "enabled" => true,
                "disabled" => false,
                _ => {
                    return Err(GfxstreamError::InvalidGfxstreamBuild(
                        "feature override must be enabled or disabled",
                    ))
                }
            };
            match name.trim().parse::<Feature>() {
                Ok(feature) => {
                    self.set(feature, enabled);
                }
                Err(_) => warn!("ignoring unknown feature override {}", name),
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.enabled.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides() {
        let mut features = FeatureSet::from_flags(GfxstreamFlags::new().use_vulkan(true));
        assert!(features.is_enabled(Feature::Vulkan));
        assert!(!features.is_enabled(Feature::DeviceMemoryOnly));

        features
            .apply_overrides("DeviceMemoryOnly:enabled, Vulkan:disabled,NoSuchThing:enabled")
            .unwrap();
        assert!(features.is_enabled(Feature::DeviceMemoryOnly));
        assert!(!features.is_enabled(Feature::Vulkan));

        assert!(features.apply_overrides("Vulkan").is_err());
        assert!(features.apply_overrides("Vulkan:maybe").is_err());
    }

    #[test]
    fn names_round_trip() {
        for feature in Feature::ALL {
            assert_eq!(feature.name().parse::<Feature>().unwrap(), *feature);
        }
    }
}
