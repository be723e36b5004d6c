// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Capability tokens of the host extension string.  The host never revokes a token during a
//! session, so guests cache the string after the first query.

use crate::features::Feature;
use crate::features::FeatureSet;
use crate::wire::ChecksumCalculator;

pub const EXT_NATIVE_SYNC_V2: &str = "ANDROID_EMU_native_sync_v2";
pub const EXT_NATIVE_SYNC_V3: &str = "ANDROID_EMU_native_sync_v3";
pub const EXT_NATIVE_SYNC_V4: &str = "ANDROID_EMU_native_sync_v4";
pub const EXT_HOST_COMPOSITION_V1: &str = "ANDROID_EMU_host_composition_v1";
pub const EXT_HOST_COMPOSITION_V2: &str = "ANDROID_EMU_host_composition_v2";
pub const EXT_GLES_MAX_VERSION_2: &str = "ANDROID_EMU_gles_max_version_2";
pub const EXT_GLES_MAX_VERSION_3_0: &str = "ANDROID_EMU_gles_max_version_3_0";
pub const EXT_GLES_MAX_VERSION_3_1: &str = "ANDROID_EMU_gles_max_version_3_1";
pub const EXT_GLES_MAX_VERSION_3_2: &str = "ANDROID_EMU_gles_max_version_3_2";
pub const EXT_VULKAN: &str = "ANDROID_EMU_vulkan";
pub const EXT_DEFERRED_VULKAN_COMMANDS: &str = "ANDROID_EMU_deferred_vulkan_commands";
pub const EXT_VULKAN_NULL_OPTIONAL_STRINGS: &str = "ANDROID_EMU_vulkan_null_optional_strings";
pub const EXT_VULKAN_IGNORED_HANDLES: &str = "ANDROID_EMU_vulkan_ignored_handles";
pub const EXT_VIRTIO_GPU_NEXT: &str = "ANDROID_EMU_virtio_gpu_next";
pub const EXT_YUV_CACHE: &str = "ANDROID_EMU_YUVCache";
pub const EXT_ASYNC_UNMAP_BUFFER: &str = "ANDROID_EMU_async_unmap_buffer";
pub const EXT_VULKAN_FREE_MEMORY_SYNC: &str = "ANDROID_EMU_vulkan_free_memory_sync";
pub const EXT_VIRTIO_GPU_NATIVE_SYNC: &str = "ANDROID_EMU_virtio_gpu_native_sync";
pub const EXT_VULKAN_SHADER_FLOAT16_INT8: &str = "ANDROID_EMU_vulkan_shader_float16_int8";
pub const EXT_VULKAN_ASYNC_QUEUE_SUBMIT: &str = "ANDROID_EMU_vulkan_async_queue_submit";
pub const EXT_HOST_SIDE_TRACING: &str = "ANDROID_EMU_host_side_tracing";
pub const EXT_ASYNC_FRAME_COMMANDS: &str = "ANDROID_EMU_async_frame_commands";
pub const EXT_VULKAN_QUEUE_SUBMIT_WITH_COMMANDS: &str =
    "ANDROID_EMU_vulkan_queue_submit_with_commands";
pub const EXT_VULKAN_BATCHED_DESCRIPTOR_SET_UPDATE: &str =
    "ANDROID_EMU_vulkan_batched_descriptor_set_update";
pub const EXT_SYNC_BUFFER_DATA: &str = "ANDROID_EMU_sync_buffer_data";
pub const EXT_VULKAN_ASYNC_QSRI: &str = "ANDROID_EMU_vulkan_async_qsri";
pub const EXT_READ_COLOR_BUFFER_DMA: &str = "ANDROID_EMU_read_color_buffer_dma";
pub const EXT_HWC_MULTI_CONFIGS: &str = "ANDROID_EMU_hwc_multi_configs";
pub const EXT_VULKAN_AUX_COMMAND_MEMORY: &str = "ANDROID_EMU_vulkan_aux_command_memory";
pub const EXT_SHARED_SLOTS_HOST_MEMORY_ALLOCATOR: &str =
    "ANDROID_EMU_has_shared_slots_host_memory_allocator";

/// Builds the space-separated host extension string advertised for `features`.
pub fn host_extension_string(features: &FeatureSet) -> String {
    let mut tokens: Vec<String> = Vec::new();
    if features.is_enabled(Feature::GlPipeChecksum) {
        tokens.push(ChecksumCalculator::max_version_str());
    }

    let mut fixed: Vec<&str> = Vec::new();
    let mut push_all = |list: &[&'static str]| fixed.extend_from_slice(list);

    if features.is_enabled(Feature::VirtioGpuNativeSync) {
        push_all(&[
            EXT_NATIVE_SYNC_V2,
            EXT_NATIVE_SYNC_V3,
            EXT_NATIVE_SYNC_V4,
            EXT_VIRTIO_GPU_NATIVE_SYNC,
        ]);
    }
    if features.is_enabled(Feature::HostComposition) {
        push_all(&[EXT_HOST_COMPOSITION_V1, EXT_HOST_COMPOSITION_V2]);
    }
    if features.is_enabled(Feature::Gles) {
        push_all(&[
            EXT_GLES_MAX_VERSION_2,
            EXT_GLES_MAX_VERSION_3_0,
            EXT_YUV_CACHE,
            EXT_ASYNC_UNMAP_BUFFER,
            EXT_SYNC_BUFFER_DATA,
            EXT_READ_COLOR_BUFFER_DMA,
        ]);
    }
    if features.is_enabled(Feature::Vulkan) {
        push_all(&[
            EXT_VULKAN,
            EXT_DEFERRED_VULKAN_COMMANDS,
            EXT_VULKAN_NULL_OPTIONAL_STRINGS,
            EXT_VULKAN_IGNORED_HANDLES,
            EXT_VULKAN_FREE_MEMORY_SYNC,
            EXT_VULKAN_SHADER_FLOAT16_INT8,
            EXT_VULKAN_ASYNC_QUEUE_SUBMIT,
            EXT_VULKAN_QUEUE_SUBMIT_WITH_COMMANDS,
            EXT_VULKAN_BATCHED_DESCRIPTOR_SET_UPDATE,
            EXT_VULKAN_AUX_COMMAND_MEMORY,
        ]);
        if features.is_enabled(Feature::AsyncQsri) {
            push_all(&[EXT_VULKAN_ASYNC_QSRI]);
        }
    }
    if features.is_enabled(Feature::VirtioGpuNext) {
        push_all(&[EXT_VIRTIO_GPU_NEXT, EXT_SHARED_SLOTS_HOST_MEMORY_ALLOCATOR]);
    }
    push_all(&[
        EXT_HOST_SIDE_TRACING,
        EXT_ASYNC_FRAME_COMMANDS,
        EXT_HWC_MULTI_CONFIGS,
    ]);

    tokens.extend(fixed.into_iter().map(String::from));
    tokens.join(" ")
}

/// True if `extensions` advertises `token` as a whole word.
pub fn has_extension(extensions: &str, token: &str) -> bool {
    extensions.split_whitespace().any(|t| t == token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_token_follows_feature() {
        let mut features = FeatureSet::new();
        features.set(Feature::GlPipeChecksum, true);
        let ext = host_extension_string(&features);
        assert!(has_extension(&ext, "ANDROID_EMU_CHECKSUM_HELPER_v1"));
        assert_eq!(ChecksumCalculator::negotiate(&ext, 1), 1);

        features.set(Feature::GlPipeChecksum, false);
        let ext = host_extension_string(&features);
        assert_eq!(ChecksumCalculator::negotiate(&ext, 1), 0);
    }

    #[test]
    fn vulkan_tokens() {
        let mut features = FeatureSet::new();
        assert!(!has_extension(&host_extension_string(&features), EXT_VULKAN));
        features.set(Feature::Vulkan, true);
        let ext = host_extension_string(&features);
        assert!(has_extension(&ext, EXT_VULKAN));
        // Prefix matches are not matches.
        assert!(!has_extension(&ext, "ANDROID_EMU_vulk"));
    }
}
