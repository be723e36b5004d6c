// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end guest flows against the emulated device.

use std::sync::Arc;
use std::time::Duration;

use gfxstream_guest::emulated::VIRTIO_GPU_FLAG_FENCE;
use gfxstream_guest::encoder::CallStream;
use gfxstream_guest::stream::AddressSpaceStream;
use gfxstream_guest::*;
use gfxstream_host::backend::VK_SUCCESS;
use gfxstream_host::formats::GL_RGBA;
use gfxstream_host::frontend::protocol::*;
use gfxstream_host::server::gles::GL_TEXTURE_2D;
use gfxstream_host::*;
use zerocopy::AsBytes;

const HOST_VISIBLE: u32 = 0x2;

fn device(config: EmulatedGpuConfig) -> Arc<EmulatedVirtioGpu> {
    let _ = env_logger::builder().is_test(true).try_init();
    Arc::new(EmulatedVirtioGpu::new(config).unwrap())
}

fn vk_connection(gpu: &Arc<EmulatedVirtioGpu>) -> HostConnection {
    HostConnection::connect(
        gpu.clone(),
        GFXSTREAM_CAPSET_VULKAN,
        HostConnectionType::VirtioGpuAddressSpace,
    )
    .unwrap()
}

/// Instance and device handles.
fn vk_device(conn: &HostConnection) -> (u64, u64) {
    let mut calls = conn.calls();
    let instance = calls.vk().create_instance("scenarios").unwrap().unwrap();
    let device = calls.vk().create_device(instance).unwrap().unwrap();
    (instance, device)
}

fn qsri_export(image: u64) -> GfxstreamCreateQsriExportVk {
    let (image_handle_lo, image_handle_hi) = convert_64_to_32(image);
    GfxstreamCreateQsriExportVk {
        hdr: GfxstreamHeader {
            op_code: GFXSTREAM_CREATE_QSRI_EXPORT_VK,
        },
        image_handle_lo,
        image_handle_hi,
    }
}

#[test]
fn host_visible_memory_backs_a_blob() {
    let gpu = device(EmulatedGpuConfig::default());
    let conn = vk_connection(&gpu);
    let (instance, device) = vk_device(&conn);

    let props = conn
        .calls()
        .vk()
        .get_physical_device_memory_properties(instance)
        .unwrap();
    let type_index = props
        .memory_types
        .iter()
        .position(|t| t.property_flags & HOST_VISIBLE != 0)
        .unwrap() as u32;

    let size = 4096;
    let memory = conn
        .calls()
        .vk()
        .allocate_memory(device, size, type_index, 7)
        .unwrap()
        .unwrap();

    let ctx = conn.context_id();
    let blob = gpu
        .create_blob(
            ctx,
            GFXSTREAM_BLOB_MEM_HOST3D,
            GFXSTREAM_BLOB_FLAG_USE_MAPPABLE | GFXSTREAM_BLOB_FLAG_USE_SHAREABLE,
            7,
            size,
        )
        .unwrap();
    assert!(blob >= 1);
    let mapping = gpu.map(blob).unwrap();
    assert!(!mapping.as_ptr().is_null());
    assert_eq!(mapping.size() as u64, size);

    mapping.write(0, &[0xde, 0xad, 0xbe, 0xef]).unwrap();
    gpu.transfer_to_host(ctx, blob, 0, 4).unwrap();
    gpu.wait(blob).unwrap();
    gpu.transfer_from_host(ctx, blob, 0, 4).unwrap();
    gpu.wait(blob).unwrap();
    let mut out = [0u8; 4];
    gpu.map(blob).unwrap().read(0, &mut out).unwrap();
    assert_eq!(out, [0xde, 0xad, 0xbe, 0xef]);
    assert!(mapping.write(size as usize - 1, &[0, 0]).is_err());
    assert!(gpu.transfer_to_host(ctx, blob, 4094, 4).is_err());

    gpu.unmap(blob).unwrap();
    gpu.destroy_resource(ctx, blob).unwrap();
    conn.calls().vk().free_memory(device, memory).unwrap();
}

#[test]
fn blob_ids_are_consumed_once() {
    let gpu = device(EmulatedGpuConfig::default());
    let conn = vk_connection(&gpu);
    let ctx = conn.context_id();

    // Nothing was allocated under this id: the host refuses the blob and the map breaks.
    let blob = gpu
        .create_blob(ctx, GFXSTREAM_BLOB_MEM_HOST3D, GFXSTREAM_BLOB_FLAG_USE_MAPPABLE, 99, 4096)
        .unwrap();
    assert!(gpu.map(blob).is_err());
    assert!(gpu.wait(blob).is_err());
}

#[test]
fn qsri_exports_wait_for_the_release() {
    let gpu = device(EmulatedGpuConfig::default());
    let conn = vk_connection(&gpu);
    let ctx = conn.context_id();
    let image = 0x5151_0000_0042;

    let first = gpu
        .submit_cmd(ctx, qsri_export(image).as_bytes(), 0, VIRTIO_GPU_FLAG_FENCE, None)
        .unwrap()
        .unwrap();
    let second = gpu
        .submit_cmd(ctx, qsri_export(image).as_bytes(), 0, VIRTIO_GPU_FLAG_FENCE, None)
        .unwrap()
        .unwrap();
    assert!(matches!(
        gpu.wait_on_emulated_fence(first, 50),
        Err(GuestError::Timeout)
    ));
    assert!(matches!(
        gpu.wait_on_emulated_fence(second, 0),
        Err(GuestError::Timeout)
    ));

    let released = conn
        .calls()
        .vk()
        .queue_signal_release_image_android(0, image)
        .unwrap();
    assert_eq!(released, Ok(()));
    gpu.wait_on_emulated_fence(first, 5000).unwrap();
    gpu.wait_on_emulated_fence(second, 5000).unwrap();
}

#[test]
fn ring_fences_complete_in_any_signal_order() {
    let gpu = device(EmulatedGpuConfig::default());
    let conn = vk_connection(&gpu);
    let ctx = conn.context_id();

    // Each export holds its host fence until the image is released, so until then only the
    // calls below complete them.
    let images = [0x5151_0000_0001u64, 0x5151_0000_0002, 0x5151_0000_0003];
    let fences: Vec<u32> = images
        .iter()
        .map(|image| {
            gpu.submit_cmd(ctx, qsri_export(*image).as_bytes(), 0, VIRTIO_GPU_FLAG_FENCE, None)
                .unwrap()
                .unwrap()
        })
        .collect();
    let (f1, f2, f3) = (fences[0], fences[1], fences[2]);
    assert!(f1 < f2 && f2 < f3);

    let handler = gpu.fence_handler();
    let signal = |fence_id: u32| {
        handler.call(GfxstreamFence {
            flags: GFXSTREAM_FLAG_INFO_RING_IDX,
            fence_id: fence_id as u64,
            ctx_id: ctx,
            ring_idx: 0,
        })
    };

    signal(f2);
    signal(f3);
    gpu.wait_on_emulated_fence(f2, 0).unwrap();
    gpu.wait_on_emulated_fence(f3, 0).unwrap();
    assert!(matches!(
        gpu.wait_on_emulated_fence(f1, 50),
        Err(GuestError::Timeout)
    ));

    let waiter = {
        let gpu = gpu.clone();
        std::thread::spawn(move || gpu.wait_on_emulated_fence(f1, 5000))
    };
    signal(f1);
    waiter.join().unwrap().unwrap();

    // The host's own in-order completions arrive afterwards and undo nothing.
    for image in images {
        let released = conn
            .calls()
            .vk()
            .queue_signal_release_image_android(0, image)
            .unwrap();
        assert_eq!(released, Ok(()));
    }
    let placeholder = GfxstreamPlaceholderCommandVk {
        hdr: GfxstreamHeader {
            op_code: GFXSTREAM_PLACEHOLDER_COMMAND_VK,
        },
        ..Default::default()
    };
    let f4 = gpu
        .submit_cmd(ctx, placeholder.as_bytes(), 0, VIRTIO_GPU_FLAG_FENCE, None)
        .unwrap()
        .unwrap();
    assert!(f4 > f3);
    gpu.wait_on_emulated_fence(f4, 5000).unwrap();
    for fence in fences {
        gpu.wait_on_emulated_fence(fence, 0).unwrap();
    }
}

#[test]
fn color_buffers_round_trip_through_render_control() {
    let gpu = device(EmulatedGpuConfig {
        with_gl: true,
        ..Default::default()
    });
    let conn = HostConnection::connect(
        gpu,
        GFXSTREAM_CAPSET_GLES,
        HostConnectionType::VirtioGpuAddressSpace,
    )
    .unwrap();
    assert!(conn.puid().is_some());

    let mut calls = conn.calls();
    let handle = calls.rc().create_color_buffer(4, 4, GL_RGBA).unwrap();
    assert_ne!(handle, 0);

    let red = [0xff, 0, 0, 0xff].repeat(4);
    assert_eq!(
        calls.rc().update_color_buffer(handle, 1, 1, 2, 2, &red).unwrap(),
        0
    );
    let mut rect = vec![0u8; 2 * 2 * 4];
    calls.rc().read_color_buffer(handle, 1, 1, 2, 2, &mut rect).unwrap();
    assert_eq!(rect, red);
    let mut corner = [0u8; 4];
    calls.rc().read_color_buffer(handle, 0, 0, 1, 1, &mut corner).unwrap();
    assert_eq!(corner, [0u8; 4]);
    calls.rc().close_color_buffer(handle).unwrap();

    let textures = calls.gles().gen_textures(1).unwrap();
    calls.gles().bind_texture(GL_TEXTURE_2D, textures[0]).unwrap();
    calls
        .gles()
        .tex_image_2d(GL_TEXTURE_2D, 0, GL_RGBA, 2, 2, GL_RGBA, 0x1401, &red)
        .unwrap();
    assert_eq!(calls.gles().get_error().unwrap(), 0);
    calls.gles().delete_textures(&textures).unwrap();
    calls.gles().finish().unwrap();
}

#[test]
fn connections_negotiate_checksums_before_switching() {
    let gpu = device(EmulatedGpuConfig::default());
    let conn = vk_connection(&gpu);
    assert_eq!(conn.checksum_version(), 1);
    let (write, read) = conn.calls().checksum().counters();
    assert!(write > 0);
    assert!(read > 0);
    assert!(write >= read);

    // A guest that switches first sends a trailer the host does not expect.
    let stream = AddressSpaceStream::create(gpu, GFXSTREAM_CAPSET_VULKAN).unwrap();
    let mut calls = CallStream::new(Box::new(stream));
    calls.set_read_timeout(Duration::from_millis(300));
    calls.set_checksum_version(1);
    assert!(calls.rc().get_renderer_version().is_err());
}

#[test]
fn vulkan_objects_survive_a_snapshot() {
    let gpu = device(EmulatedGpuConfig {
        with_vk_snapshots: true,
        ..Default::default()
    });
    let conn = vk_connection(&gpu);
    let (_instance, device) = vk_device(&conn);
    let (buffer, memory, requirements) = {
        let mut calls = conn.calls();
        let buffer = calls.vk().create_buffer(device, 1024).unwrap().unwrap();
        let requirements = calls
            .vk()
            .get_buffer_memory_requirements(device, buffer)
            .unwrap();
        let memory = calls
            .vk()
            .allocate_memory(device, requirements.size, 0, 0)
            .unwrap()
            .unwrap();
        (buffer, memory, requirements)
    };
    assert!(requirements.size >= 1024);

    let saved = gpu.snapshot_save().unwrap();
    gpu.snapshot_restore(&saved).unwrap();

    // The old connection's ring went with the old host state; a new one sees the restored
    // handles.
    let fresh = vk_connection(&gpu);
    let bound = fresh
        .calls()
        .vk()
        .bind_buffer_memory(device, buffer, memory, 0)
        .unwrap();
    assert_eq!(bound, Ok(()));
    assert_eq!(VK_SUCCESS, 0);
    drop(conn);
}

#[test]
fn process_pipes_hand_out_distinct_ids() {
    let gpu = device(EmulatedGpuConfig {
        with_gl: true,
        ..Default::default()
    });
    let a = HostConnection::connect(
        gpu.clone(),
        GFXSTREAM_CAPSET_GLES,
        HostConnectionType::VirtioGpuPipe,
    )
    .unwrap();
    let b = HostConnection::connect(gpu, GFXSTREAM_CAPSET_GLES, HostConnectionType::VirtioGpuPipe)
        .unwrap();
    assert_ne!(a.puid(), b.puid());
    assert_ne!(a.context_id(), b.context_id());
    assert_eq!(
        a.calls().gles().get_string(0x1F00).unwrap(),
        b.calls().gles().get_string(0x1F00).unwrap()
    );
}
