// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A guest process's connection to the host renderer: the transport, the encoders over it, and
//! what the host advertised while the connection was set up.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use gfxstream_host::pipe::PIPE_OPENGLES;
use gfxstream_host::wire::*;
use log::debug;
use log::error;
use log::info;

use crate::config::HostConnectionType;
use crate::emulated;
use crate::emulated::EmulatedVirtioGpu;
use crate::encoder::magma;
use crate::encoder::magma::MagmaPollItem;
use crate::encoder::CallStream;
use crate::error::GuestError;
use crate::error::GuestResult;
use crate::stream::process_pipe_init;
use crate::stream::AddressSpaceStream;
use crate::stream::GuestStream;
use crate::stream::StreamParams;
use crate::stream::VirtioGpuPipeStream;

/// Native sync support, newest first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncImpl {
    None,
    NativeSyncV2,
    NativeSyncV3,
    NativeSyncV4,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum GlesMaxVersion {
    V2,
    V3_0,
    V3_1,
    V3_2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostComposition {
    None,
    V1,
    V2,
}

/// Capabilities read out of the host extension string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostFeatures {
    pub sync: SyncImpl,
    pub gles_max_version: GlesMaxVersion,
    pub host_composition: HostComposition,
    pub vulkan: bool,
    pub vulkan_async_qsri: bool,
    pub virtio_gpu_next: bool,
    pub async_unmap_buffer: bool,
    pub read_color_buffer_dma: bool,
}

impl HostFeatures {
    pub fn from_extensions(extensions: &str) -> HostFeatures {
        let has = |token: &str| has_extension(extensions, token);

        let sync = if has(EXT_NATIVE_SYNC_V4) {
            SyncImpl::NativeSyncV4
        } else if has(EXT_NATIVE_SYNC_V3) {
            SyncImpl::NativeSyncV3
        } else if has(EXT_NATIVE_SYNC_V2) {
            SyncImpl::NativeSyncV2
        } else {
            SyncImpl::None
        };

        let gles_max_version = if has(EXT_GLES_MAX_VERSION_3_2) {
            GlesMaxVersion::V3_2
        } else if has(EXT_GLES_MAX_VERSION_3_1) {
            GlesMaxVersion::V3_1
        } else if has(EXT_GLES_MAX_VERSION_3_0) {
            GlesMaxVersion::V3_0
        } else {
            GlesMaxVersion::V2
        };

        let host_composition = if has(EXT_HOST_COMPOSITION_V2) {
            HostComposition::V2
        } else if has(EXT_HOST_COMPOSITION_V1) {
            HostComposition::V1
        } else {
            HostComposition::None
        };

        HostFeatures {
            sync,
            gles_max_version,
            host_composition,
            vulkan: has(EXT_VULKAN),
            vulkan_async_qsri: has(EXT_VULKAN_ASYNC_QSRI),
            virtio_gpu_next: has(EXT_VIRTIO_GPU_NEXT),
            async_unmap_buffer: has(EXT_ASYNC_UNMAP_BUFFER),
            read_color_buffer_dma: has(EXT_READ_COLOR_BUFFER_DMA),
        }
    }
}

pub struct HostConnection {
    gpu: Arc<EmulatedVirtioGpu>,
    connection_type: HostConnectionType,
    capset_id: u32,
    calls: Mutex<CallStream>,
    extensions: String,
    features: HostFeatures,
    renderer_version: u32,
    puid: Option<u64>,
}

impl HostConnection {
    /// Connects to the process-wide emulated device over the transport named by the
    /// environment.
    pub fn get(capset_id: u32) -> GuestResult<HostConnection> {
        let gpu = emulated::get()?;
        HostConnection::connect(gpu, capset_id, HostConnectionType::from_env(capset_id))
    }

    pub fn connect(
        gpu: Arc<EmulatedVirtioGpu>,
        capset_id: u32,
        connection_type: HostConnectionType,
    ) -> GuestResult<HostConnection> {
        let params = StreamParams::from_capset(capset_id, &gpu.get_caps(capset_id)?)?;
        let stream: Box<dyn GuestStream> = match connection_type {
            HostConnectionType::VirtioGpuAddressSpace => {
                Box::new(AddressSpaceStream::create(gpu.clone(), capset_id)?)
            }
            HostConnectionType::VirtioGpuPipe => Box::new(VirtioGpuPipeStream::connect(
                gpu.clone(),
                capset_id,
                PIPE_OPENGLES,
            )?),
            t => {
                error!("no {:?} transport on the emulated device", t);
                return Err(GuestError::TransportUnavailable(t));
            }
        };

        let puid = if params.no_render_control_enc {
            None
        } else {
            Some(process_pipe_init(gpu.clone(), capset_id)?)
        };

        let mut calls = CallStream::new(stream);
        let extensions = calls.rc().host_extensions()?;
        HostConnection::negotiate_checksum(&mut calls, &extensions)?;
        let renderer_version = calls.rc().get_renderer_version()?;
        if let Some(puid) = puid {
            calls.rc().set_puid(puid)?;
        }

        info!(
            "connected over {:?} on ctx {}: renderer v{}, checksum v{}",
            connection_type,
            calls.context_id(),
            renderer_version,
            calls.checksum().version()
        );
        Ok(HostConnection {
            gpu,
            connection_type,
            capset_id,
            features: HostFeatures::from_extensions(&extensions),
            calls: Mutex::new(calls),
            extensions,
            renderer_version,
            puid,
        })
    }

    /// The host switches protocol once it decodes the select call, so the request goes out
    /// under the old protocol and the local switch follows it.
    fn negotiate_checksum(calls: &mut CallStream, extensions: &str) -> GuestResult<()> {
        let version = ChecksumCalculator::negotiate(extensions, CHECKSUM_MAX_VERSION);
        if version == 0 {
            debug!("host offers no checksum protocol");
            return Ok(());
        }
        calls.rc().select_checksum_helper(version, 0)?;
        calls.set_checksum_version(version);
        Ok(())
    }

    pub fn device(&self) -> &Arc<EmulatedVirtioGpu> {
        &self.gpu
    }

    pub fn connection_type(&self) -> HostConnectionType {
        self.connection_type
    }

    pub fn capset_id(&self) -> u32 {
        self.capset_id
    }

    pub fn context_id(&self) -> u32 {
        self.calls().context_id()
    }

    /// Exclusive access to the encoders.
    pub fn calls(&self) -> MutexGuard<'_, CallStream> {
        self.calls.lock().unwrap()
    }

    /// The host extension string, as read when the connection was set up.
    pub fn host_extensions(&self) -> &str {
        &self.extensions
    }

    pub fn features(&self) -> &HostFeatures {
        &self.features
    }

    pub fn checksum_version(&self) -> u32 {
        self.calls().checksum().version()
    }

    pub fn renderer_version(&self) -> u32 {
        self.renderer_version
    }

    /// The id the GL process pipe handed out, announced to the host with `rcSetPuid`.
    pub fn puid(&self) -> Option<u64> {
        self.puid
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        self.calls().set_read_timeout(timeout)
    }

    /// Waits for any of `items` to be signaled, for at most `timeout_ns`.
    pub fn magma_poll(&self, items: &mut [MagmaPollItem], timeout_ns: u64) -> GuestResult<i32> {
        magma::poll(&self.calls, items, timeout_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmulatedGpuConfig;
    use gfxstream_host::backend::*;
    use crate::encoder::magma::MagmaPollItem;
    use gfxstream_host::GFXSTREAM_CAPSET_GLES;
    use gfxstream_host::GFXSTREAM_CAPSET_MAGMA;
    use gfxstream_host::GFXSTREAM_CAPSET_VULKAN;

    fn gpu(with_gl: bool) -> Arc<EmulatedVirtioGpu> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = EmulatedGpuConfig {
            with_gl,
            ..Default::default()
        };
        Arc::new(EmulatedVirtioGpu::new(config).unwrap())
    }

    #[test]
    fn feature_tiers_pick_the_newest() {
        let _ = env_logger::builder().is_test(true).try_init();
        let extensions = format!(
            "{} {} {} {} {}",
            EXT_NATIVE_SYNC_V2, EXT_NATIVE_SYNC_V3, EXT_GLES_MAX_VERSION_3_0, EXT_HOST_COMPOSITION_V1, EXT_VULKAN
        );
        let features = HostFeatures::from_extensions(&extensions);
        assert_eq!(features.sync, SyncImpl::NativeSyncV3);
        assert_eq!(features.gles_max_version, GlesMaxVersion::V3_0);
        assert_eq!(features.host_composition, HostComposition::V1);
        assert!(features.vulkan);
        assert!(!features.vulkan_async_qsri);

        let none = HostFeatures::from_extensions("");
        assert_eq!(none.sync, SyncImpl::None);
        assert_eq!(none.gles_max_version, GlesMaxVersion::V2);
        assert_eq!(none.host_composition, HostComposition::None);
    }

    #[test]
    fn vulkan_connection_negotiates_checksums() {
        let conn = HostConnection::connect(
            gpu(false),
            GFXSTREAM_CAPSET_VULKAN,
            HostConnectionType::VirtioGpuAddressSpace,
        )
        .unwrap();
        assert_eq!(conn.checksum_version(), 1);
        assert_eq!(conn.renderer_version(), 1);
        // Vulkan contexts skip the process pipe.
        assert_eq!(conn.puid(), None);
        assert!(conn.features().vulkan);
        assert!(conn.host_extensions().contains(&ChecksumCalculator::max_version_str()));

        // Checksummed traffic keeps flowing.
        for _ in 0..3 {
            assert_eq!(conn.calls().rc().get_renderer_version().unwrap(), 1);
        }
    }

    #[test]
    fn gles_connection_over_pipe_announces_its_process() {
        let conn = HostConnection::connect(
            gpu(true),
            GFXSTREAM_CAPSET_GLES,
            HostConnectionType::VirtioGpuPipe,
        )
        .unwrap();
        assert!(conn.puid().is_some());
        assert_eq!(conn.checksum_version(), 1);
        assert_eq!(conn.features().gles_max_version, GlesMaxVersion::V3_0);

        let mut calls = conn.calls();
        let textures = calls.gles().gen_textures(2).unwrap();
        assert_eq!(textures.len(), 2);
        calls.gles().bind_texture(0x1234, textures[0]).unwrap();
        assert_eq!(calls.gles().get_error().unwrap(), GL_INVALID_ENUM);
        assert_eq!(calls.gles().get_error().unwrap(), GL_NO_ERROR);
    }

    #[test]
    fn unavailable_transports_are_refused() {
        let gpu = gpu(false);
        for t in [HostConnectionType::QemuPipe, HostConnectionType::AddressSpace] {
            assert!(matches!(
                HostConnection::connect(gpu.clone(), GFXSTREAM_CAPSET_VULKAN, t),
                Err(GuestError::TransportUnavailable(_))
            ));
        }
    }

    #[test]
    fn magma_poll_waits_for_a_signal() {
        let conn = Arc::new(
            HostConnection::connect(
                gpu(false),
                GFXSTREAM_CAPSET_MAGMA,
                HostConnectionType::VirtioGpuAddressSpace,
            )
            .unwrap(),
        );
        let (status, semaphore) = conn.calls().magma().create_semaphore().unwrap();
        assert_eq!(status, MAGMA_STATUS_OK);

        let mut items = [MagmaPollItem {
            semaphore,
            condition: MAGMA_POLL_CONDITION_SIGNALED,
            result: 0,
        }];
        assert_eq!(
            conn.magma_poll(&mut items, 1_000_000).unwrap(),
            MAGMA_STATUS_TIMED_OUT
        );

        let signaler = conn.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaler.calls().magma().semaphore_signal(semaphore).unwrap()
        });
        assert_eq!(
            conn.magma_poll(&mut items, 5_000_000_000).unwrap(),
            MAGMA_STATUS_OK
        );
        assert_eq!(items[0].result, MAGMA_POLL_CONDITION_SIGNALED);
        assert_eq!(handle.join().unwrap(), MAGMA_STATUS_OK);

        // Ids from another stream mean nothing here.
        let mut bogus = [MagmaPollItem {
            semaphore: semaphore + 100,
            condition: MAGMA_POLL_CONDITION_SIGNALED,
            result: 0,
        }];
        assert_eq!(
            conn.magma_poll(&mut bogus, 0).unwrap(),
            MAGMA_STATUS_INVALID_ARGS
        );
    }

    #[test]
    fn switching_before_the_host_kills_the_stream() {
        let gpu = gpu(false);
        let stream = AddressSpaceStream::create(gpu, GFXSTREAM_CAPSET_VULKAN).unwrap();
        let mut calls = CallStream::new(Box::new(stream));
        calls.set_read_timeout(Duration::from_millis(500));

        // The host still expects packets without a trailer.
        calls.set_checksum_version(1);
        calls.rc().select_checksum_helper(1, 0).unwrap();
        assert!(matches!(
            calls.rc().get_renderer_version(),
            Err(GuestError::Timeout)
        ));
    }
}
