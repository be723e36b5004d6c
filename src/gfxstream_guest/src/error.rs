// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use gfxstream_host::GfxstreamError;
use gfxstream_host::ProtocolError;
use remain::sorted;
use thiserror::Error;

use crate::config::HostConnectionType;

/// An error generated by the guest side of the transport.
#[sorted]
#[derive(Error, Debug)]
pub enum GuestError {
    /// The emulated device's worker thread is gone.
    #[error("the emulated virtio-gpu device has stopped")]
    DeviceStopped,
    /// The host renderer reported an error.
    #[error("host: {0}")]
    Host(GfxstreamError),
    /// No capset with this id is exposed by the device.
    #[error("invalid capset {0}")]
    InvalidCapset(u32),
    /// A command buffer whose size is not a multiple of 4 bytes.
    #[error("command buffer submitted with invalid size: {0}")]
    InvalidCommandSize(usize),
    /// The resource id is not known to the guest registry.
    #[error("invalid resource id {0}")]
    InvalidResourceId(u32),
    /// A reply did not have the layout the call expects.
    #[error("malformed reply to opcode {0}")]
    MalformedReply(u32),
    /// The resource was not created mappable.
    #[error("resource {0} is not mappable")]
    NotMappable(u32),
    /// The GL process pipe did not hand out a process id.
    #[error("process pipe handshake failed")]
    ProcessPipe,
    /// The host stopped answering on a stream.
    #[error("stream closed")]
    StreamClosed,
    /// A fence or a reply did not arrive in time.
    #[error("timed out")]
    Timeout,
    /// A transfer reaches past the end of the resource.
    #[error("transfer of {size} bytes at {offset} exceeds resource size {limit}")]
    TransferOutOfBounds { offset: u64, size: u64, limit: u64 },
    /// The selected transport has no implementation on this device.
    #[error("transport {0:?} is not available")]
    TransportUnavailable(HostConnectionType),
}

impl From<GfxstreamError> for GuestError {
    fn from(e: GfxstreamError) -> GuestError {
        match e {
            GfxstreamError::Timeout => GuestError::Timeout,
            e => GuestError::Host(e),
        }
    }
}

impl From<ProtocolError> for GuestError {
    fn from(e: ProtocolError) -> GuestError {
        GuestError::Host(GfxstreamError::Protocol(e))
    }
}

/// The result of an operation in this crate.
pub type GuestResult<T> = std::result::Result<T, GuestError>;
