// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-API encoders over one guest stream.  Every call is one packet; calls with return values
//! block until the render thread's reply arrives.

pub mod gles;
pub mod magma;
pub mod render_control;
pub mod vulkan;

use std::time::Duration;

use gfxstream_host::wire::ChecksumCalculator;
use gfxstream_host::wire::Encoder;
use gfxstream_host::ProtocolError;
use log::error;
use log::trace;

pub use gles::GlesEncoder;
pub use magma::MagmaEncoder;
pub use render_control::RenderControlEncoder;
pub use vulkan::VkEncoder;

use crate::error::GuestResult;
use crate::stream::GuestStream;

/// A guest stream together with its checksum state.
pub struct CallStream {
    stream: Box<dyn GuestStream>,
    checksum: ChecksumCalculator,
}

impl CallStream {
    pub fn new(stream: Box<dyn GuestStream>) -> CallStream {
        CallStream {
            stream,
            checksum: ChecksumCalculator::new(),
        }
    }

    pub fn context_id(&self) -> u32 {
        self.stream.context_id()
    }

    pub fn checksum(&self) -> &ChecksumCalculator {
        &self.checksum
    }

    /// Switches the trailer added to later packets and expected on later replies.
    pub fn set_checksum_version(&mut self, version: u32) -> bool {
        self.checksum.set_version(version)
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.stream.set_read_timeout(timeout)
    }

    /// Sends a call without return values.
    pub fn send(&mut self, call: Encoder) -> GuestResult<()> {
        let packet = call.finish(&mut self.checksum);
        trace!("sending {} bytes", packet.len());
        self.stream.write_all(&packet)
    }

    /// Sends a call and decodes its reply with `decode`, then checks the reply's trailer.
    pub fn call<T>(
        &mut self,
        opcode: u32,
        call: Encoder,
        decode: impl FnOnce(&mut ReplyReader<'_>) -> GuestResult<T>,
    ) -> GuestResult<T> {
        self.send(call)?;
        let mut reply = ReplyReader {
            stream: self.stream.as_mut(),
            opcode,
            received: Vec::new(),
        };
        let value = decode(&mut reply)?;
        reply.finish(&mut self.checksum)?;
        Ok(value)
    }

    pub fn rc(&mut self) -> RenderControlEncoder<'_> {
        RenderControlEncoder::new(self)
    }

    pub fn gles(&mut self) -> GlesEncoder<'_> {
        GlesEncoder::new(self)
    }

    pub fn vk(&mut self) -> VkEncoder<'_> {
        VkEncoder::new(self)
    }

    pub fn magma(&mut self) -> MagmaEncoder<'_> {
        MagmaEncoder::new(self)
    }
}

/// Pulls the return values of one call off the stream.  Values are read as they are requested,
/// so variable-length arrays can size the reads that follow them.
pub struct ReplyReader<'a> {
    stream: &'a mut dyn GuestStream,
    opcode: u32,
    received: Vec<u8>,
}

impl<'a> ReplyReader<'a> {
    fn take(&mut self, len: usize) -> GuestResult<&[u8]> {
        let start = self.received.len();
        self.received.resize(start + len, 0);
        self.stream.read_exact(&mut self.received[start..])?;
        Ok(&self.received[start..])
    }

    fn take_array<const N: usize>(&mut self) -> GuestResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn get_u32(&mut self) -> GuestResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> GuestResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> GuestResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    fn get_marker(&mut self) -> GuestResult<usize> {
        Ok(u32::from_be_bytes(self.take_array()?) as usize)
    }

    pub fn get_bytes(&mut self) -> GuestResult<Vec<u8>> {
        let len = self.get_marker()?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_u32_array(&mut self) -> GuestResult<Vec<u32>> {
        let len = self.get_marker()?;
        (0..len).map(|_| self.get_u32()).collect()
    }

    pub fn get_u64_array(&mut self) -> GuestResult<Vec<u64>> {
        let len = self.get_marker()?;
        (0..len).map(|_| self.get_u64()).collect()
    }

    /// A string without its terminator.
    pub fn get_string(&mut self) -> GuestResult<String> {
        let bytes = self.get_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads the trailer of a non-empty reply and validates it.
    fn finish(mut self, checksum: &mut ChecksumCalculator) -> GuestResult<()> {
        if self.received.is_empty() {
            return Ok(());
        }
        let mut trailer = vec![0u8; checksum.checksum_byte_size()];
        self.stream.read_exact(&mut trailer)?;
        let sequence = checksum.read_sequence();
        if !checksum.validate(&self.received, &trailer) {
            error!(
                "reply to opcode {} failed its checksum at sequence {}",
                self.opcode, sequence
            );
            return Err(ProtocolError::ChecksumMismatch { sequence }.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::error::GuestError;

    /// Replays canned host bytes and drops whatever the guest writes.
    struct ScriptedStream {
        replies: VecDeque<u8>,
    }

    impl GuestStream for ScriptedStream {
        fn context_id(&self) -> u32 {
            1
        }

        fn write_all(&mut self, _bytes: &[u8]) -> GuestResult<()> {
            Ok(())
        }

        fn read_exact(&mut self, out: &mut [u8]) -> GuestResult<()> {
            if self.replies.len() < out.len() {
                return Err(GuestError::Timeout);
            }
            for b in out.iter_mut() {
                *b = self.replies.pop_front().unwrap_or_default();
            }
            Ok(())
        }

        fn set_read_timeout(&mut self, _timeout: Duration) {}
    }

    fn scripted(host_reply: Vec<u8>) -> CallStream {
        CallStream::new(Box::new(ScriptedStream {
            replies: host_reply.into(),
        }))
    }

    #[test]
    fn reply_arrays_size_their_reads() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut host = ChecksumCalculator::new();
        let mut reply = Encoder::reply();
        reply.put_i32(-3).put_u32_array(&[7, 8]).put_u64(9);
        let mut calls = scripted(reply.finish_reply(&mut host));

        let (status, array, tail) = calls
            .call(1, Encoder::new(1), |r| {
                Ok((r.get_i32()?, r.get_u32_array()?, r.get_u64()?))
            })
            .unwrap();
        assert_eq!(status, -3);
        assert_eq!(array, vec![7, 8]);
        assert_eq!(tail, 9);
    }

    #[test]
    fn corrupt_trailer_is_a_protocol_error() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut host = ChecksumCalculator::new();
        host.set_version(1);
        let mut reply = Encoder::reply();
        reply.put_u32(5);
        let mut bytes = reply.finish_reply(&mut host);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut calls = scripted(bytes);
        calls.set_checksum_version(1);
        let result = calls.call(1, Encoder::new(1), |r| r.get_u32());
        assert!(matches!(
            result,
            Err(GuestError::Host(gfxstream_host::GfxstreamError::Protocol(
                ProtocolError::ChecksumMismatch { sequence: 0 }
            )))
        ));
    }

    #[test]
    fn empty_replies_carry_no_trailer() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut calls = scripted(Vec::new());
        calls.set_checksum_version(1);
        calls.send(Encoder::new(10014)).unwrap();
        calls.call(10014, Encoder::new(10014), |_| Ok(())).unwrap();
        assert_eq!(calls.checksum().counters(), (2, 0));
    }
}
