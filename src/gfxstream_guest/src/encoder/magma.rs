// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use gfxstream_host::backend::MAGMA_STATUS_TIMED_OUT;
use gfxstream_host::server::magma::*;
use gfxstream_host::wire::Encoder;
use log::warn;

use crate::encoder::CallStream;
use crate::error::GuestError;
use crate::error::GuestResult;

/// A poll that has not finished by then is reported once.
const SLOW_POLL_WARNING: Duration = Duration::from_secs(5);

/// One entry of a `magma_poll`.  `result` receives the signaled condition bits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MagmaPollItem {
    pub semaphore: u64,
    pub condition: u32,
    pub result: u32,
}

/// Magma calls.  Object ids are only meaningful on the stream that created them.
pub struct MagmaEncoder<'a> {
    calls: &'a mut CallStream,
}

impl<'a> MagmaEncoder<'a> {
    pub fn new(calls: &'a mut CallStream) -> MagmaEncoder<'a> {
        MagmaEncoder { calls }
    }

    fn status_and_id(&mut self, call: Encoder, opcode: u32) -> GuestResult<(i32, u64)> {
        self.calls
            .call(opcode, call, |r| Ok((r.get_i32()?, r.get_u64()?)))
    }

    fn status(&mut self, opcode: u32, id: u64) -> GuestResult<i32> {
        let mut call = Encoder::new(opcode);
        call.put_u64(id);
        self.calls.call(opcode, call, |r| r.get_i32())
    }

    pub fn device_query(&mut self, query_id: u64) -> GuestResult<(i32, u64)> {
        let opcode = OP_MAGMA_DEVICE_QUERY;
        let mut call = Encoder::new(opcode);
        call.put_u64(query_id);
        self.status_and_id(call, opcode)
    }

    pub fn create_context(&mut self) -> GuestResult<(i32, u64)> {
        let opcode = OP_MAGMA_CREATE_CONTEXT;
        self.status_and_id(Encoder::new(opcode), opcode)
    }

    pub fn release_context(&mut self, context: u64) -> GuestResult<i32> {
        self.status(OP_MAGMA_RELEASE_CONTEXT, context)
    }

    /// Returns the status, the buffer id and the size actually allocated.
    pub fn create_buffer(&mut self, size: u64) -> GuestResult<(i32, u64, u64)> {
        let opcode = OP_MAGMA_CREATE_BUFFER;
        let mut call = Encoder::new(opcode);
        call.put_u64(size);
        self.calls.call(opcode, call, |r| {
            Ok((r.get_i32()?, r.get_u64()?, r.get_u64()?))
        })
    }

    pub fn release_buffer(&mut self, buffer: u64) -> GuestResult<i32> {
        self.status(OP_MAGMA_RELEASE_BUFFER, buffer)
    }

    pub fn create_semaphore(&mut self) -> GuestResult<(i32, u64)> {
        let opcode = OP_MAGMA_CREATE_SEMAPHORE;
        self.status_and_id(Encoder::new(opcode), opcode)
    }

    pub fn release_semaphore(&mut self, semaphore: u64) -> GuestResult<i32> {
        self.status(OP_MAGMA_RELEASE_SEMAPHORE, semaphore)
    }

    pub fn semaphore_signal(&mut self, semaphore: u64) -> GuestResult<i32> {
        self.status(OP_MAGMA_SEMAPHORE_SIGNAL, semaphore)
    }

    pub fn semaphore_reset(&mut self, semaphore: u64) -> GuestResult<i32> {
        self.status(OP_MAGMA_SEMAPHORE_RESET, semaphore)
    }

    /// One zero-timeout poll on the host.  Fills in `result` of every item.
    pub fn poll_once(&mut self, items: &mut [MagmaPollItem]) -> GuestResult<i32> {
        let opcode = OP_MAGMA_POLL;
        let semaphores: Vec<u64> = items.iter().map(|i| i.semaphore).collect();
        let conditions: Vec<u32> = items.iter().map(|i| i.condition).collect();
        let mut call = Encoder::new(opcode);
        call.put_u64_array(&semaphores).put_u32_array(&conditions);

        let (status, results) = self
            .calls
            .call(opcode, call, |r| Ok((r.get_i32()?, r.get_u32_array()?)))?;
        if results.len() != items.len() {
            return Err(GuestError::MalformedReply(opcode));
        }
        for (item, result) in items.iter_mut().zip(results) {
            item.result = result;
        }
        Ok(status)
    }
}

/// Polls until an item is signaled or `timeout_ns` passes.  The host only answers zero-timeout
/// polls, so this spins, releasing the stream between tries so other threads can signal.
pub fn poll(
    calls: &Mutex<CallStream>,
    items: &mut [MagmaPollItem],
    timeout_ns: u64,
) -> GuestResult<i32> {
    let start = Instant::now();
    let timeout = Duration::from_nanos(timeout_ns);
    let mut warned = false;
    loop {
        let status = calls.lock().unwrap().magma().poll_once(items)?;
        // A timed out zero-timeout poll only means nothing is signaled yet.
        if status != MAGMA_STATUS_TIMED_OUT {
            return Ok(status);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(MAGMA_STATUS_TIMED_OUT);
        }
        if !warned && elapsed >= SLOW_POLL_WARNING {
            warn!("magma poll on {} items still waiting after {:?}", items.len(), elapsed);
            warned = true;
        }
        thread::yield_now();
    }
}
