// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap as Map;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use gfxstream_host::sync::Promise;
use gfxstream_host::sync::SharedFuture;
use log::debug;
use log::error;
use log::warn;

use crate::error::GuestResult;

struct EmulatedFence {
    signaler: Option<Promise<()>>,
    waitable: SharedFuture<()>,
}

/// Fences handed out by the emulated device, signaled by the host fence callback.
pub struct FenceTable {
    next_id: AtomicU32,
    fences: Mutex<Map<u32, EmulatedFence>>,
}

impl Default for FenceTable {
    fn default() -> FenceTable {
        FenceTable {
            next_id: AtomicU32::new(1),
            fences: Mutex::new(Map::new()),
        }
    }
}

impl FenceTable {
    pub fn create(&self) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (signaler, waitable) = Promise::new();
        let previous = self.fences.lock().unwrap().insert(
            id,
            EmulatedFence {
                signaler: Some(signaler),
                waitable,
            },
        );
        if previous.is_some() {
            error!("fence {} created twice", id);
        }
        debug!("created fence {}", id);
        id
    }

    /// Completes the fence.  Unknown and already signaled ids are logged and ignored.
    pub fn signal(&self, id: u32) {
        let mut fences = self.fences.lock().unwrap();
        match fences.get_mut(&id).map(|f| f.signaler.take()) {
            Some(Some(signaler)) => {
                debug!("signaling fence {}", id);
                signaler.set_value(());
            }
            Some(None) => warn!("fence {} signaled twice", id),
            None => warn!("failed to find fence {}", id),
        }
    }

    /// The waitable of `id`, or `None` if the fence is unknown.
    pub fn waitable(&self, id: u32) -> Option<SharedFuture<()>> {
        self.fences.lock().unwrap().get(&id).map(|f| f.waitable.clone())
    }

    /// Unknown fences count as signaled.
    pub fn wait(&self, id: u32, timeout: Duration) -> GuestResult<()> {
        let waitable = match self.waitable(id) {
            Some(w) => w,
            None => {
                warn!("fence {} already signaled", id);
                return Ok(());
            }
        };
        waitable.wait_timeout(timeout).map_err(|e| {
            error!("waiting for fence {}: {}", id, e);
            e.into()
        })
    }
}
