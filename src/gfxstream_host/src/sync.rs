// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot promise / shared-future pair used for task completion and emulated fences.

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;

enum Slot<T> {
    Pending,
    Ready(T),
    Abandoned,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// The producing half.  Dropping an unfulfilled promise wakes waiters with `BrokenPromise`.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// The consuming half.  Clones observe the same value.
pub struct SharedFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SharedFuture<T> {
    fn clone(&self) -> Self {
        SharedFuture {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Promise<T> {
    pub fn new() -> (Promise<T>, SharedFuture<T>) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            cond: Condvar::new(),
        });
        (
            Promise {
                shared: Some(shared.clone()),
            },
            SharedFuture { shared },
        )
    }

    pub fn set_value(mut self, value: T) {
        if let Some(shared) = self.shared.take() {
            *shared.slot.lock().unwrap() = Slot::Ready(value);
            shared.cond.notify_all();
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            *shared.slot.lock().unwrap() = Slot::Abandoned;
            shared.cond.notify_all();
        }
    }
}

impl<T: Clone> SharedFuture<T> {
    /// A future that is already satisfied.
    pub fn ready(value: T) -> SharedFuture<T> {
        SharedFuture {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Ready(value)),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        !matches!(*self.shared.slot.lock().unwrap(), Slot::Pending)
    }

    pub fn wait(&self) -> GfxstreamResult<T> {
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            match &*slot {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::Abandoned => return Err(GfxstreamError::BrokenPromise),
                Slot::Pending => slot = self.shared.cond.wait(slot).unwrap(),
            }
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> GfxstreamResult<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock().unwrap();
        loop {
            match &*slot {
                Slot::Ready(v) => return Ok(v.clone()),
                Slot::Abandoned => return Err(GfxstreamError::BrokenPromise),
                Slot::Pending => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GfxstreamError::Timeout);
                    }
                    slot = self.shared.cond.wait_timeout(slot, deadline - now).unwrap().0;
                }
            }
        }
    }
}
