// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A named thread that runs queued callbacks in FIFO order.  The renderer keeps one for
//! per-process cleanup after a context dies and one for asynchronous GPU waits.

use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::unbounded;
use crossbeam_channel::Sender;
use log::debug;
use log::error;

use crate::gfxstream_utils::GfxstreamError;
use crate::gfxstream_utils::GfxstreamResult;

pub type WorkerCallback = Box<dyn FnOnce() + Send>;

enum Message {
    Run(WorkerCallback),
    Exit,
}

pub struct CallbackWorker {
    name: String,
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackWorker {
    pub fn new(name: &str) -> GfxstreamResult<CallbackWorker> {
        let (sender, receiver) = unbounded::<Message>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Messages queued before Exit still run.
                while let Ok(Message::Run(callback)) = receiver.recv() {
                    callback();
                }
            })?;

        Ok(CallbackWorker {
            name: name.to_string(),
            sender,
            handle: Some(handle),
        })
    }

    pub fn enqueue(&self, callback: impl FnOnce() + Send + 'static) -> GfxstreamResult<()> {
        self.sender
            .send(Message::Run(Box::new(callback)))
            .map_err(|_| GfxstreamError::BrokenPromise)
    }

    /// Blocks until everything queued so far has run.
    pub fn wait_idle(&self) -> GfxstreamResult<()> {
        let (done, idle) = crossbeam_channel::bounded::<()>(1);
        self.enqueue(move || {
            let _ = done.send(());
        })?;
        idle.recv().map_err(|_| GfxstreamError::BrokenPromise)
    }
}

impl Drop for CallbackWorker {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Exit);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} worker panicked", self.name);
            } else {
                debug!("{} worker drained", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn runs_in_order_and_drains_on_drop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let worker = CallbackWorker::new("test-cleanup").unwrap();
            for i in 0..16 {
                let seen = seen.clone();
                worker.enqueue(move || seen.lock().unwrap().push(i)).unwrap();
            }
        }
        assert_eq!(*seen.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn wait_idle_is_a_barrier() {
        let worker = CallbackWorker::new("test-barrier").unwrap();
        let seen = Arc::new(Mutex::new(false));
        let flag = seen.clone();
        worker
            .enqueue(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                *flag.lock().unwrap() = true;
            })
            .unwrap();
        worker.wait_idle().unwrap();
        assert!(*seen.lock().unwrap());
    }
}
