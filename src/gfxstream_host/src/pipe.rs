// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host end of a guest pipe connection.
//!
//! A connection starts by naming its service with a NUL terminated string.  `pipe:opengles`
//! gets a render thread speaking every API; `pipe:GLProcessPipe` hands out a process id the
//! guest then announces with `rcSetPuid`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use log::debug;
use log::warn;

use crate::gfxstream_utils::*;
use crate::render_thread::ChannelStream;
use crate::render_thread::RenderThread;
use crate::renderer::Renderer;
use crate::server::servers_for_pipe;

pub const PIPE_OPENGLES: &str = "pipe:opengles";
pub const PIPE_GL_PROCESS: &str = "pipe:GLProcessPipe";

/// What a guest writes on `pipe:GLProcessPipe` to ask for its process id.
pub const GL_PROCESS_PIPE_CONFIRM: i32 = 100;

const PIPE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SERVICE_NAME: usize = 256;

enum PipeState {
    AwaitingName(Vec<u8>),
    OpenGles {
        thread: RenderThread,
        to_host: Sender<Vec<u8>>,
        from_host: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    },
    GlProcess {
        puid: Option<u64>,
        reply: Vec<u8>,
    },
    Closed,
}

pub struct HostPipe {
    renderer: Arc<Renderer>,
    ctx_id: u32,
    state: PipeState,
}

impl HostPipe {
    pub fn new(renderer: Arc<Renderer>, ctx_id: u32) -> HostPipe {
        HostPipe {
            renderer,
            ctx_id,
            state: PipeState::AwaitingName(Vec::new()),
        }
    }

    /// The service the guest connected to, once named.
    pub fn service(&self) -> Option<&'static str> {
        match self.state {
            PipeState::OpenGles { .. } => Some(PIPE_OPENGLES),
            PipeState::GlProcess { .. } => Some(PIPE_GL_PROCESS),
            _ => None,
        }
    }

    pub fn render_thread(&self) -> Option<&RenderThread> {
        match &self.state {
            PipeState::OpenGles { thread, .. } => Some(thread),
            _ => None,
        }
    }

    fn connect(&mut self, name: &[u8]) -> GfxstreamResult<()> {
        let name = std::str::from_utf8(name)?;
        self.state = match name {
            PIPE_OPENGLES => {
                let (to_host, from_guest) = unbounded();
                let (to_guest, from_host) = unbounded();
                let thread = RenderThread::spawn(
                    self.renderer.clone(),
                    format!("gfxstream-pipe-{}", self.ctx_id),
                    self.ctx_id,
                    Box::new(ChannelStream::new(from_guest, to_guest)),
                    servers_for_pipe(),
                    None,
                )?;
                PipeState::OpenGles {
                    thread,
                    to_host,
                    from_host,
                    pending: Vec::new(),
                }
            }
            PIPE_GL_PROCESS => PipeState::GlProcess {
                puid: None,
                reply: Vec::new(),
            },
            other => {
                warn!("ctx {}: unknown pipe service {:?}", self.ctx_id, other);
                self.state = PipeState::Closed;
                return Err(GfxstreamError::Unsupported);
            }
        };
        debug!("ctx {}: connected to {}", self.ctx_id, name);
        Ok(())
    }

    /// Guest to host bytes.
    pub fn write(&mut self, bytes: &[u8]) -> GfxstreamResult<()> {
        if let PipeState::AwaitingName(partial) = &mut self.state {
            let nul = bytes.iter().position(|b| *b == 0);
            let (head, rest) = match nul {
                Some(pos) => (&bytes[..pos], &bytes[pos + 1..]),
                None => (bytes, &[][..]),
            };
            partial.extend_from_slice(head);
            let too_long = partial.len() > MAX_SERVICE_NAME;
            let name = match nul {
                Some(_) => std::mem::take(partial),
                None => Vec::new(),
            };
            if too_long {
                self.state = PipeState::Closed;
                return Err(GfxstreamError::InvalidCommandBuffer);
            }
            if nul.is_none() {
                return Ok(());
            }
            self.connect(&name)?;
            if rest.is_empty() {
                return Ok(());
            }
            return self.write(rest);
        }

        match &mut self.state {
            PipeState::OpenGles {
                thread, to_host, ..
            } => {
                to_host
                    .send(bytes.to_vec())
                    .map_err(|_| GfxstreamError::BrokenPromise)?;
                thread.ping();
            }
            PipeState::GlProcess { puid, reply } => {
                if bytes.len() < 4 {
                    return Err(GfxstreamError::InvalidCommandSize(bytes.len()));
                }
                let confirm = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if confirm != GL_PROCESS_PIPE_CONFIRM {
                    warn!("ctx {}: unexpected process pipe request {}", self.ctx_id, confirm);
                    return Err(GfxstreamError::InvalidCommandBuffer);
                }
                let id = match *puid {
                    Some(id) => id,
                    None => {
                        let id = self.renderer.gen_puid();
                        *puid = Some(id);
                        id
                    }
                };
                reply.extend_from_slice(&id.to_le_bytes());
            }
            PipeState::AwaitingName(_) => (),
            PipeState::Closed => return Err(GfxstreamError::BrokenPromise),
        }
        Ok(())
    }

    /// Host to guest bytes.  Blocks until the render thread replies on `pipe:opengles`.
    pub fn read(&mut self, out: &mut [u8]) -> GfxstreamResult<usize> {
        match &mut self.state {
            PipeState::OpenGles {
                from_host, pending, ..
            } => {
                if pending.is_empty() {
                    match from_host.recv_timeout(PIPE_READ_TIMEOUT) {
                        Ok(bytes) => *pending = bytes,
                        Err(RecvTimeoutError::Timeout) => return Err(GfxstreamError::Timeout),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(GfxstreamError::BrokenPromise)
                        }
                    }
                    // Coalesce whatever else is already queued.
                    while let Ok(more) = from_host.try_recv() {
                        pending.extend_from_slice(&more);
                    }
                }
                let n = out.len().min(pending.len());
                out[..n].copy_from_slice(&pending[..n]);
                pending.drain(..n);
                Ok(n)
            }
            PipeState::GlProcess { reply, .. } => {
                let n = out.len().min(reply.len());
                out[..n].copy_from_slice(&reply[..n]);
                reply.drain(..n);
                Ok(n)
            }
            PipeState::AwaitingName(_) => Ok(0),
            PipeState::Closed => Err(GfxstreamError::BrokenPromise),
        }
    }

    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, PipeState::Closed) {
            PipeState::OpenGles { mut thread, .. } => thread.stop_and_join(),
            PipeState::GlProcess { puid: Some(puid), .. } => {
                self.renderer.cleanup_process(puid);
            }
            _ => (),
        }
    }
}

impl Drop for HostPipe {
    fn drop(&mut self) {
        self.close();
    }
}
