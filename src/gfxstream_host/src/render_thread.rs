// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! render_thread: one host thread per guest stream.
//!
//! The thread drains its stream into a buffer, decodes every complete packet, checks the trailing
//! checksum, dispatches to the first server context that claims the opcode and writes the reply
//! back.  Between packets it services a control channel used to wake it (`Ping`), park it for a
//! snapshot (`Pause`) and shut it down (`Stop`).

use std::cell::RefCell;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::bounded;
use crossbeam_channel::unbounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use log::debug;
use log::error;
use log::warn;

use crate::asg::AsgRing;
use crate::gfxstream_utils::*;
use crate::renderer::Renderer;
use crate::server::DispatchContext;
use crate::server::ServerContext;
use crate::snapshot_io;
use crate::sync::Promise;
use crate::sync::SharedFuture;
use crate::wire::next_packet;
use crate::wire::ChecksumCalculator;
use crate::wire::Decoder;
use crate::wire::Encoder;
use crate::wire::PACKET_HEADER_SIZE;

/// How long an idle thread sleeps before looking at its stream again.
const IDLE_WAIT: Duration = Duration::from_millis(10);
/// How long a reply may wait for room in a full ring.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static DISPATCH_ERRORS: LogThrottle = LogThrottle::new(64);

/// Byte transport between the guest encoder and a render thread.
pub trait RenderStream: Send {
    /// Appends everything the guest has produced so far to `buf` without blocking.  Returns
    /// `None` once the guest side is gone.
    fn read_available(&mut self, buf: &mut Vec<u8>) -> GfxstreamResult<Option<usize>>;

    fn write_all(&mut self, bytes: &[u8]) -> GfxstreamResult<()>;
}

/// A stream over the two rings of an ASG blob.
pub struct AsgStream {
    ring: AsgRing,
}

impl AsgStream {
    pub fn new(ring: AsgRing) -> AsgStream {
        AsgStream { ring }
    }
}

impl RenderStream for AsgStream {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> GfxstreamResult<Option<usize>> {
        Ok(Some(self.ring.to_host().drain_into(buf)?))
    }

    fn write_all(&mut self, bytes: &[u8]) -> GfxstreamResult<()> {
        let start = Instant::now();
        let mut rest = bytes;
        while !rest.is_empty() {
            let n = self.ring.from_host().write(rest)?;
            rest = &rest[n..];
            if n == 0 {
                if start.elapsed() > WRITE_TIMEOUT {
                    return Err(GfxstreamError::Timeout);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

/// A stream fed by a host pipe connection.
pub struct ChannelStream {
    from_guest: Receiver<Vec<u8>>,
    to_guest: Sender<Vec<u8>>,
}

impl ChannelStream {
    pub fn new(from_guest: Receiver<Vec<u8>>, to_guest: Sender<Vec<u8>>) -> ChannelStream {
        ChannelStream {
            from_guest,
            to_guest,
        }
    }
}

impl RenderStream for ChannelStream {
    fn read_available(&mut self, buf: &mut Vec<u8>) -> GfxstreamResult<Option<usize>> {
        let mut total = 0;
        loop {
            match self.from_guest.try_recv() {
                Ok(bytes) => {
                    total += bytes.len();
                    buf.extend_from_slice(&bytes);
                }
                Err(TryRecvError::Empty) => return Ok(Some(total)),
                Err(TryRecvError::Disconnected) if total == 0 => return Ok(None),
                Err(TryRecvError::Disconnected) => return Ok(Some(total)),
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> GfxstreamResult<()> {
        self.to_guest
            .send(bytes.to_vec())
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe).into())
    }
}

/// Stream state that has to survive a snapshot.  Captured while the thread is paused at a packet
/// boundary, so `pending` only ever holds an incomplete packet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderThreadState {
    pub checksum_version: u32,
    pub checksum_write: u32,
    pub checksum_read: u32,
    pub puid: u64,
    pub pending: Vec<u8>,
}

impl RenderThreadState {
    pub fn save(&self, w: &mut dyn Write) -> GfxstreamResult<()> {
        snapshot_io::write(w, self.checksum_version)?;
        snapshot_io::write(w, self.checksum_write)?;
        snapshot_io::write(w, self.checksum_read)?;
        snapshot_io::write(w, self.puid)?;
        snapshot_io::write_bytes(w, &self.pending)
    }

    pub fn load(r: &mut dyn Read) -> GfxstreamResult<RenderThreadState> {
        Ok(RenderThreadState {
            checksum_version: snapshot_io::read(r)?,
            checksum_write: snapshot_io::read(r)?,
            checksum_read: snapshot_io::read(r)?,
            puid: snapshot_io::read(r)?,
            pending: snapshot_io::read_bytes(r)?,
        })
    }
}

pub enum RenderControl {
    /// New bytes are waiting in the stream.
    Ping,
    /// Park at the next packet boundary until `resume` yields or is dropped.
    Pause {
        paused: Promise<RenderThreadState>,
        resume: Receiver<()>,
    },
    Stop,
}

/// Cloneable handle used to steer a render thread from other threads.
#[derive(Clone)]
pub struct RenderThreadControl {
    name: String,
    sender: Sender<RenderControl>,
    exited: SharedFuture<()>,
}

impl RenderThreadControl {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ping(&self) {
        let _ = self.sender.send(RenderControl::Ping);
    }

    pub fn pause(&self, timeout: Duration) -> GfxstreamResult<PauseGuard> {
        let (paused, state) = Promise::new();
        let (resume_tx, resume_rx) = bounded(1);
        self.sender
            .send(RenderControl::Pause {
                paused,
                resume: resume_rx,
            })
            .map_err(|_| GfxstreamError::BrokenPromise)?;
        let state = state.wait_timeout(timeout)?;
        Ok(PauseGuard {
            state,
            resume: resume_tx,
        })
    }

    pub fn stop(&self) {
        let _ = self.sender.send(RenderControl::Stop);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_ready()
    }

    pub fn wait_exit(&self) {
        // A broken promise means the thread is gone as well.
        let _ = self.exited.wait();
    }
}

/// Keeps a render thread parked.  The thread resumes when the guard is dropped.
pub struct PauseGuard {
    state: RenderThreadState,
    resume: Sender<()>,
}

impl PauseGuard {
    pub fn state(&self) -> &RenderThreadState {
        &self.state
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let _ = self.resume.try_send(());
    }
}

/// Identity of the render thread running on the current OS thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderThreadInfo {
    pub name: String,
    pub ctx_id: u32,
    pub puid: u64,
}

thread_local! {
    static CURRENT_RENDER_THREAD: RefCell<Option<RenderThreadInfo>> = RefCell::new(None);
}

impl RenderThreadInfo {
    /// `None` on threads that are not render threads.
    pub fn current() -> Option<RenderThreadInfo> {
        CURRENT_RENDER_THREAD.with(|c| c.borrow().clone())
    }

    fn install(info: Option<RenderThreadInfo>) {
        CURRENT_RENDER_THREAD.with(|c| *c.borrow_mut() = info);
    }

    fn set_puid(puid: u64) {
        CURRENT_RENDER_THREAD.with(|c| {
            if let Some(info) = c.borrow_mut().as_mut() {
                info.puid = puid;
            }
        });
    }
}

struct RenderWorker {
    id: u64,
    name: String,
    ctx_id: u32,
    renderer: Arc<Renderer>,
    stream: Box<dyn RenderStream>,
    servers: Vec<Box<dyn ServerContext>>,
    control: Receiver<RenderControl>,
    checksum: ChecksumCalculator,
    puid: u64,
    buf: Vec<u8>,
}

impl RenderWorker {
    fn run(&mut self) {
        RenderThreadInfo::install(Some(RenderThreadInfo {
            name: self.name.clone(),
            ctx_id: self.ctx_id,
            puid: self.puid,
        }));

        if let Err(e) = self.serve() {
            error!("{}: render thread exiting: {}", self.name, e);
        }

        for server in self.servers.iter_mut() {
            server.on_exit(&self.renderer);
        }
        self.renderer.cleanup_process(self.puid);
        self.renderer.unregister_render_thread(self.id);
        RenderThreadInfo::install(None);
        debug!("{}: render thread exited", self.name);
    }

    fn serve(&mut self) -> GfxstreamResult<()> {
        loop {
            loop {
                match self.control.try_recv() {
                    Ok(msg) => {
                        if !self.handle_control(msg) {
                            return Ok(());
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Ok(()),
                }
            }

            let read = match self.stream.read_available(&mut self.buf)? {
                Some(n) => n,
                None => {
                    debug!("{}: guest closed the stream", self.name);
                    return Ok(());
                }
            };

            self.process_packets()?;

            if read == 0 {
                match self.control.recv_timeout(IDLE_WAIT) {
                    Ok(msg) => {
                        if !self.handle_control(msg) {
                            return Ok(());
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => (),
                    Err(RecvTimeoutError::Disconnected) => return Ok(()),
                }
            }
        }
    }

    /// Returns false when the thread must exit.
    fn handle_control(&mut self, msg: RenderControl) -> bool {
        match msg {
            RenderControl::Ping => true,
            RenderControl::Stop => false,
            RenderControl::Pause { paused, resume } => {
                let (version, (write, read)) = (self.checksum.version(), self.checksum.counters());
                paused.set_value(RenderThreadState {
                    checksum_version: version,
                    checksum_write: write,
                    checksum_read: read,
                    puid: self.puid,
                    pending: self.buf.clone(),
                });
                // Either a resume message or a dropped guard releases the thread.
                let _ = resume.recv();
                true
            }
        }
    }

    fn process_packets(&mut self) -> GfxstreamResult<()> {
        let buf = std::mem::take(&mut self.buf);
        let mut consumed = 0;
        let mut result = Ok(());

        loop {
            // The checksum version can change between packets.
            let trailer = self.checksum.checksum_byte_size();
            let header = match next_packet(&buf[consumed..], trailer) {
                Ok(Some(h)) => h,
                Ok(None) => break,
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            };

            let end = consumed + header.packet_len();
            match self.process_one(&buf[consumed..end], header.opcode(), trailer) {
                Ok(()) => (),
                Err(e) if e.is_fatal() => {
                    result = Err(e);
                    consumed = end;
                    break;
                }
                Err(e) => {
                    if DISPATCH_ERRORS.should_log() {
                        warn!(
                            "{}: opcode {} failed: {} ({} failures)",
                            self.name,
                            header.opcode(),
                            e,
                            DISPATCH_ERRORS.count()
                        );
                    }
                }
            }
            consumed = end;
        }

        self.buf = buf;
        self.buf.drain(..consumed);
        result
    }

    fn process_one(&mut self, packet: &[u8], opcode: u32, trailer: usize) -> GfxstreamResult<()> {
        let (body, tail) = packet.split_at(packet.len() - trailer);
        if !self.checksum.validate(body, tail) {
            return Err(ProtocolError::ChecksumMismatch {
                sequence: self.checksum.read_sequence(),
            }
            .into());
        }

        let server = self
            .servers
            .iter_mut()
            .find(|s| s.handles(opcode))
            .ok_or(ProtocolError::UnknownOpcode(opcode))?;

        let puid = self.puid;
        let mut dec = Decoder::new(opcode, &body[PACKET_HEADER_SIZE..]);
        let mut reply = Encoder::reply();
        {
            let mut ctx = DispatchContext {
                renderer: &self.renderer,
                checksum: &mut self.checksum,
                ctx_id: self.ctx_id,
                puid: &mut self.puid,
                packet: body,
                for_snapshot_load: false,
            };
            server.dispatch(&mut ctx, &mut dec, &mut reply)?;
        }
        dec.finish()?;

        if self.puid != puid {
            RenderThreadInfo::set_puid(self.puid);
        }

        if !reply.is_empty() {
            let out = reply.finish_reply(&mut self.checksum);
            self.stream.write_all(&out)?;
        }
        Ok(())
    }
}

/// Owner of a running render thread.  Dropping it stops and joins the thread.
pub struct RenderThread {
    id: u64,
    control: RenderThreadControl,
    handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    /// Starts serving `stream` with `servers`.  `restore` resumes a stream captured by a
    /// snapshot.
    pub fn spawn(
        renderer: Arc<Renderer>,
        name: String,
        ctx_id: u32,
        stream: Box<dyn RenderStream>,
        mut servers: Vec<Box<dyn ServerContext>>,
        restore: Option<RenderThreadState>,
    ) -> GfxstreamResult<RenderThread> {
        let (sender, receiver) = unbounded();
        let (exit_promise, exited) = Promise::new();
        let control = RenderThreadControl {
            name: name.clone(),
            sender,
            exited,
        };
        let id = renderer.register_render_thread(control.clone());

        if let Some(state) = &restore {
            for server in servers.iter_mut() {
                server.on_restore(&renderer, ctx_id, state.puid);
            }
        }
        let restore = restore.unwrap_or_default();
        let checksum = ChecksumCalculator::restore(
            restore.checksum_version,
            restore.checksum_write,
            restore.checksum_read,
        );
        let mut worker = RenderWorker {
            id,
            name: name.clone(),
            ctx_id,
            renderer: renderer.clone(),
            stream,
            servers,
            control: receiver,
            checksum,
            puid: restore.puid,
            buf: restore.pending,
        };

        let handle = thread::Builder::new().name(name).spawn(move || {
            worker.run();
            drop(worker);
            exit_promise.set_value(());
        });
        let handle = match handle {
            Ok(h) => h,
            Err(e) => {
                renderer.unregister_render_thread(id);
                return Err(e.into());
            }
        };

        Ok(RenderThread {
            id,
            control,
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn control(&self) -> &RenderThreadControl {
        &self.control
    }

    pub fn ping(&self) {
        self.control.ping();
    }

    pub fn stop_and_join(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.control.stop();
            if handle.join().is_err() {
                error!("{}: render thread panicked", self.control.name());
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubGlBackend;
    use crate::backend::StubVkBackend;
    use crate::external_object_manager::ExternalObjectManager;
    use crate::features::FeatureSet;
    use crate::renderer::RendererConfig;
    use crate::ring_blob::RingBlob;
    use crate::server::render_control::OP_RC_GET_RENDERER_VERSION;
    use crate::server::render_control::OP_RC_SELECT_CHECKSUM_HELPER;
    use crate::server::servers_for_capset;
    use crate::server::vulkan::OP_VK_CREATE_INSTANCE;

    fn renderer() -> Arc<Renderer> {
        Renderer::new(RendererConfig {
            features: FeatureSet::new(),
            gl: Some(Arc::new(StubGlBackend::new())),
            vk: None,
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap()
    }

    fn spawn(renderer: &Arc<Renderer>) -> (RenderThread, Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        let (to_host, from_guest) = unbounded();
        let (to_guest, from_host) = unbounded();
        let thread = RenderThread::spawn(
            renderer.clone(),
            "test-render".to_string(),
            1,
            Box::new(ChannelStream::new(from_guest, to_guest)),
            servers_for_capset(GFXSTREAM_CAPSET_GLES).unwrap(),
            None,
        )
        .unwrap();
        (thread, to_host, from_host)
    }

    #[test]
    fn split_packets_are_reassembled() {
        let r = renderer();
        let (thread, to_host, from_host) = spawn(&r);
        let packet = Encoder::new(OP_RC_GET_RENDERER_VERSION).finish(&mut ChecksumCalculator::new());

        let (a, b) = packet.split_at(3);
        to_host.send(a.to_vec()).unwrap();
        thread.ping();
        to_host.send(b.to_vec()).unwrap();
        thread.ping();

        let reply = from_host.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(reply.len(), 4);
        assert_eq!(r.render_thread_count(), 1);
        drop(thread);
        assert_eq!(r.render_thread_count(), 0);
    }

    #[test]
    fn overrun_ring_cursor_ends_the_thread() {
        let r = renderer();
        let blob = Arc::new(RingBlob::create_with_host_memory(1, 4096, 8).unwrap());
        let thread = RenderThread::spawn(
            r.clone(),
            "test-asg".to_string(),
            1,
            Box::new(AsgStream::new(AsgRing::new(blob.clone()).unwrap())),
            servers_for_capset(GFXSTREAM_CAPSET_GLES).unwrap(),
            None,
        )
        .unwrap();

        // to_host_write jumps past the end of the ring.
        unsafe { (blob.map() as *mut u32).write_volatile(0x10_0000) };
        thread.ping();
        thread.control().wait_exit();
        assert!(thread.control().has_exited());
        assert_eq!(r.render_thread_count(), 0);
    }

    fn vk_renderer() -> (Arc<Renderer>, Arc<StubVkBackend>) {
        let vk = Arc::new(StubVkBackend::new());
        let renderer = Renderer::new(RendererConfig {
            features: FeatureSet::new(),
            gl: None,
            vk: Some(vk.clone()),
            magma: None,
            external_objects: ExternalObjectManager::new(),
        })
        .unwrap();
        (renderer, vk)
    }

    #[test]
    fn resumed_thread_releases_restored_vulkan_objects() {
        let (r, _) = vk_renderer();
        let (to_host, from_guest) = unbounded();
        let (to_guest, from_host) = unbounded();
        let thread = RenderThread::spawn(
            r.clone(),
            "test-vk".to_string(),
            1,
            Box::new(ChannelStream::new(from_guest, to_guest)),
            servers_for_capset(GFXSTREAM_CAPSET_VULKAN).unwrap(),
            None,
        )
        .unwrap();
        let mut create = Encoder::new(OP_VK_CREATE_INSTANCE);
        create.put_string("resume");
        to_host.send(create.finish(&mut ChecksumCalculator::new())).unwrap();
        thread.ping();
        assert_eq!(from_host.recv_timeout(Duration::from_secs(5)).unwrap().len(), 12);

        let mut saved = Vec::new();
        {
            let _paused = r.pause_all_render_threads().unwrap();
            r.save_snapshot(&mut saved).unwrap();
        }

        let (restored, vk) = vk_renderer();
        restored.load_snapshot(&mut saved.as_slice()).unwrap();
        assert_eq!(vk.live_objects(), 1);

        let (_to_host, from_guest) = unbounded();
        let (to_guest, _from_host) = unbounded();
        let resumed = RenderThread::spawn(
            restored.clone(),
            "test-vk-resumed".to_string(),
            1,
            Box::new(ChannelStream::new(from_guest, to_guest)),
            servers_for_capset(GFXSTREAM_CAPSET_VULKAN).unwrap(),
            Some(RenderThreadState::default()),
        )
        .unwrap();
        drop(resumed);
        assert_eq!(vk.live_objects(), 0);
        assert!(restored.vk_state().live_handles().is_empty());
        drop(thread);
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let r = renderer();
        let (thread, to_host, _from_host) = spawn(&r);
        to_host
            .send(Encoder::new(55555).finish(&mut ChecksumCalculator::new()))
            .unwrap();
        thread.ping();
        thread.control().wait_exit();
        assert!(thread.control().has_exited());
    }

    #[test]
    fn bad_checksum_is_fatal() {
        let r = renderer();
        let (thread, to_host, from_host) = spawn(&r);
        let mut guest = ChecksumCalculator::new();
        let mut select = Encoder::new(OP_RC_SELECT_CHECKSUM_HELPER);
        select.put_u32(1).put_u32(0);
        to_host.send(select.finish(&mut guest)).unwrap();
        guest.set_version(1);

        // Corrupt the trailer of the next packet.
        let mut packet = Encoder::new(OP_RC_GET_RENDERER_VERSION).finish(&mut guest);
        let last = packet.len() - 1;
        packet[last] ^= 0xff;
        to_host.send(packet).unwrap();
        thread.ping();

        thread.control().wait_exit();
        assert!(from_host.try_recv().is_err());
    }

    #[test]
    fn pause_captures_pending_bytes() {
        let r = renderer();
        let (thread, to_host, _from_host) = spawn(&r);
        to_host.send(vec![1, 2, 3]).unwrap();
        thread.ping();

        // The partial header may take a few loop iterations to arrive.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let guards = r.pause_all_render_threads().unwrap();
            let state = guards[&thread.id()].state().clone();
            if state.pending == vec![1, 2, 3] || Instant::now() > deadline {
                assert_eq!(state.pending, vec![1, 2, 3]);
                let mut saved = Vec::new();
                state.save(&mut saved).unwrap();
                assert_eq!(RenderThreadState::load(&mut saved.as_slice()).unwrap(), state);
                break;
            }
        }
    }

    #[test]
    fn renderer_stop_waits_for_threads() {
        let r = renderer();
        let (thread, _to_host, _from_host) = spawn(&r);
        r.stop(true);
        assert!(thread.control().has_exited());
        assert!(RenderThreadInfo::current().is_none());
    }
}
