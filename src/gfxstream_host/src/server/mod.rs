// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Server contexts: the per-API halves of a render thread that decode a call's arguments, run
//! it against the renderer and encode the reply.

pub mod gles;
pub mod magma;
pub mod render_control;
pub mod vulkan;

use std::sync::Arc;

use crate::gfxstream_utils::*;
use crate::renderer::Renderer;
use crate::wire::ChecksumCalculator;
use crate::wire::Decoder;
use crate::wire::Encoder;

pub use gles::GlesServer;
pub use magma::MagmaServer;
pub use render_control::RenderControlServer;
pub use vulkan::VulkanServer;

/// Everything a call may touch besides its own server context.
pub struct DispatchContext<'a> {
    pub renderer: &'a Arc<Renderer>,
    /// The stream's checksum state; render control swaps its version.
    pub checksum: &'a mut ChecksumCalculator,
    pub ctx_id: u32,
    pub puid: &'a mut u64,
    /// The packet being dispatched, header included, trailer excluded.
    pub packet: &'a [u8],
    /// Set while replaying a snapshot trace.
    pub for_snapshot_load: bool,
}

/// One API's dispatch table.
pub trait ServerContext: Send {
    fn name(&self) -> &'static str;

    fn handles(&self, opcode: u32) -> bool;

    /// Decodes the arguments of `dec.opcode()`, runs the call and encodes any return values
    /// into `reply`.
    ///
    /// Implementations must report back-end failures through the API's own error channel and
    /// return `Ok`; errors returned here are either protocol errors, which end the render
    /// thread, or logged and dropped.
    fn dispatch(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        dec: &mut Decoder<'_>,
        reply: &mut Encoder,
    ) -> GfxstreamResult<()>;

    /// Takes over what a snapshot restored for the render thread serving `ctx_id` as `puid`.
    fn on_restore(&mut self, _renderer: &Arc<Renderer>, _ctx_id: u32, _puid: u64) {}

    /// Releases whatever the context still holds when its render thread exits.
    fn on_exit(&mut self, _renderer: &Arc<Renderer>) {}
}

/// Server contexts bound to a render thread created for `capset_id`.  Render control is always
/// present.
pub fn servers_for_capset(capset_id: u32) -> GfxstreamResult<Vec<Box<dyn ServerContext>>> {
    let mut servers: Vec<Box<dyn ServerContext>> = vec![Box::new(RenderControlServer::new())];
    match capset_id {
        GFXSTREAM_CAPSET_GLES => servers.push(Box::new(GlesServer::new())),
        GFXSTREAM_CAPSET_VULKAN => servers.push(Box::new(VulkanServer::new())),
        GFXSTREAM_CAPSET_MAGMA => servers.push(Box::new(MagmaServer::new())),
        GFXSTREAM_CAPSET_COMPOSER => (),
        _ => return Err(GfxstreamError::InvalidCapset),
    }
    Ok(servers)
}

/// Server contexts behind a `pipe:opengles` connection, which carries every API.
pub fn servers_for_pipe() -> Vec<Box<dyn ServerContext>> {
    vec![
        Box::new(RenderControlServer::new()),
        Box::new(GlesServer::new()),
        Box::new(VulkanServer::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capset_bindings() {
        let names = |capset| -> Vec<&'static str> {
            servers_for_capset(capset)
                .unwrap()
                .iter()
                .map(|s| s.name())
                .collect()
        };
        assert_eq!(names(GFXSTREAM_CAPSET_GLES), vec!["renderControl", "gles2"]);
        assert_eq!(names(GFXSTREAM_CAPSET_VULKAN), vec!["renderControl", "vulkan"]);
        assert_eq!(names(GFXSTREAM_CAPSET_MAGMA), vec!["renderControl", "magma"]);
        assert_eq!(names(GFXSTREAM_CAPSET_COMPOSER), vec!["renderControl"]);
        assert!(servers_for_capset(42).is_err());
    }

    #[test]
    fn opcode_ranges_are_disjoint() {
        let servers = servers_for_pipe();
        for opcode in [2053, 2099, 10000, 10069, 20000, 20193] {
            assert_eq!(
                servers.iter().filter(|s| s.handles(opcode)).count(),
                1,
                "opcode {}",
                opcode
            );
        }
        let magma = MagmaServer::new();
        assert!(magma.handles(magma::OP_MAGMA_POLL));
        assert!(!servers.iter().any(|s| s.handles(magma::OP_MAGMA_POLL)));
        assert!(!servers.iter().any(|s| s.handles(2048)));
    }
}
