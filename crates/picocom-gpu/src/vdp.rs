//! Consumer cores.
//!
//! VDP1 receives draw packets from the app core, executes them band by
//! band and ships each rendered band to VDP2. VDP2 composites bands into
//! its back buffer and presents. Both cores also run state-only command
//! lists (buffer creation, uploads) forwarded by the app core.
//!
//! Protocol damage on the wire is logged and the packet dropped. A
//! forwarded list whose declared size exceeds its packet is an integrity
//! failure and panics.

use std::time::Instant;

use picocom_hal::{BusChannel, FlashDevice};

use crate::cmd_list::CommandStream;
use crate::error::ProtocolError;
use crate::gpu::compositor::composite;
use crate::gpu::{FrameStats, GpuConfig, GpuInstance, GpuState};
use crate::protocol::bus::{
    decode_status_request, Ack, BusCmd, DrawPacket, StatusReply, TileFramePacket, TILE_FRAME_HEADER_SIZE,
};
use crate::protocol::{ColorDepth, CompleteFlags, TextureFormat};
use crate::tile::{FrameBuffer, TileFrameBuffer, FRAME_W, TILE_COUNT, TILE_HEIGHT};

/// Frames between performance log lines.
pub const PERF_LOG_INTERVAL: u32 = 120;

/// Largest draw packet a core accepts.
pub const MAX_DRAW_PACKET: usize = 16 * 1024;
const TILE_PIXELS: usize = FRAME_W * TILE_HEIGHT;
/// Largest tile packet VDP2 accepts.
pub const MAX_TILE_PACKET: usize = TILE_FRAME_HEADER_SIZE + TILE_PIXELS * 3 + 4 * 1024;

fn elapsed_us(start: Instant) -> u32 {
    start.elapsed().as_micros().min(u32::MAX as u128) as u32
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounters {
    pub frames: u32,
    pub tiles: u32,
    pub culled: u32,
    pub errors: u32,
}

impl PerfCounters {
    fn record(&mut self, stats: &FrameStats, errors: u32) {
        self.frames += 1;
        self.tiles += stats.tile_count;
        self.culled += stats.cull_count;
        self.errors += errors;
    }

    fn maybe_log(&self, core: &str) {
        if self.frames % PERF_LOG_INTERVAL == 0 {
            log::info!(
                "{}: {} frames, {} tiles, {} culled cmds, {} errors",
                core,
                self.frames,
                self.tiles,
                self.culled,
                self.errors
            );
        }
    }
}

/// Run a forwarded command list without a render target.
fn run_headless(state: &GpuState, instance: &mut GpuInstance, draw: &DrawPacket<'_>) -> u32 {
    let stream = CommandStream::new(draw.cmds, draw.header.cmd_count as usize);
    instance.begin_frame();
    let errors = instance.run_tile(state, stream, &mut TileFrameBuffer::headless());
    instance.end_frame();
    errors
}

// ============================================================================
// VDP1
// ============================================================================

/// The tile renderer. `C` carries both the link to the app core and the
/// link to VDP2.
pub struct Vdp1Core<C: BusChannel> {
    state: GpuState,
    instance: GpuInstance,
    host: C,
    vdp2: C,
    tiles: Vec<TileFrameBuffer>,
    rx: Vec<u8>,
    tx: Vec<u8>,
    perf: PerfCounters,
}

impl<C: BusChannel> Vdp1Core<C> {
    pub fn new(host: C, vdp2: C, config: &GpuConfig, flash: Option<Box<dyn FlashDevice + Send + Sync>>) -> Self {
        Self {
            state: GpuState::new(1, config, flash),
            instance: GpuInstance::new(0),
            host,
            vdp2,
            tiles: (0..TILE_COUNT as u8).map(TileFrameBuffer::band).collect(),
            rx: vec![0; MAX_DRAW_PACKET],
            tx: Vec::with_capacity(MAX_TILE_PACKET),
            perf: PerfCounters::default(),
        }
    }

    pub fn state(&self) -> &GpuState {
        &self.state
    }

    pub fn instance(&self) -> &GpuInstance {
        &self.instance
    }

    pub fn perf(&self) -> PerfCounters {
        self.perf
    }

    /// The band rendered most recently for `tile_id`.
    pub fn tile(&self, tile_id: usize) -> Option<&TileFrameBuffer> {
        self.tiles.get(tile_id)
    }

    /// Handle every packet waiting on the host link. Returns how many.
    pub fn poll(&mut self) -> Result<usize, C::Error> {
        let mut handled = 0;
        let mut rx = core::mem::take(&mut self.rx);
        let result = loop {
            match self.host.pump_receive(&mut rx) {
                Ok(Some(len)) => {
                    handled += 1;
                    if let Err(e) = self.handle(&rx[..len]) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.rx = rx;
        result?;
        self.host.pump_send()?;
        self.vdp2.pump_send()?;
        Ok(handled)
    }

    fn handle(&mut self, packet: &[u8]) -> Result<(), C::Error> {
        match BusCmd::of(packet) {
            Ok(BusCmd::DrawCmdData) => self.draw(packet),
            Ok(BusCmd::ForwardVdp2CmdData) => self.forward(packet),
            Ok(BusCmd::GetStatus) => self.status(packet),
            Ok(other) => {
                log::warn!("vdp1: unexpected {:?} packet", other);
                Ok(())
            }
            Err(e) => {
                log::warn!("vdp1: dropping packet: {}", e);
                Ok(())
            }
        }
    }

    fn status(&mut self, packet: &[u8]) -> Result<(), C::Error> {
        let counter = match decode_status_request(packet) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("vdp1: bad status request: {}", e);
                return Ok(());
            }
        };
        let reply = StatusReply {
            counter,
            online: true,
            busy: false,
            frames: self.perf.frames,
        };
        self.host.write_async(&reply.encode())?;
        self.host.pump_send()
    }

    /// Relay a state-only list to VDP2 as is.
    fn forward(&mut self, packet: &[u8]) -> Result<(), C::Error> {
        let seq = match DrawPacket::decode(packet) {
            Ok(draw) => draw.header.seq,
            Err(e) => {
                log::warn!("vdp1: dropping forward packet: {}", e);
                return Ok(());
            }
        };
        log::debug!("vdp1: forwarding seq {} ({} bytes)", seq, packet.len());
        self.vdp2.write_async(packet)?;
        let ack = Ack {
            seq,
            ..Ack::default()
        };
        self.host.write_async(&ack.encode())
    }

    fn draw(&mut self, packet: &[u8]) -> Result<(), C::Error> {
        let draw = match DrawPacket::decode(packet) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("vdp1: dropping draw packet: {}", e);
                return Ok(());
            }
        };
        let header = draw.header;
        let stream = CommandStream::new(draw.cmds, header.cmd_count as usize);
        let instance = &mut self.instance;
        instance.begin_frame();
        instance.color_depth = header.color_depth;
        instance.palette_id = header.palette_id;
        instance.default_blend = header.default_blend;

        let tiles: Vec<u8> = (0..TILE_COUNT as u8)
            .filter(|t| header.tile_mask & (1 << t) != 0)
            .collect();
        let last = tiles.last().copied();
        let write_tiles = header.flags.contains(CompleteFlags::WRITE_VDP2_TILE);
        let mut errors = 0;
        let mut copy_us = 0;

        for tile_id in tiles {
            let tile = &mut self.tiles[tile_id as usize];
            tile.clear(instance.clear_color);
            tile.depth = header.color_depth;
            errors += instance.run_tile(&self.state, stream, tile);

            if write_tiles {
                let copy_start = Instant::now();
                // Present only once the last band of the pass has landed.
                let flags = if Some(tile_id) == last {
                    header.flags
                } else {
                    header
                        .flags
                        .difference(CompleteFlags::FLIP_DISPLAY | CompleteFlags::COPY_FB)
                };
                let pixels = tile.pixel_bytes();
                let zero_attrs;
                let attrs = match &tile.attr {
                    Some(a) => a.as_slice(),
                    None => {
                        zero_attrs = vec![0u8; tile.pixels.len()];
                        zero_attrs.as_slice()
                    }
                };
                let out = TileFramePacket {
                    seq: header.seq,
                    flags,
                    tile_id,
                    pass_id: header.pass_id,
                    default_blend: header.default_blend,
                    palette_id: header.palette_id,
                    color_depth: header.color_depth,
                    vdp2_count: header.vdp2_count,
                    pixels: &pixels,
                    attrs,
                    vdp2: draw.vdp2,
                };
                self.tx.clear();
                match out.encode_into(&mut self.tx) {
                    Ok(()) => self.vdp2.write_async(&self.tx)?,
                    Err(e) => log::error!("vdp1: tile {} not encoded: {}", tile_id, e),
                }
                copy_us += elapsed_us(copy_start);
            }
        }

        let stats = instance.end_frame();
        self.perf.record(&stats, errors);
        self.perf.maybe_log("vdp1");
        if errors > 0 {
            log::warn!("vdp1: seq {} finished with {} errors", header.seq, errors);
        }
        let ack = Ack {
            seq: header.seq,
            gpu_errors: errors,
            tile_bus_copy_time_us: copy_us,
            tile_render_time_us: stats.frame_time_us.saturating_sub(copy_us),
        };
        self.host.write_async(&ack.encode())
    }
}

// ============================================================================
// VDP2
// ============================================================================

/// The compositor and display core.
pub struct Vdp2Core<C: BusChannel> {
    state: GpuState,
    instance: GpuInstance,
    link: C,
    fb: FrameBuffer,
    rx: Vec<u8>,
    perf: PerfCounters,
}

impl<C: BusChannel> Vdp2Core<C> {
    pub fn new(link: C, config: &GpuConfig, flash: Option<Box<dyn FlashDevice + Send + Sync>>) -> Self {
        Self {
            state: GpuState::new(2, config, flash),
            instance: GpuInstance::new(0),
            link,
            fb: FrameBuffer::new(),
            rx: vec![0; MAX_TILE_PACKET.max(MAX_DRAW_PACKET)],
            perf: PerfCounters::default(),
        }
    }

    pub fn state(&self) -> &GpuState {
        &self.state
    }

    pub fn instance(&self) -> &GpuInstance {
        &self.instance
    }

    pub fn framebuffer(&self) -> &FrameBuffer {
        &self.fb
    }

    pub fn perf(&self) -> PerfCounters {
        self.perf
    }

    pub fn poll(&mut self) -> Result<usize, C::Error> {
        let mut handled = 0;
        let mut rx = core::mem::take(&mut self.rx);
        let result = loop {
            match self.link.pump_receive(&mut rx) {
                Ok(Some(len)) => {
                    handled += 1;
                    self.handle(&rx[..len]);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.rx = rx;
        result?;
        self.link.pump_send()?;
        Ok(handled)
    }

    fn handle(&mut self, packet: &[u8]) {
        match BusCmd::of(packet) {
            Ok(BusCmd::ForwardVdp2CmdData) => self.forwarded(packet),
            Ok(BusCmd::TileFrameBuffer) => self.tile(packet),
            Ok(other) => log::warn!("vdp2: unexpected {:?} packet", other),
            Err(e) => log::warn!("vdp2: dropping packet: {}", e),
        }
    }

    fn forwarded(&mut self, packet: &[u8]) {
        let draw = match DrawPacket::decode(packet) {
            Ok(d) => d,
            Err(e @ ProtocolError::BadSize { .. }) => {
                panic!("forwarded command list exceeds its packet: {e}")
            }
            Err(e) => {
                log::warn!("vdp2: dropping forward packet: {}", e);
                return;
            }
        };
        let errors = run_headless(&self.state, &mut self.instance, &draw);
        if errors > 0 {
            log::warn!("vdp2: forwarded seq {} finished with {} errors", draw.header.seq, errors);
        }
    }

    fn palette(&self, depth: ColorDepth, palette_id: u16) -> Option<Vec<u8>> {
        if depth != ColorDepth::Indexed8 {
            return None;
        }
        let buffers = self.state.buffers();
        match buffers.get(palette_id) {
            Ok(b) if b.format == TextureFormat::Rgb16 => buffers.data(palette_id).ok().map(<[u8]>::to_vec),
            _ => {
                log::warn!("vdp2: palette {} unavailable", palette_id);
                None
            }
        }
    }

    fn tile(&mut self, packet: &[u8]) {
        let frame = match TileFramePacket::decode(packet, TILE_PIXELS) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("vdp2: dropping tile packet: {}", e);
                return;
            }
        };
        let tile_id = frame.tile_id as usize;
        if tile_id >= TILE_COUNT {
            log::warn!("vdp2: tile {} out of range", tile_id);
            return;
        }

        let mut src = TileFrameBuffer::band(frame.tile_id);
        src.depth = frame.color_depth;
        src.load_pixel_bytes(frame.pixels);
        if let Some(attr) = src.attr.as_mut() {
            attr.copy_from_slice(frame.attrs);
        }

        self.instance.begin_frame();
        self.instance.color_depth = frame.color_depth;
        self.instance.palette_id = frame.palette_id;
        self.instance.default_blend = frame.default_blend;

        let mut errors = 0;
        if frame.vdp2_count > 0 {
            // The sub-list decides how the band is merged.
            self.instance.bind_fbo(src);
            let stream = CommandStream::new(frame.vdp2, frame.vdp2_count as usize);
            let dst = &mut self.fb.back[tile_id];
            errors += self.instance.run_tile(&self.state, stream, dst);
            self.instance.unbind_fbo();
        } else {
            let palette = self.palette(frame.color_depth, frame.palette_id);
            let dst = &mut self.fb.back[tile_id];
            if frame.pass_id == 0 {
                dst.clear(crate::color::BLACK);
            }
            if let Err(fault) = composite(&src, dst, frame.default_blend, palette.as_deref()) {
                log::warn!("vdp2: composite of tile {} failed: {}", tile_id, fault);
                errors += 1;
            }
        }
        let stats = self.instance.end_frame();

        if frame.flags.contains(CompleteFlags::FLIP_DISPLAY) {
            self.fb.flip();
        }
        if frame.flags.contains(CompleteFlags::COPY_FB) {
            self.fb.copy_back_to_front();
        }
        if frame.flags.contains(CompleteFlags::FLIP_DISPLAY) || frame.flags.contains(CompleteFlags::COPY_FB) {
            self.perf.record(&stats, errors);
            self.perf.maybe_log("vdp2");
        } else {
            self.perf.tiles += 1;
            self.perf.errors += errors;
        }
    }
}
