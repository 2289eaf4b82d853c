//! Producer side of the pipeline: pooled command buffers with ack-driven
//! flow control.
//!
//! The client owns `pool_size` command buffers and the same number of
//! submission records. A frame is built into the current buffer; when it
//! fills up the buffer is committed and the client stalls until the VDP
//! acknowledges it. That stall is the only backpressure in the system.
//!
//! Record lifecycle:
//!
//! ```text
//! None -> Queued -> NotifyCompletion -> Completed -> None
//!         begin     ack received        next update  recycled
//! ```

use std::time::{Duration, Instant};

use picocom_hal::BusChannel;

use crate::cmd_list::CommandBuffer;
use crate::error::{ClientError, ProtocolError};
use crate::protocol::bus::{
    encode_status_request, Ack, BusCmd, FrameHeader, StatusReply, FRAME_HEADER_SIZE, STATUS_REPLY_SIZE,
};
use crate::protocol::cmds::{
    BlitRect, CompositeTile, CreateLinkedTilemapBuffer, DrawLine, DrawTileMap, DrawWater, FillRectCol, ResetGpu,
    SetClearCol, SetDebug,
};
use crate::protocol::{BlendMode, ColorDepth, CompleteFlags, GpuCommand, HEADER_SIZE};
use crate::tile::{tile_cull_mask, tile_cull_mask_line};

pub const DEFAULT_POOL_SIZE: usize = 2;
/// Matches the largest bus packet.
pub const DEFAULT_CMD_LIST_ALLOC_SIZE: usize = 8192;
pub const DEFAULT_VDP2_SUBLIST_SIZE: usize = 768;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

const RX_BUFFER_SIZE: usize = 64;

/// Cull mask that only reaches tile 0, where shared state is mutated.
pub const WRITE_POINT_MASK: u16 = 0b1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Command buffers allowed in flight. Capped at the client's `N`.
    pub pool_size: usize,
    pub cmd_list_alloc_size: usize,
    pub vdp2_sublist_size: usize,
    pub wait_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            cmd_list_alloc_size: DEFAULT_CMD_LIST_ALLOC_SIZE,
            vdp2_sublist_size: DEFAULT_VDP2_SUBLIST_SIZE,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Which stream a command is appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Tile commands executed by VDP1.
    Primary,
    /// Sub-list carried to VDP2 with each rendered tile.
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordState {
    #[default]
    None,
    /// Handed out by `begin_cmd_list`; commands are still being recorded.
    Building,
    /// Committed and waiting for an ack.
    Queued,
    /// Ack received; becomes `Completed` on the next update.
    NotifyCompletion,
    /// Result readable; recycled on the next update.
    Completed,
}

/// Producer-side bookkeeping for one in-flight command buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub seq: u32,
    pub state: RecordState,
    pub gpu_errors: u32,
    pub pass_id: u32,
    buffer: Option<usize>,
}

/// Handle to a submission record owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(usize);

impl RecordId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Mid-frame stalls caused by a full command buffer.
    pub overflow_stalls: u32,
    pub acks: u32,
    pub tile_bus_copy_time_us: u64,
    pub tile_render_time_us: u64,
}

#[derive(Debug, Clone, Copy)]
struct FrameState {
    current: Option<RecordId>,
    tile_mask: u16,
    flags: CompleteFlags,
    /// Flags used when a full buffer is flushed mid-frame.
    auto_flush: CompleteFlags,
    overflow: u32,
    color_depth: ColorDepth,
    palette_id: u16,
    default_blend: BlendMode,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            current: None,
            tile_mask: 0,
            flags: CompleteFlags::empty(),
            auto_flush: CompleteFlags::WRITE_VDP2_TILE,
            overflow: 0,
            color_depth: ColorDepth::Bgr565,
            palette_id: 0,
            default_blend: BlendMode::Alpha,
        }
    }
}

struct Slot {
    cmds: CommandBuffer,
    vdp2: CommandBuffer,
}

/// Flow-controlled command submission over a [`BusChannel`].
pub struct SubmissionClient<C: BusChannel, const N: usize> {
    channel: C,
    config: ClientConfig,
    slots: Vec<Slot>,
    records: Vec<SubmissionRecord>,
    free_buffers: heapless::Vec<usize, N>,
    free_records: heapless::Vec<usize, N>,
    pending: heapless::Vec<usize, N>,
    next_seq: u32,
    status_counter: u32,
    frame: FrameState,
    stats: ClientStats,
    rx: [u8; RX_BUFFER_SIZE],
    tx: Vec<u8>,
}

impl<C: BusChannel, const N: usize> SubmissionClient<C, N> {
    pub fn new(channel: C, config: ClientConfig) -> Self {
        let pool = config.pool_size.min(N);
        if pool != config.pool_size {
            log::warn!("pool size {} capped to {}", config.pool_size, N);
        }
        let alloc = config.cmd_list_alloc_size.max(FRAME_HEADER_SIZE + HEADER_SIZE + 1);
        let slots = (0..pool)
            .map(|_| Slot {
                cmds: CommandBuffer::new(alloc, FRAME_HEADER_SIZE),
                vdp2: CommandBuffer::new(config.vdp2_sublist_size, 0),
            })
            .collect();

        let mut free_buffers = heapless::Vec::new();
        let mut free_records = heapless::Vec::new();
        // Reversed so the first pop hands out index 0; `pool <= N`.
        for i in (0..pool).rev() {
            let _ = free_buffers.push(i);
            let _ = free_records.push(i);
        }
        log::info!("submission client: {} buffers of {} bytes", pool, alloc);

        Self {
            channel,
            config,
            slots,
            records: vec![SubmissionRecord::default(); pool],
            free_buffers,
            free_records,
            pending: heapless::Vec::new(),
            next_seq: 1,
            status_counter: 0,
            frame: FrameState::default(),
            stats: ClientStats::default(),
            rx: [0; RX_BUFFER_SIZE],
            tx: Vec::with_capacity(alloc + config.vdp2_sublist_size),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn free_count(&self) -> usize {
        self.free_buffers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn record(&self, id: RecordId) -> Option<&SubmissionRecord> {
        self.records.get(id.0)
    }

    pub fn current(&self) -> Option<RecordId> {
        self.frame.current
    }

    /// Largest command a single buffer can carry.
    pub fn max_cmd_size(&self) -> usize {
        self.slots.first().map_or(0, |s| s.cmds.capacity())
    }

    pub fn max_vdp2_cmd_size(&self) -> usize {
        self.config.vdp2_sublist_size
    }

    /// Pop a free buffer and record and start a new submission.
    pub fn begin_cmd_list(&mut self) -> Result<RecordId, ClientError<C::Error>> {
        if self.free_buffers.len() != self.free_records.len() {
            log::error!(
                "free pools diverged: {} buffers, {} records",
                self.free_buffers.len(),
                self.free_records.len()
            );
            return Err(ClientError::PoolDesync {
                buffers: self.free_buffers.len(),
                records: self.free_records.len(),
            });
        }
        if self.pending.is_full() {
            return Err(ClientError::PoolExhausted);
        }
        let (Some(buffer), Some(record)) = (self.free_buffers.pop(), self.free_records.pop()) else {
            return Err(ClientError::PoolExhausted);
        };
        self.pending
            .push(record)
            .map_err(|_| ClientError::PoolExhausted)?;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.records[record] = SubmissionRecord {
            seq,
            state: RecordState::Building,
            gpu_errors: 0,
            pass_id: 0,
            buffer: Some(buffer),
        };
        let slot = &mut self.slots[buffer];
        slot.cmds.clear();
        slot.vdp2.clear();
        log::debug!("begin cmd list seq {} (buffer {})", seq, buffer);
        Ok(RecordId(record))
    }

    /// Stamp the frame header and send the buffer to VDP1.
    pub fn commit(&mut self, id: RecordId, tile_mask: u16, flags: CompleteFlags) -> Result<(), ClientError<C::Error>> {
        self.commit_impl(id, tile_mask, flags, BusCmd::DrawCmdData)
    }

    /// Same as [`commit`](Self::commit), but VDP1 relays the buffer to
    /// VDP2, which executes it headless.
    pub fn commit_to_vdp2(
        &mut self,
        id: RecordId,
        tile_mask: u16,
        flags: CompleteFlags,
    ) -> Result<(), ClientError<C::Error>> {
        self.commit_impl(id, tile_mask, flags, BusCmd::ForwardVdp2CmdData)
    }

    fn commit_impl(
        &mut self,
        id: RecordId,
        tile_mask: u16,
        flags: CompleteFlags,
        bus_cmd: BusCmd,
    ) -> Result<(), ClientError<C::Error>> {
        if !self.pending.contains(&id.0) {
            return Err(ClientError::UnknownRecord);
        }
        let record = self.records[id.0];
        if record.state != RecordState::Building {
            return Err(ClientError::AlreadyCommitted { seq: record.seq });
        }
        let buffer = record.buffer.ok_or(ClientError::UnknownRecord)?;
        let slot = &mut self.slots[buffer];
        let header = FrameHeader {
            bus_cmd,
            seq: record.seq,
            tile_mask,
            flags,
            color_depth: self.frame.color_depth,
            palette_id: self.frame.palette_id,
            pass_id: record.pass_id,
            default_blend: self.frame.default_blend,
            vdp2_count: header_field("vdp2_count", slot.vdp2.cmd_count())?,
            vdp2_size: header_field("vdp2_size", slot.vdp2.commands().len())?,
            cmd_count: header_field("cmd_count", slot.cmds.cmd_count())?,
            cmd_size: header_field("cmd_size", slot.cmds.commands().len())?,
        };
        header
            .encode(slot.cmds.header_mut())
            .map_err(ClientError::Protocol)?;

        self.tx.clear();
        self.tx.extend_from_slice(slot.cmds.as_bytes());
        self.tx.extend_from_slice(slot.vdp2.commands());
        log::debug!(
            "commit seq {} {:?}: {} cmds, {} vdp2 cmds, {} bytes",
            record.seq,
            bus_cmd,
            header.cmd_count,
            header.vdp2_count,
            self.tx.len()
        );
        self.channel.write_async(&self.tx)?;
        self.records[id.0].state = RecordState::Queued;
        Ok(())
    }

    fn receive_acks(&mut self) -> Result<(), ClientError<C::Error>> {
        while let Some(len) = self.channel.pump_receive(&mut self.rx)? {
            let packet = &self.rx[..len.min(RX_BUFFER_SIZE)];
            let ack = match BusCmd::of(packet) {
                Ok(BusCmd::AckDrawCmdData) => match Ack::decode(packet) {
                    Ok(ack) => ack,
                    Err(e) => {
                        log::warn!("malformed ack: {}", e);
                        continue;
                    }
                },
                Ok(other) => {
                    log::debug!("client ignoring {:?} packet", other);
                    continue;
                }
                Err(e) => {
                    log::warn!("client received bad packet: {}", e);
                    continue;
                }
            };
            self.handle_ack(ack);
        }
        Ok(())
    }

    fn handle_ack(&mut self, ack: Ack) {
        let mut found = false;
        for &index in self.pending.iter() {
            let record = &mut self.records[index];
            if record.seq != ack.seq {
                continue;
            }
            found = true;
            if record.state == RecordState::Queued {
                record.state = RecordState::NotifyCompletion;
                record.gpu_errors = ack.gpu_errors;
                self.stats.acks += 1;
                self.stats.tile_bus_copy_time_us += ack.tile_bus_copy_time_us as u64;
                self.stats.tile_render_time_us += ack.tile_render_time_us as u64;
            }
        }
        if !found {
            log::warn!("ack for unknown seq {}", ack.seq);
        }
    }

    /// Pump the channel once and advance pending records. At most one
    /// record is recycled per call. Returns whether one was.
    pub fn update_queue(&mut self) -> Result<bool, ClientError<C::Error>> {
        self.receive_acks()?;
        self.channel.pump_send()?;

        for i in 0..self.pending.len() {
            let index = self.pending[i];
            let record = &mut self.records[index];
            match record.state {
                RecordState::NotifyCompletion => record.state = RecordState::Completed,
                RecordState::Completed => {
                    record.state = RecordState::None;
                    let buffer = record.buffer.take();
                    self.pending.swap_remove(i);
                    if let Some(buffer) = buffer {
                        if self.free_buffers.push(buffer).is_err() {
                            panic!("free buffer pool overflow recycling buffer {buffer}");
                        }
                    }
                    if self.free_records.push(index).is_err() {
                        panic!("free record pool overflow recycling record {index}");
                    }
                    if self.free_buffers.len() != self.free_records.len() {
                        panic!(
                            "free pools diverged after recycle: {} buffers, {} records",
                            self.free_buffers.len(),
                            self.free_records.len()
                        );
                    }
                    return Ok(true);
                }
                RecordState::None | RecordState::Building | RecordState::Queued => {}
            }
        }
        Ok(false)
    }

    /// Block until at least one command buffer is free.
    pub fn wait_free(&mut self) -> Result<usize, ClientError<C::Error>> {
        let deadline = Instant::now() + self.config.wait_timeout;
        while self.free_buffers.is_empty() {
            self.update_queue()?;
            if self.free_buffers.is_empty() && Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.config.wait_timeout));
            }
        }
        Ok(self.free_buffers.len())
    }

    /// `false` while the record is being built or still waits for its ack.
    pub fn is_completed(&self, id: RecordId) -> bool {
        self.records
            .get(id.0)
            .is_none_or(|r| !matches!(r.state, RecordState::Building | RecordState::Queued))
    }

    /// Block until the record reaches `Completed`. GPU errors reported in
    /// its ack are returned as [`ClientError::GpuErrors`].
    pub fn wait_completion(&mut self, id: RecordId) -> Result<(), ClientError<C::Error>> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            let record = self.records.get(id.0).ok_or(ClientError::UnknownRecord)?;
            match record.state {
                RecordState::Completed if record.gpu_errors > 0 => {
                    return Err(ClientError::GpuErrors {
                        seq: record.seq,
                        errors: record.gpu_errors,
                    });
                }
                RecordState::Completed => return Ok(()),
                RecordState::None => return Err(ClientError::UnknownRecord),
                RecordState::Building => return Err(ClientError::NotCommitted { seq: record.seq }),
                RecordState::Queued | RecordState::NotifyCompletion => {}
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(self.config.wait_timeout));
            }
            self.update_queue()?;
        }
    }

    /// Blocking status query.
    pub fn get_status(&mut self) -> Result<StatusReply, ClientError<C::Error>> {
        self.status_counter = self.status_counter.wrapping_add(1);
        let request = encode_status_request(self.status_counter);
        let mut response = [0u8; STATUS_REPLY_SIZE];
        let timeout_ms = self.config.wait_timeout.as_millis().min(u32::MAX as u128) as u32;
        let len = self
            .channel
            .request_blocking(&request, &mut response, timeout_ms)?;
        StatusReply::decode(&response[..len.min(STATUS_REPLY_SIZE)]).map_err(ClientError::Protocol)
    }

    // ------------------------------------------------------------------
    // Frame API
    // ------------------------------------------------------------------

    /// Start a frame. A buffer left over from an unfinished frame is
    /// dropped without being sent.
    pub fn begin_frame(&mut self, tile_mask: u16, flags: CompleteFlags) -> Result<(), ClientError<C::Error>> {
        if let Some(current) = self.frame.current.take() {
            log::debug!("dropping unfinished command list {}", current.0);
            if let Some(record) = self.records.get_mut(current.0) {
                record.state = RecordState::Completed;
            }
            self.update_queue()?;
        }
        self.frame.tile_mask = tile_mask;
        self.frame.flags = flags;
        self.frame.overflow = 0;
        self.frame.auto_flush = CompleteFlags::WRITE_VDP2_TILE;
        self.frame.color_depth = ColorDepth::Bgr565;
        self.stats.tile_bus_copy_time_us = 0;
        self.stats.tile_render_time_us = 0;
        Ok(())
    }

    pub fn set_color_depth(&mut self, depth: ColorDepth) {
        self.frame.color_depth = depth;
    }

    /// Palette used by VDP2 when compositing 8bpp tiles.
    pub fn set_palette(&mut self, palette_id: u16) {
        self.frame.palette_id = palette_id;
    }

    pub fn set_default_blend(&mut self, blend: BlendMode) {
        self.frame.default_blend = blend;
    }

    pub fn set_auto_flush_flags(&mut self, flags: CompleteFlags) {
        self.frame.auto_flush = flags;
    }

    /// Passes flushed so far in this frame.
    pub fn frame_overflow(&self) -> u32 {
        self.frame.overflow
    }

    fn current_slot(&mut self) -> Result<&mut Slot, ClientError<C::Error>> {
        let id = self.frame.current.ok_or(ClientError::UnknownRecord)?;
        let buffer = self.records[id.0].buffer.ok_or(ClientError::UnknownRecord)?;
        Ok(&mut self.slots[buffer])
    }

    fn start_current(&mut self, pass_id: u32) -> Result<(), ClientError<C::Error>> {
        self.wait_free()?;
        let id = self.begin_cmd_list()?;
        self.records[id.0].pass_id = pass_id;
        self.frame.current = Some(id);
        Ok(())
    }

    /// Reserve `size` bytes for a command in `section`.
    ///
    /// When the primary buffer is full and `can_flush` is set, the buffer is
    /// committed and the call stalls until VDP1 has consumed it.
    pub fn add_next(
        &mut self,
        section: Section,
        size: usize,
        can_flush: bool,
    ) -> Result<&mut [u8], ClientError<C::Error>> {
        if size < HEADER_SIZE {
            return Err(ClientError::Protocol(ProtocolError::Truncated {
                needed: HEADER_SIZE,
                available: size,
            }));
        }
        match section {
            Section::Primary => {
                if size > self.max_cmd_size() {
                    return Err(ClientError::CommandTooLarge { size });
                }
                let fits = match self.frame.current {
                    Some(_) => self.current_slot()?.cmds.can_add(size),
                    None => false,
                };
                if !fits {
                    if let Some(current) = self.frame.current {
                        if !can_flush {
                            return Err(ClientError::FlushDisabled { size });
                        }
                        self.commit(current, self.frame.tile_mask, self.frame.auto_flush)?;
                        self.update_queue()?;
                        match self.wait_completion(current) {
                            Ok(()) => {}
                            Err(ClientError::GpuErrors { seq, errors }) => {
                                log::warn!("flushed pass seq {} reported {} GPU errors", seq, errors);
                            }
                            Err(e) => return Err(e),
                        }
                        self.frame.current = None;
                        self.frame.overflow += 1;
                        self.stats.overflow_stalls += 1;
                    }
                    self.start_current(self.frame.overflow)?;
                }
                let slot = self.current_slot()?;
                slot.cmds
                    .add_next(size)
                    .ok_or(ClientError::CommandTooLarge { size })
            }
            Section::Secondary => {
                if self.frame.current.is_none() {
                    self.start_current(0)?;
                }
                let slot = self.current_slot()?;
                slot.vdp2.add_next(size).ok_or(ClientError::SubListFull { size })
            }
        }
    }

    /// Encode `cmd` into `section`.
    pub fn push_command<'a, T: GpuCommand<'a>>(
        &mut self,
        section: Section,
        cmd: &T,
        cull_mask: Option<u16>,
    ) -> Result<(), ClientError<C::Error>> {
        self.push_command_impl(section, cmd, cull_mask, true)
    }

    pub fn push_command_impl<'a, T: GpuCommand<'a>>(
        &mut self,
        section: Section,
        cmd: &T,
        cull_mask: Option<u16>,
        can_flush: bool,
    ) -> Result<(), ClientError<C::Error>> {
        let size = cmd.encoded_len();
        let region = self.add_next(section, size, can_flush)?;
        cmd.encode(cull_mask, region).map_err(ClientError::Protocol)?;
        Ok(())
    }

    /// Commit the frame's last buffer to VDP1. With `wait`, stalls for the
    /// ack and reports GPU errors.
    pub fn end_frame(&mut self, wait: bool, write_vdp2_tile: bool) -> Result<(), ClientError<C::Error>> {
        if write_vdp2_tile {
            self.frame.flags |= CompleteFlags::WRITE_VDP2_TILE;
        }
        let result = self.finish_frame(BusCmd::DrawCmdData, wait);
        self.reset_frame();
        result
    }

    /// Commit the frame's buffer for headless execution on VDP2.
    pub fn end_frame_commit_to_vdp2(&mut self, wait: bool) -> Result<(), ClientError<C::Error>> {
        let result = self.finish_frame(BusCmd::ForwardVdp2CmdData, wait);
        self.reset_frame();
        result
    }

    fn finish_frame(&mut self, bus_cmd: BusCmd, wait: bool) -> Result<(), ClientError<C::Error>> {
        let current = self.frame.current;
        if let Some(id) = current {
            self.commit_impl(id, self.frame.tile_mask, self.frame.flags, bus_cmd)?;
        }
        self.update_queue()?;
        match current {
            Some(id) if wait => self.wait_completion(id).inspect_err(|e| {
                if let ClientError::GpuErrors { seq, errors } = e {
                    log::warn!("frame seq {} reported {} GPU errors", seq, errors);
                }
            }),
            _ => Ok(()),
        }
    }

    fn reset_frame(&mut self) {
        self.frame.current = None;
        self.frame.tile_mask = 0;
        self.frame.flags = CompleteFlags::empty();
    }

    // ------------------------------------------------------------------
    // Draw helpers
    // ------------------------------------------------------------------

    pub fn fill_rect(
        &mut self,
        x: i16,
        y: i16,
        w: i16,
        h: i16,
        col: u16,
        blend: BlendMode,
        alpha: u8,
    ) -> Result<(), ClientError<C::Error>> {
        let cmd = FillRectCol {
            x,
            y,
            w,
            h,
            col,
            a: alpha,
            blend: blend as u8,
        };
        let mask = tile_cull_mask(y as i32, h as i32);
        self.push_command(Section::Primary, &cmd, Some(mask))
    }

    pub fn blit(&mut self, cmd: &BlitRect) -> Result<(), ClientError<C::Error>> {
        let mask = tile_cull_mask(cmd.dst_y as i32, cmd.h as i32);
        self.push_command(Section::Primary, cmd, Some(mask))
    }

    pub fn draw_line(&mut self, x0: i16, y0: i16, x1: i16, y1: i16, col: u16) -> Result<(), ClientError<C::Error>> {
        let cmd = DrawLine { x0, y0, x1, y1, col };
        let mask = tile_cull_mask_line(y0 as i32, y1 as i32);
        self.push_command(Section::Primary, &cmd, Some(mask))
    }

    /// Rectangle outline.
    pub fn draw_rect(&mut self, x: i16, y: i16, w: i16, h: i16, col: u16) -> Result<(), ClientError<C::Error>> {
        if w <= 0 || h <= 0 {
            return Ok(());
        }
        let (x1, y1) = (x + w - 1, y + h - 1);
        self.draw_line(x, y, x1, y, col)?;
        self.draw_line(x, y1, x1, y1, col)?;
        self.draw_line(x, y, x, y1, col)?;
        self.draw_line(x1, y, x1, y1, col)
    }

    /// Ask VDP2 to composite the incoming tile into its back buffer.
    pub fn composite(&mut self, blend: BlendMode, pal_id: u16) -> Result<(), ClientError<C::Error>> {
        let cmd = CompositeTile {
            blend: blend as u8,
            pal_id,
        };
        self.push_command(Section::Secondary, &cmd, None)
    }

    pub fn draw_tilemap(&mut self, cmd: &DrawTileMap) -> Result<(), ClientError<C::Error>> {
        let mask = tile_cull_mask(cmd.y as i32, cmd.h as i32);
        self.push_command(Section::Primary, cmd, Some(mask))
    }

    pub fn draw_water(&mut self, cmd: &DrawWater) -> Result<(), ClientError<C::Error>> {
        let mask = tile_cull_mask(cmd.y as i32, cmd.h as i32);
        self.push_command(Section::Primary, cmd, Some(mask))
    }

    pub fn link_tilemap(&mut self, cmd: &CreateLinkedTilemapBuffer) -> Result<(), ClientError<C::Error>> {
        self.push_command(Section::Primary, cmd, Some(WRITE_POINT_MASK))
    }

    pub fn set_debug(&mut self, enabled: bool) -> Result<(), ClientError<C::Error>> {
        let cmd = SetDebug { enabled: enabled as u8 };
        self.push_command(Section::Primary, &cmd, None)
    }

    pub fn set_clear_color(&mut self, col: u16) -> Result<(), ClientError<C::Error>> {
        self.push_command(Section::Primary, &SetClearCol { col }, None)
    }

    pub fn reset_gpu(&mut self, cmds: bool, buffers: bool, stats: bool) -> Result<(), ClientError<C::Error>> {
        let cmd = ResetGpu {
            cmds: cmds as u8,
            buffers: buffers as u8,
            stats: stats as u8,
        };
        self.push_command(Section::Primary, &cmd, Some(WRITE_POINT_MASK))
    }
}

/// Narrow a frame header count, refusing values the wire field cannot hold.
fn header_field<T: TryFrom<usize>, E: core::fmt::Debug>(
    field: &'static str,
    value: usize,
) -> Result<T, ClientError<E>> {
    T::try_from(value).map_err(|_| {
        ClientError::Protocol(ProtocolError::InvalidValue {
            field,
            value: u32::try_from(value).unwrap_or(u32::MAX),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullChannel;

    impl BusChannel for NullChannel {
        type Error = ();

        fn pump_send(&mut self) -> Result<(), ()> {
            Ok(())
        }

        fn pump_receive(&mut self, _buf: &mut [u8]) -> Result<Option<usize>, ()> {
            Ok(None)
        }

        fn write_async(&mut self, _packet: &[u8]) -> Result<(), ()> {
            Ok(())
        }

        fn request_blocking(&mut self, _request: &[u8], _response: &mut [u8], _timeout_ms: u32) -> Result<usize, ()> {
            Err(())
        }
    }

    #[test]
    fn desynced_pools_refuse_to_begin() {
        let mut client: SubmissionClient<NullChannel, 4> = SubmissionClient::new(NullChannel, ClientConfig::default());
        client.free_records.pop();
        assert!(matches!(
            client.begin_cmd_list(),
            Err(ClientError::PoolDesync { buffers: 2, records: 1 })
        ));
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn oversized_header_counts_are_refused() {
        let count: Result<u16, ClientError<()>> = header_field("cmd_count", 70_000);
        assert!(matches!(
            count,
            Err(ClientError::Protocol(ProtocolError::InvalidValue {
                field: "cmd_count",
                value: 70_000
            }))
        ));
        let count: Result<u16, ClientError<()>> = header_field("cmd_count", 65_535);
        assert_eq!(count.ok(), Some(u16::MAX));
    }

    #[test]
    fn pool_size_is_capped_by_capacity() {
        let config = ClientConfig {
            pool_size: 8,
            ..ClientConfig::default()
        };
        let client: SubmissionClient<NullChannel, 3> = SubmissionClient::new(NullChannel, config);
        assert_eq!(client.free_count(), 3);
    }
}
