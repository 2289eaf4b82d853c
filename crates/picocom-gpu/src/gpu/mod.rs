//! Command executor.
//!
//! A [`GpuState`] holds what every command on one VDP core shares: the
//! buffer table and the command table. A [`GpuInstance`] holds one worker's
//! per-frame render state and counters. [`GpuInstance::run_tile`] walks a
//! command stream against one tile, culling by tile band and dispatching
//! each command through the command table.

pub mod compositor;
pub mod dump;
pub mod handlers;
pub mod registry;
pub mod render3d;
pub mod tilemap;

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use picocom_hal::FlashDevice;

use crate::buffers::{BufferTable, DEFAULT_RAM_ARENA_SIZE};
use crate::cmd_list::{CommandBufferList, CommandStream, RawCommand};
use crate::error::{GpuErrorCode, GpuFault};
use crate::flash::{FlashPageWriter, DEFAULT_WRITE_CEILING};
use crate::protocol::{BlendMode, CmdId, ColorDepth, CommandHeader, GpuCommand, MAX_CMD_ID};
use crate::tile::TileFrameBuffer;

pub use registry::{CommandEntry, CommandTable, Extension, ExtensionFn, Handler, ValidatorFn};
pub use render3d::Render3dState;

/// Engine configuration for one VDP core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuConfig {
    pub ram_arena_size: usize,
    /// Page programs allowed per boot.
    pub flash_write_ceiling: u32,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            ram_arena_size: DEFAULT_RAM_ARENA_SIZE,
            flash_write_ceiling: DEFAULT_WRITE_CEILING,
        }
    }
}

/// State shared by every worker on one VDP core.
///
/// Create and write commands take the buffer table's write lock; drawing
/// commands take the read lock only for the duration of one command.
pub struct GpuState {
    vdp_id: u8,
    buffers: RwLock<BufferTable>,
    commands: RwLock<CommandTable>,
}

impl GpuState {
    pub fn new(
        vdp_id: u8,
        config: &GpuConfig,
        flash: Option<Box<dyn FlashDevice + Send + Sync>>,
    ) -> Self {
        let flash = flash.map(|device| FlashPageWriter::new(device, config.flash_write_ceiling));
        Self {
            vdp_id,
            buffers: RwLock::new(BufferTable::new(config.ram_arena_size, flash)),
            commands: RwLock::new(CommandTable::with_builtins()),
        }
    }

    pub fn vdp_id(&self) -> u8 {
        self.vdp_id
    }

    pub fn buffers(&self) -> RwLockReadGuard<'_, BufferTable> {
        self.buffers.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buffers_mut(&self) -> RwLockWriteGuard<'_, BufferTable> {
        self.buffers.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn commands(&self) -> RwLockReadGuard<'_, CommandTable> {
        self.commands.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn commands_mut(&self) -> RwLockWriteGuard<'_, CommandTable> {
        self.commands.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-frame counters of one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u32,
    /// Commands dispatched since the last stats reset.
    pub cmd_seq: u32,
    pub cmd_errors: u32,
    pub last_error: GpuErrorCode,
    pub tile_count: u32,
    pub tile_max_time_us: u32,
    pub frame_time_us: u32,
    pub cull_count: u32,
}

/// One worker's render state.
pub struct GpuInstance {
    pub instance_id: u8,
    pub stats: FrameStats,
    in_frame: bool,
    frame_start: Option<Instant>,
    pub debug_uploads: bool,
    /// When set, only the command at this index runs.
    pub debug_select: Option<usize>,
    pub clear_color: u16,
    pub color_depth: ColorDepth,
    pub palette_id: u16,
    pub default_blend: BlendMode,
    fb0: Option<TileFrameBuffer>,
    pub render3d: Render3dState,
}

/// Everything a command handler may touch.
pub struct CommandContext<'c, 'd> {
    pub state: &'c GpuState,
    pub instance: &'c mut GpuInstance,
    pub header: CommandHeader,
    /// Header and payload.
    pub bytes: &'d [u8],
    pub tile: &'c mut TileFrameBuffer,
}

impl<'c, 'd> CommandContext<'c, 'd> {
    pub fn decode<T: GpuCommand<'d>>(&self) -> Result<T, GpuFault> {
        Ok(T::decode(self.bytes)?)
    }

    pub fn payload(&self) -> &'d [u8] {
        &self.bytes[crate::protocol::HEADER_SIZE..]
    }

    /// Shared-state mutations run once per frame, on tile 0 of instance 0.
    pub fn is_write_point(&self) -> bool {
        self.instance.instance_id == 0 && self.tile.tile_id == 0
    }
}

/// A command that failed its dry-run check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub cmd_index: usize,
    pub cmd_data_offset: usize,
    pub list_index: usize,
    pub reason: String,
}

impl core::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "list {} command {} at byte {}: {}",
            self.list_index, self.cmd_index, self.cmd_data_offset, self.reason
        )
    }
}

impl std::error::Error for ValidationError {}

impl GpuInstance {
    pub fn new(instance_id: u8) -> Self {
        Self {
            instance_id,
            stats: FrameStats::default(),
            in_frame: false,
            frame_start: None,
            debug_uploads: false,
            debug_select: None,
            clear_color: 0,
            color_depth: ColorDepth::Bgr565,
            palette_id: 0,
            default_blend: BlendMode::Alpha,
            fb0: None,
            render3d: Render3dState::default(),
        }
    }

    pub fn in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn begin_frame(&mut self) {
        self.in_frame = true;
        self.frame_start = Some(Instant::now());
        self.stats.tile_count = 0;
        self.stats.tile_max_time_us = 0;
        self.stats.cull_count = 0;
    }

    pub fn end_frame(&mut self) -> FrameStats {
        if let Some(start) = self.frame_start.take() {
            self.stats.frame_time_us = start.elapsed().as_micros().min(u32::MAX as u128) as u32;
        }
        self.in_frame = false;
        self.stats.frame += 1;
        self.stats
    }

    pub fn clear_error_stats(&mut self) {
        self.stats.cmd_errors = 0;
        self.stats.last_error = GpuErrorCode::None;
        self.stats.cmd_seq = 0;
    }

    /// Bind the source tile for `CompositeTile`.
    pub fn bind_fbo(&mut self, tile: TileFrameBuffer) {
        self.fb0 = Some(tile);
    }

    pub fn unbind_fbo(&mut self) -> Option<TileFrameBuffer> {
        self.fb0.take()
    }

    pub fn fb0(&self) -> Option<&TileFrameBuffer> {
        self.fb0.as_ref()
    }

    /// Execute a stream against `tile`. Returns the errors raised by this run.
    pub fn run_tile(&mut self, state: &GpuState, stream: CommandStream<'_>, tile: &mut TileFrameBuffer) -> u32 {
        let start = Instant::now();
        let errors_before = self.stats.cmd_errors;
        let tile_mask = tile.mask();

        let mut iter = stream.iter();
        for cmd in iter.by_ref() {
            if self.debug_select.is_some_and(|sel| sel != cmd.index) {
                continue;
            }
            if cmd.header.is_culled(tile_mask) {
                self.stats.cull_count += 1;
                continue;
            }
            self.dispatch(state, &cmd, tile);
        }

        if let Some(corruption) = iter.corruption() {
            log::warn!("tile {}: command stream corrupt: {:?}", tile.tile_id, corruption);
            self.record_error(GpuErrorCode::General);
        } else if iter.visited() != stream.count {
            log::warn!(
                "tile {}: stream ended after {} of {} commands",
                tile.tile_id,
                iter.visited(),
                stream.count
            );
        }

        let elapsed = start.elapsed().as_micros().min(u32::MAX as u128) as u32;
        self.stats.tile_max_time_us = self.stats.tile_max_time_us.max(elapsed);
        self.stats.tile_count += 1;
        self.stats.cmd_errors - errors_before
    }

    fn dispatch(&mut self, state: &GpuState, cmd: &RawCommand<'_>, tile: &mut TileFrameBuffer) {
        self.stats.cmd_seq += 1;
        let id = cmd.header.cmd;
        let entry = if (id as usize) < MAX_CMD_ID {
            state.commands().entry(id)
        } else {
            None
        };

        let result = match entry {
            None => Err(GpuFault::general(format!("no handler for command {id}"))),
            Some(entry) => {
                let mut ctx = CommandContext {
                    state,
                    instance: &mut *self,
                    header: cmd.header,
                    bytes: cmd.bytes,
                    tile: &mut *tile,
                };
                match entry.handler {
                    Handler::Builtin(builtin) => handlers::execute(builtin, &mut ctx),
                    Handler::Extension(f) => f(&mut ctx),
                }
            }
        };

        if let Err(fault) = result {
            log::warn!(
                "command {} ({}) at index {} failed: {}",
                id,
                CmdId::from_u8(id).map_or("extension", CmdId::name),
                cmd.index,
                fault
            );
            self.record_error(fault.code);
        }
    }

    fn record_error(&mut self, code: GpuErrorCode) {
        self.stats.cmd_errors += 1;
        self.stats.last_error = code;
    }
}

/// Dry-run a stream through each command's validator.
pub fn validate(state: &GpuState, stream: CommandStream<'_>, list_index: usize) -> Result<usize, ValidationError> {
    let commands = state.commands();
    let mut iter = stream.iter();
    for cmd in iter.by_ref() {
        let fail = |reason: String| ValidationError {
            cmd_index: cmd.index,
            cmd_data_offset: cmd.offset,
            list_index,
            reason,
        };
        let Some(entry) = commands.entry(cmd.header.cmd) else {
            return Err(fail(format!("unknown command {}", cmd.header.cmd)));
        };
        if let Handler::Builtin(id) = entry.handler {
            handlers::validate(id, cmd.bytes).map_err(fail)?;
        }
        if let Some(validator) = entry.validator {
            validator(cmd.bytes).map_err(fail)?;
        }
    }
    if let Some(corruption) = iter.corruption() {
        return Err(ValidationError {
            cmd_index: iter.visited(),
            cmd_data_offset: corruption.offset(),
            list_index,
            reason: format!("{corruption:?}"),
        });
    }
    Ok(iter.visited())
}

/// Validate every buffer of a list in order.
pub fn validate_list(state: &GpuState, list: &CommandBufferList) -> Result<usize, ValidationError> {
    let mut total = 0;
    for index in 0..list.get_count() {
        if let Some(buffer) = list.get(index) {
            total += validate(state, buffer.stream(), index)?;
        }
    }
    Ok(total)
}
