//! Producer-side buffer uploads.
//!
//! Each VDP keeps its own buffer ids and arena layout. Ids below
//! [`FIRST_USER_BUFFER_ID`] are reserved for the system. RAM buffers are
//! bump allocated; flash buffers start on a page boundary so the page writer
//! never shares a page between two buffers.

use core::fmt::Debug;

use picocom_hal::BusChannel;

use crate::buffers::MAX_BUFFERS;
use crate::client::{Section, SubmissionClient, WRITE_POINT_MASK};
use crate::error::ClientError;
use crate::flash::FLASH_PAGE_SIZE;
use crate::protocol::cmds::{CreateBuffer, WriteBufferData, NO_BUFFER, WRITE_BUFFER_DATA_FIXED};
use crate::protocol::{BufferArena, CompleteFlags, GpuCommand, TextureFormat, WriteFlags, HEADER_SIZE};

pub const FIRST_USER_BUFFER_ID: u16 = 16;
/// The start of the RAM arena is kept free for the system.
pub const RAM_ALLOC_START: u32 = 128;

/// Which VDP core a buffer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vdp {
    Vdp1,
    /// Reached by forwarding through VDP1.
    Vdp2,
}

impl Vdp {
    pub fn id(self) -> u8 {
        match self {
            Vdp::Vdp1 => 1,
            Vdp::Vdp2 => 2,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    next_id: u16,
    ram_offset: u32,
    flash_offset: u32,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            next_id: FIRST_USER_BUFFER_ID,
            ram_offset: RAM_ALLOC_START,
            flash_offset: 0,
        }
    }
}

/// Per-VDP bump allocator for buffer ids and arena offsets.
#[derive(Debug, Clone)]
pub struct BufferAllocator {
    ram_size: u32,
    flash_size: u32,
    cursors: [Cursor; 2],
}

impl BufferAllocator {
    pub fn new(ram_size: u32, flash_size: u32) -> Self {
        Self {
            ram_size,
            flash_size,
            cursors: [Cursor::default(); 2],
        }
    }

    /// Reserve an id and `size` bytes. Nothing is reserved on failure.
    pub fn allocate<E: Debug>(
        &mut self,
        vdp: Vdp,
        arena: BufferArena,
        size: u32,
    ) -> Result<(u16, u32), ClientError<E>> {
        let (ram_size, flash_size) = (self.ram_size, self.flash_size);
        let cursor = &mut self.cursors[vdp.index()];
        if cursor.next_id as usize >= MAX_BUFFERS {
            return Err(ClientError::NoBufferIds { vdp: vdp.id() });
        }
        let (start, limit) = match arena {
            BufferArena::Ram0 => (cursor.ram_offset, ram_size),
            BufferArena::Flash0 => {
                let page = FLASH_PAGE_SIZE as u64;
                let start = (cursor.flash_offset as u64).div_ceil(page) * page;
                (start.min(u32::MAX as u64) as u32, flash_size)
            }
        };
        let end = start as u64 + size as u64;
        if end > limit as u64 {
            return Err(ClientError::ArenaExhausted {
                vdp: vdp.id(),
                arena,
                size,
            });
        }
        match arena {
            BufferArena::Ram0 => cursor.ram_offset = end as u32,
            BufferArena::Flash0 => cursor.flash_offset = end as u32,
        }
        let id = cursor.next_id;
        cursor.next_id += 1;
        Ok((id, start))
    }

    /// Forget every allocation on `vdp`, e.g. after a `ResetGpu`.
    pub fn reset(&mut self, vdp: Vdp) {
        self.cursors[vdp.index()] = Cursor::default();
    }
}

fn end_upload_frame<C: BusChannel, const N: usize>(
    client: &mut SubmissionClient<C, N>,
    vdp: Vdp,
) -> Result<(), ClientError<C::Error>> {
    match vdp {
        Vdp::Vdp1 => client.end_frame(true, false),
        Vdp::Vdp2 => client.end_frame_commit_to_vdp2(true),
    }
}

fn submit_one<'a, C: BusChannel, const N: usize, T: GpuCommand<'a>>(
    client: &mut SubmissionClient<C, N>,
    vdp: Vdp,
    cmd: &T,
) -> Result<(), ClientError<C::Error>> {
    client.begin_frame(WRITE_POINT_MASK, CompleteFlags::empty())?;
    // A forwarded packet must carry the command in one piece.
    client.push_command_impl(Section::Primary, cmd, Some(WRITE_POINT_MASK), vdp == Vdp::Vdp1)?;
    end_upload_frame(client, vdp)
}

/// Create a buffer on `vdp` and fill it with `bytes`, one synchronous
/// frame per chunk. Returns the new buffer id.
#[allow(clippy::too_many_arguments)]
pub fn upload_buffer<C: BusChannel, const N: usize>(
    client: &mut SubmissionClient<C, N>,
    alloc: &mut BufferAllocator,
    vdp: Vdp,
    arena: BufferArena,
    bytes: &[u8],
    format: TextureFormat,
    width: u16,
    height: u16,
) -> Result<u16, ClientError<C::Error>> {
    let size = u32::try_from(bytes.len()).map_err(|_| ClientError::ArenaExhausted {
        vdp: vdp.id(),
        arena,
        size: u32::MAX,
    })?;
    let (id, offset) = alloc.allocate(vdp, arena, size)?;
    let create = CreateBuffer {
        arena: arena as u8,
        buffer_id: id,
        mem_offset: offset,
        mem_size: size,
        format: format as u8,
        width,
        height,
        parent: NO_BUFFER,
    };
    submit_one(client, vdp, &create)?;
    log::info!(
        "VDP{} buffer {}: {:?} offset={:#x} size={}",
        vdp.id(),
        id,
        arena,
        offset,
        size
    );

    let flash = arena == BufferArena::Flash0;
    let max_chunk = client
        .max_cmd_size()
        .saturating_sub(HEADER_SIZE + WRITE_BUFFER_DATA_FIXED)
        .min(FLASH_PAGE_SIZE)
        .max(1);
    let mut pos = 0;
    let mut page_fill = 0;
    while pos < bytes.len() {
        let block = max_chunk.min(bytes.len() - pos);
        let last = pos + block == bytes.len();
        let mut flags = WriteFlags::empty();
        if flash && pos == 0 {
            flags |= WriteFlags::FIRST_PAGE;
        }
        page_fill += block;
        if flash && (page_fill >= FLASH_PAGE_SIZE || last) {
            flags |= WriteFlags::COMMIT_PAGE;
            page_fill %= FLASH_PAGE_SIZE;
        }
        if last {
            flags |= WriteFlags::FINAL_PAGE;
            if flash {
                flags |= WriteFlags::LOCK_WRITES;
            }
        }
        let write = WriteBufferData {
            buffer_id: id as u8,
            flags: flags.bits(),
            offset: pos as u32,
            allow_non_tile_zero: 0,
            data: &bytes[pos..pos + block],
        };
        submit_one(client, vdp, &write)?;
        pos += block;
    }
    Ok(id)
}

/// Upload an untyped resource to VDP1.
pub fn upload_resource<C: BusChannel, const N: usize>(
    client: &mut SubmissionClient<C, N>,
    alloc: &mut BufferAllocator,
    bytes: &[u8],
    arena: BufferArena,
) -> Result<u16, ClientError<C::Error>> {
    upload_buffer(client, alloc, Vdp::Vdp1, arena, bytes, TextureFormat::None, 0, 0)
}
