//! GPU buffer table: up to 256 typed buffers carved from the RAM arena or
//! from the flash window.
//!
//! The producer picks arena offsets; this table checks every request against
//! the arena bounds and against other live buffers before accepting it, so a
//! bad command can never alias or overrun memory owned by another buffer.

use crate::error::{BufferError, FlashError};
use crate::flash::{FlashPageWriter, FLASH_PAGE_SIZE};
use crate::protocol::cmds::{CreateBuffer, NO_BUFFER};
use crate::protocol::{BufferArena, TextureFormat, WriteFlags};

pub const MAX_BUFFERS: usize = 256;

pub const DEFAULT_RAM_ARENA_SIZE: usize = 64 * 1024;

/// Number of neighbour links a tilemap buffer carries.
pub const EDGE_COUNT: usize = 9;

/// Slot of a buffer's own chunk in its edge table.
pub const EDGE_SELF: usize = 4;

/// One live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub arena: BufferArena,
    /// Absolute offset within the arena.
    pub offset: u32,
    pub size: u32,
    pub format: TextureFormat,
    pub width: u16,
    pub height: u16,
    pub parent: Option<u16>,
    pub write_count: u32,
    pub final_write_count: u32,
    pub locked: bool,
    /// Neighbouring tilemap chunks. Links only; each is owned by its own slot.
    pub edges: [Option<u16>; EDGE_COUNT],
}

impl GpuBuffer {
    fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    fn overlaps(&self, offset: u32, size: u32) -> bool {
        if self.size == 0 || size == 0 {
            return false;
        }
        (offset as u64) < self.end() && (self.offset as u64) < offset as u64 + size as u64
    }
}

/// Fixed RAM region handed out to RAM-arena buffers.
#[derive(Debug, Clone)]
pub struct RamArena {
    data: Vec<u8>,
}

impl RamArena {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn region(&self, offset: u32, len: usize) -> Result<&[u8], BufferError> {
        let start = self.check(offset, len)?;
        Ok(&self.data[start..start + len])
    }

    pub fn region_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8], BufferError> {
        let start = self.check(offset, len)?;
        Ok(&mut self.data[start..start + len])
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    fn check(&self, offset: u32, len: usize) -> Result<usize, BufferError> {
        let start = offset as usize;
        if start > self.data.len() || len > self.data.len() - start {
            return Err(BufferError::OutOfBounds {
                offset,
                size: len as u32,
                limit: self.data.len() as u32,
            });
        }
        Ok(start)
    }
}

/// The buffer table with both arenas.
#[derive(Debug)]
pub struct BufferTable {
    slots: Vec<Option<GpuBuffer>>,
    ram: RamArena,
    flash: Option<FlashPageWriter>,
}

fn slot_index(id: u16) -> Result<usize, BufferError> {
    if id as usize >= MAX_BUFFERS {
        return Err(BufferError::InvalidId(id));
    }
    Ok(id as usize)
}

impl BufferTable {
    pub fn new(ram_size: usize, flash: Option<FlashPageWriter>) -> Self {
        Self {
            slots: vec![None; MAX_BUFFERS],
            ram: RamArena::new(ram_size),
            flash,
        }
    }

    pub fn flash(&self) -> Option<&FlashPageWriter> {
        self.flash.as_ref()
    }

    pub fn flash_mut(&mut self) -> Option<&mut FlashPageWriter> {
        self.flash.as_mut()
    }

    pub fn ram(&self) -> &RamArena {
        &self.ram
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn arena_size(&self, arena: BufferArena) -> Result<u64, BufferError> {
        match arena {
            BufferArena::Ram0 => Ok(self.ram.size() as u64),
            BufferArena::Flash0 => self
                .flash
                .as_ref()
                .map(|f| f.size() as u64)
                .ok_or(BufferError::NoFlash),
        }
    }

    /// Validate and register a buffer. On any error the table is unchanged.
    pub fn create(&mut self, cmd: &CreateBuffer) -> Result<(), BufferError> {
        let index = slot_index(cmd.buffer_id)?;
        let arena = BufferArena::from_u8(cmd.arena).map_err(|_| BufferError::UnknownArena(cmd.arena))?;
        let format =
            TextureFormat::from_u8(cmd.format).map_err(|_| BufferError::WrongFormat { id: cmd.buffer_id })?;

        let parent = match cmd.parent {
            NO_BUFFER => None,
            id => {
                let parent = self
                    .slots
                    .get(id as usize)
                    .copied()
                    .flatten()
                    .filter(|p| p.arena == arena && id != cmd.buffer_id)
                    .ok_or(BufferError::InvalidParent(id))?;
                Some((id, parent))
            }
        };

        if arena == BufferArena::Flash0 {
            let flash = self.flash.as_ref().ok_or(BufferError::NoFlash)?;
            if flash.remaining_budget() == 0 {
                return Err(FlashError::BudgetExhausted {
                    ceiling: flash.write_ceiling(),
                }
                .into());
            }
            if parent.is_none() && cmd.mem_offset as usize % FLASH_PAGE_SIZE != 0 {
                return Err(BufferError::Unaligned(cmd.mem_offset));
            }
        }

        let offset = match parent {
            Some((_, p)) => {
                if cmd.mem_offset as u64 + cmd.mem_size as u64 > p.size as u64 {
                    return Err(BufferError::OutOfBounds {
                        offset: cmd.mem_offset,
                        size: cmd.mem_size,
                        limit: p.size,
                    });
                }
                p.offset + cmd.mem_offset
            }
            None => cmd.mem_offset,
        };

        let arena_size = self.arena_size(arena)?;
        if offset as u64 + cmd.mem_size as u64 > arena_size {
            return Err(BufferError::OutOfBounds {
                offset,
                size: cmd.mem_size,
                limit: arena_size.min(u32::MAX as u64) as u32,
            });
        }

        if parent.is_none() {
            let clash = self.slots.iter().enumerate().find(|(i, s)| {
                *i != index
                    && s.is_some_and(|b| b.arena == arena && b.parent.is_none() && b.overlaps(offset, cmd.mem_size))
            });
            if let Some((other, _)) = clash {
                return Err(BufferError::Overlap {
                    id: cmd.buffer_id,
                    other: other as u16,
                });
            }
        }

        if arena == BufferArena::Flash0 && parent.is_none() {
            if let Some(flash) = self.flash.as_mut() {
                flash.begin(offset)?;
            }
        }

        self.slots[index] = Some(GpuBuffer {
            arena,
            offset,
            size: cmd.mem_size,
            format,
            width: cmd.width,
            height: cmd.height,
            parent: parent.map(|(id, _)| id),
            write_count: 0,
            final_write_count: 0,
            locked: false,
            edges: [None; EDGE_COUNT],
        });
        log::debug!(
            "buffer {} created: {:?} offset={:#x} size={} fmt={:?} {}x{}",
            cmd.buffer_id,
            arena,
            offset,
            cmd.mem_size,
            format,
            cmd.width,
            cmd.height
        );
        Ok(())
    }

    /// Copy `data` into a buffer at `offset`.
    ///
    /// Flash writes must arrive in order; `FIRST_PAGE` opens the page stream
    /// and `FINAL_PAGE` commits the last partial page. `FINAL_PAGE` and
    /// `LOCK_WRITES` lock the buffer in either arena. A rejected write leaves
    /// the buffer's counters untouched.
    pub fn write(&mut self, id: u16, offset: u32, data: &[u8], flags: WriteFlags) -> Result<(), BufferError> {
        let index = slot_index(id)?;
        let buffer = self.slots[index].as_mut().ok_or(BufferError::NotCreated(id))?;
        if buffer.locked {
            return Err(BufferError::Locked(id));
        }
        if offset as u64 + data.len() as u64 > buffer.size as u64 {
            return Err(BufferError::OutOfBounds {
                offset,
                size: data.len() as u32,
                limit: buffer.size,
            });
        }
        let base = buffer.offset + offset;

        match buffer.arena {
            BufferArena::Ram0 => {
                self.ram.region_mut(base, data.len())?.copy_from_slice(data);
            }
            BufferArena::Flash0 => {
                let flash = self.flash.as_mut().ok_or(BufferError::NoFlash)?;
                if flags.contains(WriteFlags::FIRST_PAGE) {
                    flash.begin(base)?;
                } else if base != flash.expected_offset() {
                    return Err(FlashError::OutOfSequence {
                        offset: base,
                        expected: flash.expected_offset(),
                    }
                    .into());
                }
                // Split at page boundaries; each block fits the staging page.
                let mut pos = base;
                let mut rest = data;
                while !rest.is_empty() {
                    let room = FLASH_PAGE_SIZE - pos as usize % FLASH_PAGE_SIZE;
                    let (block, tail) = rest.split_at(room.min(rest.len()));
                    flash.next_write_block(pos, block)?;
                    pos += block.len() as u32;
                    rest = tail;
                }
                if flags.contains(WriteFlags::FINAL_PAGE) {
                    flash.end()?;
                }
            }
        }

        buffer.write_count += 1;
        if flags.contains(WriteFlags::FINAL_PAGE) {
            buffer.final_write_count += 1;
            buffer.locked = true;
        }
        if flags.contains(WriteFlags::LOCK_WRITES) {
            buffer.locked = true;
        }
        Ok(())
    }

    pub fn get(&self, id: u16) -> Result<&GpuBuffer, BufferError> {
        let index = slot_index(id)?;
        self.slots[index].as_ref().ok_or(BufferError::NotCreated(id))
    }

    /// Every byte of a buffer.
    pub fn data(&self, id: u16) -> Result<&[u8], BufferError> {
        let size = self.get(id)?.size as usize;
        self.read(id, 0, size)
    }

    /// Read `len` bytes at `offset` within a buffer.
    pub fn read(&self, id: u16, offset: u32, len: usize) -> Result<&[u8], BufferError> {
        let buffer = self.get(id)?;
        if offset as u64 + len as u64 > buffer.size as u64 {
            return Err(BufferError::OutOfBounds {
                offset,
                size: len as u32,
                limit: buffer.size,
            });
        }
        let base = buffer.offset + offset;
        match buffer.arena {
            BufferArena::Ram0 => self.ram.region(base, len),
            BufferArena::Flash0 => {
                let flash = self.flash.as_ref().ok_or(BufferError::NoFlash)?;
                Ok(flash.get(base, len)?)
            }
        }
    }

    /// Bind neighbour links. [`NO_BUFFER`] leaves a slot as it is.
    /// Every named edge must be live; otherwise nothing is changed.
    pub fn link_edges(&mut self, id: u16, edges: &[u16; EDGE_COUNT]) -> Result<(), BufferError> {
        self.get(id)?;
        for &edge in edges.iter().filter(|e| **e != NO_BUFFER) {
            self.get(edge)?;
        }
        let index = slot_index(id)?;
        if let Some(buffer) = self.slots[index].as_mut() {
            for (slot, &edge) in buffer.edges.iter_mut().zip(edges) {
                if edge != NO_BUFFER {
                    *slot = Some(edge);
                }
            }
        }
        Ok(())
    }

    /// Invalidate every buffer and zero the RAM arena.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.ram.reset();
        log::info!("buffer table reset");
    }
}
