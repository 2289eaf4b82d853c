//! Sequential page writer over the flash window backing persistent buffers.
//!
//! Writes arrive in strictly increasing order inside a stream opened by
//! [`FlashPageWriter::begin`]. Each page is staged in RAM and only erased and
//! programmed when its staged content differs from what flash already holds,
//! so re-uploading unchanged assets costs no erase cycles.

use picocom_hal::{FlashDevice, FlashFault, FLASH_SECTOR_SIZE};

use crate::error::FlashError;

pub const FLASH_PAGE_SIZE: usize = FLASH_SECTOR_SIZE;

/// Erased flash byte value.
pub const FLASH_ERASED: u8 = 0xFF;

/// Default number of page programs allowed per boot.
pub const DEFAULT_WRITE_CEILING: u32 = 1024;

/// Result of flushing the staging page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was staged.
    Idle,
    /// Staged bytes matched flash; no erase or program was issued.
    Unchanged,
    /// The page was erased and programmed.
    Programmed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    pub pages_programmed: u32,
    pub pages_skipped: u32,
    pub blocks_staged: u32,
}

pub struct FlashPageWriter {
    device: Box<dyn FlashDevice + Send + Sync>,
    staging: Vec<u8>,
    current_offset: u32,
    page_base: u32,
    staged_blocks: u32,
    write_ceiling: u32,
    stats: FlashStats,
}

impl core::fmt::Debug for FlashPageWriter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlashPageWriter")
            .field("size", &self.device.size())
            .field("current_offset", &self.current_offset)
            .field("page_base", &self.page_base)
            .field("staged_blocks", &self.staged_blocks)
            .field("write_ceiling", &self.write_ceiling)
            .field("stats", &self.stats)
            .finish()
    }
}

impl FlashPageWriter {
    pub fn new(device: Box<dyn FlashDevice + Send + Sync>, write_ceiling: u32) -> Self {
        Self {
            device,
            staging: vec![FLASH_ERASED; FLASH_PAGE_SIZE],
            current_offset: 0,
            page_base: 0,
            staged_blocks: 0,
            write_ceiling,
            stats: FlashStats::default(),
        }
    }

    /// Size of the flash window in bytes.
    pub fn size(&self) -> usize {
        self.device.size()
    }

    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    pub fn write_ceiling(&self) -> u32 {
        self.write_ceiling
    }

    /// Offset the next block must start at.
    pub fn expected_offset(&self) -> u32 {
        self.current_offset
    }

    /// Page programs left before the per-boot ceiling.
    pub fn remaining_budget(&self) -> u32 {
        self.write_ceiling.saturating_sub(self.stats.pages_programmed)
    }

    /// Open a sequential write stream at a page-aligned offset.
    pub fn begin(&mut self, base_offset: u32) -> Result<(), FlashError> {
        if base_offset as usize % FLASH_PAGE_SIZE != 0 {
            return Err(FlashError::Unaligned(base_offset));
        }
        if base_offset as usize >= self.device.size() {
            return Err(FlashError::OutOfRange {
                offset: base_offset,
                size: 0,
                window: self.device.size(),
            });
        }
        if self.remaining_budget() == 0 {
            return Err(FlashError::BudgetExhausted {
                ceiling: self.write_ceiling,
            });
        }
        self.reset_staging();
        self.current_offset = base_offset;
        self.page_base = base_offset;
        log::debug!("flash stream opened at {base_offset:#x}");
        Ok(())
    }

    /// Stage the next sequential block. Rejected blocks leave all state
    /// untouched. A block that completes its page flushes it.
    pub fn next_write_block(&mut self, global_offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if global_offset != self.current_offset {
            return Err(FlashError::OutOfSequence {
                offset: global_offset,
                expected: self.current_offset,
            });
        }
        let size = data.len();
        let local = global_offset as usize % FLASH_PAGE_SIZE;
        if size > FLASH_PAGE_SIZE || local > FLASH_PAGE_SIZE - size {
            return Err(FlashError::PageOverflow {
                offset: global_offset,
                size,
            });
        }
        if global_offset as usize + size > self.device.size() {
            return Err(FlashError::OutOfRange {
                offset: global_offset,
                size,
                window: self.device.size(),
            });
        }

        self.staging[local..local + size].copy_from_slice(data);
        self.staged_blocks += 1;
        self.stats.blocks_staged += 1;
        self.current_offset += size as u32;

        if local + size == FLASH_PAGE_SIZE {
            self.flush()?;
        }
        Ok(())
    }

    /// Commit the staging page if anything is staged.
    pub fn flush(&mut self) -> Result<FlushOutcome, FlashError> {
        if self.staged_blocks == 0 {
            return Ok(FlushOutcome::Idle);
        }
        let base = self.page_base as usize;
        let window = self.device.size();
        if base + FLASH_PAGE_SIZE > window {
            return Err(FlashError::OutOfRange {
                offset: self.page_base,
                size: FLASH_PAGE_SIZE,
                window,
            });
        }

        let outcome = if self.device.contents()[base..base + FLASH_PAGE_SIZE] == self.staging[..] {
            self.stats.pages_skipped += 1;
            FlushOutcome::Unchanged
        } else {
            if self.remaining_budget() == 0 {
                return Err(FlashError::BudgetExhausted {
                    ceiling: self.write_ceiling,
                });
            }
            self.device.commit_sector(self.page_base, &self.staging)?;
            self.stats.pages_programmed += 1;
            FlushOutcome::Programmed
        };
        log::debug!("flash page {:#x}: {:?}", self.page_base, outcome);

        self.reset_staging();
        self.staged_blocks = 0;
        self.page_base += FLASH_PAGE_SIZE as u32;
        Ok(outcome)
    }

    /// Close the stream, committing a partial final page.
    pub fn end(&mut self) -> Result<FlushOutcome, FlashError> {
        self.flush()
    }

    /// Read back committed bytes through the memory-mapped view.
    pub fn get(&self, offset: u32, len: usize) -> Result<&[u8], FlashError> {
        let start = offset as usize;
        let window = self.device.size();
        if start > window || len > window - start {
            return Err(FlashError::OutOfRange {
                offset,
                size: len,
                window,
            });
        }
        Ok(&self.device.contents()[start..start + len])
    }

    fn reset_staging(&mut self) {
        self.staging.fill(FLASH_ERASED);
    }
}

/// RAM-backed flash device, initially erased.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    data: Vec<u8>,
}

impl MemoryFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![FLASH_ERASED; size],
        }
    }

    fn check(&self, offset: u32, len: usize) -> Result<usize, FlashFault> {
        let start = offset as usize;
        if start % FLASH_SECTOR_SIZE != 0 {
            return Err(FlashFault::Unaligned);
        }
        if start + len > self.data.len() {
            return Err(FlashFault::OutOfRange);
        }
        Ok(start)
    }
}

impl FlashDevice for MemoryFlash {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn contents(&self) -> &[u8] {
        &self.data
    }

    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashFault> {
        let start = self.check(offset, FLASH_SECTOR_SIZE)?;
        self.data[start..start + FLASH_SECTOR_SIZE].fill(FLASH_ERASED);
        Ok(())
    }

    fn program_sector(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashFault> {
        let start = self.check(offset, data.len())?;
        // Programming can only clear bits.
        for (dst, src) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        Ok(())
    }
}
