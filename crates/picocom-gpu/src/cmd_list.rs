//! Command buffers: fixed-capacity byte arenas of wire-format commands.
//!
//! A [`CommandBuffer`] reserves a prefix for the frame header and appends
//! commands behind it. A [`CommandBufferList`] chains several buffers for
//! frames that overflow one. Nothing here allocates after construction.

use crate::error::{CmdListError, ProtocolError};
use crate::protocol::{CommandHeader, GpuCommand, HEADER_SIZE, MAX_CMD_SIZE};

/// A fixed-capacity command byte arena with a reserved header prefix.
#[derive(Debug, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
    header_size: usize,
    offset: usize,
    cmd_count: usize,
}

impl CommandBuffer {
    /// Allocate `alloc_size` bytes, the first `header_size` of which are
    /// reserved for the frame header.
    pub fn new(alloc_size: usize, header_size: usize) -> Self {
        let header_size = header_size.min(alloc_size);
        Self {
            data: vec![0; alloc_size],
            header_size,
            offset: header_size,
            cmd_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.offset = self.header_size;
        self.cmd_count = 0;
    }

    pub fn alloc_size(&self) -> usize {
        self.data.len()
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Write cursor; starts at `header_size`.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn cmd_count(&self) -> usize {
        self.cmd_count
    }

    pub fn is_empty(&self) -> bool {
        self.cmd_count == 0
    }

    /// Largest command that could ever fit in an empty buffer.
    pub fn capacity(&self) -> usize {
        self.data.len() - self.header_size
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Whether a command of `size` bytes fits behind the cursor. An exact
    /// fit counts.
    pub fn can_add(&self, size: usize) -> bool {
        size != 0 && self.offset + size <= self.data.len()
    }

    /// Reserve `size` bytes for a new command. Returns `None` without
    /// touching the cursor or count if it does not fit.
    pub fn add_next(&mut self, size: usize) -> Option<&mut [u8]> {
        if size == 0 || self.offset + size > self.data.len() {
            return None;
        }
        let start = self.offset;
        self.offset += size;
        self.cmd_count += 1;
        Some(&mut self.data[start..self.offset])
    }

    /// Append an already-encoded command. Its header's size must match.
    pub fn add(&mut self, cmd: &[u8]) -> Result<(), CmdListError> {
        let header = CommandHeader::decode(cmd)?;
        let size = header.size as usize;
        if size != cmd.len() {
            return Err(ProtocolError::BadSize {
                declared: size,
                actual: cmd.len(),
            }
            .into());
        }
        let remaining = self.remaining();
        match self.add_next(size) {
            Some(region) => {
                region.copy_from_slice(cmd);
                Ok(())
            }
            None if size == 0 => Err(CmdListError::ZeroSize),
            None => Err(CmdListError::Full { size, remaining }),
        }
    }

    /// Encode and append a typed command.
    pub fn push<'a, T: GpuCommand<'a>>(
        &mut self,
        cmd: &T,
        cull_mask: Option<u16>,
    ) -> Result<(), CmdListError> {
        let size = cmd.encoded_len();
        if size > MAX_CMD_SIZE {
            return Err(ProtocolError::BadSize {
                declared: MAX_CMD_SIZE,
                actual: size,
            }
            .into());
        }
        let remaining = self.remaining();
        let region = self
            .add_next(size)
            .ok_or(CmdListError::Full { size, remaining })?;
        cmd.encode(cull_mask, region)?;
        Ok(())
    }

    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.header_size]
    }

    /// Header prefix plus every appended command.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.offset]
    }

    /// Appended commands only.
    pub fn commands(&self) -> &[u8] {
        &self.data[self.header_size..self.offset]
    }

    pub fn stream(&self) -> CommandStream<'_> {
        CommandStream::new(self.commands(), self.cmd_count)
    }
}

/// A borrowed sequence of commands with a declared count.
#[derive(Debug, Clone, Copy)]
pub struct CommandStream<'a> {
    pub data: &'a [u8],
    pub count: usize,
}

impl<'a> CommandStream<'a> {
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self { data, count }
    }

    pub fn iter(&self) -> CommandIter<'a> {
        CommandIter {
            data: self.data,
            count: self.count,
            index: 0,
            offset: 0,
            corruption: None,
        }
    }
}

/// One command located inside a stream.
#[derive(Debug, Clone, Copy)]
pub struct RawCommand<'a> {
    pub index: usize,
    /// Byte offset of the header within the stream.
    pub offset: usize,
    pub header: CommandHeader,
    /// Header and payload.
    pub bytes: &'a [u8],
}

impl<'a> RawCommand<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..]
    }
}

/// Why a stream walk stopped before its declared count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCorruption {
    ZeroSize { index: usize, offset: usize },
    Overrun { index: usize, offset: usize, size: usize },
    TruncatedHeader { index: usize, offset: usize },
}

impl StreamCorruption {
    /// Byte offset where the walk stopped.
    pub fn offset(&self) -> usize {
        match *self {
            Self::ZeroSize { offset, .. }
            | Self::Overrun { offset, .. }
            | Self::TruncatedHeader { offset, .. } => offset,
        }
    }
}

/// Walks commands until the declared count is reached or the stream looks
/// corrupt. A zero or oversized size ends the walk.
pub struct CommandIter<'a> {
    data: &'a [u8],
    count: usize,
    index: usize,
    offset: usize,
    corruption: Option<StreamCorruption>,
}

impl<'a> CommandIter<'a> {
    pub fn corruption(&self) -> Option<StreamCorruption> {
        self.corruption
    }

    /// Commands yielded so far.
    pub fn visited(&self) -> usize {
        self.index
    }
}

impl<'a> Iterator for CommandIter<'a> {
    type Item = RawCommand<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.corruption.is_some() || self.index >= self.count || self.offset >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        let Ok(header) = CommandHeader::decode(rest) else {
            self.corruption = Some(StreamCorruption::TruncatedHeader {
                index: self.index,
                offset: self.offset,
            });
            return None;
        };
        let size = header.size as usize;
        if size == 0 {
            self.corruption = Some(StreamCorruption::ZeroSize {
                index: self.index,
                offset: self.offset,
            });
            return None;
        }
        if size < HEADER_SIZE || size > rest.len() {
            self.corruption = Some(StreamCorruption::Overrun {
                index: self.index,
                offset: self.offset,
                size,
            });
            return None;
        }
        let cmd = RawCommand {
            index: self.index,
            offset: self.offset,
            header,
            bytes: &rest[..size],
        };
        self.index += 1;
        self.offset += size;
        Some(cmd)
    }
}

/// An ordered chain of command buffers for frames that overflow one.
#[derive(Debug, Clone)]
pub struct CommandBufferList {
    buffers: Vec<CommandBuffer>,
    current: usize,
    access: AccessType,
}

impl CommandBufferList {
    /// # Panics
    /// If `list_count` is zero.
    pub fn new(alloc_size: usize, header_size: usize, list_count: usize) -> Self {
        assert!(list_count > 0, "command buffer list needs at least one buffer");
        Self {
            buffers: (0..list_count)
                .map(|_| CommandBuffer::new(alloc_size, header_size))
                .collect(),
            current: 0,
            access: AccessType::None,
        }
    }

    pub fn clear(&mut self) {
        self.current = 0;
        self.buffers.iter_mut().for_each(CommandBuffer::clear);
    }

    /// Reserve `size` bytes, moving to the next buffer if the current one
    /// is full. Fails once every buffer has been used. A command larger than
    /// an empty buffer is refused without advancing.
    pub fn add_next(&mut self, size: usize) -> Result<&mut [u8], CmdListError> {
        if size == 0 {
            return Err(CmdListError::ZeroSize);
        }
        if self.current >= self.buffers.len() {
            return Err(CmdListError::ListExhausted {
                buffers: self.buffers.len(),
            });
        }
        if size > self.buffers[self.current].capacity() {
            return Err(CmdListError::Full {
                size,
                remaining: self.buffers[self.current].remaining(),
            });
        }
        if !self.buffers[self.current].can_add(size) {
            self.add_list()?;
        }
        let buffer = &mut self.buffers[self.current];
        let remaining = buffer.remaining();
        buffer
            .add_next(size)
            .ok_or(CmdListError::Full { size, remaining })
    }

    pub fn add(&mut self, cmd: &[u8]) -> Result<(), CmdListError> {
        let region = self.add_next(cmd.len())?;
        region.copy_from_slice(cmd);
        Ok(())
    }

    pub fn push<'a, T: GpuCommand<'a>>(
        &mut self,
        cmd: &T,
        cull_mask: Option<u16>,
    ) -> Result<(), CmdListError> {
        let region = self.add_next(cmd.encoded_len())?;
        cmd.encode(cull_mask, region)?;
        Ok(())
    }

    /// Move on to the next (cleared) buffer.
    pub fn add_list(&mut self) -> Result<&mut CommandBuffer, CmdListError> {
        self.current += 1;
        if self.current >= self.buffers.len() {
            return Err(CmdListError::ListExhausted {
                buffers: self.buffers.len(),
            });
        }
        let buffer = &mut self.buffers[self.current];
        buffer.clear();
        Ok(buffer)
    }

    /// Number of buffers in use.
    pub fn get_count(&self) -> usize {
        (self.current + 1).min(self.buffers.len())
    }

    /// A buffer in use, by index.
    pub fn get(&self, index: usize) -> Option<&CommandBuffer> {
        if index > self.current {
            return None;
        }
        self.buffers.get(index)
    }

    pub fn current(&self) -> Option<&CommandBuffer> {
        self.get(self.current)
    }

    pub fn access(&self) -> AccessType {
        self.access
    }

    pub fn set_access(&mut self, access: AccessType) {
        self.access = access;
    }
}

/// How a list in a [`DoubleBuffer`] is currently being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    None,
    Write,
    ReadShared,
    ReadExclusive,
}

/// A producer/consumer pair of lists swapped once per frame.
#[derive(Debug, Clone)]
pub struct DoubleBuffer {
    lists: [CommandBufferList; 2],
    current: usize,
}

impl DoubleBuffer {
    pub fn new(alloc_size: usize, header_size: usize, list_count: usize) -> Self {
        Self {
            lists: [
                CommandBufferList::new(alloc_size, header_size, list_count),
                CommandBufferList::new(alloc_size, header_size, list_count),
            ],
            current: 0,
        }
    }

    pub fn writing(&mut self) -> &mut CommandBufferList {
        &mut self.lists[self.current % 2]
    }

    pub fn reading(&self) -> &CommandBufferList {
        &self.lists[(self.current + 1) % 2]
    }

    /// Swap the writing and reading lists.
    ///
    /// # Panics
    /// If the writing list is held for reading or the reading list is held
    /// for writing; either means the pipeline flipped out of turn.
    pub fn flip(&mut self) {
        let writing = self.lists[self.current % 2].access();
        let reading = self.lists[(self.current + 1) % 2].access();
        assert!(
            matches!(writing, AccessType::None | AccessType::Write),
            "writer list has invalid access type {writing:?}"
        );
        assert!(
            matches!(reading, AccessType::None | AccessType::ReadShared),
            "reader list has invalid access type {reading:?}"
        );
        self.current += 1;
        self.lists[(self.current + 1) % 2].set_access(AccessType::ReadShared);
        self.lists[self.current % 2].set_access(AccessType::Write);
    }
}
