//! Error types for the command pipeline.
//!
//! Each component has its own enum. Errors raised while executing a command
//! on a VDP core are folded into a [`GpuFault`] carrying the device-side
//! [`GpuErrorCode`] so they can be counted per frame and reported back to the
//! producer in the acknowledgement.

use picocom_hal::FlashFault;
use thiserror::Error;

use crate::protocol::BufferArena;

/// Device-side error taxonomy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuErrorCode {
    #[default]
    None = 0,
    General = 1,
    InvalidBufferId = 2,
    FlashWriteMax = 3,
    OutOfBounds = 4,
}

/// Command buffer / command buffer list failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdListError {
    #[error("zero-sized command")]
    ZeroSize,
    #[error("command of {size} bytes does not fit ({remaining} bytes left)")]
    Full { size: usize, remaining: usize },
    #[error("command buffer list exhausted after {buffers} buffers")]
    ListExhausted { buffers: usize },
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// Flash page writer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("offset {0:#x} is not page aligned")]
    Unaligned(u32),
    #[error("flash write budget of {ceiling} page programs exhausted")]
    BudgetExhausted { ceiling: u32 },
    #[error("out of sequence write at {offset:#x}, expected {expected:#x}")]
    OutOfSequence { offset: u32, expected: u32 },
    #[error("block of {size} bytes at {offset:#x} crosses a page boundary")]
    PageOverflow { offset: u32, size: usize },
    #[error("range {offset:#x}+{size} is outside the {window} byte flash window")]
    OutOfRange { offset: u32, size: usize, window: usize },
    #[error("flash device fault: {0:?}")]
    Device(FlashFault),
}

impl From<FlashFault> for FlashError {
    fn from(fault: FlashFault) -> Self {
        FlashError::Device(fault)
    }
}

impl FlashError {
    pub fn code(&self) -> GpuErrorCode {
        match self {
            FlashError::BudgetExhausted { .. } => GpuErrorCode::FlashWriteMax,
            FlashError::OutOfRange { .. } => GpuErrorCode::OutOfBounds,
            _ => GpuErrorCode::General,
        }
    }
}

/// Buffer table failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer id {0} is out of range")]
    InvalidId(u16),
    #[error("buffer {0} has not been created")]
    NotCreated(u16),
    #[error("unknown arena {0}")]
    UnknownArena(u8),
    #[error("no flash device is attached")]
    NoFlash,
    #[error("flash buffer offset {0:#x} is not page aligned")]
    Unaligned(u32),
    #[error("range {offset:#x}+{size} exceeds limit {limit:#x}")]
    OutOfBounds { offset: u32, size: u32, limit: u32 },
    #[error("buffer {id} overlaps live buffer {other}")]
    Overlap { id: u16, other: u16 },
    #[error("parent buffer {0} is not valid")]
    InvalidParent(u16),
    #[error("buffer {0} is locked against writes")]
    Locked(u16),
    #[error("buffer {id} has the wrong format for this use")]
    WrongFormat { id: u16 },
    #[error(transparent)]
    Flash(#[from] FlashError),
}

impl BufferError {
    pub fn code(&self) -> GpuErrorCode {
        match self {
            BufferError::InvalidId(_) | BufferError::NotCreated(_) | BufferError::InvalidParent(_) => {
                GpuErrorCode::InvalidBufferId
            }
            BufferError::OutOfBounds { .. } => GpuErrorCode::OutOfBounds,
            BufferError::Flash(e) => e.code(),
            _ => GpuErrorCode::General,
        }
    }
}

/// Wire encode/decode failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown command id {0}")]
    UnknownCommand(u8),
    #[error("unknown bus command {0}")]
    UnknownBusCommand(u8),
    #[error("declared size {declared} does not match encoded size {actual}")]
    BadSize { declared: usize, actual: usize },
    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u32 },
}

/// Extension registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtensionError {
    #[error("command id {0} is reserved for built-in commands")]
    ReservedId(u8),
    #[error("command id {0} is outside the command table")]
    OutOfRange(u8),
    #[error("no extension catalogued under key {0:#06x}")]
    UnknownExtension(u16),
    #[error("extension descriptor buffer {0} is too small")]
    DescriptorTooSmall(u16),
}

/// A failed command on a VDP core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason} ({code:?})")]
pub struct GpuFault {
    pub code: GpuErrorCode,
    pub reason: String,
}

impl GpuFault {
    pub fn new(code: GpuErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn general(reason: impl Into<String>) -> Self {
        Self::new(GpuErrorCode::General, reason)
    }
}

impl From<BufferError> for GpuFault {
    fn from(e: BufferError) -> Self {
        GpuFault::new(e.code(), e.to_string())
    }
}

impl From<ProtocolError> for GpuFault {
    fn from(e: ProtocolError) -> Self {
        GpuFault::general(e.to_string())
    }
}

impl From<ExtensionError> for GpuFault {
    fn from(e: ExtensionError) -> Self {
        GpuFault::general(e.to_string())
    }
}

/// Error type for producer operations, generic over the bus channel error.
#[derive(Debug, Error)]
pub enum ClientError<E: core::fmt::Debug> {
    #[error("bus transport error: {0:?}")]
    Transport(E),
    #[error("no free command buffer")]
    PoolExhausted,
    #[error("free pools out of sync: {buffers} buffers vs {records} records")]
    PoolDesync { buffers: usize, records: usize },
    #[error("record is not pending on this client")]
    UnknownRecord,
    #[error("command list seq {seq} was already committed")]
    AlreadyCommitted { seq: u32 },
    #[error("command list seq {seq} has not been committed")]
    NotCommitted { seq: u32 },
    #[error("command of {size} bytes does not fit and flushing is disabled")]
    FlushDisabled { size: usize },
    #[error("command of {size} bytes exceeds the command buffer capacity")]
    CommandTooLarge { size: usize },
    #[error("VDP2 sub-list has no room for {size} bytes")]
    SubListFull { size: usize },
    #[error("VDP{vdp} {arena:?} arena cannot fit {size} more bytes")]
    ArenaExhausted { vdp: u8, arena: BufferArena, size: u32 },
    #[error("VDP{vdp} has no free buffer ids")]
    NoBufferIds { vdp: u8 },
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("submission {seq} reported {errors} GPU errors")]
    GpuErrors { seq: u32, errors: u32 },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
}

impl<E: core::fmt::Debug> From<E> for ClientError<E> {
    fn from(e: E) -> Self {
        ClientError::Transport(e)
    }
}
