#![no_std]

/// Size of one erasable flash sector, in bytes.
pub const FLASH_SECTOR_SIZE: usize = 4096;

/// Abstracts one directed link of the inter-core packet bus.
///
/// Implementations own framing, CRC and retries. Callers only see ordered,
/// de-duplicated packets. Nothing in the pipeline sleeps: progress is made by
/// calling the pump methods from the owning core's main loop.
pub trait BusChannel {
    type Error: core::fmt::Debug;

    /// Drive the transmit side once (push queued packets, consume link acks).
    fn pump_send(&mut self) -> Result<(), Self::Error>;

    /// Drive the receive side once. If a complete packet is available it is
    /// copied into `buf` and its length returned.
    fn pump_receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Self::Error>;

    /// Queue a packet for transmission. The bytes are copied; the caller may
    /// reuse its buffer as soon as this returns.
    fn write_async(&mut self, packet: &[u8]) -> Result<(), Self::Error>;

    /// Send `request` and block until a response arrives, copying it into
    /// `response`. Implementations MUST give up after `timeout_ms`.
    fn request_blocking(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, Self::Error>;
}

/// Failure reported by a flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFault {
    /// Offset or length falls outside the device window.
    OutOfRange,
    /// Offset is not sector aligned.
    Unaligned,
    /// The device reported a program/erase failure.
    Hardware,
}

/// Abstracts the flash window reserved for persistent GPU buffers.
///
/// All offsets are relative to the start of the window.
pub trait FlashDevice {
    /// Window size in bytes.
    fn size(&self) -> usize;

    /// Memory-mapped (XIP) view of the whole window.
    fn contents(&self) -> &[u8];

    /// Erase one sector to `0xFF`.
    fn erase_sector(&mut self, offset: u32) -> Result<(), FlashFault>;

    /// Program one full sector. The sector must have been erased.
    fn program_sector(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashFault>;

    /// Erase then program a sector as one step.
    ///
    /// Embedded implementations override this to run with interrupts masked;
    /// XIP reads from the other core are not possible while it runs.
    fn commit_sector(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashFault> {
        self.erase_sector(offset)?;
        self.program_sector(offset, data)
    }
}
