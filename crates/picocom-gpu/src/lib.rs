//! Command-list graphics pipeline for a three-core console.
//!
//! The app core records draw commands with a [`SubmissionClient`] and ships
//! them over a [`picocom_hal::BusChannel`]. VDP1 ([`Vdp1Core`]) renders each
//! list band by band and forwards finished bands to VDP2 ([`Vdp2Core`]),
//! which composites them and presents.

/// Per-core buffer table over the RAM and flash arenas.
pub mod buffers;

/// Producer-side submission pool and frame recording.
pub mod client;

/// Command buffers, buffer lists and stream iteration.
pub mod cmd_list;

/// RGB565 helpers.
pub mod color;

/// Error types for every layer.
pub mod error;

/// Page-granular flash writer with a write budget.
pub mod flash;

/// Command executor, handlers and the command table.
pub mod gpu;

/// In-process bus link.
pub mod loopback;

/// Wire formats: command headers, command payloads and bus packets.
pub mod protocol;

/// Tile bands and frame buffers.
pub mod tile;

/// Buffer allocation and chunked uploads.
pub mod upload;

/// VDP1 and VDP2 consumer cores.
pub mod vdp;

pub use client::{ClientConfig, RecordId, Section, SubmissionClient};
pub use error::{BufferError, ClientError, FlashError, GpuErrorCode, GpuFault, ProtocolError};
pub use gpu::{GpuConfig, GpuInstance, GpuState};
pub use upload::{BufferAllocator, Vdp};
pub use vdp::{Vdp1Core, Vdp2Core};
