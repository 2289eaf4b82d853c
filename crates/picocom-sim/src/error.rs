use picocom_gpu::error::{ClientError, CmdListError};
use picocom_gpu::loopback::LoopbackError;
use thiserror::Error;

/// Errors surfaced by the simulator.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("submission failed: {0}")]
    Client(#[from] ClientError<LoopbackError>),

    /// A VDP core failed to move packets over its link.
    #[error("VDP{vdp} link fault: {source}")]
    Link { vdp: u8, source: LoopbackError },

    #[error("demo scene does not fit a command buffer: {0}")]
    Scene(#[from] CmdListError),
}

pub type Result<T> = std::result::Result<T, SimError>;
