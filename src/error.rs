use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::commands::CommandID;

/// Errors raised while decoding an incoming CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown command id in arbitration word {raw:#010x}")]
    UnknownCommand { raw: u32 },
    #[error("arbitration word {raw:#010x} does not fit the extended identifier layout")]
    BadArbitration { raw: u32 },
    #[error("payload length {len} exceeds the 8-byte frame limit")]
    BadPayloadLength { len: usize },
    #[error("chunked payload is missing frame {expected}")]
    MissingChunk { expected: u8 },
}

#[derive(Debug, Error)]
pub enum JaegerError {
    #[error("CAN connection not established")]
    CanNotStarted,

    #[error("bus interface {0:?} disconnected")]
    BusDisconnected(String),

    #[error("command {command_id:?} to {pids:?} timed out after {elapsed:?}")]
    TimedOut {
        command_id: CommandID,
        pids: Vec<u16>,
        elapsed: Duration,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("the FPS is locked")]
    FpsLocked,

    #[error("an FPS instance is already running; retrieve it from the registry")]
    AlreadyRunning,

    #[error("lock file {0:?} exists; is another instance running?")]
    LockFilePresent(PathBuf),

    #[error("cannot send a move command while the FPS is moving")]
    FpsMoving,

    #[error("cannot send a non-bootloader command while in bootloader mode")]
    InBootloader,

    #[error("some commanded positioners are disabled: {ids:?}")]
    DisabledInvolved { ids: Vec<u16> },

    #[error("positioner {id} is not connected")]
    UnknownPositioner { id: u16 },

    #[error("positioner {id} failed to initialise: {cause}")]
    PositionerInitFailed { id: u16, cause: String },

    #[error("collision detected on positioners {ids:?}")]
    CollisionDetected { ids: Vec<u16> },

    #[error("cannot unlock the FPS until all collisions have been cleared: {ids:?}")]
    StillCollided { ids: Vec<u16> },

    #[error("trajectory failed: {reason}")]
    Trajectory {
        reason: String,
        partial: Option<Box<crate::trajectory::Trajectory>>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Usage(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for JaegerError {
    fn from(err: serde_yaml::Error) -> Self {
        JaegerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JaegerError>;
