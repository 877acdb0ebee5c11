use thiserror::Error;

use crate::iobytes::IoError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("not enough data")]
    NotEnoughData,
    #[error("invalid packet header")]
    InvalidHeader,
    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
    #[error("peer name is not valid UTF-8")]
    InvalidName,
    #[error("malformed MIDI command list")]
    InvalidMidiList,
}

impl From<IoError> for PacketError {
    fn from(_: IoError) -> Self {
        PacketError::NotEnoughData
    }
}
