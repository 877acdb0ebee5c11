//! AppleMIDI session command packets.
//!
//! Every command shares the `0xFFFF` marker followed by a two-letter command
//! code. IN/OK/NO/BY carry the session-exchange body (protocol version,
//! initiator id, SSRC and an optional NUL-terminated name); CK carries the
//! three-step clock-sync body; RS carries receiver feedback.

use crate::iobytes::{BytesReader, BytesWriter, IoError};

use super::error::PacketError;

pub const COMMAND_MARKER: [u8; 2] = [0xFF, 0xFF];
pub const PROTOCOL_VERSION: u32 = 2;

/// Body shared by IN, OK, NO and BY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExchange {
    pub initiator_id: u32,
    pub ssrc: u32,
    pub name: Option<String>,
}

/// Three-step round-trip measurement body. Timestamps are 100 microsecond
/// ticks since the sender's session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSync {
    pub ssrc: u32,
    pub count: u8,
    pub timestamps: [u64; 3],
}

/// Highest sequence number received, in the upper 16 bits of the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverFeedback {
    pub ssrc: u32,
    pub seq_nr: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPacket {
    Invitation(SessionExchange),
    Acceptance(SessionExchange),
    Rejection(SessionExchange),
    Goodbye(SessionExchange),
    ClockSync(ClockSync),
    ReceiverFeedback(ReceiverFeedback),
}

impl CommandPacket {
    pub fn is_command(data: &[u8]) -> bool {
        data.len() >= 4 && data[..2] == COMMAND_MARKER
    }

    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let mut reader = BytesReader::new(data);
        if reader.read_u16()? != 0xFFFF {
            return Err(PacketError::InvalidHeader);
        }
        let command = reader.read_u16()?;
        match &command.to_be_bytes() {
            b"IN" => Ok(CommandPacket::Invitation(SessionExchange::read(&mut reader)?)),
            b"OK" => Ok(CommandPacket::Acceptance(SessionExchange::read(&mut reader)?)),
            b"NO" => Ok(CommandPacket::Rejection(SessionExchange::read(&mut reader)?)),
            b"BY" => Ok(CommandPacket::Goodbye(SessionExchange::read(&mut reader)?)),
            b"CK" => Ok(CommandPacket::ClockSync(ClockSync::read(&mut reader)?)),
            b"RS" => Ok(CommandPacket::ReceiverFeedback(ReceiverFeedback::read(
                &mut reader,
            )?)),
            _ => Err(PacketError::UnknownCommand(command)),
        }
    }

    fn code(&self) -> &'static [u8; 2] {
        match self {
            CommandPacket::Invitation(_) => b"IN",
            CommandPacket::Acceptance(_) => b"OK",
            CommandPacket::Rejection(_) => b"NO",
            CommandPacket::Goodbye(_) => b"BY",
            CommandPacket::ClockSync(_) => b"CK",
            CommandPacket::ReceiverFeedback(_) => b"RS",
        }
    }

    pub fn write(&self, writer: &mut BytesWriter) -> Result<(), IoError> {
        writer.write_bytes(&COMMAND_MARKER)?;
        writer.write_bytes(self.code())?;
        match self {
            CommandPacket::Invitation(body)
            | CommandPacket::Acceptance(body)
            | CommandPacket::Rejection(body)
            | CommandPacket::Goodbye(body) => body.write(writer),
            CommandPacket::ClockSync(body) => body.write(writer),
            CommandPacket::ReceiverFeedback(body) => body.write(writer),
        }
    }
}

impl SessionExchange {
    fn read(reader: &mut BytesReader) -> Result<Self, PacketError> {
        let version = reader.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }
        let initiator_id = reader.read_u32()?;
        let ssrc = reader.read_u32()?;
        let name = read_name(reader)?;
        Ok(SessionExchange {
            initiator_id,
            ssrc,
            name,
        })
    }

    fn write(&self, writer: &mut BytesWriter) -> Result<(), IoError> {
        writer.write_u32(PROTOCOL_VERSION)?;
        writer.write_u32(self.initiator_id)?;
        writer.write_u32(self.ssrc)?;
        if let Some(name) = &self.name {
            writer.write_bytes(name.as_bytes())?;
            writer.write_u8(0)?;
        }
        Ok(())
    }
}

/// The name field is optional; when present it runs to a NUL terminator or,
/// leniently, to the end of the packet.
fn read_name(reader: &mut BytesReader) -> Result<Option<String>, PacketError> {
    if reader.is_eof() {
        return Ok(None);
    }
    let rest = reader.read_rest();
    let bytes = match rest.iter().position(|&b| b == 0) {
        Some(nul) => &rest[..nul],
        None => rest,
    };
    let name = std::str::from_utf8(bytes).map_err(|_| PacketError::InvalidName)?;
    Ok(Some(name.to_string()))
}

impl ClockSync {
    fn read(reader: &mut BytesReader) -> Result<Self, PacketError> {
        let ssrc = reader.read_u32()?;
        let count = reader.read_u8()?;
        reader.read_bytes(3)?; // reserved
        let mut timestamps = [0u64; 3];
        for timestamp in timestamps.iter_mut() {
            *timestamp = reader.read_u64()?;
        }
        Ok(ClockSync {
            ssrc,
            count,
            timestamps,
        })
    }

    fn write(&self, writer: &mut BytesWriter) -> Result<(), IoError> {
        writer.write_u32(self.ssrc)?;
        writer.write_u8(self.count)?;
        writer.write_bytes(&[0, 0, 0])?;
        for timestamp in self.timestamps {
            writer.write_u64(timestamp)?;
        }
        Ok(())
    }
}

impl ReceiverFeedback {
    fn read(reader: &mut BytesReader) -> Result<Self, PacketError> {
        Ok(ReceiverFeedback {
            ssrc: reader.read_u32()?,
            seq_nr: reader.read_u32()?,
        })
    }

    fn write(&self, writer: &mut BytesWriter) -> Result<(), IoError> {
        writer.write_u32(self.ssrc)?;
        writer.write_u32(self.seq_nr)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &CommandPacket) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let mut writer = BytesWriter::new(&mut buf);
        packet.write(&mut writer).unwrap();
        writer.written().to_vec()
    }

    #[test]
    fn test_invitation_round_trip() {
        let packet = CommandPacket::Invitation(SessionExchange {
            initiator_id: 0xF8D180E6,
            ssrc: 0xF519AEB9,
            name: Some("Lovely Session".to_string()),
        });
        let bytes = encode(&packet);
        assert_eq!(&bytes[0..2], &[0xFF, 0xFF]);
        assert_eq!(&bytes[2..4], b"IN");
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(bytes[bytes.len() - 1], 0);
        assert_eq!(CommandPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_parse_acceptance_fixture() {
        let buffer = [
            0xFF, 0xFF, 0x4F, 0x4B, //header "OK"
            0x00, 0x00, 0x00, 0x02, //version
            0xF8, 0xD1, 0x80, 0xE6, //initiator id
            0xF5, 0x19, 0xAE, 0xB9, //sender ssrc
            0x4C, 0x6F, 0x76, 0x65, 0x6C, 0x79, 0x20, 0x53, 0x65, 0x73, 0x73, 0x69, 0x6F, 0x6E,
            0x00, //name
        ];
        match CommandPacket::parse(&buffer).unwrap() {
            CommandPacket::Acceptance(body) => {
                assert_eq!(body.initiator_id, 0xF8D180E6);
                assert_eq!(body.ssrc, 0xF519AEB9);
                assert_eq!(body.name.as_deref(), Some("Lovely Session"));
            }
            other => panic!("Expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_goodbye_has_no_name() {
        let packet = CommandPacket::Goodbye(SessionExchange {
            initiator_id: 1,
            ssrc: 2,
            name: None,
        });
        let bytes = encode(&packet);
        assert_eq!(bytes.len(), 16);
        assert_eq!(CommandPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_name_without_terminator_is_accepted() {
        let buffer = [
            0xFF, 0xFF, 0x49, 0x4E, //header "IN"
            0x00, 0x00, 0x00, 0x02, //version
            0x12, 0x34, 0x56, 0x78, //initiator id
            0xAA, 0xBB, 0xCC, 0xDD, //ssrc
            b'p', b'a', b'd', //unterminated name
        ];
        match CommandPacket::parse(&buffer).unwrap() {
            CommandPacket::Invitation(body) => assert_eq!(body.name.as_deref(), Some("pad")),
            other => panic!("Expected invitation, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_version() {
        let buffer = [
            0xFF, 0xFF, 0x49, 0x4E, //header "IN"
            0x00, 0x00, 0x00, 0x03, //version 3
            0x12, 0x34, 0x56, 0x78, //initiator id
            0xAA, 0xBB, 0xCC, 0xDD, //ssrc
        ];
        assert_eq!(
            CommandPacket::parse(&buffer),
            Err(PacketError::UnsupportedVersion(3))
        );
    }

    #[test]
    fn test_clock_sync_fixture() {
        let buffer = [
            0xFF, 0xFF, 0x43, 0x4B, //header "CK"
            0xF5, 0x19, 0xAE, 0xB9, //sender ssrc
            0x02, //count
            0x00, 0x00, 0x00, //reserved
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // timestamp 1
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, // timestamp 2
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, // timestamp 3
        ];
        match CommandPacket::parse(&buffer).unwrap() {
            CommandPacket::ClockSync(ck) => {
                assert_eq!(ck.count, 2);
                assert_eq!(ck.ssrc, 4112101049);
                assert_eq!(ck.timestamps, [1, 2, 3]);
            }
            other => panic!("Expected clock sync, got {other:?}"),
        }
    }

    #[test]
    fn test_clock_sync_write_fixture() {
        let expected = [
            0xFF, 0xFF, 0x43, 0x4B, //header
            0xF5, 0x19, 0xAE, 0xB9, //sender ssrc
            0x02, //count
            0x00, 0x00, 0x00, //reserved
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, //
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03,
        ];
        let packet = CommandPacket::ClockSync(ClockSync {
            ssrc: 4112101049,
            count: 2,
            timestamps: [1, 2, 3],
        });
        assert_eq!(encode(&packet), expected);
    }

    #[test]
    fn test_receiver_feedback_round_trip() {
        let packet = CommandPacket::ReceiverFeedback(ReceiverFeedback {
            ssrc: 0xAABBCCDD,
            seq_nr: 0x0123 << 16,
        });
        let bytes = encode(&packet);
        assert_eq!(&bytes[2..4], b"RS");
        assert_eq!(bytes.len(), 12);
        assert_eq!(CommandPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_unknown_command() {
        let buffer = [0xFF, 0xFF, b'X', b'Y', 0, 0, 0, 2];
        assert_eq!(
            CommandPacket::parse(&buffer),
            Err(PacketError::UnknownCommand(0x5859))
        );
    }

    #[test]
    fn test_truncated_packet() {
        let buffer = [0xFF, 0xFF, b'C'];
        assert_eq!(
            CommandPacket::parse(&buffer),
            Err(PacketError::NotEnoughData)
        );
    }

    #[test]
    fn test_is_command() {
        assert!(CommandPacket::is_command(&[0xFF, 0xFF, b'I', b'N']));
        assert!(!CommandPacket::is_command(&[0x80, 0x61, 0, 0]));
        assert!(!CommandPacket::is_command(&[0xFF, 0xFF]));
    }
}
