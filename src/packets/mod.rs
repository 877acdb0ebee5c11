pub mod command;
pub mod error;
pub mod midi;

use command::CommandPacket;
use error::PacketError;
use midi::{MidiPacket, RtpHeader};

/// Everything that can arrive on a session socket.
#[derive(Debug)]
pub enum RtpMidiPacket<'a> {
    Command(CommandPacket),
    Midi(MidiPacket<'a>),
}

impl<'a> RtpMidiPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        if CommandPacket::is_command(data) {
            CommandPacket::parse(data).map(RtpMidiPacket::Command)
        } else if RtpHeader::matches(data) {
            MidiPacket::parse(data).map(RtpMidiPacket::Midi)
        } else {
            Err(PacketError::InvalidHeader)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iobytes::BytesWriter;
    use command::SessionExchange;

    #[test]
    fn test_classify_command() {
        let mut buf = [0u8; 64];
        let mut writer = BytesWriter::new(&mut buf);
        CommandPacket::Invitation(SessionExchange {
            initiator_id: 1,
            ssrc: 2,
            name: Some("box".to_string()),
        })
        .write(&mut writer)
        .unwrap();
        match RtpMidiPacket::parse(writer.written()).unwrap() {
            RtpMidiPacket::Command(CommandPacket::Invitation(body)) => {
                assert_eq!(body.initiator_id, 1)
            }
            other => panic!("Expected invitation, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_midi() {
        let mut buf = [0u8; 64];
        let mut writer = BytesWriter::new(&mut buf);
        midi::write_midi_packet(&mut writer, true, 1, 0, 3, &[0x90, 60, 100], None).unwrap();
        match RtpMidiPacket::parse(writer.written()).unwrap() {
            RtpMidiPacket::Midi(packet) => assert_eq!(packet.ssrc(), 3),
            other => panic!("Expected MIDI packet, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_garbage() {
        assert!(RtpMidiPacket::parse(&[0x00, 0x01, 0x02, 0x03]).is_err());
        assert!(RtpMidiPacket::parse(&[]).is_err());
    }
}
