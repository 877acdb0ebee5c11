//! RTP-MIDI data packets (RFC 6295 payload, payload type 0x61).
//!
//! Parsing borrows from the datagram without copying: [`MidiPacket::parse`]
//! validates the RTP header and the command-list length header, and
//! [`MidiPacket::commands`] walks the embedded MIDI commands, materialising
//! running status so every yielded command carries its status byte.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::iobytes::{BytesReader, BytesWriter, IoError};

use super::error::PacketError;

pub const PAYLOAD_TYPE: u8 = 0x61;
const RTP_VERSION: u8 = 0b1000_0000;
const RTP_VERSION_MASK: u8 = 0b1100_0000;
const MARKER_BIT: u8 = 0b1000_0000;

const FLAG_B: u8 = 0b1000_0000;
const FLAG_J: u8 = 0b0100_0000;
const FLAG_Z: u8 = 0b0010_0000;

/// Longest command list expressible with the two-byte length header.
pub const MAX_COMMAND_LIST_LEN: usize = 0x0FFF;

#[derive(Debug, Clone, Copy, KnownLayout, Unaligned, IntoBytes, Immutable, FromBytes)]
#[repr(C)]
pub struct RtpHeader {
    flags: u8,
    payload_type: u8,
    pub sequence_number: U16,
    pub timestamp: U32,
    pub ssrc: U32,
}

impl RtpHeader {
    pub const SIZE: usize = size_of::<RtpHeader>();

    fn new(marker: bool, sequence_number: u16, timestamp: u32, ssrc: u32) -> Self {
        RtpHeader {
            flags: RTP_VERSION,
            payload_type: PAYLOAD_TYPE | if marker { MARKER_BIT } else { 0 },
            sequence_number: U16::new(sequence_number),
            timestamp: U32::new(timestamp),
            ssrc: U32::new(ssrc),
        }
    }

    /// True when the buffer starts with an RTP v2 header carrying the
    /// RTP-MIDI payload type (marker bit ignored).
    pub fn matches(data: &[u8]) -> bool {
        data.len() >= Self::SIZE
            && data[0] & RTP_VERSION_MASK == RTP_VERSION
            && data[1] & !MARKER_BIT == PAYLOAD_TYPE
    }
}

/// Borrowed view over one parsed RTP-MIDI data packet.
#[derive(Debug)]
pub struct MidiPacket<'a> {
    header: &'a RtpHeader,
    commands: &'a [u8],
    z_flag: bool,
}

impl<'a> MidiPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        let (header, rest) =
            RtpHeader::ref_from_prefix(data).map_err(|_| PacketError::NotEnoughData)?;
        if header.flags & RTP_VERSION_MASK != RTP_VERSION
            || header.payload_type & !MARKER_BIT != PAYLOAD_TYPE
        {
            return Err(PacketError::InvalidHeader);
        }

        let mut reader = BytesReader::new(rest);
        let first = reader.read_u8()?;
        let length = if first & FLAG_B != 0 {
            (((first & 0x0F) as usize) << 8) | reader.read_u8()? as usize
        } else {
            (first & 0x0F) as usize
        };
        let commands = reader
            .read_bytes(length)
            .map_err(|_| PacketError::InvalidMidiList)?;

        if first & FLAG_J != 0 {
            // Journal header: flags byte and checkpoint sequence. The
            // chapters that may follow are not used for recovery here.
            reader.read_u8()?;
            reader.read_u16()?;
        }

        Ok(MidiPacket {
            header,
            commands,
            z_flag: first & FLAG_Z != 0,
        })
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number.get()
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp.get()
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc.get()
    }

    pub fn commands(&self) -> MidiCommandIterator<'a> {
        MidiCommandIterator {
            data: self.commands,
            running_status: None,
            first: true,
            z_flag: self.z_flag,
            failed: false,
        }
    }
}

/// One MIDI command with its status byte made explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiCommand<'a> {
    pub status: u8,
    pub data: &'a [u8],
}

impl MidiCommand<'_> {
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        buf.put_u8(self.status);
        buf.put_slice(self.data);
        buf.freeze()
    }
}

#[derive(Debug)]
pub struct MidiCommandIterator<'a> {
    data: &'a [u8],
    running_status: Option<u8>,
    first: bool,
    z_flag: bool,
    failed: bool,
}

impl<'a> MidiCommandIterator<'a> {
    fn next_command(&mut self) -> Result<MidiCommand<'a>, PacketError> {
        let mut reader = BytesReader::new(self.data);

        // Delta time precedes every command except the first when Z is clear.
        let has_delta = if self.first { self.z_flag } else { true };
        self.first = false;
        if has_delta {
            skip_delta_time(&mut reader)?;
        }

        let first_byte = reader.read_u8().map_err(|_| PacketError::InvalidMidiList)?;
        let command = if first_byte == 0xF0 {
            let rest = reader.read_rest();
            let end = rest
                .iter()
                .position(|&b| b == 0xF7)
                .ok_or(PacketError::InvalidMidiList)?;
            let data = &rest[..=end];
            self.data = &rest[end + 1..];
            self.running_status = None;
            return Ok(MidiCommand {
                status: 0xF0,
                data,
            });
        } else if first_byte & 0x80 != 0 {
            let len = data_len_for_status(first_byte);
            let data = reader
                .read_bytes(len)
                .map_err(|_| PacketError::InvalidMidiList)?;
            MidiCommand {
                status: first_byte,
                data,
            }
        } else {
            // Data byte at list head reuses the previous status byte.
            let status = self
                .running_status
                .ok_or(PacketError::InvalidMidiList)?;
            let len = data_len_for_status(status);
            reader.seek(reader.position() - 1).map_err(|_| PacketError::InvalidMidiList)?;
            let data = reader
                .read_bytes(len)
                .map_err(|_| PacketError::InvalidMidiList)?;
            MidiCommand { status, data }
        };

        // Channel voice status bytes establish running status; system
        // commands do not.
        if command.status < 0xF0 {
            self.running_status = Some(command.status);
        }
        self.data = reader.read_rest();
        Ok(command)
    }
}

impl<'a> Iterator for MidiCommandIterator<'a> {
    type Item = Result<MidiCommand<'a>, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.data.is_empty() {
            return None;
        }
        match self.next_command() {
            Ok(command) => Some(Ok(command)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Delta times are the usual variable-length quantity, at most four bytes.
fn skip_delta_time(reader: &mut BytesReader) -> Result<(), PacketError> {
    for _ in 0..4 {
        let byte = reader.read_u8().map_err(|_| PacketError::InvalidMidiList)?;
        if byte & 0x80 == 0 {
            return Ok(());
        }
    }
    Err(PacketError::InvalidMidiList)
}

fn data_len_for_status(status: u8) -> usize {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => 2,
        0xC0 | 0xD0 => 1,
        _ => match status {
            0xF1 | 0xF3 => 1,
            0xF2 => 2,
            _ => 0,
        },
    }
}

/// Serialises one RTP-MIDI data packet: RTP header, command-list header,
/// the raw MIDI commands, and, when a checkpoint is given, the empty
/// recovery-journal header (no chapters) with the J bit set.
pub fn write_midi_packet(
    writer: &mut BytesWriter,
    marker: bool,
    sequence_number: u16,
    timestamp: u32,
    ssrc: u32,
    commands: &[u8],
    journal_checkpoint: Option<u16>,
) -> Result<(), PacketError> {
    if commands.len() > MAX_COMMAND_LIST_LEN {
        return Err(PacketError::InvalidMidiList);
    }

    let header = RtpHeader::new(marker, sequence_number, timestamp, ssrc);
    writer.write_bytes(header.as_bytes())?;

    let mut flags = 0u8;
    if journal_checkpoint.is_some() {
        flags |= FLAG_J;
    }
    if commands.len() > 0x0F {
        writer.write_u8(flags | FLAG_B | (commands.len() >> 8) as u8)?;
        writer.write_u8((commands.len() & 0xFF) as u8)?;
    } else {
        writer.write_u8(flags | commands.len() as u8)?;
    }
    writer.write_bytes(commands)?;

    if let Some(checkpoint) = journal_checkpoint {
        write_empty_journal(writer, checkpoint)?;
    }
    Ok(())
}

/// RFC 6295 journal header with S/Y/A/H clear and TOTCHAN = 0, followed by
/// the checkpoint sequence number.
fn write_empty_journal(writer: &mut BytesWriter, checkpoint: u16) -> Result<(), IoError> {
    writer.write_u8(0)?;
    writer.write_u16(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(
        marker: bool,
        sequence_number: u16,
        commands: &[u8],
        journal_checkpoint: Option<u16>,
    ) -> Vec<u8> {
        let mut buf = [0u8; 2048];
        let mut writer = BytesWriter::new(&mut buf);
        write_midi_packet(
            &mut writer,
            marker,
            sequence_number,
            0x00010000,
            0xF519AEB9,
            commands,
            journal_checkpoint,
        )
        .unwrap();
        writer.written().to_vec()
    }

    fn collect(packet: &MidiPacket) -> Vec<(u8, Vec<u8>)> {
        packet
            .commands()
            .map(|command| {
                let command = command.unwrap();
                (command.status, command.data.to_vec())
            })
            .collect()
    }

    #[test]
    fn test_round_trip_single_note() {
        let bytes = build(true, 42, &[0x90, 60, 100], None);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x80 | 0x61); //marker set
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert_eq!(packet.sequence_number(), 42);
        assert_eq!(packet.ssrc(), 0xF519AEB9);
        assert_eq!(collect(&packet), vec![(0x90, vec![60, 100])]);
    }

    #[test]
    fn test_running_status_within_packet() {
        // Second command reuses the NoteOn status via a bare data pair.
        let list = [0x92, 60, 100, 0x00, 62, 101];
        let bytes = build(false, 7, &list, None);
        assert_eq!(bytes[1], 0x61); //no marker
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert_eq!(
            collect(&packet),
            vec![(0x92, vec![60, 100]), (0x92, vec![62, 101])]
        );
    }

    #[test]
    fn test_running_status_resets_per_packet() {
        // A fresh packet beginning with a data byte has no status to reuse.
        let bytes = build(false, 8, &[60, 100], None);
        let packet = MidiPacket::parse(&bytes).unwrap();
        let results: Vec<_> = packet.commands().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], Err(PacketError::InvalidMidiList));
    }

    #[test]
    fn test_long_list_uses_two_byte_header() {
        let mut list = Vec::new();
        for key in 0..20u8 {
            list.extend_from_slice(&[0x90, key, 100, 0x00]);
            list.extend_from_slice(&[0x80, key, 0, 0x00]);
        }
        list.truncate(list.len() - 1); //no trailing delta
        assert!(list.len() > 0x0F);
        let bytes = build(false, 9, &list, None);
        assert_eq!(bytes[RtpHeader::SIZE] & FLAG_B, FLAG_B);
        let packet = MidiPacket::parse(&bytes).unwrap();
        let commands = collect(&packet);
        assert_eq!(commands.len(), 40);
        assert_eq!(commands[0], (0x90, vec![0, 100]));
        assert_eq!(commands[39], (0x80, vec![19, 0]));
    }

    #[test]
    fn test_empty_journal_appended_and_skipped() {
        let bytes = build(false, 10, &[0x90, 60, 100], Some(10));
        let list_header = bytes[RtpHeader::SIZE];
        assert_eq!(list_header & FLAG_J, FLAG_J);
        // Journal trailer: flags byte then checkpoint.
        assert_eq!(&bytes[bytes.len() - 3..], &[0x00, 0x00, 0x0A]);
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert_eq!(collect(&packet), vec![(0x90, vec![60, 100])]);
    }

    #[test]
    fn test_sysex_passes_through() {
        let list = [0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7];
        let bytes = build(false, 11, &list, None);
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert_eq!(
            collect(&packet),
            vec![(0xF0, vec![0x7E, 0x7F, 0x09, 0x01, 0xF7])]
        );
    }

    #[test]
    fn test_delta_times_skipped_with_z_flag() {
        let mut buf = [0u8; 64];
        let mut writer = BytesWriter::new(&mut buf);
        let header = RtpHeader::new(false, 12, 0, 0xAABBCCDD);
        writer.write_bytes(header.as_bytes()).unwrap();
        // Z set: delta time before the first command too.
        let list = [0x00, 0x90, 60, 100, 0x81, 0x10, 0x80, 60, 0];
        writer.write_u8(FLAG_Z | list.len() as u8).unwrap();
        writer.write_bytes(&list).unwrap();

        let bytes = writer.written().to_vec();
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert_eq!(
            collect(&packet),
            vec![(0x90, vec![60, 100]), (0x80, vec![60, 0])]
        );
    }

    #[test]
    fn test_list_longer_than_packet_rejected() {
        let mut bytes = build(false, 13, &[0x90, 60, 100], None);
        let last = bytes.len() - 1;
        bytes.truncate(last); //drop one payload byte
        assert!(matches!(
            MidiPacket::parse(&bytes),
            Err(PacketError::InvalidMidiList)
        ));
    }

    #[test]
    fn test_wrong_payload_type_rejected() {
        let mut bytes = build(false, 14, &[0x90, 60, 100], None);
        bytes[1] = 0x60;
        assert!(matches!(
            MidiPacket::parse(&bytes),
            Err(PacketError::InvalidHeader)
        ));
    }

    #[test]
    fn test_matches() {
        let bytes = build(true, 15, &[0x90, 60, 100], None);
        assert!(RtpHeader::matches(&bytes));
        assert!(!RtpHeader::matches(&[0xFF, 0xFF, b'I', b'N']));
        assert!(!RtpHeader::matches(&bytes[..8]));
    }

    #[test]
    fn test_parse_mtu_sized_list() {
        // A full Ethernet frame's worth of MIDI survives the borrowing parser.
        let mut list = vec![0x93u8];
        while list.len() + 4 <= 1440 {
            list.extend_from_slice(&[60, 100, 0x00]);
        }
        list.extend_from_slice(&[60, 100]);
        let bytes = build(false, 16, &list, None);
        let packet = MidiPacket::parse(&bytes).unwrap();
        assert!(collect(&packet).iter().all(|(status, _)| *status == 0x93));
    }

    #[test]
    fn test_oversized_list_rejected_on_write() {
        let list = vec![0u8; MAX_COMMAND_LIST_LEN + 1];
        let mut buf = [0u8; 8192];
        let mut writer = BytesWriter::new(&mut buf);
        assert_eq!(
            write_midi_packet(&mut writer, false, 0, 0, 0, &list, None),
            Err(PacketError::InvalidMidiList)
        );
    }
}
