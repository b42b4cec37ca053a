//! ADB packet definitions
//!
//! Every ADB frame starts with a fixed 24-byte header of six little-endian
//! `u32` fields, followed by `data_length` payload bytes:
//!
//! ```text
//! [command][arg0][arg1][data_length][crc32][magic][payload ...]
//! ```
//!
//! The bridge never interprets `arg0`/`arg1`, `crc32` or `magic`; they are
//! carried through unchanged between USB and TCP.

use crate::error::{ProtocolError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::fmt;
use std::io::{Read, Write};

/// Size of an encoded packet header in bytes
pub const HEADER_SIZE: usize = 24;

/// ADB command signatures
///
/// The wire value is the ASCII name read as a little-endian `u32`
/// (`CNXN` -> `0x4e584e43`).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Auth = 0x4854_5541,
    Cnxn = 0x4e58_4e43,
    Clse = 0x4553_4c43,
    Okay = 0x5941_4b4f,
    Open = 0x4e45_504f,
    Sync = 0x434e_5953,
    Wrte = 0x4554_5257,
}

impl Command {
    /// All valid commands
    pub const ALL: [Command; 7] = [
        Command::Auth,
        Command::Cnxn,
        Command::Clse,
        Command::Okay,
        Command::Open,
        Command::Sync,
        Command::Wrte,
    ];

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x4854_5541 => Some(Self::Auth),
            0x4e58_4e43 => Some(Self::Cnxn),
            0x4553_4c43 => Some(Self::Clse),
            0x5941_4b4f => Some(Self::Okay),
            0x4e45_504f => Some(Self::Open),
            0x434e_5953 => Some(Self::Sync),
            0x4554_5257 => Some(Self::Wrte),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Four-letter protocol name
    pub fn name(self) -> &'static str {
        match self {
            Command::Auth => "AUTH",
            Command::Cnxn => "CNXN",
            Command::Clse => "CLSE",
            Command::Okay => "OKAY",
            Command::Open => "OPEN",
            Command::Sync => "SYNC",
            Command::Wrte => "WRTE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check whether a raw command word is one of the seven ADB signatures
///
/// This is the only frame synchronization the protocol offers: anything
/// else in command position is treated as link noise.
pub fn is_valid_command(command: u32) -> bool {
    Command::from_u32(command).is_some()
}

/// Fixed 24-byte packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Raw command word, see [`Command`]
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    /// Number of payload bytes following the header
    pub data_length: u32,
    /// Payload checksum as sent by the peer (passed through)
    pub crc32: u32,
    /// `!command` as sent by the peer (passed through)
    pub magic: u32,
}

impl PacketHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = HEADER_SIZE;

    /// Read header from a reader
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            command: reader.read_u32::<LittleEndian>()?,
            arg0: reader.read_u32::<LittleEndian>()?,
            arg1: reader.read_u32::<LittleEndian>()?,
            data_length: reader.read_u32::<LittleEndian>()?,
            crc32: reader.read_u32::<LittleEndian>()?,
            magic: reader.read_u32::<LittleEndian>()?,
        })
    }

    /// Write header to a writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.command)?;
        writer.write_u32::<LittleEndian>(self.arg0)?;
        writer.write_u32::<LittleEndian>(self.arg1)?;
        writer.write_u32::<LittleEndian>(self.data_length)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        writer.write_u32::<LittleEndian>(self.magic)?;
        Ok(())
    }

    /// Parse a header from exactly [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(ProtocolError::IncompleteFrame {
                stage: crate::FrameStage::Header,
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut cursor = bytes;
        Ok(Self::read_from(&mut cursor)?)
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut cursor = &mut out[..];
        // A 24-byte slice always has room for six u32 fields
        let _ = self.write_to(&mut cursor);
        out
    }

    /// Decoded command, `None` for anything outside the seven signatures
    pub fn command_type(&self) -> Option<Command> {
        Command::from_u32(self.command)
    }

    pub fn is_valid(&self) -> bool {
        is_valid_command(self.command)
    }

    pub fn payload_len(&self) -> usize {
        self.data_length as usize
    }
}

/// One ADB packet: header plus exactly `data_length` payload bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    /// Build a packet for `command`, filling in length and magic
    ///
    /// `crc32` is left at zero. Newer ADB peers ignore it, and the bridge
    /// itself only ever forwards packets it received.
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit the 32-bit length field. Use
    /// [`Packet::try_new`] for payloads of unchecked size.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        match Self::try_new(command, arg0, arg1, payload) {
            Ok(packet) => packet,
            Err(e) => panic!("{}", e),
        }
    }

    /// Like [`Packet::new`], but rejects payloads of 4 GiB or more
    pub fn try_new(
        command: Command,
        arg0: u32,
        arg1: u32,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        let header = PacketHeader {
            command: command.as_u32(),
            arg0,
            arg1,
            data_length: data_length_for(payload.len())?,
            crc32: 0,
            magic: !command.as_u32(),
        };
        Ok(Self { header, payload })
    }

    /// Assemble a packet from a received header and payload
    pub fn from_parts(header: PacketHeader, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() != header.payload_len() {
            return Err(ProtocolError::PayloadLengthMismatch {
                declared: header.payload_len(),
                actual: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn command_type(&self) -> Option<Command> {
        self.header.command_type()
    }

    pub fn into_parts(self) -> (PacketHeader, Bytes) {
        (self.header, self.payload)
    }
}

/// Payload length as stored in the header's `data_length` field
fn data_length_for(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}
