//! Packet encoding and decoding for the two ADB transports
//!
//! # TCP variant
//!
//! A frame is the 24-byte header immediately followed by the payload, with
//! no padding and no length prefix beyond the header's `data_length`:
//! ```text
//! [Header: 24 bytes][Payload: data_length bytes]
//! ```
//!
//! # USB variant
//!
//! Header and payload travel as separate bulk transfers. When the payload
//! length is an exact multiple of the endpoint's max packet size a
//! zero-length transfer follows, otherwise the device's USB stack keeps
//! waiting for more data:
//! ```text
//! transfer 1: [Header: 24 bytes]
//! transfer 2: [Payload]            (only if data_length > 0)
//! transfer 3: []                   (only if data_length % max_packet_size == 0)
//! ```
//! Inbound, a header must arrive as its own 24-byte transfer. Transfers of
//! any other length, and headers without a valid command signature, are
//! noise and get skipped by the reader.

use crate::error::{FrameStage, ProtocolError, Result};
use crate::packet::{HEADER_SIZE, Packet, PacketHeader};
use bytes::Bytes;
use std::io::{ErrorKind, Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Max packet size of a high-speed bulk endpoint
pub const USB_MAX_PACKET_SIZE: usize = 512;

/// Buffer size for one inbound header transfer
pub const USB_READ_BUFFER_SIZE: usize = 512;

/// Largest payload accepted from a TCP peer (16 MiB)
///
/// ADB itself negotiates at most 1 MiB; this only keeps a corrupt length
/// field from turning into a huge allocation.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Encode a packet as one TCP frame
pub fn encode_tcp(packet: &Packet) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + packet.payload().len());
    frame.extend_from_slice(&packet.header().to_bytes());
    frame.extend_from_slice(packet.payload());
    frame
}

/// Decode the first TCP frame in `frame`
pub fn decode_tcp(frame: &[u8]) -> Result<Packet> {
    let mut cursor = frame;
    read_tcp_packet(&mut cursor)
}

/// Write a packet to a blocking writer as one TCP frame
pub fn write_tcp_packet<W: Write>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.header().to_bytes())?;
    writer.write_all(packet.payload())?;
    Ok(())
}

/// Read one TCP frame from a blocking reader
///
/// Fails with [`ProtocolError::IncompleteFrame`] if the stream ends inside
/// the header or before `data_length` payload bytes arrived.
pub fn read_tcp_packet<R: Read>(reader: &mut R) -> Result<Packet> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    let read = read_full(reader, &mut header_bytes)?;
    if read < HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            stage: FrameStage::Header,
            expected: HEADER_SIZE,
            actual: read,
        });
    }
    let header = PacketHeader::from_bytes(&header_bytes)?;
    check_payload_size(&header)?;

    let mut payload = vec![0u8; header.payload_len()];
    let read = read_full(reader, &mut payload)?;
    if read < payload.len() {
        return Err(ProtocolError::IncompleteFrame {
            stage: FrameStage::Payload,
            expected: payload.len(),
            actual: read,
        });
    }
    Packet::from_parts(header, payload)
}

/// Async: write a packet as one TCP frame
#[cfg(feature = "async")]
pub async fn write_tcp_packet_async<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.header().to_bytes()).await?;
    if !packet.payload().is_empty() {
        writer.write_all(packet.payload()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Async: read one TCP frame
///
/// Same contract as [`read_tcp_packet`]. Not cancel safe: dropping the
/// future mid-frame loses the bytes read so far.
#[cfg(feature = "async")]
pub async fn read_tcp_packet_async<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; HEADER_SIZE];
    let read = read_full_async(reader, &mut header_bytes).await?;
    if read < HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            stage: FrameStage::Header,
            expected: HEADER_SIZE,
            actual: read,
        });
    }
    let header = PacketHeader::from_bytes(&header_bytes)?;
    check_payload_size(&header)?;

    let mut payload = vec![0u8; header.payload_len()];
    let read = read_full_async(reader, &mut payload).await?;
    if read < payload.len() {
        return Err(ProtocolError::IncompleteFrame {
            stage: FrameStage::Payload,
            expected: payload.len(),
            actual: read,
        });
    }
    Packet::from_parts(header, payload)
}

/// Whether a payload of `data_length` bytes must be followed by a
/// zero-length transfer
pub fn needs_zero_length_packet(data_length: usize, max_packet_size: usize) -> bool {
    data_length > 0 && max_packet_size > 0 && data_length % max_packet_size == 0
}

/// Split a packet into the bulk-out transfers that carry it, in order
pub fn usb_transfers(packet: &Packet, max_packet_size: usize) -> Vec<Bytes> {
    let payload = packet.payload();
    let mut transfers = Vec::with_capacity(3);
    transfers.push(Bytes::copy_from_slice(&packet.header().to_bytes()));
    if !payload.is_empty() {
        transfers.push(payload.clone());
        if needs_zero_length_packet(payload.len(), max_packet_size) {
            transfers.push(Bytes::new());
        }
    }
    transfers
}

/// What a single inbound bulk transfer turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbHeaderRead {
    /// A header with a valid command signature
    Header(PacketHeader),
    /// Transfer was not 24 bytes long
    Noise { len: usize },
    /// 24 bytes, but the command word is not one of the seven signatures
    UnknownCommand(PacketHeader),
}

/// Classify one inbound bulk transfer expected to hold a header
pub fn classify_usb_header(transfer: &[u8]) -> UsbHeaderRead {
    if transfer.len() != HEADER_SIZE {
        return UsbHeaderRead::Noise {
            len: transfer.len(),
        };
    }
    match PacketHeader::from_bytes(transfer) {
        Ok(header) if header.is_valid() => UsbHeaderRead::Header(header),
        Ok(header) => UsbHeaderRead::UnknownCommand(header),
        Err(_) => UsbHeaderRead::Noise {
            len: transfer.len(),
        },
    }
}

fn check_payload_size(header: &PacketHeader) -> Result<()> {
    if header.payload_len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: header.payload_len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Read until `buf` is full or the stream ends, returning the byte count
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(feature = "async")]
async fn read_full_async<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Command;
    use std::io::Cursor;

    fn cnxn_bytes() -> [u8; HEADER_SIZE] {
        [
            0x43, 0x4e, 0x58, 0x4e, // CNXN
            0, 0, 0, 0, // arg0
            0, 0, 0, 0, // arg1
            0, 0, 0, 0, // data_length
            0, 0, 0, 0, // crc32
            0xbc, 0xb1, 0xa7, 0xb1, // magic
        ]
    }

    #[test]
    fn test_cnxn_header_decodes_and_reencodes() {
        let bytes = cnxn_bytes();
        let packet = decode_tcp(&bytes).unwrap();

        assert_eq!(packet.command_type(), Some(Command::Cnxn));
        assert!(packet.payload().is_empty());
        assert_eq!(encode_tcp(&packet), bytes.to_vec());
    }

    #[test]
    fn test_tcp_roundtrip_with_payload() {
        let packet = Packet::new(Command::Wrte, 3, 9, vec![0xAB; 1000]);
        let frame = encode_tcp(&packet);
        assert_eq!(frame.len(), HEADER_SIZE + 1000);

        let decoded = decode_tcp(&frame).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_truncated_payload_is_incomplete() {
        let packet = Packet::new(Command::Wrte, 1, 1, vec![7u8; 10]);
        let mut frame = encode_tcp(&packet);
        frame.truncate(HEADER_SIZE + 4);

        let result = decode_tcp(&frame);
        let Err(ProtocolError::IncompleteFrame {
            stage,
            expected,
            actual,
        }) = result
        else {
            panic!("Expected IncompleteFrame error, got {:?}", result);
        };
        assert_eq!(stage, FrameStage::Payload);
        assert_eq!(expected, 10);
        assert_eq!(actual, 4);
    }

    #[test]
    fn test_truncated_header_is_incomplete() {
        let result = decode_tcp(&cnxn_bytes()[..10]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteFrame {
                stage: FrameStage::Header,
                expected: HEADER_SIZE,
                actual: 10
            })
        ));
    }

    #[test]
    fn test_empty_stream_is_clean_eof() {
        let err = decode_tcp(&[]).unwrap_err();
        assert!(err.is_clean_eof());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let header = PacketHeader {
            command: Command::Wrte.as_u32(),
            arg0: 0,
            arg1: 0,
            data_length: u32::MAX,
            crc32: 0,
            magic: !Command::Wrte.as_u32(),
        };
        let result = decode_tcp(&header.to_bytes());
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_read_consecutive_frames() {
        let first = Packet::new(Command::Open, 1, 0, &b"shell:ls\0"[..]);
        let second = Packet::new(Command::Okay, 2, 1, Bytes::new());
        let mut stream = Vec::new();
        write_tcp_packet(&mut stream, &first).unwrap();
        write_tcp_packet(&mut stream, &second).unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_tcp_packet(&mut cursor).unwrap(), first);
        assert_eq!(read_tcp_packet(&mut cursor).unwrap(), second);
        assert!(read_tcp_packet(&mut cursor).unwrap_err().is_clean_eof());
    }

    #[test]
    fn test_usb_transfers_without_payload() {
        let packet = Packet::new(Command::Okay, 1, 2, Bytes::new());
        let transfers = usb_transfers(&packet, USB_MAX_PACKET_SIZE);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].len(), HEADER_SIZE);
    }

    #[test]
    fn test_usb_transfers_zero_length_packet_rule() {
        for (len, expect_zlp) in [(1, false), (511, false), (512, true), (513, false), (1024, true)] {
            let packet = Packet::new(Command::Wrte, 0, 0, vec![0u8; len]);
            let transfers = usb_transfers(&packet, USB_MAX_PACKET_SIZE);
            let zlps = transfers.iter().skip(2).filter(|t| t.is_empty()).count();
            assert_eq!(zlps, usize::from(expect_zlp), "payload length {}", len);
            assert_eq!(transfers.len(), if expect_zlp { 3 } else { 2 });
            assert_eq!(transfers[1].len(), len);
        }
    }

    #[test]
    fn test_classify_usb_header() {
        assert_eq!(
            classify_usb_header(&cnxn_bytes()),
            UsbHeaderRead::Header(PacketHeader::from_bytes(&cnxn_bytes()).unwrap())
        );
        assert_eq!(
            classify_usb_header(&[0u8; 512]),
            UsbHeaderRead::Noise { len: 512 }
        );
        assert_eq!(classify_usb_header(&[]), UsbHeaderRead::Noise { len: 0 });

        let mut garbage = cnxn_bytes();
        garbage[0] = 0x00;
        assert!(matches!(
            classify_usb_header(&garbage),
            UsbHeaderRead::UnknownCommand(_)
        ));
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn test_async_roundtrip() {
        let packet = Packet::new(Command::Wrte, 5, 6, vec![1u8, 2, 3]);
        let mut buffer = Vec::new();
        write_tcp_packet_async(&mut buffer, &packet).await.unwrap();

        let mut reader = &buffer[..];
        let decoded = read_tcp_packet_async(&mut reader).await.unwrap();
        assert_eq!(decoded, packet);
    }
}
