//! ADB wire protocol
//!
//! This crate defines the ADB packet format shared by the USB and TCP sides
//! of the bridge, plus the framing rules for each transport.
//!
//! # Example
//!
//! ```
//! use protocol::{Command, Packet, decode_tcp, encode_tcp};
//!
//! let packet = Packet::new(Command::Open, 1, 0, &b"shell:\0"[..]);
//! let frame = encode_tcp(&packet);
//!
//! let decoded = decode_tcp(&frame).unwrap();
//! assert_eq!(decoded.command_type(), Some(Command::Open));
//! assert_eq!(decoded.payload().as_ref(), b"shell:\0");
//! ```
//!
//! # USB transfers
//!
//! ```
//! use protocol::{Command, Packet, USB_MAX_PACKET_SIZE, usb_transfers};
//!
//! // 512-byte payload needs a trailing zero-length transfer
//! let packet = Packet::new(Command::Wrte, 1, 2, vec![0u8; 512]);
//! let transfers = usb_transfers(&packet, USB_MAX_PACKET_SIZE);
//! assert_eq!(transfers.len(), 3);
//! assert!(transfers[2].is_empty());
//! ```

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{
    MAX_PAYLOAD_SIZE, USB_MAX_PACKET_SIZE, USB_READ_BUFFER_SIZE, UsbHeaderRead,
    classify_usb_header, decode_tcp, encode_tcp, needs_zero_length_packet, read_tcp_packet,
    usb_transfers, write_tcp_packet,
};

#[cfg(feature = "async")]
pub use codec::{read_tcp_packet_async, write_tcp_packet_async};
pub use error::{FrameStage, ProtocolError, Result};
pub use packet::{Command, HEADER_SIZE, Packet, PacketHeader, is_valid_command};
