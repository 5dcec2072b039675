//! Packet codec for the Tridonic DALI-USB adapter.
//!
//! The adapter speaks fixed-size packets over its interrupt endpoints:
//! 64 bytes host-to-adapter, 16 bytes adapter-to-host. Pure translation
//! only; correlation and timing live in the dispatcher.

use crate::drivers::driver::DaliFrame;
use std::error::Error;
use std::fmt;

pub const SEND_PACKET_SIZE: usize = 64;
pub const RECV_PACKET_SIZE: usize = 16;

mod pkt {
    // byte 0 of received packets, byte 0 of sent packets
    pub const DIR_EXTERNAL: u8 = 0x11;
    pub const DIR_MASTER: u8 = 0x12;

    // byte 1 of received packets
    pub const NAK: u8 = 0x71;
    pub const RESPONSE: u8 = 0x72;
    pub const TX_COMPLETE: u8 = 0x73;
    pub const FRAME: u8 = 0x74;
    pub const FRAMING_ERROR: u8 = 0x77;

    // byte 3 of sent packets
    pub const TYPE_16BIT: u8 = 0x03;
    pub const TYPE_24BIT: u8 = 0x04;
}

/// A packet that does not follow the adapter framing. Indicates an
/// adapter or wiring fault; never retried.
#[derive(Debug)]
pub enum CodecError {
    Length(usize),
    UnknownType(u8),
    UnknownSource(u8),
}

impl Error for CodecError {}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Length(len) => write!(f, "Malformed frame: {} bytes", len),
            CodecError::UnknownType(t) => write!(f, "Malformed frame: unknown type 0x{:02x}", t),
            CodecError::UnknownSource(s) => {
                write!(f, "Malformed frame: unknown source 0x{:02x}", s)
            }
        }
    }
}

/// Who put the reported traffic on the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// Another controller.
    External,
    /// This adapter, echoing our own transmission.
    Master,
}

/// Decoded adapter-to-host packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// No backward frame within the bus response window.
    NoReply,
    /// Single-byte backward frame.
    Answer(u8),
    /// Our forward frame finished transmitting.
    TxComplete,
    /// A forward frame observed on the bus.
    Frame(DaliFrame),
    /// Garbled transmission, normally two devices answering at once.
    FramingError,
}

#[derive(Debug, Clone)]
pub struct RxPacket {
    pub source: MessageSource,
    /// Correlates with the sequence of a sent packet; 0 for traffic we
    /// did not originate.
    pub sequence: u8,
    pub event: RxEvent,
}

/// Pack a forward frame into the adapter's host-to-adapter packet.
pub fn encode_send(sequence: u8, frame: &DaliFrame) -> [u8; SEND_PACKET_SIZE] {
    let mut data = [0u8; SEND_PACKET_SIZE];
    data[0] = pkt::DIR_MASTER;
    data[1] = sequence;
    // data[2] selects the adapter's own repeat mode; left at zero, the
    // dispatcher performs repeats itself.
    match frame {
        DaliFrame::Frame16(bytes) => {
            data[3] = pkt::TYPE_16BIT;
            data[6] = bytes[0];
            data[7] = bytes[1];
        }
        DaliFrame::Frame24(bytes) => {
            data[3] = pkt::TYPE_24BIT;
            data[5] = bytes[0];
            data[6] = bytes[1];
            data[7] = bytes[2];
        }
    }
    data
}

/// Decode a host-to-adapter packet. The simulator uses this to play the
/// adapter side of the protocol.
pub fn decode_send(data: &[u8]) -> Result<(u8, DaliFrame), CodecError> {
    if data.len() != SEND_PACKET_SIZE {
        return Err(CodecError::Length(data.len()));
    }
    let frame = match data[3] {
        pkt::TYPE_16BIT => DaliFrame::Frame16([data[6], data[7]]),
        pkt::TYPE_24BIT => DaliFrame::Frame24([data[5], data[6], data[7]]),
        t => return Err(CodecError::UnknownType(t)),
    };
    Ok((data[1], frame))
}

/// Decode an adapter-to-host packet.
pub fn decode_recv(data: &[u8]) -> Result<RxPacket, CodecError> {
    if data.len() != RECV_PACKET_SIZE {
        return Err(CodecError::Length(data.len()));
    }
    let source = match data[0] {
        pkt::DIR_EXTERNAL => MessageSource::External,
        pkt::DIR_MASTER => MessageSource::Master,
        s => return Err(CodecError::UnknownSource(s)),
    };
    let event = match data[1] {
        pkt::NAK => RxEvent::NoReply,
        pkt::RESPONSE => RxEvent::Answer(data[5]),
        pkt::TX_COMPLETE => RxEvent::TxComplete,
        pkt::FRAMING_ERROR => RxEvent::FramingError,
        pkt::FRAME => {
            if data[3] != 0 {
                RxEvent::Frame(DaliFrame::Frame24([data[3], data[4], data[5]]))
            } else {
                RxEvent::Frame(DaliFrame::Frame16([data[4], data[5]]))
            }
        }
        t => return Err(CodecError::UnknownType(t)),
    };
    Ok(RxPacket {
        source,
        sequence: data[8],
        event,
    })
}

/// Pack an adapter-to-host packet. The inverse of [`decode_recv`], used
/// by the simulator.
pub fn encode_recv(source: MessageSource, sequence: u8, event: &RxEvent) -> [u8; RECV_PACKET_SIZE] {
    let mut data = [0u8; RECV_PACKET_SIZE];
    data[0] = match source {
        MessageSource::External => pkt::DIR_EXTERNAL,
        MessageSource::Master => pkt::DIR_MASTER,
    };
    data[8] = sequence;
    match event {
        RxEvent::NoReply => data[1] = pkt::NAK,
        RxEvent::Answer(v) => {
            data[1] = pkt::RESPONSE;
            data[5] = *v;
        }
        RxEvent::TxComplete => data[1] = pkt::TX_COMPLETE,
        RxEvent::FramingError => data[1] = pkt::FRAMING_ERROR,
        RxEvent::Frame(frame) => {
            data[1] = pkt::FRAME;
            match frame {
                DaliFrame::Frame16(bytes) => {
                    data[4] = bytes[0];
                    data[5] = bytes[1];
                }
                DaliFrame::Frame24(bytes) => {
                    data[3] = bytes[0];
                    data[4] = bytes[1];
                    data[5] = bytes[2];
                }
            }
        }
    }
    data
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_16bit_send() {
        let data = encode_send(7, &DaliFrame::Frame16([0xff, 0x90]));
        assert_eq!(data.len(), SEND_PACKET_SIZE);
        assert_eq!(&data[..8], &[0x12, 7, 0x00, 0x03, 0x00, 0x00, 0xff, 0x90]);
        assert!(data[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn encode_24bit_send() {
        let data = encode_send(1, &DaliFrame::Frame24([0xff, 0xfe, 0x1d]));
        assert_eq!(&data[..8], &[0x12, 1, 0x00, 0x04, 0x00, 0xff, 0xfe, 0x1d]);
    }

    #[test]
    fn send_round_trip() {
        for frame in [
            DaliFrame::Frame16([0xa9, 0x00]),
            DaliFrame::Frame24([0x01, 0x02, 0x03]),
        ] {
            let (seq, decoded) = decode_send(&encode_send(42, &frame)).unwrap();
            assert_eq!(seq, 42);
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn decode_answer() {
        let mut data = [0u8; RECV_PACKET_SIZE];
        data[0] = 0x12;
        data[1] = 0x72;
        data[5] = 0xff;
        data[8] = 9;
        let pkt = decode_recv(&data).unwrap();
        assert_eq!(pkt.source, MessageSource::Master);
        assert_eq!(pkt.sequence, 9);
        assert_eq!(pkt.event, RxEvent::Answer(0xff));
    }

    #[test]
    fn decode_external_frame() {
        let data = encode_recv(
            MessageSource::External,
            0,
            &RxEvent::Frame(DaliFrame::Frame16([0x05, 0x00])),
        );
        let pkt = decode_recv(&data).unwrap();
        assert_eq!(pkt.source, MessageSource::External);
        assert_eq!(pkt.sequence, 0);
        assert_eq!(pkt.event, RxEvent::Frame(DaliFrame::Frame16([0x05, 0x00])));
    }

    #[test]
    fn recv_round_trip() {
        let events = [
            RxEvent::NoReply,
            RxEvent::Answer(0x42),
            RxEvent::TxComplete,
            RxEvent::FramingError,
            RxEvent::Frame(DaliFrame::Frame24([0xff, 0xfe, 0x1e])),
        ];
        for event in &events {
            let pkt = decode_recv(&encode_recv(MessageSource::Master, 3, event)).unwrap();
            assert_eq!(&pkt.event, event);
        }
    }

    #[test]
    fn malformed_packets() {
        assert!(matches!(decode_recv(&[0u8; 5]), Err(CodecError::Length(5))));
        let mut data = [0u8; RECV_PACKET_SIZE];
        data[0] = 0x12;
        data[1] = 0x55;
        assert!(matches!(
            decode_recv(&data),
            Err(CodecError::UnknownType(0x55))
        ));
        data[0] = 0x99;
        assert!(matches!(
            decode_recv(&data),
            Err(CodecError::UnknownSource(0x99))
        ));
    }
}
