//! # ADU Codec
//!
//! Wraps PDUs in the envelope of the active backend and strips it again.
//!
//! ```text
//! RTU  [unit][fc][payload ...][crc lo][crc hi]
//! TCP  [tid hi][tid lo][0][0][len hi][len lo][unit][fc][payload ...]
//! ```
//!
//! The codec also knows how many bytes remain to be read once the function
//! code and the fixed meta fields of a message are in, which is what lets
//! the receive loop read exactly one frame without relying on gaps.

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MAX_PDU_LENGTH, MAX_RTU_ADU_LENGTH, MAX_TCP_ADU_LENGTH};

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

const MBAP_HEADER_LENGTH: usize = 7;

/// Checksum of an RTU frame body; sent low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Envelope flavour. TCP-PI shares the TCP framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framing {
    Rtu,
    Tcp,
}

/// Which side of the exchange a received message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A request arriving at a slave
    Indication,
    /// A response arriving at a master
    Confirmation,
}

/// A decoded frame borrowing from the received bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adu<'a> {
    pub transaction_id: Option<u16>,
    pub unit_id: u8,
    /// Function code and payload
    pub pdu: &'a [u8],
}

impl Adu<'_> {
    pub fn function_code(&self) -> u8 {
        self.pdu.first().copied().unwrap_or(0)
    }
}

/// Frame encoder/decoder for one Context.
#[derive(Debug, Clone)]
pub struct AduCodec {
    framing: Framing,
    transaction_id: u16,
}

impl AduCodec {
    pub fn new(framing: Framing) -> Self {
        Self { framing, transaction_id: 0 }
    }

    pub fn rtu() -> Self {
        Self::new(Framing::Rtu)
    }

    pub fn tcp() -> Self {
        Self::new(Framing::Tcp)
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Bytes in front of the function code
    pub fn header_length(&self) -> usize {
        match self.framing {
            Framing::Rtu => 1,
            Framing::Tcp => MBAP_HEADER_LENGTH,
        }
    }

    pub fn checksum_length(&self) -> usize {
        match self.framing {
            Framing::Rtu => 2,
            Framing::Tcp => 0,
        }
    }

    pub fn max_adu_length(&self) -> usize {
        match self.framing {
            Framing::Rtu => MAX_RTU_ADU_LENGTH,
            Framing::Tcp => MAX_TCP_ADU_LENGTH,
        }
    }

    /// Transaction id of the last encoded request
    pub fn transaction_id(&self) -> u16 {
        self.transaction_id
    }

    /// Frame a request. TCP requests get the next transaction id.
    pub fn encode_request(&mut self, unit_id: u8, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        if self.framing == Framing::Tcp {
            self.transaction_id = self.transaction_id.wrapping_add(1);
        }
        self.frame(self.transaction_id, unit_id, pdu)
    }

    /// Frame a response, echoing the unit and transaction id of `request`.
    pub fn encode_response(&self, request: &[u8], pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        let header = request
            .get(..self.header_length())
            .ok_or_else(|| ModbusError::frame("request shorter than its header"))?;
        let (transaction_id, unit_id) = match self.framing {
            Framing::Rtu => (0, header[0]),
            Framing::Tcp => (u16::from_be_bytes([header[0], header[1]]), header[6]),
        };
        self.frame(transaction_id, unit_id, pdu)
    }

    fn frame(&self, transaction_id: u16, unit_id: u8, pdu: &[u8]) -> ModbusResult<Vec<u8>> {
        if pdu.is_empty() {
            return Err(ModbusError::invalid_argument("empty PDU"));
        }
        if pdu.len() > MAX_PDU_LENGTH {
            return Err(ModbusError::too_much_data(pdu.len(), MAX_PDU_LENGTH));
        }

        let mut frame =
            BytesMut::with_capacity(self.header_length() + pdu.len() + self.checksum_length());
        match self.framing {
            Framing::Rtu => {
                frame.put_u8(unit_id);
                frame.put_slice(pdu);
                let crc = crc16(&frame);
                frame.put_u16_le(crc);
            }
            Framing::Tcp => {
                frame.put_u16(transaction_id);
                frame.put_u16(0);
                frame.put_u16((pdu.len() + 1) as u16);
                frame.put_u8(unit_id);
                frame.put_slice(pdu);
            }
        }
        Ok(frame.to_vec())
    }

    /// Validate and strip the envelope of a complete frame.
    pub fn decode<'a>(&self, adu: &'a [u8]) -> ModbusResult<Adu<'a>> {
        match self.framing {
            Framing::Rtu => {
                if adu.len() < 4 {
                    return Err(ModbusError::frame(format!("RTU frame too short: {} bytes", adu.len())));
                }
                let body = adu.len() - 2;
                let received = u16::from_le_bytes([adu[body], adu[body + 1]]);
                let calculated = crc16(&adu[..body]);
                if received != calculated {
                    return Err(ModbusError::crc_mismatch(calculated, received));
                }
                Ok(Adu { transaction_id: None, unit_id: adu[0], pdu: &adu[1..body] })
            }
            Framing::Tcp => {
                if adu.len() < MBAP_HEADER_LENGTH + 1 {
                    return Err(ModbusError::frame(format!("TCP frame too short: {} bytes", adu.len())));
                }
                let transaction_id = u16::from_be_bytes([adu[0], adu[1]]);
                let protocol_id = u16::from_be_bytes([adu[2], adu[3]]);
                let length = u16::from_be_bytes([adu[4], adu[5]]) as usize;
                if protocol_id != 0 {
                    return Err(ModbusError::frame(format!("invalid protocol id {}", protocol_id)));
                }
                if length != adu.len() - 6 {
                    return Err(ModbusError::frame(format!(
                        "MBAP length {} does not match {} received bytes",
                        length,
                        adu.len() - 6
                    )));
                }
                Ok(Adu {
                    transaction_id: Some(transaction_id),
                    unit_id: adu[6],
                    pdu: &adu[MBAP_HEADER_LENGTH..],
                })
            }
        }
    }

    /// MBAP length field of a TCP frame whose header is in `msg`.
    ///
    /// `None` for RTU, where the length follows from the function code.
    pub fn mbap_length(&self, msg: &[u8]) -> Option<usize> {
        match self.framing {
            Framing::Rtu => None,
            Framing::Tcp => msg.get(4..6).map(|b| u16::from_be_bytes([b[0], b[1]]) as usize),
        }
    }

    /// Fixed bytes following the function code.
    pub fn meta_length_after_function(&self, function: u8, msg_type: MessageType) -> usize {
        match msg_type {
            MessageType::Indication => match function {
                0x01..=0x06 => 4,
                0x0F | 0x10 => 5,
                0x16 => 6,
                0x17 => 9,
                // 0x07, 0x11 and unknown codes
                _ => 0,
            },
            MessageType::Confirmation => match function {
                0x05 | 0x06 | 0x0F | 0x10 => 4,
                0x16 => 6,
                // byte count, exception code or status byte
                _ => 1,
            },
        }
    }

    /// Variable bytes after the meta fields, checksum included.
    ///
    /// `msg` holds everything read so far: header, function code and meta.
    pub fn data_length_after_meta(&self, msg: &[u8], msg_type: MessageType) -> usize {
        let header = self.header_length();
        let function = msg.get(header).copied().unwrap_or(0);
        let byte_at = |offset: usize| msg.get(header + offset).copied().unwrap_or(0) as usize;
        let length = match msg_type {
            MessageType::Indication => match function {
                0x0F | 0x10 => byte_at(5),
                0x17 => byte_at(9),
                _ => 0,
            },
            MessageType::Confirmation => match function {
                0x01..=0x04 | 0x11 | 0x17 => byte_at(1),
                _ => 0,
            },
        };
        length + self.checksum_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_frames() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]).to_le_bytes(), [0xC4, 0x0B]);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]).to_le_bytes(), [0xC5, 0xCD]);
        assert_eq!(crc16(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]).to_le_bytes(), [0x76, 0x87]);
    }

    #[test]
    fn test_rtu_encode_decode() {
        let mut codec = AduCodec::rtu();
        let adu = codec.encode_request(0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(adu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);

        let decoded = codec.decode(&adu).unwrap();
        assert_eq!(decoded.unit_id, 0x01);
        assert_eq!(decoded.function_code(), 0x03);
        assert_eq!(decoded.pdu, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(decoded.transaction_id, None);
    }

    #[test]
    fn test_rtu_rejects_corrupted_crc() {
        let codec = AduCodec::rtu();
        let adu = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0C];
        match codec.decode(&adu) {
            Err(ModbusError::CrcMismatch { expected, actual }) => {
                assert_eq!(expected, 0x0BC4);
                assert_eq!(actual, 0x0CC4);
            }
            other => panic!("expected CRC mismatch, got {:?}", other),
        }
        assert!(codec.decode(&[0x01, 0x03, 0xC4]).is_err());
    }

    #[test]
    fn test_tcp_transaction_ids() {
        let mut codec = AduCodec::tcp();
        let first = codec.encode_request(0xFF, &[0x03, 0x00, 0x10, 0x00, 0x01]).unwrap();
        let second = codec.encode_request(0xFF, &[0x03, 0x00, 0x10, 0x00, 0x01]).unwrap();
        assert_eq!(&first[..7], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0xFF]);
        assert_eq!(&second[..2], &[0x00, 0x02]);
        assert_eq!(codec.transaction_id(), 2);

        let response = codec.encode_response(&second, &[0x03, 0x02, 0x12, 0x34]).unwrap();
        assert_eq!(response, vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x03, 0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_tcp_transaction_id_wraps() {
        let mut codec = AduCodec::tcp();
        codec.transaction_id = u16::MAX;
        let adu = codec.encode_request(1, &[0x07]).unwrap();
        assert_eq!(&adu[..2], &[0x00, 0x00]);
    }

    #[test]
    fn test_tcp_decode_validates_header() {
        let codec = AduCodec::tcp();
        let good = [0x00, 0x07, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let adu = codec.decode(&good).unwrap();
        assert_eq!(adu.transaction_id, Some(7));
        assert_eq!(adu.unit_id, 1);
        assert_eq!(adu.pdu, &[0x83, 0x02]);

        let bad_length = [0x00, 0x07, 0x00, 0x00, 0x00, 0x04, 0x01, 0x83, 0x02];
        assert!(matches!(codec.decode(&bad_length), Err(ModbusError::Frame { .. })));

        let bad_protocol = [0x00, 0x07, 0x00, 0x01, 0x00, 0x03, 0x01, 0x83, 0x02];
        assert!(matches!(codec.decode(&bad_protocol), Err(ModbusError::Frame { .. })));
    }

    #[test]
    fn test_encode_rejects_oversized_pdu() {
        let mut codec = AduCodec::rtu();
        let pdu = vec![0x10; MAX_PDU_LENGTH + 1];
        assert!(matches!(
            codec.encode_request(1, &pdu),
            Err(ModbusError::TooMuchData { .. })
        ));
    }

    #[test]
    fn test_incremental_lengths() {
        let codec = AduCodec::rtu();
        assert_eq!(codec.meta_length_after_function(0x03, MessageType::Indication), 4);
        assert_eq!(codec.meta_length_after_function(0x10, MessageType::Indication), 5);
        assert_eq!(codec.meta_length_after_function(0x17, MessageType::Indication), 9);
        assert_eq!(codec.meta_length_after_function(0x11, MessageType::Indication), 0);
        assert_eq!(codec.meta_length_after_function(0x06, MessageType::Confirmation), 4);
        assert_eq!(codec.meta_length_after_function(0x16, MessageType::Confirmation), 6);
        assert_eq!(codec.meta_length_after_function(0x83, MessageType::Confirmation), 1);

        // write multiple registers, 2 registers, 4 data bytes
        let msg = [0x01, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04];
        assert_eq!(codec.data_length_after_meta(&msg, MessageType::Indication), 4 + 2);

        let tcp = AduCodec::tcp();
        let msg = [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04];
        assert_eq!(tcp.data_length_after_meta(&msg, MessageType::Confirmation), 4);
        let msg = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        assert_eq!(tcp.data_length_after_meta(&msg, MessageType::Confirmation), 0);
    }

    #[test]
    fn test_mbap_length_sizes_tcp_frames() {
        // encapsulated interface transport, unknown to the engine
        let msg = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0xFF, 0x2B];
        assert_eq!(AduCodec::tcp().mbap_length(&msg), Some(5));
        assert_eq!(AduCodec::tcp().mbap_length(&msg[..4]), None);
        assert_eq!(AduCodec::rtu().mbap_length(&[0x01, 0x2B]), None);
    }
}
