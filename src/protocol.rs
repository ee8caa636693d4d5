/// Modbus protocol definitions and data structures
///
/// Function codes, exception codes, protocol ceilings and the typed
/// request PDU shared by the master operations and the slave reply engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier
pub type SlaveId = u8;

/// Maximum number of coils or discrete inputs in one read
pub const MAX_READ_BITS: usize = 2000;
/// Maximum number of coils in one write
pub const MAX_WRITE_BITS: usize = 1968;
/// Maximum number of registers in one read
pub const MAX_READ_REGISTERS: usize = 125;
/// Maximum number of registers in one write
pub const MAX_WRITE_REGISTERS: usize = 123;
/// Maximum registers written by write/read registers (0x17)
pub const MAX_WR_WRITE_REGISTERS: usize = 121;
/// Maximum registers read by write/read registers (0x17)
pub const MAX_WR_READ_REGISTERS: usize = 125;

pub const MAX_PDU_LENGTH: usize = 253;
pub const MAX_RTU_ADU_LENGTH: usize = 256;
pub const MAX_TCP_ADU_LENGTH: usize = 260;
pub const MAX_ADU_LENGTH: usize = MAX_TCP_ADU_LENGTH;

pub const DEFAULT_TCP_PORT: u16 = 502;
/// Unit id meaning "no unit addressing" on TCP
pub const TCP_SLAVE: SlaveId = 0xFF;
pub const BROADCAST_ADDRESS: SlaveId = 0;
/// Highest unit id a strict RTU bus allows
pub const MAX_SLAVE_ID: SlaveId = 247;

pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    ReadExceptionStatus = 0x07,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReportSlaveId = 0x11,
    MaskWriteRegister = 0x16,
    WriteAndReadRegisters = 0x17,
}

impl FunctionCode {
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x07 => Ok(FunctionCode::ReadExceptionStatus),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            0x11 => Ok(FunctionCode::ReportSlaveId),
            0x16 => Ok(FunctionCode::MaskWriteRegister),
            0x17 => Ok(FunctionCode::WriteAndReadRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Function code of an exception reply to this function
    pub fn exception_code(self) -> u8 {
        self as u8 | 0x80
    }

    /// Functions that only write, and so may be sent to the broadcast address
    pub fn is_write_function(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteSingleCoil
                | FunctionCode::WriteSingleRegister
                | FunctionCode::WriteMultipleCoils
                | FunctionCode::WriteMultipleRegisters
                | FunctionCode::MaskWriteRegister
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::ReadExceptionStatus => "Read Exception Status",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
            FunctionCode::ReportSlaveId => "Report Slave ID",
            FunctionCode::MaskWriteRegister => "Mask Write Register",
            FunctionCode::WriteAndReadRegisters => "Write/Read Registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), *self as u8)
    }
}

/// The eleven standard exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    SlaveDeviceFailure = 0x04,
    Acknowledge = 0x05,
    SlaveDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParity = 0x08,
    NotDefined = 0x09,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::SlaveDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::SlaveDeviceBusy),
            0x07 => Some(ExceptionCode::NegativeAcknowledge),
            0x08 => Some(ExceptionCode::MemoryParity),
            0x09 => Some(ExceptionCode::NotDefined),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetFailed),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn description(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal function",
            ExceptionCode::IllegalDataAddress => "Illegal data address",
            ExceptionCode::IllegalDataValue => "Illegal data value",
            ExceptionCode::SlaveDeviceFailure => "Slave device or server failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveDeviceBusy => "Slave device or server is busy",
            ExceptionCode::NegativeAcknowledge => "Negative acknowledge",
            ExceptionCode::MemoryParity => "Memory parity error",
            ExceptionCode::NotDefined => "Not defined",
            ExceptionCode::GatewayPathUnavailable => "Gateway path unavailable",
            ExceptionCode::GatewayTargetFailed => "Target device failed to respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Decoded answer to a report slave id (0x11) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSlaveId {
    pub slave_id: u8,
    pub run_indicator: bool,
    /// Vendor-specific trailer
    pub additional_data: Vec<u8>,
}

impl ReportSlaveId {
    /// Parse the data bytes that follow the byte count.
    pub fn parse(data: &[u8]) -> ModbusResult<Self> {
        if data.len() < 2 {
            return Err(ModbusError::invalid_data(format!(
                "report slave id needs 2 bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            slave_id: data[0],
            run_indicator: data[1] == 0xFF,
            additional_data: data[2..].to_vec(),
        })
    }

    /// Data bytes as sent after the byte count.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(2 + self.additional_data.len());
        bytes.push(self.slave_id);
        bytes.push(if self.run_indicator { 0xFF } else { 0x00 });
        bytes.extend_from_slice(&self.additional_data);
        bytes
    }
}

/// A request PDU, one variant per supported function code.
///
/// Multi-value writes keep their payload as received so the reply engine
/// can check the declared byte count before decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    ReadExceptionStatus,
    WriteMultipleCoils { address: u16, quantity: u16, byte_count: u8, data: Vec<u8> },
    WriteMultipleRegisters { address: u16, quantity: u16, byte_count: u8, data: Vec<u8> },
    ReportSlaveId,
    MaskWriteRegister { address: u16, and_mask: u16, or_mask: u16 },
    WriteAndReadRegisters {
        read_address: u16,
        read_quantity: u16,
        write_address: u16,
        write_quantity: u16,
        byte_count: u8,
        data: Vec<u8>,
    },
}

impl Request {
    pub fn write_multiple_coils(address: u16, values: &[bool]) -> Self {
        let data = data_utils::pack_bits(values);
        Request::WriteMultipleCoils {
            address,
            quantity: values.len() as u16,
            byte_count: data.len() as u8,
            data,
        }
    }

    pub fn write_multiple_registers(address: u16, values: &[u16]) -> Self {
        let data = data_utils::registers_to_bytes(values);
        Request::WriteMultipleRegisters {
            address,
            quantity: values.len() as u16,
            byte_count: data.len() as u8,
            data,
        }
    }

    pub fn write_and_read_registers(
        write_address: u16,
        values: &[u16],
        read_address: u16,
        read_quantity: u16,
    ) -> Self {
        let data = data_utils::registers_to_bytes(values);
        Request::WriteAndReadRegisters {
            read_address,
            read_quantity,
            write_address,
            write_quantity: values.len() as u16,
            byte_count: data.len() as u8,
            data,
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::ReadExceptionStatus => FunctionCode::ReadExceptionStatus,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Request::ReportSlaveId => FunctionCode::ReportSlaveId,
            Request::MaskWriteRegister { .. } => FunctionCode::MaskWriteRegister,
            Request::WriteAndReadRegisters { .. } => FunctionCode::WriteAndReadRegisters,
        }
    }

    /// Serialize to a PDU: function code followed by its payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut pdu = vec![self.function_code().to_u8()];
        match self {
            Request::ReadCoils { address, quantity }
            | Request::ReadDiscreteInputs { address, quantity }
            | Request::ReadHoldingRegisters { address, quantity }
            | Request::ReadInputRegisters { address, quantity } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
            }
            Request::WriteSingleCoil { address, value }
            | Request::WriteSingleRegister { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Request::ReadExceptionStatus | Request::ReportSlaveId => {}
            Request::WriteMultipleCoils { address, quantity, byte_count, data }
            | Request::WriteMultipleRegisters { address, quantity, byte_count, data } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu.push(*byte_count);
                pdu.extend_from_slice(data);
            }
            Request::MaskWriteRegister { address, and_mask, or_mask } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&and_mask.to_be_bytes());
                pdu.extend_from_slice(&or_mask.to_be_bytes());
            }
            Request::WriteAndReadRegisters {
                read_address,
                read_quantity,
                write_address,
                write_quantity,
                byte_count,
                data,
            } => {
                pdu.extend_from_slice(&read_address.to_be_bytes());
                pdu.extend_from_slice(&read_quantity.to_be_bytes());
                pdu.extend_from_slice(&write_address.to_be_bytes());
                pdu.extend_from_slice(&write_quantity.to_be_bytes());
                pdu.push(*byte_count);
                pdu.extend_from_slice(data);
            }
        }
        pdu
    }

    /// Parse a request PDU.
    ///
    /// Unknown function codes fail with `IllegalFunction`, truncated
    /// payloads with `IllegalDataValue`.
    pub fn parse(pdu: &[u8]) -> Result<Self, ExceptionCode> {
        let function = *pdu.first().ok_or(ExceptionCode::IllegalFunction)?;
        let function =
            FunctionCode::from_u8(function).map_err(|_| ExceptionCode::IllegalFunction)?;

        let word = |offset: usize| -> Result<u16, ExceptionCode> {
            pdu.get(offset..offset + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(ExceptionCode::IllegalDataValue)
        };
        let trailing = |offset: usize| -> Result<(u8, Vec<u8>), ExceptionCode> {
            let byte_count = *pdu.get(offset).ok_or(ExceptionCode::IllegalDataValue)?;
            let data = pdu
                .get(offset + 1..offset + 1 + byte_count as usize)
                .ok_or(ExceptionCode::IllegalDataValue)?;
            Ok((byte_count, data.to_vec()))
        };

        let request = match function {
            FunctionCode::ReadCoils => Request::ReadCoils { address: word(1)?, quantity: word(3)? },
            FunctionCode::ReadDiscreteInputs => {
                Request::ReadDiscreteInputs { address: word(1)?, quantity: word(3)? }
            }
            FunctionCode::ReadHoldingRegisters => {
                Request::ReadHoldingRegisters { address: word(1)?, quantity: word(3)? }
            }
            FunctionCode::ReadInputRegisters => {
                Request::ReadInputRegisters { address: word(1)?, quantity: word(3)? }
            }
            FunctionCode::WriteSingleCoil => {
                Request::WriteSingleCoil { address: word(1)?, value: word(3)? }
            }
            FunctionCode::WriteSingleRegister => {
                Request::WriteSingleRegister { address: word(1)?, value: word(3)? }
            }
            FunctionCode::ReadExceptionStatus => Request::ReadExceptionStatus,
            FunctionCode::WriteMultipleCoils => {
                let (byte_count, data) = trailing(5)?;
                Request::WriteMultipleCoils { address: word(1)?, quantity: word(3)?, byte_count, data }
            }
            FunctionCode::WriteMultipleRegisters => {
                let (byte_count, data) = trailing(5)?;
                Request::WriteMultipleRegisters {
                    address: word(1)?,
                    quantity: word(3)?,
                    byte_count,
                    data,
                }
            }
            FunctionCode::ReportSlaveId => Request::ReportSlaveId,
            FunctionCode::MaskWriteRegister => Request::MaskWriteRegister {
                address: word(1)?,
                and_mask: word(3)?,
                or_mask: word(5)?,
            },
            FunctionCode::WriteAndReadRegisters => {
                let (byte_count, data) = trailing(9)?;
                Request::WriteAndReadRegisters {
                    read_address: word(1)?,
                    read_quantity: word(3)?,
                    write_address: word(5)?,
                    write_quantity: word(7)?,
                    byte_count,
                    data,
                }
            }
        };
        Ok(request)
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Byte order of a 32-bit float spread over two registers.
    ///
    /// Letters name the IEEE 754 bytes from most to least significant, in
    /// the order they appear on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum FloatOrder {
        Abcd,
        Dcba,
        Badc,
        Cdab,
    }

    impl FloatOrder {
        // Each permutation is its own inverse.
        fn permutation(self) -> [usize; 4] {
            match self {
                FloatOrder::Abcd => [0, 1, 2, 3],
                FloatOrder::Dcba => [3, 2, 1, 0],
                FloatOrder::Badc => [1, 0, 3, 2],
                FloatOrder::Cdab => [2, 3, 0, 1],
            }
        }
    }

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian)
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack booleans LSB first, as coils travel on the wire
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack `bit_count` booleans; missing bytes read as false
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| bytes.get(i / 8).map_or(false, |b| b & (1 << (i % 8)) != 0))
            .collect()
    }

    /// Spread the 8 bits of `value` over `dest[index..index + 8]`, LSB first.
    pub fn set_bits_from_byte(dest: &mut [bool], index: usize, value: u8) {
        for (i, slot) in dest.iter_mut().skip(index).take(8).enumerate() {
            *slot = value & (1 << i) != 0;
        }
    }

    /// Spread `nb_bits` bits taken from `bytes` over `dest[index..]`.
    pub fn set_bits_from_bytes(dest: &mut [bool], index: usize, nb_bits: usize, bytes: &[u8]) {
        for (i, bit) in unpack_bits(bytes, nb_bits).into_iter().enumerate() {
            if let Some(slot) = dest.get_mut(index + i) {
                *slot = bit;
            }
        }
    }

    /// Fold up to 8 bits starting at `index` into a byte, first bit most significant.
    pub fn get_byte_from_bits(src: &[bool], index: usize, nb_bits: usize) -> u8 {
        src.iter()
            .skip(index)
            .take(nb_bits.min(8))
            .fold(0u8, |acc, &bit| (acc << 1) | bit as u8)
    }

    pub fn f32_to_registers(value: f32, order: FloatOrder) -> [u16; 2] {
        let abcd = value.to_be_bytes();
        let p = order.permutation();
        [
            u16::from_be_bytes([abcd[p[0]], abcd[p[1]]]),
            u16::from_be_bytes([abcd[p[2]], abcd[p[3]]]),
        ]
    }

    pub fn registers_to_f32(registers: [u16; 2], order: FloatOrder) -> f32 {
        let [w0, w1] = registers;
        let wire = [(w0 >> 8) as u8, w0 as u8, (w1 >> 8) as u8, w1 as u8];
        let p = order.permutation();
        let mut abcd = [0u8; 4];
        for (i, &byte) in wire.iter().enumerate() {
            abcd[p[i]] = byte;
        }
        f32::from_be_bytes(abcd)
    }

    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    pub fn registers_to_u32(registers: [u16; 2]) -> u32 {
        ((registers[0] as u32) << 16) | registers[1] as u32
    }
}
