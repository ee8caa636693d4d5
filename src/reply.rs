//! Slave-side request handling.
//!
//! [`ReplyEngine`] turns one decoded request into a [`Reply`] against a
//! [`ModbusMapping`]. It performs no I/O: the caller frames and sends the
//! PDU, or stays silent.
//!
//! Validation order per request: unit id filter, function code, quantity
//! ceilings and payload consistency (`IllegalDataValue`), then address
//! ranges (`IllegalDataAddress`). Writes reach the mapping only when every
//! check passed.

use std::fmt;

use tracing::debug;

use crate::codec::{Adu, Framing};
use crate::context::Quirks;
use crate::mapping::{ModbusMapping, Table};
use crate::protocol::data_utils::{pack_bits, registers_to_bytes, unpack_bits};
use crate::protocol::{
    ExceptionCode, FunctionCode, ReportSlaveId, Request, BROADCAST_ADDRESS, COIL_OFF, COIL_ON, MAX_PDU_LENGTH,
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS, MAX_WR_READ_REGISTERS,
    MAX_WR_WRITE_REGISTERS,
};

/// Where the engine stands in handling the latest request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    AwaitingRequest,
    Validating,
    Dispatching,
    Replying,
    ReplyingException,
    Silent,
}

/// Why no response is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilentReason {
    /// RTU broadcast without `REPLY_TO_BROADCAST`
    Broadcast,
    /// Addressed to another unit
    OtherUnit(u8),
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Normal response PDU
    Normal(Vec<u8>),
    Exception { function: u8, code: ExceptionCode },
    Silent(SilentReason),
}

impl Reply {
    /// Response PDU to send, if any.
    pub fn pdu(&self) -> Option<Vec<u8>> {
        match self {
            Reply::Normal(pdu) => Some(pdu.clone()),
            Reply::Exception { function, code } => Some(vec![function | 0x80, code.to_u8()]),
            Reply::Silent(_) => None,
        }
    }

    pub fn state(&self) -> ReplyState {
        match self {
            Reply::Normal(_) => ReplyState::Replying,
            Reply::Exception { .. } => ReplyState::ReplyingException,
            Reply::Silent(_) => ReplyState::Silent,
        }
    }

    pub fn is_exception(&self) -> bool {
        matches!(self, Reply::Exception { .. })
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Normal(pdu) => write!(f, "response to 0x{:02X}", pdu.first().copied().unwrap_or(0)),
            Reply::Exception { function, code } => write!(f, "exception {} to 0x{:02X}", code, function),
            Reply::Silent(SilentReason::Broadcast) => f.write_str("silent (broadcast)"),
            Reply::Silent(SilentReason::OtherUnit(unit)) => write!(f, "silent (unit {})", unit),
        }
    }
}

type Outcome = Result<Vec<u8>, ExceptionCode>;

/// Validates requests and applies them to a mapping.
#[derive(Debug, Clone)]
pub struct ReplyEngine {
    framing: Framing,
    slave: Option<u8>,
    quirks: Quirks,
    report_trailer: Vec<u8>,
    state: ReplyState,
}

impl ReplyEngine {
    pub fn new(framing: Framing, slave: Option<u8>, quirks: Quirks) -> Self {
        Self {
            framing,
            slave,
            quirks,
            report_trailer: Vec::new(),
            state: ReplyState::AwaitingRequest,
        }
    }

    /// Vendor bytes appended to report slave id answers.
    pub fn with_report_trailer(mut self, trailer: Vec<u8>) -> Self {
        self.report_trailer = trailer;
        self
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    /// Handle one request. Writes are applied even when the reply is silent.
    pub fn process(&mut self, adu: &Adu<'_>, mapping: &mut ModbusMapping) -> Reply {
        self.state = ReplyState::Validating;
        let unit = adu.unit_id;

        if self.framing == Framing::Rtu && unit != BROADCAST_ADDRESS {
            let addressed = self.slave == Some(unit) && unit <= self.quirks.max_slave();
            if !addressed {
                debug!("request for unit {} ignored", unit);
                self.state = ReplyState::Silent;
                return Reply::Silent(SilentReason::OtherUnit(unit));
            }
        }

        self.state = ReplyState::Dispatching;
        let function = adu.function_code();
        let outcome = match Request::parse(adu.pdu) {
            Ok(request) => self.dispatch(&request, mapping),
            Err(code) => Err(code),
        };

        let broadcast = self.framing == Framing::Rtu && unit == BROADCAST_ADDRESS;
        let reply = if broadcast && !self.quirks.contains(Quirks::REPLY_TO_BROADCAST) {
            Reply::Silent(SilentReason::Broadcast)
        } else {
            match outcome {
                Ok(pdu) => Reply::Normal(pdu),
                Err(code) => Reply::Exception { function, code },
            }
        };
        if let Reply::Exception { function, code } = &reply {
            debug!("function 0x{:02X} rejected: {}", function, code);
        }
        self.state = reply.state();
        reply
    }

    fn dispatch(&self, request: &Request, mapping: &mut ModbusMapping) -> Outcome {
        let function = request.function_code();
        match *request {
            Request::ReadCoils { address, quantity } => read_bits(mapping.coils(), function, address, quantity),
            Request::ReadDiscreteInputs { address, quantity } => {
                read_bits(mapping.discrete_inputs(), function, address, quantity)
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                read_registers(mapping.holding_registers(), function, address, quantity)
            }
            Request::ReadInputRegisters { address, quantity } => {
                read_registers(mapping.input_registers(), function, address, quantity)
            }
            Request::WriteSingleCoil { address, value } => {
                let coils = mapping.coils_mut();
                coils.check(address, 1).map_err(|_| ExceptionCode::IllegalDataAddress)?;
                let on = match value {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ExceptionCode::IllegalDataValue),
                };
                coils.set(address, on).map_err(|_| ExceptionCode::IllegalDataAddress)?;
                Ok(request.encode())
            }
            Request::WriteSingleRegister { address, value } => {
                mapping
                    .holding_registers_mut()
                    .set(address, value)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                Ok(request.encode())
            }
            Request::WriteMultipleCoils { address, quantity, byte_count, ref data } => {
                let nb = quantity as usize;
                if nb < 1 || nb > MAX_WRITE_BITS || (byte_count as usize) * 8 < nb {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let values = unpack_bits(data, nb);
                mapping
                    .coils_mut()
                    .write(address, &values)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                Ok(write_echo(function, address, quantity))
            }
            Request::WriteMultipleRegisters { address, quantity, byte_count, ref data } => {
                let nb = quantity as usize;
                if nb < 1 || nb > MAX_WRITE_REGISTERS || byte_count as usize != nb * 2 {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                mapping
                    .holding_registers_mut()
                    .write(address, &registers(data))
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                Ok(write_echo(function, address, quantity))
            }
            Request::ReadExceptionStatus => Err(ExceptionCode::IllegalFunction),
            Request::ReportSlaveId => Ok(self.report_slave_id(function)),
            Request::MaskWriteRegister { address, and_mask, or_mask } => {
                let registers = mapping.holding_registers_mut();
                let current = registers
                    .get(address)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                let value = (current & and_mask) | (or_mask & !and_mask);
                registers
                    .set(address, value)
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                Ok(request.encode())
            }
            Request::WriteAndReadRegisters {
                read_address,
                read_quantity,
                write_address,
                write_quantity,
                byte_count,
                ref data,
            } => {
                let nb_read = read_quantity as usize;
                let nb_write = write_quantity as usize;
                if nb_write < 1
                    || nb_write > MAX_WR_WRITE_REGISTERS
                    || nb_read < 1
                    || nb_read > MAX_WR_READ_REGISTERS
                    || byte_count as usize != nb_write * 2
                {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let table = mapping.holding_registers_mut();
                if table.check(read_address, nb_read).is_err() || table.check(write_address, nb_write).is_err() {
                    return Err(ExceptionCode::IllegalDataAddress);
                }
                // write first: the read returns the updated values
                table
                    .write(write_address, &registers(data))
                    .map_err(|_| ExceptionCode::IllegalDataAddress)?;
                read_registers(table, function, read_address, read_quantity)
            }
        }
    }

    fn report_slave_id(&self, function: FunctionCode) -> Vec<u8> {
        // function code, byte count, slave id, run indicator
        let room = MAX_PDU_LENGTH - 4;
        let report = ReportSlaveId {
            slave_id: self.slave.unwrap_or(BROADCAST_ADDRESS),
            run_indicator: true,
            additional_data: self.report_trailer[..self.report_trailer.len().min(room)].to_vec(),
        };
        let data = report.to_bytes();
        let mut pdu = Vec::with_capacity(2 + data.len());
        pdu.push(function.to_u8());
        pdu.push(data.len() as u8);
        pdu.extend_from_slice(&data);
        pdu
    }
}

fn read_bits(table: &Table<bool>, function: FunctionCode, address: u16, quantity: u16) -> Outcome {
    let nb = quantity as usize;
    if nb < 1 || nb > MAX_READ_BITS {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let bits = table
        .read(address, nb)
        .map_err(|_| ExceptionCode::IllegalDataAddress)?;
    let packed = pack_bits(bits);
    let mut pdu = Vec::with_capacity(2 + packed.len());
    pdu.push(function.to_u8());
    pdu.push(packed.len() as u8);
    pdu.extend_from_slice(&packed);
    Ok(pdu)
}

fn read_registers(table: &Table<u16>, function: FunctionCode, address: u16, quantity: u16) -> Outcome {
    let nb = quantity as usize;
    let max = if function == FunctionCode::WriteAndReadRegisters {
        MAX_WR_READ_REGISTERS
    } else {
        MAX_READ_REGISTERS
    };
    if nb < 1 || nb > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let values = table
        .read(address, nb)
        .map_err(|_| ExceptionCode::IllegalDataAddress)?;
    let bytes = registers_to_bytes(values);
    let mut pdu = Vec::with_capacity(2 + bytes.len());
    pdu.push(function.to_u8());
    pdu.push(bytes.len() as u8);
    pdu.extend_from_slice(&bytes);
    Ok(pdu)
}

fn write_echo(function: FunctionCode, address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = vec![function.to_u8()];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

fn registers(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}
