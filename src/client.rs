/// Master-side Modbus operations.
///
/// Every standard function is a method of [`ModbusClient`], implemented
/// once for [`ModbusContext`] whatever its backend: the PDU is the same
/// over RTU and TCP, only the envelope differs.
///
/// Quantities are checked against the protocol ceilings before anything is
/// sent. A request to the RTU broadcast address (0) is sent without waiting
/// for an answer and only write functions may be broadcast.

use async_trait::async_trait;

use crate::context::ModbusContext;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::data_utils::{bytes_to_registers, unpack_bits};
use crate::protocol::{
    ReportSlaveId, Request, COIL_OFF, COIL_ON, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS,
    MAX_WRITE_REGISTERS, MAX_WR_READ_REGISTERS, MAX_WR_WRITE_REGISTERS,
};
use crate::utils::validation::{check_address_range, check_quantity};

/// Modbus master operations addressed to the context's slave id.
#[async_trait]
pub trait ModbusClient: Send {
    /// Read coils (0x01)
    async fn read_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>>;

    /// Read discrete inputs (0x02)
    async fn read_input_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>>;

    /// Read holding registers (0x03)
    async fn read_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>>;

    /// Read input registers (0x04)
    async fn read_input_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>>;

    /// Write single coil (0x05)
    async fn write_bit(&mut self, address: u16, value: bool) -> ModbusResult<()>;

    /// Write single register (0x06)
    async fn write_register(&mut self, address: u16, value: u16) -> ModbusResult<()>;

    /// Write multiple coils (0x0F)
    async fn write_bits(&mut self, address: u16, values: &[bool]) -> ModbusResult<()>;

    /// Write multiple registers (0x10)
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ModbusResult<()>;

    /// Mask write register (0x16): `(current & and) | (or & !and)`
    async fn mask_write_register(&mut self, address: u16, and_mask: u16, or_mask: u16) -> ModbusResult<()>;

    /// Write then read holding registers in one transaction (0x17)
    async fn write_and_read_registers(
        &mut self,
        write_address: u16,
        values: &[u16],
        read_address: u16,
        read_nb: u16,
    ) -> ModbusResult<Vec<u16>>;

    /// Report slave id (0x11)
    async fn report_slave_id(&mut self) -> ModbusResult<ReportSlaveId>;

    /// Read exception status (0x07)
    async fn read_exception_status(&mut self) -> ModbusResult<u8>;
}

impl ModbusContext {
    async fn read_bit_table(&mut self, request: Request, nb: u16) -> ModbusResult<Vec<bool>> {
        let pdu = self.confirmed(&request).await?;
        Ok(unpack_bits(&pdu[2..], nb as usize))
    }

    async fn read_register_table(&mut self, request: Request) -> ModbusResult<Vec<u16>> {
        let pdu = self.confirmed(&request).await?;
        bytes_to_registers(&pdu[2..])
    }

    /// Execute a request that must be answered.
    async fn confirmed(&mut self, request: &Request) -> ModbusResult<Vec<u8>> {
        self.execute(request)
            .await?
            .ok_or_else(|| ModbusError::internal("no confirmation for a unicast request"))
    }
}

#[async_trait]
impl ModbusClient for ModbusContext {
    async fn read_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>> {
        check_quantity(nb as usize, MAX_READ_BITS)?;
        check_address_range(address, nb as usize)?;
        self.read_bit_table(Request::ReadCoils { address, quantity: nb }, nb).await
    }

    async fn read_input_bits(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<bool>> {
        check_quantity(nb as usize, MAX_READ_BITS)?;
        check_address_range(address, nb as usize)?;
        self.read_bit_table(Request::ReadDiscreteInputs { address, quantity: nb }, nb).await
    }

    async fn read_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>> {
        check_quantity(nb as usize, MAX_READ_REGISTERS)?;
        check_address_range(address, nb as usize)?;
        self.read_register_table(Request::ReadHoldingRegisters { address, quantity: nb }).await
    }

    async fn read_input_registers(&mut self, address: u16, nb: u16) -> ModbusResult<Vec<u16>> {
        check_quantity(nb as usize, MAX_READ_REGISTERS)?;
        check_address_range(address, nb as usize)?;
        self.read_register_table(Request::ReadInputRegisters { address, quantity: nb }).await
    }

    async fn write_bit(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        let value = if value { COIL_ON } else { COIL_OFF };
        self.execute(&Request::WriteSingleCoil { address, value }).await?;
        Ok(())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.execute(&Request::WriteSingleRegister { address, value }).await?;
        Ok(())
    }

    async fn write_bits(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        check_quantity(values.len(), MAX_WRITE_BITS)?;
        check_address_range(address, values.len())?;
        self.execute(&Request::write_multiple_coils(address, values)).await?;
        Ok(())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        check_quantity(values.len(), MAX_WRITE_REGISTERS)?;
        check_address_range(address, values.len())?;
        self.execute(&Request::write_multiple_registers(address, values)).await?;
        Ok(())
    }

    async fn mask_write_register(&mut self, address: u16, and_mask: u16, or_mask: u16) -> ModbusResult<()> {
        self.execute(&Request::MaskWriteRegister { address, and_mask, or_mask }).await?;
        Ok(())
    }

    async fn write_and_read_registers(
        &mut self,
        write_address: u16,
        values: &[u16],
        read_address: u16,
        read_nb: u16,
    ) -> ModbusResult<Vec<u16>> {
        check_quantity(values.len(), MAX_WR_WRITE_REGISTERS)?;
        check_quantity(read_nb as usize, MAX_WR_READ_REGISTERS)?;
        check_address_range(write_address, values.len())?;
        check_address_range(read_address, read_nb as usize)?;
        let request = Request::write_and_read_registers(write_address, values, read_address, read_nb);
        self.read_register_table(request).await
    }

    async fn report_slave_id(&mut self) -> ModbusResult<ReportSlaveId> {
        let pdu = self.confirmed(&Request::ReportSlaveId).await?;
        ReportSlaveId::parse(&pdu[2..])
    }

    async fn read_exception_status(&mut self) -> ModbusResult<u8> {
        let pdu = self.confirmed(&Request::ReadExceptionStatus).await?;
        Ok(pdu[1])
    }
}
