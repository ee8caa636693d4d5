/// Server-side process image
///
/// Four independent tables (coils, discrete inputs, holding registers and
/// input registers), each with its own start address and size. Addresses
/// passed in are absolute Modbus addresses; the table subtracts its start
/// address and rejects anything outside `[start, start + count)`.

use crate::error::{ModbusError, ModbusResult};

/// Size of the 16-bit address space
const ADDRESS_SPACE: usize = 0x1_0000;

/// One contiguous block of bits or registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table<T> {
    start: u16,
    values: Vec<T>,
}

impl<T: Copy + Default> Table<T> {
    fn new(start: u16, count: usize) -> ModbusResult<Self> {
        if start as usize + count > ADDRESS_SPACE {
            return Err(ModbusError::configuration(format!(
                "table of {} entries starting at {} exceeds the address space",
                count, start
            )));
        }
        Ok(Self { start, values: vec![T::default(); count] })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// A zero-sized table is absent: every access fails.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Offset of `address` if `count` entries from it fit in the table.
    fn offset(&self, address: u16, count: usize) -> ModbusResult<usize> {
        let offset = (address as usize)
            .checked_sub(self.start as usize)
            .filter(|offset| count > 0 && offset + count <= self.values.len());
        offset.ok_or_else(|| ModbusError::invalid_address(address, count.min(u16::MAX as usize) as u16))
    }

    pub fn get(&self, address: u16) -> ModbusResult<T> {
        Ok(self.values[self.offset(address, 1)?])
    }

    pub fn set(&mut self, address: u16, value: T) -> ModbusResult<()> {
        let offset = self.offset(address, 1)?;
        self.values[offset] = value;
        Ok(())
    }

    /// `count` consecutive values starting at `address`.
    pub fn read(&self, address: u16, count: usize) -> ModbusResult<&[T]> {
        let offset = self.offset(address, count)?;
        Ok(&self.values[offset..offset + count])
    }

    pub fn write(&mut self, address: u16, values: &[T]) -> ModbusResult<()> {
        let offset = self.offset(address, values.len())?;
        self.values[offset..offset + values.len()].copy_from_slice(values);
        Ok(())
    }

    /// Check that `count` entries from `address` are mapped.
    pub fn check(&self, address: u16, count: usize) -> ModbusResult<()> {
        self.offset(address, count).map(|_| ())
    }

    /// `(address, value)` pairs in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, T)> + '_ {
        let start = self.start as usize;
        self.values
            .iter()
            .enumerate()
            .map(move |(i, &value)| ((start + i) as u16, value))
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

/// Coils, discrete inputs, holding and input registers of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusMapping {
    coils: Table<bool>,
    discrete_inputs: Table<bool>,
    holding_registers: Table<u16>,
    input_registers: Table<u16>,
}

impl ModbusMapping {
    /// Tables all starting at address 0.
    pub fn new(
        nb_coils: usize,
        nb_discrete_inputs: usize,
        nb_holding_registers: usize,
        nb_input_registers: usize,
    ) -> ModbusResult<Self> {
        Self::new_start_address(
            0,
            nb_coils,
            0,
            nb_discrete_inputs,
            0,
            nb_holding_registers,
            0,
            nb_input_registers,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_start_address(
        start_coils: u16,
        nb_coils: usize,
        start_discrete_inputs: u16,
        nb_discrete_inputs: usize,
        start_holding_registers: u16,
        nb_holding_registers: usize,
        start_input_registers: u16,
        nb_input_registers: usize,
    ) -> ModbusResult<Self> {
        Ok(Self {
            coils: Table::new(start_coils, nb_coils)?,
            discrete_inputs: Table::new(start_discrete_inputs, nb_discrete_inputs)?,
            holding_registers: Table::new(start_holding_registers, nb_holding_registers)?,
            input_registers: Table::new(start_input_registers, nb_input_registers)?,
        })
    }

    pub fn coils(&self) -> &Table<bool> {
        &self.coils
    }

    pub fn coils_mut(&mut self) -> &mut Table<bool> {
        &mut self.coils
    }

    pub fn discrete_inputs(&self) -> &Table<bool> {
        &self.discrete_inputs
    }

    pub fn discrete_inputs_mut(&mut self) -> &mut Table<bool> {
        &mut self.discrete_inputs
    }

    pub fn holding_registers(&self) -> &Table<u16> {
        &self.holding_registers
    }

    pub fn holding_registers_mut(&mut self) -> &mut Table<u16> {
        &mut self.holding_registers
    }

    pub fn input_registers(&self) -> &Table<u16> {
        &self.input_registers
    }

    pub fn input_registers_mut(&mut self) -> &mut Table<u16> {
        &mut self.input_registers
    }

    pub fn get_coil(&self, address: u16) -> ModbusResult<bool> {
        self.coils.get(address)
    }

    pub fn set_coil(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        self.coils.set(address, value)
    }

    pub fn get_discrete_input(&self, address: u16) -> ModbusResult<bool> {
        self.discrete_inputs.get(address)
    }

    pub fn set_discrete_input(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        self.discrete_inputs.set(address, value)
    }

    pub fn get_holding_register(&self, address: u16) -> ModbusResult<u16> {
        self.holding_registers.get(address)
    }

    pub fn set_holding_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.holding_registers.set(address, value)
    }

    pub fn get_input_register(&self, address: u16) -> ModbusResult<u16> {
        self.input_registers.get(address)
    }

    pub fn set_input_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.input_registers.set(address, value)
    }
}
