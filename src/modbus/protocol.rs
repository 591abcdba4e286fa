use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::crc::{append_crc, frame_crc_ok};
use crate::utils::error::ModbusError;

pub const MIN_SLAVE_ID: u8 = 1;
pub const MAX_SLAVE_ID: u8 = 247;

pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Exception responses are always address + function + code + CRC.
const EXCEPTION_FRAME_LEN: usize = 5;
/// Write echoes are address + function + 4 bytes + CRC.
const ECHO_FRAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn exception_code(self) -> u8 {
        self.code() | 0x80
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    Unknown(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailed,
            other => ExceptionCode::Unknown(other),
        }
    }
}

impl ExceptionCode {
    pub fn code(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailed => 0x0B,
            ExceptionCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::SlaveDeviceFailure => "slave device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::SlaveDeviceBusy => "slave device busy",
            ExceptionCode::MemoryParityError => "memory parity error",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailed => "gateway target failed to respond",
            ExceptionCode::Unknown(_) => "unknown exception",
        };
        write!(f, "{} (0x{:02X})", text, self.code())
    }
}

/// Readable data classes of the Modbus data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    Discrete,
    Coil,
}

impl RegisterKind {
    pub fn read_function(self) -> FunctionCode {
        match self {
            RegisterKind::Holding => FunctionCode::ReadHoldingRegisters,
            RegisterKind::Input => FunctionCode::ReadInputRegisters,
            RegisterKind::Discrete => FunctionCode::ReadDiscreteInputs,
            RegisterKind::Coil => FunctionCode::ReadCoils,
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Discrete | RegisterKind::Coil)
    }

    pub fn max_read_count(self) -> u16 {
        if self.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    pub fn read_operation(self, start: u16, count: u16) -> RegisterOperation {
        match self {
            RegisterKind::Holding => RegisterOperation::ReadHolding { start, count },
            RegisterKind::Input => RegisterOperation::ReadInput { start, count },
            RegisterKind::Discrete => RegisterOperation::ReadDiscrete { start, count },
            RegisterKind::Coil => RegisterOperation::ReadCoils { start, count },
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Discrete => "discrete",
            RegisterKind::Coil => "coil",
        };
        f.write_str(name)
    }
}

impl FromStr for RegisterKind {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holding" | "hr" | "3" => Ok(RegisterKind::Holding),
            "input" | "ir" | "4" => Ok(RegisterKind::Input),
            "discrete" | "di" | "2" => Ok(RegisterKind::Discrete),
            "coil" | "coils" | "1" => Ok(RegisterKind::Coil),
            other => Err(ModbusError::InvalidData(format!(
                "Unknown register kind '{}' (expected holding, input, discrete or coil)",
                other
            ))),
        }
    }
}

/// One request the master can put on the bus. Addresses are 0-based wire addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOperation {
    ReadHolding { start: u16, count: u16 },
    ReadInput { start: u16, count: u16 },
    ReadDiscrete { start: u16, count: u16 },
    ReadCoils { start: u16, count: u16 },
    WriteSingleHolding { address: u16, value: u16 },
    WriteMultipleHolding { start: u16, values: Vec<u16> },
    WriteSingleCoil { address: u16, value: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Register words, or 0/1 per bit for discrete inputs and coils.
    Values(Vec<u16>),
    Written,
}

impl OperationOutcome {
    pub fn into_values(self) -> Vec<u16> {
        match self {
            OperationOutcome::Values(values) => values,
            OperationOutcome::Written => Vec::new(),
        }
    }
}

impl RegisterOperation {
    /// Picks 0x06 for a single value and 0x10 otherwise.
    pub fn write_holding(start: u16, values: &[u16]) -> Self {
        match values {
            [value] => RegisterOperation::WriteSingleHolding {
                address: start,
                value: *value,
            },
            _ => RegisterOperation::WriteMultipleHolding {
                start,
                values: values.to_vec(),
            },
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            RegisterOperation::ReadHolding { .. } => FunctionCode::ReadHoldingRegisters,
            RegisterOperation::ReadInput { .. } => FunctionCode::ReadInputRegisters,
            RegisterOperation::ReadDiscrete { .. } => FunctionCode::ReadDiscreteInputs,
            RegisterOperation::ReadCoils { .. } => FunctionCode::ReadCoils,
            RegisterOperation::WriteSingleHolding { .. } => FunctionCode::WriteSingleRegister,
            RegisterOperation::WriteMultipleHolding { .. } => FunctionCode::WriteMultipleRegisters,
            RegisterOperation::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RegisterOperation::WriteSingleHolding { .. }
                | RegisterOperation::WriteMultipleHolding { .. }
                | RegisterOperation::WriteSingleCoil { .. }
        )
    }

    fn read_span(&self) -> Option<(RegisterKind, u16, u16)> {
        match *self {
            RegisterOperation::ReadHolding { start, count } => {
                Some((RegisterKind::Holding, start, count))
            }
            RegisterOperation::ReadInput { start, count } => {
                Some((RegisterKind::Input, start, count))
            }
            RegisterOperation::ReadDiscrete { start, count } => {
                Some((RegisterKind::Discrete, start, count))
            }
            RegisterOperation::ReadCoils { start, count } => {
                Some((RegisterKind::Coil, start, count))
            }
            _ => None,
        }
    }

    /// Rejects requests the protocol cannot express, before anything is sent.
    pub fn validate(&self) -> Result<(), ModbusError> {
        if let Some((kind, start, count)) = self.read_span() {
            let max = kind.max_read_count();
            if count == 0 || count > max {
                return Err(ModbusError::InvalidData(format!(
                    "Cannot read {} {} values (allowed 1-{})",
                    count, kind, max
                )));
            }
            return check_span(start, count);
        }

        match self {
            RegisterOperation::WriteMultipleHolding { start, values } => {
                let count = values.len();
                if count == 0 || count > MAX_WRITE_REGISTERS as usize {
                    return Err(ModbusError::InvalidData(format!(
                        "Cannot write {} registers (allowed 1-{})",
                        count, MAX_WRITE_REGISTERS
                    )));
                }
                check_span(*start, count as u16)
            }
            _ => Ok(()),
        }
    }

    /// Protocol data unit: function code and payload, without address or CRC.
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut pdu = vec![self.function().code()];
        match self {
            RegisterOperation::ReadHolding { start, count }
            | RegisterOperation::ReadInput { start, count }
            | RegisterOperation::ReadDiscrete { start, count }
            | RegisterOperation::ReadCoils { start, count } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&count.to_be_bytes());
            }
            RegisterOperation::WriteSingleHolding { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            RegisterOperation::WriteSingleCoil { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&coil_word(*value).to_be_bytes());
            }
            RegisterOperation::WriteMultipleHolding { start, values } => {
                pdu.extend_from_slice(&start.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
        }
        pdu
    }

    /// Full RTU length of a successful response frame.
    pub fn expected_response_len(&self) -> usize {
        match self.read_span() {
            Some((kind, _, count)) => 3 + data_byte_count(kind, count) + 2,
            None => ECHO_FRAME_LEN,
        }
    }

    fn decode_body(&self, body: &[u8]) -> Result<OperationOutcome, ModbusError> {
        match self {
            RegisterOperation::ReadHolding { count, .. } => {
                decode_read_data(RegisterKind::Holding, *count, body)
            }
            RegisterOperation::ReadInput { count, .. } => {
                decode_read_data(RegisterKind::Input, *count, body)
            }
            RegisterOperation::ReadDiscrete { count, .. } => {
                decode_read_data(RegisterKind::Discrete, *count, body)
            }
            RegisterOperation::ReadCoils { count, .. } => {
                decode_read_data(RegisterKind::Coil, *count, body)
            }
            RegisterOperation::WriteSingleHolding { address, value } => {
                decode_write_echo([*address, *value], body)
            }
            RegisterOperation::WriteSingleCoil { address, value } => {
                decode_write_echo([*address, coil_word(*value)], body)
            }
            RegisterOperation::WriteMultipleHolding { start, values } => {
                decode_write_echo([*start, values.len() as u16], body)
            }
        }
    }
}

fn decode_read_data(
    kind: RegisterKind,
    count: u16,
    body: &[u8],
) -> Result<OperationOutcome, ModbusError> {
    let expected = data_byte_count(kind, count);
    let declared = *body
        .first()
        .ok_or_else(|| ModbusError::InvalidResponse("missing byte count".to_string()))?
        as usize;
    if declared != expected || body.len() != expected + 1 {
        return Err(ModbusError::InvalidResponse(format!(
            "byte count {} does not match the {} bytes requested",
            declared, expected
        )));
    }
    let data = &body[1..];
    let values = if kind.is_bit() {
        (0..count as usize)
            .map(|i| ((data[i / 8] >> (i % 8)) & 0x01) as u16)
            .collect()
    } else {
        data.chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    };
    Ok(OperationOutcome::Values(values))
}

/// Single and multiple writes echo two words: address plus value or quantity.
fn decode_write_echo(expected: [u16; 2], body: &[u8]) -> Result<OperationOutcome, ModbusError> {
    if body.len() != 4 {
        return Err(ModbusError::InvalidResponse(format!(
            "write echo has {} bytes instead of 4",
            body.len()
        )));
    }
    let echoed = [
        u16::from_be_bytes([body[0], body[1]]),
        u16::from_be_bytes([body[2], body[3]]),
    ];
    if echoed != expected {
        return Err(ModbusError::InvalidResponse(format!(
            "write echo {:?} does not match request {:?}",
            echoed, expected
        )));
    }
    Ok(OperationOutcome::Written)
}

impl fmt::Display for RegisterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterOperation::WriteSingleHolding { address, value } => {
                write!(f, "write holding[{}] = {}", address, value)
            }
            RegisterOperation::WriteMultipleHolding { start, values } => {
                let end = *start as usize + values.len();
                write!(f, "write holding[{}..{}] = {:?}", start, end, values)
            }
            RegisterOperation::WriteSingleCoil { address, value } => {
                write!(f, "write coil[{}] = {}", address, value)
            }
            _ => match self.read_span() {
                Some((kind, start, count)) => write!(f, "read {} {}x{}", kind, start, count),
                None => Ok(()),
            },
        }
    }
}

fn coil_word(on: bool) -> u16 {
    if on {
        0xFF00
    } else {
        0x0000
    }
}

fn data_byte_count(kind: RegisterKind, count: u16) -> usize {
    if kind.is_bit() {
        (count as usize + 7) / 8
    } else {
        count as usize * 2
    }
}

fn check_span(start: u16, count: u16) -> Result<(), ModbusError> {
    if start as u32 + count as u32 > 0x1_0000 {
        return Err(ModbusError::InvalidData(format!(
            "Address range {}+{} exceeds the 16-bit address space",
            start, count
        )));
    }
    Ok(())
}

pub fn is_valid_slave_id(slave_id: u8) -> bool {
    (MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&slave_id)
}

/// Builds the complete RTU frame: address, PDU, CRC.
pub fn build_request(slave_id: u8, operation: &RegisterOperation) -> Vec<u8> {
    let mut frame = vec![slave_id];
    frame.extend_from_slice(&operation.encode_pdu());
    append_crc(&mut frame);
    frame
}

/// Total length of the frame being received, once enough of its header is in.
pub fn response_length(partial: &[u8], operation: &RegisterOperation) -> Option<usize> {
    if partial.len() < 2 {
        return None;
    }
    let function = partial[1];
    if function & 0x80 != 0 {
        return Some(EXCEPTION_FRAME_LEN);
    }
    match function {
        0x01..=0x04 => partial.get(2).map(|&count| 3 + count as usize + 2),
        0x05 | 0x06 | 0x10 => Some(ECHO_FRAME_LEN),
        _ => Some(operation.expected_response_len()),
    }
}

/// Validates and decodes a complete response frame for `operation`.
pub fn parse_response(
    slave_id: u8,
    operation: &RegisterOperation,
    frame: &[u8],
) -> Result<OperationOutcome, ModbusError> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(ModbusError::InvalidResponse(format!(
            "frame too short ({} bytes)",
            frame.len()
        )));
    }
    if !frame_crc_ok(frame) {
        return Err(ModbusError::CrcError);
    }
    if frame[0] != slave_id {
        return Err(ModbusError::InvalidResponse(format!(
            "answer from slave {} while addressing {}",
            frame[0], slave_id
        )));
    }

    let function = operation.function();
    if frame[1] == function.exception_code() {
        return Err(ModbusError::Exception {
            slave: slave_id,
            code: ExceptionCode::from(frame[2]),
        });
    }
    if frame[1] != function.code() {
        return Err(ModbusError::InvalidResponse(format!(
            "function code 0x{:02X} does not match request 0x{:02X}",
            frame[1],
            function.code()
        )));
    }

    operation.decode_body(&frame[2..frame.len() - 2])
}
