use thiserror::Error;

use crate::modbus::protocol::ExceptionCode;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("CRC checksum mismatch")]
    CrcError,

    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid slave address: {0} (must be 1-247)")]
    InvalidDevice(u8),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Slave {slave} answered with exception: {code}")]
    Exception { slave: u8, code: ExceptionCode },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ModbusError {
    /// Transport-level faults that may succeed when the identical request is re-issued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout | ModbusError::CrcError | ModbusError::InvalidResponse(_)
        )
    }

    /// True when a well-formed frame came back from the addressed slave,
    /// even if it carried an exception.
    pub fn is_bus_response(&self) -> bool {
        matches!(self, ModbusError::Exception { .. })
    }

    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        ModbusError::SerializationError(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        ModbusError::CommunicationError(format!("Serial port error: {}", err))
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::SerializationError(format!("TOML error: {}", err))
    }
}

impl From<tokio::task::JoinError> for ModbusError {
    fn from(err: tokio::task::JoinError) -> Self {
        ModbusError::CommunicationError(format!("Polling task failed: {}", err))
    }
}
