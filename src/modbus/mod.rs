pub mod clock;
pub mod crc;
pub mod master;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub mod mock;

pub use clock::{Clock, SystemClock};
pub use crc::crc16_modbus;
pub use master::{MasterOptions, ModbusMaster, NegotiatedLink, RegisterAccess, TransactionStats};
pub use protocol::{ExceptionCode, OperationOutcome, RegisterKind, RegisterOperation};
pub use transport::{DirectionControl, SerialTransport, Transport};
