//! Modbus RTU master for RS-485 field devices.
//!
//! The [`modbus`] engine owns the serial line and runs one request/response
//! exchange at a time with direction control and t3.5 timing. [`devices`] turn
//! register maps into named metrics, [`output`] wraps them in Sparkplug-style
//! envelopes and [`services::PollService`] ties everything into a periodic poller.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{Device, DeviceReading, Metric, RegisterMapDevice};
pub use modbus::{MasterOptions, ModbusMaster, RegisterAccess, RegisterKind, SerialTransport};
pub use output::{DataFormatter, DataSender, Publication};
pub use services::PollService;
pub use utils::error::ModbusError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
