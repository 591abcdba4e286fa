pub mod register_map;
pub mod traits;
pub mod ventilation;

pub use register_map::{decode_value, RegisterMapDevice};
pub use traits::{Device, DeviceReading, Metric, PointFailure};
pub use ventilation::{AnalogChannel, SignalType};

use log::info;

use crate::config::settings::Config;
use crate::utils::error::ModbusError;

/// Builds one device per enabled `[[devices]]` entry.
pub fn build_devices(config: &Config) -> Result<Vec<Box<dyn Device>>, ModbusError> {
    let mut devices: Vec<Box<dyn Device>> = Vec::new();
    for device_config in config.get_enabled_devices() {
        let device =
            RegisterMapDevice::from_config(device_config, config.polling.type_refresh_seconds)?;
        info!(
            "✅ Device '{}' at slave {} with {} points",
            device_config.name,
            device_config.slave_id,
            device_config.points.len()
        );
        devices.push(Box::new(device));
    }
    Ok(devices)
}
