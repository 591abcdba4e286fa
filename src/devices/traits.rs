use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::config::settings::{DataType, WriteConfig};
use crate::modbus::master::RegisterAccess;
use crate::utils::error::ModbusError;

/// One named measurement produced by a poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub data_type: DataType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointFailure {
    pub point: String,
    pub reason: String,
}

/// Result of polling one device: whatever could be read plus what could not.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub device: String,
    pub slave_id: u8,
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<Metric>,
    pub failures: Vec<PointFailure>,
}

impl DeviceReading {
    pub fn new(device: &str, slave_id: u8, timestamp: DateTime<Utc>) -> Self {
        Self {
            device: device.to_string(),
            slave_id,
            timestamp,
            metrics: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, point: &str, reason: impl ToString) {
        self.failures.push(PointFailure {
            point: point.to_string(),
            reason: reason.to_string(),
        });
    }
}

pub trait Device: Send {
    fn name(&self) -> &str;
    fn slave_id(&self) -> u8;

    /// Writes issued once before the first poll; addresses are already wire addresses.
    fn startup_writes(&self) -> &[WriteConfig];

    /// Reads every point; a failed point never aborts the others.
    fn read_metrics(&mut self, bus: &mut dyn RegisterAccess, now: DateTime<Utc>) -> DeviceReading;

    fn run_startup_writes(&self, bus: &mut dyn RegisterAccess) -> Result<(), ModbusError> {
        for write in self.startup_writes() {
            bus.write_registers(self.slave_id(), write.address, &write.values)?;
            info!(
                "✍️  {} [{}]: holding[{}] = {:?} {}",
                self.name(),
                self.slave_id(),
                write.address,
                write.values,
                write.description
            );
        }
        Ok(())
    }
}
