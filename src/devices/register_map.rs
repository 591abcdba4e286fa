use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};

use super::traits::{Device, DeviceReading, Metric};
use super::ventilation::AnalogChannel;
use crate::config::settings::{DataType, DeviceConfig, PointConfig, WriteConfig};
use crate::modbus::master::RegisterAccess;
use crate::utils::error::ModbusError;

/// Device described entirely by configuration: a list of points plus optional startup writes.
#[derive(Debug, Clone)]
pub struct RegisterMapDevice {
    name: String,
    slave_id: u8,
    points: Vec<MapPoint>,
    startup_writes: Vec<WriteConfig>,
}

#[derive(Debug, Clone)]
struct MapPoint {
    // address already shifted to the wire address
    config: PointConfig,
    channel: Option<AnalogChannel>,
}

impl RegisterMapDevice {
    pub fn from_config(
        device: &DeviceConfig,
        type_refresh_seconds: u64,
    ) -> Result<Self, ModbusError> {
        let wire = |address: u16, what: &str| {
            address.checked_sub(device.register_offset).ok_or_else(|| {
                ModbusError::ConfigError(format!(
                    "{} address {} on '{}' is below register offset {}",
                    what, address, device.name, device.register_offset
                ))
            })
        };
        let refresh = Duration::seconds(type_refresh_seconds as i64);

        let mut points = Vec::with_capacity(device.points.len());
        for point in &device.points {
            let mut config = point.clone();
            config.address = wire(point.address, &point.name)?;
            let channel = match point.signal_type_register {
                Some(register) => Some(AnalogChannel::new(wire(register, &point.name)?, refresh)),
                None => None,
            };
            points.push(MapPoint { config, channel });
        }

        let startup_writes = device
            .startup_writes
            .iter()
            .map(|write| {
                Ok(WriteConfig {
                    address: wire(write.address, "Startup write")?,
                    values: write.values.clone(),
                    description: write.description.clone(),
                })
            })
            .collect::<Result<Vec<_>, ModbusError>>()?;

        Ok(Self {
            name: device.name.clone(),
            slave_id: device.slave_id,
            points,
            startup_writes,
        })
    }
}

/// Decodes big-endian register words into a plain number.
pub fn decode_value(data_type: DataType, words: &[u16]) -> Result<f64, ModbusError> {
    let needed = data_type.register_count() as usize;
    if words.len() < needed {
        return Err(ModbusError::InvalidData(format!(
            "{:?} needs {} registers, got {}",
            data_type,
            needed,
            words.len()
        )));
    }
    let long = || ((words[0] as u32) << 16) | words[1] as u32;
    let value = match data_type {
        DataType::U16 => words[0] as f64,
        DataType::I16 => words[0] as i16 as f64,
        DataType::U32 => long() as f64,
        DataType::I32 => long() as i32 as f64,
        DataType::F32 => f32::from_bits(long()) as f64,
        DataType::Bool => {
            if words[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
    };
    Ok(value)
}

impl Device for RegisterMapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn slave_id(&self) -> u8 {
        self.slave_id
    }

    fn startup_writes(&self) -> &[WriteConfig] {
        &self.startup_writes
    }

    fn read_metrics(&mut self, bus: &mut dyn RegisterAccess, now: DateTime<Utc>) -> DeviceReading {
        let mut reading = DeviceReading::new(&self.name, self.slave_id, now);

        for point in &mut self.points {
            let config = &point.config;
            let (scale, unit) = match point.channel.as_mut() {
                Some(channel) => {
                    match channel.current_signal(bus, self.slave_id, &config.name, now) {
                        Ok(Some(signal)) => {
                            let (scale, unit) = signal.scaling();
                            (scale, unit.to_string())
                        }
                        Ok(None) => {
                            debug!("Skipping {} (channel not used)", config.name);
                            continue;
                        }
                        Err(e) => {
                            reading.fail(&config.name, format!("signal type unknown: {}", e));
                            continue;
                        }
                    }
                }
                None => (config.scale, config.unit.clone()),
            };

            let words = bus.read_registers(
                self.slave_id,
                config.kind,
                config.address,
                config.data_type.register_count(),
            );
            match words.and_then(|words| decode_value(config.data_type, &words)) {
                Ok(raw) => {
                    let value = match config.data_type {
                        DataType::Bool => raw,
                        _ => raw * scale + config.offset,
                    };
                    debug!("{} = {} {}", config.name, value, unit);
                    reading.metrics.push(Metric {
                        name: config.name.clone(),
                        value,
                        unit,
                        data_type: config.data_type,
                        timestamp: now,
                    });
                }
                Err(e) => {
                    warn!(
                        "⚠️  {} [{}]: {} read failed: {}",
                        self.name, self.slave_id, config.name, e
                    );
                    reading.fail(&config.name, e);
                }
            }
        }

        reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::Config;
    use crate::modbus::mock::{Fault, MockBus, MockSlave};
    use crate::modbus::{MasterOptions, ModbusMaster, RegisterKind};
    use std::collections::HashMap;

    fn point(name: &str, kind: RegisterKind, address: u16, data_type: DataType) -> PointConfig {
        PointConfig {
            name: name.to_string(),
            kind,
            address,
            data_type,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            signal_type_register: None,
        }
    }

    fn master_for(bus: &MockBus) -> ModbusMaster<MockBus, crate::modbus::mock::MockClock> {
        ModbusMaster::new(bus.clone(), bus.clock(), MasterOptions::default())
    }

    #[test]
    fn test_decode_value() {
        assert_eq!(decode_value(DataType::U16, &[0xFFFF]).unwrap(), 65535.0);
        assert_eq!(decode_value(DataType::I16, &[0xFFFE]).unwrap(), -2.0);
        assert_eq!(decode_value(DataType::U32, &[0x0001, 0x0000]).unwrap(), 65536.0);
        assert_eq!(decode_value(DataType::I32, &[0xFFFF, 0xFFFF]).unwrap(), -1.0);
        assert_eq!(decode_value(DataType::F32, &[0x41C4, 0x0000]).unwrap(), 24.5);
        assert_eq!(decode_value(DataType::Bool, &[7]).unwrap(), 1.0);
        assert!(decode_value(DataType::F32, &[0x41C4]).is_err());
    }

    #[test]
    fn test_default_device_reads_scaled_metrics() {
        let slave = MockSlave {
            input: HashMap::from([
                (19, 245),
                (22, 41),
                (13, 120),
                (25, 40),
                (26, 0),
                (33, 4),
                (34, 0),
            ]),
            ..Default::default()
        };
        let bus = MockBus::new().with_slave(1, slave);
        let mut master = master_for(&bus);

        let config = Config::default();
        let mut device = RegisterMapDevice::from_config(&config.devices[0], 30).unwrap();
        let reading = device.read_metrics(&mut master, Utc::now());

        assert!(reading.failures.is_empty());
        let names: Vec<&str> = reading.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["supply_temperature", "humidity", "eaf_pressure", "analog_input_1"]
        );
        assert!((reading.metrics[0].value - 24.5).abs() < 1e-9);
        assert_eq!(reading.metrics[0].unit, "°C");
        // analog_input_1 is typed as Roomtemp1 by its type register
        assert!((reading.metrics[3].value - 4.0).abs() < 1e-9);
        assert_eq!(reading.metrics[3].unit, "°C");
    }

    #[test]
    fn test_failed_point_does_not_abort_others() {
        let slave = MockSlave {
            holding: HashMap::from([(10, 0x41C4), (11, 0x0000)]),
            ..Default::default()
        };
        let bus = MockBus::new().with_slave(3, slave);
        let mut master = ModbusMaster::new(
            bus.clone(),
            bus.clock(),
            MasterOptions {
                max_retries: 0,
                ..MasterOptions::default()
            },
        );

        let device_config = DeviceConfig {
            name: "meter".to_string(),
            slave_id: 3,
            enabled: true,
            register_offset: 0,
            points: vec![
                point("missing", RegisterKind::Holding, 50, DataType::U16),
                point("flow", RegisterKind::Holding, 10, DataType::F32),
            ],
            startup_writes: Vec::new(),
        };
        let mut device = RegisterMapDevice::from_config(&device_config, 30).unwrap();
        let reading = device.read_metrics(&mut master, Utc::now());

        assert_eq!(reading.failures.len(), 1);
        assert_eq!(reading.failures[0].point, "missing");
        assert_eq!(reading.metrics.len(), 1);
        assert_eq!(reading.metrics[0].value, 24.5);
    }

    #[test]
    fn test_type_register_timeout_is_reported_and_retried() {
        let slave = MockSlave {
            input: HashMap::from([(25, 215), (33, 2)]),
            ..Default::default()
        };
        let bus = MockBus::new().with_slave(1, slave);
        let mut master = ModbusMaster::new(
            bus.clone(),
            bus.clock(),
            MasterOptions {
                max_retries: 0,
                ..MasterOptions::default()
            },
        );
        let mut analog = point("analog_input_1", RegisterKind::Input, 25, DataType::U16);
        analog.signal_type_register = Some(33);
        let device_config = DeviceConfig {
            name: "unit".to_string(),
            slave_id: 1,
            enabled: true,
            register_offset: 0,
            points: vec![analog],
            startup_writes: Vec::new(),
        };
        let mut device = RegisterMapDevice::from_config(&device_config, 30).unwrap();

        bus.push_fault(Fault::Silence);
        let t0 = Utc::now();
        let first = device.read_metrics(&mut master, t0);
        assert!(first.metrics.is_empty());
        assert_eq!(first.failures.len(), 1);
        assert_eq!(first.failures[0].point, "analog_input_1");

        for secs in [2, 10, 28] {
            let reading = device.read_metrics(&mut master, t0 + Duration::seconds(secs));
            assert!(reading.failures.is_empty());
            assert_eq!(reading.metrics.len(), 1);
            assert!((reading.metrics[0].value - 21.5).abs() < 1e-9);
            assert_eq!(reading.metrics[0].unit, "°C");
        }
    }

    #[test]
    fn test_register_offset_and_startup_writes() {
        let slave = MockSlave {
            input: HashMap::from([(99, 7)]),
            holding: HashMap::from([(366, 0)]),
            ..Default::default()
        };
        let bus = MockBus::new().with_slave(1, slave);
        let mut master = master_for(&bus);

        let device_config = DeviceConfig {
            name: "unit".to_string(),
            slave_id: 1,
            enabled: true,
            register_offset: 1,
            points: vec![point("status", RegisterKind::Input, 100, DataType::U16)],
            startup_writes: vec![WriteConfig {
                address: 367,
                values: vec![3],
                description: "Start".to_string(),
            }],
        };
        let mut device = RegisterMapDevice::from_config(&device_config, 30).unwrap();
        device.run_startup_writes(&mut master).unwrap();
        assert_eq!(bus.holding(1, 366), Some(3));

        let reading = device.read_metrics(&mut master, Utc::now());
        assert_eq!(reading.metrics[0].value, 7.0);
    }

    #[test]
    fn test_offset_underflow_is_rejected() {
        let device_config = DeviceConfig {
            name: "unit".to_string(),
            slave_id: 1,
            enabled: true,
            register_offset: 1,
            points: Vec::new(),
            startup_writes: vec![WriteConfig {
                address: 0,
                values: vec![1],
                description: String::new(),
            }],
        };
        assert!(matches!(
            RegisterMapDevice::from_config(&device_config, 30),
            Err(ModbusError::ConfigError(_))
        ));
    }
}
