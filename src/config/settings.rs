use clap::ArgMatches;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::modbus::protocol::{is_valid_slave_id, RegisterKind, MAX_WRITE_REGISTERS};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Edge node identification
    pub edge_uuid: String,
    pub edge_name: String,

    pub serial: SerialConfig,
    pub modbus: ModbusSettings,
    pub polling: PollingConfig,
    pub negotiation: NegotiationConfig,
    pub publish: PublishConfig,

    // Device configuration
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub framing: Framing,
    /// Blocking slice for a single read call; the response timeout is enforced on top.
    pub read_timeout_ms: u64,
    pub direction: DirectionLine,
    /// Drive the line low for transmit (adapters with inverted RTS wiring).
    pub invert_direction: bool,
    /// Driver settle time between enabling the driver and the first byte.
    pub pre_transmit_delay_us: u64,
    /// Minimum guard after the last byte; t3.5 is used when it is longer.
    pub post_transmit_guard_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusSettings {
    pub response_timeout_ms: u64,
    pub max_retries: u32,
    /// Pause between consecutive transactions to the same slave.
    pub settle_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub scan_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub hold_last_value: bool,
    pub type_refresh_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub on_startup: bool,
    pub baud_rates: Vec<u32>,
    pub framings: Vec<Framing>,
    pub slave_ids: Vec<u8>,
    pub attempts: u32,
    pub settle_ms: u64,
    pub attempt_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub group_id: String,
    pub node_id: String,
    pub format: String,
    pub output_file: Option<String>,
    pub emit_birth: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub slave_id: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Subtracted from every configured address (1 for devices documented with 1-based numbers).
    #[serde(default)]
    pub register_offset: u16,
    #[serde(default)]
    pub points: Vec<PointConfig>,
    #[serde(default)]
    pub startup_writes: Vec<WriteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointConfig {
    pub name: String,
    pub kind: RegisterKind,
    pub address: u16,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
    /// Input register holding the analog signal type code (0-19) for this channel.
    #[serde(default)]
    pub signal_type_register: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConfig {
    pub address: u16,
    pub values: Vec<u16>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
}

impl DataType {
    pub fn register_count(self) -> u16 {
        match self {
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            _ => 1,
        }
    }

    pub fn sparkplug_name(self) -> &'static str {
        match self {
            DataType::Bool => "Boolean",
            _ => "Float",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionLine {
    #[default]
    Rts,
    Dtr,
    /// Auto-direction transceiver, nothing to toggle.
    None,
}

/// Character format such as 8N1 or 8E1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Framing {
    pub data_bits: u8,
    pub parity: ParityConfig,
    pub stop_bits: u8,
}

impl Framing {
    pub const EIGHT_N_ONE: Framing = Framing {
        data_bits: 8,
        parity: ParityConfig::None,
        stop_bits: 1,
    };
    pub const EIGHT_E_ONE: Framing = Framing {
        data_bits: 8,
        parity: ParityConfig::Even,
        stop_bits: 1,
    };
    pub const EIGHT_O_ONE: Framing = Framing {
        data_bits: 8,
        parity: ParityConfig::Odd,
        stop_bits: 1,
    };

    /// Start bit + data + parity + stop bits.
    pub fn bits_per_char(&self) -> u32 {
        let parity = if self.parity == ParityConfig::None { 0 } else { 1 };
        1 + self.data_bits as u32 + parity + self.stop_bits as u32
    }
}

impl Default for Framing {
    fn default() -> Self {
        Framing::EIGHT_N_ONE
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            ParityConfig::None => 'N',
            ParityConfig::Even => 'E',
            ParityConfig::Odd => 'O',
        };
        write!(f, "{}{}{}", self.data_bits, parity, self.stop_bits)
    }
}

impl FromStr for Framing {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let chars: Vec<char> = s.trim().to_ascii_uppercase().chars().collect();
        let invalid =
            || ModbusError::ConfigError(format!("Invalid framing '{}' (expected e.g. 8N1)", s));
        if chars.len() != 3 {
            return Err(invalid());
        }
        let data_bits = chars[0].to_digit(10).ok_or_else(invalid)? as u8;
        let parity = match chars[1] {
            'N' => ParityConfig::None,
            'E' => ParityConfig::Even,
            'O' => ParityConfig::Odd,
            _ => return Err(invalid()),
        };
        let stop_bits = chars[2].to_digit(10).ok_or_else(invalid)? as u8;
        if !(5..=8).contains(&data_bits) || !(1..=2).contains(&stop_bits) {
            return Err(invalid());
        }
        Ok(Framing {
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl TryFrom<String> for Framing {
    type Error = ModbusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Framing> for String {
    fn from(framing: Framing) -> Self {
        framing.to_string()
    }
}

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

impl Default for SerialConfig {
    fn default() -> Self {
        let port = if cfg!(target_os = "windows") {
            "COM1"
        } else {
            "/dev/ttyUSB0"
        };
        Self {
            port: port.to_string(),
            baud_rate: 9600,
            framing: Framing::EIGHT_N_ONE,
            read_timeout_ms: 20,
            direction: DirectionLine::Rts,
            invert_direction: false,
            pre_transmit_delay_us: 0,
            post_transmit_guard_us: 400,
        }
    }
}

impl Default for ModbusSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            max_retries: 3,
            settle_delay_ms: 50,
            probe_timeout_ms: 200,
            scan_delay_ms: 100,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 2,
            hold_last_value: false,
            type_refresh_seconds: 30,
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            on_startup: false,
            baud_rates: vec![4800, 9600, 19200, 38400],
            framings: vec![Framing::EIGHT_N_ONE, Framing::EIGHT_E_ONE, Framing::EIGHT_O_ONE],
            slave_ids: (1..=16).collect(),
            attempts: 3,
            settle_ms: 50,
            attempt_delay_ms: 60,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            group_id: "officeb".to_string(),
            node_id: "ventilationchamber2".to_string(),
            format: "json".to_string(),
            output_file: None,
            emit_birth: true,
        }
    }
}

fn input_point(name: &str, address: u16, scale: f64, unit: &str) -> PointConfig {
    PointConfig {
        name: name.to_string(),
        kind: RegisterKind::Input,
        address,
        data_type: DataType::U16,
        scale,
        offset: 0.0,
        unit: unit.to_string(),
        signal_type_register: None,
    }
}

impl Default for Config {
    fn default() -> Self {
        // Ventilation unit: code addresses are the documented 1-based numbers minus one.
        let mut analog_1 = input_point("analog_input_1", 25, 1.0, "");
        analog_1.signal_type_register = Some(33);
        let mut analog_2 = input_point("analog_input_2", 26, 1.0, "");
        analog_2.signal_type_register = Some(34);

        let ventilation = DeviceConfig {
            name: "olimextemp".to_string(),
            slave_id: 1,
            enabled: true,
            register_offset: 0,
            points: vec![
                input_point("supply_temperature", 19, 0.1, "°C"),
                input_point("humidity", 22, 1.0, "%RH"),
                input_point("eaf_pressure", 13, 1.0, "Pa"),
                analog_1,
                analog_2,
            ],
            startup_writes: vec![WriteConfig {
                address: 367,
                values: vec![3],
                description: "Start ventilation".to_string(),
            }],
        };

        Self {
            edge_uuid: Uuid::new_v4().to_string(),
            edge_name: "RS485 Edge Poller".to_string(),
            serial: SerialConfig::default(),
            modbus: ModbusSettings::default(),
            polling: PollingConfig::default(),
            negotiation: NegotiationConfig::default(),
            publish: PublishConfig::default(),
            devices: vec![ventilation],
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::ConfigError(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&content)?;

        // Generate edge UUID if not present
        if config.edge_uuid.is_empty() {
            config.edge_uuid = Uuid::new_v4().to_string();
        }

        config.validate()?;
        info!(
            "📄 Loaded configuration from {} ({} devices)",
            path.display(),
            config.devices.len()
        );
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        // Create directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides loaded settings with explicit command line values.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ModbusError> {
        if let Some(port) = matches.get_one::<String>("port") {
            self.serial.port = port.clone();
        }
        if let Some(baud) = matches.get_one::<String>("baud") {
            self.serial.baud_rate = baud
                .parse()
                .map_err(|_| ModbusError::ConfigError(format!("Invalid baud rate '{}'", baud)))?;
        }
        if let Some(framing) = matches.get_one::<String>("framing") {
            self.serial.framing = framing.parse()?;
        }
        if let Some(interval) = matches.get_one::<String>("interval") {
            self.polling.interval_seconds = interval
                .parse()
                .map_err(|_| ModbusError::ConfigError(format!("Invalid interval '{}'", interval)))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.serial.baud_rate == 0 {
            return Err(ModbusError::ConfigError("Baud rate must be positive".to_string()));
        }
        if self.polling.interval_seconds == 0 {
            return Err(ModbusError::ConfigError(
                "Polling interval must be at least 1 second".to_string(),
            ));
        }

        for device in &self.devices {
            if !is_valid_slave_id(device.slave_id) {
                return Err(ModbusError::ConfigError(format!(
                    "Device '{}' has slave id {} outside 1-247",
                    device.name, device.slave_id
                )));
            }
            for point in &device.points {
                if point.name.trim().is_empty() {
                    return Err(ModbusError::ConfigError(format!(
                        "Device '{}' has a point without a name",
                        device.name
                    )));
                }
                if point.kind.is_bit() && point.data_type != DataType::Bool {
                    return Err(ModbusError::ConfigError(format!(
                        "Point '{}' reads {} bits and must use data_type = \"bool\"",
                        point.name, point.kind
                    )));
                }
                if point.address < device.register_offset {
                    return Err(ModbusError::ConfigError(format!(
                        "Point '{}' address {} is below the device register offset {}",
                        point.name, point.address, device.register_offset
                    )));
                }
            }
            for write in &device.startup_writes {
                if write.values.is_empty() || write.values.len() > MAX_WRITE_REGISTERS as usize {
                    return Err(ModbusError::ConfigError(format!(
                        "Startup write to {} on '{}' must carry 1-{} values",
                        write.address, device.name, MAX_WRITE_REGISTERS
                    )));
                }
            }
        }

        if self.get_enabled_devices().is_empty() {
            warn!("⚠️  No enabled devices configured");
        }
        Ok(())
    }

    // Get list of enabled devices
    pub fn get_enabled_devices(&self) -> Vec<&DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled).collect()
    }

    pub fn get_device_by_slave_id(&self, slave_id: u8) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.slave_id == slave_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_parse_and_display() {
        let framing: Framing = "8e1".parse().unwrap();
        assert_eq!(framing, Framing::EIGHT_E_ONE);
        assert_eq!(framing.to_string(), "8E1");
        assert_eq!(framing.bits_per_char(), 11);
        assert_eq!(Framing::EIGHT_N_ONE.bits_per_char(), 10);
        assert!("9N1".parse::<Framing>().is_err());
        assert!("8X1".parse::<Framing>().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.devices[0].startup_writes[0].address, 367);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poller.toml");

        let config = Config::default();
        config.save_to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let toml_text = r#"
            [serial]
            port = "/dev/ttyS1"
            framing = "8E1"

            [[devices]]
            name = "vent"
            slave_id = 3
            register_offset = 1

            [[devices.points]]
            name = "supply_temperature"
            kind = "input"
            address = 20
            scale = 0.1
            unit = "°C"
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.framing, Framing::EIGHT_E_ONE);
        assert_eq!(config.devices[0].points[0].data_type, DataType::U16);
        assert!(config.devices[0].enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_slave_id() {
        let mut config = Config::default();
        config.devices[0].slave_id = 0;
        assert!(matches!(config.validate(), Err(ModbusError::ConfigError(_))));
        config.devices[0].slave_id = 248;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_offset_underflow() {
        let mut config = Config::default();
        config.devices[0].register_offset = 20;
        assert!(config.validate().is_err());
    }
}
