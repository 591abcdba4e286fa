use log::{debug, error, info};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::config::settings::{DirectionLine, Framing, ParityConfig, SerialConfig};
use crate::utils::error::ModbusError;

/// RS-485 driver/receiver enable, switched by the master around each request.
pub trait DirectionControl {
    fn set_transmit_mode(&mut self) -> Result<(), ModbusError>;
    fn set_receive_mode(&mut self) -> Result<(), ModbusError>;
}

/// Half-duplex byte channel owned by a single master.
pub trait Transport: DirectionControl {
    fn write_all(&mut self, frame: &[u8]) -> Result<(), ModbusError>;

    /// Blocks until the last byte has left the transmit shift register.
    fn flush(&mut self) -> Result<(), ModbusError>;

    /// Returns `Ok(0)` when nothing arrived within one read slice.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ModbusError>;

    /// Drops stale bytes waiting in the receive buffer.
    fn clear_input(&mut self) -> Result<(), ModbusError>;

    fn reconfigure(&mut self, baud_rate: u32, framing: Framing) -> Result<(), ModbusError>;

    fn baud_rate(&self) -> u32;

    fn framing(&self) -> Framing;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    port_name: String,
    baud_rate: u32,
    framing: Framing,
    direction: DirectionLine,
    invert_direction: bool,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> Result<Self, ModbusError> {
        info!("🔌 Opening Modbus RTU port: {}", config.port);
        info!(
            "⚙️  Configuration: {} baud, {}, direction line {:?}{}",
            config.baud_rate,
            config.framing,
            config.direction,
            if config.invert_direction { " (inverted)" } else { "" }
        );

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(data_bits(config.framing.data_bits)?)
            .parity(parity(config.framing.parity))
            .stop_bits(stop_bits(config.framing.stop_bits)?)
            .timeout(Duration::from_millis(config.read_timeout_ms.max(1)))
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", config.port, e);
                ModbusError::ConfigError(format!(
                    "Cannot open {} at {} {}: {}",
                    config.port, config.baud_rate, config.framing, e
                ))
            })?;

        let mut transport = Self {
            port,
            port_name: config.port.clone(),
            baud_rate: config.baud_rate,
            framing: config.framing,
            direction: config.direction,
            invert_direction: config.invert_direction,
        };

        // Start in receive mode
        transport
            .set_receive_mode()
            .map_err(|e| ModbusError::ConfigError(format!("Cannot drive direction line: {}", e)))?;

        info!("✅ Modbus RTU port {} ready", transport.port_name);
        Ok(transport)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn drive_direction(&mut self, transmit: bool) -> Result<(), ModbusError> {
        let level = transmit != self.invert_direction;
        match self.direction {
            DirectionLine::Rts => self.port.write_request_to_send(level)?,
            DirectionLine::Dtr => self.port.write_data_terminal_ready(level)?,
            DirectionLine::None => {}
        }
        Ok(())
    }
}

impl DirectionControl for SerialTransport {
    fn set_transmit_mode(&mut self) -> Result<(), ModbusError> {
        self.drive_direction(true)
    }

    fn set_receive_mode(&mut self) -> Result<(), ModbusError> {
        self.drive_direction(false)
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, frame: &[u8]) -> Result<(), ModbusError> {
        self.port
            .write_all(frame)
            .map_err(|e| ModbusError::CommunicationError(format!("Write failed: {}", e)))
    }

    fn flush(&mut self) -> Result<(), ModbusError> {
        self.port
            .flush()
            .map_err(|e| ModbusError::CommunicationError(format!("Flush failed: {}", e)))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ModbusError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(ref e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(ModbusError::CommunicationError(format!("Read failed: {}", e))),
        }
    }

    fn clear_input(&mut self) -> Result<(), ModbusError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn reconfigure(&mut self, baud_rate: u32, framing: Framing) -> Result<(), ModbusError> {
        debug!("🔧 Reconfiguring {} to {} {}", self.port_name, baud_rate, framing);
        self.port.set_baud_rate(baud_rate)?;
        self.port.set_data_bits(data_bits(framing.data_bits)?)?;
        self.port.set_parity(parity(framing.parity))?;
        self.port.set_stop_bits(stop_bits(framing.stop_bits)?)?;
        self.baud_rate = baud_rate;
        self.framing = framing;
        self.clear_input()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn framing(&self) -> Framing {
        self.framing
    }
}

fn data_bits(bits: u8) -> Result<serialport::DataBits, ModbusError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(ModbusError::ConfigError(format!("Unsupported data bits: {}", other))),
    }
}

fn parity(parity: ParityConfig) -> serialport::Parity {
    match parity {
        ParityConfig::None => serialport::Parity::None,
        ParityConfig::Even => serialport::Parity::Even,
        ParityConfig::Odd => serialport::Parity::Odd,
    }
}

fn stop_bits(bits: u8) -> Result<serialport::StopBits, ModbusError> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(ModbusError::ConfigError(format!("Unsupported stop bits: {}", other))),
    }
}

/// One line per serial port found on the host, with USB details when known.
pub fn describe_available_ports() -> Result<Vec<String>, ModbusError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => format!(
                "{} (USB {:04x}:{:04x}{}{})",
                port.port_name,
                usb.vid,
                usb.pid,
                usb.manufacturer.map(|m| format!(", {}", m)).unwrap_or_default(),
                usb.serial_number.map(|s| format!(", serial {}", s)).unwrap_or_default(),
            ),
            SerialPortType::PciPort => format!("{} (PCI)", port.port_name),
            SerialPortType::BluetoothPort => format!("{} (Bluetooth)", port.port_name),
            SerialPortType::Unknown => port.port_name,
        })
        .collect())
}
