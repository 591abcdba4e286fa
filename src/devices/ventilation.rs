use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::fmt;

use crate::modbus::master::RegisterAccess;
use crate::modbus::protocol::RegisterKind;
use crate::utils::error::ModbusError;

/// Analog input signal assignment reported by the ventilation unit (type codes 0-19).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    NotUsed,
    OutdoorTemp,
    SupplyTemp,
    ExtractTemp,
    RoomTemp1,
    RoomTemp2,
    ExhaustTemp,
    ExtraSensor,
    SafPressure,
    EafPressure,
    DeicingTemp,
    FrostProtectionTemp,
    Co2,
    HumidityRoom,
    HumidityDuct,
    ExtraUnitTemp,
    ExternalSafControl,
    ExternalEafControl,
    SafPressure2,
    HumidityOutdoor,
    Unknown(u16),
}

impl From<u16> for SignalType {
    fn from(code: u16) -> Self {
        match code {
            0 => SignalType::NotUsed,
            1 => SignalType::OutdoorTemp,
            2 => SignalType::SupplyTemp,
            3 => SignalType::ExtractTemp,
            4 => SignalType::RoomTemp1,
            5 => SignalType::RoomTemp2,
            6 => SignalType::ExhaustTemp,
            7 => SignalType::ExtraSensor,
            8 => SignalType::SafPressure,
            9 => SignalType::EafPressure,
            10 => SignalType::DeicingTemp,
            11 => SignalType::FrostProtectionTemp,
            12 => SignalType::Co2,
            13 => SignalType::HumidityRoom,
            14 => SignalType::HumidityDuct,
            15 => SignalType::ExtraUnitTemp,
            16 => SignalType::ExternalSafControl,
            17 => SignalType::ExternalEafControl,
            18 => SignalType::SafPressure2,
            19 => SignalType::HumidityOutdoor,
            other => SignalType::Unknown(other),
        }
    }
}

impl SignalType {
    pub fn label(self) -> &'static str {
        match self {
            SignalType::NotUsed => "Not used",
            SignalType::OutdoorTemp => "Outdoortemp",
            SignalType::SupplyTemp => "Supplytemp",
            SignalType::ExtractTemp => "Extracttemp",
            SignalType::RoomTemp1 => "Roomtemp1",
            SignalType::RoomTemp2 => "Roomtemp2",
            SignalType::ExhaustTemp => "Exhausttemp",
            SignalType::ExtraSensor => "Extrasensor",
            SignalType::SafPressure => "SAF pressure",
            SignalType::EafPressure => "EAF pressure",
            SignalType::DeicingTemp => "Deicingtemp",
            SignalType::FrostProtectionTemp => "Frost prot.temp",
            SignalType::Co2 => "CO2",
            SignalType::HumidityRoom => "Humidity room",
            SignalType::HumidityDuct => "Humidity duct",
            SignalType::ExtraUnitTemp => "Extra unit temp",
            SignalType::ExternalSafControl => "External SAF control",
            SignalType::ExternalEafControl => "External EAF control",
            SignalType::SafPressure2 => "SAF pressure 2",
            SignalType::HumidityOutdoor => "Humidity outdoor",
            SignalType::Unknown(_) => "Unknown",
        }
    }

    /// Scale applied to the raw count and the resulting unit.
    pub fn scaling(self) -> (f64, &'static str) {
        match self {
            SignalType::OutdoorTemp
            | SignalType::SupplyTemp
            | SignalType::ExtractTemp
            | SignalType::RoomTemp1
            | SignalType::RoomTemp2
            | SignalType::ExhaustTemp
            | SignalType::DeicingTemp
            | SignalType::FrostProtectionTemp
            | SignalType::ExtraUnitTemp => (0.1, "°C"),
            SignalType::SafPressure | SignalType::EafPressure | SignalType::SafPressure2 => {
                (1.0, "Pa")
            }
            SignalType::HumidityRoom | SignalType::HumidityDuct | SignalType::HumidityOutdoor => {
                (1.0, "%RH")
            }
            SignalType::Co2 => (1.0, "ppm"),
            _ => (1.0, "units"),
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Analog channel whose meaning is read from a type register and re-read periodically.
#[derive(Debug, Clone)]
pub struct AnalogChannel {
    pub type_register: u16,
    signal: Option<SignalType>,
    refreshed_at: Option<DateTime<Utc>>,
    refresh_every: Duration,
}

impl AnalogChannel {
    pub fn new(type_register: u16, refresh_every: Duration) -> Self {
        Self {
            type_register,
            signal: None,
            refreshed_at: None,
            refresh_every,
        }
    }

    pub fn signal(&self) -> Option<SignalType> {
        self.signal
    }

    /// Re-reads the type register when it is due and returns the usable signal.
    ///
    /// `Ok(None)` means the channel is configured as not used. A failed re-read
    /// keeps the last known signal and is retried on the next call; it is only
    /// an error while no signal has ever been read.
    pub fn current_signal(
        &mut self,
        bus: &mut dyn RegisterAccess,
        slave_id: u8,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SignalType>, ModbusError> {
        let due = match self.refreshed_at {
            None => true,
            Some(at) => now - at >= self.refresh_every,
        };
        if due {
            match bus.read_registers(slave_id, RegisterKind::Input, self.type_register, 1) {
                Ok(values) => {
                    let signal = SignalType::from(values[0]);
                    info!(
                        "🏷️  {} type: code {} → {} (reg {})",
                        name, values[0], signal, self.type_register
                    );
                    self.signal = Some(signal);
                    self.refreshed_at = Some(now);
                }
                Err(e) => match self.signal {
                    Some(known) => {
                        warn!(
                            "⚠️  {} type re-read failed (reg {}), keeping {}: {}",
                            name, self.type_register, known, e
                        );
                    }
                    None => {
                        warn!(
                            "⚠️  {} type NOT AVAILABLE (reg {}): {}",
                            name, self.type_register, e
                        );
                        return Err(e);
                    }
                },
            }
        }

        match self.signal {
            Some(SignalType::NotUsed) => {
                debug!("{} is not used on this unit", name);
                Ok(None)
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct TableBus {
        input: HashMap<u16, u16>,
        reads: usize,
    }

    impl RegisterAccess for TableBus {
        fn read_registers(
            &mut self,
            _slave_id: u8,
            _kind: RegisterKind,
            start: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.reads += 1;
            (start..start + count)
                .map(|a| self.input.get(&a).copied().ok_or(ModbusError::Timeout))
                .collect()
        }

        fn write_registers(&mut self, _: u8, _: u16, _: &[u16]) -> Result<(), ModbusError> {
            Ok(())
        }
    }

    #[test]
    fn test_signal_scaling() {
        assert_eq!(SignalType::from(2).scaling(), (0.1, "°C"));
        assert_eq!(SignalType::from(9).scaling(), (1.0, "Pa"));
        assert_eq!(SignalType::from(12).scaling(), (1.0, "ppm"));
        assert_eq!(SignalType::from(14).scaling(), (1.0, "%RH"));
        assert_eq!(SignalType::from(42), SignalType::Unknown(42));
        assert_eq!(SignalType::from(42).scaling(), (1.0, "units"));
    }

    #[test]
    fn test_channel_refreshes_only_when_due() {
        let mut bus = TableBus {
            input: HashMap::from([(33, 2)]),
            reads: 0,
        };
        let mut channel = AnalogChannel::new(33, Duration::seconds(30));
        let t0 = Utc::now();

        let signal = |channel: &mut AnalogChannel, bus: &mut TableBus, secs| {
            channel
                .current_signal(bus, 1, "AI1", t0 + Duration::seconds(secs))
                .unwrap()
        };
        assert_eq!(signal(&mut channel, &mut bus, 0), Some(SignalType::SupplyTemp));
        assert_eq!(signal(&mut channel, &mut bus, 10), Some(SignalType::SupplyTemp));
        assert_eq!(bus.reads, 1);

        bus.input.insert(33, 9);
        assert_eq!(signal(&mut channel, &mut bus, 31), Some(SignalType::EafPressure));
        assert_eq!(bus.reads, 2);
    }

    #[test]
    fn test_unused_channel_is_skipped() {
        let mut bus = TableBus {
            input: HashMap::from([(34, 0)]),
            reads: 0,
        };
        let mut unused = AnalogChannel::new(34, Duration::seconds(30));
        assert_eq!(unused.current_signal(&mut bus, 1, "AI2", Utc::now()).unwrap(), None);
        assert_eq!(unused.signal(), Some(SignalType::NotUsed));
    }

    #[test]
    fn test_unreadable_type_is_an_error_until_first_read() {
        let mut bus = TableBus {
            input: HashMap::new(),
            reads: 0,
        };
        let mut channel = AnalogChannel::new(33, Duration::seconds(30));
        let t0 = Utc::now();

        assert!(matches!(
            channel.current_signal(&mut bus, 1, "AI1", t0),
            Err(ModbusError::Timeout)
        ));
        assert_eq!(channel.signal(), None);

        // retried on the next call instead of waiting for the refresh period
        bus.input.insert(33, 4);
        let next = channel.current_signal(&mut bus, 1, "AI1", t0 + Duration::seconds(2));
        assert_eq!(next.unwrap(), Some(SignalType::RoomTemp1));
        assert_eq!(bus.reads, 2);
    }

    #[test]
    fn test_failed_reread_keeps_known_signal() {
        let mut bus = TableBus {
            input: HashMap::from([(33, 9)]),
            reads: 0,
        };
        let mut channel = AnalogChannel::new(33, Duration::seconds(30));
        let t0 = Utc::now();
        channel.current_signal(&mut bus, 1, "AI1", t0).unwrap();

        bus.input.clear();
        let late = t0 + Duration::seconds(31);
        assert_eq!(
            channel.current_signal(&mut bus, 1, "AI1", late).unwrap(),
            Some(SignalType::EafPressure)
        );
        // still due, so the next call tries again
        let later = t0 + Duration::seconds(33);
        channel.current_signal(&mut bus, 1, "AI1", later).unwrap();
        assert_eq!(bus.reads, 3);
    }
}
