use log::{debug, info, warn};
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::protocol::{
    build_request, is_valid_slave_id, parse_response, response_length, OperationOutcome,
    RegisterKind, RegisterOperation,
};
use super::transport::{SerialTransport, Transport};
use crate::config::settings::{Config, Framing, SerialConfig};
use crate::utils::error::ModbusError;

/// Largest RTU frame the protocol allows.
const MAX_ADU_LEN: usize = 256;
/// Above 19200 baud the inter-frame delay is fixed instead of 3.5 characters.
const FIXED_T35_US: u64 = 1750;

/// Register read by the negotiation probe.
const PROBE_REGISTER: u16 = 0;

/// Register-level access used by devices; implemented by [`ModbusMaster`].
pub trait RegisterAccess {
    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    fn write_registers(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<(), ModbusError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterOptions {
    pub response_timeout: Duration,
    pub max_retries: u32,
    pub settle_delay: Duration,
    pub probe_timeout: Duration,
    pub scan_delay: Duration,
    pub pre_transmit_delay: Duration,
    pub min_guard: Duration,
    pub negotiate_attempts: u32,
    pub negotiate_settle: Duration,
    pub negotiate_attempt_delay: Duration,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            max_retries: 3,
            settle_delay: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(200),
            scan_delay: Duration::from_millis(100),
            pre_transmit_delay: Duration::ZERO,
            min_guard: Duration::from_micros(400),
            negotiate_attempts: 3,
            negotiate_settle: Duration::from_millis(50),
            negotiate_attempt_delay: Duration::from_millis(60),
        }
    }
}

impl MasterOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            response_timeout: Duration::from_millis(config.modbus.response_timeout_ms),
            max_retries: config.modbus.max_retries,
            settle_delay: Duration::from_millis(config.modbus.settle_delay_ms),
            probe_timeout: Duration::from_millis(config.modbus.probe_timeout_ms),
            scan_delay: Duration::from_millis(config.modbus.scan_delay_ms),
            pre_transmit_delay: Duration::from_micros(config.serial.pre_transmit_delay_us),
            min_guard: Duration::from_micros(config.serial.post_transmit_guard_us),
            negotiate_attempts: config.negotiation.attempts.max(1),
            negotiate_settle: Duration::from_millis(config.negotiation.settle_ms),
            negotiate_attempt_delay: Duration::from_millis(config.negotiation.attempt_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub transactions: u64,
    pub successes: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub invalid_frames: u64,
    pub exceptions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedLink {
    pub baud_rate: u32,
    pub framing: Framing,
    pub slave_id: u8,
}

/// t3.5 for the given line settings, never shorter than `min_guard`.
pub fn guard_time(baud_rate: u32, framing: Framing, min_guard: Duration) -> Duration {
    let t35 = if baud_rate > 19200 {
        Duration::from_micros(FIXED_T35_US)
    } else {
        let nanos = 3.5 * framing.bits_per_char() as f64 * 1e9 / baud_rate.max(1) as f64;
        Duration::from_nanos(nanos.round() as u64)
    };
    t35.max(min_guard)
}

/// Single-master Modbus RTU engine. Owns the transport; every call runs one
/// complete exchange (plus retries) before returning.
pub struct ModbusMaster<T: Transport, C: Clock = SystemClock> {
    transport: T,
    clock: C,
    options: MasterOptions,
    stats: TransactionStats,
    last_frame_end: Option<Duration>,
    last_slave: Option<u8>,
}

impl ModbusMaster<SerialTransport, SystemClock> {
    /// Opens the serial port; failure here is fatal for the caller.
    pub fn configure(serial: &SerialConfig, options: MasterOptions) -> Result<Self, ModbusError> {
        let transport = SerialTransport::open(serial)?;
        Ok(Self::new(transport, SystemClock::new(), options))
    }
}

impl<T: Transport, C: Clock> ModbusMaster<T, C> {
    pub fn new(transport: T, clock: C, options: MasterOptions) -> Self {
        Self {
            transport,
            clock,
            options,
            stats: TransactionStats::default(),
            last_frame_end: None,
            last_slave: None,
        }
    }

    pub fn options(&self) -> &MasterOptions {
        &self.options
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn guard_time(&self) -> Duration {
        guard_time(
            self.transport.baud_rate(),
            self.transport.framing(),
            self.options.min_guard,
        )
    }

    pub fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let operation = kind.read_operation(start, count);
        self.execute(slave_id, &operation).map(OperationOutcome::into_values)
    }

    /// One value goes out as function 0x06, several as 0x10.
    pub fn write_registers(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        if values.is_empty() {
            return Err(ModbusError::InvalidData("Nothing to write".to_string()));
        }
        let operation = RegisterOperation::write_holding(start, values);
        self.execute(slave_id, &operation).map(|_| ())
    }

    pub fn write_coil(
        &mut self,
        slave_id: u8,
        address: u16,
        value: bool,
    ) -> Result<(), ModbusError> {
        let operation = RegisterOperation::WriteSingleCoil { address, value };
        self.execute(slave_id, &operation).map(|_| ())
    }

    /// Runs `operation`, re-issuing it on timeout or frame errors up to `max_retries` times.
    pub fn execute(
        &mut self,
        slave_id: u8,
        operation: &RegisterOperation,
    ) -> Result<OperationOutcome, ModbusError> {
        validate_request(slave_id, operation)?;
        let frame = build_request(slave_id, operation);
        let timeout = self.options.response_timeout;

        let mut retries = 0;
        loop {
            match self.transact(slave_id, operation, &frame, timeout) {
                Err(e) if e.is_retryable() && retries < self.options.max_retries => {
                    retries += 1;
                    self.stats.retries += 1;
                    warn!(
                        "🔁 Slave {} {}: {} (retry {}/{})",
                        slave_id, operation, e, retries, self.options.max_retries
                    );
                }
                result => return result,
            }
        }
    }

    /// Probes addresses in order and stops at the first one that answers at all.
    pub fn scan_for_slave<I>(&mut self, kind: RegisterKind, start: u16, ids: I) -> Option<u8>
    where
        I: IntoIterator<Item = u8>,
    {
        let operation = kind.read_operation(start, 1);
        if let Err(e) = operation.validate() {
            warn!("❌ Cannot scan with {}: {}", operation, e);
            return None;
        }

        for slave_id in ids {
            if !is_valid_slave_id(slave_id) {
                continue;
            }
            match self.probe(slave_id, &operation) {
                Ok(outcome) => {
                    info!(
                        "✅ Found slave {} ({} = {:?})",
                        slave_id,
                        operation,
                        outcome.into_values()
                    );
                    return Some(slave_id);
                }
                Err(e) if e.is_bus_response() => {
                    info!("✅ Found slave {} (answered {})", slave_id, e);
                    return Some(slave_id);
                }
                Err(e) => debug!("📵 No response from slave {}: {}", slave_id, e),
            }
            self.clock.delay(self.options.scan_delay);
        }

        info!("📵 Scan complete, no slave found");
        None
    }

    /// Tries every baud/framing/id combination until one yields a valid frame.
    /// The transport stays at the winning settings, or is restored when none answers.
    pub fn auto_negotiate_framing(
        &mut self,
        baud_rates: &[u32],
        framings: &[Framing],
        slave_ids: &[u8],
    ) -> Option<NegotiatedLink> {
        let original = (self.transport.baud_rate(), self.transport.framing());
        let operation = RegisterKind::Input.read_operation(PROBE_REGISTER, 1);
        info!("🔍 Auto-probing Modbus (baud/parity/ID)...");

        for &baud_rate in baud_rates {
            for &framing in framings {
                if let Err(e) = self.transport.reconfigure(baud_rate, framing) {
                    warn!("⚠️  Cannot switch to {} {}: {}", baud_rate, framing, e);
                    continue;
                }
                self.last_frame_end = None;

                for &slave_id in slave_ids.iter().filter(|&&id| is_valid_slave_id(id)) {
                    debug!("   Trying {}-{}, ID={}", baud_rate, framing, slave_id);
                    if self.probe_combination(slave_id, &operation) {
                        let link = NegotiatedLink {
                            baud_rate,
                            framing,
                            slave_id,
                        };
                        info!("🔒 LOCKED: {}-{} ID={}", baud_rate, framing, slave_id);
                        return Some(link);
                    }
                }
            }
        }

        warn!(
            "❌ Auto-probing failed. Check wiring, A/B polarity, termination and register addresses"
        );
        if let Err(e) = self.transport.reconfigure(original.0, original.1) {
            warn!("⚠️  Could not restore {} {}: {}", original.0, original.1, e);
        }
        None
    }

    fn probe_combination(&mut self, slave_id: u8, operation: &RegisterOperation) -> bool {
        self.clock.delay(self.options.negotiate_settle);
        if let Err(e) = self.transport.clear_input() {
            debug!("Could not clear receive buffer: {}", e);
        }

        let attempts = self.options.negotiate_attempts.max(1);
        for attempt in 1..=attempts {
            match self.probe(slave_id, operation) {
                Ok(_) => return true,
                Err(e) if e.is_bus_response() => return true,
                Err(_) if attempt < attempts => {
                    self.clock.delay(self.options.negotiate_attempt_delay)
                }
                Err(_) => {}
            }
        }
        false
    }

    /// One attempt with the short probe timeout, no retries.
    fn probe(
        &mut self,
        slave_id: u8,
        operation: &RegisterOperation,
    ) -> Result<OperationOutcome, ModbusError> {
        let frame = build_request(slave_id, operation);
        let timeout = self.options.probe_timeout;
        self.transact(slave_id, operation, &frame, timeout)
    }

    fn transact(
        &mut self,
        slave_id: u8,
        operation: &RegisterOperation,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<OperationOutcome, ModbusError> {
        self.stats.transactions += 1;
        self.wait_for_bus(slave_id);

        let result = self
            .transport
            .clear_input()
            .and_then(|_| self.send_frame(frame))
            .and_then(|_| self.receive_frame(operation, timeout))
            .and_then(|response| parse_response(slave_id, operation, &response));

        self.last_frame_end = Some(self.clock.now());
        self.last_slave = Some(slave_id);
        self.record(&result);
        result
    }

    /// Bus silence before the next request: t3.5 always, the settle delay for the same slave.
    fn wait_for_bus(&mut self, slave_id: u8) {
        let Some(last_end) = self.last_frame_end else {
            return;
        };
        let mut required = self.guard_time();
        if self.last_slave == Some(slave_id) {
            required = required.max(self.options.settle_delay);
        }
        let elapsed = self.clock.now().saturating_sub(last_end);
        if elapsed < required {
            self.clock.delay(required - elapsed);
        }
    }

    /// Drives the line to transmit only around the write; it is released even when sending fails.
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), ModbusError> {
        debug!("📤 TX [{}]", hex::encode(frame));
        let sent = self
            .transport
            .set_transmit_mode()
            .and_then(|_| self.transmit(frame));
        let released = self.transport.set_receive_mode();
        sent.and(released)
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), ModbusError> {
        self.clock.delay(self.options.pre_transmit_delay);
        self.transport.write_all(frame)?;
        self.transport.flush()?;
        self.clock.delay(self.guard_time());
        Ok(())
    }

    fn receive_frame(
        &mut self,
        operation: &RegisterOperation,
        timeout: Duration,
    ) -> Result<Vec<u8>, ModbusError> {
        let deadline = self.clock.now() + timeout;
        let mut response = Vec::with_capacity(operation.expected_response_len());
        let mut buffer = [0u8; MAX_ADU_LEN];

        loop {
            if let Some(expected) = response_length(&response, operation) {
                if response.len() >= expected {
                    response.truncate(expected);
                    debug!("📥 RX [{}]", hex::encode(&response));
                    return Ok(response);
                }
            }
            if response.len() > MAX_ADU_LEN {
                return Err(ModbusError::InvalidResponse(format!(
                    "frame exceeds {} bytes",
                    MAX_ADU_LEN
                )));
            }
            if self.clock.now() >= deadline {
                if response.is_empty() {
                    return Err(ModbusError::Timeout);
                }
                debug!("📥 Partial RX [{}]", hex::encode(&response));
                return Err(ModbusError::InvalidResponse(format!(
                    "truncated frame ({} bytes) after {:?}",
                    response.len(),
                    timeout
                )));
            }

            let n = self.transport.read(&mut buffer)?;
            response.extend_from_slice(&buffer[..n]);
        }
    }

    fn record(&mut self, result: &Result<OperationOutcome, ModbusError>) {
        match result {
            Ok(_) => self.stats.successes += 1,
            Err(ModbusError::Timeout) => self.stats.timeouts += 1,
            Err(ModbusError::CrcError) => self.stats.crc_errors += 1,
            Err(ModbusError::InvalidResponse(_)) => self.stats.invalid_frames += 1,
            Err(ModbusError::Exception { .. }) => self.stats.exceptions += 1,
            Err(_) => {}
        }
    }
}

impl<T: Transport, C: Clock> RegisterAccess for ModbusMaster<T, C> {
    fn read_registers(
        &mut self,
        slave_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        ModbusMaster::read_registers(self, slave_id, kind, start, count)
    }

    fn write_registers(
        &mut self,
        slave_id: u8,
        start: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        ModbusMaster::write_registers(self, slave_id, start, values)
    }
}

fn validate_request(slave_id: u8, operation: &RegisterOperation) -> Result<(), ModbusError> {
    if !is_valid_slave_id(slave_id) {
        return Err(ModbusError::InvalidDevice(slave_id));
    }
    operation.validate()
}
