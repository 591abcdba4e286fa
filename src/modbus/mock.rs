//! In-memory RS-485 bus with simulated slaves and a virtual clock, for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::clock::Clock;
use super::crc::{append_crc, frame_crc_ok};
use super::protocol::ExceptionCode;
use super::transport::{DirectionControl, Transport};
use crate::config::settings::Framing;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Default)]
pub struct MockClock {
    now: Arc<Mutex<Duration>>,
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn delay(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockSlave {
    pub holding: HashMap<u16, u16>,
    pub input: HashMap<u16, u16>,
    pub discrete: HashMap<u16, bool>,
    pub coils: HashMap<u16, bool>,
}

/// Misbehaviour applied to the next answered request.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Silence,
    CorruptCrc,
    Truncate(usize),
    Exception(ExceptionCode),
}

#[derive(Debug, Clone)]
pub struct Transmission {
    pub start: Duration,
    pub end: Duration,
    pub frame: Vec<u8>,
    pub driver_enabled: bool,
}

#[derive(Debug)]
struct BusState {
    slaves: HashMap<u8, MockSlave>,
    faults: VecDeque<Fault>,
    transmitting: bool,
    fail_next_write: bool,
    tx_start: Option<Duration>,
    pending_tx: Vec<u8>,
    rx: VecDeque<u8>,
    baud_rate: u32,
    framing: Framing,
    required_link: Option<(u32, Framing)>,
    transitions: Vec<(Duration, bool)>,
    transmissions: Vec<Transmission>,
    requests: HashMap<u8, usize>,
    consumed_at: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct MockBus {
    clock: MockClock,
    state: Arc<Mutex<BusState>>,
}

const READ_SLICE: Duration = Duration::from_millis(5);

impl MockBus {
    pub fn new() -> Self {
        Self {
            clock: MockClock::default(),
            state: Arc::new(Mutex::new(BusState {
                slaves: HashMap::new(),
                faults: VecDeque::new(),
                transmitting: false,
                fail_next_write: false,
                tx_start: None,
                pending_tx: Vec::new(),
                rx: VecDeque::new(),
                baud_rate: 9600,
                framing: Framing::EIGHT_N_ONE,
                required_link: None,
                transitions: Vec::new(),
                transmissions: Vec::new(),
                requests: HashMap::new(),
                consumed_at: Vec::new(),
            })),
        }
    }

    pub fn with_slave(self, slave_id: u8, slave: MockSlave) -> Self {
        self.state().slaves.insert(slave_id, slave);
        self
    }

    /// Slaves only understand frames sent at this baud rate and framing.
    pub fn with_required_link(self, baud_rate: u32, framing: Framing) -> Self {
        self.state().required_link = Some((baud_rate, framing));
        self
    }

    pub fn clock(&self) -> MockClock {
        self.clock.clone()
    }

    pub fn push_fault(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    pub fn fail_next_write(&self) {
        self.state().fail_next_write = true;
    }

    pub fn transitions(&self) -> Vec<(Duration, bool)> {
        self.state().transitions.clone()
    }

    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state().transmissions.clone()
    }

    pub fn responses_consumed_at(&self) -> Vec<Duration> {
        self.state().consumed_at.clone()
    }

    pub fn is_transmitting(&self) -> bool {
        self.state().transmitting
    }

    pub fn requests_to(&self, slave_id: u8) -> usize {
        self.state().requests.get(&slave_id).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.state().requests.values().sum()
    }

    pub fn holding(&self, slave_id: u8, address: u16) -> Option<u16> {
        self.state()
            .slaves
            .get(&slave_id)
            .and_then(|slave| slave.holding.get(&address).copied())
    }

    pub fn set_input(&self, slave_id: u8, address: u16, value: u16) {
        if let Some(slave) = self.state().slaves.get_mut(&slave_id) {
            slave.input.insert(address, value);
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectionControl for MockBus {
    fn set_transmit_mode(&mut self) -> Result<(), ModbusError> {
        let now = self.clock.now();
        let mut state = self.state();
        state.transmitting = true;
        state.transitions.push((now, true));
        Ok(())
    }

    fn set_receive_mode(&mut self) -> Result<(), ModbusError> {
        let now = self.clock.now();
        let mut state = self.state();
        state.transmitting = false;
        state.transitions.push((now, false));
        Ok(())
    }
}

impl Transport for MockBus {
    fn write_all(&mut self, frame: &[u8]) -> Result<(), ModbusError> {
        let now = self.clock.now();
        let mut state = self.state();
        if state.fail_next_write {
            state.fail_next_write = false;
            return Err(ModbusError::CommunicationError("Write failed: device unplugged".into()));
        }
        state.tx_start.get_or_insert(now);
        state.pending_tx.extend_from_slice(frame);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ModbusError> {
        let (frame, bits, baud) = {
            let mut state = self.state();
            let frame = std::mem::take(&mut state.pending_tx);
            (frame, state.framing.bits_per_char(), state.baud_rate)
        };
        let nanos = frame.len() as u64 * bits as u64 * 1_000_000_000 / baud as u64;
        self.clock.delay(Duration::from_nanos(nanos));

        let end = self.clock.now();
        let mut state = self.state();
        let start = state.tx_start.take().unwrap_or(end);
        let driver_enabled = state.transmitting;
        state.transmissions.push(Transmission {
            start,
            end,
            frame: frame.clone(),
            driver_enabled,
        });
        if let Some(response) = state.answer(&frame) {
            state.rx.extend(response);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ModbusError> {
        let now = self.clock.now();
        let mut state = self.state();
        if state.transmitting || state.rx.is_empty() {
            drop(state);
            self.clock.delay(READ_SLICE);
            return Ok(0);
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap_or_default();
        }
        if state.rx.is_empty() {
            state.consumed_at.push(now);
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> Result<(), ModbusError> {
        self.state().rx.clear();
        Ok(())
    }

    fn reconfigure(&mut self, baud_rate: u32, framing: Framing) -> Result<(), ModbusError> {
        let mut state = self.state();
        state.baud_rate = baud_rate;
        state.framing = framing;
        state.rx.clear();
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.state().baud_rate
    }

    fn framing(&self) -> Framing {
        self.state().framing
    }
}

impl BusState {
    fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 4 || !frame_crc_ok(request) {
            return None;
        }
        let slave_id = request[0];
        *self.requests.entry(slave_id).or_insert(0) += 1;

        if let Some(link) = self.required_link {
            if link != (self.baud_rate, self.framing) {
                return None;
            }
        }
        let slave = self.slaves.get_mut(&slave_id)?;
        let pdu = &request[1..request.len() - 2];

        let fault = self.faults.pop_front();
        let body = match fault {
            Some(Fault::Silence) => return None,
            Some(Fault::Exception(code)) => Err(code),
            _ => slave.handle(pdu),
        };

        let mut response = vec![slave_id];
        match body {
            Ok(data) => response.extend_from_slice(&data),
            Err(code) => response.extend_from_slice(&[pdu[0] | 0x80, code.code()]),
        }
        append_crc(&mut response);

        match fault {
            Some(Fault::CorruptCrc) => {
                let last = response.len() - 1;
                response[last] ^= 0xFF;
            }
            Some(Fault::Truncate(len)) => response.truncate(len),
            _ => {}
        }
        Some(response)
    }
}

impl MockSlave {
    fn handle(&mut self, pdu: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let function = pdu[0];
        let word = |i: usize| u16::from_be_bytes([pdu[i], pdu[i + 1]]);
        match function {
            0x03 | 0x04 => {
                let (start, count) = (word(1), word(3));
                let table = if function == 0x03 { &self.holding } else { &self.input };
                let mut data = vec![function, (count * 2) as u8];
                for address in start..start + count {
                    let value = table.get(&address).ok_or(ExceptionCode::IllegalDataAddress)?;
                    data.extend_from_slice(&value.to_be_bytes());
                }
                Ok(data)
            }
            0x01 | 0x02 => {
                let (start, count) = (word(1), word(3));
                let table = if function == 0x01 { &self.coils } else { &self.discrete };
                let mut bytes = vec![0u8; (count as usize + 7) / 8];
                for i in 0..count {
                    let bit = table.get(&(start + i)).ok_or(ExceptionCode::IllegalDataAddress)?;
                    if *bit {
                        bytes[i as usize / 8] |= 1 << (i % 8);
                    }
                }
                let mut data = vec![function, bytes.len() as u8];
                data.extend_from_slice(&bytes);
                Ok(data)
            }
            0x05 => {
                self.coils.insert(word(1), word(3) == 0xFF00);
                Ok(pdu[..5].to_vec())
            }
            0x06 => {
                self.holding.insert(word(1), word(3));
                Ok(pdu[..5].to_vec())
            }
            0x10 => {
                let (start, count) = (word(1), word(3));
                for i in 0..count {
                    self.holding.insert(start + i, word(6 + i as usize * 2));
                }
                Ok(pdu[..5].to_vec())
            }
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}
