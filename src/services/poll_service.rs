use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::settings::Config;
use crate::devices::{build_devices, Device, DeviceReading, Metric};
use crate::modbus::{
    Clock, MasterOptions, ModbusMaster, NegotiatedLink, SerialTransport, SystemClock,
    TransactionStats, Transport,
};
use crate::output::{
    create_formatter, ConsoleSender, DataFormatter, DataSender, FileSender, MessageType,
    PayloadBuilder, Publication,
};
use crate::utils::error::ModbusError;

/// Blocking half of the service: the bus engine and the devices that use it.
struct PollEngine<T: Transport, C: Clock> {
    master: ModbusMaster<T, C>,
    devices: Vec<Box<dyn Device>>,
    startup_done: bool,
}

impl<T: Transport, C: Clock> PollEngine<T, C> {
    fn poll(&mut self, now: DateTime<Utc>) -> Vec<DeviceReading> {
        if !self.startup_done {
            for device in &self.devices {
                if let Err(e) = device.run_startup_writes(&mut self.master) {
                    warn!("⚠️  Startup writes for '{}' failed: {}", device.name(), e);
                }
            }
            self.startup_done = true;
        }

        self.devices
            .iter_mut()
            .map(|device| device.read_metrics(&mut self.master, now))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub metrics_read: usize,
    pub metrics_held: usize,
    pub points_failed: usize,
    pub publications: usize,
    pub bus: TransactionStats,
}

/// Periodic poller: reads every device on the blocking pool, then formats and
/// sends one Sparkplug-style publication per device.
pub struct PollService<T: Transport + Send + 'static, C: Clock + Send + 'static = SystemClock> {
    config: Config,
    engine: Option<PollEngine<T, C>>,
    builder: PayloadBuilder,
    formatter: Box<dyn DataFormatter>,
    senders: Vec<Box<dyn DataSender>>,
    last_values: HashMap<(String, String), Metric>,
    node_born: bool,
    // metric names each device has declared in a DBIRTH
    born: HashMap<String, HashSet<String>>,
    header_sent: bool,
    cycles: u64,
}

impl PollService<SerialTransport, SystemClock> {
    /// Opens the configured serial port and sets up devices and outputs.
    pub fn from_config(config: Config) -> Result<Self, ModbusError> {
        info!("🚀 Initializing poll service for '{}' [{}]", config.edge_name, config.edge_uuid);
        info!(
            "🔌 Serial: {} @ {} baud {}",
            config.serial.port, config.serial.baud_rate, config.serial.framing
        );

        let master = ModbusMaster::configure(&config.serial, MasterOptions::from_config(&config))?;
        let devices = build_devices(&config)?;
        let formatter = create_formatter(&config.publish.format)?;

        let mut senders: Vec<Box<dyn DataSender>> = vec![Box::new(ConsoleSender)];
        if let Some(path) = &config.publish.output_file {
            senders.push(Box::new(FileSender::new(path)));
        }

        let service = Self::new(config, master, devices, formatter, senders);
        info!("✅ Poll service ready");
        Ok(service)
    }
}

impl<T: Transport + Send + 'static, C: Clock + Send + 'static> PollService<T, C> {
    pub fn new(
        config: Config,
        master: ModbusMaster<T, C>,
        devices: Vec<Box<dyn Device>>,
        formatter: Box<dyn DataFormatter>,
        senders: Vec<Box<dyn DataSender>>,
    ) -> Self {
        for sender in &senders {
            info!("📤 Output: {} → {}", sender.sender_type(), sender.destination());
        }
        Self {
            builder: PayloadBuilder::from_config(&config.publish),
            config,
            engine: Some(PollEngine {
                master,
                devices,
                startup_done: false,
            }),
            formatter,
            senders,
            last_values: HashMap::new(),
            node_born: false,
            born: HashMap::new(),
            header_sent: false,
            cycles: 0,
        }
    }

    pub fn add_sender(&mut self, sender: Box<dyn DataSender>) {
        info!("📤 Added {} sender to {}", sender.sender_type(), sender.destination());
        self.senders.push(sender);
    }

    pub fn set_formatter(&mut self, formatter: Box<dyn DataFormatter>) {
        info!("🎨 Using {} formatter", formatter.format_type());
        self.formatter = formatter;
        self.header_sent = false;
    }

    /// Runs `f` against the engine on the blocking pool and puts the engine back.
    async fn with_engine<R, F>(&mut self, f: F) -> Result<R, ModbusError>
    where
        R: Send + 'static,
        F: FnOnce(&mut PollEngine<T, C>) -> R + Send + 'static,
    {
        let mut engine = self
            .engine
            .take()
            .ok_or_else(|| ModbusError::ConnectionError("Bus engine is unavailable".to_string()))?;
        let (engine, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut engine);
            (engine, result)
        })
        .await?;
        self.engine = Some(engine);
        Ok(result)
    }

    /// Searches the configured baud rates, framings and ids for a responding slave.
    pub async fn negotiate(&mut self) -> Result<Option<NegotiatedLink>, ModbusError> {
        let negotiation = self.config.negotiation.clone();
        self.with_engine(move |engine| {
            engine.master.auto_negotiate_framing(
                &negotiation.baud_rates,
                &negotiation.framings,
                &negotiation.slave_ids,
            )
        })
        .await
    }

    /// One poll cycle: read, hold, publish.
    pub async fn run_once(&mut self) -> Result<CycleReport, ModbusError> {
        let now = Utc::now();
        let (readings, bus) = self
            .with_engine(move |engine| {
                let readings = engine.poll(now);
                (readings, engine.master.stats().clone())
            })
            .await?;

        self.cycles += 1;
        let mut report = CycleReport {
            cycle: self.cycles,
            bus,
            ..CycleReport::default()
        };

        for reading in readings {
            report.metrics_read += reading.metrics.len();
            report.points_failed += reading.failures.len();

            let metrics = self.apply_hold(&reading, &mut report);
            if metrics.is_empty() {
                warn!(
                    "📵 {} [{}]: nothing to publish this cycle",
                    reading.device, reading.slave_id
                );
                continue;
            }

            if self.config.publish.emit_birth {
                if let Some(birth_metrics) = self.birth_metrics(&reading.device, &metrics) {
                    if !self.node_born {
                        let node_birth = self.builder.build_node_birth(now);
                        self.publish(&node_birth).await;
                        self.node_born = true;
                        report.publications += 1;
                    }
                    let birth = self.builder.build(
                        MessageType::DBirth,
                        &reading.device,
                        &birth_metrics,
                        now,
                    );
                    self.publish(&birth).await;
                    self.born.insert(
                        reading.device.clone(),
                        birth_metrics.iter().map(|m| m.name.clone()).collect(),
                    );
                    report.publications += 1;
                }
            }

            let data = self.builder.build(MessageType::DData, &reading.device, &metrics, now);
            self.publish(&data).await;
            report.publications += 1;
        }

        log_cycle(&report);
        Ok(report)
    }

    /// Polls on the configured interval until Ctrl-C.
    pub async fn run(&mut self) -> Result<(), ModbusError> {
        if self.config.negotiation.on_startup {
            match self.negotiate().await? {
                Some(link) => info!(
                    "🔒 Using {} {} (slave {} answered)",
                    link.baud_rate, link.framing, link.slave_id
                ),
                None => warn!("⚠️  Negotiation failed, keeping configured line settings"),
            }
        }

        let mut ticker = interval(Duration::from_secs(self.config.polling.interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "🔄 Polling every {} s. Press Ctrl+C to stop",
            self.config.polling.interval_seconds
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("🛑 Stopping poll service...");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!("💥 Poll cycle failed: {}", e);
                    }
                }
            }
        }

        if self.node_born {
            let death = self.node_death();
            self.publish(&death).await;
        }

        if let Some(engine) = &self.engine {
            let stats = engine.master.stats();
            info!("📊 Final statistics:");
            info!("   ✅ Successful transactions: {}", stats.successes);
            info!("   🔁 Retries: {}", stats.retries);
            info!("   ⏱️  Timeouts: {}", stats.timeouts);
            info!("   ❌ CRC errors: {}", stats.crc_errors);
        }
        Ok(())
    }

    /// NDEATH for the current node session, for whoever owns the broker connection.
    pub fn node_death(&self) -> Publication {
        self.builder.build_node_death(Utc::now())
    }

    /// Metrics for a (re)birth when `metrics` names anything the device has not
    /// declared yet. Previously declared names stay in the birth with their last
    /// known value.
    fn birth_metrics(&self, device: &str, metrics: &[Metric]) -> Option<Vec<Metric>> {
        let declared = self.born.get(device);
        let undeclared = metrics
            .iter()
            .any(|m| declared.map_or(true, |names| !names.contains(&m.name)));
        if !undeclared {
            return None;
        }

        let mut birth = metrics.to_vec();
        for name in declared.into_iter().flatten() {
            if birth.iter().any(|m| &m.name == name) {
                continue;
            }
            if let Some(last) = self.last_values.get(&(device.to_string(), name.clone())) {
                birth.push(last.clone());
            }
        }
        Some(birth)
    }

    fn apply_hold(&mut self, reading: &DeviceReading, report: &mut CycleReport) -> Vec<Metric> {
        let mut metrics = reading.metrics.clone();
        for metric in &reading.metrics {
            self.last_values
                .insert((reading.device.clone(), metric.name.clone()), metric.clone());
        }

        if self.config.polling.hold_last_value {
            for failure in &reading.failures {
                let key = (reading.device.clone(), failure.point.clone());
                if let Some(held) = self.last_values.get(&key) {
                    metrics.push(held.clone());
                    report.metrics_held += 1;
                }
            }
        }
        metrics
    }

    async fn publish(&mut self, publication: &Publication) {
        let mut formatted = match self.formatter.format(publication) {
            Ok(text) => text,
            Err(e) => {
                error!("❌ Cannot format {}: {}", publication.topic, e);
                return;
            }
        };
        if !self.header_sent {
            if let Some(header) = self.formatter.format_header() {
                formatted = format!("{}\n{}", header, formatted);
            }
            self.header_sent = true;
        }
        for sender in &self.senders {
            if let Err(e) = sender.send(publication, &formatted).await {
                error!(
                    "❌ {} sender to {} failed: {}",
                    sender.sender_type(),
                    sender.destination(),
                    e
                );
            }
        }
    }
}

fn log_cycle(report: &CycleReport) {
    let total = report.metrics_read + report.points_failed;
    let success_rate = if total > 0 {
        report.metrics_read as f32 / total as f32 * 100.0
    } else {
        0.0
    };
    info!(
        "📈 Cycle {}: {}/{} points ok ({:.1}%), {} held, {} published",
        report.cycle,
        report.metrics_read,
        total,
        success_rate,
        report.metrics_held,
        report.publications
    );
    info!(
        "   bus: {} transactions, {} retries, {} timeouts, {} CRC errors, {} exceptions",
        report.bus.transactions,
        report.bus.retries,
        report.bus.timeouts,
        report.bus.crc_errors,
        report.bus.exceptions
    );
}
