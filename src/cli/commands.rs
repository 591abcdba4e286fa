use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use log::info;

use crate::config::Config;
use crate::modbus::transport::describe_available_ports;
use crate::modbus::{MasterOptions, ModbusMaster, RegisterKind, SerialTransport, SystemClock};
use crate::services::PollService;

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing argument <{}>", name))
}

fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = arg(matches, name)?;
    raw.parse::<T>()
        .map_err(|e| anyhow!("Invalid {} '{}': {}", name, raw, e))
}

/// Runs blocking bus work off the async runtime with a freshly opened port.
async fn with_master<R, F>(config: &Config, f: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut ModbusMaster<SerialTransport, SystemClock>) -> Result<R> + Send + 'static,
{
    let serial = config.serial.clone();
    let options = MasterOptions::from_config(config);
    tokio::task::spawn_blocking(move || {
        let mut master = ModbusMaster::configure(&serial, options)?;
        f(&mut master)
    })
    .await?
}

/// Dispatches the selected subcommand; `poll` runs when none is given.
pub async fn handle_subcommands(matches: &ArgMatches, config: Config) -> Result<()> {
    match matches.subcommand() {
        None | Some(("poll", _)) => {
            let mut service = PollService::from_config(config)?;
            service.run().await?;
        }
        Some(("once", _)) => {
            let mut service = PollService::from_config(config)?;
            let report = service.run_once().await?;
            println!(
                "✅ {} metrics, {} failed points, {} publications",
                report.metrics_read, report.points_failed, report.publications
            );
        }
        Some(("read", sub)) => read_command(sub, &config).await?,
        Some(("write", sub)) => write_command(sub, &config).await?,
        Some(("scan", sub)) => scan_command(sub, &config).await?,
        Some(("negotiate", _)) => negotiate_command(&config).await?,
        Some(("ports", _)) => {
            let ports = describe_available_ports()?;
            if ports.is_empty() {
                println!("❌ No serial ports found");
            }
            for port in ports {
                println!("🔌 {}", port);
            }
        }
        Some(("init-config", sub)) => {
            let path = arg(sub, "path")?;
            Config::default()
                .save_to_file(path)
                .with_context(|| format!("Cannot write {}", path))?;
            println!("📄 Default configuration written to {}", path);
        }
        Some((other, _)) => bail!("Unknown command '{}'", other),
    }
    Ok(())
}

async fn read_command(sub: &ArgMatches, config: &Config) -> Result<()> {
    let slave: u8 = parse_arg(sub, "slave")?;
    let kind: RegisterKind = parse_arg(sub, "kind")?;
    let address: u16 = parse_arg(sub, "address")?;
    let count: u16 = parse_arg(sub, "count")?;

    info!("🔍 Reading {} {} x{} from slave {}", kind, address, count, slave);
    let values = with_master(config, move |master| {
        Ok(master.read_registers(slave, kind, address, count)?)
    })
    .await?;

    for (i, value) in values.iter().enumerate() {
        println!(
            "{}[{}] = {} (0x{})",
            kind,
            address as usize + i,
            value,
            hex::encode(value.to_be_bytes())
        );
    }
    Ok(())
}

async fn write_command(sub: &ArgMatches, config: &Config) -> Result<()> {
    let slave: u8 = parse_arg(sub, "slave")?;
    let address: u16 = parse_arg(sub, "address")?;
    let values = sub
        .get_many::<String>("values")
        .ok_or_else(|| anyhow!("Missing values"))?
        .map(|v| v.parse::<u16>().map_err(|e| anyhow!("Invalid value '{}': {}", v, e)))
        .collect::<Result<Vec<u16>>>()?;

    if sub.get_flag("coil") {
        if values.len() != 1 {
            bail!("--coil writes exactly one value");
        }
        let on = values[0] != 0;
        with_master(config, move |master| Ok(master.write_coil(slave, address, on)?)).await?;
        println!("✅ Coil {} on slave {} set to {}", address, slave, on);
    } else {
        let count = values.len();
        with_master(config, move |master| {
            Ok(master.write_registers(slave, address, &values)?)
        })
        .await?;
        println!("✅ Wrote {} register(s) at {} on slave {}", count, address, slave);
    }
    Ok(())
}

async fn scan_command(sub: &ArgMatches, config: &Config) -> Result<()> {
    let kind: RegisterKind = parse_arg(sub, "kind")?;
    let address: u16 = parse_arg(sub, "addr")?;
    let from: u8 = parse_arg(sub, "from")?;
    let to: u8 = parse_arg(sub, "to")?;

    info!("🔍 Scanning slaves {}-{} with {} {}", from, to, kind, address);
    let found = with_master(config, move |master| {
        Ok(master.scan_for_slave(kind, address, from..=to))
    })
    .await?;
    match found {
        Some(slave) => println!("✅ Slave {} is responding", slave),
        None => println!("📵 No slave answered in {}-{}", from, to),
    }
    Ok(())
}

async fn negotiate_command(config: &Config) -> Result<()> {
    let negotiation = config.negotiation.clone();
    let link = with_master(config, move |master| {
        Ok(master.auto_negotiate_framing(
            &negotiation.baud_rates,
            &negotiation.framings,
            &negotiation.slave_ids,
        ))
    })
    .await?;

    match link {
        Some(link) => println!(
            "🔒 Slave {} answers at {} baud {}",
            link.slave_id, link.baud_rate, link.framing
        ),
        None => println!("❌ No combination answered"),
    }
    Ok(())
}
