pub mod commands;

pub use commands::handle_subcommands;

use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("rs485_poller")
        .version(crate::VERSION)
        .about("Modbus RTU master polling RS-485 devices and publishing Sparkplug-style metrics")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to TOML configuration file (built-in defaults when omitted)")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Serial port, e.g. /dev/ttyUSB0 or COM3")
                .global(true),
        )
        .arg(
            Arg::new("baud")
                .short('b')
                .long("baud")
                .value_name("BAUD")
                .help("Baud rate")
                .global(true),
        )
        .arg(
            Arg::new("framing")
                .short('f')
                .long("framing")
                .value_name("FRAMING")
                .help("Character framing: 8N1, 8E1, 8O1, ...")
                .global(true),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Polling interval in seconds")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging, including frame hex dumps")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(Command::new("poll").about("Poll all enabled devices continuously (default)"))
        .subcommand(Command::new("once").about("Run a single poll cycle and exit"))
        .subcommand(
            Command::new("read")
                .about("Read registers or bits from one slave")
                .arg(Arg::new("slave").required(true).help("Slave id (1-247)"))
                .arg(
                    Arg::new("kind")
                        .required(true)
                        .help("holding, input, coil or discrete"),
                )
                .arg(Arg::new("address").required(true).help("0-based start address"))
                .arg(Arg::new("count").default_value("1").help("Number of registers or bits")),
        )
        .subcommand(
            Command::new("write")
                .about("Write holding registers (or one coil with --coil)")
                .arg(Arg::new("slave").required(true).help("Slave id (1-247)"))
                .arg(Arg::new("address").required(true).help("0-based start address"))
                .arg(
                    Arg::new("values")
                        .required(true)
                        .num_args(1..)
                        .help("Values to write"),
                )
                .arg(
                    Arg::new("coil")
                        .long("coil")
                        .help("Write a single coil (value 0 or 1)")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("scan")
                .about("Probe slave ids and report the first one that answers")
                .arg(Arg::new("kind").long("kind").default_value("input"))
                .arg(Arg::new("addr").long("addr").default_value("0"))
                .arg(Arg::new("from").long("from").default_value("1"))
                .arg(Arg::new("to").long("to").default_value("247")),
        )
        .subcommand(
            Command::new("negotiate")
                .about("Search baud rates, framings and ids for a responding slave"),
        )
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(
            Command::new("init-config")
                .about("Write the default configuration to a TOML file")
                .arg(Arg::new("path").default_value("rs485_poller.toml")),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let matches = build_cli()
            .try_get_matches_from([
                "rs485_poller",
                "read",
                "1",
                "input",
                "19",
                "2",
                "--baud",
                "19200",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "read");
        assert_eq!(sub.get_one::<String>("baud").map(String::as_str), Some("19200"));
        assert_eq!(sub.get_one::<String>("count").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_write_takes_many_values() {
        let matches = build_cli()
            .try_get_matches_from(["rs485_poller", "write", "1", "367", "3", "4"])
            .unwrap();
        let sub = matches.subcommand_matches("write").unwrap();
        let values: Vec<&String> = sub.get_many::<String>("values").unwrap().collect();
        assert_eq!(values, vec!["3", "4"]);
    }
}
