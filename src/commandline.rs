use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

/// A register named on the command line: by decimal id, by `0x`-prefixed
/// hex id, or by catalog label.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterRef {
    Id(u16),
    Label(String),
}

fn parse_register(s: &str) -> Result<RegisterRef, String> {
    if s.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        clap_num::maybe_hex::<u16>(s)
            .map(RegisterRef::Id)
            .map_err(|e| format!("invalid register id: {e}"))
    } else {
        Ok(RegisterRef::Label(s.to_string()))
    }
}

const fn about_text() -> &'static str {
    "NIBE 1155 heat pump supervisor - polls and controls the pump over its hex-ASCII Modbus serial link."
}

#[derive(Parser, Debug)]
#[command(name = "nibehpc", author, version, about = about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Modbus timeout for non-LOG.SET exchanges.
    /// Examples: "2100ms", "5s".
    #[arg(global = true, long, default_value = "2100ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the polling scheduler and the heat pump controller until
    /// interrupted.
    Daemon {
        /// Path to the YAML configuration file.
        #[arg(short, long, default_value = "/etc/nibehpc.yaml")]
        config: PathBuf,
    },

    /// Read one register and print its raw and scaled value.
    Read {
        /// Register id (decimal or 0x-prefixed hex) or catalog label,
        /// e.g. "43005" or "degreeMinutes".
        #[arg(value_parser = parse_register)]
        register: RegisterRef,

        /// Serial port device name.
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,

        /// Serial baud rate; must match the MODBUS 40 setting.
        #[arg(long, default_value_t = 9600)]
        baud_rate: u32,
    },

    /// Write a scaled value to one writable register.
    /// The value is validated against the register's width and scale
    /// before anything goes on the wire.
    #[clap(verbatim_doc_comment)]
    Write {
        /// Register id (decimal or 0x-prefixed hex) or catalog label.
        #[arg(value_parser = parse_register)]
        register: RegisterRef,

        /// Scaled value, e.g. "-200" degree minutes or "20.0" °C.
        #[arg(allow_hyphen_values = true)]
        value: f64,

        /// Serial port device name.
        #[arg(short, long, default_value_t = default_device_name())]
        device: String,

        /// Serial baud rate; must match the MODBUS 40 setting.
        #[arg(long, default_value_t = 9600)]
        baud_rate: u32,
    },

    /// Print the register catalog.
    Registers,
}
