//! NIBE 1155 heat pump supervisor CLI
//!
//! Polls and controls a NIBE 1155 ground-source heat pump over its
//! MODBUS 40 hex-ASCII serial interface.
//!
//! This tool allows users to:
//! - Run a continuous daemon that keeps the register cache fresh and
//!   drives the compressor toward the configured operating point.
//! - Read single registers by id or label for diagnostics.
//! - Write single registers, validated against the register catalog.
//! - Print the register catalog.
//!
//! The CLI leverages the `nibe1155_lib` crate for the frame codec,
//! transport, value cache and controller.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use nibe1155_lib::config::Config;
use nibe1155_lib::controller::{HeatPump, HeatPumpHandle, Timing as ControllerTiming};
use nibe1155_lib::device::{self, Nibe1155};
use nibe1155_lib::dmlog::DmLog;
use nibe1155_lib::registers::{Catalog, Register};
use nibe1155_lib::transport::{ModbusSerial, Timing};
use std::panic;
use std::path::Path;
use std::time::Duration;

mod commandline;

use commandline::RegisterRef;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn resolve_register(catalog: &Catalog, reference: &RegisterRef) -> Result<&'static Register> {
    match reference {
        RegisterRef::Id(id) => catalog
            .by_id(*id)
            .with_context(|| format!("register {id} is not in the catalog")),
        RegisterRef::Label(label) => catalog
            .by_label(label)
            .with_context(|| format!("register label '{label}' is not in the catalog")),
    }
}

fn open_serial(device: &str, baud_rate: u32, timeout: Duration) -> Result<ModbusSerial> {
    let timing = Timing {
        normal: timeout,
        ..Timing::default()
    };
    ModbusSerial::open(device, baud_rate, timing)
        .with_context(|| format!("cannot open serial port {device} at {baud_rate} baud"))
}

async fn run_daemon(path: &Path, timeout: Duration) -> Result<()> {
    let config =
        Config::load(path).with_context(|| format!("cannot load config {}", path.display()))?;
    info!(
        "connecting to {} at {} baud",
        config.serial.device, config.serial.baud_rate
    );
    let serial = open_serial(&config.serial.device, config.serial.baud_rate, timeout)?;
    let dev = Nibe1155::start(serial, Catalog::new(), config.poll.period);

    let mut controller_handle: Option<HeatPumpHandle> = None;
    if config.controller.disabled {
        info!("controller disabled, monitoring only");
    } else {
        let timing = ControllerTiming {
            tick: config.poll.controller_period,
            ..ControllerTiming::default()
        };
        let (controller, handle) = HeatPump::new(
            dev.clone(),
            config.controller.start.clone(),
            DmLog::new(&config.dm_log_dir),
            timing,
        )?;
        controller.spawn();
        info!("controller started: {:?}", config.controller.start);

        let mut snapshots = handle.watch_snapshots();
        tokio::spawn(async move {
            let mut last_state = None;
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                if last_state != Some(snapshot.state) {
                    info!(
                        "heat pump state {} (compressor {:.1} Hz, supply {:.1} °C)",
                        snapshot.state, snapshot.f_compressor, snapshot.t_supply
                    );
                    last_state = Some(snapshot.state);
                }
            }
        });
        controller_handle = Some(handle);
    }

    let mut changes = dev.subscribe();
    tokio::spawn(async move {
        loop {
            use tokio::sync::broadcast::error::RecvError;
            match changes.recv().await {
                Ok(change) => debug!("register {} changed to {}", change.id, change.scaled),
                Err(RecvError::Lagged(skipped)) => {
                    trace!("change log lagging, skipped {skipped} notifications");
                }
                Err(RecvError::Closed) => return,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("interrupted, shutting down");
    drop(controller_handle);
    Ok(())
}

async fn run_read(
    reference: &RegisterRef,
    device: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<()> {
    let catalog = Catalog::new();
    let reg = resolve_register(&catalog, reference)?;
    let serial = open_serial(device, baud_rate, timeout)?;
    let (raw, scaled) = device::read_once(&serial, reg)
        .await
        .with_context(|| format!("cannot read register {} ({})", reg.id, reg.label))?;
    println!("{} ({}): {} {} (raw {})", reg.id, reg.label, scaled, reg.unit, raw);
    Ok(())
}

async fn run_write(
    reference: &RegisterRef,
    value: f64,
    device: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<()> {
    let catalog = Catalog::new();
    let reg = resolve_register(&catalog, reference)?;
    let serial = open_serial(device, baud_rate, timeout)?;
    device::write_once(&serial, reg, value)
        .await
        .with_context(|| format!("cannot write {} to register {} ({})", value, reg.id, reg.label))?;
    println!("{} ({}) set to {} {}", reg.id, reg.label, value, reg.unit);
    Ok(())
}

fn print_registers(catalog: &Catalog) {
    println!(
        "{:<6} {:<22} {:<4} {:>6} {:<4} {:<4} description",
        "id", "label", "size", "scale", "rw", "unit"
    );
    for reg in catalog.iter() {
        println!(
            "{:<6} {:<22} {:<4} {:>6} {:<4} {:<4} {}",
            reg.id,
            reg.label,
            format!("{:?}", reg.size).to_lowercase(),
            reg.scale,
            match reg.access {
                nibe1155_lib::registers::Access::ReadOnly => "r",
                nibe1155_lib::registers::Access::ReadWrite => "rw",
            },
            reg.unit,
            reg.description
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "nibehpc started. Log level: {}",
        args.verbose.log_level_filter()
    );

    match &args.command {
        commandline::CliCommands::Daemon { config } => run_daemon(config, args.timeout).await,
        commandline::CliCommands::Read {
            register,
            device,
            baud_rate,
        } => run_read(register, device, *baud_rate, args.timeout).await,
        commandline::CliCommands::Write {
            register,
            value,
            device,
            baud_rate,
        } => run_write(register, *value, device, *baud_rate, args.timeout).await,
        commandline::CliCommands::Registers => {
            print_registers(&Catalog::new());
            Ok(())
        }
    }
}
