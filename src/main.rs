//! Daemon entry point: argument parsing, logging, signal wiring and the
//! startup/teardown sequence around the main loop.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{App, Arg};
use log::LevelFilter;

use mod_system_control::api::SHM_NAME;
use mod_system_control::daemon::{Daemon, Paths};
use mod_system_control::exec::SystemRunner;
use mod_system_control::port::TtyPort;

fn init_logging() {
    // MOD_LOG=1 turns on the verbose traces; RUST_LOG still wins when set
    let verbose = std::env::var("MOD_LOG").map(|v| v == "1").unwrap_or(false);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info });
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    builder.init();
}

fn main() {
    let matches = App::new("mod-system-control")
        .about("Bridges the HMI serial protocol to the audio host")
        .arg(Arg::with_name("device").help("serial device of the HMI").required(true))
        .arg(Arg::with_name("baudrate").help("serial baud rate").required(true))
        .get_matches();

    init_logging();

    let device = matches.value_of("device").unwrap();
    let baudrate: u32 = match matches.value_of("baudrate").unwrap().parse() {
        Ok(baudrate) => baudrate,
        Err(_) => {
            log::error!("invalid baud rate");
            std::process::exit(1);
        }
    };

    let port = match TtyPort::open(device, baudrate) {
        Ok(port) => port,
        Err(e) => {
            log::error!("cannot open serial device {}: {}", device, e);
            std::process::exit(1);
        }
    };

    let mut daemon = match Daemon::new(
        Box::new(port),
        Paths::default(),
        Arc::new(SystemRunner),
        SHM_NAME,
    ) {
        Ok(daemon) => daemon,
        Err(e) => {
            log::error!("cannot set up the host channel: {}", e);
            std::process::exit(1);
        }
    };

    let term = Arc::new(AtomicBool::new(false));
    for sig in &[signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&term)) {
            log::error!("cannot register signal handler: {}", e);
            std::process::exit(1);
        }
    }

    log::info!("now running with {} at {} baud", device, baudrate);
    daemon.run(&term);

    // workers are joined and the shm region unlinked by the drops
    log::info!("stopping...");
}
