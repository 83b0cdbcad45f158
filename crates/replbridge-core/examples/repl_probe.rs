//! REPL Probe
//!
//! A standalone tool to check that a MicroPython/CircuitPython board answers
//! on its serial REPL: lists ports, brings the board to an idle prompt, runs a
//! short program and lists the root directory.
//!
//! Usage:
//!   cargo run --example repl_probe -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port or tcp://host:port (default: /dev/ttyACM0)
//!   --baud RATE       Baud rate (default: 115200)
//!   --raw             Use the raw REPL instead of paste mode
//!   --config FILE     Load settings from a JSON config file
//!   --exec CODE       Code to run (default: prints the platform)
//!   --list            Only list serial ports

use anyhow::Context;
use replbridge_core::prelude::*;
use replbridge_core::protocol::list_ports;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = AppConfig::default();
    config.serial.port_name = "/dev/ttyACM0".to_string();
    let mut code = "import sys\nprint(sys.platform, sys.implementation.name)".to_string();
    let mut list_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config = AppConfig::from_file(&args[i])
                        .with_context(|| format!("loading {}", args[i]))?;
                }
            }
            "--port" | "-p" => {
                i += 1;
                if i < args.len() {
                    config.serial.port_name = args[i].clone();
                }
            }
            "--baud" | "-b" => {
                i += 1;
                if i < args.len() {
                    config.serial.baud_rate = args[i].parse().unwrap_or(115200);
                }
            }
            "--raw" => {
                config.serial.protocol = ReplProtocol::Raw;
            }
            "--exec" | "-e" => {
                i += 1;
                if i < args.len() {
                    code = args[i].clone();
                }
            }
            "--list" | "-l" => {
                list_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    println!("=== Serial ports ===");
    for port in list_ports() {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!("  {} [{:04x}:{:04x}]", port.name, vid, pid),
            _ => println!("  {}", port.name),
        }
    }
    if list_only {
        return Ok(());
    }

    println!(
        "\n=== Opening {} @ {} ({:?}) ===",
        config.serial.port_name, config.serial.baud_rate, config.serial.protocol
    );
    let arbiter = ModeArbiter::open(&config)
        .with_context(|| format!("opening {}", config.serial.port_name))?;

    let idle = arbiter.ensure_idle(config.ensure_idle_timeout())?;
    println!("Idle prompt confirmed: {}", idle);

    println!("\n=== exec ===");
    let result = arbiter.exec(&code)?;
    println!("{}", result.stdout);
    if !result.ok {
        println!("--- stderr ---\n{}", result.stderr);
    }

    println!("\n=== / ===");
    for entry in arbiter.fs("probe").list_dir("/")? {
        let kind = if entry.is_directory { "dir " } else { "file" };
        println!("  {} {:>8} {}", kind, entry.size, entry.name);
    }

    Ok(())
}

fn print_help() {
    println!("REPL Probe - check a MicroPython/CircuitPython serial REPL");
    println!();
    println!("Usage: repl_probe [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -p, --port PORT     Serial port or tcp://host:port (default: /dev/ttyACM0)");
    println!("  -b, --baud RATE     Baud rate (default: 115200)");
    println!("      --raw           Use the raw REPL instead of paste mode");
    println!("  -c, --config FILE   Load settings from a JSON config file");
    println!("  -e, --exec CODE     Code to run");
    println!("  -l, --list          Only list serial ports");
    println!("  -h, --help          Show this help");
}
