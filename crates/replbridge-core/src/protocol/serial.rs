//! Serial port discovery and setup
//!
//! Enumerates candidate ports, tags the ones whose USB vendor is a known
//! MicroPython/CircuitPython board maker, and opens ports in the 8N1 framing
//! the REPL expects.

use serde::Serialize;
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
use std::time::Duration;

use super::ReplError;

/// Read timeout set on the OS handle; link reads poll in slices of this size
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// USB vendors that ship boards with a Python REPL on their CDC port
const REPL_VENDORS: &[(u16, &str)] = &[
    (0x239a, "Adafruit"),
    (0x2e8a, "Raspberry Pi"),
    (0x303a, "Espressif"),
    (0xf055, "MicroPython"),
    (0x1209, "pid.codes"),
];

/// A port the REPL could live on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// OS name of the port (`/dev/ttyACM0`, `COM3`)
    pub name: String,
    /// USB vendor id
    pub vid: Option<u16>,
    /// USB product id
    pub pid: Option<u16>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// USB serial number
    pub serial_number: Option<String>,
    /// Vendor label if the USB vendor is a known REPL board maker
    pub board_vendor: Option<&'static str>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial_number: None,
            board_vendor: None,
        }
    }

    /// Whether this looks like a REPL board rather than a generic adapter
    pub fn is_repl_board(&self) -> bool {
        self.board_vendor.is_some()
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let mut port = Self::bare(info.port_name);
        if let SerialPortType::UsbPort(usb) = info.port_type {
            port.board_vendor = REPL_VENDORS
                .iter()
                .find(|(vid, _)| *vid == usb.vid)
                .map(|(_, label)| *label);
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        port
    }
}

/// Known boards first, then CDC-ACM ports, then USB-serial bridges, then
/// everything else; numbered device nodes sort numerically
fn port_rank(port: &PortInfo) -> (u8, u8, usize, String) {
    let board = if port.is_repl_board() { 0 } else { 1 };
    let base = port.name.rsplit('/').next().unwrap_or(&port.name);
    let numbered = [("ttyACM", 0u8), ("ttyUSB", 1), ("cu.usbmodem", 2)]
        .iter()
        .find_map(|(prefix, class)| {
            base.strip_prefix(prefix)
                .map(|rest| (*class, rest.parse::<usize>().unwrap_or(usize::MAX)))
        });
    let (class, index) = numbered.unwrap_or((3, 0));
    (board, class, index, base.to_string())
}

/// Candidate ports in the order a user most likely wants them
pub fn list_ports() -> Vec<PortInfo> {
    let mut found: HashMap<String, PortInfo> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let port = PortInfo::from(info);
                found.entry(port.name.clone()).or_insert(port);
            }
        }
        Err(e) => tracing::debug!("Port enumeration failed: {}", e),
    }

    // Enumeration misses CDC nodes on some kernels; scan /dev as well
    #[cfg(target_os = "linux")]
    if let Ok(entries) = std::fs::read_dir("/dev") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("ttyACM") || name.starts_with("ttyUSB") {
                let path = format!("/dev/{}", name);
                found
                    .entry(path.clone())
                    .or_insert_with(|| PortInfo::bare(path));
            }
        }
    }

    let mut ports: Vec<PortInfo> = found.into_values().collect();
    ports.sort_by_key(port_rank);
    ports
}

/// Open `name` at `baud_rate`
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, ReplError> {
    serialport::new(name, baud_rate)
        .timeout(PORT_READ_TIMEOUT)
        .open()
        .map_err(|e| ReplError::Transport(format!("{}: {}", name, e)))
}

/// 8N1, no flow control, DTR asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ReplError> {
    port.set_data_bits(serialport::DataBits::Eight)
        .and_then(|_| port.set_parity(serialport::Parity::None))
        .and_then(|_| port.set_stop_bits(serialport::StopBits::One))
        .and_then(|_| port.set_flow_control(serialport::FlowControl::None))
        .map_err(ReplError::transport)?;

    // Native-USB boards only start talking once DTR is up; ignore adapters that refuse it
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("DTR not settable on {:?}: {}", port.name(), e);
    }
    Ok(())
}
