//! REPL Protocol Engine
//!
//! Implements the MicroPython/CircuitPython REPL protocols over a serial link:
//! the machine-oriented raw REPL with its windowed raw-paste transfer, and the
//! human-oriented friendly prompt driven through paste mode.

pub mod driver;
mod error;
pub mod link;
pub mod output;
pub mod raw_paste;
pub mod serial;
pub mod stream;

pub use driver::{CodeRunner, CommandResult, RawPasteSupport, ReplDriver, ReplSessionState};
pub use error::{ErrorKind, ReplError};
pub use link::{PacingConfig, ReplProtocol, SerialConfig, SerialLink, TimeoutConfig};
pub use raw_paste::TransferWindow;
pub use serial::{list_ports, PortInfo};
pub use stream::{MemoryTransport, SerialChannel, TcpChannel, Transport};

/// Default baud rate for REPL targets
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Wire control bytes
pub mod ctrl {
    /// Enter raw REPL (Ctrl-A)
    pub const ENTER_RAW: u8 = 0x01;
    /// Exit raw REPL (Ctrl-B)
    pub const EXIT_RAW: u8 = 0x02;
    /// Interrupt (Ctrl-C)
    pub const INTERRUPT: u8 = 0x03;
    /// EOF / execute / end of transfer (Ctrl-D)
    pub const EOF: u8 = 0x04;
    /// Enter paste mode (Ctrl-E)
    pub const PASTE: u8 = 0x05;
}

/// Literal banners and prompts the target prints
pub mod banner {
    /// Raw REPL entry banner, including its `>` prompt
    pub const RAW_REPL: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
    /// Printed by a soft reset
    pub const SOFT_REBOOT: &[u8] = b"soft reboot\r\n";
    /// Friendly prompt
    pub const PROMPT: &str = ">>>";
    /// CircuitPython's post-boot message
    pub const PRESS_ANY_KEY: &str = "Press any key to enter the REPL";
    /// Part of the paste mode banner
    pub const PASTE_MODE: &str = "paste mode";
    /// Paste mode line prefix
    pub const PASTE_MARKER: &str = "=== ";
    /// Raw-paste negotiation request
    pub const RAW_PASTE_REQUEST: [u8; 3] = [super::ctrl::PASTE, b'A', 0x01];
    /// Plain raw-REPL command-accepted acknowledgment
    pub const COMMAND_OK: &[u8] = b"OK";
}
