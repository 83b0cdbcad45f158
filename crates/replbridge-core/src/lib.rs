//! # ReplBridge Core Library
//!
//! Shares one serial link to a MicroPython/CircuitPython board between a live
//! terminal session and programmatic code execution.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Raw REPL execution with windowed raw-paste transfer
//! - Friendly-prompt execution through paste mode
//! - Arbitration between the terminal and controlled operations
//! - A bridge pumping terminal traffic to a network session
//! - Filesystem access through generated remote statements
//!
//! ## Example
//!
//! ```rust,ignore
//! use replbridge_core::{arbiter::ModeArbiter, config::AppConfig};
//!
//! let config = AppConfig::from_file("replbridge.json")?;
//! let arbiter = ModeArbiter::open(&config)?;
//!
//! arbiter.ensure_idle(config.ensure_idle_timeout())?;
//! let result = arbiter.exec("print(1 + 1)")?;
//! println!("{}", result.stdout);
//!
//! for entry in arbiter.fs("list").list_dir("/")? {
//!     println!("{} {}", entry.name, entry.size);
//! }
//! ```

pub mod arbiter;
pub mod bridge;
pub mod config;
pub mod fs;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::arbiter::{ControlledGuard, LinkPromptWaiter, ModeArbiter, PromptWaiter, ReplMode};
    pub use crate::bridge::{Bridge, BridgeConfig, Frame, FrameSink, PeerId, Session, SinkError};
    pub use crate::config::AppConfig;
    pub use crate::fs::{FileInfo, RemoteFs};
    pub use crate::protocol::{
        CodeRunner, CommandResult, ErrorKind, ReplDriver, ReplError, ReplProtocol, SerialConfig,
        SerialLink,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
