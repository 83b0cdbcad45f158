//! REPL driver
//!
//! Runs code on the target over a [`SerialLink`]. Two executors exist:
//!
//! - the raw REPL (`Ctrl-A`), where commands are sent with raw-paste flow
//!   control when the firmware supports it and in paced chunks otherwise, and
//!   output comes back framed by `0x04` bytes;
//! - the friendly prompt, where every call re-synchronises on `>>>`, enters
//!   paste mode (`Ctrl-E`), types the block with pacing, executes it with
//!   `Ctrl-D` and strips the echo from the captured text.
//!
//! Raw-REPL entry is sticky across calls; friendly mode assumes nothing
//! between calls.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    banner, ctrl,
    link::ReplProtocol,
    output::{extract_between_markers, normalize_crlf, split_traceback, strip_paste_artifacts},
    raw_paste::{raw_paste_write, PasteOutcome},
    ReplError, SerialLink,
};

const ENSURE_PROMPT_TIMEOUT: Duration = Duration::from_millis(1500);
const PASTE_BANNER_TIMEOUT: Duration = Duration::from_millis(800);
const RAW_ENTER_SETTLE: Duration = Duration::from_millis(100);
const SYNC_SETTLE: Duration = Duration::from_millis(120);
const SYNC_NUDGE_TIMEOUT: Duration = Duration::from_millis(800);
const POLL_SLICE: Duration = Duration::from_millis(40);

/// Tail of the raw REPL banner; a firmware that does not understand the
/// raw-paste request re-prints it
const RAW_BANNER_TAIL: &[u8] = b"w REPL; CTRL-B to exit\r\n>";

// Must not contain the ">>>" prompt
const WRAP_BEGIN: &str = "<<BEGIN>>";
const WRAP_END: &str = "<<END>>";

/// Whether the firmware speaks raw paste
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawPasteSupport {
    /// Not negotiated yet
    #[default]
    Unknown,
    /// Raw paste accepted
    Yes,
    /// Raw paste refused; plain transfer is used
    No,
}

/// Protocol state that persists across calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplSessionState {
    /// Raw REPL entered and not yet exited
    pub in_raw_repl: bool,
    /// Result of the last raw-paste negotiation
    pub raw_paste: RawPasteSupport,
    /// `execute` goes through paste mode rather than the raw REPL
    pub target_is_friendly: bool,
}

/// Output of one `exec` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Program output
    pub stdout: String,
    /// Traceback or error text
    pub stderr: String,
    /// True when `stderr` is empty
    pub ok: bool,
}

impl CommandResult {
    /// Build a result; `ok` follows from an empty stderr
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        let stderr = stderr.into();
        Self {
            stdout: stdout.into(),
            ok: stderr.is_empty(),
            stderr,
        }
    }

    /// Stdout if the remote code succeeded, an execution error otherwise
    pub fn into_stdout(self) -> Result<String, ReplError> {
        if self.ok {
            Ok(self.stdout)
        } else {
            Err(ReplError::Execution(self.stderr))
        }
    }
}

/// Something that can run a block of code on the target
pub trait CodeRunner {
    /// Run `code`. Remote exceptions come back as `Ok` with `ok == false`;
    /// `Err` means the protocol itself failed.
    fn execute(&mut self, code: &str) -> Result<CommandResult, ReplError>;

    /// Run `code` and return stdout, turning a remote exception into an error
    fn run(&mut self, code: &str) -> Result<String, ReplError> {
        self.execute(code)?.into_stdout()
    }

    /// Evaluate an expression and return its `repr`
    fn eval(&mut self, expr: &str) -> Result<String, ReplError> {
        let mut out = self.run(&format!("print(repr({}))", expr))?;
        let trimmed = out.trim_end_matches(['\n', '\r']).len();
        out.truncate(trimmed);
        Ok(out)
    }
}

impl<R: CodeRunner + ?Sized> CodeRunner for &mut R {
    fn execute(&mut self, code: &str) -> Result<CommandResult, ReplError> {
        (**self).execute(code)
    }
}

/// Protocol engine for one target
pub struct ReplDriver {
    link: Arc<SerialLink>,
    state: ReplSessionState,
    /// The raw REPL `>` has already been consumed (right after entry)
    raw_prompt_consumed: bool,
    exec_timeout: Duration,
    last_error: Option<String>,
}

impl ReplDriver {
    /// Driver over `link`; the protocol comes from the link config
    pub fn new(link: Arc<SerialLink>) -> Self {
        let config = link.config();
        let exec_timeout = config.timeouts.medium();
        let target_is_friendly = config.protocol == ReplProtocol::Friendly;
        Self {
            link,
            state: ReplSessionState {
                in_raw_repl: false,
                raw_paste: RawPasteSupport::Unknown,
                target_is_friendly,
            },
            raw_prompt_consumed: false,
            exec_timeout,
            last_error: None,
        }
    }

    /// The link this driver writes to
    pub fn link(&self) -> &Arc<SerialLink> {
        &self.link
    }

    /// Snapshot of the protocol state
    pub fn state(&self) -> ReplSessionState {
        self.state
    }

    /// Whether the raw REPL is currently entered
    pub fn is_in_raw_repl(&self) -> bool {
        self.state.in_raw_repl
    }

    /// Text of the most recent failure
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Timeout used by [`CodeRunner::execute`] while waiting for program output
    pub fn set_exec_timeout(&mut self, timeout: Duration) {
        self.exec_timeout = timeout;
    }

    fn record<T>(&mut self, result: Result<T, ReplError>) -> Result<T, ReplError> {
        if let Err(e) = &result {
            tracing::warn!("REPL operation failed: {}", e);
            self.last_error = Some(e.to_string());
        }
        result
    }

    fn pause(duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    /// Write bytes unchanged
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), ReplError> {
        let r = self.link.write_bytes(data);
        self.record(r)
    }

    /// Send Ctrl-C
    pub fn interrupt(&mut self) -> Result<(), ReplError> {
        self.write_raw(&[ctrl::INTERRUPT])
    }

    /// Send Ctrl-D (soft reset at the friendly prompt)
    pub fn soft_reset(&mut self) -> Result<(), ReplError> {
        self.write_raw(&[ctrl::EOF])
    }

    // ------------------------------------------------------------------
    // Raw REPL
    // ------------------------------------------------------------------

    /// Interrupt whatever runs and switch to the raw REPL
    pub fn enter_raw_repl(&mut self, soft_reset: bool) -> Result<(), ReplError> {
        let r = self.enter_raw_repl_inner(soft_reset);
        self.record(r)
    }

    fn enter_raw_repl_inner(&mut self, soft_reset: bool) -> Result<(), ReplError> {
        let timeout = self.link.config().timeouts.medium();

        self.link.write_bytes(&[b'\r', ctrl::INTERRUPT])?;
        Self::pause(RAW_ENTER_SETTLE);
        self.link.flush_input()?;
        self.link.write_bytes(&[b'\r', ctrl::ENTER_RAW])?;

        self.link
            .read_until(banner::RAW_REPL, timeout)
            .map_err(|_| ReplError::timeout("raw REPL banner"))?;

        if soft_reset {
            self.link.write_bytes(&[ctrl::EOF])?;
            self.link
                .read_until(banner::SOFT_REBOOT, timeout)
                .map_err(|_| ReplError::timeout("soft reboot banner"))?;
            self.link
                .read_until(banner::RAW_REPL, timeout)
                .map_err(|_| ReplError::timeout("raw REPL banner after soft reboot"))?;
        }

        self.state.in_raw_repl = true;
        self.raw_prompt_consumed = true;
        tracing::info!("Entered raw REPL (soft_reset={})", soft_reset);
        Ok(())
    }

    /// Leave the raw REPL
    pub fn exit_raw_repl(&mut self) -> Result<(), ReplError> {
        self.write_raw(&[b'\r', ctrl::EXIT_RAW])?;
        self.state.in_raw_repl = false;
        self.raw_prompt_consumed = false;
        tracing::info!("Exited raw REPL");
        Ok(())
    }

    /// Send a command in the raw REPL without reading its output
    pub fn exec_raw_no_follow(&mut self, command: &str) -> Result<(), ReplError> {
        let r = self.exec_raw_no_follow_inner(command.as_bytes());
        self.record(r)
    }

    fn exec_raw_no_follow_inner(&mut self, command: &[u8]) -> Result<(), ReplError> {
        if !self.state.in_raw_repl {
            return Err(ReplError::NotInExpectedMode(
                "raw REPL command sent outside raw REPL".to_string(),
            ));
        }
        let timeouts = self.link.config().timeouts;

        if !self.raw_prompt_consumed {
            self.link
                .read_until(b">", timeouts.medium())
                .map_err(|_| ReplError::timeout("raw REPL prompt"))?;
        }
        self.raw_prompt_consumed = false;

        if self.state.raw_paste != RawPasteSupport::No {
            self.link.write_bytes(&banner::RAW_PASTE_REQUEST)?;
            let response = self.link.read_exact_timed(2, timeouts.short())?;
            match response.as_slice() {
                [b'R', 0x01] => {
                    self.state.raw_paste = RawPasteSupport::Yes;
                    let outcome =
                        raw_paste_write(&self.link, command, timeouts.short(), timeouts.medium())?;
                    if outcome == PasteOutcome::Aborted {
                        tracing::warn!("Target aborted raw-paste transfer");
                    }
                    return Ok(());
                }
                [b'R', _] => {
                    tracing::info!("Raw paste unsupported by target, using plain transfer");
                    self.state.raw_paste = RawPasteSupport::No;
                }
                [] => return Err(ReplError::timeout("raw-paste negotiation response")),
                _ => {
                    // Old firmware: the request is not understood and the banner is re-printed
                    self.link
                        .read_until(RAW_BANNER_TAIL, timeouts.short())
                        .map_err(|_| {
                            ReplError::Protocol(format!(
                                "unexpected raw-paste response {:02x?}",
                                response
                            ))
                        })?;
                    tracing::info!("Raw paste not understood by target, using plain transfer");
                    self.state.raw_paste = RawPasteSupport::No;
                }
            }
        }

        let pacing = self.link.config().pacing;
        let chunk = self.link.config().chunk_size.max(1);
        for piece in command.chunks(chunk) {
            self.link.write_bytes(piece)?;
            Self::pause(Duration::from_millis(pacing.plain_chunk_gap_ms));
        }
        self.link.write_bytes(&[ctrl::EOF])?;

        let ack = self.link.read_exact_timed(2, timeouts.short())?;
        if ack != banner::COMMAND_OK {
            return Err(ReplError::Execution(format!(
                "command not accepted by device (got {:?})",
                String::from_utf8_lossy(&ack)
            )));
        }
        Ok(())
    }

    /// Read stdout and stderr of a raw REPL command, each terminated by `0x04`
    pub fn follow(&mut self, timeout: Duration) -> Result<(String, String), ReplError> {
        let r = self.follow_inner(timeout);
        self.record(r)
    }

    fn follow_inner(&mut self, timeout: Duration) -> Result<(String, String), ReplError> {
        let mut stdout = self
            .link
            .capture_until(&[ctrl::EOF], timeout)
            .map_err(|_| ReplError::timeout("end of stdout"))?;
        stdout.pop();
        let mut stderr = self
            .link
            .capture_until(&[ctrl::EOF], timeout)
            .map_err(|_| ReplError::timeout("end of stderr"))?;
        stderr.pop();
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }

    /// Run a command in the raw REPL
    pub fn exec_raw(&mut self, command: &str, timeout: Duration) -> Result<CommandResult, ReplError> {
        self.exec_raw_no_follow(command)?;
        let (stdout, stderr) = self.follow(timeout)?;
        Ok(CommandResult::new(stdout, stderr))
    }

    // ------------------------------------------------------------------
    // Friendly REPL
    // ------------------------------------------------------------------

    /// Read whatever arrives within one poll slice into `acc`, bounding its size
    fn poll_into(&self, acc: &mut Vec<u8>, deadline: Instant) -> Result<(), ReplError> {
        let mut buf = [0u8; 128];
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let n = self
            .link
            .read_available(&mut buf, (deadline - now).min(POLL_SLICE))?;
        acc.extend_from_slice(&buf[..n]);
        if acc.len() > 4096 {
            acc.drain(..acc.len() - 1024);
        }
        Ok(())
    }

    /// Bring the friendly REPL to a `>>>` prompt
    pub fn ensure_at_prompt(&mut self, timeout: Duration) -> Result<(), ReplError> {
        let r = self.ensure_at_prompt_inner(timeout);
        self.record(r)
    }

    fn ensure_at_prompt_inner(&mut self, timeout: Duration) -> Result<(), ReplError> {
        let deadline = Instant::now() + timeout;
        self.link.flush_input()?;
        self.link.write_bytes(b"\r")?;

        let mut acc = Vec::with_capacity(512);
        let mut pressed_any_key = false;
        while Instant::now() < deadline {
            self.poll_into(&mut acc, deadline)?;
            let text = String::from_utf8_lossy(&acc);
            if !pressed_any_key && text.contains(banner::PRESS_ANY_KEY) {
                self.link.write_bytes(b"\r")?;
                pressed_any_key = true;
            }
            if text.contains(banner::PROMPT) {
                return Ok(());
            }
        }
        Err(ReplError::timeout(">>> prompt"))
    }

    /// Switch the friendly REPL into paste mode. Assumes the prompt is showing.
    pub fn enter_paste_mode(&mut self) -> Result<(), ReplError> {
        let r = self.enter_paste_mode_inner();
        self.record(r)
    }

    fn enter_paste_mode_inner(&mut self) -> Result<(), ReplError> {
        self.link.flush_input()?;
        self.link.write_bytes(&[ctrl::PASTE])?;

        let needles = [banner::PASTE_MODE.as_bytes(), banner::PASTE_MARKER.as_bytes()];
        let (which, _) = self
            .link
            .read_until_any(&needles, PASTE_BANNER_TIMEOUT)
            .map_err(|_| ReplError::Protocol("paste mode banner not seen".to_string()))?;
        if which == 0 {
            // Finish the banner line; the first "=== " stays queued so the echo of
            // the first pasted line is recognisable
            self.link
                .read_until(b"\n", PASTE_BANNER_TIMEOUT)
                .map_err(|_| ReplError::Protocol("paste mode banner truncated".to_string()))?;
        } else {
            self.link.unread(banner::PASTE_MARKER.as_bytes());
        }
        Ok(())
    }

    /// Type `text` into paste mode one character at a time, then execute it
    pub fn paste_literal_block(&mut self, text: &str) -> Result<(), ReplError> {
        let r = self.paste_literal_block_inner(text);
        self.record(r)
    }

    fn paste_literal_block_inner(&mut self, text: &str) -> Result<(), ReplError> {
        let pacing = self.link.config().pacing;
        let per_char = Duration::from_micros(pacing.per_char_us);
        let per_newline = Duration::from_micros(pacing.per_newline_us);

        for &byte in normalize_crlf(text).as_bytes() {
            self.link.write_bytes(&[byte])?;
            Self::pause(per_char);
            if byte == b'\n' {
                Self::pause(per_newline);
            }
        }
        self.link.write_bytes(&[ctrl::EOF])
    }

    /// Run a block through paste mode and return the cleaned output
    pub fn exec_friendly(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ReplError> {
        self.ensure_at_prompt(ENSURE_PROMPT_TIMEOUT)?;
        self.enter_paste_mode()?;
        self.paste_literal_block(command)?;

        let captured = self.link.capture_until(banner::PROMPT.as_bytes(), timeout);
        let captured = self.record(captured.map_err(|_| ReplError::timeout("output up to >>>")))?;
        let cleaned = strip_paste_artifacts(&String::from_utf8_lossy(&captured));
        let (stdout, stderr) = split_traceback(&cleaned);
        Ok(CommandResult::new(stdout, stderr))
    }

    /// Wait for the friendly `>>>` prompt
    pub fn wait_for_prompt(&mut self, timeout: Duration) -> Result<(), ReplError> {
        let r = self
            .link
            .read_until(banner::PROMPT.as_bytes(), timeout)
            .map(|_| ());
        self.record(r)
    }

    /// Stop the running program, soft-reset and wait for the prompt
    pub fn sync_friendly(&mut self, timeout: Duration) -> Result<(), ReplError> {
        self.interrupt()?;
        Self::pause(SYNC_SETTLE);
        self.soft_reset()?;
        if self.wait_for_prompt(timeout).is_ok() {
            return Ok(());
        }
        self.write_raw(b"\r\n")?;
        self.wait_for_prompt(SYNC_NUDGE_TIMEOUT)
    }

    /// Run `command` inside a try/except wrapper with begin/end markers.
    ///
    /// Exceptions are printed by the target and reported as stderr.
    pub fn exec_wrapped(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ReplError> {
        if self.wait_for_prompt(SYNC_NUDGE_TIMEOUT).is_err() {
            self.sync_friendly(timeout)?;
        }
        self.enter_paste_mode()?;

        let program = wrap_program(command);
        self.paste_literal_block(&program)?;

        let captured = self.link.capture_until(banner::PROMPT.as_bytes(), timeout);
        let captured = self.record(captured.map_err(|_| ReplError::timeout("output up to >>>")))?;
        let cleaned = strip_paste_artifacts(&String::from_utf8_lossy(&captured));
        let body = extract_between_markers(&cleaned, WRAP_BEGIN, WRAP_END);
        let (stdout, stderr) = split_traceback(body.trim_end_matches(['\n', '\r']));
        Ok(CommandResult::new(stdout, stderr))
    }
}

fn wrap_program(command: &str) -> String {
    let mut program = String::with_capacity(command.len() + 160);
    program.push_str(&format!("print('{}')\n", WRAP_BEGIN));
    program.push_str("try:\n");
    let mut body_lines = 0;
    for line in command.lines() {
        program.push_str("  ");
        program.push_str(line);
        program.push('\n');
        body_lines += 1;
    }
    if body_lines == 0 {
        program.push_str("  pass\n");
    }
    program.push_str("except Exception as e:\n");
    program.push_str("  import sys\n");
    program.push_str("  sys.print_exception(e)\n");
    program.push_str(&format!("print('{}')\n", WRAP_END));
    program
}

impl CodeRunner for ReplDriver {
    fn execute(&mut self, code: &str) -> Result<CommandResult, ReplError> {
        if !self.state.in_raw_repl && !self.state.target_is_friendly {
            self.enter_raw_repl(false)?;
        }
        let timeout = self.exec_timeout;
        let result = if self.state.in_raw_repl {
            self.exec_raw(code, timeout)?
        } else {
            self.exec_friendly(code, timeout)?
        };
        if !result.ok {
            tracing::debug!("Remote exception: {}", result.stderr);
            self.last_error = Some(result.stderr.clone());
        }
        Ok(result)
    }
}
