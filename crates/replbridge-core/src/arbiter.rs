//! Mode arbitration
//!
//! One serial link serves two consumers: the live terminal pump and
//! programmatic operations (exec, filesystem). Controlled operations take a
//! real mutex and flip the mode to [`ReplMode::Controlled`]; the terminal
//! reader never touches that mutex and only checks the mode with atomics
//! before each read burst.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::fs::RemoteFs;
use crate::protocol::{banner, CodeRunner, CommandResult, ReplDriver, ReplError, SerialLink};

const IDLE_INTERRUPT_PAUSE: Duration = Duration::from_millis(200);
const IDLE_RESET_PAUSE: Duration = Duration::from_millis(200);
const IDLE_COURTESY_PAUSE: Duration = Duration::from_millis(120);
/// Upper bound on waiting for an in-flight terminal read burst after switching to Controlled
const TERMINAL_DRAIN_LIMIT: Duration = Duration::from_millis(500);

/// Who currently owns the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplMode {
    /// The terminal pump may read and write
    Terminal = 0,
    /// A controlled operation owns the link
    Controlled = 1,
}

impl ReplMode {
    fn from_u8(v: u8) -> Self {
        if v == ReplMode::Controlled as u8 {
            ReplMode::Controlled
        } else {
            ReplMode::Terminal
        }
    }
}

/// Confirms the target reached its prompt
pub trait PromptWaiter: Send + Sync {
    /// Block up to `timeout`; true once the prompt was seen
    fn wait(&self, timeout: Duration) -> bool;
}

impl<F> PromptWaiter for F
where
    F: Fn(Duration) -> bool + Send + Sync,
{
    fn wait(&self, timeout: Duration) -> bool {
        self(timeout)
    }
}

/// Prompt waiter that watches the link for `>>>`
pub struct LinkPromptWaiter {
    link: Arc<SerialLink>,
}

impl LinkPromptWaiter {
    /// Watch `link`
    pub fn new(link: Arc<SerialLink>) -> Self {
        Self { link }
    }
}

impl PromptWaiter for LinkPromptWaiter {
    fn wait(&self, timeout: Duration) -> bool {
        self.link
            .read_until(banner::PROMPT.as_bytes(), timeout)
            .is_ok()
    }
}

/// Mutual-exclusion gate between the terminal and controlled operations
pub struct ModeArbiter {
    driver: Mutex<ReplDriver>,
    link: Arc<SerialLink>,
    mode: AtomicU8,
    terminal_held: AtomicBool,
    prompt_waiter: Option<Box<dyn PromptWaiter>>,
}

impl ModeArbiter {
    /// Wrap `driver`; the mode starts as Terminal
    pub fn new(driver: ReplDriver) -> Self {
        let link = Arc::clone(driver.link());
        Self {
            driver: Mutex::new(driver),
            link,
            mode: AtomicU8::new(ReplMode::Terminal as u8),
            terminal_held: AtomicBool::new(false),
            prompt_waiter: None,
        }
    }

    /// Open the configured port and build an arbiter that confirms prompts on the link
    pub fn open(config: &AppConfig) -> Result<Self, ReplError> {
        let link = Arc::new(SerialLink::open(config.serial.clone())?);
        let mut driver = ReplDriver::new(Arc::clone(&link));
        driver.set_exec_timeout(config.exec_timeout());
        Ok(Self::new(driver).with_prompt_waiter(LinkPromptWaiter::new(link)))
    }

    /// Install the capability used by [`ensure_idle`](Self::ensure_idle) to confirm the prompt
    pub fn with_prompt_waiter(mut self, waiter: impl PromptWaiter + 'static) -> Self {
        self.prompt_waiter = Some(Box::new(waiter));
        self
    }

    /// The shared link; only touch it under a grant or guard
    pub fn link(&self) -> &Arc<SerialLink> {
        &self.link
    }

    /// Current owner of the link
    pub fn mode(&self) -> ReplMode {
        ReplMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    /// Whether a terminal grant is outstanding
    pub fn is_terminal_held(&self) -> bool {
        self.terminal_held.load(Ordering::SeqCst)
    }

    /// Non-blocking grant for one terminal read burst.
    ///
    /// Returns `None` while a controlled operation owns the link or another
    /// burst is already in progress. The grant is released on drop.
    pub fn try_terminal(&self) -> Option<TerminalGrant<'_>> {
        if self.mode() != ReplMode::Terminal {
            return None;
        }
        if self
            .terminal_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        // A controller may have switched the mode between the check and the flag
        if self.mode() != ReplMode::Terminal {
            self.terminal_held.store(false, Ordering::SeqCst);
            return None;
        }
        Some(TerminalGrant { arbiter: self })
    }

    /// Write terminal input under a terminal grant.
    ///
    /// Waits up to `wait` for an in-progress read burst to release its grant.
    /// Returns `Ok(false)` without writing if a controlled operation owns the
    /// link or the grant could not be taken in time.
    pub fn write_terminal(&self, data: &[u8], wait: Duration) -> Result<bool, ReplError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(grant) = self.try_terminal() {
                grant.link().write_bytes(data)?;
                return Ok(true);
            }
            if self.mode() != ReplMode::Terminal || Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Block until the link is exclusively ours
    pub fn acquire_controlled(&self, tag: &'static str) -> ControlledGuard<'_> {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        self.enter_controlled(driver, tag)
    }

    /// Take the link only if no other controlled operation holds it
    pub fn try_acquire_controlled(&self, tag: &'static str) -> Option<ControlledGuard<'_>> {
        let driver = match self.driver.try_lock() {
            Ok(d) => d,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(self.enter_controlled(driver, tag))
    }

    fn enter_controlled<'a>(
        &'a self,
        driver: MutexGuard<'a, ReplDriver>,
        tag: &'static str,
    ) -> ControlledGuard<'a> {
        self.mode.store(ReplMode::Controlled as u8, Ordering::SeqCst);

        let deadline = Instant::now() + TERMINAL_DRAIN_LIMIT;
        while self.terminal_held.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                tracing::warn!("Terminal read burst still in progress after {:?}", TERMINAL_DRAIN_LIMIT);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        tracing::debug!("Controlled on ({})", tag);
        ControlledGuard {
            driver,
            arbiter: self,
            tag,
        }
    }

    /// Run code as one controlled operation
    pub fn exec(&self, code: &str) -> Result<CommandResult, ReplError> {
        self.acquire_controlled("exec").execute(code)
    }

    /// Evaluate an expression as one controlled operation
    pub fn eval(&self, expr: &str) -> Result<String, ReplError> {
        self.acquire_controlled("eval").eval(expr)
    }

    /// Filesystem access holding the link for as long as the returned value lives
    pub fn fs(&self, tag: &'static str) -> RemoteFs<ControlledGuard<'_>> {
        let chunk_size = self.link.config().chunk_size;
        RemoteFs::new(self.acquire_controlled(tag), chunk_size)
    }

    /// Put the mode hint back to Terminal unless a controlled operation is running
    pub fn set_mode_terminal(&self) {
        if let Ok(_driver) = self.driver.try_lock() {
            self.mode.store(ReplMode::Terminal as u8, Ordering::SeqCst);
        }
    }

    /// Bring the target to an idle prompt.
    ///
    /// Sends an interrupt and a soft reset, then confirms the prompt with the
    /// installed [`PromptWaiter`]. Without a waiter it sleeps for `timeout`
    /// and sends CRLF instead. Either way the call succeeds once the control
    /// bytes are out; the flag tells the caller which path ran.
    ///
    /// Returns `Ok(true)` if the prompt was confirmed and `Ok(false)` if it
    /// was not (waiter timed out, or no waiter installed). Callers that only
    /// need the interrupts sent can ignore the flag. `Err` means the link
    /// failed while sending them.
    pub fn ensure_idle(&self, timeout: Duration) -> Result<bool, ReplError> {
        let mut guard = self.acquire_controlled("ensure_idle");

        guard.interrupt()?;
        std::thread::sleep(IDLE_INTERRUPT_PAUSE);
        guard.soft_reset()?;
        std::thread::sleep(IDLE_RESET_PAUSE);

        let confirmed = match &self.prompt_waiter {
            Some(waiter) => waiter.wait(timeout),
            None => {
                std::thread::sleep(timeout);
                guard.write_raw(b"\r\n")?;
                false
            }
        };

        std::thread::sleep(IDLE_COURTESY_PAUSE);
        guard.interrupt()?;

        if confirmed {
            tracing::info!("ensure_idle: prompt confirmed");
        } else {
            tracing::info!("ensure_idle: prompt not confirmed, fallback used");
        }
        Ok(confirmed)
    }
}

/// Exclusive access to the driver; mode returns to Terminal on drop
pub struct ControlledGuard<'a> {
    driver: MutexGuard<'a, ReplDriver>,
    arbiter: &'a ModeArbiter,
    tag: &'static str,
}

impl ControlledGuard<'_> {
    /// Label given when the guard was taken
    pub fn tag(&self) -> &'static str {
        self.tag
    }
}

impl CodeRunner for ControlledGuard<'_> {
    fn execute(&mut self, code: &str) -> Result<CommandResult, ReplError> {
        self.driver.execute(code)
    }
}

impl Deref for ControlledGuard<'_> {
    type Target = ReplDriver;

    fn deref(&self) -> &ReplDriver {
        &self.driver
    }
}

impl DerefMut for ControlledGuard<'_> {
    fn deref_mut(&mut self) -> &mut ReplDriver {
        &mut self.driver
    }
}

impl Drop for ControlledGuard<'_> {
    fn drop(&mut self) {
        // The mutex field is released after this body runs
        self.arbiter
            .mode
            .store(ReplMode::Terminal as u8, Ordering::SeqCst);
        tracing::debug!("Controlled off ({})", self.tag);
    }
}

/// One terminal read burst
pub struct TerminalGrant<'a> {
    arbiter: &'a ModeArbiter,
}

impl TerminalGrant<'_> {
    /// The link, for the duration of this burst
    pub fn link(&self) -> &SerialLink {
        &self.arbiter.link
    }
}

impl Drop for TerminalGrant<'_> {
    fn drop(&mut self) {
        self.arbiter.terminal_held.store(false, Ordering::SeqCst);
    }
}
