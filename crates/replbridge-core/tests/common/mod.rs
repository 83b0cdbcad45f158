//! Simulated boards shared by the integration tests
#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use replbridge_core::protocol::{
    CodeRunner, CommandResult, MemoryTransport, PacingConfig, ReplDriver, ReplError,
    ReplProtocol, SerialConfig, SerialLink,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit\r\n>";
pub const PASTE_BANNER: &[u8] = b"\r\npaste mode; Ctrl-C to cancel, Ctrl-D to finish\r\n=== ";

/// Fast config for simulated targets
pub fn test_config(protocol: ReplProtocol) -> SerialConfig {
    let mut config = SerialConfig::default();
    config.protocol = protocol;
    config.timeouts.short_ms = 200;
    config.timeouts.medium_ms = 500;
    config.timeouts.long_ms = 1000;
    config.pacing = PacingConfig::none();
    config
}

pub fn driver_for(mem: &MemoryTransport, protocol: ReplProtocol) -> ReplDriver {
    let link = SerialLink::with_transport(Box::new(mem.clone()), test_config(protocol));
    let mut driver = ReplDriver::new(Arc::new(link));
    driver.set_exec_timeout(Duration::from_secs(1));
    driver
}

/// Friendly-prompt board: answers CR with a prompt, echoes paste-mode input
/// and runs the pasted block through `run` on Ctrl-D.
pub fn friendly_board<F>(mut run: F) -> MemoryTransport
where
    F: FnMut(&str) -> String + Send + 'static,
{
    let mut pasting = false;
    let mut program: Vec<u8> = Vec::new();
    MemoryTransport::with_device(move |data, inbound: &mut VecDeque<u8>| {
        for &b in data {
            if pasting {
                match b {
                    0x04 => {
                        pasting = false;
                        let code = String::from_utf8_lossy(&program).replace("\r\n", "\n");
                        program.clear();
                        inbound.extend(b"\r\n".iter().copied());
                        inbound.extend(run(&code).into_bytes());
                        inbound.extend(b">>> ".iter().copied());
                    }
                    0x03 => {
                        pasting = false;
                        program.clear();
                        inbound.extend(b"\r\n>>> ".iter().copied());
                    }
                    _ => {
                        program.push(b);
                        inbound.push_back(b);
                        if b == b'\n' {
                            inbound.extend(b"=== ".iter().copied());
                        }
                    }
                }
                continue;
            }
            match b {
                b'\r' => inbound.extend(b"\r\n>>> ".iter().copied()),
                0x05 => {
                    pasting = true;
                    inbound.extend(PASTE_BANNER.iter().copied());
                }
                0x03 => inbound.extend(b"\r\n>>> ".iter().copied()),
                0x04 => inbound.extend(b"\r\nsoft reboot\r\n>>> ".iter().copied()),
                other => inbound.push_back(other),
            }
        }
    })
}

/// Raw REPL board. With `window` set it speaks raw paste and grants one credit
/// per window of received bytes; without it, it refuses raw paste.
pub fn raw_board<F>(window: Option<u16>, mut run: F) -> MemoryTransport
where
    F: FnMut(&str) -> (String, String) + Send + 'static,
{
    let mut raw = false;
    let mut pasting = false;
    let mut received = 0usize;
    let mut program: Vec<u8> = Vec::new();
    MemoryTransport::with_device(move |data, inbound: &mut VecDeque<u8>| {
        if !pasting && data == [b'\r', 0x01] {
            raw = true;
            inbound.extend(RAW_BANNER.iter().copied());
            return;
        }
        if !pasting && data == [b'\r', 0x02] {
            raw = false;
            return;
        }
        if !raw || data == [b'\r', 0x03] {
            return;
        }
        if !pasting && data == [0x05, b'A', 0x01] {
            match window {
                Some(w) => {
                    pasting = true;
                    received = 0;
                    inbound.extend([b'R', 0x01]);
                    inbound.extend(w.to_le_bytes());
                }
                None => inbound.extend([b'R', 0x00]),
            }
            return;
        }
        for &b in data {
            if b == 0x04 {
                if pasting {
                    pasting = false;
                    inbound.push_back(0x04);
                } else {
                    inbound.extend(b"OK".iter().copied());
                }
                let code = String::from_utf8_lossy(&program).into_owned();
                program.clear();
                let (out, err) = run(&code);
                inbound.extend(out.into_bytes());
                inbound.push_back(0x04);
                inbound.extend(err.into_bytes());
                inbound.extend([0x04, b'>']);
                continue;
            }
            program.push(b);
            if pasting {
                received += 1;
                if let Some(w) = window {
                    if received % w as usize == 0 {
                        inbound.push_back(0x01);
                    }
                }
            }
        }
    })
}

/// Remote filesystem simulated at the statement level
#[derive(Default)]
pub struct SimFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
    pub log: Vec<String>,
    pub rename_supported: bool,
    /// Decoded length of every chunk handed out by a read
    pub read_chunks: Vec<usize>,
    reader: Option<(Vec<u8>, usize)>,
    writer: Option<String>,
}

fn traceback(msg: &str) -> CommandResult {
    CommandResult::new(
        "",
        format!("Traceback (most recent call last):\r\n  File \"<stdin>\", line 2\r\n{}", msg),
    )
}

/// All single-quoted literals in `code`, unescaped
fn quoted(code: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = code.chars();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut lit = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(n) = chars.next() {
                        lit.push(n);
                    }
                }
                '\'' => break,
                _ => lit.push(c),
            }
        }
        out.push(lit);
    }
    out
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

impl SimFs {
    pub fn new() -> Self {
        let mut fs = Self::default();
        fs.dirs.insert("/".to_string());
        fs
    }

    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(path.to_string(), content.to_vec());
        self
    }

    pub fn with_dir(mut self, path: &str) -> Self {
        self.dirs.insert(path.to_string());
        self
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.iter().filter(|c| c.contains(needle)).count()
    }

    fn children(&self, dir: &str) -> Vec<(String, u32, usize)> {
        let mut out = Vec::new();
        for d in &self.dirs {
            if d != "/" && parent(d) == dir {
                out.push((d[d.rfind('/').unwrap_or(0) + 1..].to_string(), 0x4000, 0));
            }
        }
        for (f, content) in &self.files {
            if parent(f) == dir {
                out.push((f[f.rfind('/').unwrap_or(0) + 1..].to_string(), 0x8000, content.len()));
            }
        }
        out
    }

    fn stat(&self, path: &str) -> Option<(u32, usize)> {
        if self.dirs.contains(path) {
            Some((0x4000, 0))
        } else {
            self.files.get(path).map(|c| (0x8000, c.len()))
        }
    }
}

impl CodeRunner for SimFs {
    fn execute(&mut self, code: &str) -> Result<CommandResult, ReplError> {
        self.log.push(code.to_string());
        let args = quoted(code);
        let ok = |s: String| Ok(CommandResult::new(s, ""));

        if code.contains("os.ilistdir") {
            let base = args.first().cloned().unwrap_or_default();
            if !self.dirs.contains(&base) {
                return Ok(traceback("OSError: [Errno 2] ENOENT"));
            }
            let listing: String = self
                .children(&base)
                .into_iter()
                .map(|(name, mode, size)| format!("{}|{}|{}\r\n", name, mode, size))
                .collect();
            return ok(listing);
        }
        if code.starts_with("import os\ns=os.stat(") {
            return match self.stat(&args[0]) {
                Some((mode, size)) => ok(format!("{} {}\r\n", mode, size)),
                None => Ok(traceback("OSError: [Errno 2] ENOENT")),
            };
        }
        if code.starts_with("import os\ntry:\n os.stat(") {
            let found = self.stat(&args[0]).is_some();
            return ok(if found { "1\r\n" } else { "0\r\n" }.to_string());
        }
        if code.contains("os.rename(") {
            if !self.rename_supported {
                return ok("FAIL\r\n".to_string());
            }
            let content = self.files.remove(&args[0]).unwrap_or_default();
            self.files.insert(args[1].clone(), content);
            return ok("OK\r\n".to_string());
        }
        if code.starts_with("f=open(") {
            let (path, mode) = (args[0].clone(), args[1].as_str());
            match mode {
                "rb" => match self.files.get(&path) {
                    Some(c) => self.reader = Some((c.clone(), 0)),
                    None => return Ok(traceback("OSError: [Errno 2] ENOENT")),
                },
                "wb" => {
                    self.files.insert(path.clone(), Vec::new());
                    self.writer = Some(path);
                }
                _ => {
                    self.files.entry(path.clone()).or_default();
                    self.writer = Some(path);
                }
            }
            return ok(String::new());
        }
        if let Some(pos) = code.find("b2a_base64(r(") {
            let digits: String = code[pos + 13..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            let n: usize = digits.parse().unwrap_or(0);
            let Some((content, offset)) = self.reader.as_mut() else {
                return Ok(traceback("NameError: name 'r' isn't defined"));
            };
            let end = (*offset + n).min(content.len());
            let chunk = STANDARD.encode(&content[*offset..end]);
            self.read_chunks.push(end - *offset);
            *offset = end;
            return ok(format!("{}\r\n", chunk));
        }
        if code.contains("a2b_base64('") {
            let b64 = args.last().cloned().unwrap_or_default();
            let Some(path) = self.writer.clone() else {
                return Ok(traceback("NameError: name 'w' isn't defined"));
            };
            let bytes = STANDARD.decode(b64).unwrap_or_default();
            self.files.entry(path).or_default().extend(bytes);
            return ok(String::new());
        }
        if code == "f.close()" {
            self.reader = None;
            self.writer = None;
            return ok(String::new());
        }
        if code.contains("os.remove(") {
            return match self.files.remove(&args[0]) {
                Some(_) => ok(String::new()),
                None => Ok(traceback("OSError: [Errno 2] ENOENT")),
            };
        }
        if code.contains("os.mkdir(") {
            self.dirs.insert(args[0].clone());
            return ok(String::new());
        }
        if code.contains("os.rmdir(") {
            if !self.children(&args[0]).is_empty() {
                return Ok(traceback("OSError: [Errno 39] ENOTEMPTY"));
            }
            self.dirs.remove(&args[0]);
            return ok(String::new());
        }
        if code.starts_with("fr=open(") {
            let content = self.files.get(&args[0]).cloned().unwrap_or_default();
            self.files.insert(args[2].clone(), content);
            return ok(String::new());
        }
        if code.ends_with(",'a').close()") {
            self.files.entry(args[0].clone()).or_default();
            return ok(String::new());
        }
        Ok(traceback("SyntaxError: unexpected statement"))
    }
}
