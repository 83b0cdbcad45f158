//! Post-processing of captured REPL text

use regex::Regex;
use std::sync::OnceLock;

/// First line of a MicroPython/CircuitPython exception report
pub const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Normalize every line ending to CRLF and make sure the block ends with one
pub fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8 + 2);
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str("\r\n");
            }
            '\n' => out.push_str("\r\n"),
            _ => out.push(ch),
        }
    }
    if !out.ends_with("\r\n") {
        out.push_str("\r\n");
    }
    out
}

/// Remove the target's echo of the paste banner and the closing prompt.
///
/// Lines starting with `===` and lines mentioning `paste mode;` are dropped,
/// the text is cut at the last `>>>`, and trailing blank lines go with it.
pub fn strip_paste_artifacts(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for line in raw.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with("===") || line.contains("paste mode;") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if let Some(p) = out.rfind(super::banner::PROMPT) {
        out.truncate(p);
    }
    let trimmed = out.trim_end_matches(['\n', '\r']).len();
    out.truncate(trimmed);
    out
}

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        // CSI sequences, OSC sequences (BEL or ST terminated), then lone two-byte escapes
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("valid ANSI pattern")
    })
}

/// Strip terminal escape sequences
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// Split friendly-mode output into (stdout, stderr) at the first traceback header
pub fn split_traceback(output: &str) -> (String, String) {
    match output.find(TRACEBACK_HEADER) {
        Some(pos) => {
            let stdout = output[..pos].trim_end_matches(['\n', '\r']).to_string();
            let stderr = output[pos..].trim_end_matches(['\n', '\r']).to_string();
            (stdout, stderr)
        }
        None => (output.to_string(), String::new()),
    }
}

/// Text between the line after `begin` and `end`; the whole capture if either is missing
pub fn extract_between_markers(capture: &str, begin: &str, end: &str) -> String {
    let Some(b) = capture.find(begin) else {
        return capture.to_string();
    };
    let after_begin = b + begin.len();
    let Some(e) = capture[after_begin..].find(end).map(|e| e + after_begin) else {
        return capture.to_string();
    };
    let start = match capture[b..e].find(['\n', '\r']) {
        Some(nl) => {
            let nl = b + nl;
            // skip the CR and the LF of a CRLF pair
            if capture[nl..].starts_with("\r\n") {
                nl + 2
            } else {
                nl + 1
            }
        }
        None => after_begin,
    };
    capture[start.min(e)..e].to_string()
}
