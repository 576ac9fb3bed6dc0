//! Dev server detection from raw terminal output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use super::registry::{ServerKind, is_valid_port};

/// A dev server announced in terminal output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: ServerKind,
}

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\x1b\x{9b}][\[()#;?]*(?:[0-9]{1,4}(?:;[0-9]{0,4})*)?[0-9A-ORZcf-nqry=><]")
        .expect("ansi escape pattern is valid")
});

/// Matchers in priority order; the first hit wins.
static MATCHERS: Lazy<Vec<(ServerKind, Regex)>> = Lazy::new(|| {
    [
        (ServerKind::Vite, r"(?i)Local:\s+https?://localhost:(\d+)"),
        (
            ServerKind::Vite,
            r"(?is)VITE v[\d.]+\s+ready in \d+ ms.*?Local:\s+https?://localhost:(\d+)",
        ),
        (ServerKind::Next, r"(?i)started server on.*?https?://localhost:(\d+)"),
        (
            ServerKind::Other,
            r"(?i)(?:server|listening).*?(?:localhost|127\.0\.0\.1):(\d+)",
        ),
    ]
    .into_iter()
    .map(|(kind, pattern)| {
        (
            kind,
            Regex::new(pattern).expect("detector pattern is valid"),
        )
    })
    .collect()
});

/// Remove ANSI/VT escape sequences.
pub fn strip_ansi(raw: &str) -> String {
    ANSI_ESCAPE.replace_all(raw, "").into_owned()
}

/// Scan terminal output for a dev server startup banner.
///
/// Ports outside `(1024, 65535)` are treated as false positives.
pub fn detect(raw: &str) -> Option<Detection> {
    let clean = strip_ansi(raw);
    MATCHERS.iter().find_map(|(kind, re)| {
        let port: u32 = re.captures(&clean)?.get(1)?.as_str().parse().ok()?;
        if !is_valid_port(port) {
            return None;
        }
        Some(Detection {
            port: port as u16,
            kind: *kind,
        })
    })
}

/// Rolling window over a terminal's output so banners split across reads
/// are still detected.
#[derive(Debug, Default)]
pub struct OutputScanner {
    buffer: String,
}

const SCAN_WINDOW: usize = 4096;

impl OutputScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk. Matched text is consumed, so each banner is reported
    /// once.
    pub fn feed(&mut self, chunk: &str) -> Option<Detection> {
        self.buffer.push_str(chunk);
        if self.buffer.len() > SCAN_WINDOW {
            let mut cut = self.buffer.len() - SCAN_WINDOW;
            while !self.buffer.is_char_boundary(cut) {
                cut += 1;
            }
            self.buffer.drain(..cut);
        }

        let found = detect(&self.buffer)?;
        self.buffer.clear();
        Some(found)
    }
}
