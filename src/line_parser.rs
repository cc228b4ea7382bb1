//! Turns a child process's merged stdout/stderr byte stream into a typed
//! event stream (spec section 4.4). Pure: no I/O beyond the bytes handed to
//! it, no global state — the only state is the leftover-bytes buffer of the
//! `LineStreamParser` itself, scoped to one stream.

/// One classified token from the child's output.
#[derive(Clone, Debug, PartialEq)]
pub enum ParserEvent {
    /// A `<number>%` token was found; `speed`/`eta` are scraped best-effort.
    Progress {
        percent: f64,
        speed: Option<String>,
        eta: Option<String>,
    },
    /// A `[Merger]`/`Merging` token was found.
    Merging,
    /// Anything else, carried verbatim (after escape-stripping and encoding
    /// repair).
    Log(String),
}

/// Splits a byte stream into tokens on `\n`, `\r`, or `\r\n` (as a pair),
/// then classifies each token. Feed bytes with `push` as they arrive from
/// the child process; call `finish` once the stream ends to flush any
/// trailing partial token.
#[derive(Default)]
pub struct LineStreamParser {
    buffer: Vec<u8>,
}

impl LineStreamParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of raw bytes, returning every complete token found.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParserEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((token_end, next_start)) = find_token_boundary(&self.buffer) {
            let token: Vec<u8> = self.buffer[..token_end].to_vec();
            self.buffer.drain(..next_start);
            events.push(classify(&token));
        }
        events
    }

    /// Flush a trailing token that was never newline-terminated (the process
    /// exited mid-line).
    pub fn finish(&mut self) -> Option<ParserEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let token = std::mem::take(&mut self.buffer);
        Some(classify(&token))
    }
}

/// Finds the first `\n`, `\r`, or `\r\n` in `buf`. Returns
/// `(token_end, next_token_start)`, where `token_end` excludes the
/// delimiter(s) and `next_token_start` is past them (`\r\n` counts as one
/// delimiter pair, matching the invariant that `"x\ry\nz\r\nw"` yields
/// exactly `[x, y, z, w]`).
fn find_token_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            return Some((i, i.saturating_add(1)));
        }
        if b == b'\r' {
            let next_start = if buf.get(i.saturating_add(1)) == Some(&b'\n') {
                i.saturating_add(2)
            } else {
                i.saturating_add(1)
            };
            return Some((i, next_start));
        }
    }
    None
}

/// Strips ANSI escape sequences of the form `ESC[` ... letter.
fn strip_ansi(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == 0x1b && input.get(i.saturating_add(1)) == Some(&b'[') {
            let mut j = i.saturating_add(2);
            while j < input.len() && !input[j].is_ascii_alphabetic() {
                j = j.saturating_add(1);
            }
            // Skip the final letter too, if present.
            i = if j < input.len() { j.saturating_add(1) } else { j };
        } else {
            out.push(input[i]);
            i = i.saturating_add(1);
        }
    }
    out
}

/// Decodes `bytes` as UTF-8 if valid; otherwise reinterprets byte-by-byte as
/// Latin-1/CP1252 code points and re-encodes as UTF-8 (spec section 4.4/9:
/// the extractor occasionally emits CP1252 on non-English Windows).
fn repair_encoding(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

fn classify(raw_token: &[u8]) -> ParserEvent {
    let stripped = strip_ansi(raw_token);
    let line = repair_encoding(&stripped);

    if let Some(percent) = scrape_percent(&line) {
        return ParserEvent::Progress {
            percent,
            speed: scrape_speed(&line),
            eta: scrape_eta(&line),
        };
    }

    if line.contains("[Merger]") || line.contains("Merging") {
        return ParserEvent::Merging;
    }

    ParserEvent::Log(line)
}

/// Finds a `<number>%` token and parses the number.
fn scrape_percent(line: &str) -> Option<f64> {
    for word in line.split_whitespace() {
        if let Some(digits) = word.strip_suffix('%')
            && let Ok(value) = digits.parse::<f64>()
        {
            return Some(value);
        }
    }
    None
}

/// Finds a token with suffix `/s` (e.g. `1.2MiB/s`).
fn scrape_speed(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|w| w.ends_with("/s"))
        .map(ToString::to_string)
}

/// Finds the field after the literal `ETA`, requiring it to contain `:` or
/// end in `s`/`m`.
fn scrape_eta(line: &str) -> Option<String> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "ETA" {
            let candidate = words.next()?;
            if candidate.contains(':') || candidate.ends_with('s') || candidate.ends_with('m') {
                return Some(candidate.to_string());
            }
            return None;
        }
    }
    None
}
