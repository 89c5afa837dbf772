//! Byte stream → render units.
//!
//! Text mode decodes incrementally: trailing bytes that could still form
//! a valid character are carried into the next feed, and only sequences
//! proven invalid become the replacement marker. Decoded text is cut at
//! `\n`, so the units produced by [`Framer::feed`] depend only on the
//! bytes, never on how the reads happened to split them.
//!
//! Hex mode cuts the stream into fixed-width groups tagged with the
//! offset of their first byte since the connection opened.

use crate::serial::types::{RenderMode, RenderUnit, TextEncoding};

/// Incremental decoder/framer for one connection.
#[derive(Debug)]
pub struct Framer {
    port: String,
    mode: RenderMode,
    encoding: TextEncoding,
    replacement: String,
    group_width: usize,
    /// Undecoded trailing bytes (text mode).
    carry: Vec<u8>,
    /// Decoded text not yet terminated by `\n`.
    line: String,
    /// Bytes of the current, incomplete hex group.
    group: Vec<u8>,
    group_offset: u64,
    /// Bytes fed since open, in any mode.
    offset: u64,
    replacements: u64,
}

impl Framer {
    pub fn new(
        port: impl Into<String>,
        mode: RenderMode,
        encoding: TextEncoding,
        group_width: usize,
        replacement: impl Into<String>,
    ) -> Self {
        Self {
            port: port.into(),
            mode,
            encoding,
            replacement: replacement.into(),
            group_width: group_width.max(1),
            carry: Vec::new(),
            line: String::new(),
            group: Vec::new(),
            group_offset: 0,
            offset: 0,
            replacements: 0,
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Stream offset of the next byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total replacement markers emitted since open.
    pub fn replacements(&self) -> u64 {
        self.replacements
    }

    /// Feed freshly read bytes. An empty slice produces nothing.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RenderUnit> {
        let mut out = Vec::new();
        if bytes.is_empty() {
            return out;
        }
        match self.mode {
            RenderMode::Text => {
                let before = self.replacements;
                let text = self.decode(bytes);
                self.push_text(&text, &mut out);
                let replaced = self.replacements - before;
                if replaced > 0 {
                    log::warn!(
                        "[serial:{}] replaced {} invalid {} sequence(s)",
                        self.port,
                        replaced,
                        self.encoding.name()
                    );
                }
            }
            RenderMode::Hex => self.push_hex(bytes, &mut out),
        }
        self.offset += bytes.len() as u64;
        out
    }

    /// Release the partial text line the live view would otherwise wait
    /// for. Carried bytes of an unfinished character are kept, and a
    /// partial hex group stays pending so groups keep their fixed width.
    pub fn flush(&mut self) -> Vec<RenderUnit> {
        let mut out = Vec::new();
        if !self.line.is_empty() {
            out.push(RenderUnit::Text {
                text: std::mem::take(&mut self.line),
            });
        }
        out
    }

    /// Emit everything pending: carried bytes that can no longer complete
    /// become one replacement marker, and a partial hex group is emitted
    /// short. Used at a mode switch and when the connection ends.
    pub fn finish(&mut self) -> Vec<RenderUnit> {
        if !self.carry.is_empty() {
            log::warn!(
                "[serial:{}] dropping {} incomplete {} byte(s)",
                self.port,
                self.carry.len(),
                self.encoding.name()
            );
            self.carry.clear();
            self.replacements += 1;
            let marker = self.replacement.clone();
            self.line.push_str(&marker);
        }
        let mut out = self.flush();
        if !self.group.is_empty() {
            out.push(RenderUnit::Hex {
                offset: self.group_offset,
                bytes: std::mem::take(&mut self.group),
            });
        }
        out
    }

    /// Switch render mode. Pending state of the old mode is emitted
    /// first; bytes fed afterwards use the new mode.
    pub fn set_mode(&mut self, mode: RenderMode) -> Vec<RenderUnit> {
        if mode == self.mode {
            return Vec::new();
        }
        let out = self.finish();
        log::debug!("[serial:{}] render mode {:?} -> {:?}", self.port, self.mode, mode);
        self.mode = mode;
        out
    }

    // ── Text ─────────────────────────────────────────────────────

    fn push_text(&mut self, text: &str, out: &mut Vec<RenderUnit>) {
        for piece in text.split_inclusive('\n') {
            self.line.push_str(piece);
            if piece.ends_with('\n') {
                out.push(RenderUnit::Text {
                    text: std::mem::take(&mut self.line),
                });
            }
        }
    }

    fn decode(&mut self, bytes: &[u8]) -> String {
        match self.encoding {
            TextEncoding::Utf8 => self.decode_utf8(bytes),
            TextEncoding::Ascii => {
                let mut text = String::with_capacity(bytes.len());
                for &b in bytes {
                    if b.is_ascii() {
                        text.push(char::from(b));
                    } else {
                        self.replacements += 1;
                        text.push_str(&self.replacement);
                    }
                }
                text
            }
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            TextEncoding::Utf16Le => self.decode_utf16(bytes, u16::from_le_bytes),
            TextEncoding::Utf16Be => self.decode_utf16(bytes, u16::from_be_bytes),
        }
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let mut text = String::with_capacity(data.len());
        let mut rest = &data[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // `valid_up_to` guarantees this prefix is UTF-8.
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.replacements += 1;
                            text.push_str(&self.replacement);
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more.
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    fn decode_utf16(&mut self, bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(bytes);

        let mut units: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| unit([pair[0], pair[1]]))
            .collect();
        let mut keep = data.len() % 2;
        // A high surrogate at the end may be completed by the next read.
        if let Some(&last) = units.last() {
            if (0xD800..=0xDBFF).contains(&last) {
                units.pop();
                keep += 2;
            }
        }
        self.carry = data[data.len() - keep..].to_vec();

        let mut text = String::with_capacity(units.len());
        for decoded in char::decode_utf16(units) {
            match decoded {
                Ok(c) => text.push(c),
                Err(_) => {
                    self.replacements += 1;
                    text.push_str(&self.replacement);
                }
            }
        }
        text
    }

    // ── Hex ──────────────────────────────────────────────────────

    fn push_hex(&mut self, bytes: &[u8], out: &mut Vec<RenderUnit>) {
        let mut offset = self.offset;
        for &b in bytes {
            if self.group.is_empty() {
                self.group_offset = offset;
            }
            self.group.push(b);
            offset += 1;
            if self.group.len() == self.group_width {
                out.push(RenderUnit::Hex {
                    offset: self.group_offset,
                    bytes: std::mem::take(&mut self.group),
                });
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Hex formatting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Format a single byte as a printable character or dot.
pub fn printable_char(byte: u8) -> char {
    if byte.is_ascii_graphic() || byte == b' ' {
        byte as char
    } else {
        '.'
    }
}

/// Convert bytes to a spaced, upper-case hex string (`41 42 0D`).
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

/// One hex group as shown in the live view: offset, hex bytes and the
/// printable column.
pub fn format_hex_group(offset: u64, bytes: &[u8]) -> String {
    let ascii: String = bytes.iter().map(|&b| printable_char(b)).collect();
    format!("{:08X}  {}  |{}|", offset, bytes_to_hex(bytes), ascii)
}
