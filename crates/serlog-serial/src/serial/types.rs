//! Shared types for the serial session engine.
//!
//! Covers connection parameters, connection/reader state, render units,
//! outgoing records, hub messages, log options and session statistics.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Number of data bits per character.
///
/// Serialized as the plain number so configuration files can write
/// `dataBits = 7`; anything outside 5–8 is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Self::from_value(v).ok_or_else(|| format!("data bits must be 5-8, got {}", v))
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        bits.value()
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Odd => "O",
            Self::Even => "E",
            Self::Mark => "M",
            Self::Space => "S",
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        }
    }
}

/// Handshake (flow control) passed through to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Handshake {
    None,
    /// Hardware flow control (RTS/CTS).
    RtsCts,
    /// Software flow control (XON/XOFF).
    XonXoff,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::None
    }
}

/// Line terminator appended to operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LineEnding {
    /// No terminator appended.
    None,
    /// Line Feed (`\n`).
    Lf,
    /// Carriage Return (`\r`).
    Cr,
    /// Carriage Return + Line Feed (`\r\n`).
    CrLf,
}

impl Default for LineEnding {
    fn default() -> Self {
        Self::CrLf
    }
}

impl LineEnding {
    /// The character sequence for this terminator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Lf => "\n",
            Self::Cr => "\r",
            Self::CrLf => "\r\n",
        }
    }
}

/// Text encoding used for both decoding received bytes and encoding
/// outgoing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    Utf8,
    Ascii,
    Latin1,
    Utf16Le,
    Utf16Be,
}

impl Default for TextEncoding {
    fn default() -> Self {
        Self::Utf8
    }
}

impl TextEncoding {
    /// Resolve an encoding name. Case, `-` and `_` are ignored, so
    /// `UTF-8`, `utf_8` and `utf8` all resolve to the same encoding.
    pub fn from_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "utf8" => Some(Self::Utf8),
            "ascii" | "usascii" => Some(Self::Ascii),
            "latin1" | "iso88591" | "l1" => Some(Self::Latin1),
            "utf16le" => Some(Self::Utf16Le),
            "utf16be" => Some(Self::Utf16Be),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Ascii => "ascii",
            Self::Latin1 => "latin-1",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
        }
    }

    /// Encode text for transmission. Returns the first character the
    /// encoding cannot represent on failure.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>, char> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { Ok(c as u8) } else { Err(c) })
                .collect(),
            Self::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| c))
                .collect(),
            Self::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Self::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
        }
    }
}

/// Parameters used to open a connection. Frozen for the lifetime of
/// the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    /// Port name (e.g. `COM3`, `/dev/ttyUSB0`).
    pub port_name: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default)]
    pub data_bits: DataBits,

    #[serde(default)]
    pub stop_bits: StopBits,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub handshake: Handshake,

    /// Assert DTR on open.
    #[serde(default = "default_true")]
    pub dtr: bool,

    /// Encoding name, resolved through [`TextEncoding::from_name`].
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Upper bound on a single blocking read, in milliseconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}
fn default_true() -> bool {
    true
}
fn default_encoding() -> String {
    TextEncoding::Utf8.name().to_string()
}
fn default_read_timeout() -> u64 {
    50
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
            handshake: Handshake::default(),
            dtr: true,
            encoding: default_encoding(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

impl ConnectionParams {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Shorthand notation (e.g. "9600-8N1").
    pub fn shorthand(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.baud_rate,
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }

    /// Resolved text encoding, or `None` for an unknown name.
    pub fn text_encoding(&self) -> Option<TextEncoding> {
        TextEncoding::from_name(&self.encoding)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Reader State
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    /// The transport reported a fatal error; a new `open` is required.
    Failed(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Closed
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Failed(_) => "failed",
        }
    }
}

/// Lifecycle of the background reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReaderState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self::Idle
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Render Units & Outgoing Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How received bytes are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RenderMode {
    Text,
    Hex,
}

impl Default for RenderMode {
    fn default() -> Self {
        Self::Text
    }
}

/// A displayable fragment produced from received bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RenderUnit {
    /// Decoded text. Ends with `\n` unless it is a flushed partial line.
    Text { text: String },
    /// Raw bytes with the stream offset of the first byte.
    Hex { offset: u64, bytes: Vec<u8> },
}

impl RenderUnit {
    /// The unit exactly as the live view and the session log show it.
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Hex { offset, bytes } => crate::serial::framer::format_hex_group(*offset, bytes),
        }
    }
}

/// What kind of payload an outgoing record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutgoingKind {
    /// An operator command with the terminator applied.
    Command,
    /// Raw bytes (hex input), sent without terminator.
    Raw,
}

/// A successfully transmitted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingRecord {
    pub kind: OutgoingKind,
    /// Text as transmitted (terminator included) for commands.
    pub text: Option<String>,
    /// Bytes as written to the wire.
    pub bytes: Vec<u8>,
    pub sent_at: DateTime<Local>,
}

impl OutgoingRecord {
    pub fn command(text: String, bytes: Vec<u8>) -> Self {
        Self {
            kind: OutgoingKind::Command,
            text: Some(text),
            bytes,
            sent_at: Local::now(),
        }
    }

    pub fn raw(bytes: Vec<u8>) -> Self {
        Self {
            kind: OutgoingKind::Raw,
            text: None,
            bytes,
            sent_at: Local::now(),
        }
    }

    /// Rendered content: the transmitted text, or the bytes as hex.
    pub fn render(&self) -> String {
        match self.text {
            Some(ref text) => text.clone(),
            None => crate::serial::framer::bytes_to_hex(&self.bytes),
        }
    }
}

/// Everything that flows through the output hub, in one total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum HubMessage {
    /// A received unit, stamped when it was published.
    Inbound {
        unit: RenderUnit,
        received_at: DateTime<Local>,
    },
    Outbound(OutgoingRecord),
    State(ConnectionState),
}

impl HubMessage {
    pub fn inbound(unit: RenderUnit) -> Self {
        Self::Inbound {
            unit,
            received_at: Local::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  History
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cursor movement through the command history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryDirection {
    Older,
    Newer,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Logging
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Timestamp prefix written at the start of every log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimestampFormat {
    /// No timestamp.
    None,
    /// `2024-05-01T13:45:10.123`
    Iso8601,
    /// `2024-05-01 13:45:10.123 +02:00`
    DateTimeZone,
    /// `2024-05-01 13:45:10.123`
    DateTime,
    /// `13:45:10.123`
    Time,
    /// `2024 122 13:45:10.123`
    YearDayTime,
    /// `2024 05 01 13 45 10`
    Compact,
    /// Any `chrono` strftime pattern.
    Custom(String),
}

impl Default for TimestampFormat {
    fn default() -> Self {
        Self::None
    }
}

/// Separator between the timestamp and the record content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Delimiter {
    Blank,
    Comma,
    Semicolon,
    None,
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::Blank
    }
}

impl Delimiter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blank => " ",
            Self::Comma => ",",
            Self::Semicolon => ";",
            Self::None => "",
        }
    }
}

/// Session log options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// Attach to this file when the session opens.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub timestamp: TimestampFormat,

    #[serde(default)]
    pub delimiter: Delimiter,

    /// Prefix records with `<<<` (received) or `>>>` (sent).
    #[serde(default)]
    pub direction_markers: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Statistics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Counters for the current connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub units_rx: u64,
    pub commands_tx: u64,
    pub errors_tx: u64,
    /// Invalid byte sequences replaced by the marker.
    pub replacements: u64,
}

/// Live counters shared between the reader task and the dispatcher.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub units_rx: AtomicU64,
    pub commands_tx: AtomicU64,
    pub errors_tx: AtomicU64,
    pub replacements: AtomicU64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            units_rx: self.units_rx.load(Ordering::Relaxed),
            commands_tx: self.commands_tx.load(Ordering::Relaxed),
            errors_tx: self.errors_tx.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }
}
