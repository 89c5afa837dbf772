//! Session log capture.
//!
//! A `LogSink` subscribes to the output hub and appends every message to
//! a plain text file in hub order. Received text is assembled into
//! lines, each stamped when the line started; sent commands and hex
//! groups are one record each. A pending received line is terminated
//! before any other record is written, so the file never interleaves
//! two records on one line. Write failures are reported and counted but
//! never reach the reader.

use crate::serial::error::{SerialError, SerialResult};
use crate::serial::hub::{HubEvent, HubSubscriber, OutputHub};
use crate::serial::types::*;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Direction marker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Data direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DataDirection {
    Tx,
    Rx,
}

impl DataDirection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tx => "TX",
            Self::Rx => "RX",
        }
    }

    pub fn arrow(&self) -> &'static str {
        match self {
            Self::Tx => ">>>",
            Self::Rx => "<<<",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Timestamps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reject custom patterns chrono cannot format.
pub fn check_timestamp_pattern(pattern: &str) -> SerialResult<()> {
    if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
        return Err(SerialError::invalid_config(format!(
            "invalid timestamp pattern '{}'",
            pattern
        )));
    }
    Ok(())
}

fn pattern(format: &TimestampFormat) -> Option<&str> {
    match format {
        TimestampFormat::None => None,
        TimestampFormat::Iso8601 => Some("%Y-%m-%dT%H:%M:%S%.3f"),
        TimestampFormat::DateTimeZone => Some("%Y-%m-%d %H:%M:%S%.3f %:z"),
        TimestampFormat::DateTime => Some("%Y-%m-%d %H:%M:%S%.3f"),
        TimestampFormat::Time => Some("%H:%M:%S%.3f"),
        TimestampFormat::YearDayTime => Some("%Y %j %H:%M:%S%.3f"),
        TimestampFormat::Compact => Some("%Y %m %d %H %M %S"),
        TimestampFormat::Custom(p) => Some(p.as_str()),
    }
}

/// Format `at` according to `format`, or `None` when timestamps are off.
pub fn format_timestamp(format: &TimestampFormat, at: &DateTime<Local>) -> Option<String> {
    let pattern = pattern(format)?;
    let mut out = String::new();
    // A bad custom pattern yields no timestamp instead of a panic.
    write!(out, "{}", at.format(pattern)).ok()?;
    Some(out)
}

/// Timestamp, delimiter and optional direction marker for one record.
pub fn record_prefix(config: &LogConfig, direction: DataDirection, at: &DateTime<Local>) -> String {
    let mut prefix = String::new();
    if let Some(ts) = format_timestamp(&config.timestamp, at) {
        prefix.push_str(&ts);
        prefix.push_str(config.delimiter.as_str());
    }
    if config.direction_markers {
        prefix.push_str(direction.arrow());
        prefix.push(' ');
    }
    prefix
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log Writer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns hub messages into log lines on an append-only file.
pub struct LogWriter {
    config: LogConfig,
    path: PathBuf,
    file: std::io::BufWriter<std::fs::File>,
    /// Received line in progress: prefix taken at line start, content.
    pending: Option<(String, String)>,
    records: u64,
}

impl LogWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path, config: LogConfig) -> SerialResult<Self> {
        if let TimestampFormat::Custom(ref p) = config.timestamp {
            check_timestamp_pattern(p)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                SerialError::log(format!("Failed to open log file {}: {}", path.display(), e))
            })?;
        Ok(Self {
            config,
            path: path.to_path_buf(),
            file: std::io::BufWriter::new(file),
            pending: None,
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete records written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Log one hub message. Records carry the time they were published
    /// (received units) or transmitted (outgoing records), so a lagging
    /// sink never shifts timestamps.
    pub fn record(&mut self, msg: &HubMessage) -> SerialResult<()> {
        match msg {
            HubMessage::Inbound {
                unit: RenderUnit::Text { text },
                received_at,
            } => self.append_text(text, received_at),
            HubMessage::Inbound {
                unit: unit @ RenderUnit::Hex { .. },
                received_at,
            } => {
                self.terminate_pending()?;
                let prefix = record_prefix(&self.config, DataDirection::Rx, received_at);
                self.write_line(&prefix, &unit.render())
            }
            HubMessage::Outbound(rec) => {
                self.terminate_pending()?;
                let prefix = record_prefix(&self.config, DataDirection::Tx, &rec.sent_at);
                self.write_line(&prefix, &rec.render())
            }
            HubMessage::State(_) => Ok(()),
        }
    }

    /// Note that `n` hub messages never reached the log.
    pub fn mark_gap(&mut self, n: u64) -> SerialResult<()> {
        self.terminate_pending()?;
        self.write_line("", &format!("[log: {} message(s) dropped]", n))
    }

    /// Push buffered bytes to the file.
    pub fn flush(&mut self) -> SerialResult<()> {
        self.file.flush().map_err(|e| self.io_error(e))
    }

    /// Terminate any pending line and flush.
    pub fn close(mut self) -> SerialResult<u64> {
        self.terminate_pending()?;
        self.flush()?;
        Ok(self.records)
    }

    fn append_text(&mut self, text: &str, now: &DateTime<Local>) -> SerialResult<()> {
        for piece in text.split_inclusive('\n') {
            let config = &self.config;
            let (_, content) = self.pending.get_or_insert_with(|| {
                (record_prefix(config, DataDirection::Rx, now), String::new())
            });
            content.push_str(piece);
            if piece.ends_with('\n') {
                if let Some((prefix, content)) = self.pending.take() {
                    self.write_line(&prefix, &content)?;
                }
            }
        }
        Ok(())
    }

    fn terminate_pending(&mut self) -> SerialResult<()> {
        match self.pending.take() {
            Some((prefix, content)) => self.write_line(&prefix, &content),
            None => Ok(()),
        }
    }

    fn write_line(&mut self, prefix: &str, content: &str) -> SerialResult<()> {
        let newline = if content.ends_with('\n') { "" } else { "\n" };
        write!(self.file, "{}{}{}", prefix, content, newline)
            .and_then(|_| self.file.flush())
            .map_err(|e| self.io_error(e))?;
        self.records += 1;
        Ok(())
    }

    fn io_error(&self, e: std::io::Error) -> SerialError {
        SerialError::log(format!("write to {} failed: {}", self.path.display(), e))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Log Sink (hub consumer task)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a detached log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub path: PathBuf,
    pub records: u64,
    pub failed_writes: u64,
}

/// A log file attached to a session's hub.
pub struct LogSink {
    path: PathBuf,
    stop_tx: watch::Sender<bool>,
    failed_writes: Arc<AtomicU64>,
    handle: JoinHandle<(SerialResult<u64>, Option<SerialError>)>,
}

impl LogSink {
    /// Open the file and start consuming the hub. Messages published
    /// after this returns are guaranteed to be logged.
    pub fn attach(
        path: impl AsRef<Path>,
        config: LogConfig,
        hub: &OutputHub,
    ) -> SerialResult<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = LogWriter::open(&path, config)?;
        let subscriber = hub.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);
        let failed_writes = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(consume(writer, subscriber, stop_rx, failed_writes.clone()));
        log::info!("[serial:log] attached {}", path.display());
        Ok(Self {
            path,
            stop_tx,
            failed_writes,
            handle,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes that have failed so far.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Write everything already published, terminate the pending line,
    /// flush and close. Fails with a `Log` error if any write failed.
    pub async fn detach(self) -> SerialResult<LogSummary> {
        let _ = self.stop_tx.send(true);
        let (closed, last_error) = self
            .handle
            .await
            .map_err(|e| SerialError::log(format!("log task ended abnormally: {}", e)))?;
        let records = closed?;
        let failed_writes = self.failed_writes.load(Ordering::Relaxed);
        log::info!(
            "[serial:log] detached {} ({} records, {} failed writes)",
            self.path.display(),
            records,
            failed_writes
        );
        if let Some(err) = last_error {
            return Err(SerialError::log(format!(
                "{} log write(s) failed, last: {}",
                failed_writes, err.message
            )));
        }
        Ok(LogSummary {
            path: self.path,
            records,
            failed_writes,
        })
    }
}

async fn consume(
    mut writer: LogWriter,
    mut subscriber: HubSubscriber,
    mut stop_rx: watch::Receiver<bool>,
    failed_writes: Arc<AtomicU64>,
) -> (SerialResult<u64>, Option<SerialError>) {
    let mut last_error = None;
    loop {
        tokio::select! {
            biased;

            event = subscriber.recv() => {
                if !handle_event(&mut writer, event, &failed_writes, &mut last_error) {
                    break;
                }
            }
            _ = stop_rx.changed() => {
                // Drain what was published before the stop request.
                while let Some(event) = subscriber.try_recv() {
                    if !handle_event(&mut writer, event, &failed_writes, &mut last_error) {
                        break;
                    }
                }
                break;
            }
        }
    }
    (writer.close(), last_error)
}

/// Returns `false` once the hub is closed.
fn handle_event(
    writer: &mut LogWriter,
    event: HubEvent,
    failed_writes: &AtomicU64,
    last_error: &mut Option<SerialError>,
) -> bool {
    let result = match event {
        HubEvent::Message(ref msg) => writer.record(msg),
        HubEvent::Lagged(n) => writer.mark_gap(n),
        HubEvent::Closed => return false,
    };
    if let Err(e) = result {
        failed_writes.fetch_add(1, Ordering::Relaxed);
        log::error!("[serial:log] {}", e);
        *last_error = Some(e);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 2, 29, 13, 5, 9).unwrap()
    }

    fn text(s: &str) -> HubMessage {
        HubMessage::inbound(RenderUnit::Text { text: s.to_string() })
    }

    fn text_at(s: &str, received_at: DateTime<Local>) -> HubMessage {
        HubMessage::Inbound {
            unit: RenderUnit::Text { text: s.to_string() },
            received_at,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_direction_labels() {
        assert_eq!(DataDirection::Tx.label(), "TX");
        assert_eq!(DataDirection::Rx.label(), "RX");
        assert_eq!(DataDirection::Tx.arrow(), ">>>");
        assert_eq!(DataDirection::Rx.arrow(), "<<<");
    }

    #[test]
    fn test_timestamp_presets() {
        let t = at();
        let f = |fmt: TimestampFormat| format_timestamp(&fmt, &t);
        assert_eq!(f(TimestampFormat::None), None);
        assert_eq!(f(TimestampFormat::Iso8601).unwrap(), "2024-02-29T13:05:09.000");
        assert_eq!(f(TimestampFormat::DateTime).unwrap(), "2024-02-29 13:05:09.000");
        assert_eq!(f(TimestampFormat::Time).unwrap(), "13:05:09.000");
        assert_eq!(f(TimestampFormat::YearDayTime).unwrap(), "2024 060 13:05:09.000");
        assert_eq!(f(TimestampFormat::Compact).unwrap(), "2024 02 29 13 05 09");
        assert!(f(TimestampFormat::DateTimeZone).unwrap().starts_with("2024-02-29 13:05:09.000 "));
        assert_eq!(f(TimestampFormat::Custom("%H%M".into())).unwrap(), "1305");
    }

    #[test]
    fn test_invalid_custom_pattern() {
        assert!(check_timestamp_pattern("%Y-%m").is_ok());
        assert!(check_timestamp_pattern("%Q").is_err());
    }

    #[test]
    fn test_prefix_with_delimiter_and_markers() {
        let config = LogConfig {
            timestamp: TimestampFormat::Time,
            delimiter: Delimiter::Semicolon,
            direction_markers: true,
            ..Default::default()
        };
        assert_eq!(
            record_prefix(&config, DataDirection::Rx, &at()),
            "13:05:09.000;<<< "
        );
        let bare = LogConfig::default();
        assert_eq!(record_prefix(&bare, DataDirection::Tx, &at()), "");
    }

    #[test]
    fn test_text_assembled_into_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let config = LogConfig {
            timestamp: TimestampFormat::Time,
            ..Default::default()
        };
        let mut w = LogWriter::open(&path, config).unwrap();
        w.record(&text_at("tem", at())).unwrap();
        w.record(&text_at("p=21\n", at() + chrono::Duration::seconds(5))).unwrap();
        w.record(&text_at("hum=40\n", at())).unwrap();
        assert_eq!(w.close().unwrap(), 2);
        // stamp of the first line is taken where the line started
        assert_eq!(read(&path), "13:05:09.000 temp=21\n13:05:09.000 hum=40\n");
    }

    #[test]
    fn test_outbound_terminates_pending_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.log");
        let mut w = LogWriter::open(&path, LogConfig::default()).unwrap();
        w.record(&text("U1")).unwrap();
        w.record(&HubMessage::Outbound(OutgoingRecord::command(
            "C1\r\n".into(),
            b"C1\r\n".to_vec(),
        )))
        .unwrap();
        w.record(&text("U2\n")).unwrap();
        w.close().unwrap();
        assert_eq!(read(&path), "U1\nC1\r\nU2\n");
    }

    #[test]
    fn test_hex_groups_one_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hex.log");
        let config = LogConfig {
            direction_markers: true,
            ..Default::default()
        };
        let mut w = LogWriter::open(&path, config).unwrap();
        w.record(&HubMessage::inbound(RenderUnit::Hex { offset: 0, bytes: vec![0x41, 0x42] }))
            .unwrap();
        w.record(&HubMessage::Outbound(OutgoingRecord::raw(vec![0x01]))).unwrap();
        w.close().unwrap();
        assert_eq!(read(&path), "<<< 00000000  41 42  |AB|\n>>> 01\n");
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("append.log");
        std::fs::write(&path, "earlier\n").unwrap();
        let mut w = LogWriter::open(&path, LogConfig::default()).unwrap();
        w.record(&text("later\n")).unwrap();
        w.close().unwrap();
        assert_eq!(read(&path), "earlier\nlater\n");
    }

    #[test]
    fn test_open_failure_is_log_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("x.log");
        let err = LogWriter::open(&path, LogConfig::default()).err().unwrap();
        assert_eq!(err.kind, crate::serial::error::SerialErrorKind::Log);
    }

    #[tokio::test]
    async fn test_sink_writes_hub_messages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.log");
        let hub = OutputHub::new(64);
        let sink = LogSink::attach(&path, LogConfig::default(), &hub).unwrap();

        hub.publish(text("boot "));
        hub.publish(text("ok\n"));
        hub.publish(HubMessage::Outbound(OutgoingRecord::command("AT\r".into(), b"AT\r".to_vec())));
        hub.publish(text("OK\r\n"));
        hub.publish(text("partial"));

        let summary = sink.detach().await.unwrap();
        assert_eq!(summary.records, 4);
        assert_eq!(summary.failed_writes, 0);
        assert_eq!(read(&path), "boot ok\nAT\r\nOK\r\npartial\n");
    }

    #[tokio::test]
    async fn test_sink_uses_publish_time_not_write_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stamps.log");
        let config = LogConfig {
            timestamp: TimestampFormat::DateTime,
            ..Default::default()
        };
        let hub = OutputHub::new(16);
        let sink = LogSink::attach(&path, config, &hub).unwrap();
        hub.publish(text_at("late\n", at()));
        let mut rec = OutgoingRecord::command("AT\r\n".into(), b"AT\r\n".to_vec());
        rec.sent_at = at() + chrono::Duration::milliseconds(250);
        hub.publish(HubMessage::Outbound(rec));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        sink.detach().await.unwrap();
        assert_eq!(
            read(&path),
            "2024-02-29 13:05:09.000 late\n2024-02-29 13:05:09.250 AT\r\n"
        );
    }

    #[tokio::test]
    async fn test_sink_marks_lag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lag.log");
        let hub = OutputHub::new(2);
        let sink = LogSink::attach(&path, LogConfig::default(), &hub).unwrap();
        // Publish faster than the sink task can be scheduled.
        for i in 0..6 {
            hub.publish(text(&format!("{}\n", i)));
        }
        sink.detach().await.unwrap();
        let content = read(&path);
        assert!(content.contains("message(s) dropped"), "{}", content);
        assert!(content.ends_with("4\n5\n"), "{}", content);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_sink_reports_write_failures() {
        let hub = OutputHub::new(8);
        let sink = LogSink::attach("/dev/full", LogConfig::default(), &hub).unwrap();
        hub.publish(text("never fits\n"));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sink.failed_writes() >= 1);
        let err = sink.detach().await.unwrap_err();
        assert_eq!(err.kind, crate::serial::error::SerialErrorKind::Log);
    }
}
