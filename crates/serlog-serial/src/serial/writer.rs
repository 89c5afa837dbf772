//! Write dispatcher.
//!
//! Every write goes through one async mutex. tokio's mutex is fair, so
//! concurrent callers are transmitted whole and in the order they
//! queued; the outgoing record is published while the lock is still
//! held, which keeps hub order identical to wire order.

use crate::serial::config::MIN_REPEAT_INTERVAL_MS;
use crate::serial::error::{SerialError, SerialResult};
use crate::serial::hub::OutputHub;
use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Serializes writes for one open connection.
pub struct WriteDispatcher {
    transport: Arc<dyn SerialTransport>,
    hub: OutputHub,
    encoding: TextEncoding,
    counters: Arc<SessionCounters>,
    /// Write lock; also guards the terminator so a change never lands
    /// in the middle of a send.
    gate: Mutex<LineEnding>,
}

impl WriteDispatcher {
    pub fn new(
        transport: Arc<dyn SerialTransport>,
        hub: OutputHub,
        encoding: TextEncoding,
        line_ending: LineEnding,
        counters: Arc<SessionCounters>,
    ) -> Self {
        Self {
            transport,
            hub,
            encoding,
            counters,
            gate: Mutex::new(line_ending),
        }
    }

    pub async fn set_line_ending(&self, line_ending: LineEnding) {
        *self.gate.lock().await = line_ending;
    }

    /// Send an operator command with the terminator appended once.
    pub async fn send(&self, text: &str) -> SerialResult<OutgoingRecord> {
        self.ensure_open()?;
        let gate = self.gate.lock().await;
        let framed = format!("{}{}", text, gate.as_str());
        let bytes = self.encoding.encode(&framed).map_err(|c| {
            SerialError::encoding(format!(
                "character {:?} cannot be sent as {}",
                c,
                self.encoding.name()
            ))
            .with_port(self.transport.port_name())
        })?;
        let result = self.transmit(OutgoingRecord::command(framed, bytes)).await;
        drop(gate);
        result
    }

    /// Send raw bytes without any terminator.
    pub async fn send_bytes(&self, bytes: Vec<u8>) -> SerialResult<OutgoingRecord> {
        self.ensure_open()?;
        let _gate = self.gate.lock().await;
        self.transmit(OutgoingRecord::raw(bytes)).await
    }

    /// Send hex input such as `"41 54 0d"`; whitespace is ignored.
    pub async fn send_hex(&self, input: &str) -> SerialResult<OutgoingRecord> {
        let bytes = parse_hex_input(input)?;
        self.send_bytes(bytes).await
    }

    fn ensure_open(&self) -> SerialResult<()> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(SerialError::not_connected(self.transport.port_name()))
        }
    }

    async fn transmit(&self, record: OutgoingRecord) -> SerialResult<OutgoingRecord> {
        let port = self.transport.port_name();
        if let Err(e) = self.transport.write(&record.bytes).await {
            self.counters.errors_tx.fetch_add(1, Ordering::Relaxed);
            log::error!("[serial:{}] write of {} byte(s) failed: {}", port, record.bytes.len(), e);
            return Err(e);
        }
        self.counters
            .bytes_tx
            .fetch_add(record.bytes.len() as u64, Ordering::Relaxed);
        self.counters.commands_tx.fetch_add(1, Ordering::Relaxed);
        log::debug!("[serial:{}] sent {} byte(s)", port, record.bytes.len());
        self.hub.publish(HubMessage::Outbound(record.clone()));
        Ok(record)
    }
}

/// Parse whitespace-separated or packed hex digits into bytes.
pub fn parse_hex_input(input: &str) -> SerialResult<Vec<u8>> {
    let cleaned: String = input.split_whitespace().collect();
    if cleaned.is_empty() {
        return Err(SerialError::encoding("hex input is empty"));
    }
    hex::decode(&cleaned).map_err(|e| SerialError::encoding(format!("invalid hex input: {}", e)))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Periodic send
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A command being re-sent on a fixed interval.
pub struct RepeatTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RepeatTask {
    /// Start sending `command` every `interval`, the first send
    /// immediately. Stops on its own at the first failed send.
    pub fn start(
        dispatcher: Arc<WriteDispatcher>,
        command: impl Into<String>,
        interval: Duration,
    ) -> SerialResult<Self> {
        if interval < Duration::from_millis(MIN_REPEAT_INTERVAL_MS) {
            return Err(SerialError::invalid_config(format!(
                "repeat interval must be at least {} ms",
                MIN_REPEAT_INTERVAL_MS
            )));
        }
        let cmd = command.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let port = dispatcher.transport.port_name().to_string();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            log::info!("[serial:{}] repeating {:?} every {:?}", port, cmd, interval);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = dispatcher.send(&cmd).await {
                            log::warn!("[serial:{}] repeat stopped: {}", port, e);
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { stop_tx, handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop repeating. A send already in progress completes first.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}
