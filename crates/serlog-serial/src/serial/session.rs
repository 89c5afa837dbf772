//! Serial session facade.
//!
//! `SerialSession` owns one connection at a time and wires the parts
//! together: the transport, a framer shared with the reader task, the
//! write dispatcher, the command history, an optional session log and
//! the output hub every consumer subscribes to. The hub and the history
//! outlive individual connections; framer, dispatcher, reader and
//! counters are rebuilt on every open.

use crate::serial::config::{validate_params, SessionConfig};
use crate::serial::error::{SerialError, SerialResult};
use crate::serial::framer::Framer;
use crate::serial::history::CommandHistory;
use crate::serial::hub::{HubSubscriber, OutputHub};
use crate::serial::logging::{LogSink, LogSummary};
use crate::serial::reader::{spawn_reader, ReaderContext, ReaderHandle};
use crate::serial::transport::{SerialTransport, SystemTransport};
use crate::serial::types::*;
use crate::serial::writer::{RepeatTask, WriteDispatcher};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// Resources of the currently open connection.
struct Link {
    transport: Arc<dyn SerialTransport>,
    dispatcher: Arc<WriteDispatcher>,
    framer: Arc<Mutex<Framer>>,
    reader: ReaderHandle,
    repeat: Option<RepeatTask>,
}

/// A serial terminal session.
pub struct SerialSession {
    config: Mutex<SessionConfig>,
    /// Injected transport; `None` opens the OS device named in the
    /// connection parameters.
    fixed_transport: Option<Arc<dyn SerialTransport>>,
    hub: OutputHub,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    link: Mutex<Option<Link>>,
    history: Mutex<CommandHistory>,
    log: Mutex<Option<LogSink>>,
    counters: Mutex<Arc<SessionCounters>>,
}

impl SerialSession {
    /// Session that opens OS serial devices.
    pub fn new(config: SessionConfig) -> Self {
        Self::build(None, config)
    }

    /// Session bound to a specific transport.
    pub fn with_transport(transport: Arc<dyn SerialTransport>, config: SessionConfig) -> Self {
        Self::build(Some(transport), config)
    }

    fn build(fixed_transport: Option<Arc<dyn SerialTransport>>, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            hub: OutputHub::new(config.hub_capacity),
            history: Mutex::new(CommandHistory::new(config.history_capacity)),
            config: Mutex::new(config),
            fixed_transport,
            state_tx: Arc::new(state_tx),
            link: Mutex::new(None),
            log: Mutex::new(None),
            counters: Mutex::new(Arc::new(SessionCounters::default())),
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open the device and start the reader.
    ///
    /// Allowed from `Closed` and `Failed`. The framer starts from a clean
    /// state, so stream offsets restart at zero. On error the session
    /// is left `Closed`.
    pub async fn open(&self, params: ConnectionParams) -> SerialResult<()> {
        validate_params(&params)?;
        let encoding = params.text_encoding().ok_or_else(|| {
            SerialError::invalid_config(format!("unknown text encoding '{}'", params.encoding))
        })?;

        let mut link = self.link.lock().await;
        match self.state() {
            ConnectionState::Closed | ConnectionState::Failed(_) => {}
            other => {
                return Err(SerialError::connection(format!(
                    "cannot open while {}",
                    other.label()
                ))
                .with_port(&params.port_name))
            }
        }
        // Leftovers of a failed connection.
        if let Some(stale) = link.take() {
            let _ = Self::teardown(stale).await;
        }

        self.set_state(ConnectionState::Opening);
        let transport: Arc<dyn SerialTransport> = match self.fixed_transport {
            Some(ref t) => t.clone(),
            None => SystemTransport::new(params.port_name.clone()),
        };
        if let Err(e) = transport.open(&params).await {
            log::error!("[serial:{}] open failed: {}", params.port_name, e);
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }

        let config = {
            let mut config = self.config.lock().await;
            config.connection = params.clone();
            config.clone()
        };

        if let Some(ref path) = config.log.path {
            if let Err(e) = self.ensure_log(path, &config).await {
                let _ = transport.close().await;
                self.set_state(ConnectionState::Closed);
                return Err(e);
            }
        }

        let counters = Arc::new(SessionCounters::default());
        *self.counters.lock().await = counters.clone();
        let framer = Arc::new(Mutex::new(Framer::new(
            params.port_name.clone(),
            config.render_mode,
            encoding,
            config.hex_group_width,
            config.replacement.clone(),
        )));
        let dispatcher = Arc::new(WriteDispatcher::new(
            transport.clone(),
            self.hub.clone(),
            encoding,
            config.line_ending,
            counters.clone(),
        ));

        self.set_state(ConnectionState::Open);
        let reader = spawn_reader(ReaderContext {
            transport: transport.clone(),
            framer: framer.clone(),
            hub: self.hub.clone(),
            connection: self.state_tx.clone(),
            counters,
            idle_flush: config.idle_flush,
            read_chunk: config.read_chunk,
        });

        *link = Some(Link {
            transport,
            dispatcher,
            framer,
            reader,
            repeat: None,
        });
        log::info!("[serial:{}] opened ({})", params.port_name, params.shorthand());
        Ok(())
    }

    /// Stop the reader, flush pending output and release the device.
    /// Closing a closed session is a no-op.
    pub async fn close(&self) -> SerialResult<()> {
        let mut link = self.link.lock().await;
        let active = match link.take() {
            Some(active) => active,
            None => {
                if !matches!(self.state(), ConnectionState::Closed) {
                    self.set_state(ConnectionState::Closed);
                }
                return Ok(());
            }
        };
        let port = active.transport.port_name().to_string();
        self.set_state(ConnectionState::Closing);
        let result = Self::teardown(active).await;
        self.set_state(ConnectionState::Closed);
        log::info!("[serial:{}] closed", port);
        result
    }

    async fn teardown(link: Link) -> SerialResult<()> {
        if let Some(repeat) = link.repeat {
            repeat.stop().await;
        }
        link.reader.stop().await;
        if !link.transport.is_open() {
            return Ok(());
        }
        link.transport.close().await.map_err(|e| {
            log::warn!("[serial:{}] close: {}", link.transport.port_name(), e);
            e
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.hub.publish(HubMessage::State(state.clone()));
        self.state_tx.send_replace(state);
    }

    async fn port_name(&self) -> String {
        self.config.lock().await.connection.port_name.clone()
    }

    async fn dispatcher(&self) -> SerialResult<Arc<WriteDispatcher>> {
        match *self.link.lock().await {
            Some(ref active) if self.state().is_open() => Ok(active.dispatcher.clone()),
            _ => Err(SerialError::not_connected(&self.port_name().await)),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────

    /// Send an operator command; the configured terminator is appended.
    /// The command is added to history even if the write fails.
    pub async fn send(&self, text: &str) -> SerialResult<OutgoingRecord> {
        let dispatcher = self.dispatcher().await?;
        self.history.lock().await.record(text);
        dispatcher.send(text).await
    }

    /// Send hex digits as raw bytes, without terminator.
    pub async fn send_hex(&self, input: &str) -> SerialResult<OutgoingRecord> {
        let dispatcher = self.dispatcher().await?;
        self.history.lock().await.record(input.trim());
        dispatcher.send_hex(input).await
    }

    /// Re-send `command` every `interval` until stopped, closed, or a
    /// send fails. Replaces any repeat already running.
    pub async fn start_repeat(&self, command: &str, interval: Duration) -> SerialResult<()> {
        let mut link = self.link.lock().await;
        let active = match link.as_mut() {
            Some(active) if self.state().is_open() => active,
            _ => return Err(SerialError::not_connected(&self.port_name().await)),
        };
        let task = RepeatTask::start(active.dispatcher.clone(), command, interval)?;
        if let Some(previous) = active.repeat.replace(task) {
            previous.stop().await;
        }
        Ok(())
    }

    /// Returns `true` if a repeat was running.
    pub async fn stop_repeat(&self) -> bool {
        let repeat = match *self.link.lock().await {
            Some(ref mut active) => active.repeat.take(),
            None => None,
        };
        match repeat {
            Some(task) => {
                task.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_repeating(&self) -> bool {
        match *self.link.lock().await {
            Some(ref active) => active.repeat.as_ref().map_or(false, |r| !r.is_finished()),
            None => false,
        }
    }

    // ── Settings ─────────────────────────────────────────────────────

    /// Switch between text and hex rendering. Output pending in the old
    /// mode is emitted before anything in the new one.
    pub async fn set_render_mode(&self, mode: RenderMode) {
        self.config.lock().await.render_mode = mode;
        let framer = match *self.link.lock().await {
            Some(ref active) => active.framer.clone(),
            None => return,
        };
        let mut framer = framer.lock().await;
        let units = framer.set_mode(mode);
        let counters = self.counters.lock().await.clone();
        counters
            .units_rx
            .fetch_add(units.len() as u64, Ordering::Relaxed);
        for unit in units {
            self.hub.publish(HubMessage::inbound(unit));
        }
    }

    pub async fn set_line_ending(&self, line_ending: LineEnding) {
        self.config.lock().await.line_ending = line_ending;
        if let Some(ref active) = *self.link.lock().await {
            active.dispatcher.set_line_ending(line_ending).await;
        }
    }

    pub async fn set_dtr(&self, state: bool) -> SerialResult<()> {
        let transport = match *self.link.lock().await {
            Some(ref active) if self.state().is_open() => active.transport.clone(),
            _ => return Err(SerialError::not_connected(&self.port_name().await)),
        };
        transport.set_dtr(state).await?;
        self.config.lock().await.connection.dtr = state;
        log::debug!("[serial:{}] DTR {}", transport.port_name(), if state { "on" } else { "off" });
        Ok(())
    }

    // ── History ──────────────────────────────────────────────────────

    pub async fn navigate_history(&self, direction: HistoryDirection) -> Option<String> {
        self.history.lock().await.navigate(direction)
    }

    pub async fn history(&self) -> Vec<String> {
        self.history.lock().await.entries()
    }

    // ── Session log ──────────────────────────────────────────────────

    /// Start logging hub output to `path` (appending). A log already
    /// attached is detached first.
    pub async fn attach_log(&self, path: impl AsRef<Path>) -> SerialResult<()> {
        let log_config = self.config.lock().await.log.clone();
        let mut log = self.log.lock().await;
        if let Some(previous) = log.take() {
            if let Err(e) = previous.detach().await {
                log::warn!("[serial:log] previous log closed with errors: {}", e);
            }
        }
        *log = Some(LogSink::attach(path, log_config, &self.hub)?);
        Ok(())
    }

    /// Flush and close the session log. `Ok(None)` if none was attached.
    pub async fn detach_log(&self) -> SerialResult<Option<LogSummary>> {
        match self.log.lock().await.take() {
            Some(sink) => sink.detach().await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn is_logging(&self) -> bool {
        self.log.lock().await.is_some()
    }

    async fn ensure_log(&self, path: &Path, config: &SessionConfig) -> SerialResult<()> {
        let mut log = self.log.lock().await;
        if log.is_none() {
            *log = Some(LogSink::attach(path, config.log.clone(), &self.hub)?);
        }
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────────

    /// New consumer of everything published from now on.
    pub fn subscribe(&self) -> HubSubscriber {
        self.hub.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// `Idle` when no connection has been opened yet.
    pub async fn reader_state(&self) -> ReaderState {
        match *self.link.lock().await {
            Some(ref active) => active.reader.state(),
            None if matches!(self.state(), ConnectionState::Closed) => ReaderState::Idle,
            None => ReaderState::Stopped,
        }
    }

    /// Counters of the current (or last) connection.
    pub async fn stats(&self) -> SessionStats {
        self.counters.lock().await.snapshot()
    }

    pub async fn config(&self) -> SessionConfig {
        self.config.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::error::SerialErrorKind;
    use crate::serial::hub::HubEvent;
    use crate::serial::transport::SimulatedTransport;

    fn params() -> ConnectionParams {
        ConnectionParams {
            read_timeout_ms: 10,
            ..ConnectionParams::new("SIM0")
        }
    }

    fn session() -> (Arc<SimulatedTransport>, SerialSession) {
        let t = SimulatedTransport::new("SIM0");
        let s = SerialSession::with_transport(t.clone(), SessionConfig::for_port("SIM0"));
        (t, s)
    }

    fn states(sub: &mut HubSubscriber) -> Vec<&'static str> {
        sub.drain_messages()
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::State(s) => Some(s.label()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_open_close_lifecycle() {
        let (t, s) = session();
        let mut sub = s.subscribe();
        assert_eq!(s.state(), ConnectionState::Closed);
        assert_eq!(s.reader_state().await, ReaderState::Idle);

        s.open(params()).await.unwrap();
        assert!(s.state().is_open());
        assert!(t.is_open());
        assert!(t.dtr());

        s.close().await.unwrap();
        assert_eq!(s.state(), ConnectionState::Closed);
        assert!(!t.is_open());
        let open = ConnectionState::Open.label();
        let closed = ConnectionState::Closed.label();
        let got = states(&mut sub);
        assert_eq!(got.first().copied(), Some(ConnectionState::Opening.label()));
        assert!(got.contains(&open));
        assert_eq!(got.last().copied(), Some(closed));

        // idempotent
        s.close().await.unwrap();
        assert!(states(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let (_t, s) = session();
        s.open(params()).await.unwrap();
        let err = s.open(params()).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::Connection);
        assert!(s.state().is_open());
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_port_leaves_session_closed() {
        let (t, s) = session();
        t.set_busy(true);
        let err = s.open(params()).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::Connection);
        assert_eq!(s.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_params_rejected_before_open() {
        let (t, s) = session();
        let bad = ConnectionParams {
            baud_rate: 0,
            ..params()
        };
        assert_eq!(s.open(bad).await.unwrap_err().kind, SerialErrorKind::InvalidConfig);
        assert!(!t.is_open());
        assert_eq!(s.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (_t, s) = session();
        assert_eq!(s.send("AT").await.unwrap_err().kind, SerialErrorKind::NotConnected);
        assert_eq!(s.set_dtr(false).await.unwrap_err().kind, SerialErrorKind::NotConnected);
        assert!(s.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_records_history_and_stats() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        s.send("AT").await.unwrap();
        s.send("ATI").await.unwrap();
        assert_eq!(t.drain_tx().await, b"AT\r\nATI\r\n");
        assert_eq!(s.navigate_history(HistoryDirection::Older).await.as_deref(), Some("ATI"));
        assert_eq!(s.navigate_history(HistoryDirection::Older).await.as_deref(), Some("AT"));
        let stats = s.stats().await;
        assert_eq!(stats.commands_tx, 2);
        assert_eq!(stats.bytes_tx, 9);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_line_ending_change_applies_to_next_send() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        s.set_line_ending(LineEnding::Lf).await;
        s.send("A").await.unwrap();
        assert_eq!(t.drain_tx().await, b"A\n");
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_restarts_offsets() {
        let t = SimulatedTransport::new("SIM0");
        let config = SessionConfig {
            render_mode: RenderMode::Hex,
            ..SessionConfig::for_port("SIM0")
        };
        let s = SerialSession::with_transport(t.clone(), config);
        let mut sub = s.subscribe();

        for _ in 0..2 {
            s.open(params()).await.unwrap();
            t.inject_rx(&[0xAA, 0xBB, 0xCC]).await;
            tokio::time::sleep(Duration::from_millis(60)).await;
            s.close().await.unwrap();
        }
        let offsets: Vec<u64> = sub
            .drain_messages()
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::Inbound { unit: RenderUnit::Hex { offset, .. }, .. } => Some(offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 0]);
    }

    #[tokio::test]
    async fn test_hex_groups_stay_whole_across_idle_gap() {
        let t = SimulatedTransport::new("SIM0");
        let config = SessionConfig {
            render_mode: RenderMode::Hex,
            hex_group_width: 2,
            ..SessionConfig::for_port("SIM0")
        };
        let s = SerialSession::with_transport(t.clone(), config);
        let mut sub = s.subscribe();

        s.open(params()).await.unwrap();
        t.inject_rx(&[0x41, 0x42, 0x43]).await;
        // several read timeouts with no data
        tokio::time::sleep(Duration::from_millis(60)).await;
        t.inject_rx(&[0x44]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.close().await.unwrap();

        let groups: Vec<(u64, Vec<u8>)> = sub
            .drain_messages()
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::Inbound {
                    unit: RenderUnit::Hex { offset, bytes },
                    ..
                } => Some((offset, bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(groups, vec![(0, vec![0x41, 0x42]), (2, vec![0x43, 0x44])]);
    }

    #[tokio::test]
    async fn test_reopen_discards_carried_bytes() {
        let (t, s) = session();
        let mut sub = s.subscribe();

        s.open(params()).await.unwrap();
        // first byte of a two-byte character, completed only after reopen
        t.inject_rx(&[b'a', 0xC3]).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        s.close().await.unwrap();

        s.open(params()).await.unwrap();
        t.inject_rx(&[0xA9, b'\n']).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        s.close().await.unwrap();

        let text: String = sub
            .drain_messages()
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::Inbound { unit, .. } => Some(unit.render()),
                _ => None,
            })
            .collect();
        assert!(!text.contains('\u{e9}'), "{:?}", text);
        assert_eq!(text, "a\u{FFFD}\u{FFFD}\n");
    }

    #[tokio::test]
    async fn test_render_mode_switch_flushes_pending_text() {
        let (t, s) = session();
        let config_mode = s.config().await.render_mode;
        assert_eq!(config_mode, RenderMode::Text);
        s.open(ConnectionParams {
            read_timeout_ms: 500,
            ..params()
        })
        .await
        .unwrap();
        let mut sub = s.subscribe();
        t.inject_rx(b"abc").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.set_render_mode(RenderMode::Hex).await;
        t.inject_rx(&[0x01]).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.close().await.unwrap();

        let inbound: Vec<RenderUnit> = sub
            .drain_messages()
            .into_iter()
            .filter_map(|m| match m {
                HubMessage::Inbound { unit, .. } => Some(unit),
                _ => None,
            })
            .collect();
        assert_eq!(
            inbound,
            vec![
                RenderUnit::Text { text: "abc".into() },
                RenderUnit::Hex { offset: 3, bytes: vec![0x01] },
            ]
        );
        assert_eq!(s.config().await.render_mode, RenderMode::Hex);
    }

    #[tokio::test]
    async fn test_failure_then_reopen() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        let mut state = s.watch_state();
        t.unplug();
        let failed = state.wait_for(|s| matches!(s, ConnectionState::Failed(_)));
        tokio::time::timeout(Duration::from_secs(2), failed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.send("X").await.unwrap_err().kind, SerialErrorKind::NotConnected);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.reader_state().await, ReaderState::Stopped);

        s.open(params()).await.unwrap();
        assert!(s.state().is_open());
        s.send("X").await.unwrap();
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_dtr() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        s.set_dtr(false).await.unwrap();
        assert!(!t.dtr());
        assert!(!s.config().await.connection.dtr);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_repeat_lifecycle() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        s.start_repeat("PING", Duration::from_millis(20)).await.unwrap();
        assert!(s.is_repeating().await);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(s.stop_repeat().await);
        assert!(!s.stop_repeat().await);
        assert!(t.drain_tx().await.starts_with(b"PING\r\n"));
        assert_eq!(
            s.start_repeat("PING", Duration::from_millis(1)).await.unwrap_err().kind,
            SerialErrorKind::InvalidConfig
        );
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_repeat() {
        let (t, s) = session();
        s.open(params()).await.unwrap();
        s.start_repeat("PING", Duration::from_millis(20)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.close().await.unwrap();
        assert!(!s.is_repeating().await);
        t.drain_tx().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(t.drain_tx().await.is_empty());
    }

    #[tokio::test]
    async fn test_log_attached_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto.log");
        let t = SimulatedTransport::new("SIM0");
        let mut config = SessionConfig::for_port("SIM0");
        config.log.path = Some(path.clone());
        let s = SerialSession::with_transport(t.clone(), config);

        s.open(params()).await.unwrap();
        assert!(s.is_logging().await);
        s.send("AT").await.unwrap();
        s.close().await.unwrap();
        let summary = s.detach_log().await.unwrap().unwrap();
        assert_eq!(summary.records, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "AT\r\n");
        assert!(s.detach_log().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_sees_state_events() {
        let (_t, s) = session();
        let mut sub = s.subscribe();
        s.open(params()).await.unwrap();
        match sub.recv().await {
            HubEvent::Message(HubMessage::State(ConnectionState::Opening)) => {}
            other => panic!("unexpected {:?}", other),
        }
        s.close().await.unwrap();
    }
}
