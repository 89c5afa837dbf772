//! Serial port transport abstraction.
//!
//! `SerialTransport` is the only seam between the session engine and a
//! device. `SystemTransport` drives a real port through the blocking
//! `serialport` crate, moving every driver call onto tokio's blocking
//! pool. `SimulatedTransport` is fully in-memory and used by tests and
//! demos; it can loop TX back to RX, pace writes byte by byte, refuse to
//! open, fail writes, and simulate the device being unplugged.

use crate::serial::config::validate_params;
use crate::serial::error::{SerialError, SerialResult};
use crate::serial::types::*;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Platform-agnostic serial port transport.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from the reader task and writer callers at once.
#[async_trait::async_trait]
pub trait SerialTransport: Send + Sync {
    /// Claim the device with the given parameters.
    async fn open(&self, params: &ConnectionParams) -> SerialResult<()>;

    /// Release the device. A read in flight returns within one read
    /// timeout.
    async fn close(&self) -> SerialResult<()>;

    /// Read up to `buf.len()` bytes. Waits at most the configured read
    /// timeout and returns `Ok(0)` when nothing arrived.
    async fn read(&self, buf: &mut [u8]) -> SerialResult<usize>;

    /// Write the whole buffer and flush it to the device.
    async fn write(&self, buf: &[u8]) -> SerialResult<()>;

    /// Set DTR (Data Terminal Ready). Idempotent.
    async fn set_dtr(&self, state: bool) -> SerialResult<()>;

    /// Check whether the port is open.
    fn is_open(&self) -> bool;

    /// Retrieve the port name.
    fn port_name(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  OS transport (serialport crate)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type PortHandle = Box<dyn serialport::SerialPort>;
type PortSlot = Arc<std::sync::Mutex<Option<PortHandle>>>;

/// Transport backed by an OS serial device.
///
/// The port is cloned at open so that the reader and the writer hold
/// independent handles and never wait on each other.
pub struct SystemTransport {
    name: String,
    open: AtomicBool,
    reader: PortSlot,
    writer: PortSlot,
}

impl SystemTransport {
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            reader: Arc::new(std::sync::Mutex::new(None)),
            writer: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    fn builder(&self, params: &ConnectionParams) -> SerialResult<serialport::SerialPortBuilder> {
        let data_bits = match params.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = match params.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
            Parity::Mark | Parity::Space => {
                return Err(SerialError::invalid_config(format!(
                    "parity '{}' is not supported by the OS driver",
                    params.parity.label()
                ))
                .with_port(&self.name))
            }
        };
        let stop_bits = match params.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(SerialError::invalid_config(
                    "1.5 stop bits are not supported by the OS driver",
                )
                .with_port(&self.name))
            }
        };
        let flow_control = match params.handshake {
            Handshake::None => serialport::FlowControl::None,
            Handshake::RtsCts => serialport::FlowControl::Hardware,
            Handshake::XonXoff => serialport::FlowControl::Software,
        };
        Ok(serialport::new(&self.name, params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(params.read_timeout_ms)))
    }

    fn lock(slot: &PortSlot) -> SerialResult<std::sync::MutexGuard<'_, Option<PortHandle>>> {
        slot.lock()
            .map_err(|_| SerialError::transport("port mutex poisoned"))
    }
}

fn join_error(e: tokio::task::JoinError) -> SerialError {
    SerialError::transport(format!("blocking serial task failed: {}", e))
}

#[async_trait::async_trait]
impl SerialTransport for SystemTransport {
    async fn open(&self, params: &ConnectionParams) -> SerialResult<()> {
        if self.open.load(Ordering::SeqCst) {
            return Err(SerialError::connection(format!("Port {} already open", self.name))
                .with_port(&self.name));
        }
        validate_params(params)?;
        let builder = self.builder(params)?;
        let dtr = params.dtr;
        let name = self.name.clone();

        let (reader, writer) = tokio::task::spawn_blocking(move || -> SerialResult<_> {
            let mut port = builder
                .open()
                .map_err(|e| SerialError::from(e).with_port(&name))?;
            port.write_data_terminal_ready(dtr)
                .map_err(|e| SerialError::from(e).with_port(&name))?;
            let writer = port
                .try_clone()
                .map_err(|e| SerialError::from(e).with_port(&name))?;
            Ok((port, writer))
        })
        .await
        .map_err(join_error)??;

        *Self::lock(&self.reader)? = Some(reader);
        *Self::lock(&self.writer)? = Some(writer);
        self.open.store(true, Ordering::SeqCst);
        log::info!(
            "[serial:{}] opened at {} ({:?} handshake)",
            self.name,
            params.shorthand(),
            params.handshake
        );
        Ok(())
    }

    async fn close(&self) -> SerialResult<()> {
        self.open.store(false, Ordering::SeqCst);
        let reader = self.reader.clone();
        let writer = self.writer.clone();
        // Taking the reader slot waits for an in-flight read, which is
        // bounded by the port timeout.
        tokio::task::spawn_blocking(move || -> SerialResult<()> {
            Self::lock(&writer)?.take();
            Self::lock(&reader)?.take();
            Ok(())
        })
        .await
        .map_err(join_error)??;
        log::info!("[serial:{}] closed", self.name);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> SerialResult<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::not_connected(&self.name));
        }
        let reader = self.reader.clone();
        let name = self.name.clone();
        let len = buf.len();

        let chunk = tokio::task::spawn_blocking(move || -> SerialResult<Vec<u8>> {
            let mut guard = Self::lock(&reader)?;
            let port = match guard.as_mut() {
                Some(port) => port,
                // Closed while this read was queued.
                None => return Ok(Vec::new()),
            };
            let mut tmp = vec![0u8; len];
            match port.read(&mut tmp) {
                Ok(0) => Err(
                    SerialError::transport("device reported end of stream").with_port(&name)
                ),
                Ok(n) => {
                    tmp.truncate(n);
                    Ok(tmp)
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => {
                    Err(SerialError::transport(format!("read failed: {}", e)).with_port(&name))
                }
            }
        })
        .await
        .map_err(join_error)??;

        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn write(&self, buf: &[u8]) -> SerialResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::not_connected(&self.name));
        }
        let writer = self.writer.clone();
        let name = self.name.clone();
        let data = buf.to_vec();

        tokio::task::spawn_blocking(move || -> SerialResult<()> {
            let mut guard = Self::lock(&writer)?;
            let port = guard
                .as_mut()
                .ok_or_else(|| SerialError::not_connected(&name))?;
            port.write_all(&data)
                .and_then(|_| port.flush())
                .map_err(|e| {
                    SerialError::transport(format!("write failed: {}", e)).with_port(&name)
                })
        })
        .await
        .map_err(join_error)?
    }

    async fn set_dtr(&self, state: bool) -> SerialResult<()> {
        let writer = self.writer.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || -> SerialResult<()> {
            let mut guard = Self::lock(&writer)?;
            let port = guard
                .as_mut()
                .ok_or_else(|| SerialError::not_connected(&name))?;
            port.write_data_terminal_ready(state)
                .map_err(|e| SerialError::from(e).with_port(&name))
        })
        .await
        .map_err(join_error)?
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory transport useful for unit tests and demos.
pub struct SimulatedTransport {
    name: String,
    open: AtomicBool,
    read_timeout: Mutex<Duration>,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<Vec<u8>>,
    rx_notify: Notify,
    dtr: AtomicBool,
    loopback: AtomicBool,
    paced_writes: AtomicBool,
    busy: AtomicBool,
    fail_writes: AtomicBool,
    unplugged: AtomicBool,
}

impl SimulatedTransport {
    /// Create a new simulated transport for the given port name.
    pub fn new(port_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: port_name.into(),
            open: AtomicBool::new(false),
            read_timeout: Mutex::new(Duration::from_millis(50)),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(Vec::with_capacity(4096)),
            rx_notify: Notify::new(),
            dtr: AtomicBool::new(false),
            loopback: AtomicBool::new(false),
            paced_writes: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            unplugged: AtomicBool::new(false),
        })
    }

    /// Enable loopback mode (TX data is immediately available in RX).
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Write one byte at a time, yielding between bytes.
    pub fn set_paced_writes(&self, enabled: bool) {
        self.paced_writes.store(enabled, Ordering::SeqCst);
    }

    /// Make `open` fail as if another process held the port.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Make every write fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate the device disappearing: pending and future reads fail.
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::SeqCst);
        self.rx_notify.notify_one();
    }

    /// Inject bytes into the receive buffer (simulate incoming data).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_one();
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        std::mem::take(&mut *buf)
    }

    /// Current DTR level.
    pub fn dtr(&self) -> bool {
        self.dtr.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedTransport {
    async fn open(&self, params: &ConnectionParams) -> SerialResult<()> {
        if self.open.load(Ordering::SeqCst) || self.busy.load(Ordering::SeqCst) {
            return Err(SerialError::connection(format!("Port {} is busy", self.name))
                .with_port(&self.name));
        }
        validate_params(params)?;
        *self.read_timeout.lock().await = Duration::from_millis(params.read_timeout_ms);
        self.rx_buf.lock().await.clear();
        self.unplugged.store(false, Ordering::SeqCst);
        self.dtr.store(params.dtr, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> SerialResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.dtr.store(false, Ordering::SeqCst);
        self.rx_notify.notify_one();
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> SerialResult<usize> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::not_connected(&self.name));
        }
        let timeout = *self.read_timeout.lock().await;
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() && !self.unplugged.load(Ordering::SeqCst) {
            drop(rx);
            // Wait for data, unplug or close, bounded by the read timeout.
            let _ = tokio::time::timeout(timeout, self.rx_notify.notified()).await;
            rx = self.rx_buf.lock().await;
        }
        if self.unplugged.load(Ordering::SeqCst) {
            return Err(SerialError::transport("device disconnected").with_port(&self.name));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let count = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> SerialResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::not_connected(&self.name));
        }
        if self.unplugged.load(Ordering::SeqCst) || self.fail_writes.load(Ordering::SeqCst) {
            return Err(SerialError::transport("write failed: broken pipe").with_port(&self.name));
        }
        if self.paced_writes.load(Ordering::SeqCst) {
            for byte in buf {
                self.tx_buf.lock().await.push(*byte);
                tokio::task::yield_now().await;
            }
        } else {
            self.tx_buf.lock().await.extend_from_slice(buf);
        }

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(buf).await;
        }
        Ok(())
    }

    async fn set_dtr(&self, state: bool) -> SerialResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SerialError::not_connected(&self.name));
        }
        self.dtr.store(state, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn port_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::error::SerialErrorKind;

    fn params() -> ConnectionParams {
        ConnectionParams {
            read_timeout_ms: 20,
            ..ConnectionParams::new("SIM0")
        }
    }

    #[tokio::test]
    async fn test_simulated_transport_open_close() {
        let t = SimulatedTransport::new("SIM0");
        assert!(!t.is_open());
        t.open(&params()).await.unwrap();
        assert!(t.is_open());
        assert!(t.dtr());
        t.close().await.unwrap();
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_simulated_transport_write_read() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&params()).await.unwrap();

        t.inject_rx(b"Hello").await;
        let mut buf = [0u8; 64];
        let n = t.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello");
    }

    #[tokio::test]
    async fn test_read_times_out_with_zero() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&params()).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(t.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_simulated_transport_loopback() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&params()).await.unwrap();
        t.set_loopback(true);

        t.write(b"echo").await.unwrap();
        let mut buf = [0u8; 64];
        let n = t.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"echo");
        assert_eq!(t.drain_tx().await, b"echo");
    }

    #[tokio::test]
    async fn test_busy_port_refuses_open() {
        let t = SimulatedTransport::new("SIM0");
        t.set_busy(true);
        let err = t.open(&params()).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::Connection);
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_invalid_params_refuse_open() {
        let t = SimulatedTransport::new("SIM0");
        let mut p = params();
        p.baud_rate = 0;
        let err = t.open(&p).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_unplug_fails_pending_read() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&ConnectionParams {
            read_timeout_ms: 5_000,
            ..ConnectionParams::new("SIM0")
        })
        .await
        .unwrap();

        let reader = t.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.unplug();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind, SerialErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_close_releases_pending_read() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&ConnectionParams {
            read_timeout_ms: 5_000,
            ..ConnectionParams::new("SIM0")
        })
        .await
        .unwrap();

        let reader = t.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_when_closed() {
        let t = SimulatedTransport::new("SIM0");
        let mut buf = [0u8; 8];
        assert_eq!(
            t.read(&mut buf).await.unwrap_err().kind,
            SerialErrorKind::NotConnected
        );
        assert!(t.write(b"x").await.is_err());
        assert!(t.set_dtr(true).await.is_err());
    }

    #[tokio::test]
    async fn test_set_dtr_is_idempotent() {
        let t = SimulatedTransport::new("SIM0");
        t.open(&params()).await.unwrap();
        t.set_dtr(false).await.unwrap();
        t.set_dtr(false).await.unwrap();
        assert!(!t.dtr());
        t.set_dtr(true).await.unwrap();
        assert!(t.dtr());
    }

    #[tokio::test]
    async fn test_system_transport_rejects_unsupported_framing() {
        let t = SystemTransport::new("/dev/does-not-exist");
        let p = ConnectionParams {
            parity: Parity::Mark,
            ..ConnectionParams::new("/dev/does-not-exist")
        };
        let err = t.open(&p).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::InvalidConfig);
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_system_transport_missing_device() {
        let t = SystemTransport::new("/dev/serlog-missing-port");
        let err = t
            .open(&ConnectionParams::new("/dev/serlog-missing-port"))
            .await
            .unwrap_err();
        assert!(err.requires_reopen() || err.kind == SerialErrorKind::InvalidConfig);
        assert!(!t.is_open());
    }
}
