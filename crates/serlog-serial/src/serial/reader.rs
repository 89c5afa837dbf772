//! Background reader loop.
//!
//! One task per open connection. Each turn races a bounded transport
//! read against the stop signal, so a close never waits on the device.
//! Received bytes go through the shared framer and out to the hub in
//! read order. A transport error marks the connection failed and ends
//! the loop; there is no automatic retry.

use crate::serial::framer::Framer;
use crate::serial::hub::OutputHub;
use crate::serial::transport::SerialTransport;
use crate::serial::types::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Everything the reader task needs.
pub struct ReaderContext {
    pub transport: Arc<dyn SerialTransport>,
    pub framer: Arc<Mutex<Framer>>,
    pub hub: OutputHub,
    pub connection: Arc<watch::Sender<ConnectionState>>,
    pub counters: Arc<SessionCounters>,
    pub idle_flush: bool,
    pub read_chunk: usize,
}

/// Owner's handle on a running reader task.
pub struct ReaderHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ReaderState>,
    handle: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn state(&self) -> ReaderState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ReaderState> {
        self.state_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the loop to stop and wait until it has flushed and exited.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            log::error!("[serial:reader] task ended abnormally: {}", e);
        }
    }
}

/// Start the reader loop for an open transport.
pub fn spawn_reader(ctx: ReaderContext) -> ReaderHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(ReaderState::Idle);
    let handle = tokio::spawn(run(ctx, stop_rx, state_tx));
    ReaderHandle {
        stop_tx,
        state_rx,
        handle,
    }
}

async fn run(
    ctx: ReaderContext,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ReaderState>,
) {
    let port = ctx.transport.port_name().to_string();
    let mut buf = vec![0u8; ctx.read_chunk.max(1)];
    state_tx.send_replace(ReaderState::Running);
    log::debug!("[serial:{}] reader started", port);

    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            result = ctx.transport.read(&mut buf) => match result {
                Ok(0) => {
                    if ctx.idle_flush {
                        let mut framer = ctx.framer.lock().await;
                        let units = framer.flush();
                        publish_units(&ctx, units);
                    }
                }
                Ok(n) => {
                    ctx.counters.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                    let mut framer = ctx.framer.lock().await;
                    let units = framer.feed(&buf[..n]);
                    ctx.counters
                        .replacements
                        .store(framer.replacements(), Ordering::Relaxed);
                    publish_units(&ctx, units);
                }
                Err(e) => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    log::error!("[serial:{}] read error: {}", port, e);
                    state_tx.send_replace(ReaderState::Stopping);
                    finish(&ctx).await;
                    let failed = ConnectionState::Failed(e.message.clone());
                    ctx.hub.publish(HubMessage::State(failed.clone()));
                    ctx.connection.send_replace(failed);
                    if let Err(close_err) = ctx.transport.close().await {
                        log::warn!("[serial:{}] release after failure: {}", port, close_err);
                    }
                    state_tx.send_replace(ReaderState::Stopped);
                    return;
                }
            }
        }
    }

    state_tx.send_replace(ReaderState::Stopping);
    finish(&ctx).await;
    state_tx.send_replace(ReaderState::Stopped);
    log::debug!("[serial:{}] reader stopped", port);
}

async fn finish(ctx: &ReaderContext) {
    let mut framer = ctx.framer.lock().await;
    let units = framer.finish();
    ctx.counters
        .replacements
        .store(framer.replacements(), Ordering::Relaxed);
    publish_units(ctx, units);
}

fn publish_units(ctx: &ReaderContext, units: Vec<RenderUnit>) {
    if units.is_empty() {
        return;
    }
    ctx.counters
        .units_rx
        .fetch_add(units.len() as u64, Ordering::Relaxed);
    for unit in units {
        ctx.hub.publish(HubMessage::inbound(unit));
    }
}
