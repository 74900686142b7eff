//! Dispatcher: serializes detector input and timer ticks onto one OS thread.
//! Detectors submit through an unbounded crossbeam channel and never block;
//! the loop owns all calls into the session controller.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use tracing::{debug, info, warn};

use crate::knock::{KnockEvent, KnockRecord};
use crate::metrics::{Metric, MetricsRegistry};
use crate::session::{SessionController, SessionError};

#[derive(Debug)]
pub enum Command {
    Knock {
        event: KnockEvent,
        enqueued_at: Instant,
    },
    /// Untyped detector output; parsed on the loop thread.
    Record(KnockRecord),
    Finalize,
    Discard,
    Shutdown,
}

/// Cloneable submit side of the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: cb::Sender<Command>,
}

impl DispatchHandle {
    pub fn submit_knock(&self, event: KnockEvent) {
        let _ = self.tx.send(Command::Knock {
            event,
            enqueued_at: Instant::now(),
        });
    }

    pub fn submit_record(&self, record: KnockRecord) {
        let _ = self.tx.send(Command::Record(record));
    }

    pub fn finalize(&self) {
        let _ = self.tx.send(Command::Finalize);
    }

    /// Abandon the open session, e.g. when capture is stopped externally.
    pub fn discard(&self) {
        let _ = self.tx.send(Command::Discard);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Start the dispatch loop on a dedicated thread. It exits on `shutdown()` or once
/// every handle is dropped.
pub fn spawn_dispatcher(
    controller: Arc<SessionController>,
    metrics: Arc<MetricsRegistry>,
    tick_interval: Duration,
) -> std::io::Result<(DispatchHandle, JoinHandle<()>)> {
    let (tx, rx) = cb::unbounded();
    let join = std::thread::Builder::new()
        .name("knock-dispatch".into())
        .spawn(move || run_dispatch_loop(rx, &controller, &metrics, tick_interval))?;
    Ok((DispatchHandle { tx }, join))
}

fn run_dispatch_loop(
    rx: cb::Receiver<Command>,
    controller: &SessionController,
    metrics: &MetricsRegistry,
    tick_interval: Duration,
) {
    let ticker = cb::tick(tick_interval);
    info!(tick_ms = tick_interval.as_millis() as u64, "dispatch loop started");

    loop {
        cb::select! {
            recv(rx) -> msg => match msg {
                Ok(Command::Shutdown) | Err(cb::RecvError) => break,
                Ok(cmd) => handle_command(cmd, controller, metrics),
            },
            recv(ticker) -> _ => {
                if let Err(e) = controller.tick() {
                    warn!(error = %e, "tick failed");
                }
            }
        }
    }

    info!("dispatch loop exiting");
}

fn handle_command(cmd: Command, controller: &SessionController, metrics: &MetricsRegistry) {
    match cmd {
        Command::Knock { event, enqueued_at } => {
            let wait_us = enqueued_at.elapsed().as_micros() as f64;
            metrics.record(Metric::KnockQueueWaitUs, wait_us);
            deliver(controller, event);
        }
        Command::Record(record) => match KnockEvent::try_from(record) {
            Ok(event) => deliver(controller, event),
            // One bad detection never aborts a recording.
            Err(reason) => warn!(%reason, "knock record dropped"),
        },
        Command::Finalize => match controller.finalize() {
            Ok(artifact) => debug!(id = %artifact.id, "finalized on request"),
            Err(e) => warn!(error = %e, "finalize request failed"),
        },
        Command::Discard => {
            if let Err(e) = controller.discard() {
                warn!(error = %e, "discard request failed");
            }
        }
        Command::Shutdown => {}
    }
}

fn deliver(controller: &SessionController, event: KnockEvent) {
    match controller.on_knock(event) {
        Ok(()) => {}
        Err(SessionError::InvalidEvent(_)) => debug!("invalid knock dropped"),
        Err(e) => warn!(error = %e, "knock handling failed"),
    }
}
