//! Session lifecycle and the published view of the stream.
//!
//! Everything a reader can observe lives in one immutable [`Snapshot`] that
//! is replaced as a whole. The two writers (the listener thread and the rate
//! ticker) serialize on the rate counter's mutex and swap the snapshot while
//! holding it, so a reader never sees a frame next to statistics or a frame
//! count that belong to another frame.

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::SessionConfig;
use crate::frame::FeatureFrame;
use crate::listener::{
    BindError, DisconnectReason, EventSink, Listener, ListenerEvent, ListenerHandle,
};
use crate::rate::RateCounter;
use crate::stats::Stats;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Disconnected,
    Listening,
    Connected,
}

/// What the presentation layer sees.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: SessionState,
    pub frame: Option<Arc<FeatureFrame>>,
    /// Computed from `frame`; zero when there is none.
    pub stats: Stats,
    pub fps: f32,
    pub frames_received: u64,
}

struct Shared {
    writer: Mutex<RateCounter>,
    published: RwLock<Arc<Snapshot>>,
    subscribers: Mutex<Vec<Sender<Arc<Snapshot>>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            writer: Mutex::new(RateCounter::new()),
            published: RwLock::new(Arc::new(Snapshot::default())),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn writer(&self) -> MutexGuard<'_, RateCounter> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Arc<Snapshot> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the snapshot. Only called with the writer lock held.
    fn publish(&self, _writer: &MutexGuard<'_, RateCounter>, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(snapshot.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn subscribe(&self, capacity: usize) -> Receiver<Arc<Snapshot>> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn on_frame(&self, frame: FeatureFrame) {
        let mut rate = self.writer();
        rate.record_frame();
        let stats = Stats::compute(&frame);
        let snapshot = Snapshot {
            state: SessionState::Connected,
            frame: Some(Arc::new(frame)),
            stats,
            fps: rate.fps(),
            frames_received: rate.total_frames(),
        };
        self.publish(&rate, snapshot);
    }

    fn set_state(&self, state: SessionState) {
        let rate = self.writer();
        let current = self.current();
        if current.state == state {
            return;
        }
        debug!(from = ?current.state, to = ?state, "session state");
        self.publish(
            &rate,
            Snapshot {
                state,
                ..Snapshot::clone(&current)
            },
        );
    }

    /// The listener ended on its own: stop counting, keep the last frame.
    fn listener_stopped(&self) {
        let mut rate = self.writer();
        rate.reset();
        let current = self.current();
        self.publish(
            &rate,
            Snapshot {
                state: SessionState::Disconnected,
                fps: 0.0,
                ..Snapshot::clone(&current)
            },
        );
    }

    /// Apply one rate tick. Returns false once the session is disconnected.
    fn tick_with(&self, f: impl FnOnce(&mut RateCounter) -> f32) -> bool {
        let mut rate = self.writer();
        let current = self.current();
        if current.state == SessionState::Disconnected {
            return false;
        }
        let fps = f(&mut rate);
        self.publish(
            &rate,
            Snapshot {
                fps,
                ..Snapshot::clone(&current)
            },
        );
        true
    }
}

struct SessionSink {
    shared: Arc<Shared>,
}

impl EventSink for SessionSink {
    fn deliver(&self, event: ListenerEvent) {
        match event {
            ListenerEvent::Frame(frame) => self.shared.on_frame(frame),
            ListenerEvent::Connected(_) => self.shared.set_state(SessionState::Connected),
            // `disconnect()` publishes the final state itself
            ListenerEvent::Disconnected {
                reason: DisconnectReason::Shutdown,
                ..
            } => {}
            ListenerEvent::Disconnected { .. } => self.shared.set_state(SessionState::Listening),
            ListenerEvent::Stopped => self.shared.listener_stopped(),
        }
    }
}

/// Periodic driver for the rate counter.
///
/// The thread exits on its own at the first tick after the session has gone
/// `Disconnected`, so a listener that ends by itself does not leave it running.
struct Ticker {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    fn start(shared: Arc<Shared>, interval: Duration) -> std::io::Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticks = tick(interval);
        let thread = std::thread::Builder::new()
            .name("feature-rate".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticks) -> _ => {
                        if !shared.tick_with(RateCounter::tick_now) {
                            debug!("session ended, rate ticker exiting");
                            break;
                        }
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            })?;
        Ok(Self {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        // closing the channel wakes the select
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("rate ticker panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Owns the listener and the rate ticker, and publishes [`Snapshot`]s.
pub struct SessionController {
    config: SessionConfig,
    shared: Arc<Shared>,
    listener: Option<ListenerHandle>,
    ticker: Option<Ticker>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            listener: None,
            ticker: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start listening for a producer.
    ///
    /// Does nothing if already listening or connected. On a bind failure the
    /// session stays `Disconnected` and the error is returned.
    pub fn connect(&mut self) -> Result<(), BindError> {
        let active = self.listener.as_ref().is_some_and(ListenerHandle::is_running);
        if active && self.state() != SessionState::Disconnected {
            return Ok(());
        }
        // leftovers of a single-shot listener that already finished
        self.disconnect();

        // Hold the writer lock until `Listening` is published so events from
        // the new listener thread queue up behind it.
        let started = {
            let mut rate = self.shared.writer();
            let sink = SessionSink {
                shared: self.shared.clone(),
            };
            Listener::start(self.config.listener.clone(), sink).map(|handle| {
                rate.reset();
                self.shared.publish(
                    &rate,
                    Snapshot {
                        state: SessionState::Listening,
                        ..Snapshot::default()
                    },
                );
                handle
            })
        };
        let handle = started.map_err(|e| {
            error!(error = %e, "session failed to start");
            e
        })?;
        info!(addr = %handle.local_addr(), "session listening");
        self.listener = Some(handle);

        // started after `Listening` so its first tick sees a live session
        match Ticker::start(self.shared.clone(), self.config.tick_interval) {
            Ok(ticker) => {
                self.ticker = Some(ticker);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "rate ticker failed to start");
                self.disconnect();
                Err(BindError::Spawn(e))
            }
        }
    }

    /// Stop listening, drop the current frame and zero the rate.
    ///
    /// Safe to call at any time, any number of times.
    pub fn disconnect(&mut self) {
        if self.listener.is_none() && self.ticker.is_none() {
            return;
        }
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }

        let mut rate = self.shared.writer();
        rate.reset();
        self.shared.publish(&rate, Snapshot::default());
        info!("session disconnected");
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.current()
    }

    pub fn state(&self) -> SessionState {
        self.snapshot().state
    }

    pub fn fps(&self) -> f32 {
        self.snapshot().fps
    }

    pub fn stats(&self) -> Stats {
        self.snapshot().stats
    }

    pub fn current_frame(&self) -> Option<Arc<FeatureFrame>> {
        self.snapshot().frame.clone()
    }

    /// Bound address while listening. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ListenerHandle::local_addr)
    }

    /// Receive every snapshot published from now on.
    ///
    /// Each subscriber has a small queue; when it is full, updates are
    /// dropped for that subscriber rather than stalling ingestion.
    pub fn subscribe(&self) -> Receiver<Arc<Snapshot>> {
        self.shared.subscribe(self.config.subscriber_capacity)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.disconnect();
    }
}
