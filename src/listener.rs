//! TCP listener that accepts one producer at a time and turns its byte stream
//! into [`ListenerEvent`]s.
//!
//! The socket is bound on the caller's thread so bind failures are returned
//! directly; accepting and reading happen on a dedicated thread. TCP keeps no
//! message boundaries, so every connection runs its bytes through a
//! [`FrameAssembler`] that cuts frames at their length prefixes.

use crossbeam_channel::Sender;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::codec::DecodeError;
use crate::config::{ListenerConfig, ReconnectPolicy};
use crate::frame::FeatureFrame;

#[derive(Error, Debug)]
pub enum BindError {
    #[error("invalid listener config: {0}")]
    InvalidConfig(String),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start listener thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Why a producer connection ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    PeerClosed,
    Io(String),
    /// `Malformed` or `Oversized`; the stream cannot be resynchronised.
    Decode(DecodeError),
    /// The listener was stopped while the producer was connected.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Connected(SocketAddr),
    Frame(FeatureFrame),
    Disconnected {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
    /// The accept loop has exited. Nothing follows.
    Stopped,
}

/// Receives listener events on the listener thread.
pub trait EventSink: Send + 'static {
    fn deliver(&self, event: ListenerEvent);
}

impl<F> EventSink for F
where
    F: Fn(ListenerEvent) + Send + Sync + 'static,
{
    fn deliver(&self, event: ListenerEvent) {
        self(event)
    }
}

impl EventSink for Sender<ListenerEvent> {
    fn deliver(&self, event: ListenerEvent) {
        // receiver gone means nobody is watching; keep serving regardless
        let _ = self.send(event);
    }
}

/// Reassembles length-prefixed frames from arbitrarily split reads.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: Vec<u8>,
    start: usize,
    max_frame_size: usize,
}

impl FrameAssembler {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_frame_size,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed. Errors leave the buffer as is;
    /// the stream is unusable after one.
    pub fn next_frame(&mut self) -> Result<Option<FeatureFrame>, DecodeError> {
        match FeatureFrame::decode(&self.buf[self.start..], self.max_frame_size) {
            Ok((frame, used)) => {
                self.start += used;
                if self.start == self.buf.len() {
                    self.buf.clear();
                    self.start = 0;
                }
                Ok(Some(frame))
            }
            Err(DecodeError::Truncated) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }
}

pub struct Listener;

impl Listener {
    /// Bind `config.host:config.port` and start serving on a new thread.
    pub fn start<S: EventSink>(config: ListenerConfig, sink: S) -> Result<ListenerHandle, BindError> {
        config.validate()?;

        let addr = config.address();
        let listen_err = |source| BindError::Listen {
            addr: addr.clone(),
            source,
        };
        let socket = TcpListener::bind(&addr).map_err(listen_err)?;
        socket.set_nonblocking(true).map_err(listen_err)?;
        let local_addr = socket.local_addr().map_err(listen_err)?;

        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker {
            socket,
            config,
            sink,
            running: running.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("feature-listener".to_string())
            .spawn(move || worker.run())
            .map_err(BindError::Spawn)?;

        info!(addr = %local_addr, "listening for feature producer");

        Ok(ListenerHandle {
            running,
            thread: Some(thread),
            local_addr,
        })
    }
}

/// Owner of a running listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// False once stopped, or once a single-shot listener has finished.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Close the connection and the listening socket.
    ///
    /// Blocks until the listener thread exits, so no event is delivered after
    /// this returns. Calling it again does nothing.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(addr = %self.local_addr, "listener thread panicked");
            }
            info!(addr = %self.local_addr, "listener stopped");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<S> {
    socket: TcpListener,
    config: ListenerConfig,
    sink: S,
    running: Arc<AtomicBool>,
}

impl<S: EventSink> Worker<S> {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn run(self) {
        while self.running() {
            match self.socket.accept() {
                Ok((stream, peer)) => {
                    self.serve(stream, peer);
                    if self.config.reconnect == ReconnectPolicy::SingleShot {
                        info!("single-shot listener finished");
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.config.poll_interval);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    std::thread::sleep(self.config.poll_interval);
                }
            }
        }
        self.sink.deliver(ListenerEvent::Stopped);
    }

    fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        info!(%peer, "producer connected");

        if let Err(e) = self.configure(&stream) {
            warn!(%peer, error = %e, "could not configure producer socket");
            self.sink.deliver(ListenerEvent::Disconnected {
                peer,
                reason: DisconnectReason::Io(e.to_string()),
            });
            return;
        }
        self.sink.deliver(ListenerEvent::Connected(peer));

        let reason = self.pump(stream);
        match &reason {
            DisconnectReason::PeerClosed => info!(%peer, "producer closed the connection"),
            DisconnectReason::Shutdown => info!(%peer, "dropping producer on shutdown"),
            DisconnectReason::Io(e) => warn!(%peer, error = %e, "producer connection failed"),
            DisconnectReason::Decode(e) => {
                error!(%peer, error = %e, "protocol violation, dropping producer")
            }
        }
        self.sink.deliver(ListenerEvent::Disconnected { peer, reason });
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        // accepted sockets inherit non-blocking mode on some platforms
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.poll_interval))?;
        stream.set_nodelay(true)
    }

    /// Read until the connection ends. The stream closes on return.
    fn pump(&self, mut stream: TcpStream) -> DisconnectReason {
        let mut assembler = FrameAssembler::new(self.config.max_frame_size);
        let mut chunk = vec![0u8; self.config.read_chunk_size];

        loop {
            if !self.running() {
                return DisconnectReason::Shutdown;
            }

            let n = match stream.read(&mut chunk) {
                Ok(0) => return DisconnectReason::PeerClosed,
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return DisconnectReason::Io(e.to_string()),
            };

            assembler.push(&chunk[..n]);
            loop {
                match assembler.next_frame() {
                    Ok(Some(frame)) => {
                        if !self.running() {
                            return DisconnectReason::Shutdown;
                        }
                        debug!(
                            global = frame.global_vector.len(),
                            patches = frame.patch_count(),
                            patch_dim = frame.patch_dim(),
                            "frame decoded"
                        );
                        self.sink.deliver(ListenerEvent::Frame(frame));
                    }
                    Ok(None) => break,
                    Err(e) => return DisconnectReason::Decode(e),
                }
            }
        }
    }
}
