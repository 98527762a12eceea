//! Live ingestion of feature-vector frames (a global embedding plus a grid of
//! patch embeddings) pushed by a single producer over TCP.
//!
//! Frames are length-prefixed on the wire (see [`codec`]), reassembled from
//! the byte stream by the [`listener`], and published by the [`session`]
//! together with their [`Stats`] and the current frame rate.

pub mod codec;
pub mod compress;
pub mod config;
pub mod frame;
pub mod listener;
pub mod rate;
pub mod session;
pub mod stats;

pub use codec::{DecodeError, EncodeError, EncodeOptions, Flags, DEFAULT_MAX_FRAME_SIZE, WIRE_VERSION};
pub use config::{ListenerConfig, ReconnectPolicy, SessionConfig};
pub use frame::{FeatureFrame, RaggedGrid};
pub use listener::{
    BindError, DisconnectReason, EventSink, FrameAssembler, Listener, ListenerEvent, ListenerHandle,
};
pub use rate::RateCounter;
pub use session::{SessionController, SessionState, Snapshot};
pub use stats::Stats;
