//! # vphone-core
//!
//! Call orchestration core and remote-control protocol for a videophone
//! endpoint.
//!
//! This crate contains:
//! - **Event queue**: `EventQueue`, a named worker thread with posted jobs, timers and fd watches
//! - **Timers & signals**: `Timer` and typed `Signal` fan-out with RAII `Connection`s
//! - **Calls**: `Call` state machine, `CallEvent` classification, dial requests
//! - **Conference**: `ConferenceManager` orchestrating calls against a `SipStack`
//! - **Collaborators**: SIP, video input, message viewer and property-store interfaces plus loopback doubles
//! - **VRCL**: XML remote-control server, session, notifier and async `VrclClient`
//! - **Error**: `VpError`, a typed `thiserror`-based error hierarchy

pub mod call;
pub mod collab;
pub mod conference;
pub mod context;
pub mod error;
pub mod event_queue;
pub mod platform;
pub mod signal;
pub mod timer;
pub mod vrcl;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use call::{
    Call, CallEvent, CallHandle, CallState, CallStateMask, DialMethod, DialRequest, Direction,
    DisconnectReason, RejectReason, SubState,
};
pub use collab::{
    LoopbackConfig, LoopbackSipStack, MemoryPropertyStore, MessageViewer, PropertyStore,
    SimulatedVideoInput, SimulatedViewer, SipStack, VideoInput,
};
pub use conference::{CallNotice, ConferenceConfig, ConferenceManager, ConferenceSignals};
pub use context::Context;
pub use error::VpError;
pub use event_queue::EventQueue;
pub use platform::{LoggingPlatform, Platform, RestartHandler, RestartReason};
pub use signal::{Connection, ConnectionSet, Signal};
pub use timer::{Timer, TimerMode};

// ── VRCL re-exports ──────────────────────────────────────────────
pub use vrcl::{
    ApiVersion, Blake3KeyDerivation, ConferenceRemote, KeyDerivation, VrclClient,
    VrclClientConfig, VrclCommand, VrclNotifier, VrclServer, VrclServerConfig,
};
