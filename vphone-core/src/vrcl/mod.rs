//! VRCL: the XML remote-control protocol spoken over TCP.
//!
//! ```text
//!  socket ─► TagExtractor ─► VrclSession ─► RemoteControl ─► ConferenceManager
//!    ▲        (buffer,         (auth,          (control)
//!    │         scanner)         versions)
//!    └──────── VrclServer ◄──── VrclNotifier ◄──── conference signals
//! ```
//!
//! The server runs on its own [`EventQueue`](crate::event_queue::EventQueue);
//! [`VrclClient`] is the async counterpart used by remote tools and tests.

pub mod auth;
pub mod buffer;
pub mod client;
pub mod client_state;
pub mod codec;
pub mod control;
pub mod message;
pub mod notify;
pub mod scanner;
pub mod server;
pub mod session;
pub mod version;
pub mod xml;

pub use auth::{Blake3KeyDerivation, KeyDerivation};
pub use buffer::{CircularBuffer, Extracted, TagExtractor};
pub use client::{VrclClient, VrclClientConfig};
pub use client_state::{ClientPhase, PendingCommands};
pub use codec::VrclCodec;
pub use control::{ConferenceRemote, RemoteControl};
pub use message::{Reply, VrclCommand};
pub use notify::VrclNotifier;
pub use scanner::{Scan, TagUnit};
pub use server::{NotifyHandle, VrclServer, VrclServerConfig, VrclServerSignals};
pub use session::{AuthState, SessionAction, VrclSession};
pub use version::ApiVersion;
pub use xml::XmlElement;
