//! Interfaces to the collaborators the core drives but does not own:
//! signaling, video input, message playback and property storage.

pub mod loopback;
pub mod properties;
pub mod sip;
pub mod video;
pub mod viewer;

pub use loopback::{LoopbackConfig, LoopbackSipStack};
pub use properties::{MemoryPropertyStore, PropertyStore};
pub use sip::{SignalingEvent, SignalingHandler, SignalingSink, SipStack};
pub use video::{
    FrameInfo, FrameSize, SimulatedVideoInput, VideoCodec, VideoInput, VideoInputSignals,
    VideoSettings,
};
pub use viewer::{MessageViewer, SimulatedViewer, ViewerState};
