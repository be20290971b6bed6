//! Video input collaborator: the capture/encode pipeline seen from the
//! core. Real backends live outside this crate.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::VpError;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VideoCodec::H264 => "H264",
            VideoCodec::H265 => "H265",
            VideoCodec::Vp8 => "VP8",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Encoder settings requested by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSettings {
    pub size: FrameSize,
    pub frame_rate: u32,
    pub bitrate_kbps: u32,
    pub codec: VideoCodec,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            size: FrameSize {
                width: 1280,
                height: 720,
            },
            frame_rate: 30,
            bitrate_kbps: 1500,
            codec: VideoCodec::H264,
        }
    }
}

/// Metadata of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub size: FrameSize,
    pub key_frame: bool,
    pub timestamp_ms: u64,
}

/// Status notifications raised by a video input.
#[derive(Debug, Default)]
pub struct VideoInputSignals {
    pub privacy_changed: Signal<bool>,
    pub size_changed: Signal<FrameSize>,
    pub frame_captured: Signal<FrameInfo>,
    pub record_error: Signal<String>,
}

pub trait VideoInput: Send + Sync {
    fn initialize(&self) -> Result<(), VpError>;
    fn uninitialize(&self);
    fn record_start(&self) -> Result<(), VpError>;
    fn record_stop(&self) -> Result<(), VpError>;
    fn settings_set(&self, settings: VideoSettings) -> Result<(), VpError>;
    fn settings_get(&self) -> VideoSettings;
    fn privacy_set(&self, enabled: bool) -> Result<(), VpError>;
    fn privacy_get(&self) -> bool;
    fn key_frame_request(&self);
    fn codecs_get(&self) -> Vec<VideoCodec>;
    fn signals(&self) -> &VideoInputSignals;
}

// ── Simulated input ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimState {
    initialized: bool,
    recording: bool,
    privacy: bool,
    settings: VideoSettings,
    key_frames_requested: u32,
}

/// A video input with no hardware behind it. Tracks requests and raises
/// the same signals a real pipeline would.
#[derive(Debug, Default)]
pub struct SimulatedVideoInput {
    state: Mutex<SimState>,
    signals: VideoInputSignals,
}

impl SimulatedVideoInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn key_frames_requested(&self) -> u32 {
        self.state.lock().key_frames_requested
    }

    /// Pretend the pipeline produced a frame.
    pub fn capture_frame(&self, timestamp_ms: u64) {
        let (size, key_frame) = {
            let mut state = self.state.lock();
            if !state.recording {
                return;
            }
            let key = state.key_frames_requested > 0;
            state.key_frames_requested = state.key_frames_requested.saturating_sub(1);
            (state.settings.size, key)
        };
        self.signals.frame_captured.emit(&FrameInfo {
            size,
            key_frame,
            timestamp_ms,
        });
    }

    /// Pretend the recorder failed.
    pub fn fail_recording(&self, what: &str) {
        self.state.lock().recording = false;
        self.signals.record_error.emit(&what.to_string());
    }
}

impl VideoInput for SimulatedVideoInput {
    fn initialize(&self) -> Result<(), VpError> {
        self.state.lock().initialized = true;
        info!("video input initialized");
        Ok(())
    }

    fn uninitialize(&self) {
        let mut state = self.state.lock();
        state.initialized = false;
        state.recording = false;
    }

    fn record_start(&self) -> Result<(), VpError> {
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(VpError::invalid_state("record start", "uninitialized"));
        }
        state.recording = true;
        debug!("recording started");
        Ok(())
    }

    fn record_stop(&self) -> Result<(), VpError> {
        self.state.lock().recording = false;
        debug!("recording stopped");
        Ok(())
    }

    fn settings_set(&self, settings: VideoSettings) -> Result<(), VpError> {
        if settings.size.width == 0 || settings.size.height == 0 || settings.frame_rate == 0 {
            return Err(VpError::InvalidParameter("video settings"));
        }
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.settings, settings)
        };
        if previous.size != settings.size {
            self.signals.size_changed.emit(&settings.size);
        }
        Ok(())
    }

    fn settings_get(&self) -> VideoSettings {
        self.state.lock().settings
    }

    fn privacy_set(&self, enabled: bool) -> Result<(), VpError> {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.privacy != enabled;
            state.privacy = enabled;
            changed
        };
        if changed {
            self.signals.privacy_changed.emit(&enabled);
        }
        Ok(())
    }

    fn privacy_get(&self) -> bool {
        self.state.lock().privacy
    }

    fn key_frame_request(&self) {
        self.state.lock().key_frames_requested += 1;
    }

    fn codecs_get(&self) -> Vec<VideoCodec> {
        vec![VideoCodec::H264, VideoCodec::H265]
    }

    fn signals(&self) -> &VideoInputSignals {
        &self.signals
    }
}
