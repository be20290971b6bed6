//! Message playback collaborator.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewerState {
    #[default]
    Idle,
    Playing,
    Paused,
}

pub trait MessageViewer: Send + Sync {
    fn state(&self) -> ViewerState;
    /// Pause playback if something is playing.
    fn pause(&self);
}

/// Viewer without a media backend; only tracks its state.
#[derive(Debug, Default)]
pub struct SimulatedViewer {
    state: Mutex<ViewerState>,
}

impl SimulatedViewer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play(&self) {
        *self.state.lock() = ViewerState::Playing;
    }
}

impl MessageViewer for SimulatedViewer {
    fn state(&self) -> ViewerState {
        *self.state.lock()
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        if *state == ViewerState::Playing {
            *state = ViewerState::Paused;
        }
    }
}
