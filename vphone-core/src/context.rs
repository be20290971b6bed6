//! Process-wide dependency container, built once at startup and handed to
//! each component's constructor.

use std::fmt;
use std::sync::Arc;

use crate::collab::{MessageViewer, PropertyStore, SipStack, VideoInput};
use crate::platform::{Platform, RestartHandler, RestartReason};

#[derive(Clone)]
pub struct Context {
    pub platform: Arc<dyn Platform>,
    pub sip: Arc<dyn SipStack>,
    pub properties: Arc<dyn PropertyStore>,
    pub video: Option<Arc<dyn VideoInput>>,
    pub viewer: Option<Arc<dyn MessageViewer>>,
}

impl Context {
    pub fn new(
        platform: Arc<dyn Platform>,
        sip: Arc<dyn SipStack>,
        properties: Arc<dyn PropertyStore>,
    ) -> Self {
        Self {
            platform,
            sip,
            properties,
            video: None,
            viewer: None,
        }
    }

    pub fn with_video(mut self, video: Arc<dyn VideoInput>) -> Self {
        self.video = Some(video);
        self
    }

    pub fn with_viewer(mut self, viewer: Arc<dyn MessageViewer>) -> Self {
        self.viewer = Some(viewer);
        self
    }

    /// Restart handler that forwards to the platform.
    pub fn restart_handler(&self) -> Arc<dyn RestartHandler> {
        Arc::new(PlatformRestart(Arc::clone(&self.platform)))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("product", &self.platform.product_name())
            .field("video", &self.video.is_some())
            .field("viewer", &self.viewer.is_some())
            .finish()
    }
}

struct PlatformRestart(Arc<dyn Platform>);

impl RestartHandler for PlatformRestart {
    fn restart_request(&self, reason: RestartReason) {
        self.0.restart_request(reason);
    }
}
