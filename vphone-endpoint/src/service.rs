//! Endpoint service: builds the context and components from the config,
//! runs until stopped or until a component asks for a restart.
//!
//! ```text
//!   LoopbackSipStack ◄──► ConferenceManager ◄── ConferenceRemote ◄── VrclServer
//!          ▲                     │                                    ▲
//!       ring-in              signals ──────────► VrclNotifier ────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};

use vphone_core::call::RemoteInfo;
use vphone_core::collab::properties::keys;
use vphone_core::{
    Blake3KeyDerivation, ConferenceManager, ConferenceRemote, Context, LoopbackSipStack,
    MemoryPropertyStore, Platform, RestartHandler, RestartReason, SimulatedVideoInput, VideoInput,
    VpError, VrclNotifier, VrclServer,
};

use crate::config::EndpointConfig;

// ── Platform ─────────────────────────────────────────────────────

/// Forwards restart requests from any component queue to the service loop.
pub struct EndpointPlatform {
    restarts: mpsc::UnboundedSender<RestartReason>,
}

impl RestartHandler for EndpointPlatform {
    fn restart_request(&self, reason: RestartReason) {
        error!(code = reason.code(), "restart request: {reason}");
        let _ = self.restarts.send(reason);
    }
}

impl Platform for EndpointPlatform {
    fn product_name(&self) -> String {
        format!("vphone-endpoint {}", env!("CARGO_PKG_VERSION"))
    }
}

/// Why [`EndpointService::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    Restart(RestartReason),
}

// ── EndpointService ──────────────────────────────────────────────

pub struct EndpointService {
    config: EndpointConfig,
    platform: Arc<EndpointPlatform>,
    restarts: mpsc::UnboundedReceiver<RestartReason>,
    stop: Arc<Notify>,
    loopback: Arc<LoopbackSipStack>,
    video: Arc<SimulatedVideoInput>,
    manager: Arc<ConferenceManager>,
    server: Option<VrclServer>,
    notifier: Option<VrclNotifier>,
    vrcl_addrs: Vec<SocketAddr>,
    rang_in: bool,
    stopped: bool,
}

impl EndpointService {
    /// Build every component and start its queue.
    pub fn start(config: EndpointConfig) -> Result<Self, VpError> {
        let (tx, restarts) = mpsc::unbounded_channel();
        let platform = Arc::new(EndpointPlatform { restarts: tx });

        let loopback = Arc::new(LoopbackSipStack::new(config.to_loopback_config()));
        let video = Arc::new(SimulatedVideoInput::new());
        let properties = Arc::new(MemoryPropertyStore::with_values([
            (keys::LOCAL_NAME, config.conference.local_name.clone()),
            (keys::LOCAL_NUMBER, config.conference.local_number.clone()),
        ]));
        let context = Context::new(platform.clone(), loopback.clone(), properties)
            .with_video(video.clone());

        let (threshold, grace) = config.backpressure();
        loopback.queue().set_restart_handler(context.restart_handler());
        loopback.queue().set_backpressure(threshold, grace);
        if !loopback.start() {
            return Err(VpError::AlreadyRunning);
        }

        let manager = Arc::new(ConferenceManager::new(&context, config.to_conference_config()));
        manager.queue().set_backpressure(threshold, grace);
        manager.start()?;

        let mut service = Self {
            config,
            platform,
            restarts,
            stop: Arc::new(Notify::new()),
            loopback,
            video,
            manager,
            server: None,
            notifier: None,
            vrcl_addrs: Vec::new(),
            rang_in: false,
            stopped: false,
        };
        if service.config.vrcl.enabled {
            service.start_vrcl(&context)?;
        } else {
            info!("vrcl disabled");
        }
        info!(product = %service.platform.product_name(), "endpoint started");
        Ok(service)
    }

    fn start_vrcl(&mut self, context: &Context) -> Result<(), VpError> {
        let server = VrclServer::new(
            self.config.to_server_config(),
            Arc::new(Blake3KeyDerivation::new(self.config.vrcl.shared_secret.clone())),
            Arc::new(ConferenceRemote::new(Arc::clone(&self.manager), context)),
        );
        let (threshold, grace) = self.config.backpressure();
        server.set_restart_handler(context.restart_handler());
        server.queue().set_backpressure(threshold, grace);
        self.vrcl_addrs = server.start()?;
        for addr in &self.vrcl_addrs {
            info!(%addr, "vrcl listening");
        }

        let video: Arc<dyn VideoInput> = self.video.clone();
        self.notifier = Some(VrclNotifier::attach(
            server.notifier(),
            &self.manager,
            Some(&video),
        ));
        self.server = Some(server);
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn manager(&self) -> &Arc<ConferenceManager> {
        &self.manager
    }

    pub fn loopback(&self) -> &Arc<LoopbackSipStack> {
        &self.loopback
    }

    pub fn video(&self) -> &Arc<SimulatedVideoInput> {
        &self.video
    }

    pub fn platform(&self) -> &Arc<EndpointPlatform> {
        &self.platform
    }

    pub fn vrcl_addrs(&self) -> &[SocketAddr] {
        &self.vrcl_addrs
    }

    /// Handle that makes [`run`](Self::run) return `Stopped`.
    pub fn stop_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.stop)
    }

    // ── Running ──────────────────────────────────────────────────

    /// Wait for a stop or a restart request. Components keep running on
    /// their own queues; this only supervises.
    pub async fn run(&mut self) -> ExitReason {
        loop {
            let ring_in = self.pending_ring_in();
            tokio::select! {
                _ = self.stop.notified() => {
                    info!("stop requested");
                    return ExitReason::Stopped;
                }
                reason = self.restarts.recv() => match reason {
                    Some(reason) => {
                        warn!(code = reason.code(), "restarting: {reason}");
                        return ExitReason::Restart(reason);
                    }
                    None => return ExitReason::Stopped,
                },
                _ = sleep_or_never(ring_in) => {
                    self.rang_in = true;
                    self.ring_in();
                }
            }
        }
    }

    fn pending_ring_in(&self) -> Option<Duration> {
        if self.rang_in {
            return None;
        }
        self.config.ring_in_after()
    }

    /// Present a simulated incoming call from the configured caller.
    pub fn ring_in(&self) -> u64 {
        let loopback = &self.config.loopback;
        info!(from = %loopback.ring_in_number, "ringing in");
        self.loopback.ring_in(RemoteInfo {
            display_name: loopback.ring_in_name.clone(),
            phone_number: loopback.ring_in_number.clone(),
            dial_string: loopback.ring_in_number.clone(),
            ..RemoteInfo::default()
        })
    }

    /// Stop the VRCL server, hang up and stop the queues. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.notifier = None;
        if let Some(server) = self.server.take() {
            server.stop();
        }
        self.manager.shutdown();
        self.loopback.stop();
        info!("endpoint stopped");
    }
}

impl Drop for EndpointService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sleep_or_never(after: Option<Duration>) {
    match after {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}
