//! Async VRCL client.
//!
//! ```text
//!  caller ──command()──► writer task ─────────────► socket
//!    ▲                                                 │
//!    └──── oneshot ◄──── reader task ◄─────────────────┘
//!                           │   └── IsAlive ──► IsAliveAck
//!                           ▼
//!                    notifications
//! ```
//!
//! The handshake (`Connect`, optional `Validate`, `APIVersionGet`) runs
//! inline in [`VrclClient::establish`]; afterwards the framed stream is
//! split between a reader and a writer task.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::call::{DialRequest, RejectReason};
use crate::error::VpError;

use super::auth::KeyDerivation;
use super::client_state::{ClientPhase, PendingCommands};
use super::codec::VrclCodec;
use super::message::{VrclCommand, ack_of, names, parse_switch};
use super::version::ApiVersion;
use super::xml::XmlElement;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOUND_CAPACITY: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct VrclClientConfig {
    pub keys: Arc<dyn KeyDerivation>,
    /// Highest version this client speaks.
    pub api_version: ApiVersion,
    pub command_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl VrclClientConfig {
    pub fn new(keys: Arc<dyn KeyDerivation>) -> Self {
        Self {
            keys,
            api_version: ApiVersion::CURRENT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for VrclClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrclClientConfig")
            .field("api_version", &self.api_version)
            .field("command_timeout", &self.command_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

pub struct VrclClient {
    outbound: mpsc::Sender<XmlElement>,
    notifications: mpsc::UnboundedReceiver<XmlElement>,
    pending: Arc<Mutex<PendingCommands>>,
    phase: Arc<Mutex<ClientPhase>>,
    negotiated: ApiVersion,
    command_timeout: Duration,
    peer: Option<SocketAddr>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    closed: bool,
}

impl VrclClient {
    /// Open a TCP connection to a VRCL server and complete the handshake.
    pub async fn connect(addr: SocketAddr, config: VrclClientConfig) -> Result<Self, VpError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;
        let framed = Framed::new(stream, VrclCodec::new());
        let mut client = Self::establish(framed, local.ip(), addr.ip(), config).await?;
        client.peer = Some(addr);
        info!(%addr, version = %client.negotiated, "vrcl client connected");
        Ok(client)
    }

    /// Run the handshake over an already-connected transport.
    ///
    /// `local_ip` and `server_ip` feed the connect key exactly as the
    /// server sees them.
    pub async fn establish<T>(
        mut framed: Framed<T, VrclCodec>,
        local_ip: IpAddr,
        server_ip: IpAddr,
        config: VrclClientConfig,
    ) -> Result<Self, VpError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut phase = ClientPhase::default();
        phase.begin_connect()?;

        let negotiated = tokio::time::timeout(
            config.handshake_timeout,
            handshake(&mut framed, &mut phase, local_ip, server_ip, &config),
        )
        .await
        .map_err(|_| VpError::Timeout(config.handshake_timeout))??;
        phase.complete_handshake()?;

        let mut pending = PendingCommands::new();
        pending.set_default_timeout(config.command_timeout);
        let pending = Arc::new(Mutex::new(pending));
        let phase = Arc::new(Mutex::new(phase));

        let (sink, stream) = framed.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (notify_tx, notifications) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            stream,
            outbound.clone(),
            notify_tx,
            Arc::clone(&pending),
            Arc::clone(&phase),
        ));

        Ok(Self {
            outbound,
            notifications,
            pending,
            phase,
            negotiated,
            command_timeout: config.command_timeout,
            peer: None,
            reader,
            writer,
            closed: false,
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn negotiated_version(&self) -> ApiVersion {
        self.negotiated
    }

    pub fn phase(&self) -> ClientPhase {
        self.phase.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.phase.lock().is_ready()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().pending_count()
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Send `command` and wait for its acknowledgement.
    ///
    /// `<{Name}Fail>` comes back as [`VpError::CommandFailed`].
    pub async fn command(&self, command: VrclCommand) -> Result<XmlElement, VpError> {
        {
            let phase = self.phase.lock();
            if !phase.is_ready() {
                return Err(VpError::invalid_state("command", &*phase));
            }
        }

        let rx = self.pending.lock().track(command.wire_name());
        debug!(command = command.wire_name(), "vrcl command");
        self.outbound
            .send(command.to_element())
            .await
            .map_err(|_| VpError::ChannelClosed)?;

        let outcome = tokio::time::timeout(self.command_timeout, rx).await;
        match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(VpError::ChannelClosed),
            Err(_) => {
                self.pending.lock().prune_abandoned();
                Err(VpError::Timeout(self.command_timeout))
            }
        }
    }

    /// Place a call; returns the new call's index.
    pub async fn dial(&self, request: DialRequest) -> Result<u32, VpError> {
        let reply = self.command(VrclCommand::CallDial(request)).await?;
        reply
            .attr("call")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| VpError::InvalidTag(format!("{} without call index", reply.name)))
    }

    pub async fn answer(&self, call: Option<u32>) -> Result<(), VpError> {
        self.command(VrclCommand::Answer { call }).await.map(drop)
    }

    pub async fn reject(&self, call: Option<u32>, reason: RejectReason) -> Result<(), VpError> {
        self.command(VrclCommand::Reject { call, reason })
            .await
            .map(drop)
    }

    pub async fn hang_up(&self, call: Option<u32>) -> Result<(), VpError> {
        self.command(VrclCommand::CallHangUp { call }).await.map(drop)
    }

    pub async fn hold(&self, call: Option<u32>) -> Result<(), VpError> {
        self.command(VrclCommand::CallHold { call }).await.map(drop)
    }

    pub async fn resume(&self, call: Option<u32>) -> Result<(), VpError> {
        self.command(VrclCommand::CallResume { call }).await.map(drop)
    }

    pub async fn transfer(&self, call: Option<u32>, dial_string: &str) -> Result<(), VpError> {
        self.command(VrclCommand::CallTransfer {
            call,
            dial_string: dial_string.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn bridge_dial(&self, call: Option<u32>, uri: &str) -> Result<(), VpError> {
        self.command(VrclCommand::CallBridgeDial {
            call,
            uri: uri.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn bridge_disconnect(&self, call: Option<u32>) -> Result<(), VpError> {
        self.command(VrclCommand::CallBridgeDisconnect { call })
            .await
            .map(drop)
    }

    pub async fn text_send(&self, call: Option<u32>, text: &str) -> Result<(), VpError> {
        self.command(VrclCommand::TextMessageSend {
            call,
            text: text.to_string(),
        })
        .await
        .map(drop)
    }

    pub async fn dtmf_send(&self, call: Option<u32>, digit: char) -> Result<(), VpError> {
        self.command(VrclCommand::DtmfSend { call, digit })
            .await
            .map(drop)
    }

    pub async fn setting_get(&self, name: &str) -> Result<String, VpError> {
        let reply = self
            .command(VrclCommand::SettingGet {
                name: name.to_string(),
            })
            .await?;
        Ok(reply.text().to_string())
    }

    pub async fn setting_set(&self, name: &str, value: &str) -> Result<(), VpError> {
        self.command(VrclCommand::SettingSet {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
        .map(drop)
    }

    /// `StatusCheckSuccess`; the status travels as attributes.
    pub async fn status(&self) -> Result<XmlElement, VpError> {
        self.command(VrclCommand::StatusCheck).await
    }

    pub async fn video_privacy_set(&self, enabled: bool) -> Result<(), VpError> {
        self.command(VrclCommand::VideoPrivacySet { enabled })
            .await
            .map(drop)
    }

    pub async fn video_privacy_get(&self) -> Result<bool, VpError> {
        let reply = self.command(VrclCommand::VideoPrivacyGet).await?;
        parse_switch(reply.text())
    }

    /// Probe the server; returns the round-trip time.
    pub async fn is_alive(&self) -> Result<Duration, VpError> {
        let started = Instant::now();
        self.command(VrclCommand::IsAlive).await?;
        Ok(started.elapsed())
    }

    // ── Notifications ────────────────────────────────────────────

    /// Next unsolicited message. `None` once the connection is gone and
    /// everything queued has been read.
    pub async fn next_notification(&mut self) -> Option<XmlElement> {
        self.notifications.recv().await
    }

    pub fn try_notification(&mut self) -> Option<XmlElement> {
        self.notifications.try_recv().ok()
    }

    // ── Shutdown ─────────────────────────────────────────────────

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.phase.lock().begin_disconnect();
        self.reader.abort();
        self.writer.abort();
        let _ = (&mut self.reader).await;
        let _ = (&mut self.writer).await;
        self.pending.lock().fail_all();
        self.phase.lock().force_disconnect();
        debug!(peer = ?self.peer, "vrcl client closed");
    }
}

impl Drop for VrclClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for VrclClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrclClient")
            .field("peer", &self.peer)
            .field("phase", &self.phase.lock().to_string())
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

// ── Handshake ────────────────────────────────────────────────────

async fn handshake<T>(
    framed: &mut Framed<T, VrclCodec>,
    phase: &mut ClientPhase,
    local_ip: IpAddr,
    server_ip: IpAddr,
    config: &VrclClientConfig,
) -> Result<ApiVersion, VpError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    phase.begin_authenticate()?;
    let key = config.keys.connect_key(local_ip, server_ip);
    framed
        .send(VrclCommand::Connect { key: key.clone() }.to_element())
        .await?;

    let ack = expect(framed, names::CONNECT_ACK).await?;
    let challenge = ack.text();
    if !challenge.is_empty() {
        debug!("server issued a challenge");
        let password = config.keys.validate_password(&key, challenge);
        framed
            .send(VrclCommand::Validate { password }.to_element())
            .await?;
        expect(framed, names::VALIDATE_ACK)
            .await
            .map_err(|e| match e {
                VpError::ChannelClosed | VpError::Connection(_) => {
                    VpError::Authentication("validate password rejected")
                }
                other => other,
            })?;
    }

    phase.begin_negotiate()?;
    framed
        .send(
            VrclCommand::ApiVersionGet {
                client: Some(config.api_version),
            }
            .to_element(),
        )
        .await?;
    let reply = expect(framed, names::API_VERSION).await?;
    let server: ApiVersion = reply.text().parse()?;
    Ok(config.api_version.negotiate(server))
}

async fn expect<T>(framed: &mut Framed<T, VrclCodec>, name: &str) -> Result<XmlElement, VpError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = framed.next().await {
        let element = frame?;
        if element.name == name {
            return Ok(element);
        }
        if let Some((command, false)) = ack_of(&element.name) {
            return Err(VpError::CommandFailed {
                command: command.to_string(),
                reason: element.text().to_string(),
            });
        }
        debug!(tag = %element.name, expected = name, "ignoring message during handshake");
    }
    Err(VpError::ChannelClosed)
}

// ── I/O tasks ────────────────────────────────────────────────────

async fn write_loop<S>(mut sink: S, mut rx: mpsc::Receiver<XmlElement>)
where
    S: Sink<XmlElement, Error = VpError> + Unpin,
{
    while let Some(element) = rx.recv().await {
        debug!("vrcl -> {element}");
        if let Err(e) = sink.send(element).await {
            warn!(error = %e, "vrcl write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: S,
    outbound: mpsc::Sender<XmlElement>,
    notify: mpsc::UnboundedSender<XmlElement>,
    pending: Arc<Mutex<PendingCommands>>,
    phase: Arc<Mutex<ClientPhase>>,
) where
    S: Stream<Item = Result<XmlElement, VpError>> + Unpin,
{
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(element)) => route(element, &outbound, &notify, &pending).await,
                Some(Err(e)) => {
                    warn!(error = %e, "vrcl read failed");
                    break;
                }
                None => {
                    info!("vrcl server closed the connection");
                    break;
                }
            },
            _ = sweep.tick() => {
                let mut waiting = pending.lock();
                for name in waiting.drain_expired() {
                    warn!(command = %name, "vrcl command timed out");
                }
                waiting.prune_abandoned();
            }
        }
    }

    phase.lock().force_disconnect();
    pending.lock().fail_all();
}

/// Command an acknowledgement answers, and whether it succeeded.
fn reply_of(name: &str) -> Option<(&str, bool)> {
    match name {
        names::IS_ALIVE_ACK => Some((names::IS_ALIVE, true)),
        names::API_VERSION => Some((names::API_VERSION_GET, true)),
        other => ack_of(other),
    }
}

async fn route(
    element: XmlElement,
    outbound: &mpsc::Sender<XmlElement>,
    notify: &mpsc::UnboundedSender<XmlElement>,
    pending: &Mutex<PendingCommands>,
) {
    debug!("vrcl <- {element}");
    if element.name == names::IS_ALIVE {
        let _ = outbound.send(XmlElement::new(names::IS_ALIVE_ACK)).await;
        return;
    }

    if let Some((command, ok)) = reply_of(&element.name) {
        let command = command.to_string();
        let mut waiting = pending.lock();
        // `CallTransferFail` doubles as a call event; it is a reply only
        // while a `CallTransfer` is outstanding.
        if waiting.is_pending(&command) {
            let reply = if ok {
                Ok(element)
            } else {
                Err(VpError::CommandFailed {
                    command: command.clone(),
                    reason: element.text().to_string(),
                })
            };
            waiting.resolve(&command, reply);
            return;
        }
    }

    let _ = notify.send(element);
}
