//! Connection lifecycle and outstanding-command tracking for the VRCL client.
//!
//! VRCL replies carry no request id: `<CallDialSuccess/>` answers the
//! oldest outstanding `CallDial`. [`PendingCommands`] therefore keeps
//! requests in send order and resolves them by command name.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::VpError;

use super::xml::XmlElement;

// ── ClientPhase ──────────────────────────────────────────────────

/// The current phase of a VRCL client connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Authenticating ──► Negotiating ──► Ready
///       ▲               │                │                 │            │
///       │               ▼                ▼                 ▼            ▼
///       └───────────────┴──────── Disconnecting ◄──────────┴────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientPhase {
    #[default]
    Disconnected,

    /// TCP connect in progress.
    Connecting,

    /// `Connect` sent; waiting for `ConnectAck` or `ValidateAck`.
    Authenticating,

    /// `APIVersionGet` sent.
    Negotiating,

    /// Handshake complete; commands and notifications flow.
    Ready {
        since: Instant,
    },

    Disconnecting,
}

impl std::fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Negotiating => write!(f, "Negotiating"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl ClientPhase {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the connection has been usable. `None` unless `Ready`.
    pub fn ready_duration(&self) -> Option<Duration> {
        match self {
            Self::Ready { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), VpError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_authenticate(&mut self) -> Result<(), VpError> {
        match self {
            Self::Connecting => {
                *self = Self::Authenticating;
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot authenticate: not in Connecting state",
            )),
        }
    }

    /// Valid from: `Authenticating`.
    pub fn begin_negotiate(&mut self) -> Result<(), VpError> {
        match self {
            Self::Authenticating => {
                *self = Self::Negotiating;
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot negotiate: not authenticating",
            )),
        }
    }

    /// Valid from: `Negotiating`.
    pub fn complete_handshake(&mut self) -> Result<(), VpError> {
        match self {
            Self::Negotiating => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot complete handshake: not in Negotiating state",
            )),
        }
    }

    /// Valid from: `Authenticating`, `Negotiating`, `Ready`.
    pub fn begin_disconnect(&mut self) -> Result<(), VpError> {
        match self {
            Self::Authenticating | Self::Negotiating | Self::Ready { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot disconnect: no connection in progress",
            )),
        }
    }

    /// Valid from: `Disconnecting`, `Connecting` (connect failure).
    pub fn finish_disconnect(&mut self) -> Result<(), VpError> {
        match self {
            Self::Disconnecting | Self::Connecting => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(VpError::ProtocolViolation(
                "cannot finish disconnect: not disconnecting",
            )),
        }
    }

    /// Drop straight to `Disconnected`, e.g. when the socket dies.
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── PendingCommands ──────────────────────────────────────────────

pub type CommandReply = Result<XmlElement, VpError>;

/// A command awaiting its `Success`/`Fail` acknowledgement.
#[derive(Debug)]
pub struct PendingCommand {
    pub name: String,
    pub sent_at: Instant,
    pub deadline: Option<Duration>,
    reply: oneshot::Sender<CommandReply>,
}

impl PendingCommand {
    pub fn is_expired(&self) -> bool {
        match self.deadline {
            Some(d) => self.sent_at.elapsed() > d,
            None => false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    fn abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct PendingCommands {
    queue: VecDeque<PendingCommand>,
    default_timeout: Option<Duration>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.default_timeout = Some(timeout);
    }

    /// Record a command about to be written. The receiver yields its reply.
    pub fn track(&mut self, name: impl Into<String>) -> oneshot::Receiver<CommandReply> {
        let (tx, rx) = oneshot::channel();
        self.queue.push_back(PendingCommand {
            name: name.into(),
            sent_at: Instant::now(),
            deadline: self.default_timeout,
            reply: tx,
        });
        rx
    }

    /// Hand `reply` to the oldest outstanding command named `name`.
    ///
    /// Returns `false` when nothing was waiting for it.
    pub fn resolve(&mut self, name: &str, reply: CommandReply) -> bool {
        let Some(pos) = self.queue.iter().position(|p| p.name == name) else {
            return false;
        };
        let Some(pending) = self.queue.remove(pos) else {
            return false;
        };
        // The caller may have given up already; the reply is then moot.
        let _ = pending.reply.send(reply);
        true
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.queue.iter().any(|p| p.name == name)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Fail and remove every command past its deadline. Returns their names.
    pub fn drain_expired(&mut self) -> Vec<String> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for pending in self.queue.drain(..) {
            if pending.is_expired() {
                let elapsed = pending.elapsed();
                expired.push(pending.name.clone());
                let _ = pending.reply.send(Err(VpError::Timeout(elapsed)));
            } else {
                kept.push_back(pending);
            }
        }
        self.queue = kept;
        expired
    }

    /// Forget commands whose caller stopped waiting.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|p| !p.abandoned());
        before - self.queue.len()
    }

    /// Connection lost: every waiter gets [`VpError::ChannelClosed`].
    pub fn fail_all(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(VpError::ChannelClosed));
        }
    }
}
