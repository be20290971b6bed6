//! Per-client VRCL protocol state, free of any I/O.
//!
//! ```text
//!   Unauthenticated ──Connect(ok)──────────────────────► Authenticated
//!         │                                                  ▲
//!         └──Connect(mismatch)──► ChallengeSent ──Validate(ok)┘
//!                                       │
//!                      Validate(bad) ───┴──► Disconnected ◄── life-check / timeout
//! ```
//!
//! The server feeds tag units in and performs the returned
//! [`SessionAction`]s; tests drive the same type directly.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::VpError;

use super::auth::{KeyDerivation, tokens_match};
use super::control::RemoteControl;
use super::message::{VrclCommand, failure, names, success};
use super::scanner::TagUnit;
use super::version::ApiVersion;
use super::xml::XmlElement;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    ChallengeSent { client_key: String, challenge: String },
    Authenticated,
    Disconnected,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthState::Unauthenticated => "Unauthenticated",
            AuthState::ChallengeSent { .. } => "ChallengeSent",
            AuthState::Authenticated => "Authenticated",
            AuthState::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the transport must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    Send(XmlElement),
    /// The handshake just completed.
    Authenticated,
    /// Close the connection.
    Disconnect(String),
}

pub struct VrclSession {
    peer: SocketAddr,
    local: SocketAddr,
    keys: Arc<dyn KeyDerivation>,
    server_version: ApiVersion,
    negotiated: ApiVersion,
    state: AuthState,
    pending_life_checks: u32,
    commands: u64,
}

impl VrclSession {
    pub fn new(
        peer: SocketAddr,
        local: SocketAddr,
        keys: Arc<dyn KeyDerivation>,
        server_version: ApiVersion,
    ) -> Self {
        Self {
            peer,
            local,
            keys,
            server_version,
            negotiated: ApiVersion::BASELINE.min(server_version),
            state: AuthState::Unauthenticated,
            pending_life_checks: 0,
            commands: 0,
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> &AuthState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn negotiated_version(&self) -> ApiVersion {
        self.negotiated
    }

    pub fn pending_life_checks(&self) -> u32 {
        self.pending_life_checks
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands
    }

    /// Whether a notification gated at `min_version` may be sent.
    pub fn accepts(&self, min_version: ApiVersion) -> bool {
        self.is_authenticated() && self.negotiated >= min_version
    }

    // ── Input ────────────────────────────────────────────────────

    pub fn handle(&mut self, unit: &TagUnit, remote: &dyn RemoteControl) -> Vec<SessionAction> {
        if self.state == AuthState::Disconnected {
            return Vec::new();
        }
        debug!(peer = %self.peer, "vrcl <- {}", unit.raw);

        let element = match XmlElement::parse(&unit.raw) {
            Ok(element) => element,
            Err(e) => {
                warn!(peer = %self.peer, tag = %unit.name, error = %e, "malformed message");
                return self.refuse(&unit.name, "malformed message");
            }
        };
        let command = match VrclCommand::from_element(&element) {
            Ok(command) => command,
            Err(e) => {
                debug!(peer = %self.peer, tag = %element.name, error = %e, "bad command payload");
                return self.refuse(&element.name, e.reason());
            }
        };

        match self.state {
            AuthState::Authenticated => self.dispatch(command, remote),
            _ => self.handshake(command),
        }
    }

    /// Bytes the scanner could not frame. Logged only.
    pub fn handle_invalid(&mut self, raw: &str) {
        warn!(peer = %self.peer, %raw, "discarding invalid tag");
    }

    /// Connection timer expiry.
    pub fn connect_timeout(&mut self) -> Vec<SessionAction> {
        if self.is_authenticated() || self.state == AuthState::Disconnected {
            return Vec::new();
        }
        self.state = AuthState::Disconnected;
        vec![SessionAction::Disconnect("authentication timeout".into())]
    }

    /// Life-check timer tick. A single unanswered probe is tolerated.
    pub fn life_check_tick(&mut self) -> Vec<SessionAction> {
        if !self.is_authenticated() {
            return Vec::new();
        }
        if self.pending_life_checks > 1 {
            self.state = AuthState::Disconnected;
            return vec![SessionAction::Disconnect("life-check unanswered".into())];
        }
        self.pending_life_checks += 1;
        vec![SessionAction::Send(XmlElement::new(names::IS_ALIVE))]
    }

    pub fn close(&mut self) {
        self.state = AuthState::Disconnected;
    }

    // ── Internals ────────────────────────────────────────────────

    fn refuse(&self, name: &str, reason: impl Into<String>) -> Vec<SessionAction> {
        vec![SessionAction::Send(failure(name, reason))]
    }

    fn handshake(&mut self, command: VrclCommand) -> Vec<SessionAction> {
        match command {
            VrclCommand::Connect { key } => {
                let expected = self.keys.connect_key(self.peer.ip(), self.local.ip());
                if tokens_match(&expected, &key) {
                    return self.authenticated(names::CONNECT_ACK);
                }
                let challenge = self.keys.server_challenge(&key);
                debug!(peer = %self.peer, "connect key mismatch, issuing challenge");
                let ack = XmlElement::new(names::CONNECT_ACK).with_text(challenge.as_str());
                self.state = AuthState::ChallengeSent {
                    client_key: key,
                    challenge,
                };
                vec![SessionAction::Send(ack)]
            }
            VrclCommand::Validate { password } => {
                let AuthState::ChallengeSent {
                    client_key,
                    challenge,
                } = &self.state
                else {
                    self.state = AuthState::Disconnected;
                    return vec![SessionAction::Disconnect("validate without challenge".into())];
                };
                let expected = self.keys.validate_password(client_key, challenge);
                if tokens_match(&expected, &password) {
                    self.authenticated(names::VALIDATE_ACK)
                } else {
                    warn!(peer = %self.peer, "validate password mismatch");
                    self.state = AuthState::Disconnected;
                    vec![SessionAction::Disconnect(
                        VpError::Authentication("validate password mismatch").to_string(),
                    )]
                }
            }
            other => self.refuse(other.wire_name(), "not authenticated"),
        }
    }

    fn authenticated(&mut self, ack: &str) -> Vec<SessionAction> {
        info!(peer = %self.peer, "vrcl client authenticated");
        self.state = AuthState::Authenticated;
        self.pending_life_checks = 0;
        vec![
            SessionAction::Send(XmlElement::new(ack)),
            SessionAction::Authenticated,
        ]
    }

    fn dispatch(&mut self, command: VrclCommand, remote: &dyn RemoteControl) -> Vec<SessionAction> {
        self.commands += 1;
        let reply = match &command {
            VrclCommand::Connect { .. } => XmlElement::new(names::CONNECT_ACK),
            VrclCommand::Validate { .. } => XmlElement::new(names::VALIDATE_ACK),
            VrclCommand::ApiVersionGet { client } => {
                self.negotiate(client.unwrap_or(self.server_version))
            }
            VrclCommand::ApiVersion(version) => self.negotiate(*version),
            VrclCommand::IsAlive => XmlElement::new(names::IS_ALIVE_ACK),
            VrclCommand::IsAliveAck => {
                self.pending_life_checks = 0;
                return Vec::new();
            }
            VrclCommand::Unknown(name) => failure(name, "unknown command"),
            command => match remote.execute(command) {
                Ok(reply) => success(command.wire_name(), reply),
                Err(e) => {
                    debug!(peer = %self.peer, command = command.wire_name(), error = %e, "command failed");
                    failure(command.wire_name(), e.reason())
                }
            },
        };
        vec![SessionAction::Send(reply)]
    }

    fn negotiate(&mut self, client: ApiVersion) -> XmlElement {
        self.negotiated = self.server_version.negotiate(client);
        info!(peer = %self.peer, version = %self.negotiated, "api version negotiated");
        XmlElement::new(names::API_VERSION).with_text(self.negotiated.to_string())
    }
}

impl fmt::Debug for VrclSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VrclSession")
            .field("peer", &self.peer)
            .field("state", &self.state.as_str())
            .field("negotiated", &self.negotiated)
            .field("pending_life_checks", &self.pending_life_checks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vrcl::auth::Blake3KeyDerivation;
    use crate::vrcl::message::Reply;
    use crate::vrcl::scanner::{Scan, scan};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<VrclCommand>>,
    }

    impl RemoteControl for Recorder {
        fn execute(&self, command: &VrclCommand) -> Result<Reply, VpError> {
            self.seen.lock().push(command.clone());
            match command {
                VrclCommand::CallTransfer { .. } => Err(VpError::NotTransferable),
                VrclCommand::CallDial(_) => Ok(Reply::empty().with_attr("call", 1)),
                _ => Ok(Reply::empty()),
            }
        }
    }

    const PEER: &str = "192.168.1.20:50000";
    const LOCAL: &str = "192.168.1.2:15327";

    fn session(secret: &str) -> VrclSession {
        VrclSession::new(
            PEER.parse().unwrap(),
            LOCAL.parse().unwrap(),
            Arc::new(Blake3KeyDerivation::new(secret)),
            ApiVersion::CURRENT,
        )
    }

    fn unit(xml: &str) -> TagUnit {
        match scan(xml.as_bytes()) {
            Scan::Complete { unit, .. } => unit,
            other => panic!("not a unit: {other:?}"),
        }
    }

    fn sent(actions: &[SessionAction]) -> Vec<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                SessionAction::Send(el) => Some(el.to_xml()),
                _ => None,
            })
            .collect()
    }

    fn direct_login(s: &mut VrclSession, remote: &Recorder) {
        let key = Blake3KeyDerivation::new("secret").connect_key(
            "192.168.1.20".parse().unwrap(),
            "192.168.1.2".parse().unwrap(),
        );
        let actions = s.handle(&unit(&format!("<Connect>{key}</Connect>")), remote);
        assert_eq!(sent(&actions), ["<ConnectAck/>"]);
        assert!(actions.contains(&SessionAction::Authenticated));
    }

    #[test]
    fn direct_connect_key_authenticates() {
        let remote = Recorder::default();
        let mut s = session("secret");
        direct_login(&mut s, &remote);
        assert!(s.is_authenticated());
    }

    #[test]
    fn challenge_then_validate_authenticates() {
        let remote = Recorder::default();
        let mut s = session("secret");
        let client = Blake3KeyDerivation::new("secret");

        let actions = s.handle(&unit("<Connect>seen-through-nat</Connect>"), &remote);
        let [SessionAction::Send(ack)] = actions.as_slice() else {
            panic!("expected one challenge, got {actions:?}");
        };
        assert_eq!(ack.name, "ConnectAck");
        assert!(!ack.text().is_empty());
        assert_eq!(s.state().as_str(), "ChallengeSent");

        let password = client.validate_password("seen-through-nat", ack.text());
        let actions = s.handle(&unit(&format!("<Validate>{password}</Validate>")), &remote);
        assert_eq!(sent(&actions), ["<ValidateAck/>"]);
        assert!(s.is_authenticated());
    }

    #[test]
    fn wrong_password_disconnects() {
        let remote = Recorder::default();
        let mut s = session("secret");
        s.handle(&unit("<Connect>k</Connect>"), &remote);
        let actions = s.handle(&unit("<Validate>guess</Validate>"), &remote);
        assert!(matches!(actions.as_slice(), [SessionAction::Disconnect(_)]));
        assert_eq!(*s.state(), AuthState::Disconnected);
        assert!(s.handle(&unit("<IsAlive/>"), &remote).is_empty());
    }

    #[test]
    fn commands_before_authentication_are_refused() {
        let remote = Recorder::default();
        let mut s = session("secret");
        let actions = s.handle(&unit("<CallHangUp/>"), &remote);
        assert_eq!(sent(&actions), ["<CallHangUpFail>not authenticated</CallHangUpFail>"]);
        assert!(remote.seen.lock().is_empty());

        let actions = s.handle(&unit("<Validate>x</Validate>"), &remote);
        assert!(matches!(actions.as_slice(), [SessionAction::Disconnect(_)]));
    }

    #[test]
    fn connect_timeout_only_hits_unauthenticated() {
        let remote = Recorder::default();
        let mut s = session("secret");
        assert!(matches!(
            s.connect_timeout().as_slice(),
            [SessionAction::Disconnect(_)]
        ));

        let mut s = session("secret");
        direct_login(&mut s, &remote);
        assert!(s.connect_timeout().is_empty());
    }

    #[test]
    fn is_alive_is_answered_without_dispatch() {
        let remote = Recorder::default();
        let mut s = session("secret");
        direct_login(&mut s, &remote);
        let actions = s.handle(&unit("<IsAlive />"), &remote);
        assert_eq!(sent(&actions), ["<IsAliveAck/>"]);
        assert!(remote.seen.lock().is_empty());
    }

    #[test]
    fn one_missed_life_check_is_tolerated() {
        let remote = Recorder::default();
        let mut s = session("secret");
        direct_login(&mut s, &remote);

        assert_eq!(sent(&s.life_check_tick()), ["<IsAlive/>"]);
        assert_eq!(sent(&s.life_check_tick()), ["<IsAlive/>"]);
        s.handle(&unit("<IsAliveAck/>"), &remote);
        assert_eq!(s.pending_life_checks(), 0);

        s.life_check_tick();
        s.life_check_tick();
        assert!(matches!(
            s.life_check_tick().as_slice(),
            [SessionAction::Disconnect(_)]
        ));
    }

    #[test]
    fn version_negotiates_down() {
        let remote = Recorder::default();
        let mut s = session("secret");
        direct_login(&mut s, &remote);
        assert!(!s.accepts(ApiVersion::new(1, 1)));

        let actions = s.handle(&unit("<APIVersionGet>1.1</APIVersionGet>"), &remote);
        assert_eq!(sent(&actions), ["<APIVersion>1.1</APIVersion>"]);
        assert!(s.accepts(ApiVersion::new(1, 1)));
        assert!(!s.accepts(ApiVersion::new(1, 2)));

        let actions = s.handle(&unit("<APIVersionGet/>"), &remote);
        assert_eq!(sent(&actions), [format!("<APIVersion>{}</APIVersion>", ApiVersion::CURRENT)]);
    }

    #[test]
    fn dispatch_acks_success_and_failure() {
        let remote = Recorder::default();
        let mut s = session("secret");
        direct_login(&mut s, &remote);

        let actions = s.handle(&unit("<CallDial>5551234</CallDial>"), &remote);
        assert_eq!(sent(&actions), [r#"<CallDialSuccess call="1"/>"#]);

        let actions = s.handle(&unit("<CallTransfer>5559876</CallTransfer>"), &remote);
        assert_eq!(
            sent(&actions),
            ["<CallTransferFail>NotTransferable</CallTransferFail>"]
        );

        let actions = s.handle(&unit("<Frobnicate/>"), &remote);
        assert_eq!(sent(&actions), ["<FrobnicateFail>unknown command</FrobnicateFail>"]);

        let actions = s.handle(&unit("<DtmfSend>99</DtmfSend>"), &remote);
        assert_eq!(sent(&actions), ["<DtmfSendFail>InvalidParameter</DtmfSendFail>"]);
        assert_eq!(remote.seen.lock().len(), 2);
    }
}
