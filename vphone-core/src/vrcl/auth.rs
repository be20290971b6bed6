//! Key derivation for the VRCL handshake.
//!
//! ```text
//!   client                                   server
//!     │ <Connect>connect_key(c_ip, s_ip)</Connect> │
//!     │ ─────────────────────────────────────────► │ matches? ─► <ConnectAck/>
//!     │ ◄───────────── <ConnectAck>challenge</ConnectAck>
//!     │ <Validate>validate_password(key, challenge)</Validate>
//!     │ ─────────────────────────────────────────► │ matches? ─► <ValidateAck/>
//! ```
//!
//! The direct path succeeds when both ends see the same pair of addresses;
//! the challenge path covers NAT and multi-homed hosts. The functions are
//! pluggable so a deployment can strengthen them without touching the
//! session state machine.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of every derived token, in hex characters.
pub const TOKEN_LEN: usize = 32;

pub trait KeyDerivation: Send + Sync {
    /// Key the client presents in `<Connect>`.
    fn connect_key(&self, client: IpAddr, server: IpAddr) -> String;

    /// Fresh challenge issued when the connect key did not validate.
    fn server_challenge(&self, client_key: &str) -> String;

    /// Password expected in `<Validate>` for a given key and challenge.
    fn validate_password(&self, client_key: &str, challenge: &str) -> String;
}

/// Default derivation: BLAKE3 in key-derivation mode over a shared secret.
pub struct Blake3KeyDerivation {
    secret: String,
    nonce: AtomicU64,
}

impl Blake3KeyDerivation {
    const CONNECT_CONTEXT: &'static str = "vphone vrcl 2024 connect key";
    const CHALLENGE_CONTEXT: &'static str = "vphone vrcl 2024 server challenge";
    const VALIDATE_CONTEXT: &'static str = "vphone vrcl 2024 validate password";

    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            nonce: AtomicU64::new(0),
        }
    }

    fn derive(&self, context: &str, parts: &[&[u8]]) -> String {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        hasher.update(self.secret.as_bytes());
        for part in parts {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let hash = hasher.finalize();
        hash.to_hex()[..TOKEN_LEN].to_string()
    }
}

impl std::fmt::Debug for Blake3KeyDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blake3KeyDerivation").finish_non_exhaustive()
    }
}

impl KeyDerivation for Blake3KeyDerivation {
    fn connect_key(&self, client: IpAddr, server: IpAddr) -> String {
        let client = client.to_canonical().to_string();
        let server = server.to_canonical().to_string();
        self.derive(
            Self::CONNECT_CONTEXT,
            &[client.as_bytes(), server.as_bytes()],
        )
    }

    fn server_challenge(&self, client_key: &str) -> String {
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.derive(
            Self::CHALLENGE_CONTEXT,
            &[
                client_key.as_bytes(),
                &nonce.to_le_bytes(),
                &now.to_le_bytes(),
            ],
        )
    }

    fn validate_password(&self, client_key: &str, challenge: &str) -> String {
        self.derive(
            Self::VALIDATE_CONTEXT,
            &[client_key.as_bytes(), challenge.as_bytes()],
        )
    }
}

/// Compare two tokens without an early exit on the first mismatch.
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    blake3::hash(expected.as_bytes()) == blake3::hash(presented.as_bytes())
}
