//! Call bookkeeping and lifecycle orchestration.

pub mod manager;
pub mod storage;

pub use manager::{
    BridgeNotice, CallNotice, ConferenceConfig, ConferenceManager, ConferenceSignals,
    ConferenceStats, DtmfNotice, LocalIdentity, TextNotice,
};
pub use storage::CallStorage;
