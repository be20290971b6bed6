//! # vphone-endpoint: Videophone Endpoint Daemon
//!
//! Hosts the conference manager on a loopback signaling stack and exposes
//! it to supervisors through the VRCL server.
//!
//! ## Modes
//!
//! - **Console**: run in the foreground until Ctrl-C.
//! - **Restart**: a component restart request ends the process with the
//!   request's code so an outer supervisor can relaunch it.

pub mod config;
pub mod service;
