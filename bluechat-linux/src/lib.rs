//! BlueChat for Linux: LAN stand-in for the radio transport, session manager,
//! discovery and the controller presentation code drives.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod events;
pub mod session;
pub mod transfer;
pub mod transport;

pub use controller::{ChatController, ControllerError};
pub use session::{ConnectionEvents, SessionError};
