//! geotrackd - real-time location-tracking session server.
//!
//! Ingests a continuous stream of position fixes from mobile field agents
//! over long-lived WebSocket connections, validates and filters each fix,
//! decides which fixes are durably stored versus merely relayed for live
//! display, and manages the lifecycle of each agent's tracking session
//! including reconnection and remote termination.
//!
//! The transport (axum WebSocket + operator HTTP API) lives in [`server`];
//! everything below it is transport-agnostic and driven through
//! [`manager::SessionManager`].

pub mod auth;
pub mod config;
pub mod geo;
pub mod manager;
pub mod persist;
pub mod protocol;
pub mod server;
pub mod session;
pub mod validate;
pub mod watch;

pub use manager::SessionManager;
pub use session::{SessionState, SessionStore, Thresholds, TrackingSession};
