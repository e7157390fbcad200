//! Waypoint - rule-based traffic dispatch for proxy tunnels.
//!
//! Inbound requests are matched against an ordered rule set, dialed through
//! the selected outbound and relayed. UDP packets share one outbound path per
//! local session.

pub mod adapter;
pub mod error;
pub mod hosts;
pub mod inbound;
pub mod metadata;
pub mod nat;
pub mod resolver;
pub mod rules;
pub mod server;
pub mod tracker;
pub mod tunnel;

pub use error::{Error, Result};
