//! The client side: reaches the server through its rendezvous port, follows the redirect to a
//!  dedicated port, and keeps the session there alive with periodic pings.

pub mod client;
pub mod client_config;
pub mod client_events;
