//! The server side: a rendezvous listener on a well-known port redirects every arrival to a
//!  dedicated port from a fixed pool, where the actual session is established.
//!
//! The number of dedicated ports is the hard limit for concurrent sessions. While all of them are
//!  in use, the rendezvous listener is closed; it is re-opened (if so configured) when a session
//!  ends and frees its port.

pub mod port_pool;
mod rendezvous;
pub mod server;
pub mod server_config;
pub mod server_events;
