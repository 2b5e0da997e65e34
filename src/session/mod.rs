//! One established session, as seen from either side: the endpoint that owns the sending half
//!  and the connected state, the receive loop with the liveness timeout, and the ping loop.
//!
//! The client and the per-port server side share all of this; they differ only in the
//!  [receive_loop::SessionHandler] they plug in.

pub mod endpoint;
pub mod receive_loop;
pub mod ping;
