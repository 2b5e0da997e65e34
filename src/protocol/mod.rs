//! Everything that goes over the wire: the typed message, the delimiter based framing of the
//!  reliable channel, and the plain text redirect sent by the rendezvous listener.

pub mod message;
pub mod framing;
pub mod handoff;
