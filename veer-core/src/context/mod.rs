//! Typed per-connection context carried through the service stack.
//!
//! Built with `certain_map` so that services which *set* a field and services
//! which *read* it are checked against each other at compile time.
use keys::{PeerAddr, RemoteAddr};

pub mod keys;

certain_map::certain_map! {
    #[derive(Debug)]
    #[derive(Clone)]
    #[empty(EmptyContext)]
    pub struct Context {
        // Set by ContextService on accept.
        peer_addr: PeerAddr,
        // Optionally set by embedders that learn the real client address
        // from an outer hop; used for the X-Forwarded-For chain.
        remote_addr: Option<RemoteAddr>,
    }
}
