use crate::listener::AcceptedAddr;

/// Address of the directly connected peer.
#[derive(Debug, Clone)]
pub struct PeerAddr(pub AcceptedAddr);

/// Address of the original client when it differs from the peer (e.g. the
/// connection went through an outer hop that conveyed it).
#[derive(Debug, Clone)]
pub struct RemoteAddr(pub AcceptedAddr);

impl From<AcceptedAddr> for PeerAddr {
    fn from(addr: AcceptedAddr) -> Self {
        Self(addr)
    }
}

impl From<AcceptedAddr> for RemoteAddr {
    fn from(addr: AcceptedAddr) -> Self {
        Self(addr)
    }
}
