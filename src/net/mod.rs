pub mod transport;

pub(crate) mod comms;
pub(crate) mod handshake;
pub(crate) mod reconnect;
