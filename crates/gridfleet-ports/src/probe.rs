//! Host-level "is this port in use" checks.

use std::net::{Ipv4Addr, TcpListener};

/// Answers whether something on the host already listens on a port.
pub trait PortProbe: Send + Sync {
    fn is_in_use(&self, port: u16) -> bool;
}

/// Tries to bind `127.0.0.1:port`; a failed bind means the port is taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_in_use(&self, port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_err()
    }
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn is_in_use(&self, port: u16) -> bool {
        self(port)
    }
}
