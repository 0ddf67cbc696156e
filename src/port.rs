use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Asks the OS for a free ephemeral TCP port. Nothing is reserved: the
/// listener is dropped before returning, so a later bind can still lose the race.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    let port = listener.local_addr()?.port();
    Ok(port)
}
