use std::{
    io,
    net::{IpAddr, TcpListener},
};

use thiserror::Error;
use tracing::{debug, info};

/// How far past the requested port the fallback search goes.
pub const PORT_SEARCH_SPAN: u16 = 100;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port between {start} and {end} on {ip}")]
    NoneAvailable { ip: IpAddr, start: u16, end: u16 },
    #[error("failed to obtain an ephemeral port on {ip}: {source}")]
    Ephemeral {
        ip: IpAddr,
        #[source]
        source: io::Error,
    },
}

/// Port `0` asks the OS for any free port. Otherwise the requested port is
/// bound when free, else the first free port above it within
/// [`PORT_SEARCH_SPAN`]. The listener is returned still bound so nothing can
/// take the port before the server starts.
pub fn bind_available(ip: IpAddr, requested: u16) -> Result<TcpListener, PortError> {
    if requested == 0 {
        return TcpListener::bind((ip, 0)).map_err(|source| PortError::Ephemeral { ip, source });
    }

    let end = requested.saturating_add(PORT_SEARCH_SPAN);
    for port in requested..=end {
        match TcpListener::bind((ip, port)) {
            Ok(listener) => {
                if port != requested {
                    info!(requested, port, "requested port busy; using fallback");
                }
                return Ok(listener);
            }
            Err(err) => debug!(port, error = %err, "port unavailable"),
        }
    }
    Err(PortError::NoneAvailable {
        ip,
        start: requested,
        end,
    })
}

/// Hand a listener from [`bind_available`] to the Tokio runtime.
pub fn into_async(listener: TcpListener) -> io::Result<tokio::net::TcpListener> {
    listener.set_nonblocking(true)?;
    tokio::net::TcpListener::from_std(listener)
}
