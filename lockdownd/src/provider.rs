//! Connection providers.
//!
//! The multiplexer that exposes the device as a set of addressable ports is
//! not part of this crate; a provider is anything that can open an async
//! byte stream to one of those ports. [`TcpProvider`] covers devices whose
//! ports are reachable directly over the network.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::{LockdownError, PlistService};

/// Source of connections to a device's service ports.
pub trait DeviceProvider: Send + Sync + std::fmt::Debug {
    /// Opens a property-list channel to the given port.
    fn connect(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<PlistService, LockdownError>> + Send;

    /// The label stamped on requests sent over connections from this
    /// provider.
    fn label(&self) -> &str;
}

/// Connects to device ports over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpProvider {
    addr: IpAddr,
    label: String,
}

impl TcpProvider {
    pub fn new(addr: IpAddr, label: impl Into<String>) -> Self {
        Self {
            addr,
            label: label.into(),
        }
    }
}

impl DeviceProvider for TcpProvider {
    async fn connect(&self, port: u16) -> Result<PlistService, LockdownError> {
        let stream = TcpStream::connect(SocketAddr::new(self.addr, port)).await?;
        Ok(PlistService::new(
            Box::new(stream),
            Some(self.label.clone()),
        ))
    }

    fn label(&self) -> &str {
        &self.label
    }
}
