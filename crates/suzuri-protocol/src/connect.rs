//! Connection files for locally spawned kernels.
//!
//! A launch writes a small JSON file describing the ports the kernel must
//! bind and the key it must echo; the kernel's argv template receives the
//! file path via the `{connection_file}` placeholder. Ports are allocated
//! ephemerally by binding port 0 and reading back what the OS assigned.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::error::ProtocolError;
use crate::wire::ChannelKind;

/// Socket ports and key a spawned kernel binds/uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub control_port: u16,
    pub stdin_port: u16,
    pub key: String,
    pub signature_scheme: String,
}

impl ConnectionInfo {
    /// Allocate four ephemeral ports on `ip` and a fresh key.
    ///
    /// All four listeners are held simultaneously while reading ports back,
    /// so the OS cannot hand out duplicates; they're released on return and
    /// the spawned kernel re-binds them. The usual launch gap applies: the
    /// transport dials with retries until the kernel is listening.
    pub async fn ephemeral(ip: &str) -> Result<Self, ProtocolError> {
        let listeners = [
            TcpListener::bind((ip, 0)).await?,
            TcpListener::bind((ip, 0)).await?,
            TcpListener::bind((ip, 0)).await?,
            TcpListener::bind((ip, 0)).await?,
        ];
        let mut ports = [0u16; 4];
        for (slot, listener) in ports.iter_mut().zip(&listeners) {
            *slot = listener.local_addr()?.port();
        }

        Ok(Self {
            ip: ip.to_string(),
            transport: "tcp".to_string(),
            shell_port: ports[0],
            iopub_port: ports[1],
            control_port: ports[2],
            stdin_port: ports[3],
            key: uuid::Uuid::new_v4().as_simple().to_string(),
            signature_scheme: "hmac-sha256".to_string(),
        })
    }

    /// The port for a logical channel.
    pub fn port(&self, channel: ChannelKind) -> u16 {
        match channel {
            ChannelKind::Shell => self.shell_port,
            ChannelKind::IoPub => self.iopub_port,
            ChannelKind::Control => self.control_port,
            ChannelKind::Stdin => self.stdin_port,
        }
    }

    /// The socket address for a logical channel.
    pub fn addr(&self, channel: ChannelKind) -> Result<SocketAddr, ProtocolError> {
        format!("{}:{}", self.ip, self.port(channel))
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })
    }

    /// Write the connection file for a kernel to pick up.
    pub async fn write_to(&self, path: &Path) -> Result<(), ProtocolError> {
        let json = serde_json::to_string_pretty(self).map_err(ProtocolError::Encode)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Read a connection file back (kernel-side helper, also used in tests).
    pub async fn read_from(path: &Path) -> Result<Self, ProtocolError> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes).map_err(ProtocolError::Frame)
    }
}

// ============================================================================
// Tests
// ============================================================================
