//! Virtual interface abstraction
//!
//! Platform-agnostic TUN device trait with implementations for:
//! - Linux / macOS (native, using the tun crate)
//! - everywhere else (stub, trivially succeeding)
//!
//! The interface carries the overlay address handed out by the controller
//! and is the agent's packet source/sink on the local side.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{NetworkError, NetworkResult};

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod native;
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use native::NativeDevice;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsDevice;

mod stub;
pub use stub::StubDevice;

/// Fixed interface alias.
pub const INTERFACE_NAME: &str = "GOConnect";

/// Default interface MTU.
pub const DEFAULT_MTU: u16 = 1280;

/// Address used for the self-test before the controller assigns one.
pub const DEFAULT_OVERLAY_ADDR: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 2);

/// Fixed port for the loopback self-test.
pub const LOOPBACK_TEST_PORT: u16 = 43000;

/// Default deadline for the loopback self-test.
pub const LOOPBACK_TEST_TIMEOUT: Duration = Duration::from_secs(2);

const LOOPBACK_PAYLOAD: &[u8] = b"goconnect-loopback";

/// Platform-agnostic virtual interface.
///
/// `down` must be safe to call from a task other than the one blocked in
/// `read`; read futures release the device on drop.
#[async_trait]
pub trait Device: Send + Sync {
    /// Bring the interface up.
    async fn up(&self) -> NetworkResult<()>;

    /// Take the interface down, unblocking pending reads.
    async fn down(&self) -> NetworkResult<()>;

    /// Whether the interface is currently up.
    fn is_up(&self) -> bool;

    /// Read one packet; returns 0 when nothing is available.
    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize>;

    /// Write one packet; returns the number of bytes written.
    async fn write(&self, buf: &[u8]) -> NetworkResult<usize>;

    /// Assign the overlay address (`a.b.c.d/prefix`).
    async fn set_address(&self, cidr: &str) -> NetworkResult<()>;

    /// End-to-end self-test: send a datagram to ourselves over the
    /// interface address and verify it comes back unchanged.
    async fn loopback_test(&self, deadline: Duration) -> NetworkResult<()>;
}

/// Create the interface variant for this platform.
pub fn create_device(mtu: u16) -> std::sync::Arc<dyn Device> {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        std::sync::Arc::new(NativeDevice::new(mtu))
    }
    #[cfg(target_os = "windows")]
    {
        std::sync::Arc::new(WindowsDevice::new(mtu))
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        let _ = mtu;
        std::sync::Arc::new(StubDevice::new())
    }
}

/// Bind a UDP socket on `ip:port`, send a known payload to ourselves and
/// verify byte-equality under the deadline.
pub async fn loopback_probe(ip: Ipv4Addr, port: u16, deadline: Duration) -> NetworkResult<()> {
    let listener = UdpSocket::bind((ip, port))
        .await
        .map_err(|e| NetworkError::Bind(format!("loopback listener: {e}")))?;
    let sender = UdpSocket::bind((ip, 0))
        .await
        .map_err(|e| NetworkError::Bind(format!("loopback sender: {e}")))?;

    sender.send_to(LOOPBACK_PAYLOAD, (ip, port)).await?;

    let mut buf = [0u8; 64];
    let (n, _) = timeout(deadline, listener.recv_from(&mut buf))
        .await
        .map_err(|_| NetworkError::LoopbackMismatch)??;

    if &buf[..n] != LOOPBACK_PAYLOAD {
        return Err(NetworkError::LoopbackMismatch);
    }
    debug!("loopback probe on {}:{} ok", ip, port);
    Ok(())
}

/// Parse `a.b.c.d/prefix` into address and prefix length.
pub(crate) fn parse_cidr(cidr: &str) -> NetworkResult<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| NetworkError::Config(format!("invalid CIDR '{cidr}'")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| NetworkError::Config(format!("invalid CIDR '{cidr}'")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| NetworkError::Config(format!("invalid CIDR '{cidr}'")))?;
    if prefix > 32 {
        return Err(NetworkError::Config(format!("invalid CIDR '{cidr}'")));
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_probe_on_localhost() {
        loopback_probe(Ipv4Addr::LOCALHOST, 43123, LOOPBACK_TEST_TIMEOUT)
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            parse_cidr("100.64.0.7/10").unwrap(),
            (Ipv4Addr::new(100, 64, 0, 7), 10)
        );
        assert!(parse_cidr("100.64.0.7").is_err());
        assert!(parse_cidr("100.64.0.7/33").is_err());
        assert!(parse_cidr("bogus/8").is_err());
    }
}
