//! Native TUN device (Linux / macOS)
//!
//! Backed by the tun crate's async device. The interface carries the fixed
//! `GOConnect` alias; address assignment shells out to the platform's
//! interface-configuration command, matching how the controller pushes the
//! overlay address after join.

use std::net::Ipv4Addr;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    loopback_probe, parse_cidr, Device, DEFAULT_OVERLAY_ADDR, INTERFACE_NAME, LOOPBACK_TEST_PORT,
};
use crate::error::{NetworkError, NetworkResult};

/// Delay after device creation so the kernel registers the interface
/// before any loopback test.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

/// Native TUN device.
pub struct NativeDevice {
    name: String,
    mtu: u16,
    device: Mutex<Option<tun::AsyncDevice>>,
    address: RwLock<Ipv4Addr>,
}

impl NativeDevice {
    /// Create a handle; the kernel interface appears on `up`.
    pub fn new(mtu: u16) -> Self {
        Self {
            name: INTERFACE_NAME.to_string(),
            mtu,
            device: Mutex::new(None),
            address: RwLock::new(DEFAULT_OVERLAY_ADDR),
        }
    }

    /// Interface alias.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Device for NativeDevice {
    async fn up(&self) -> NetworkResult<()> {
        let mut slot = self.device.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let mut config = tun::Configuration::default();
        config
            .name(&self.name)
            .address(*self.address.read().unwrap())
            .netmask(Ipv4Addr::new(255, 255, 255, 255))
            .mtu(self.mtu as i32)
            .up();

        #[cfg(target_os = "linux")]
        config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|e| NetworkError::Tun(format!("create device: {e}")))?;
        info!("created TUN device {} (mtu {})", self.name, self.mtu);
        *slot = Some(device);
        drop(slot);

        // Give the kernel a moment to register the interface.
        tokio::time::sleep(SETTLE_DELAY).await;
        Ok(())
    }

    async fn down(&self) -> NetworkResult<()> {
        let mut slot = self.device.lock().await;
        if slot.take().is_some() {
            debug!("closed TUN device {}", self.name);
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        // try_lock: a pending read means the device exists and is up
        match self.device.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        let mut slot = self.device.lock().await;
        let device = slot
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device not up".into()))?;
        let n = device
            .read(buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("read: {e}")))?;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> NetworkResult<usize> {
        let mut slot = self.device.lock().await;
        let device = slot
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device not up".into()))?;
        device
            .write_all(buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("write: {e}")))?;
        Ok(buf.len())
    }

    async fn set_address(&self, cidr: &str) -> NetworkResult<()> {
        let (addr, prefix) = parse_cidr(cidr)?;
        *self.address.write().unwrap() = addr;

        #[cfg(target_os = "linux")]
        let output = Command::new("ip")
            .args(["addr", "replace", cidr, "dev", &self.name])
            .output()
            .await?;

        #[cfg(target_os = "macos")]
        let output = Command::new("ifconfig")
            .args([
                &self.name,
                &addr.to_string(),
                &addr.to_string(),
                "netmask",
                &prefix_to_mask(prefix).to_string(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "set address {cidr}: {}",
                stderr.trim()
            )));
        }
        info!("assigned {} to {}", cidr, self.name);
        #[cfg(target_os = "linux")]
        let _ = prefix;
        Ok(())
    }

    async fn loopback_test(&self, deadline: Duration) -> NetworkResult<()> {
        if !self.is_up() {
            return Err(NetworkError::Tun("device not up".into()));
        }
        let addr = *self.address.read().unwrap();
        loopback_probe(addr, LOOPBACK_TEST_PORT, deadline).await
    }
}

#[cfg(target_os = "macos")]
fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ipv4Addr::from(mask)
}
