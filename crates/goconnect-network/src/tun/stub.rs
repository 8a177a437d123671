//! Stub interface
//!
//! Trivially succeeding variant used on platforms without a TUN driver and
//! in tests that only exercise lifecycle behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::Device;
use crate::error::NetworkResult;

/// Interface stub: all operations succeed, no packets flow.
#[derive(Default)]
pub struct StubDevice {
    up: AtomicBool,
}

impl StubDevice {
    /// Create a stub in the down state.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Device for StubDevice {
    async fn up(&self) -> NetworkResult<()> {
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn down(&self) -> NetworkResult<()> {
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    async fn read(&self, _buf: &mut [u8]) -> NetworkResult<usize> {
        Ok(0)
    }

    async fn write(&self, buf: &[u8]) -> NetworkResult<usize> {
        Ok(buf.len())
    }

    async fn set_address(&self, _cidr: &str) -> NetworkResult<()> {
        Ok(())
    }

    async fn loopback_test(&self, _deadline: Duration) -> NetworkResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_lifecycle() {
        let dev = StubDevice::new();
        assert!(!dev.is_up());

        dev.up().await.unwrap();
        assert!(dev.is_up());

        let mut buf = [0u8; 16];
        assert_eq!(dev.read(&mut buf).await.unwrap(), 0);
        assert_eq!(dev.write(b"abc").await.unwrap(), 3);

        dev.down().await.unwrap();
        assert!(!dev.is_up());
    }
}
