//! Windows TUN device using WinTun
//!
//! WinTun is the high-performance TUN driver used by WireGuard on Windows;
//! wintun.dll must sit next to the executable or in PATH. Reads come off a
//! blocking receive task feeding a channel, writes go through the session's
//! ring buffer, and address configuration shells out to netsh.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{
    loopback_probe, parse_cidr, Device, DEFAULT_OVERLAY_ADDR, INTERFACE_NAME, LOOPBACK_TEST_PORT,
};
use crate::error::{NetworkError, NetworkResult};

/// Ring buffer size for the WinTun session (must be a power of 2).
const RING_CAPACITY: u32 = 0x40_0000;

/// Delay after adapter creation so the stack registers the interface.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

struct Session {
    session: Arc<wintun::Session>,
    _adapter: Arc<wintun::Adapter>,
    running: Arc<AtomicBool>,
    packets: mpsc::Receiver<Bytes>,
    recv_task: tokio::task::JoinHandle<()>,
}

/// Windows TUN device.
pub struct WindowsDevice {
    name: String,
    mtu: u16,
    address: std::sync::RwLock<Ipv4Addr>,
    state: tokio::sync::Mutex<Option<Session>>,
}

impl WindowsDevice {
    /// Create a handle; the adapter appears on `up`.
    pub fn new(mtu: u16) -> Self {
        Self {
            name: INTERFACE_NAME.to_string(),
            mtu,
            address: std::sync::RwLock::new(DEFAULT_OVERLAY_ADDR),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Adapter alias.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Device for WindowsDevice {
    async fn up(&self) -> NetworkResult<()> {
        let mut slot = self.state.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let wintun = unsafe { wintun::load() }.map_err(|e| {
            NetworkError::Tun(format!(
                "load wintun.dll: {e}; place it next to the executable"
            ))
        })?;

        // Drop any stale adapter left from a previous run.
        let _ = wintun::Adapter::open(&wintun, &self.name);
        let adapter = wintun::Adapter::create(&wintun, &self.name, "GOConnect", None)
            .map_err(|e| NetworkError::Tun(format!("create adapter: {e}")))?;

        let session = Arc::new(
            adapter
                .start_session(RING_CAPACITY)
                .map_err(|e| NetworkError::Tun(format!("start session: {e}")))?,
        );

        let running = Arc::new(AtomicBool::new(true));
        let (tx, packets) = mpsc::channel::<Bytes>(1024);
        let recv_task = spawn_receive_task(session.clone(), running.clone(), tx);

        info!("created WinTun adapter {} (mtu {})", self.name, self.mtu);
        *slot = Some(Session {
            session,
            _adapter: adapter,
            running,
            packets,
            recv_task,
        });
        drop(slot);

        // Give the stack a moment to register the interface.
        sleep(SETTLE_DELAY).await;
        Ok(())
    }

    async fn down(&self) -> NetworkResult<()> {
        let mut slot = self.state.lock().await;
        if let Some(session) = slot.take() {
            session.running.store(false, Ordering::SeqCst);
            // Unblocks the receive task parked in receive_blocking.
            let _ = session.session.shutdown();
            session.recv_task.abort();
            debug!("closed WinTun adapter {}", self.name);
        }
        Ok(())
    }

    fn is_up(&self) -> bool {
        match self.state.try_lock() {
            Ok(slot) => slot.is_some(),
            Err(_) => true,
        }
    }

    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        let mut slot = self.state.lock().await;
        let session = slot
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device not up".into()))?;
        match session.packets.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> NetworkResult<usize> {
        let session = {
            let slot = self.state.lock().await;
            match slot.as_ref() {
                Some(session) if session.running.load(Ordering::Relaxed) => {
                    session.session.clone()
                }
                _ => return Err(NetworkError::Tun("device not up".into())),
            }
        };

        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut packet = session
                .allocate_send_packet(data.len() as u16)
                .map_err(|e| NetworkError::Tun(format!("allocate packet: {e}")))?;
            packet.bytes_mut().copy_from_slice(&data);
            session.send_packet(packet);
            Ok::<(), NetworkError>(())
        })
        .await
        .map_err(|e| NetworkError::Tun(format!("send task: {e}")))??;

        Ok(buf.len())
    }

    async fn set_address(&self, cidr: &str) -> NetworkResult<()> {
        let (addr, prefix) = parse_cidr(cidr)?;
        *self.address.write().unwrap() = addr;

        let output = Command::new("netsh")
            .args([
                "interface",
                "ipv4",
                "set",
                "address",
                &format!("name={}", self.name),
                "static",
                &addr.to_string(),
                &prefix_to_mask(prefix).to_string(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "netsh set address {cidr}: {}",
                stderr.trim()
            )));
        }
        info!("assigned {} to {}", cidr, self.name);
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

/// Pull packets off the WinTun ring on a blocking thread.
fn spawn_receive_task(
    session: Arc<wintun::Session>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::Relaxed) {
            match session.receive_blocking() {
                Ok(packet) => {
                    let bytes = Bytes::copy_from_slice(packet.bytes());
                    if tx.blocking_send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        warn!("WinTun receive error: {}", e);
                    }
                    break;
                }
            }
        }
        debug!("WinTun receive task stopped");
    })
}

fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    };
    Ipv4Addr::from(mask)
}
