//! Test fakes for the virtual interface and the packet transport.
//!
//! Channel-backed doubles in the spirit of the transport/interface
//! contracts: reads block on a feed channel, writes land in an output
//! channel the test drains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::sleep;

use goconnect_network::{tun::Device, NetworkError, NetworkResult, PacketTransport};

/// Interface double: `feed_read` supplies packets to `read`, `write`
/// lands in a channel observed via `next_written`.
pub(crate) struct TestDevice {
    up: AtomicBool,
    read_tx: mpsc::Sender<Bytes>,
    read_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    written_tx: mpsc::Sender<Bytes>,
    written_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    fail_writes: AtomicBool,
    write_delay: std::sync::Mutex<Option<Duration>>,
}

impl TestDevice {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (read_tx, read_rx) = mpsc::channel(capacity);
        let (written_tx, written_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            up: AtomicBool::new(true),
            read_tx,
            read_rx: tokio::sync::Mutex::new(read_rx),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
            fail_writes: AtomicBool::new(false),
            write_delay: std::sync::Mutex::new(None),
        })
    }

    pub async fn feed_read(&self, packet: &[u8]) {
        self.read_tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .expect("test device feed");
    }

    pub async fn next_written(&self) -> Bytes {
        self.written_rx
            .lock()
            .await
            .recv()
            .await
            .expect("test device drained after close")
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl Device for TestDevice {
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

    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        match self.read_rx.lock().await.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write(&self, buf: &[u8]) -> NetworkResult<usize> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NetworkError::Tun("simulated write failure".into()));
        }
        self.written_tx
            .send(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| NetworkError::Tun("written channel closed".into()))?;
        Ok(buf.len())
    }

    async fn set_address(&self, _cidr: &str) -> NetworkResult<()> {
        Ok(())
    }

    async fn loopback_test(&self, _deadline: Duration) -> NetworkResult<()> {
        Ok(())
    }
}

/// Transport double: `send_packet` lands in a channel observed via
/// `next_sent`, `feed_recv` supplies `recv_packet`.
pub(crate) struct TestTransport {
    sent_tx: mpsc::Sender<Bytes>,
    sent_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    recv_tx: mpsc::Sender<Bytes>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    send_delay: std::sync::Mutex<Option<Duration>>,
}

impl TestTransport {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sent_tx, sent_rx) = mpsc::channel(capacity);
        let (recv_tx, recv_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            sent_tx,
            sent_rx: tokio::sync::Mutex::new(sent_rx),
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            send_delay: std::sync::Mutex::new(None),
        })
    }

    pub async fn feed_recv(&self, packet: &[u8]) {
        self.recv_tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .expect("test transport feed");
    }

    pub async fn next_sent(&self) -> Bytes {
        self.sent_rx
            .lock()
            .await
            .recv()
            .await
            .expect("test transport drained after close")
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl PacketTransport for TestTransport {
    async fn send_packet(&self, packet: Bytes) -> NetworkResult<()> {
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.sent_tx
            .send(packet)
            .await
            .map_err(|_| NetworkError::Stopped)
    }

    async fn recv_packet(&self) -> NetworkResult<Bytes> {
        self.recv_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetworkError::Stopped)
    }
}
