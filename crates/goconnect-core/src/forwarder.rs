//! Packet forwarder
//!
//! Pumps packets between the virtual interface and the transport through
//! two bounded queues with drop-newest backpressure:
//!
//! ```text
//!   interface --read--> [helper] --> t2x --> send_packet --> transport
//!   transport --recv--> [helper] --> x2t --> write        --> interface
//! ```
//!
//! Dedicated helper tasks keep the blocking reads off the queue producers;
//! a full queue drops the newest packet and accounts it. Counters are
//! atomic so stats snapshots never take a lock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use goconnect_network::{tun::Device, NetworkError, PacketTransport};

use crate::error::{CoreError, CoreResult};

/// Per-packet bound on transport sends.
const SEND_BOUND: Duration = Duration::from_secs(2);

/// Pause after an empty or failed interface read.
const IDLE_READ_DELAY: Duration = Duration::from_millis(10);

/// Forwarder knobs for backpressure and shutdown.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Capacity of each direction's queue.
    pub buffer_packets: usize,
    /// Reusable read buffer size; also the largest packet accepted.
    pub max_frame_bytes: usize,
    /// How long `stop` waits for the tasks to finish.
    pub shutdown_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            buffer_packets: 256,
            max_frame_bytes: 65535,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Monotonic forwarding counters plus the last interface write error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub forwarded_t2x: u64,
    pub dropped_t2x: u64,
    pub forwarded_x2t: u64,
    pub dropped_x2t: u64,
    pub last_err_unix: i64,
}

#[derive(Default)]
struct Counters {
    forwarded_t2x: AtomicU64,
    dropped_t2x: AtomicU64,
    forwarded_x2t: AtomicU64,
    dropped_x2t: AtomicU64,
    last_err_unix: AtomicI64,
}

/// Connects a virtual interface and a transport with bounded buffering.
///
/// Holds non-owning references to both; the owner tears them down after
/// `stop` returns.
pub struct Forwarder {
    device: Arc<dyn Device>,
    transport: Arc<dyn PacketTransport>,
    config: ForwarderConfig,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Forwarder {
    /// Create a forwarder whose tasks stop when `cancel` fires.
    pub fn new(
        device: Arc<dyn Device>,
        transport: Arc<dyn PacketTransport>,
        config: ForwarderConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device,
            transport,
            config,
            cancel,
            counters: Arc::new(Counters::default()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Launch the pump tasks.
    pub fn start(&self) {
        let buffer = self.config.buffer_packets;
        let (t2x_tx, t2x_rx) = mpsc::channel::<Bytes>(buffer);
        let (x2t_tx, x2t_rx) = mpsc::channel::<Bytes>(buffer);

        let mut tasks = self.tasks.lock().unwrap();

        // Interface reader: blocking reads decoupled through a helper
        // channel so a full t2x queue never stalls the device.
        let (iface_tx, iface_rx) = mpsc::channel::<Bytes>(buffer);
        tasks.push(tokio::spawn(interface_reader(
            self.device.clone(),
            self.config.max_frame_bytes,
            iface_tx,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(queue_producer(
            iface_rx,
            t2x_tx,
            self.counters.clone(),
            Direction::T2x,
            self.cancel.clone(),
        )));

        // Transport reader, symmetric to the interface side.
        let (tr_tx, tr_rx) = mpsc::channel::<Bytes>(buffer);
        tasks.push(tokio::spawn(transport_reader(
            self.transport.clone(),
            tr_tx,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(queue_producer(
            tr_rx,
            x2t_tx,
            self.counters.clone(),
            Direction::X2t,
            self.cancel.clone(),
        )));

        tasks.push(tokio::spawn(transport_writer(
            self.transport.clone(),
            t2x_rx,
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(interface_writer(
            self.device.clone(),
            x2t_rx,
            self.counters.clone(),
            self.cancel.clone(),
        )));
    }

    /// Stop the pumps: cancel, break blocking reads by taking the
    /// interface down, then wait up to the shutdown timeout.
    ///
    /// On timeout the tasks may still be live, but every externally
    /// visible resource is already released.
    pub async fn stop(&self) -> CoreResult<()> {
        self.cancel.cancel();
        // Last-resort unblock for reads parked inside the device. This is
        // the single sanctioned touch of the interface from the forwarder.
        let _ = self.device.down().await;

        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match timeout(self.config.shutdown_timeout, join_all).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("forwarder event=shutdown_timeout");
                Err(CoreError::ShutdownTimeout)
            }
        }
    }

    /// Atomic snapshot of the counters.
    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            forwarded_t2x: self.counters.forwarded_t2x.load(Ordering::Relaxed),
            dropped_t2x: self.counters.dropped_t2x.load(Ordering::Relaxed),
            forwarded_x2t: self.counters.forwarded_x2t.load(Ordering::Relaxed),
            dropped_x2t: self.counters.dropped_x2t.load(Ordering::Relaxed),
            last_err_unix: self.counters.last_err_unix.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    T2x,
    X2t,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::T2x => "t2x",
            Direction::X2t => "x2t",
        }
    }
}

/// Blocking interface reads into a reusable buffer; each non-empty read
/// is copied out and offered to the helper channel without blocking.
async fn interface_reader(
    device: Arc<dyn Device>,
    max_frame_bytes: usize,
    helper: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; max_frame_bytes];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = device.read(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(IDLE_READ_DELAY) => {}
                }
            }
            Ok(n) => {
                let packet = Bytes::copy_from_slice(&buf[..n]);
                // helper full: drop here, the queue producer accounts
                let _ = helper.try_send(packet);
            }
        }
    }
}

/// Transport receives into the helper channel, symmetric to the
/// interface reader.
async fn transport_reader(
    transport: Arc<dyn PacketTransport>,
    helper: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = transport.recv_packet() => received,
        };
        match received {
            Ok(packet) if !packet.is_empty() => {
                let _ = helper.try_send(packet);
            }
            Ok(_) | Err(_) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(IDLE_READ_DELAY) => {}
                }
            }
        }
    }
}

/// Drain the helper channel into the bounded queue, accounting forwarded
/// and dropped packets at this boundary.
async fn queue_producer(
    mut helper: mpsc::Receiver<Bytes>,
    queue: mpsc::Sender<Bytes>,
    counters: Arc<Counters>,
    direction: Direction,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = helper.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        let (forwarded, dropped) = match direction {
            Direction::T2x => (&counters.forwarded_t2x, &counters.dropped_t2x),
            Direction::X2t => (&counters.forwarded_x2t, &counters.dropped_x2t),
        };

        match queue.try_send(packet) {
            Ok(()) => {
                forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(packet)) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "forwarder dir={} event=drop len={}",
                    direction.as_str(),
                    packet.len()
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Drain t2x into the transport with a per-packet send bound; a slow
/// send drops that packet and the writer moves on.
async fn transport_writer(
    transport: Arc<dyn PacketTransport>,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        let len = packet.len();
        match timeout(SEND_BOUND, transport.send_packet(packet)).await {
            Ok(Ok(())) => {}
            Ok(Err(NetworkError::NotStarted)) | Ok(Err(NetworkError::Stopped)) => {
                debug!("forwarder dir=t2x event=send_unavailable len={}", len);
            }
            Ok(Err(e)) => {
                debug!("forwarder dir=t2x event=send_err len={} err={}", len, e);
            }
            Err(_) => {
                debug!("forwarder dir=t2x event=send_timeout len={}", len);
            }
        }
    }
}

/// Drain x2t into the interface. Write errors are recorded and logged;
/// the writer never terminates on them.
async fn interface_writer(
    device: Arc<dyn Device>,
    mut queue: mpsc::Receiver<Bytes>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            packet = queue.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
        };

        if let Err(e) = device.write(&packet).await {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            counters.last_err_unix.store(now, Ordering::Relaxed);
            debug!("forwarder dir=x2t event=write_err err={}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestDevice, TestTransport};

    fn forwarder_with(
        device: Arc<TestDevice>,
        transport: Arc<TestTransport>,
        config: ForwarderConfig,
    ) -> Forwarder {
        Forwarder::new(device, transport, config, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_happy_path_both_directions() {
        let device = TestDevice::new(16);
        let transport = TestTransport::new(16);
        let forwarder = forwarder_with(
            device.clone(),
            transport.clone(),
            ForwarderConfig {
                buffer_packets: 8,
                max_frame_bytes: 2048,
                shutdown_timeout: Duration::from_secs(1),
            },
        );
        forwarder.start();

        // interface -> transport
        device.feed_read(b"hello").await;
        let sent = timeout(Duration::from_secs(2), transport.next_sent())
            .await
            .expect("t2x timed out");
        assert_eq!(sent.as_ref(), b"hello");

        // transport -> interface
        transport.feed_recv(b"world").await;
        let written = timeout(Duration::from_secs(2), device.next_written())
            .await
            .expect("x2t timed out");
        assert_eq!(written.as_ref(), b"world");

        let stats = forwarder.stats();
        assert!(stats.forwarded_t2x >= 1);
        assert!(stats.forwarded_x2t >= 1);

        forwarder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_packet_conservation() {
        let device = TestDevice::new(256);
        let transport = TestTransport::new(256);
        let forwarder = forwarder_with(device.clone(), transport.clone(), ForwarderConfig::default());
        forwarder.start();

        const FED: u64 = 100;
        for i in 0..FED {
            device.feed_read(format!("pkt-{i}").as_bytes()).await;
            transport.feed_recv(format!("pkt-{i}").as_bytes()).await;
            // pace the feed so the helper stage always keeps up
            sleep(Duration::from_millis(1)).await;
        }
        for _ in 0..FED {
            let _ = timeout(Duration::from_secs(2), transport.next_sent())
                .await
                .expect("packet lost in t2x");
            let _ = timeout(Duration::from_secs(2), device.next_written())
                .await
                .expect("packet lost in x2t");
        }

        let stats = forwarder.stats();
        assert_eq!(stats.forwarded_t2x + stats.dropped_t2x, FED);
        assert_eq!(stats.forwarded_x2t + stats.dropped_x2t, FED);
        assert_eq!(stats.dropped_t2x, 0, "unloaded queues must not drop");
        assert_eq!(stats.dropped_x2t, 0, "unloaded queues must not drop");

        forwarder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_newest_under_backpressure() {
        let device = TestDevice::new(256);
        let transport = TestTransport::new(256);
        // Block the transport writer: every send sleeps for 10 s.
        transport.set_send_delay(Duration::from_secs(10));

        let forwarder = forwarder_with(
            device.clone(),
            transport.clone(),
            ForwarderConfig {
                buffer_packets: 4,
                max_frame_bytes: 2048,
                shutdown_timeout: Duration::from_secs(1),
            },
        );
        forwarder.start();

        const FED: u64 = 64;
        for i in 0..FED {
            device.feed_read(format!("pkt-{i}").as_bytes()).await;
            sleep(Duration::from_millis(2)).await;
        }
        // let the producer finish accounting the tail
        sleep(Duration::from_millis(100)).await;

        let stats = forwarder.stats();
        assert_eq!(stats.forwarded_t2x + stats.dropped_t2x, FED, "no packet leak");
        assert!(
            stats.forwarded_t2x <= 4 + 4,
            "at most in-flight + queue capacity forwarded, got {}",
            stats.forwarded_t2x
        );
        assert!(
            stats.dropped_t2x >= 56,
            "expected at least 56 drops, got {}",
            stats.dropped_t2x
        );

        // Stop must not deadlock on the blocked writer; the 2 s send bound
        // has already detached it from the in-flight packet.
        forwarder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_interface_write_error_recorded_and_survived() {
        let device = TestDevice::new(16);
        let transport = TestTransport::new(16);
        device.fail_writes(true);

        let forwarder = forwarder_with(device.clone(), transport.clone(), ForwarderConfig::default());
        forwarder.start();

        transport.feed_recv(b"doomed").await;
        sleep(Duration::from_millis(100)).await;
        assert!(forwarder.stats().last_err_unix > 0);

        // Writer survives and recovers once writes succeed again.
        device.fail_writes(false);
        transport.feed_recv(b"alive").await;
        let written = timeout(Duration::from_secs(2), device.next_written())
            .await
            .expect("writer terminated on error");
        assert_eq!(written.as_ref(), b"alive");

        forwarder.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_under_load() {
        let device = TestDevice::new(1024);
        let transport = TestTransport::new(1024);
        let forwarder = Arc::new(forwarder_with(
            device.clone(),
            transport.clone(),
            ForwarderConfig::default(),
        ));
        forwarder.start();

        // Pump both directions while consuming the outputs.
        let feeder_dev = device.clone();
        let feeder_tr = transport.clone();
        let feeder = tokio::spawn(async move {
            for i in 0u32..1000 {
                feeder_dev.feed_read(&i.to_be_bytes()).await;
                feeder_tr.feed_recv(&i.to_be_bytes()).await;
                sleep(Duration::from_millis(1)).await;
            }
        });
        let drain_tr = transport.clone();
        tokio::spawn(async move {
            loop {
                drain_tr.next_sent().await;
            }
        });
        let drain_dev = device.clone();
        tokio::spawn(async move {
            loop {
                drain_dev.next_written().await;
            }
        });

        sleep(Duration::from_millis(200)).await;
        forwarder.stop().await.unwrap();
        feeder.abort();

        // Counters are frozen after stop.
        let after_stop = forwarder.stats();
        sleep(Duration::from_millis(150)).await;
        assert_eq!(forwarder.stats(), after_stop);
        assert!(!device.is_up(), "stop must take the interface down");
    }

    #[tokio::test]
    async fn test_shutdown_timeout_reported() {
        let device = TestDevice::new(16);
        let transport = TestTransport::new(16);
        // Interface writes hang long enough to outlive the deadline, so
        // the interface writer cannot observe cancellation in time.
        device.set_write_delay(Duration::from_secs(10));

        let forwarder = forwarder_with(
            device.clone(),
            transport.clone(),
            ForwarderConfig {
                buffer_packets: 4,
                max_frame_bytes: 2048,
                shutdown_timeout: Duration::from_millis(200),
            },
        );
        forwarder.start();

        transport.feed_recv(b"stuck").await;
        sleep(Duration::from_millis(100)).await;

        let err = forwarder.stop().await.unwrap_err();
        assert!(matches!(err, CoreError::ShutdownTimeout));
    }
}
