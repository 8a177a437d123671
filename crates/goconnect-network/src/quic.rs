//! Encrypted peer transport
//!
//! One QUIC endpoint over an exclusively owned UDP socket carries all peer
//! sessions. Both directions authenticate with the agent's leaf certificate
//! against the shared trust pool: TLS 1.3, ALPN `goc/1`, fixed SNI
//! `goconnect`, client certificates required.
//!
//! Three kinds of loops run on top of the endpoint:
//! - accept loop: echo-and-update workers that also deliver decoded frames
//!   to the local forwarder
//! - dial loops: one per configured peer, probing RTT with per-peer backoff
//! - outbound loop: maintains at most one data session to the first
//!   configured peer, reconnecting with its own backoff

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use quinn::{Connection, Endpoint, RecvStream, SendStream};
use rustls::server::WebPkiClientVerifier;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use goconnect_identity::{Identity, TrustPool, TLS_SERVER_NAME};

use crate::endpoint::{EndpointCallback, EndpointObservation};
use crate::error::{NetworkError, NetworkResult};
use crate::frame::{encode_frame, FrameDecoder, MAX_FRAME_BYTES};
use crate::peers::{Peer, PeerRegistry};
use crate::stun::{probe_first, STUN_PROBE_INTERVAL};

/// Application protocol identifier.
pub const ALPN: &[u8] = b"goc/1";

/// Probe payload exchanged on dial.
const PROBE: &[u8] = b"ping";

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const DIAL_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DIAL_MAX_BACKOFF: Duration = Duration::from_secs(30);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);
const INTER_PROBE_DELAY: Duration = Duration::from_secs(1);
const SEND_TIMEOUT: Duration = Duration::from_secs(3);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default bound for consecutive dial failures before a peer's dialer
/// stops permanently.
pub const DEFAULT_MAX_DIAL_FAILURES: u32 = 20;

/// Packet-level surface the forwarder consumes.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Enqueue a whole packet for the outbound session.
    async fn send_packet(&self, packet: Bytes) -> NetworkResult<()>;

    /// Receive the next whole packet; blocks until one arrives or the
    /// transport stops.
    async fn recv_packet(&self) -> NetworkResult<Bytes>;
}

/// Transport manager configuration.
#[derive(Clone, Debug)]
pub struct QuicManagerConfig {
    /// UDP bind address.
    pub bind_addr: SocketAddr,
    /// STUN servers, tried in order.
    pub stun_servers: Vec<String>,
    /// Configured peer endpoints (`host:port`).
    pub peers: Vec<String>,
    /// Bounded channel capacity for packets.
    pub buffer_packets: usize,
    /// Maximum payload per frame.
    pub max_frame_bytes: usize,
    /// Consecutive dial failures before a peer dialer stops permanently.
    pub max_dial_failures: u32,
}

impl Default for QuicManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:45820".parse().expect("static addr"),
            stun_servers: Vec::new(),
            peers: Vec::new(),
            buffer_packets: 256,
            max_frame_bytes: MAX_FRAME_BYTES,
            max_dial_failures: DEFAULT_MAX_DIAL_FAILURES,
        }
    }
}

/// Lifecycle states; initialization errors surface from `start` instead
/// of an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Runtime {
    endpoint: Endpoint,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Listener + dialer over one UDP socket.
pub struct QuicManager {
    config: QuicManagerConfig,
    server_config: quinn::ServerConfig,
    client_config: quinn::ClientConfig,
    registry: Arc<PeerRegistry>,
    observation: Arc<EndpointObservation>,
    state: std::sync::RwLock<TransportState>,
    runtime: tokio::sync::RwLock<Option<Runtime>>,
}

impl QuicManager {
    /// Build TLS configuration from the identity and trust pool.
    ///
    /// Fails synchronously on any certificate problem; nothing is bound yet.
    pub fn new(
        config: QuicManagerConfig,
        identity: &Identity,
        trust: &TrustPool,
    ) -> NetworkResult<Self> {
        let chain = identity.cert_chain()?;
        let key = identity.private_key()?;
        let roots = trust.root_store();

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
            .build()
            .map_err(|e| NetworkError::Tls(format!("client verifier: {e}")))?;

        let mut server_crypto =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain.clone(), key.clone_key())
                .map_err(|e| NetworkError::Tls(format!("server config: {e}")))?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_crypto =
            rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_root_certificates(roots)
                .with_client_auth_cert(chain, key)
                .map_err(|e| NetworkError::Tls(format!("client config: {e}")))?;
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| NetworkError::Tls(format!("QUIC server config: {e}")))?,
        ));
        let transport = Arc::get_mut(&mut server_config.transport).expect("fresh config");
        transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| NetworkError::Tls(format!("QUIC client config: {e}")))?,
        ));
        let mut client_transport = quinn::TransportConfig::default();
        client_transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
        client_config.transport_config(Arc::new(client_transport));

        Ok(Self {
            config,
            server_config,
            client_config,
            registry: Arc::new(PeerRegistry::new()),
            observation: Arc::new(EndpointObservation::new()),
            state: std::sync::RwLock::new(TransportState::Stopped),
            runtime: tokio::sync::RwLock::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        *self.state.read().unwrap()
    }

    /// Bind the socket and launch the accept, dial, outbound and STUN
    /// loops. Idempotent once running.
    pub async fn start(&self) -> NetworkResult<()> {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                TransportState::Running | TransportState::Starting => return Ok(()),
                _ => *state = TransportState::Starting,
            }
        }

        match self.start_inner().await {
            Ok(()) => {
                *self.state.write().unwrap() = TransportState::Running;
                Ok(())
            }
            Err(e) => {
                *self.state.write().unwrap() = TransportState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> NetworkResult<()> {
        let mut endpoint = Endpoint::server(self.server_config.clone(), self.config.bind_addr)
            .map_err(|e| NetworkError::Bind(format!("{}: {e}", self.config.bind_addr)))?;
        endpoint.set_default_client_config(self.client_config.clone());
        info!(
            "transport listening on {}",
            endpoint.local_addr().map_err(NetworkError::Io)?
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.buffer_packets);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.buffer_packets);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(accept_loop(
            endpoint.clone(),
            self.registry.clone(),
            inbound_tx.clone(),
            cancel.clone(),
        )));

        for peer in self.config.peers.iter().filter(|p| !p.is_empty()) {
            tasks.push(tokio::spawn(dial_loop(
                endpoint.clone(),
                peer.clone(),
                self.registry.clone(),
                self.config.max_dial_failures,
                cancel.clone(),
            )));
        }

        let outbound_peer = self
            .config
            .peers
            .iter()
            .find(|p| !p.is_empty())
            .cloned();
        tasks.push(tokio::spawn(outbound_loop(
            endpoint.clone(),
            outbound_peer,
            outbound_rx,
            inbound_tx,
            self.registry.clone(),
            cancel.clone(),
        )));

        if !self.config.stun_servers.is_empty() {
            tasks.push(tokio::spawn(stun_loop(
                self.config.stun_servers.clone(),
                self.observation.clone(),
                cancel.clone(),
            )));
        }

        *self.runtime.write().await = Some(Runtime {
            endpoint,
            outbound_tx,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            cancel,
            tasks,
        });
        Ok(())
    }

    /// Stop all loops and release the socket. Idempotent.
    pub async fn stop(&self) -> NetworkResult<()> {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                TransportState::Stopped | TransportState::Stopping => return Ok(()),
                _ => *state = TransportState::Stopping,
            }
        }

        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.cancel.cancel();
            runtime.endpoint.close(0u32.into(), b"stopped");
            for task in runtime.tasks {
                let _ = task.await;
            }
        }

        *self.state.write().unwrap() = TransportState::Stopped;
        Ok(())
    }

    /// Snapshot of the peer table.
    pub fn snapshot_peers(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    /// Shared peer registry handle.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Last observed public endpoint, empty when unknown.
    pub fn public_endpoint(&self) -> String {
        self.observation.get()
    }

    /// Register the endpoint-change callback.
    pub fn set_endpoint_callback(&self, callback: EndpointCallback) {
        self.observation.set_callback(callback);
    }

    /// Observation slot, for collaborators that publish (tests, probes).
    pub fn observation(&self) -> Arc<EndpointObservation> {
        self.observation.clone()
    }

    /// Local UDP address once started.
    pub async fn bound_addr(&self) -> Option<SocketAddr> {
        let runtime = self.runtime.read().await;
        runtime.as_ref().and_then(|r| r.endpoint.local_addr().ok())
    }
}

#[async_trait]
impl PacketTransport for QuicManager {
    async fn send_packet(&self, packet: Bytes) -> NetworkResult<()> {
        if self.state() != TransportState::Running {
            return Err(NetworkError::NotStarted);
        }
        if packet.is_empty() || packet.len() > self.config.max_frame_bytes.min(MAX_FRAME_BYTES) {
            return Err(NetworkError::FrameTooLarge(packet.len()));
        }

        let tx = {
            let runtime = self.runtime.read().await;
            match runtime.as_ref() {
                Some(r) => r.outbound_tx.clone(),
                None => return Err(NetworkError::NotStarted),
            }
        };

        match tx.send_timeout(packet, SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(NetworkError::SendTimeout),
            Err(SendTimeoutError::Closed(_)) => Err(NetworkError::NotStarted),
        }
    }

    async fn recv_packet(&self) -> NetworkResult<Bytes> {
        let (rx, cancel) = {
            let runtime = self.runtime.read().await;
            match runtime.as_ref() {
                Some(r) => (r.inbound_rx.clone(), r.cancel.clone()),
                None => return Err(NetworkError::Stopped),
            }
        };

        let mut rx = rx.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(NetworkError::Stopped),
            packet = rx.recv() => packet.ok_or(NetworkError::Stopped),
        }
    }
}

/// Accept sessions and spawn one echo worker per session.
async fn accept_loop(
    endpoint: Endpoint,
    registry: Arc<PeerRegistry>,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = cancel.cancelled() => return,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return,
            },
        };

        let registry = registry.clone();
        let inbound = inbound.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match incoming.await {
                Ok(conn) => {
                    let remote = conn.remote_address();
                    if let Err(e) = serve_session(conn, registry, inbound, cancel).await {
                        debug!("session from {} ended: {}", remote, e);
                    }
                }
                Err(e) => debug!("inbound handshake failed: {}", e),
            }
        });
    }
}

/// Echo-and-update worker for one accepted session.
///
/// Every read refreshes the peer's liveness and is echoed back (the dialer
/// measures RTT off this echo). Complete frames are additionally delivered
/// to the local inbound channel.
async fn serve_session(
    conn: Connection,
    registry: Arc<PeerRegistry>,
    inbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> NetworkResult<()> {
    let remote = conn.remote_address().to_string();
    registry.touch(&remote);
    debug!("accepted session from {}", remote);

    let (mut send, mut recv) = conn
        .accept_bi()
        .await
        .map_err(|e| NetworkError::Connection(e.to_string()))?;

    let mut buf = vec![0u8; MAX_FRAME_BYTES + 2];
    let mut decoder = FrameDecoder::new();
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = recv.read(&mut buf) => match read {
                Ok(Some(n)) => n,
                Ok(None) => return Ok(()),
                Err(e) => return Err(NetworkError::Connection(e.to_string())),
            },
        };

        registry.touch(&remote);
        send.write_all(&buf[..n])
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;

        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            // inbound full: drop here, accounting happens at the forwarder
            if inbound.try_send(frame).is_err() {
                trace!("inbound channel full, dropping frame from {}", remote);
            }
        }
    }
}

/// RTT probe loop for one configured peer.
///
/// Backoff state is kept per peer so one unreachable endpoint cannot
/// poison probing of the others. After `max_failures` consecutive
/// failures the loop stops permanently and flags the peer.
async fn dial_loop(
    endpoint: Endpoint,
    peer: String,
    registry: Arc<PeerRegistry>,
    max_failures: u32,
    cancel: CancellationToken,
) {
    let mut backoff = DIAL_INITIAL_BACKOFF;
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let started = Instant::now();
        match probe_peer(&endpoint, &peer).await {
            Ok(()) => {
                let rtt = started.elapsed().as_millis() as u64;
                registry.record_rtt(&peer, rtt);
                trace!("probe {} rtt={}ms", peer, rtt);
                failures = 0;
                backoff = DIAL_INITIAL_BACKOFF;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(INTER_PROBE_DELAY) => {}
                }
            }
            Err(e) => {
                failures += 1;
                debug!("dial {} failed ({}/{}): {}", peer, failures, max_failures, e);
                if failures >= max_failures {
                    warn!(
                        "dialer for {} stopped after {} consecutive failures",
                        peer, failures
                    );
                    registry.mark_dial_stopped(&peer);
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(DIAL_MAX_BACKOFF);
            }
        }
    }
}

/// One dial-probe-close cycle against a peer.
async fn probe_peer(endpoint: &Endpoint, peer: &str) -> NetworkResult<()> {
    let addr = resolve_peer(peer).await?;
    let connecting = endpoint
        .connect(addr, TLS_SERVER_NAME)
        .map_err(|e| NetworkError::Connection(e.to_string()))?;
    let conn = timeout(DIAL_TIMEOUT, connecting)
        .await
        .map_err(|_| NetworkError::Connection("dial timed out".into()))?
        .map_err(|e| NetworkError::Connection(e.to_string()))?;

    let result = async {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;
        send.write_all(PROBE)
            .await
            .map_err(|e| NetworkError::Connection(e.to_string()))?;
        let mut echo = [0u8; 4];
        timeout(DIAL_TIMEOUT, recv.read_exact(&mut echo))
            .await
            .map_err(|_| NetworkError::Connection("probe echo timed out".into()))?
            .map_err(|e| NetworkError::Connection(e.to_string()))?;
        Ok(())
    }
    .await;

    conn.close(0u32.into(), b"done");
    result
}

/// Maintain at most one outbound data session, to the first configured
/// peer, reconnecting with a capped doubling backoff.
async fn outbound_loop(
    endpoint: Endpoint,
    peer: Option<String>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
    registry: Arc<PeerRegistry>,
    cancel: CancellationToken,
) {
    let Some(peer) = peer else {
        // No peers configured: hold the channel open until shutdown so
        // send_packet sees timeouts rather than a closed channel.
        cancel.cancelled().await;
        return;
    };

    let mut backoff = DIAL_INITIAL_BACKOFF;
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match establish(&endpoint, &peer).await {
            Ok((conn, send, recv)) => {
                registry.touch(&peer);
                backoff = DIAL_INITIAL_BACKOFF;
                debug!("outbound session to {} established", peer);
                if let Err(e) =
                    run_data_session(send, recv, &mut outbound_rx, &inbound, &cancel).await
                {
                    debug!("outbound session to {} ended: {}", peer, e);
                }
                conn.close(0u32.into(), b"bye");
                if cancel.is_cancelled() {
                    return;
                }
            }
            Err(e) => debug!("outbound dial {} failed: {}", peer, e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
    }
}

async fn establish(
    endpoint: &Endpoint,
    peer: &str,
) -> NetworkResult<(Connection, SendStream, RecvStream)> {
    let addr = resolve_peer(peer).await?;
    let connecting = endpoint
        .connect(addr, TLS_SERVER_NAME)
        .map_err(|e| NetworkError::Connection(e.to_string()))?;
    let conn = timeout(DIAL_TIMEOUT, connecting)
        .await
        .map_err(|_| NetworkError::Connection("dial timed out".into()))?
        .map_err(|e| NetworkError::Connection(e.to_string()))?;
    let (send, recv) = conn
        .open_bi()
        .await
        .map_err(|e| NetworkError::Connection(e.to_string()))?;
    Ok((conn, send, recv))
}

/// Pump the established data session in both directions.
async fn run_data_session(
    mut send: SendStream,
    mut recv: RecvStream,
    outbound_rx: &mut mpsc::Receiver<Bytes>,
    inbound: &mpsc::Sender<Bytes>,
    cancel: &CancellationToken,
) -> NetworkResult<()> {
    let mut buf = vec![0u8; MAX_FRAME_BYTES + 2];
    let mut decoder = FrameDecoder::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            packet = outbound_rx.recv() => {
                let Some(packet) = packet else { return Ok(()) };
                let frame = encode_frame(&packet)?;
                send.write_all(&frame)
                    .await
                    .map_err(|e| NetworkError::Connection(e.to_string()))?;
            }
            read = recv.read(&mut buf) => {
                match read {
                    Ok(Some(n)) => {
                        decoder.push(&buf[..n]);
                        while let Some(frame) = decoder.next_frame() {
                            if inbound.try_send(frame).is_err() {
                                trace!("inbound channel full, dropping frame");
                            }
                        }
                    }
                    Ok(None) => return Err(NetworkError::Connection("stream closed".into())),
                    Err(e) => return Err(NetworkError::Connection(e.to_string())),
                }
            }
        }
    }
}

/// Periodic reflexive-address probe: once at start, then every tick.
/// A fully failed round leaves the current observation untouched.
async fn stun_loop(
    servers: Vec<String>,
    observation: Arc<EndpointObservation>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(STUN_PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = probe_first(&servers) => match result {
                        Ok(endpoint) => observation.set(&endpoint),
                        Err(e) => trace!("STUN round failed: {}", e),
                    }
                }
            }
        }
    }
}

async fn resolve_peer(peer: &str) -> NetworkResult<SocketAddr> {
    if let Ok(addr) = peer.parse() {
        return Ok(addr);
    }
    tokio::net::lookup_host(peer)
        .await
        .map_err(|e| NetworkError::Config(format!("cannot resolve '{peer}': {e}")))?
        .next()
        .ok_or_else(|| NetworkError::Config(format!("cannot resolve '{peer}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use goconnect_identity::{build_trust_pool, IdentityStore};

    fn local_config(peers: Vec<String>) -> QuicManagerConfig {
        QuicManagerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            peers,
            ..Default::default()
        }
    }

    fn manager_with_secrets(
        dir: &std::path::Path,
        config: QuicManagerConfig,
    ) -> QuicManager {
        let identity = IdentityStore::new(dir).load_or_create().unwrap();
        let trust = build_trust_pool(&identity, &[], dir).unwrap();
        QuicManager::new(config, &identity, &trust).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_between_two_managers() {
        let secrets = tempfile::tempdir().unwrap();

        let server = manager_with_secrets(secrets.path(), local_config(vec![]));
        server.start().await.unwrap();
        let server_addr = server.bound_addr().await.unwrap();

        let client = manager_with_secrets(
            secrets.path(),
            local_config(vec![server_addr.to_string()]),
        );
        client.start().await.unwrap();

        client.send_packet(Bytes::from_static(b"hello")).await.unwrap();

        // The server delivers the decoded frame into its own inbound path...
        let at_server = timeout(Duration::from_secs(5), server.recv_packet())
            .await
            .expect("server should receive within deadline")
            .unwrap();
        assert_eq!(at_server.as_ref(), b"hello");

        // ...and echoes the raw bytes back to the dialer.
        let echoed = timeout(Duration::from_secs(5), client.recv_packet())
            .await
            .expect("client should see the echo")
            .unwrap();
        assert_eq!(echoed.as_ref(), b"hello");

        // The probe loop measures RTT against the server eventually.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let direct = client.snapshot_peers().into_iter().any(|p| p.p2p);
            if direct {
                break;
            }
            assert!(Instant::now() < deadline, "no RTT recorded in time");
            sleep(Duration::from_millis(50)).await;
        }

        client.stop().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let secrets = tempfile::tempdir().unwrap();
        let manager = manager_with_secrets(secrets.path(), local_config(vec![]));

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(manager.state(), TransportState::Running);

        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn test_send_before_start_is_not_started() {
        let secrets = tempfile::tempdir().unwrap();
        let manager = manager_with_secrets(secrets.path(), local_config(vec![]));

        let err = manager.send_packet(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, NetworkError::NotStarted));
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let secrets = tempfile::tempdir().unwrap();
        let manager = manager_with_secrets(secrets.path(), local_config(vec![]));
        manager.start().await.unwrap();

        let big = Bytes::from(vec![0u8; MAX_FRAME_BYTES + 1]);
        let err = manager.send_packet(big).await.unwrap_err();
        assert!(matches!(err, NetworkError::FrameTooLarge(_)));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_returns_stopped_on_stop() {
        let secrets = tempfile::tempdir().unwrap();
        let manager = Arc::new(manager_with_secrets(secrets.path(), local_config(vec![])));
        manager.start().await.unwrap();

        let m = manager.clone();
        let pending = tokio::spawn(async move { m.recv_packet().await });

        sleep(Duration::from_millis(100)).await;
        manager.stop().await.unwrap();

        let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(NetworkError::Stopped)));
    }

    #[tokio::test]
    async fn test_dialer_stops_permanently_after_max_failures() {
        let secrets = tempfile::tempdir().unwrap();
        // A syntactically invalid peer fails resolution instantly, so the
        // failure cadence is driven by backoff alone.
        let mut config = local_config(vec![":1".to_string()]);
        config.max_dial_failures = 3;

        let manager = manager_with_secrets(secrets.path(), config);
        manager.start().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let stopped = manager.snapshot_peers().iter().any(|p| p.dial_stopped);
            if stopped {
                break;
            }
            assert!(Instant::now() < deadline, "dialer never gave up");
            sleep(Duration::from_millis(100)).await;
        }

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disjoint_trust_pools_reject_each_other() {
        let secrets_a = tempfile::tempdir().unwrap();
        let secrets_b = tempfile::tempdir().unwrap();

        let b = manager_with_secrets(secrets_b.path(), local_config(vec![]));
        b.start().await.unwrap();
        let b_addr = b.bound_addr().await.unwrap();

        let a = manager_with_secrets(secrets_a.path(), local_config(vec![b_addr.to_string()]));
        a.start().await.unwrap();

        // Let a few dial attempts fail on the handshake.
        sleep(Duration::from_secs(5)).await;

        assert!(
            !a.snapshot_peers().iter().any(|p| p.p2p),
            "untrusted peer must never be marked directly reached"
        );
        assert!(
            b.snapshot_peers().is_empty(),
            "failed handshakes must not register peers"
        );

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }
}
