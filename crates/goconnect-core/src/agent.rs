//! Agent lifecycle
//!
//! Wires the pieces into a running tunnel: identity, trust pool, virtual
//! interface, transport manager and forwarder come up in that order and
//! tear down in reverse. Configuration and initialization problems fail
//! `start` synchronously; once running the agent only logs and retries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use goconnect_identity::{build_trust_pool, IdentityStore};
use goconnect_network::tun::{Device, LOOPBACK_TEST_TIMEOUT};
use goconnect_network::{EndpointCallback, Peer, QuicManager, QuicManagerConfig};

use crate::config::Settings;
use crate::error::CoreResult;
use crate::forwarder::{Forwarder, ForwarderConfig, ForwarderStats};

/// Delay between bringing the interface up and the loopback self-test.
const INTERFACE_SETTLE: Duration = Duration::from_millis(100);

/// Agent lifecycle states.
///
/// `Degraded` means the tunnel runs but the interface self-test failed;
/// the operator can see why via `tun_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

/// The long-lived agent process core.
pub struct Agent {
    settings: Settings,
    device: Arc<dyn Device>,
    state: std::sync::RwLock<AgentState>,
    tun_error: std::sync::RwLock<Option<String>>,
    transport: std::sync::RwLock<Option<Arc<QuicManager>>>,
    forwarder: std::sync::RwLock<Option<Arc<Forwarder>>>,
    root: std::sync::RwLock<Option<CancellationToken>>,
    pending_callback: std::sync::Mutex<Option<EndpointCallback>>,
}

impl Agent {
    /// Create an agent around a virtual interface.
    pub fn new(settings: Settings, device: Arc<dyn Device>) -> Self {
        Self {
            settings,
            device,
            state: std::sync::RwLock::new(AgentState::Stopped),
            tun_error: std::sync::RwLock::new(None),
            transport: std::sync::RwLock::new(None),
            forwarder: std::sync::RwLock::new(None),
            root: std::sync::RwLock::new(None),
            pending_callback: std::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        *self.state.read().unwrap()
    }

    /// Why the interface self-test failed, if it did.
    pub fn tun_error(&self) -> Option<String> {
        self.tun_error.read().unwrap().clone()
    }

    /// Bring the tunnel up. Idempotent once running.
    pub async fn start(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                AgentState::Running | AgentState::Degraded | AgentState::Starting => {
                    return Ok(())
                }
                _ => *state = AgentState::Starting,
            }
        }

        match self.start_inner().await {
            Ok(degraded) => {
                *self.state.write().unwrap() = if degraded {
                    AgentState::Degraded
                } else {
                    AgentState::Running
                };
                info!("agent started");
                Ok(())
            }
            Err(e) => {
                // Best-effort teardown of whatever came up.
                let manager = self.transport.write().unwrap().take();
                if let Some(manager) = manager {
                    let _ = manager.stop().await;
                }
                let _ = self.device.down().await;
                *self.state.write().unwrap() = AgentState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> CoreResult<bool> {
        self.settings.validate()?;

        let store = IdentityStore::new(&self.settings.secrets_dir);
        let identity = store.load_or_create()?;
        let trust = build_trust_pool(
            &identity,
            &self.settings.trusted_peer_certs,
            store.secrets_dir(),
        )?;

        self.device.up().await?;
        let joined = self.settings.networks.iter().find(|n| n.joined);
        let mut degraded = false;
        if let Some(network) = joined {
            if !network.address.is_empty() {
                self.device.set_address(&network.address).await?;
            }
            // Let the kernel finish registering the interface first.
            sleep(INTERFACE_SETTLE).await;
            if let Err(e) = self.device.loopback_test(LOOPBACK_TEST_TIMEOUT).await {
                warn!("interface self-test failed: {}", e);
                *self.tun_error.write().unwrap() = Some(e.to_string());
                degraded = true;
            }
        }

        let manager = Arc::new(QuicManager::new(
            QuicManagerConfig {
                bind_addr: SocketAddr::from(([0, 0, 0, 0], self.settings.udp_port)),
                stun_servers: self.settings.stun_servers.clone(),
                peers: self.settings.peers.clone(),
                buffer_packets: self.settings.core.buffer_packets,
                max_frame_bytes: self.settings.core.max_frame_bytes,
                max_dial_failures: self.settings.core.max_dial_failures,
            },
            &identity,
            &trust,
        )?);
        *self.transport.write().unwrap() = Some(manager.clone());
        manager.start().await?;

        if let Some(callback) = self.pending_callback.lock().unwrap().take() {
            manager.set_endpoint_callback(callback);
        }

        let root = CancellationToken::new();
        let forwarder = Arc::new(Forwarder::new(
            self.device.clone(),
            manager,
            ForwarderConfig {
                buffer_packets: self.settings.core.buffer_packets,
                max_frame_bytes: self.settings.core.max_frame_bytes,
                shutdown_timeout: self.settings.core.shutdown_timeout(),
            },
            root.child_token(),
        ));
        forwarder.start();

        *self.forwarder.write().unwrap() = Some(forwarder);
        *self.root.write().unwrap() = Some(root);
        Ok(degraded)
    }

    /// Tear the tunnel down in reverse order: forwarder, transport,
    /// interface. Idempotent.
    pub async fn stop(&self) -> CoreResult<()> {
        {
            let mut state = self.state.write().unwrap();
            match *state {
                AgentState::Stopped | AgentState::Stopping => return Ok(()),
                _ => *state = AgentState::Stopping,
            }
        }

        let forwarder = self.forwarder.write().unwrap().take();
        let transport = self.transport.write().unwrap().take();
        let root = self.root.write().unwrap().take();

        let mut result = Ok(());
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.stop().await {
                warn!("forwarder stop: {}", e);
                result = Err(e);
            }
        }
        if let Some(transport) = transport {
            if let Err(e) = transport.stop().await {
                warn!("transport stop: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        if let Some(root) = root {
            root.cancel();
        }
        let _ = self.device.down().await;

        *self.tun_error.write().unwrap() = None;
        *self.state.write().unwrap() = AgentState::Stopped;
        info!("agent stopped");
        result
    }

    /// Snapshot of the transport's peer table.
    pub fn snapshot_peers(&self) -> Vec<Peer> {
        match self.transport.read().unwrap().as_ref() {
            Some(manager) => manager.snapshot_peers(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the forwarder counters.
    pub fn forwarder_stats(&self) -> ForwarderStats {
        match self.forwarder.read().unwrap().as_ref() {
            Some(forwarder) => forwarder.stats(),
            None => ForwarderStats::default(),
        }
    }

    /// Last observed public endpoint, empty when unknown.
    pub fn public_endpoint(&self) -> String {
        match self.transport.read().unwrap().as_ref() {
            Some(manager) => manager.public_endpoint(),
            None => String::new(),
        }
    }

    /// Register the public-endpoint change callback. Safe to call before
    /// `start`; the registration is applied when the transport comes up.
    pub fn set_endpoint_callback(&self, callback: EndpointCallback) {
        let manager = self.transport.read().unwrap().clone();
        match manager {
            Some(manager) => manager.set_endpoint_callback(callback),
            None => *self.pending_callback.lock().unwrap() = Some(callback),
        }
    }

    /// Local transport address once started (useful when bound to port 0).
    pub async fn transport_addr(&self) -> Option<SocketAddr> {
        let manager = self.transport.read().unwrap().clone();
        match manager {
            Some(manager) => manager.bound_addr().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDevice;
    use tokio::time::timeout;

    fn local_settings(secrets: &std::path::Path, peers: Vec<String>) -> Settings {
        Settings {
            udp_port: 0,
            secrets_dir: secrets.to_path_buf(),
            stun_servers: Vec::new(),
            peers,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_local_loopback_tunnel() {
        let secrets = tempfile::tempdir().unwrap();

        let device_b = TestDevice::new(64);
        let agent_b = Agent::new(local_settings(secrets.path(), vec![]), device_b.clone());
        agent_b.start().await.unwrap();
        let b_port = agent_b.transport_addr().await.unwrap().port();

        let device_a = TestDevice::new(64);
        let agent_a = Agent::new(
            local_settings(secrets.path(), vec![format!("127.0.0.1:{b_port}")]),
            device_a.clone(),
        );
        agent_a.start().await.unwrap();

        // Let the outbound data session establish before timing the path.
        sleep(Duration::from_millis(500)).await;

        device_a.feed_read(&[0x01, 0x02, 0x03]).await;
        let delivered = timeout(Duration::from_secs(2), device_b.next_written())
            .await
            .expect("tunnel delivery exceeded 2s");
        assert_eq!(delivered.as_ref(), &[0x01, 0x02, 0x03]);

        assert!(agent_a.forwarder_stats().forwarded_t2x >= 1);
        assert!(agent_b.forwarder_stats().forwarded_x2t >= 1);

        agent_a.stop().await.unwrap();
        agent_b.stop().await.unwrap();
        assert_eq!(agent_a.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_on_invalid_trust_entry() {
        let secrets = tempfile::tempdir().unwrap();
        let mut settings = local_settings(secrets.path(), vec![]);
        settings.trusted_peer_certs = vec!["missing-peer.pem".to_string()];

        let agent = Agent::new(settings, TestDevice::new(4));
        let err = agent.start().await.unwrap_err();
        assert!(err.to_string().contains("missing-peer.pem"));
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_on_invalid_config() {
        let secrets = tempfile::tempdir().unwrap();
        let mut settings = local_settings(secrets.path(), vec![]);
        settings.mtu = 9000;

        let agent = Agent::new(settings, TestDevice::new(4));
        assert!(agent.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop_idempotent() {
        let secrets = tempfile::tempdir().unwrap();
        let device = TestDevice::new(4);
        let agent = Agent::new(local_settings(secrets.path(), vec![]), device.clone());

        agent.start().await.unwrap();
        agent.start().await.unwrap();
        assert_eq!(agent.state(), AgentState::Running);

        agent.stop().await.unwrap();
        agent.stop().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
        assert!(!device.is_up());
    }
}
