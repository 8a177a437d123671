//! Effective policy computation
//!
//! Per-network settings and per-member preferences merge into the policy
//! the agent enforces locally. The merge is pure and deterministic: a
//! capability is on when the network allows it (directly or via
//! `allow_all`) and the member has not opted out. Encryption is the
//! exception: it is taken verbatim from the network settings.
//!
//! The controller computes and serves these; the agent only consumes them.

use serde::{Deserialize, Serialize};

/// Per-network capability switches set by the network owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub allow_all: bool,
    pub allow_file_share: bool,
    pub allow_service_discovery: bool,
    pub allow_peer_ping: bool,
    pub allow_quic_direct: bool,
    pub allow_relay_fallback: bool,
    pub allow_broadcast: bool,
    pub allow_ipv6: bool,
    pub require_encryption: bool,
}

/// Per-member opt-ins within a network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MembershipPreferences {
    pub local_share_enabled: bool,
    pub advertise_services: bool,
    pub allow_incoming_p2p: bool,
}

/// The policy the agent enforces locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub file_share: bool,
    pub service_discovery: bool,
    pub peer_ping: bool,
    pub quic_direct: bool,
    pub relay_fallback: bool,
    pub broadcast: bool,
    pub ipv6: bool,
    pub encryption_required: bool,
}

impl EffectivePolicy {
    /// Merge network settings with member preferences.
    pub fn compute(ns: &NetworkSettings, mp: &MembershipPreferences) -> Self {
        let network_on = |flag: bool| ns.allow_all || flag;
        Self {
            file_share: network_on(ns.allow_file_share) && mp.local_share_enabled,
            service_discovery: network_on(ns.allow_service_discovery) && mp.advertise_services,
            peer_ping: network_on(ns.allow_peer_ping),
            quic_direct: network_on(ns.allow_quic_direct) && mp.allow_incoming_p2p,
            relay_fallback: network_on(ns.allow_relay_fallback),
            broadcast: network_on(ns.allow_broadcast),
            ipv6: network_on(ns.allow_ipv6),
            encryption_required: ns.require_encryption,
        }
    }
}

/// Result of the controller join handshake, consumed once per joined
/// network at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinResponse {
    pub node_id: String,
    pub overlay_cidr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_overrides_network_flags() {
        let ns = NetworkSettings {
            allow_all: true,
            ..Default::default()
        };
        let mp = MembershipPreferences {
            local_share_enabled: true,
            advertise_services: true,
            allow_incoming_p2p: true,
        };

        let policy = EffectivePolicy::compute(&ns, &mp);
        assert!(policy.file_share);
        assert!(policy.service_discovery);
        assert!(policy.peer_ping);
        assert!(policy.quic_direct);
        assert!(policy.relay_fallback);
        assert!(policy.broadcast);
        assert!(policy.ipv6);
    }

    #[test]
    fn test_member_opt_out_wins() {
        let ns = NetworkSettings {
            allow_all: true,
            ..Default::default()
        };
        let mp = MembershipPreferences::default();

        let policy = EffectivePolicy::compute(&ns, &mp);
        assert!(!policy.file_share, "member did not enable sharing");
        assert!(!policy.service_discovery);
        assert!(!policy.quic_direct);
        // flags without a member preference stay network-controlled
        assert!(policy.peer_ping);
        assert!(policy.broadcast);
    }

    #[test]
    fn test_network_flag_gates_member_preference() {
        let ns = NetworkSettings::default();
        let mp = MembershipPreferences {
            local_share_enabled: true,
            advertise_services: true,
            allow_incoming_p2p: true,
        };

        let policy = EffectivePolicy::compute(&ns, &mp);
        assert_eq!(policy, EffectivePolicy::default());
    }

    #[test]
    fn test_encryption_taken_verbatim() {
        let ns = NetworkSettings {
            require_encryption: true,
            ..Default::default()
        };
        let policy = EffectivePolicy::compute(&ns, &MembershipPreferences::default());
        assert!(policy.encryption_required);

        let ns = NetworkSettings {
            allow_all: true,
            require_encryption: false,
            ..Default::default()
        };
        let policy = EffectivePolicy::compute(&ns, &MembershipPreferences::default());
        assert!(!policy.encryption_required, "allow_all must not force encryption");
    }
}
