//! STUN reflexive-address probing
//!
//! Implements the classic RFC 5389 binding request used to learn the
//! agent's public `ip:port` behind NAT. IPv4 and XOR-MAPPED-ADDRESS only;
//! anything else in the response is skipped.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// XOR-MAPPED-ADDRESS attribute
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

/// Per-server query timeout.
pub const STUN_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between probe rounds.
pub const STUN_PROBE_INTERVAL: Duration = Duration::from_secs(45);

/// Build a 20-byte binding request, returning it with its transaction id.
pub fn build_binding_request() -> NetworkResult<([u8; 20], [u8; 12])> {
    let mut txid = [0u8; 12];
    getrandom::getrandom(&mut txid).map_err(|e| NetworkError::Protocol(e.to_string()))?;

    let mut packet = [0u8; 20];
    packet[0..2].copy_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    // message length stays zero: no attributes
    packet[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet[8..20].copy_from_slice(&txid);
    Ok((packet, txid))
}

/// Parse a binding response and extract the reflexive `ip:port`.
///
/// Rejects anything that is not a success response for our transaction.
pub fn parse_binding_response(resp: &[u8], expected_txid: &[u8; 12]) -> NetworkResult<String> {
    if resp.len() < 20 {
        return Err(NetworkError::Protocol("short STUN response".into()));
    }

    let msg_type = u16::from_be_bytes([resp[0], resp[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(NetworkError::Protocol(format!(
            "unexpected STUN message type 0x{msg_type:04x}"
        )));
    }
    if &resp[8..20] != expected_txid {
        return Err(NetworkError::Protocol("transaction id mismatch".into()));
    }

    let msg_len = u16::from_be_bytes([resp[2], resp[3]]) as usize;
    let attrs = &resp[20..resp.len().min(20 + msg_len)];

    let mut offset = 0usize;
    while offset + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[offset], attrs[offset + 1]]);
        let attr_len = u16::from_be_bytes([attrs[offset + 2], attrs[offset + 3]]) as usize;
        offset += 4;
        if offset + attr_len > attrs.len() {
            break;
        }
        let value = &attrs[offset..offset + attr_len];
        // attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;

        if attr_type != ATTR_XOR_MAPPED_ADDRESS || value.len() < 8 {
            continue;
        }
        if value[1] != 0x01 {
            // IPv4 family only
            continue;
        }

        let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
        let raw_ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
        let ip = Ipv4Addr::from(raw_ip);
        return Ok(format!("{ip}:{port}"));
    }

    Err(NetworkError::Protocol("no XOR-MAPPED-ADDRESS".into()))
}

/// Query a single server for our public endpoint.
///
/// Uses a transient socket so probing never disturbs the transport's own
/// UDP binding.
pub async fn query_public_endpoint(server: &str) -> NetworkResult<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    timeout(STUN_QUERY_TIMEOUT, socket.connect(server))
        .await
        .map_err(|_| NetworkError::StunTimeout)??;

    let (request, txid) = build_binding_request()?;
    socket.send(&request).await?;
    trace!("sent STUN binding request to {}", server);

    let mut buf = [0u8; 512];
    let n = timeout(STUN_QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| NetworkError::StunTimeout)??;

    parse_binding_response(&buf[..n], &txid)
}

/// Try servers in order; first success wins.
pub async fn probe_first(servers: &[String]) -> NetworkResult<String> {
    let mut first_err = None;
    for server in servers {
        if server.is_empty() {
            continue;
        }
        match query_public_endpoint(server).await {
            Ok(endpoint) => {
                debug!("STUN {} reports public endpoint {}", server, endpoint);
                return Ok(endpoint);
            }
            Err(e) => {
                debug!("STUN {} failed: {}", server, e);
                first_err.get_or_insert(e);
            }
        }
    }
    Err(first_err.unwrap_or_else(|| NetworkError::Config("no STUN servers configured".into())))
}

/// Build a success response for tests and mock servers.
#[cfg(test)]
pub(crate) fn build_binding_response(txid: &[u8; 12], ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut resp = Vec::with_capacity(32);
    resp.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
    resp.extend_from_slice(&12u16.to_be_bytes());
    resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    resp.extend_from_slice(txid);

    resp.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    resp.extend_from_slice(&8u16.to_be_bytes());
    resp.push(0x00);
    resp.push(0x01);
    let xport = port ^ (MAGIC_COOKIE >> 16) as u16;
    resp.extend_from_slice(&xport.to_be_bytes());
    let xip = u32::from(ip) ^ MAGIC_COOKIE;
    resp.extend_from_slice(&xip.to_be_bytes());
    resp
}
