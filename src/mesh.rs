//! Contract between this server and the embedding mesh agent.
//!
//! Everything identity-shaped comes through [`MeshAgent`]: the current
//! netmap (and with it the SSH policy), ownership of source addresses, the
//! node's SSH host keys, authenticated HTTP to the control plane, and the
//! node's persistent state directory. The server itself never talks to the
//! control plane except through this trait.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use russh_keys::key::KeyPair;

use crate::policy::SshPolicy;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A peer node in the mesh, as resolved from a source address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshNode {
    /// Numeric node id, shared with the control plane.
    pub id: i64,
    /// Stable (opaque, string-form) node id.
    pub stable_id: String,
    /// Hostname as advertised in the netmap, informational only.
    pub name: String,
}

/// The mesh user a node belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    /// Login identifier, e.g. `alice@example.com`.
    pub login_name: String,
    /// Human-readable name.
    pub display_name: String,
}

/// The slice of the netmap this server consumes.
#[derive(Debug, Clone, Default)]
pub struct NetMap {
    /// SSH access policy pushed by the control plane, if any.
    pub ssh_policy: Option<SshPolicy>,
    /// Numeric id of the local node.
    pub self_node_id: i64,
}

/// Response from an authenticated control-plane request.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Agent trait
// ---------------------------------------------------------------------------

/// Services provided by the embedding mesh agent.
#[async_trait]
pub trait MeshAgent: Send + Sync + 'static {
    /// Current netmap, or `None` before the first control-plane sync.
    fn net_map(&self) -> Option<NetMap>;

    /// Resolve the owner of a mesh source address.
    fn who_is(&self, addr: SocketAddr) -> Option<(MeshNode, UserProfile)>;

    /// SSH host keys for this node.
    fn host_keys(&self) -> Result<Vec<KeyPair>>;

    /// Issue an authenticated GET against the control plane.
    async fn control_plane_get(&self, url: &str) -> Result<ControlResponse>;

    /// Persistent state directory of the node, used for session transcripts.
    fn var_root(&self) -> Option<PathBuf>;
}

// ---------------------------------------------------------------------------
// Address classification
// ---------------------------------------------------------------------------

/// Mesh-internal IPv4 range (carrier-grade NAT block assigned to the overlay).
const MESH_V4_NET: (Ipv4Addr, u8) = (Ipv4Addr::new(100, 64, 0, 0), 10);

/// Mesh-internal IPv6 ULA prefix.
const MESH_V6_PREFIX: [u8; 6] = [0xfd, 0x7a, 0x11, 0x5c, 0xa1, 0xe0];

/// Reports whether `ip` is a mesh-internal address. Connections whose source
/// or destination is outside the overlay are rejected before any policy
/// consultation.
pub fn is_mesh_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let (net, bits) = MESH_V4_NET;
            let mask = u32::MAX << (32 - bits);
            (u32::from(v4) & mask) == (u32::from(net) & mask)
        }
        IpAddr::V6(v6) => v6.octets()[..6] == MESH_V6_PREFIX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgnat_range_is_mesh() {
        assert!(is_mesh_ip("100.64.0.1".parse().unwrap()));
        assert!(is_mesh_ip("100.101.102.103".parse().unwrap()));
        assert!(is_mesh_ip("100.127.255.254".parse().unwrap()));
    }

    #[test]
    fn public_and_private_v4_are_not_mesh() {
        assert!(!is_mesh_ip("100.63.255.255".parse().unwrap()));
        assert!(!is_mesh_ip("100.128.0.0".parse().unwrap()));
        assert!(!is_mesh_ip("10.0.0.1".parse().unwrap()));
        assert!(!is_mesh_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn mesh_ula_prefix() {
        assert!(is_mesh_ip("fd7a:115c:a1e0::1".parse().unwrap()));
        assert!(!is_mesh_ip("fd00::1".parse().unwrap()));
        assert!(!is_mesh_ip("::1".parse().unwrap()));
    }
}
