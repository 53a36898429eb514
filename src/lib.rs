//! Identity-gated SSH server for embedding in a mesh-VPN node.
//!
//! The embedding mesh agent hands this crate accepted TCP connections (or
//! asks it to listen on an address) and supplies, through the [`MeshAgent`]
//! trait, everything that is identity: who owns a source address, the
//! current SSH access policy, the node's host keys, and an authenticated
//! HTTP channel to the control plane.
//!
//! Authorization never looks at SSH credentials alone. Every connection is
//! keyed by its *mesh identity* — the verified owner of the overlay source
//! address — and evaluated against an ordered rule policy that yields accept,
//! reject, or a delegation URL to follow on the control plane. Accepted
//! sessions run a child process under the resolved local user, optionally on
//! a pty, with agent forwarding and asciinema-format transcript recording.

pub mod delegate;
pub mod mesh;
pub mod policy;
pub mod server;
pub mod session;
pub mod settings;

pub use mesh::{ControlResponse, MeshAgent, MeshNode, NetMap, UserProfile};
pub use policy::{SshAction, SshPolicy, SshPrincipal, SshRule};
pub use server::SshServer;
pub use settings::Settings;
