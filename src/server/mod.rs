//! Server front door.
//!
//! [`SshServer`] owns the pieces every connection shares — the mesh agent
//! handle, the public-key directory, the session registry, the clock — and
//! exposes the two policy callbacks the SSH transport needs during
//! authentication, plus connection intake and policy-change revalidation.

pub mod conn;
pub mod registry;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use russh::MethodSet;
use russh_keys::key::PublicKey;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::mesh::{is_mesh_ip, MeshAgent};
use crate::policy::keys::{Clock, KeyDirectory};
use crate::policy::{matcher, ConnInfo, SshAction, SshPolicy};
use crate::session::context::Termination;
use crate::settings::Settings;
use conn::ConnHandler;
use registry::{SessionRecord, SessionRegistry};

/// The identity-gated SSH server. One per node; shared behind an `Arc`.
pub struct SshServer {
    agent: Arc<dyn MeshAgent>,
    settings: Settings,
    keys: KeyDirectory,
    registry: SessionRegistry,
    clock: Clock,
}

/// A successful policy evaluation.
pub(crate) struct Evaluation {
    pub action: SshAction,
    pub local_user: String,
    pub conn_info: ConnInfo,
}

/// Why a connection was refused before or during evaluation.
pub(crate) enum EvalReject {
    /// No policy is configured; nothing can be allowed.
    NoPolicy,
    /// Source or destination is not a mesh address.
    NotMeshAddr,
    /// The mesh agent cannot attribute the source address.
    UnknownIdentity,
    /// Policy consulted, no rule matched.
    Denied { conn_info: ConnInfo },
}

impl fmt::Display for EvalReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalReject::NoPolicy => write!(f, "no SSH policy"),
            EvalReject::NotMeshAddr => write!(f, "connection from a non-mesh address"),
            EvalReject::UnknownIdentity => write!(f, "unknown mesh identity"),
            EvalReject::Denied { conn_info } => write!(
                f,
                "access denied for {:?} from {}",
                conn_info.user_profile.login_name,
                conn_info.src.ip()
            ),
        }
    }
}

impl SshServer {
    pub fn new(agent: Arc<dyn MeshAgent>, settings: Settings) -> Arc<Self> {
        Self::with_clock(agent, settings, Arc::new(Utc::now), reqwest::Client::new())
    }

    /// Constructor with injectable time source and HTTP client, used by
    /// tests to pin evaluation time and key fetching.
    pub fn with_clock(
        agent: Arc<dyn MeshAgent>,
        settings: Settings,
        clock: Clock,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent,
            settings,
            keys: KeyDirectory::new(http, Arc::clone(&clock)),
            registry: SessionRegistry::new(),
            clock,
        })
    }

    pub(crate) fn agent(&self) -> &dyn MeshAgent {
        self.agent.as_ref()
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    // -----------------------------------------------------------------------
    // Policy access & evaluation
    // -----------------------------------------------------------------------

    /// The active SSH policy: the netmap's, unless ignored, with the debug
    /// policy file as fallback. No netmap means no policy.
    pub fn ssh_policy(&self) -> Option<SshPolicy> {
        let nm = self.agent.net_map()?;
        if !self.settings.ignore_mesh_policy {
            if let Some(policy) = nm.ssh_policy {
                return Some(policy);
            }
        }
        let path = self.settings.debug_policy_file.as_ref()?;
        match std::fs::read(path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(policy) => Some(policy),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid debug policy JSON");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reading debug policy file");
                None
            }
        }
    }

    /// Evaluate the policy for a connection attempt. `src` and `dst` must be
    /// mesh addresses and `src` must resolve to a mesh identity.
    pub(crate) async fn evaluate(
        &self,
        ssh_user: &str,
        src: SocketAddr,
        dst: SocketAddr,
        pub_key: Option<&PublicKey>,
    ) -> Result<Evaluation, EvalReject> {
        let Some(policy) = self.ssh_policy() else {
            return Err(EvalReject::NoPolicy);
        };
        if !is_mesh_ip(src.ip()) || !is_mesh_ip(dst.ip()) {
            return Err(EvalReject::NotMeshAddr);
        }
        let Some((node, user_profile)) = self.agent.who_is(src) else {
            return Err(EvalReject::UnknownIdentity);
        };
        let conn_info = ConnInfo {
            now: self.now(),
            ssh_user: ssh_user.to_string(),
            src,
            dst,
            node,
            user_profile,
            pub_key: pub_key.cloned(),
        };
        match matcher::eval_policy(&policy, &conn_info, &self.keys).await {
            Some((action, local_user)) => Ok(Evaluation { action, local_user, conn_info }),
            None => Err(EvalReject::Denied { conn_info }),
        }
    }

    /// Whether "none" authentication must be refused for this attempt,
    /// forcing the client to present a public key. True only when some
    /// applicable rule constrains this identity by key.
    pub async fn requires_pub_key(&self, ssh_user: &str, src: SocketAddr, dst: SocketAddr) -> bool {
        let Some(policy) = self.ssh_policy() else {
            return false;
        };
        let conn_info = match self.evaluate(ssh_user, src, dst, None).await {
            Ok(ev) => {
                if ev.action.allows_connection() {
                    return false;
                }
                ev.conn_info
            }
            Err(EvalReject::Denied { conn_info }) => conn_info,
            // Without a resolved identity the session will fail shortly
            // anyway; let "none" auth through and reject there.
            Err(_) => return false,
        };

        policy.rules.iter().any(|rule| {
            !matcher::rule_expired(rule, &conn_info)
                && !matcher::map_local_user(&rule.ssh_users, ssh_user).is_empty()
                && rule.principals.iter().any(|p| {
                    matcher::principal_matches_identity(p, &conn_info) && !p.pub_keys.is_empty()
                })
        })
    }

    /// Whether the presented public key authenticates this attempt: the
    /// evaluation outcome must be accept or delegation.
    pub async fn accept_pub_key(
        &self,
        ssh_user: &str,
        src: SocketAddr,
        dst: SocketAddr,
        key: &PublicKey,
    ) -> bool {
        match self.evaluate(ssh_user, src, dst, Some(key)).await {
            Ok(ev) => ev.action.allows_connection(),
            Err(_) => false,
        }
    }

    // -----------------------------------------------------------------------
    // Policy-change revalidation
    // -----------------------------------------------------------------------

    /// Re-check every live session against the (new) policy, terminating the
    /// ones it no longer allows. Called by the embedder whenever the netmap
    /// policy changes.
    pub fn on_policy_change(self: &Arc<Self>) {
        for record in self.registry.snapshot() {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                server.check_still_valid(&record).await;
            });
        }
    }

    async fn check_still_valid(&self, record: &SessionRecord) {
        let ci = &record.conn_info;
        if let Ok(ev) = self.evaluate(&ci.ssh_user, ci.src, ci.dst, ci.pub_key.as_ref()).await {
            if ev.action.allows_connection() && ev.local_user == record.local_user {
                return;
            }
        }
        info!(shared_id = %record.shared_id, "session no longer valid per new SSH policy; closing");
        record.ctx.close(Termination::with_message("revoked", "Access revoked."));
    }

    // -----------------------------------------------------------------------
    // Connection intake
    // -----------------------------------------------------------------------

    /// Serve one already-accepted connection (the embedding agent's intake
    /// path).
    pub async fn handle_conn(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        let src = stream.peer_addr().context("peer address")?;
        let dst = stream.local_addr().context("local address")?;
        let config = self.russh_config()?;
        let handler = ConnHandler::new(Arc::clone(self), src, dst);
        match russh::server::run_stream(config, stream, handler).await {
            Ok(session) => {
                if let Err(e) = session.await {
                    warn!(%src, error = %e, "ssh connection ended with error");
                }
            }
            Err(e) => warn!(%src, error = %e, "ssh handshake failed"),
        }
        Ok(())
    }

    /// Standalone accept loop for embedders that want this server to own
    /// the listener.
    pub async fn listen(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding SSH listener on {addr}"))?;
        info!(%addr, "SSH server listening");
        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.handle_conn(stream).await {
                    warn!(%peer, error = %e, "connection failed");
                }
            });
        }
    }

    fn russh_config(&self) -> Result<Arc<russh::server::Config>> {
        let keys = self.agent.host_keys().context("loading host keys")?;
        ensure!(!keys.is_empty(), "no SSH host keys available");
        Ok(Arc::new(russh::server::Config {
            server_id: russh::SshId::Standard("SSH-2.0-MeshSSH".to_string()),
            methods: MethodSet::NONE | MethodSet::PUBLICKEY,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::mesh::{ControlResponse, MeshNode, NetMap, UserProfile};
    use crate::policy::{SshPrincipal, SshRule};
    use crate::session::context::SessionContext;

    /// Mesh agent stub: fixed identity, swappable policy.
    struct StubAgent {
        policy: Mutex<Option<SshPolicy>>,
    }

    impl StubAgent {
        fn with_policy(policy: SshPolicy) -> Arc<Self> {
            Arc::new(Self { policy: Mutex::new(Some(policy)) })
        }

        fn swap_policy(&self, policy: SshPolicy) {
            *self.policy.lock().unwrap() = Some(policy);
        }
    }

    #[async_trait]
    impl MeshAgent for StubAgent {
        fn net_map(&self) -> Option<NetMap> {
            Some(NetMap { ssh_policy: self.policy.lock().unwrap().clone(), self_node_id: 42 })
        }

        fn who_is(&self, addr: SocketAddr) -> Option<(MeshNode, UserProfile)> {
            if !is_mesh_ip(addr.ip()) {
                return None;
            }
            Some((
                MeshNode { id: 7, stable_id: "nPEER".into(), name: "peer".into() },
                UserProfile {
                    login_name: "alice@example.com".into(),
                    display_name: "Alice".into(),
                },
            ))
        }

        fn host_keys(&self) -> Result<Vec<russh_keys::key::KeyPair>> {
            Ok(vec![russh_keys::key::KeyPair::generate_ed25519()])
        }

        async fn control_plane_get(&self, _url: &str) -> Result<ControlResponse> {
            anyhow::bail!("no control plane in tests")
        }

        fn var_root(&self) -> Option<PathBuf> {
            None
        }
    }

    fn accept_policy(users: &[(&str, &str)], pub_keys: Vec<String>) -> SshPolicy {
        SshPolicy {
            rules: vec![SshRule {
                rule_expires: None,
                principals: vec![SshPrincipal { any: true, pub_keys, ..Default::default() }],
                ssh_users: users
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                action: Some(SshAction { accept: true, ..Default::default() }),
            }],
        }
    }

    fn reject_policy() -> SshPolicy {
        SshPolicy {
            rules: vec![SshRule {
                principals: vec![SshPrincipal { any: true, ..Default::default() }],
                action: Some(SshAction { reject: true, ..Default::default() }),
                ..Default::default()
            }],
        }
    }

    fn server(agent: Arc<StubAgent>) -> Arc<SshServer> {
        SshServer::new(agent, Settings::default())
    }

    const SRC: &str = "100.64.0.2:53411";
    const DST: &str = "100.64.0.1:22";

    fn src() -> SocketAddr {
        SRC.parse().unwrap()
    }

    fn dst() -> SocketAddr {
        DST.parse().unwrap()
    }

    #[tokio::test]
    async fn evaluate_accepts_mapped_user() {
        let srv = server(StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![])));
        let ev = srv.evaluate("alice", src(), dst(), None).await.ok().unwrap();
        assert!(ev.action.accept);
        assert_eq!(ev.local_user, "alice");
        assert_eq!(ev.conn_info.node.stable_id, "nPEER");
    }

    #[tokio::test]
    async fn evaluate_rejects_non_mesh_addresses() {
        let srv = server(StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![])));
        let public: SocketAddr = "203.0.113.9:1022".parse().unwrap();
        assert!(matches!(
            srv.evaluate("alice", public, dst(), None).await,
            Err(EvalReject::NotMeshAddr)
        ));
        assert!(matches!(
            srv.evaluate("alice", src(), public, None).await,
            Err(EvalReject::NotMeshAddr)
        ));
    }

    #[tokio::test]
    async fn evaluate_requires_policy() {
        let agent = Arc::new(StubAgent { policy: Mutex::new(None) });
        let srv = server(agent);
        assert!(matches!(
            srv.evaluate("alice", src(), dst(), None).await,
            Err(EvalReject::NoPolicy)
        ));
    }

    #[tokio::test]
    async fn unmatched_user_is_denied() {
        let srv = server(StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![])));
        assert!(matches!(
            srv.evaluate("mallory", src(), dst(), None).await,
            Err(EvalReject::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn pub_key_required_only_when_a_rule_pins_keys() {
        // Key-free policy: "none" auth is fine.
        let srv = server(StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![])));
        assert!(!srv.requires_pub_key("alice", src(), dst()).await);

        // Same policy but the principal pins a key list.
        let srv = server(StubAgent::with_policy(accept_policy(
            &[("alice", "=")],
            vec!["https://keys.example.com/alice.keys".into()],
        )));
        assert!(srv.requires_pub_key("alice", src(), dst()).await);
        // A user no rule maps never needs a key; evaluation rejects anyway.
        assert!(!srv.requires_pub_key("mallory", src(), dst()).await);
    }

    #[tokio::test]
    async fn accept_pub_key_follows_evaluation() {
        let pair = russh_keys::key::KeyPair::generate_ed25519();
        let key = pair.clone_public_key().unwrap();

        let srv = server(StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![])));
        assert!(srv.accept_pub_key("alice", src(), dst(), &key).await);

        let srv = server(StubAgent::with_policy(reject_policy()));
        assert!(!srv.accept_pub_key("alice", src(), dst(), &key).await);
    }

    #[tokio::test]
    async fn debug_policy_file_fallback() {
        let agent = Arc::new(StubAgent { policy: Mutex::new(None) });
        let file = tempfile::NamedTempFile::new().unwrap();
        let policy = accept_policy(&[("alice", "=")], vec![]);
        std::fs::write(file.path(), serde_json::to_vec(&policy).unwrap()).unwrap();

        let settings = Settings {
            debug_policy_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let srv = SshServer::new(agent, settings);
        assert_eq!(srv.ssh_policy(), Some(policy));
    }

    #[tokio::test]
    async fn ignore_mesh_policy_knob() {
        let agent = StubAgent::with_policy(reject_policy());
        let file = tempfile::NamedTempFile::new().unwrap();
        let debug_policy = accept_policy(&[("alice", "=")], vec![]);
        std::fs::write(file.path(), serde_json::to_vec(&debug_policy).unwrap()).unwrap();

        let settings = Settings {
            debug_policy_file: Some(file.path().to_path_buf()),
            ignore_mesh_policy: true,
            ..Default::default()
        };
        let srv = SshServer::new(agent, settings);
        assert_eq!(srv.ssh_policy(), Some(debug_policy));
    }

    #[tokio::test]
    async fn revalidation_revokes_disallowed_sessions() {
        let agent = StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![]));
        let srv = server(Arc::clone(&agent));

        let ev = srv.evaluate("alice", src(), dst(), None).await.ok().unwrap();
        let ctx = Arc::new(SessionContext::new());
        let record = Arc::new(SessionRecord {
            conn_id: "c1".into(),
            shared_id: "20230405T060708-0011223344".into(),
            conn_info: ev.conn_info,
            action: ev.action,
            local_user: ev.local_user,
            ctx: Arc::clone(&ctx),
        });
        srv.registry().register(Arc::clone(&record));

        // Policy unchanged: session stays.
        srv.check_still_valid(&record).await;
        assert!(!ctx.is_closed());

        // Admin swaps in a policy that no longer allows alice.
        agent.swap_policy(reject_policy());
        srv.check_still_valid(&record).await;
        assert!(ctx.is_closed());
        let cause = ctx.cause().unwrap();
        assert_eq!(cause.reason, "revoked");
        assert_eq!(cause.message.as_deref(), Some("Access revoked."));
    }

    #[tokio::test]
    async fn revalidation_revokes_on_local_user_change() {
        let agent = StubAgent::with_policy(accept_policy(&[("alice", "=")], vec![]));
        let srv = server(Arc::clone(&agent));
        let ev = srv.evaluate("alice", src(), dst(), None).await.ok().unwrap();
        let ctx = Arc::new(SessionContext::new());
        let record = Arc::new(SessionRecord {
            conn_id: "c2".into(),
            shared_id: "20230405T060709-0011223344".into(),
            conn_info: ev.conn_info,
            action: ev.action,
            local_user: ev.local_user,
            ctx: Arc::clone(&ctx),
        });
        srv.registry().register(Arc::clone(&record));

        // Still allowed, but as a different local account.
        agent.swap_policy(accept_policy(&[("alice", "sandbox")], vec![]));
        srv.check_still_valid(&record).await;
        assert!(ctx.is_closed());
    }

    #[test]
    fn host_key_config() {
        let srv = server(StubAgent::with_policy(reject_policy()));
        let config = srv.russh_config().unwrap();
        assert!(!config.keys.is_empty());
        assert!(config.methods.contains(MethodSet::PUBLICKEY));
        assert!(config.methods.contains(MethodSet::NONE));
    }
}
