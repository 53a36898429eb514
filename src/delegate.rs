//! Terminal-action resolution.
//!
//! A rule may answer with `holdAndDelegate`: a control-plane URL that serves
//! the *next* action. Resolution loops — printing any carried message to the
//! client, expanding URL tokens, fetching over the mesh's authenticated
//! channel — until an accept or reject is reached, the session dies, or the
//! 30-minute budget runs out. A long budget is deliberate: the delegate URL
//! typically parks the user on a login page.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::mesh::MeshAgent;
use crate::policy::{ActionKind, ConnInfo, SshAction};

/// Outer deadline for resolving one delegation chain.
pub const DELEGATE_BUDGET: Duration = Duration::from_secs(30 * 60);
/// Upper bound on the retry backoff.
pub const DELEGATE_BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Non-200 delegate bodies are logged up to this many bytes.
const DELEGATE_BODY_LOG_LIMIT: usize = 1 << 10;

// ---------------------------------------------------------------------------
// Client messaging seam
// ---------------------------------------------------------------------------

/// Where action messages go. The runtime backs this with the session's
/// stderr channel; tests collect strings.
#[async_trait]
pub trait MessageSink: Send {
    /// Deliver `message` to the client, translating `\n` to `\r\n`.
    async fn show(&mut self, message: &str);
}

// ---------------------------------------------------------------------------
// URL token expansion
// ---------------------------------------------------------------------------

/// Values substituted into a delegate URL.
#[derive(Debug, Clone)]
pub struct DelegateTokens {
    pub src_ip: String,
    pub src_node_id: i64,
    pub dst_ip: String,
    pub dst_node_id: i64,
    pub ssh_user: String,
    pub local_user: String,
}

impl DelegateTokens {
    pub fn new(ci: &ConnInfo, dst_node_id: i64, local_user: &str) -> Self {
        Self {
            src_ip: ci.src.ip().to_string(),
            src_node_id: ci.node.id,
            dst_ip: ci.dst.ip().to_string(),
            dst_node_id,
            ssh_user: ci.ssh_user.clone(),
            local_user: local_user.to_string(),
        }
    }
}

/// Substitute the `$TOKEN` placeholders. Every value is percent-encoded
/// except the numeric node ids.
pub fn expand_delegate_url(url: &str, t: &DelegateTokens) -> String {
    url.replace("$SRC_NODE_IP", &query_escape(&t.src_ip))
        .replace("$SRC_NODE_ID", &t.src_node_id.to_string())
        .replace("$DST_NODE_IP", &query_escape(&t.dst_ip))
        .replace("$DST_NODE_ID", &t.dst_node_id.to_string())
        .replace("$SSH_USER", &query_escape(&t.ssh_user))
        .replace("$LOCAL_USER", &query_escape(&t.local_user))
}

/// Percent-encode a query-string value: unreserved characters pass, space
/// becomes `+`, everything else becomes `%XX`.
fn query_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Resolution loop
// ---------------------------------------------------------------------------

/// Follow `action` to a terminal accept or reject, printing carried messages
/// along the way. The returned action is always `Accept` or `Reject`.
pub async fn resolve_terminal_action(
    mut action: SshAction,
    tokens: &DelegateTokens,
    agent: &dyn MeshAgent,
    cancel: &CancellationToken,
    sink: &mut dyn MessageSink,
) -> Result<SshAction> {
    loop {
        if !action.message.is_empty() {
            sink.show(&action.message).await;
        }
        if matches!(action.kind(), ActionKind::Accept | ActionKind::Reject) {
            return Ok(action);
        }
        let url = match action.kind() {
            ActionKind::Hold(u) => expand_delegate_url(u, tokens),
            _ => bail!("reached action that lacks accept, reject, and delegate"),
        };
        action = fetch_action(agent, cancel, &url)
            .await
            .with_context(|| format!("fetching next action from {url}"))?;
    }
}

/// Fetch one follow-up action, retrying transport errors, non-200 statuses,
/// and undecodable bodies with capped exponential backoff. Gives up only
/// when the session is cancelled or [`DELEGATE_BUDGET`] elapses.
pub(crate) async fn fetch_action(
    agent: &dyn MeshAgent,
    cancel: &CancellationToken,
    url: &str,
) -> Result<SshAction> {
    let deadline = tokio::time::Instant::now() + DELEGATE_BUDGET;
    let mut backoff = Backoff::new(DELEGATE_BACKOFF_CAP);
    loop {
        if cancel.is_cancelled() {
            bail!("session closed");
        }

        match agent.control_plane_get(url).await {
            Err(e) => warn!(%url, error = %e, "delegate fetch failed"),
            Ok(res) if res.status != 200 => {
                let body = &res.body[..res.body.len().min(DELEGATE_BODY_LOG_LIMIT)];
                warn!(
                    %url,
                    status = res.status,
                    body = %String::from_utf8_lossy(body),
                    "unexpected delegate status"
                );
            }
            Ok(res) => match serde_json::from_slice::<SshAction>(&res.body) {
                Ok(action) => return Ok(action),
                Err(e) => warn!(%url, error = %e, "invalid action JSON from delegate"),
            },
        }

        tokio::select! {
            _ = cancel.cancelled() => bail!("session closed"),
            _ = tokio::time::sleep_until(deadline) => bail!("delegate fetch deadline elapsed"),
            _ = backoff.wait() => {}
        }
    }
}

/// Exponential backoff with jitter, doubling from 100 ms up to a cap.
struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    fn new(cap: Duration) -> Self {
        Self { next: Duration::from_millis(100), cap }
    }

    fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (base * 2).min(self.cap);
        base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
    }

    async fn wait(&mut self) {
        tokio::time::sleep(self.delay()).await;
    }
}
