//! Per-connection SSH handler implementing the `russh` [`Handler`] trait.
//!
//! The handler is thin: it answers the auth callbacks from policy
//! evaluation, collects channel state (pty, env, agent request), and once a
//! shell or exec arrives, hands everything to the session runtime. From then
//! on it only routes client events — data, EOF, window changes — into the
//! runtime's input channel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rand::RngCore;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet, Pty};
use russh_keys::key::PublicKey;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::session::context::{SessionContext, Termination};
use crate::session::proc::PtySpec;
use crate::session::{run_session, SessionInput, SessionParams};

use super::SshServer;

/// Per-connection state.
pub(crate) struct ConnHandler {
    server: Arc<SshServer>,
    conn_id: String,
    src: SocketAddr,
    dst: SocketAddr,
    ssh_user: Option<String>,
    client_key: Option<PublicKey>,
    session_channel: Option<ChannelId>,
    pty: Option<PtySpec>,
    client_env: Vec<(String, String)>,
    agent_requested: bool,
    input_tx: Option<mpsc::UnboundedSender<SessionInput>>,
    session_ctx: Option<Arc<SessionContext>>,
}

impl ConnHandler {
    pub(crate) fn new(server: Arc<SshServer>, src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            server,
            conn_id: new_conn_id(&src, &dst),
            src,
            dst,
            ssh_user: None,
            client_key: None,
            session_channel: None,
            pty: None,
            client_env: Vec::new(),
            agent_requested: false,
            input_tx: None,
            session_ctx: None,
        }
    }

    /// Re-evaluate the policy with everything known post-auth and, if it
    /// holds up, spawn the session runtime for `channel`.
    async fn start_session(
        &mut self,
        channel: ChannelId,
        command: Option<String>,
        session: &mut Session,
    ) {
        let handle = session.handle();
        if self.input_tx.is_some() {
            warn!(src = %self.src, "second shell/exec request on one connection");
            crate::session::exit(&handle, channel, 1).await;
            return;
        }
        let ssh_user = self.ssh_user.clone().unwrap_or_default();

        match self.server.evaluate(&ssh_user, self.src, self.dst, self.client_key.as_ref()).await {
            Err(reject) => {
                warn!(src = %self.src, %reject, "rejecting SSH session");
                crate::session::exit(&handle, channel, 1).await;
            }
            Ok(ev) => {
                let ctx = Arc::new(SessionContext::new());
                let (input_tx, input_rx) = mpsc::unbounded_channel();
                self.input_tx = Some(input_tx);
                self.session_ctx = Some(Arc::clone(&ctx));
                tokio::spawn(run_session(SessionParams {
                    server: Arc::clone(&self.server),
                    handle,
                    channel,
                    conn_id: self.conn_id.clone(),
                    ctx,
                    conn_info: ev.conn_info,
                    initial_action: ev.action,
                    local_user: ev.local_user,
                    command,
                    pty: self.pty.clone(),
                    client_env: self.client_env.clone(),
                    agent_requested: self.agent_requested,
                    input: input_rx,
                }));
            }
        }
    }

    fn forward_input(&self, channel: ChannelId, input: SessionInput) {
        if Some(channel) != self.session_channel {
            return;
        }
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(input);
        }
    }
}

impl Drop for ConnHandler {
    fn drop(&mut self) {
        if let Some(ctx) = &self.session_ctx {
            ctx.close(Termination::silent("client disconnected"));
        }
    }
}

#[async_trait::async_trait]
impl Handler for ConnHandler {
    type Error = anyhow::Error;

    /// "None" authentication: allowed unless some rule pins this identity
    /// to a public key, in which case the client is pushed to publickey.
    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.ssh_user = Some(user.to_string());
        if self.server.requires_pub_key(user, self.src, self.dst).await {
            debug!(%user, src = %self.src, "public key required");
            return Ok(Auth::Reject { proceed_with_methods: Some(MethodSet::PUBLICKEY) });
        }
        Ok(Auth::Accept)
    }

    /// Public-key authentication: accept iff the policy outcome with this
    /// key is accept or delegation.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        self.ssh_user = Some(user.to_string());
        if self.server.accept_pub_key(user, self.src, self.dst, key).await {
            info!(%user, src = %self.src, fingerprint = %key.fingerprint(), "accepting SSH public key");
            self.client_key = Some(key.clone());
            return Ok(Auth::Accept);
        }
        info!(%user, src = %self.src, fingerprint = %key.fingerprint(), "rejecting SSH public key");
        Ok(Auth::Reject { proceed_with_methods: None })
    }

    /// One session channel per connection.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_channel.is_some() {
            warn!(src = %self.src, "refusing second session channel");
            return Ok(false);
        }
        self.session_channel = Some(channel.id());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(src = %self.src, %term, cols = col_width, rows = row_height, "pty requested");
        if Some(channel) == self.session_channel {
            self.pty =
                Some(PtySpec { term: term.to_string(), cols: col_width, rows: row_height });
            session.channel_success(channel);
        } else {
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if Some(channel) == self.session_channel {
            self.client_env.push((variable_name.to_string(), variable_value.to_string()));
        }
        session.channel_success(channel);
        Ok(())
    }

    /// Client asked for agent forwarding; whether it is honored is decided
    /// by the resolved action at session start.
    async fn agent_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if Some(channel) == self.session_channel {
            self.agent_requested = true;
        }
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        self.start_session(channel, None, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        session.channel_success(channel);
        self.start_session(channel, Some(command), session).await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_input(channel, SessionInput::Data(data.to_vec()));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_input(channel, SessionInput::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if Some(channel) == self.session_channel {
            if let Some(ctx) = &self.session_ctx {
                ctx.close(Termination::silent("client closed channel"));
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_input(channel, SessionInput::Resize { cols: col_width, rows: row_height });
        Ok(())
    }

    /// Local port forwarding (`direct-tcpip`), gated on the live session's
    /// resolved action.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let allowed = self
            .server
            .registry()
            .get_by_conn(&self.conn_id)
            .map(|record| record.action.allow_local_port_forwarding)
            .unwrap_or(false);
        if !allowed {
            warn!(src = %self.src, host = %host_to_connect, port = port_to_connect,
                "refusing local port forward");
            return Ok(false);
        }

        info!(src = %self.src, host = %host_to_connect, port = port_to_connect,
            origin = %format!("{originator_address}:{originator_port}"),
            "forwarding local port");
        let target = (host_to_connect.to_string(), port_to_connect as u16);
        tokio::spawn(async move {
            match TcpStream::connect(target.clone()).await {
                Ok(mut stream) => {
                    let mut channel_stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                }
                Err(e) => {
                    warn!(host = %target.0, port = target.1, error = %e, "port forward connect failed");
                }
            }
        });
        Ok(true)
    }
}

/// Opaque process-local connection id. The SSH transport's exchange hash is
/// not exposed by the library, so this takes its role for indexing; it never
/// leaves the process.
fn new_conn_id(src: &SocketAddr, dst: &SocketAddr) -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut hasher = Sha256::new();
    hasher.update(src.to_string().as_bytes());
    hasher.update(dst.to_string().as_bytes());
    hasher.update(nonce);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_ids_are_unique_and_hex() {
        let src: SocketAddr = "100.64.0.2:53411".parse().unwrap();
        let dst: SocketAddr = "100.64.0.1:22".parse().unwrap();
        let a = new_conn_id(&src, &dst);
        let b = new_conn_id(&src, &dst);
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
