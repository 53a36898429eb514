//! Session runtime.
//!
//! Once the front door accepts a shell or exec request, everything else
//! happens here: resolving the policy action to a terminal accept/reject,
//! verifying the uid switch, wiring agent forwarding and transcript
//! recording, launching the child under the target user, pumping I/O, and
//! tearing the whole thing down on whichever of child exit, client
//! disconnect, timeout, or revocation happens first.

pub mod agent_fwd;
pub mod context;
pub mod proc;
pub mod recording;

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delegate::{resolve_terminal_action, DelegateTokens, MessageSink};
use crate::policy::{ConnInfo, SshAction};
use crate::server::registry::SessionRecord;
use crate::server::SshServer;
use agent_fwd::AgentForwarder;
use context::{SessionContext, Termination};
use proc::{ChildIo, LaunchSpec, LaunchedChild, LocalUser, PtySpec};
use recording::Recording;

/// Client-side events routed from the connection handler into the runtime.
#[derive(Debug)]
pub enum SessionInput {
    Data(Vec<u8>),
    Eof,
    Resize { cols: u32, rows: u32 },
}

/// Everything the runtime needs to drive one accepted session.
pub struct SessionParams {
    pub server: Arc<SshServer>,
    pub handle: Handle,
    pub channel: ChannelId,
    pub conn_id: String,
    pub ctx: Arc<SessionContext>,
    pub conn_info: ConnInfo,
    /// Action from policy evaluation; may still be a delegation.
    pub initial_action: SshAction,
    /// Local account name the matching rule mapped the SSH user to.
    pub local_user: String,
    /// Exec command, or `None` for an interactive shell.
    pub command: Option<String>,
    pub pty: Option<PtySpec>,
    pub client_env: Vec<(String, String)>,
    pub agent_requested: bool,
    pub input: mpsc::UnboundedReceiver<SessionInput>,
}

/// Drive a session from resolution to exit. Always emits an exit status and
/// closes the channel.
pub async fn run_session(params: SessionParams) {
    let SessionParams {
        server,
        handle,
        channel,
        conn_id,
        ctx,
        conn_info,
        initial_action,
        local_user,
        command,
        pty,
        client_env,
        agent_requested,
        input,
    } = params;

    let shared_id = new_shared_id(server.now());
    info!(
        %shared_id,
        login = %conn_info.user_profile.login_name,
        src = %conn_info.src,
        ssh_user = %conn_info.ssh_user,
        "handling new SSH session"
    );

    let self_node_id = server.agent().net_map().map(|nm| nm.self_node_id).unwrap_or_default();
    let tokens = DelegateTokens::new(&conn_info, self_node_id, &local_user);
    let mut sink = StderrSink { handle: handle.clone(), channel };

    let action = match resolve_terminal_action(
        initial_action,
        &tokens,
        server.agent(),
        ctx.token(),
        &mut sink,
    )
    .await
    {
        Ok(action) => action,
        Err(e) => {
            warn!(%shared_id, error = %e, "failed to resolve terminal action");
            sink.show("Access denied: failed to resolve action.\n").await;
            exit(&handle, channel, 1).await;
            return;
        }
    };

    if action.reject || !action.accept {
        info!(
            %shared_id,
            login = %conn_info.user_profile.login_name,
            src = %conn_info.src,
            "access denied"
        );
        exit(&handle, channel, 1).await;
        return;
    }
    info!(
        %shared_id,
        login = %conn_info.user_profile.login_name,
        src = %conn_info.src,
        ssh_user = %conn_info.ssh_user,
        local_user = %local_user,
        "access granted"
    );

    let user = match LocalUser::lookup(&local_user) {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(%shared_id, %local_user, "no such local user");
            exit(&handle, channel, 1).await;
            return;
        }
        Err(e) => {
            warn!(%shared_id, %local_user, error = %e, "user lookup failed");
            exit(&handle, channel, 1).await;
            return;
        }
    };

    let record = Arc::new(SessionRecord {
        conn_id,
        shared_id: shared_id.clone(),
        conn_info,
        action,
        local_user: user.name.clone(),
        ctx: Arc::clone(&ctx),
    });
    server.registry().register(Arc::clone(&record));

    let code = run_active(
        &server,
        &handle,
        channel,
        &record,
        &user,
        command,
        pty,
        client_env,
        agent_requested,
        input,
    )
    .await;

    server.registry().deregister(&record);
    ctx.close(Termination::silent("session done"));
    info!(%shared_id, code, "session ended");
    exit(&handle, channel, code).await;
}

/// The registered phase: watchdogs, setup, child launch, pumps, teardown.
/// Returns the session exit code.
#[allow(clippy::too_many_arguments)]
async fn run_active(
    server: &Arc<SshServer>,
    handle: &Handle,
    channel: ChannelId,
    record: &Arc<SessionRecord>,
    user: &LocalUser,
    command: Option<String>,
    pty: Option<PtySpec>,
    client_env: Vec<(String, String)>,
    agent_requested: bool,
    input: mpsc::UnboundedReceiver<SessionInput>,
) -> u32 {
    let ctx = &record.ctx;
    let action = &record.action;
    let shared_id = record.shared_id.as_str();
    let vlog = server.settings().verbose_session_logs;

    let mut duration_timer: Option<JoinHandle<()>> = None;
    if let Some(limit) = action.session_duration {
        let ctx = Arc::clone(ctx);
        duration_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            ctx.close(Termination::with_message(
                "timeout",
                format!("Session timeout of {}s elapsed.", limit.as_secs()),
            ));
        }));
    }

    if !proc::can_switch_to(user) {
        warn!(%shared_id, user = %user.name, "can't switch to local user");
        let _ = handle.data(channel, CryptoVec::from_slice(b"can't switch user\n")).await;
        abort_timer(duration_timer);
        return 1;
    }

    // The TERM the client asked for, for the transcript header.
    let term = client_env
        .iter()
        .find(|(k, _)| k == "TERM")
        .map(|(_, v)| v.clone())
        .or_else(|| pty.as_ref().map(|p| p.term.clone()))
        .unwrap_or_else(|| "xterm-256color".to_string());

    let mut extra_env = client_env;
    let mut agent_fwd = None;
    if action.allow_agent_forwarding && agent_requested {
        match AgentForwarder::start(handle.clone(), user) {
            Ok(fwd) => {
                if vlog {
                    debug!(%shared_id, socket = %fwd.socket_path.display(), "agent forwarding enabled");
                }
                extra_env
                    .push(("SSH_AUTH_SOCK".to_string(), fwd.socket_path.display().to_string()));
                agent_fwd = Some(fwd);
            }
            Err(e) => warn!(%shared_id, error = %e, "agent forwarding failed"),
        }
    }

    let mut rec: Option<Arc<Recording>> = None;
    if should_record(server.settings().record_sessions, action.record, pty.is_some()) {
        let started = match server.agent().var_root() {
            Some(root) => {
                let (width, height) =
                    pty.as_ref().map(|p| (p.cols, p.rows)).unwrap_or_default();
                Recording::start(&root, width, height, &term, server.now())
            }
            None => Err(anyhow::anyhow!("no var root for recording storage")),
        };
        match started {
            Ok(recording) => rec = Some(Arc::new(recording)),
            Err(e) => {
                warn!(%shared_id, error = %e, "starting session recording failed");
                let _ = handle
                    .data(channel, CryptoVec::from_slice(b"can't start new recording\n"))
                    .await;
                abort_timer(duration_timer);
                return 1;
            }
        }
    }

    let spec = LaunchSpec { user: user.clone(), command, pty, extra_env };
    let LaunchedChild { mut child, io } = match proc::launch(spec) {
        Ok(launched) => launched,
        Err(e) => {
            warn!(%shared_id, error = %e, "start failed");
            abort_timer(duration_timer);
            return 1;
        }
    };
    if vlog {
        debug!(%shared_id, pid = child.id().unwrap_or_default(), "session process started");
    }

    let stdin_pump;
    let mut output_pumps = Vec::new();
    match io {
        ChildIo::Pty { reader, writer, control } => {
            stdin_pump = tokio::spawn(pump_stdin(input, writer, Some(control), rec.clone()));
            output_pumps.push(tokio::spawn(pump_output(
                reader,
                handle.clone(),
                channel,
                rec.clone(),
                None,
            )));
        }
        ChildIo::Pipes { stdin, stdout, stderr } => {
            stdin_pump = tokio::spawn(pump_stdin(input, stdin, None, rec.clone()));
            output_pumps.push(tokio::spawn(pump_output(
                stdout,
                handle.clone(),
                channel,
                rec.clone(),
                None,
            )));
            // Recording is pty-only; stderr goes to the client untouched.
            output_pumps.push(tokio::spawn(pump_output(
                stderr,
                handle.clone(),
                channel,
                None,
                Some(1),
            )));
        }
    }

    let code = tokio::select! {
        biased;
        _ = ctx.closed() => {
            let cause = ctx.cause();
            // The cause message goes out before the process dies.
            if let Some(msg) = cause.as_ref().and_then(|c| c.message.as_deref()) {
                let framed = format!("\r\n\r\n{msg}\r\n\r\n");
                let _ = handle.extended_data(channel, 1, CryptoVec::from_slice(framed.as_bytes())).await;
            }
            info!(
                %shared_id,
                reason = cause.as_ref().map(|c| c.reason).unwrap_or("closed"),
                "terminating session"
            );
            let _ = child.start_kill();
            let _ = child.wait().await;
            1
        }
        res = child.wait() => match res {
            Ok(status) => {
                let code = exit_code(&status);
                if vlog {
                    debug!(%shared_id, code, "session process exited");
                }
                code
            }
            Err(e) => {
                warn!(%shared_id, error = %e, "waiting on session process failed");
                1
            }
        }
    };

    // Output pumps drain on their own once the child's fds close; bound the
    // wait so teardown cannot hang on a wedged fd.
    for pump in output_pumps {
        let _ = tokio::time::timeout(Duration::from_secs(2), pump).await;
    }
    stdin_pump.abort();
    abort_timer(duration_timer);
    if let Some(rec) = rec {
        rec.close();
    }
    if let Some(fwd) = agent_fwd {
        fwd.close();
    }
    code
}

fn abort_timer(timer: Option<JoinHandle<()>>) {
    if let Some(timer) = timer {
        timer.abort();
    }
}

// ---------------------------------------------------------------------------
// I/O pumps
// ---------------------------------------------------------------------------

/// Client-to-process pump. Data is recorded (direction `"i"`) before it is
/// forwarded; EOF closes the writer; resizes hit the pty directly.
async fn pump_stdin<W>(
    mut input: mpsc::UnboundedReceiver<SessionInput>,
    mut writer: W,
    control: Option<OwnedFd>,
    rec: Option<Arc<Recording>>,
) where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(event) = input.recv().await {
        match event {
            SessionInput::Data(bytes) => {
                if let Some(rec) = &rec {
                    rec.log("i", &bytes);
                }
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
            SessionInput::Eof => break,
            SessionInput::Resize { cols, rows } => {
                if let Some(fd) = &control {
                    if let Err(e) = proc::resize_pty(fd, cols, rows) {
                        debug!(error = %e, "pty resize failed");
                    }
                }
            }
        }
    }
}

/// Process-to-client pump. `ext` selects the extended-data stream (stderr);
/// recording (direction `"o"`) happens before forwarding.
async fn pump_output<R>(
    mut reader: R,
    handle: Handle,
    channel: ChannelId,
    rec: Option<Arc<Recording>>,
    ext: Option<u32>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(rec) = &rec {
                    rec.log("o", &buf[..n]);
                }
                let data = CryptoVec::from_slice(&buf[..n]);
                let sent = match ext {
                    Some(code) => handle.extended_data(channel, code, data).await,
                    None => handle.data(channel, data).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Small pieces
// ---------------------------------------------------------------------------

/// Stderr-backed [`MessageSink`] with `\n` to `\r\n` translation.
pub(crate) struct StderrSink {
    pub handle: Handle,
    pub channel: ChannelId,
}

#[async_trait]
impl MessageSink for StderrSink {
    async fn show(&mut self, message: &str) {
        let translated = message.replace('\n', "\r\n");
        let _ = self
            .handle
            .extended_data(self.channel, 1, CryptoVec::from_slice(translated.as_bytes()))
            .await;
    }
}

/// Mint the control-plane-visible session id:
/// `YYYYMMDDTHHMMSS-<10 hex chars>` from five random bytes.
pub(crate) fn new_shared_id(now: DateTime<Utc>) -> String {
    let mut suffix = [0u8; 5];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}-{}", now.format("%Y%m%dT%H%M%S"), hex::encode(suffix))
}

/// Recording is pty-only; within that, the action's hint overrides the
/// server knob.
fn should_record(server_knob: bool, action_hint: Option<bool>, has_pty: bool) -> bool {
    if !has_pty {
        return false;
    }
    action_hint.unwrap_or(server_knob)
}

fn exit_code(status: &std::process::ExitStatus) -> u32 {
    status.code().map(|c| c as u32).unwrap_or(1)
}

/// Report `code` to the client and close the channel.
pub(crate) async fn exit(handle: &Handle, channel: ChannelId, code: u32) {
    let _ = handle.exit_status_request(channel, code).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
