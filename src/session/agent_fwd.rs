//! SSH agent forwarding.
//!
//! When the policy grants it and the client asked for it, the session gets a
//! Unix-domain socket owned by the target user; every connection accepted on
//! it is proxied onto an `auth-agent` channel back to the client. The socket
//! path is exported to the child as `SSH_AUTH_SOCK`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid};
use rand::RngCore;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::proc::LocalUser;

/// A live agent-forwarding listener for one session.
pub struct AgentForwarder {
    pub socket_path: PathBuf,
    dir: PathBuf,
    acceptor: JoinHandle<()>,
}

impl AgentForwarder {
    /// Bind the per-session agent socket and start proxying connections
    /// onto agent channels opened through `handle`.
    pub fn start(handle: russh::server::Handle, user: &LocalUser) -> Result<Self> {
        let dir = socket_dir()?;
        let socket_path = dir.join("agent.sock");
        let listener =
            UnixListener::bind(&socket_path).with_context(|| format!("binding {}", socket_path.display()))?;
        make_accessible(&socket_path, &dir, user.uid, user.gid)?;

        let acceptor = tokio::spawn({
            let socket_path = socket_path.clone();
            async move {
                loop {
                    let (mut stream, _) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "agent socket accept failed");
                            break;
                        }
                    };
                    let channel = match handle.channel_open_agent().await {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!(error = %e, "opening agent channel failed");
                            continue;
                        }
                    };
                    tokio::spawn(async move {
                        let mut channel_stream = channel.into_stream();
                        let _ = tokio::io::copy_bidirectional(&mut stream, &mut channel_stream).await;
                    });
                }
                debug!(socket = %socket_path.display(), "agent acceptor stopped");
            }
        });

        Ok(Self { socket_path, dir, acceptor })
    }

    /// Stop accepting and remove the socket.
    pub fn close(&self) {
        self.acceptor.abort();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_dir(&self.dir);
    }
}

impl Drop for AgentForwarder {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create a fresh private directory for the session's agent socket.
fn socket_dir() -> Result<PathBuf> {
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);
    let dir = std::env::temp_dir().join(format!("meshssh-agent-{}", hex::encode(suffix)));
    std::fs::create_dir(&dir).with_context(|| format!("creating {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// Hand the socket to the target user: chown it to (uid, gid) and open the
/// directory to 0755 so the user can traverse into it.
fn make_accessible(socket: &Path, dir: &Path, uid: u32, gid: u32) -> Result<()> {
    chown(socket, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .with_context(|| format!("chown {}", socket.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
