//! OS glue: local-user lookup, pty allocation, and child-process launch.
//!
//! The runtime talks to this module through [`LaunchSpec`] and
//! [`LaunchedChild`] only; everything platform-flavored (openpty, controlling
//! terminal, uid/gid switch) stays behind that seam.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{ensure, Context, Result};
use nix::pty::Winsize;
use nix::unistd::{geteuid, setsid, User};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// A resolved local account a session runs as.
#[derive(Debug, Clone)]
pub struct LocalUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl LocalUser {
    /// Look up a local account by name.
    pub fn lookup(name: &str) -> Result<Option<LocalUser>> {
        let user = User::from_name(name).with_context(|| format!("looking up user {name:?}"))?;
        Ok(user.map(|u| LocalUser {
            name: u.name,
            uid: u.uid.as_raw(),
            gid: u.gid.as_raw(),
            home: u.dir,
            shell: u.shell,
        }))
    }
}

/// Whether this process may run a child as `user`: it must be root, or
/// already be that user.
pub fn can_switch_to(user: &LocalUser) -> bool {
    let euid = geteuid().as_raw();
    euid == 0 || euid == user.uid
}

/// Terminal parameters from the client's pty request.
#[derive(Debug, Clone)]
pub struct PtySpec {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// What to launch for a session.
#[derive(Debug)]
pub struct LaunchSpec {
    pub user: LocalUser,
    /// Exec command; `None` runs an interactive login shell.
    pub command: Option<String>,
    pub pty: Option<PtySpec>,
    /// Extra environment (client env requests, `SSH_AUTH_SOCK`, ...).
    pub extra_env: Vec<(String, String)>,
}

/// Child-side I/O endpoints held by the parent.
pub enum ChildIo {
    Pty {
        /// Master side, duplicated for independent read/write.
        reader: tokio::fs::File,
        writer: tokio::fs::File,
        /// Kept for resize ioctls.
        control: OwnedFd,
    },
    Pipes {
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
    },
}

pub struct LaunchedChild {
    pub child: Child,
    pub io: ChildIo,
}

/// Spawn the session child process under the target user.
pub fn launch(spec: LaunchSpec) -> Result<LaunchedChild> {
    let mut cmd = Command::new(&spec.user.shell);
    if let Some(ref command) = spec.command {
        cmd.arg("-c").arg(command);
    } else if let Some(name) = spec.user.shell.file_name() {
        // Interactive sessions get a login shell, signalled by the leading
        // dash in argv[0].
        cmd.arg0(format!("-{}", name.to_string_lossy()));
    }

    cmd.env_clear();
    for (k, v) in build_env(&spec) {
        cmd.env(k, v);
    }
    cmd.current_dir(&spec.user.home);

    if geteuid().as_raw() == 0 {
        cmd.uid(spec.user.uid).gid(spec.user.gid);
    }
    cmd.kill_on_drop(true);

    match spec.pty {
        Some(ref pty) => {
            let winsize = Winsize {
                ws_row: pty.rows as u16,
                ws_col: pty.cols as u16,
                ws_xpixel: 0,
                ws_ypixel: 0,
            };
            let opened = nix::pty::openpty(Some(&winsize), None).context("openpty")?;

            let slave = std::fs::File::from(opened.slave);
            cmd.stdin(slave.try_clone().context("cloning pty slave")?);
            cmd.stdout(slave.try_clone().context("cloning pty slave")?);
            cmd.stderr(slave);
            unsafe {
                cmd.pre_exec(|| {
                    setsid().map_err(std::io::Error::other)?;
                    // stdin is the pty slave by now; make it the controlling
                    // terminal of the new session.
                    if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }

            let child = cmd.spawn().context("spawning pty session process")?;
            let reader = opened.master.try_clone().context("duplicating pty master")?;
            let writer = opened.master.try_clone().context("duplicating pty master")?;
            Ok(LaunchedChild {
                child,
                io: ChildIo::Pty {
                    reader: tokio::fs::File::from_std(std::fs::File::from(reader)),
                    writer: tokio::fs::File::from_std(std::fs::File::from(writer)),
                    control: opened.master,
                },
            })
        }
        None => {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
            unsafe {
                cmd.pre_exec(|| {
                    setsid().map_err(std::io::Error::other)?;
                    Ok(())
                });
            }
            let mut child = cmd.spawn().context("spawning session process")?;
            let stdin = child.stdin.take().context("child stdin missing")?;
            let stdout = child.stdout.take().context("child stdout missing")?;
            let stderr = child.stderr.take().context("child stderr missing")?;
            Ok(LaunchedChild { child, io: ChildIo::Pipes { stdin, stdout, stderr } })
        }
    }
}

/// Apply a window-change request to a running pty.
pub fn resize_pty(control: &OwnedFd, cols: u32, rows: u32) -> Result<()> {
    let winsize = Winsize {
        ws_row: rows as u16,
        ws_col: cols as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { nix::libc::ioctl(control.as_raw_fd(), nix::libc::TIOCSWINSZ as _, &winsize) };
    ensure!(rc == 0, "TIOCSWINSZ failed: {}", std::io::Error::last_os_error());
    Ok(())
}

/// Base environment for the child: account identity plus the client's
/// requested variables, with `TERM` defaulting from the pty request.
fn build_env(spec: &LaunchSpec) -> Vec<(String, String)> {
    let mut env = vec![
        ("HOME".to_string(), spec.user.home.to_string_lossy().into_owned()),
        ("USER".to_string(), spec.user.name.clone()),
        ("LOGNAME".to_string(), spec.user.name.clone()),
        ("SHELL".to_string(), spec.user.shell.to_string_lossy().into_owned()),
        ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".to_string()),
    ];
    if let Some(ref pty) = spec.pty {
        env.push(("TERM".to_string(), pty.term.clone()));
    }
    for (k, v) in &spec.extra_env {
        match env.iter_mut().find(|(name, _)| name == k) {
            Some(slot) => slot.1 = v.clone(),
            None => env.push((k.clone(), v.clone())),
        }
    }
    env
}
