//! Session transcript recording in asciinema v2 cast format.
//!
//! A cast file is one JSON header line followed by one JSON event line per
//! I/O burst: `[seconds-since-start, "i"|"o", payload]`. Lines are written
//! under a mutex in the order their byte-writes began. Closing is
//! idempotent; events logged after close are dropped while the underlying
//! session I/O continues untouched.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use tracing::{debug, warn};

/// Directory under the node's var root where transcripts land.
const RECORDING_SUBDIR: &str = "ssh-sessions";

#[derive(Serialize)]
struct CastHeader {
    version: u32,
    width: u32,
    height: u32,
    timestamp: i64,
    env: CastEnv,
}

#[derive(Serialize)]
struct CastEnv {
    #[serde(rename = "TERM")]
    term: String,
}

/// An open cast file for one session.
pub struct Recording {
    start: Instant,
    out: Mutex<Option<File>>,
    path: PathBuf,
}

impl Recording {
    /// Create `<var_root>/ssh-sessions/ssh-session-<unix-nanos>-<rand>.cast`
    /// and write the v2 header.
    pub fn start(
        var_root: &Path,
        width: u32,
        height: u32,
        term: &str,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let dir = var_root.join(RECORDING_SUBDIR);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        let mut suffix = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut suffix);
        let nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let path = dir.join(format!("ssh-session-{}-{}.cast", nanos, hex::encode(suffix)));
        let mut file = File::create(&path).with_context(|| format!("creating {}", path.display()))?;

        let header = CastHeader {
            version: 2,
            width,
            height,
            timestamp: now.timestamp(),
            env: CastEnv { term: term.to_string() },
        };
        let mut line = serde_json::to_vec(&header)?;
        line.push(b'\n');
        file.write_all(&line)?;

        debug!(path = %path.display(), "started session recording");
        Ok(Self { start: Instant::now(), out: Mutex::new(Some(file)), path })
    }

    /// Append one event line. `dir` is `"i"` for client-to-process bytes and
    /// `"o"` for process-to-client. Dropped silently once closed.
    pub fn log(&self, dir: &str, payload: &[u8]) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let event = (elapsed, dir, String::from_utf8_lossy(payload));
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode cast event");
                return;
            }
        };
        line.push(b'\n');

        let mut out = self.out.lock().unwrap();
        if let Some(file) = out.as_mut() {
            if let Err(e) = file.write_all(&line) {
                warn!(error = %e, "cast write failed");
            }
        }
    }

    /// Close the transcript. Safe to call more than once.
    pub fn close(&self) {
        let mut out = self.out.lock().unwrap();
        if let Some(file) = out.take() {
            drop(file);
            debug!(path = %self.path.display(), "closed session recording");
        }
    }

    #[cfg(test)]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        self.close();
    }
}
