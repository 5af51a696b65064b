// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Kernel-level peer credential attestation for Unix domain sockets.
//!
//! Credentials come from the kernel (`SO_PEERCRED`), never from anything
//! the peer asserts about itself. The executable path is resolved through
//! `/proc/<pid>/exe`, with a bounded retry because a fast-forking caller
//! can disappear between `accept` and the readlink.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::error::{Error, Result};

/// Facts the kernel reports about the process at the other end of a UDS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCredentials {
    /// Process id of the peer.
    pub pid: i32,
    /// Effective user id of the peer.
    pub uid: u32,
    /// Effective group id of the peer.
    pub gid: u32,
    /// Resolved executable path of the peer process.
    pub path: PathBuf,
}

impl fmt::Display for PeerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pid={} uid={} gid={} path={}",
            self.pid,
            self.uid,
            self.gid,
            self.path.display()
        )
    }
}

/// Extracts [`PeerCredentials`] from a connected stream.
///
/// # Errors
///
/// [`Error::AttestationFailed`] when the kernel query fails, the peer pid
/// is invalid, or the executable path cannot be resolved within the retry
/// budget. [`Error::AttestationUnsupported`] on platforms without
/// `SO_PEERCRED`-equivalent facilities; callers must treat that as a fatal
/// build-configuration error.
#[cfg(target_os = "linux")]
pub async fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let cred = stream
        .peer_cred()
        .map_err(|e| Error::AttestationFailed(format!("SO_PEERCRED query failed: {e}")))?;
    let pid = cred
        .pid()
        .ok_or_else(|| Error::AttestationFailed("kernel reported no peer pid".into()))?;
    if pid < 1 {
        return Err(Error::AttestationFailed(format!("invalid peer pid {pid}")));
    }
    let path = resolve_exe_path(pid).await?;
    Ok(PeerCredentials { pid, uid: cred.uid(), gid: cred.gid(), path })
}

/// Stub for platforms without kernel peer credentials.
#[cfg(not(target_os = "linux"))]
pub async fn peer_credentials(_stream: &UnixStream) -> Result<PeerCredentials> {
    Err(Error::AttestationUnsupported)
}

// ENOENT retry schedule: 1 ms + 2 ms + 2 ms, 5 ms total.
#[cfg(target_os = "linux")]
const EXE_RETRY_DELAYS: [Duration; 3] =
    [Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(2)];

#[cfg(target_os = "linux")]
async fn resolve_exe_path(pid: i32) -> Result<PathBuf> {
    let link = format!("/proc/{pid}/exe");
    let mut delays = EXE_RETRY_DELAYS.iter();
    loop {
        match tokio::fs::read_link(&link).await {
            Ok(path) => return Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match delays.next() {
                Some(delay) => tokio::time::sleep(*delay).await,
                None => {
                    return Err(Error::AttestationFailed(format!(
                        "{link} vanished before it could be resolved"
                    )));
                }
            },
            Err(e) => {
                return Err(Error::AttestationFailed(format!("readlink {link} failed: {e}")));
            }
        }
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_own_credentials_over_socketpair() {
        use std::os::unix::fs::MetadataExt;

        let (a, _b) = UnixStream::pair().unwrap();
        let cred = peer_credentials(&a).await.unwrap();
        assert_eq!(cred.pid, std::process::id() as i32);
        assert_eq!(cred.uid, std::fs::metadata("/proc/self").unwrap().uid());
        assert!(cred.path.is_absolute());
    }

    #[tokio::test]
    async fn missing_proc_entry_exhausts_retries() {
        // pid 0 is rejected before /proc is consulted; use an impossibly
        // large pid to drive the readlink path instead.
        let err = resolve_exe_path(i32::MAX).await.unwrap_err();
        assert!(matches!(err, Error::AttestationFailed(_)));
    }
}
