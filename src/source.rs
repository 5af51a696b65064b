// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! Live X.509 identity source.
//!
//! Owns a background task that keeps the current SVID and trust bundle
//! fresh from the Workload API. Readers take whole-snapshot `Arc`s through
//! an atomic swap, so a reader holding an old snapshot always observes a
//! consistent (cert, key, chain) triple and rotation is monotonic from its
//! perspective. Transient fetch failures back off and never disturb
//! readers; they keep the last known good SVID until it expires at the
//! TLS layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

use crate::error::{Error, Result};
use crate::id::TrustDomain;
use crate::svid::{TrustBundle, X509Svid};
use crate::wire::FetchedSvid;
use crate::workload_client::WorkloadApiClient;

/// Default window for the blocking initial fetch.
pub const DEFAULT_INITIAL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Tunables for [`IdentitySource::connect`].
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// How long construction may block waiting for the first SVID.
    pub initial_fetch_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self { initial_fetch_timeout: DEFAULT_INITIAL_FETCH_TIMEOUT }
    }
}

pub(crate) struct Snapshot {
    pub(crate) svid: Arc<X509Svid>,
    pub(crate) bundle: Option<Arc<TrustBundle>>,
    pub(crate) generation: u64,
}

struct Shared {
    snapshot: ArcSwap<Snapshot>,
    closed: AtomicBool,
    close: watch::Sender<bool>,
    generation: watch::Sender<u64>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Process-wide holder of the current SVID and trust bundle.
///
/// Cheap to clone; all clones share the snapshot and the background task.
/// [`IdentitySource::close`] is idempotent and also runs when the last
/// clone is dropped.
#[derive(Clone)]
pub struct IdentitySource {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySource")
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Connects to the Workload API and blocks until the initial SVID is
    /// fetched, then starts the background rotation task.
    ///
    /// # Errors
    ///
    /// [`Error::InitialFetchTimeout`] when `initial_fetch_timeout` elapses
    /// before a valid SVID arrives; fetch errors inside the window are
    /// retried, not surfaced.
    pub async fn connect(client: WorkloadApiClient, options: SourceOptions) -> Result<Self> {
        let window = options.initial_fetch_timeout;
        let initial = tokio::time::timeout(window, initial_fetch(&client))
            .await
            .map_err(|_| Error::InitialFetchTimeout(window))?;

        let snapshot = Arc::new(to_snapshot(initial, 1));
        let (close_tx, close_rx) = watch::channel(false);
        let (generation_tx, _) = watch::channel(1);
        let shared = Arc::new(Shared {
            snapshot: ArcSwap::new(snapshot),
            closed: AtomicBool::new(false),
            close: close_tx,
            generation: generation_tx,
            task: std::sync::Mutex::new(None),
        });

        // The task holds only a weak reference so dropping the last
        // source clone ends rotation even without an explicit close().
        let task = tokio::spawn(rotation_loop(Arc::downgrade(&shared), client, close_rx));
        *shared.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
        Ok(Self { shared })
    }

    /// The latest SVID.
    ///
    /// Never suspends: this is a snapshot read.
    ///
    /// # Errors
    ///
    /// [`Error::SourceClosed`] after [`Self::close`].
    pub fn current_svid(&self) -> Result<Arc<X509Svid>> {
        Ok(Arc::clone(&self.snapshot()?.svid))
    }

    /// The current trust bundle for `trust_domain`.
    ///
    /// # Errors
    ///
    /// [`Error::SourceClosed`] after close, or
    /// [`Error::BundleUnavailable`] when no bundle for that trust domain is
    /// held.
    pub fn current_bundle_for(&self, trust_domain: &TrustDomain) -> Result<Arc<TrustBundle>> {
        let snapshot = self.snapshot()?;
        snapshot
            .bundle
            .as_ref()
            .filter(|b| b.trust_domain() == trust_domain)
            .cloned()
            .ok_or_else(|| Error::BundleUnavailable(trust_domain.clone()))
    }

    /// Stream of snapshot generations; yields on every rotation.
    #[must_use]
    pub fn updates(&self) -> WatchStream<u64> {
        WatchStream::new(self.shared.generation.subscribe())
    }

    /// Stops the background task immediately and releases the client.
    ///
    /// Idempotent; readers observe [`Error::SourceClosed`] afterwards.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.close.send_replace(true);
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!("identity source closed");
    }

    /// Whether [`Self::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<Snapshot>> {
        if self.is_closed() {
            return Err(Error::SourceClosed);
        }
        Ok(self.shared.snapshot.load_full())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take()
        {
            task.abort();
        }
    }
}

fn to_snapshot(fetched: FetchedSvid, generation: u64) -> Snapshot {
    Snapshot {
        svid: Arc::new(fetched.svid),
        bundle: fetched.bundle.map(Arc::new),
        generation,
    }
}

async fn initial_fetch(client: &WorkloadApiClient) -> FetchedSvid {
    let mut backoff = BACKOFF_INITIAL;
    loop {
        match client.fetch_x509_svid().await {
            Ok(fetched) => return fetched,
            Err(e) => {
                tracing::debug!(error = %e, "initial SVID fetch failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    }
}

async fn rotation_loop(
    shared: Weak<Shared>,
    client: WorkloadApiClient,
    mut close: watch::Receiver<bool>,
) {
    loop {
        let delay = {
            let Some(shared) = shared.upgrade() else { return };
            refresh_delay(shared.snapshot.load().svid.expires_at())
        };
        tokio::select! {
            _ = close.changed() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let mut backoff = BACKOFF_INITIAL;
        let fetched = loop {
            tokio::select! {
                _ = close.changed() => return,
                result = client.fetch_x509_svid() => match result {
                    Ok(fetched) => break fetched,
                    Err(e) => {
                        tracing::warn!(error = %e, retry_in = ?backoff, "SVID refresh failed");
                        tokio::select! {
                            _ = close.changed() => return,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(BACKOFF_CAP);
                    }
                }
            }
        };

        let Some(shared) = shared.upgrade() else { return };
        let generation = shared.snapshot.load().generation + 1;
        let next = Arc::new(to_snapshot(fetched, generation));
        tracing::info!(
            spiffe_id = %next.svid.spiffe_id(),
            expires_at = next.svid.expires_at(),
            generation,
            "rotated SVID"
        );
        shared.snapshot.store(next);
        shared.generation.send_replace(generation);
    }
}

/// Refresh at half the remaining lifetime, never more often than once a
/// second.
fn refresh_delay(expires_at: i64) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64);
    let remaining = expires_at.saturating_sub(now);
    if remaining <= 0 {
        return MIN_REFRESH_DELAY;
    }
    Duration::from_secs((remaining as u64 / 2).max(MIN_REFRESH_DELAY.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_delay_halves_remaining_lifetime() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
        let delay = refresh_delay(now + 3600);
        assert!(delay >= Duration::from_secs(1700) && delay <= Duration::from_secs(1800));
        assert_eq!(refresh_delay(now - 10), MIN_REFRESH_DELAY);
    }

    #[tokio::test]
    async fn connect_times_out_without_an_agent() {
        let client = WorkloadApiClient::new("/nonexistent/agent.sock")
            .unwrap()
            .with_request_timeout(Duration::from_millis(50));
        let options = SourceOptions { initial_fetch_timeout: Duration::from_millis(200) };
        let err = IdentitySource::connect(client, options).await.unwrap_err();
        assert!(matches!(err, Error::InitialFetchTimeout(_)));
    }
}
