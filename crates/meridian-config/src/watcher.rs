//! Debounced manifest hot-reload.
//!
//! Filesystem change events reset a single pending debounce timer; when it
//! fires, one reload runs. A reload that fails to read, parse, or validate
//! emits an error event and retains the last good manifest. Successful
//! reloads diff against the last good manifest: no change emits nothing,
//! an identity change emits `RestartRequired`, anything else `Updated`.

use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Manifest;
use crate::validate;

/// Events produced by the watcher.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The manifest changed and applies live.
    Updated {
        /// The freshly loaded manifest.
        new_config: Arc<Manifest>,
        /// The previous good manifest.
        old_config: Arc<Manifest>,
    },
    /// The manifest changed in a section that needs a restart to apply.
    RestartRequired {
        /// The section that changed.
        section: &'static str,
        /// The freshly loaded manifest.
        new_config: Arc<Manifest>,
        /// The previous good manifest.
        old_config: Arc<Manifest>,
    },
    /// A reload failed; the last good manifest stays in effect.
    Error {
        /// What failed, stringified for fan-out.
        message: String,
    },
}

/// Watches a manifest file and emits [`WatchEvent`]s.
pub struct ConfigWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Start watching `path`.
    ///
    /// `initial` is the manifest currently in effect; reload diffs compare
    /// against it until the first successful reload replaces it.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Watch`] when the filesystem watcher cannot be
    /// installed.
    pub fn spawn(
        path: PathBuf,
        initial: Manifest,
        debounce: Duration,
    ) -> ConfigResult<(Self, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        // The notify callback runs on the watcher's own thread; an
        // unbounded send is the bridge into the async loop.
        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let _ = raw_tx.send(result);
            },
        )
        .map_err(|e| ConfigError::Watch {
            message: e.to_string(),
        })?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Watch {
                message: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_loop(
            path,
            initial,
            debounce,
            raw_rx,
            event_tx,
            cancel.clone(),
            watcher,
        ));

        Ok((Self { cancel, handle }, event_rx))
    }

    /// Stop the watcher, clearing any pending debounce.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[allow(clippy::needless_pass_by_value)]
async fn watch_loop(
    path: PathBuf,
    initial: Manifest,
    debounce: Duration,
    mut raw_rx: mpsc::UnboundedReceiver<Result<notify::Event, notify::Error>>,
    events: mpsc::UnboundedSender<WatchEvent>,
    cancel: CancellationToken,
    // Held so the filesystem watcher lives as long as the loop; dropping it
    // on exit closes the underlying watch.
    _watcher: notify::RecommendedWatcher,
) {
    let mut last_good = Arc::new(initial);
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let debounce_timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) if is_relevant(&event) => {
                    debug!(path = %path.display(), "manifest change observed, debouncing");
                    deadline = Some(tokio::time::Instant::now() + debounce);
                },
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    let _ = events.send(WatchEvent::Error {
                        message: e.to_string(),
                    });
                },
                None => break,
            },
            () = debounce_timer => {
                deadline = None;
                if let Some(event) = reload(&path, &mut last_good).await {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            },
        }
    }
}

fn is_relevant(event: &notify::Event) -> bool {
    event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove()
}

/// Run one reload against the last good manifest.
///
/// Returns `None` when nothing changed.
async fn reload(path: &Path, last_good: &mut Arc<Manifest>) -> Option<WatchEvent> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "manifest read failed, retaining last good config");
            return Some(WatchEvent::Error {
                message: format!("failed to read {}: {e}", path.display()),
            });
        },
    };

    let manifest: Manifest = match serde_yaml::from_str(&text) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "manifest parse failed, retaining last good config");
            return Some(WatchEvent::Error {
                message: format!("failed to parse {}: {e}", path.display()),
            });
        },
    };

    if let Err(e) = validate::validate(&manifest) {
        warn!(path = %path.display(), error = %e, "manifest validation failed, retaining last good config");
        return Some(WatchEvent::Error {
            message: e.to_string(),
        });
    }

    if manifest == **last_good {
        debug!(path = %path.display(), "manifest unchanged after reload");
        return None;
    }

    let new_config = Arc::new(manifest);
    let old_config = Arc::clone(last_good);
    *last_good = Arc::clone(&new_config);

    if new_config.identity != old_config.identity {
        info!(path = %path.display(), "identity changed, restart required");
        Some(WatchEvent::RestartRequired {
            section: "identity",
            new_config,
            old_config,
        })
    } else {
        info!(path = %path.display(), "manifest updated");
        Some(WatchEvent::Updated {
            new_config,
            old_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::time::timeout;

    const DEBOUNCE: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(5);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WatchEvent>) -> WatchEvent {
        timeout(WAIT, rx.recv()).await.expect("timed out waiting for watch event").unwrap()
    }

    fn write(path: &Path, text: &str) {
        fs::write(path, text).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn updated_event_carries_old_and_new() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.yaml");
        write(&path, "gateway:\n  sessionTimeoutMs: 1000\n");
        let initial = Manifest::load(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial, DEBOUNCE).unwrap();
        write(&path, "gateway:\n  sessionTimeoutMs: 2000\n");

        match next_event(&mut rx).await {
            WatchEvent::Updated {
                new_config,
                old_config,
            } => {
                assert_eq!(old_config.gateway.session_timeout_ms, 1_000);
                assert_eq!(new_config.gateway.session_timeout_ms, 2_000);
            },
            other => panic!("expected Updated, got {other:?}"),
        }
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rapid_writes_debounce_to_the_last_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.yaml");
        write(&path, "{}");
        let initial = Manifest::load(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial, Duration::from_millis(200)).unwrap();
        write(&path, "gateway:\n  sessionTimeoutMs: 1111\n");
        write(&path, "gateway:\n  sessionTimeoutMs: 2222\n");
        write(&path, "gateway:\n  sessionTimeoutMs: 3333\n");

        match next_event(&mut rx).await {
            WatchEvent::Updated { new_config, .. } => {
                assert_eq!(new_config.gateway.session_timeout_ms, 3_333);
            },
            other => panic!("expected Updated, got {other:?}"),
        }
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_manifest_emits_error_and_retains_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.yaml");
        write(&path, "gateway:\n  sessionTimeoutMs: 1000\n");
        let initial = Manifest::load(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial, DEBOUNCE).unwrap();

        // Parse failure.
        write(&path, "gateway: [broken\n");
        assert!(matches!(next_event(&mut rx).await, WatchEvent::Error { .. }));

        // Recovery diffs against the retained config from before the bad
        // write, so it still registers as a change.
        write(&path, "gateway:\n  sessionTimeoutMs: 5000\n");
        match next_event(&mut rx).await {
            WatchEvent::Updated { old_config, .. } => {
                assert_eq!(old_config.gateway.session_timeout_ms, 1_000);
            },
            other => panic!("expected Updated, got {other:?}"),
        }
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn validation_failure_emits_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.yaml");
        write(&path, "{}");
        let initial = Manifest::load(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial, DEBOUNCE).unwrap();
        write(&path, "executionLimits:\n  loopDetection:\n    repeatThreshold: 0\n");
        match next_event(&mut rx).await {
            WatchEvent::Error { message } => {
                assert!(message.contains("repeatThreshold"));
            },
            other => panic!("expected Error, got {other:?}"),
        }
        watcher.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn identity_change_requires_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.yaml");
        write(&path, "{}");
        let initial = Manifest::load(&path).unwrap();

        let (watcher, mut rx) = ConfigWatcher::spawn(path.clone(), initial, DEBOUNCE).unwrap();
        write(&path, "identity:\n  default:\n    name: NewName\n");
        match next_event(&mut rx).await {
            WatchEvent::RestartRequired { section, new_config, .. } => {
                assert_eq!(section, "identity");
                assert_eq!(new_config.identity.default.name.as_deref(), Some("NewName"));
            },
            other => panic!("expected RestartRequired, got {other:?}"),
        }
        watcher.stop().await;
    }
}
