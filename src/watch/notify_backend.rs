// src/watch/notify_backend.rs

//! [`WatchBackend`] on top of `notify`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{QaError, Result};

use super::backend::{ChangedFile, FileEvent, Subscription, WatchBackend};
use super::expression::{CompiledExpression, Expression};

const EVENT_BUFFER: usize = 64;

type WatcherSlot = Arc<Mutex<Option<RecommendedWatcher>>>;

/// Recursive `notify` watchers, one per subscription.
#[derive(Default)]
pub struct NotifyBackend {
    watchers: Vec<WatcherSlot>,
}

impl std::fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyBackend")
            .field("subscriptions", &self.watchers.len())
            .finish()
    }
}

impl NotifyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WatchBackend for NotifyBackend {
    fn subscribe(
        &mut self,
        root: &Path,
        name: &str,
        expression: Expression,
    ) -> Result<(Box<dyn Subscription>, mpsc::Receiver<FileEvent>)> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let compiled = Arc::new(RwLock::new(expression.compile()?));

        // notify calls back on its own thread; hop into async land.
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(err) => warn!(error = %err, "file watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(subscription = name, root = %root.display(), "file watch subscribed");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let filter = Arc::clone(&compiled);
        let event_root = root.clone();
        let sub_name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                let Some(batch) = to_file_event(&event_root, &filter, event) else {
                    continue;
                };
                if tx.send(batch).await.is_err() {
                    break;
                }
            }
            debug!(subscription = %sub_name, "file watch event loop finished");
        });

        let slot: WatcherSlot = Arc::new(Mutex::new(Some(watcher)));
        self.watchers.push(Arc::clone(&slot));

        Ok((
            Box::new(NotifySubscription {
                name: name.to_string(),
                expression: compiled,
                watcher: slot,
            }),
            rx,
        ))
    }

    fn close(&mut self) {
        for slot in self.watchers.drain(..) {
            slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }
}

struct NotifySubscription {
    name: String,
    expression: Arc<RwLock<CompiledExpression>>,
    watcher: WatcherSlot,
}

impl Subscription for NotifySubscription {
    fn update_expression(&mut self, expression: Expression) -> Result<()> {
        if self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(QaError::Watch(format!("subscription '{}' is closed", self.name)));
        }
        let compiled = expression.compile()?;
        *self.expression.write().unwrap_or_else(PoisonError::into_inner) = compiled;
        debug!(subscription = %self.name, "watch expression updated");
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the watcher drops the callback's sender, ending the stream.
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn to_file_event(
    root: &Path,
    expression: &RwLock<CompiledExpression>,
    event: Event,
) -> Option<FileEvent> {
    if matches!(event.kind, EventKind::Access(_)) {
        return None;
    }
    let created = matches!(event.kind, EventKind::Create(_));
    let expression = expression.read().unwrap_or_else(PoisonError::into_inner);

    let files: Vec<ChangedFile> = event
        .paths
        .iter()
        .filter(|p| !p.is_dir())
        .filter_map(|p| relative_name(root, p))
        .filter(|name| expression.matches(name))
        .map(|name| {
            let exists = root.join(&name).exists();
            ChangedFile {
                name,
                new: created && exists,
                exists,
            }
        })
        .collect();

    if files.is_empty() {
        None
    } else {
        Some(FileEvent {
            root: root.to_path_buf(),
            files,
        })
    }
}

/// `path` relative to `root` with forward slashes, trying canonical forms
/// when the raw prefixes disagree (symlinked temp dirs on macOS).
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let stripped: Option<PathBuf> = path
        .strip_prefix(root)
        .ok()
        .map(Path::to_path_buf)
        .or_else(|| {
            let canon = path.canonicalize().ok()?;
            canon.strip_prefix(root).ok().map(Path::to_path_buf)
        });
    match stripped {
        Some(rel) if !rel.as_os_str().is_empty() => Some(rel.to_string_lossy().replace('\\', "/")),
        _ => {
            warn!(path = %path.display(), "changed path is outside the watch root");
            None
        }
    }
}
