//! Best-effort file watcher that re-indexes memory files after a quiet period.
//!
//! Each path owns at most one pending timer; a new event for the same path
//! replaces it, so a burst of writes produces a single index pass.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::future::BoxFuture,
    notify_debouncer_full::notify::{
        self, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    },
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    config::MemoryConfig,
    error::{Error, Result},
    indexer::{IndexOutcome, Indexer, is_markdown},
};

/// Upper bound on a single re-index triggered by the watcher.
const INDEX_PASS_TIMEOUT: Duration = Duration::from_secs(30);

type Action = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, ()> + Send + Sync>;
type Timers = Arc<Mutex<HashMap<PathBuf, (u64, JoinHandle<()>)>>>;

/// Per-path debounce timers. Scheduling a path cancels its pending timer.
struct DebounceTable {
    timers: Timers,
    generation: AtomicU64,
    delay: Duration,
    action: Action,
}

impl DebounceTable {
    fn new(delay: Duration, action: Action) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            delay,
            action,
        }
    }

    fn schedule(&self, path: PathBuf) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let action = Arc::clone(&self.action);
        let delay = self.delay;
        let key = path.clone();

        let Ok(mut guard) = self.timers.lock() else {
            warn!("debounce table poisoned, dropping event");
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action(key.clone()).await;
            // A newer timer may have replaced this one while the action ran.
            if let Ok(mut timers) = timers.lock()
                && timers.get(&key).is_some_and(|(g, _)| *g == generation)
            {
                timers.remove(&key);
            }
        });
        if let Some((_, previous)) = guard.insert(path, (generation, handle)) {
            previous.abort();
        }
    }

    fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Abort every timer (and any action in flight) and wait for them to finish.
    async fn cancel_all(&self) {
        let handles: Vec<JoinHandle<()>> = match self.timers.lock() {
            Ok(mut timers) => timers.drain().map(|(_, (_, h))| h).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }
}

/// Running watcher. Dropping it without [`shutdown`](Self::shutdown) closes
/// the event channel, and the detached task then cancels its pending timers on
/// its own; `shutdown` additionally waits for that to finish.
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    watcher: RecommendedWatcher,
}

impl WatcherHandle {
    /// Stop watching, cancel all pending timers and join the watch task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.watcher);
        if let Err(e) = self.task.await {
            warn!(error = %e, "memory watcher task ended abnormally");
        }
    }
}

/// Watch the project's memory directory and re-index markdown files that are
/// created or written, once `config.watch_debounce` passes without another event.
pub fn watch(
    indexer: Indexer,
    project_dir: &Path,
    config: &MemoryConfig,
) -> Result<WatcherHandle> {
    let memory_dir = config.memory_dir(project_dir);
    std::fs::create_dir_all(&memory_dir)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })
    .map_err(|e| Error::Watcher(e.to_string()))?;
    watcher
        .watch(&memory_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Watcher(e.to_string()))?;

    let project_dir = project_dir.to_path_buf();
    let action: Action = {
        let config = config.clone();
        Arc::new(move |path: PathBuf| -> BoxFuture<'static, ()> {
            let indexer = indexer.clone();
            let project_dir = project_dir.clone();
            let rel = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| config.relative_memory_path(name));
            Box::pin(async move {
                let Some(rel) = rel else {
                    return;
                };
                let pass = indexer.index_file(&project_dir, &rel);
                reindex_bounded(&rel, INDEX_PASS_TIMEOUT, pass).await;
            })
        })
    };

    let table = DebounceTable::new(config.watch_debounce, action);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(rx, table, cancel.clone()));

    info!(dir = %memory_dir.display(), "watching memory directory");
    Ok(WatcherHandle {
        cancel,
        task,
        watcher,
    })
}

/// Await one index pass for `rel`, abandoning it after `limit`.
/// Returns whether the pass completed successfully.
async fn reindex_bounded<F>(rel: &str, limit: Duration, pass: F) -> bool
where
    F: Future<Output = Result<IndexOutcome>>,
{
    match tokio::time::timeout(limit, pass).await {
        Ok(Ok(outcome)) => {
            debug!(path = rel, ?outcome, "watcher re-indexed file");
            true
        },
        Ok(Err(e)) => {
            warn!(path = rel, error = %e, "watcher failed to index file");
            false
        },
        Err(_) => {
            warn!(
                path = rel,
                timeout_secs = limit.as_secs(),
                "watcher index pass timed out"
            );
            false
        },
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    table: DebounceTable,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(Ok(event)) => {
                    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        continue;
                    }
                    for path in event.paths.into_iter().filter(|p| is_markdown(p)) {
                        table.schedule(path);
                    }
                },
                Some(Err(e)) => warn!(error = %e, "file watcher error"),
                None => break,
            },
        }
    }
    debug!(pending = table.pending(), "stopping memory watcher");
    table.cancel_all().await;
}
