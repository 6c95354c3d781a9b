use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use notify::{ErrorKind, Event, EventHandler, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, WatchMode};
use crate::error::{InitError, WatchError};
use crate::print::StrategyChain;
use super::identity::{SeenRegistry, WatchedFile};
use super::pipeline::{Arrival, FileProcessor, FileReport, Pipeline};

type Subscription = Box<dyn Watcher + Send>;
type RawEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;
type RawSender = mpsc::UnboundedSender<notify::Result<Event>>;

/// Lifecycle of the directory watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Uninitialized,
    Watching,
    /// The subscription failed and is being re-established
    Erroring { consecutive_failures: u32 },
    Stopped,
}

/// Requests a graceful stop of a running [`WatchSupervisor`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.sender.send_replace(true);
    }
}

/// Owns the watch subscription and feeds admitted files to the pipeline
pub struct WatchSupervisor {
    config: ServiceConfig,
    chain: Arc<StrategyChain>,
    seen: SeenRegistry,
    watch_dir: Option<PathBuf>,
    state: watch::Sender<SupervisorState>,
    shutdown: Arc<watch::Sender<bool>>,
    reports: Option<mpsc::UnboundedSender<FileReport>>,
    raw_tx: RawSender,
    raw_rx: Option<RawEvents>,
}

impl std::fmt::Debug for WatchSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSupervisor")
            .field("watch_path", &self.config.watch_path)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl WatchSupervisor {
    pub fn new(config: ServiceConfig, chain: StrategyChain) -> Self {
        let (state, _) = watch::channel(SupervisorState::Uninitialized);
        let (shutdown, _) = watch::channel(false);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        Self {
            config,
            chain: Arc::new(chain),
            seen: SeenRegistry::new(),
            watch_dir: None,
            state,
            shutdown: Arc::new(shutdown),
            reports: None,
            raw_tx,
            raw_rx: Some(raw_rx),
        }
    }

    /// Supervisor using the strategies described by `config.print`
    pub fn from_config(config: ServiceConfig) -> Self {
        let chain = StrategyChain::from_config(&config.print, &config.timing);
        Self::new(config, chain)
    }

    /// Send a [`FileReport`] for every settled file
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<FileReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task
    pub fn state_changes(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn seen(&self) -> &SeenRegistry {
        &self.seen
    }

    /// Canonical watch directory, known after [`initialize`](Self::initialize)
    pub fn watch_dir(&self) -> Option<&Path> {
        self.watch_dir.as_deref()
    }

    /// Feeds the same channel the subscription reports into
    #[cfg(test)]
    pub(crate) fn raw_events(&self) -> RawSender {
        self.raw_tx.clone()
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Supervisor state: {:?} -> {:?}", previous, state);
        }
    }

    /// Create the watch directory if needed and remember what is already in it.
    ///
    /// Returns the names of the pre-existing files, which are never processed.
    pub fn initialize(&mut self) -> Result<Vec<String>, InitError> {
        let path = self.config.watch_path.clone();
        ensure_directory(&path)?;
        let dir = path
            .canonicalize()
            .map_err(|source| InitError::ReadDir { path, source })?;

        if let Some(archive) = self.config.archive_dir() {
            if canonical_target(archive).is_some_and(|target| target == dir) {
                return Err(InitError::ArchiveIsWatchDir(archive.to_path_buf()));
            }
        }

        let existing = self.seen.seed_from_dir(&dir)?;
        if !existing.is_empty() {
            info!("Ignoring {} existing file(s) in watch folder", existing.len());
            for name in &existing {
                debug!("Existing file: {}", name);
            }
        }

        self.watch_dir = Some(dir);
        Ok(existing)
    }

    /// Watch until a stop is requested.
    ///
    /// Only a failure to set up the directory or the first subscription is
    /// returned; later subscription errors are retried indefinitely.
    pub async fn run(&mut self) -> Result<(), InitError> {
        let dir = match self.watch_dir.clone() {
            Some(dir) => dir,
            None => {
                self.initialize()?;
                self.watch_dir.clone().ok_or_else(|| InitError::NotADirectory(self.config.watch_path.clone()))?
            }
        };

        let mut event_rx = match self.raw_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.raw_tx = tx;
                rx
            }
        };
        let event_tx = self.raw_tx.clone();
        let mut subscription = Some(
            self.subscribe(&dir, event_tx.clone())
                .map_err(|source| InitError::Subscribe { path: dir.clone(), source })?,
        );

        let processor = FileProcessor::from_config(&self.config, self.chain.clone(), self.seen.clone());
        let pipeline = Pipeline::spawn(Arc::new(processor), self.reports.clone());

        self.set_state(SupervisorState::Watching);
        info!("Watching for new files in: {}", dir.display());

        let mut heartbeat = heartbeat_interval(self.config.timing.heartbeat());
        let mut shutdown = self.shutdown.subscribe();
        let mut entry_errors = HashSet::new();

        loop {
            tokio::select! {
                _ = stop_requested(&mut shutdown) => break,
                Some(received) = event_rx.recv() => match received {
                    Ok(event) => self.handle_event(event, &pipeline),
                    Err(err) if !is_subscription_failure(&err, &dir) => report_entry_error(&err, &mut entry_errors),
                    Err(err) => {
                        error!("{}", WatchError::from(err));
                        drop(subscription.take());
                        match self.recover(&dir, &event_tx, &mut event_rx, &mut shutdown).await {
                            Some(restored) => {
                                subscription = Some(restored);
                                self.rescan(&dir, &pipeline);
                            }
                            None => break,
                        }
                    }
                },
                _ = next_beat(&mut heartbeat) => {
                    info!("Heartbeat: watching {} ({} file(s) handled)", dir.display(), self.seen.handled_count());
                }
            }
        }

        info!("Stopping file watcher...");
        drop(subscription);
        self.set_state(SupervisorState::Stopped);

        if !pipeline.shutdown(self.config.timing.shutdown_grace()).await {
            warn!("Shutdown grace period elapsed, abandoning files still in progress");
        }
        info!("File watcher stopped");
        Ok(())
    }

    fn subscribe(
        &self,
        dir: &Path,
        events: mpsc::UnboundedSender<notify::Result<Event>>,
    ) -> Result<Subscription, notify::Error> {
        let handler = move |result: notify::Result<Event>| {
            let _ = events.send(result);
        };
        let interval = self.config.poll_interval();

        match self.config.watch_mode {
            WatchMode::Native => native_subscription(dir, handler),
            WatchMode::Polling => polling_subscription(dir, handler, interval),
            WatchMode::Auto => native_subscription(dir, handler.clone()).or_else(|err| {
                warn!("Native file watching unavailable ({}), falling back to polling", err);
                polling_subscription(dir, handler, interval)
            }),
        }
    }

    /// Re-establish the subscription; `None` if a stop was requested meanwhile
    async fn recover(
        &self,
        dir: &Path,
        events: &mpsc::UnboundedSender<notify::Result<Event>>,
        pending: &mut RawEvents,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Subscription> {
        let mut failures = 0;
        loop {
            failures += 1;
            self.set_state(SupervisorState::Erroring { consecutive_failures: failures });

            let delay = self.config.timing.restart_delay(failures);
            warn!("Restarting file watcher in {:.1}s (attempt {})", delay.as_secs_f32(), failures);
            tokio::select! {
                _ = stop_requested(shutdown) => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            // Whatever the old subscription left behind is covered by the rescan
            while pending.try_recv().is_ok() {}

            match self.resubscribe(dir, events.clone()) {
                Ok(restored) => {
                    self.set_state(SupervisorState::Watching);
                    info!("File watcher restarted successfully");
                    return Some(restored);
                }
                Err(err) => error!("Failed to restart watcher: {}", err),
            }
        }
    }

    fn resubscribe(
        &self,
        dir: &Path,
        events: mpsc::UnboundedSender<notify::Result<Event>>,
    ) -> Result<Subscription, WatchError> {
        ensure_directory(dir)?;
        Ok(self.subscribe(dir, events)?)
    }

    fn handle_event(&self, event: Event, pipeline: &Pipeline) {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
            return;
        }
        for path in event.paths {
            self.admit_path(path, pipeline);
        }
    }

    fn admit_path(&self, path: PathBuf, pipeline: &Pipeline) -> bool {
        let Some(identity) = WatchedFile::probe(&path) else {
            return false;
        };
        if !self.seen.admit(&identity) {
            return false;
        }

        info!("Detected new file: {}", identity.file_name);
        pipeline.submit(Arrival::new(path, identity))
    }

    /// Admit files that appeared while the subscription was down
    fn rescan(&self, dir: &Path, pipeline: &Pipeline) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Could not rescan {}: {}", dir.display(), err);
                return;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        paths.sort();
        let admitted = paths
            .into_iter()
            .filter(|path| self.admit_path(path.clone(), pipeline))
            .count();
        if admitted > 0 {
            info!("Rescan found {} new file(s)", admitted);
        }
    }
}

fn ensure_directory(dir: &Path) -> Result<(), InitError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|source| InitError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        info!("Created watch folder: {}", dir.display());
    }
    if !dir.is_dir() {
        return Err(InitError::NotADirectory(dir.to_path_buf()));
    }
    Ok(())
}

/// Canonical form of `path`, which may not exist yet
fn canonical_target(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Some(canonical);
    }
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.canonicalize().ok()?,
        _ => std::env::current_dir().ok()?.canonicalize().ok()?,
    };
    Some(parent.join(name))
}

/// Whether `err` means the watch itself is lost, as opposed to a problem
/// with one entry in the folder
fn is_subscription_failure(err: &notify::Error, dir: &Path) -> bool {
    if !dir.is_dir() {
        return true;
    }
    match &err.kind {
        ErrorKind::PathNotFound
        | ErrorKind::WatchNotFound
        | ErrorKind::MaxFilesWatch
        | ErrorKind::InvalidConfig(_) => true,
        // Scan failures for single entries, e.g. a dangling symlink
        ErrorKind::Generic(_) => false,
        ErrorKind::Io(_) => err.paths.is_empty() || err.paths.iter().any(|path| path == dir),
    }
}

/// Polling repeats entry errors on every scan; each one is warned about once
fn report_entry_error(err: &notify::Error, reported: &mut HashSet<String>) {
    let message = match err.paths.as_slice() {
        [] => format!("Skipping unreadable entry in watch folder: {}", err),
        paths => {
            let names: Vec<String> = paths.iter().map(|path| path.display().to_string()).collect();
            format!("Skipping unreadable entry {}: {}", names.join(", "), err)
        }
    };
    if reported.insert(message.clone()) {
        warn!("{}", message);
    } else {
        debug!("{}", message);
    }
}

fn native_subscription<F: EventHandler>(dir: &Path, handler: F) -> Result<Subscription, notify::Error> {
    let mut watcher = notify::recommended_watcher(handler)?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(Box::new(watcher))
}

fn polling_subscription<F: EventHandler>(
    dir: &Path,
    handler: F,
    interval: Duration,
) -> Result<Subscription, notify::Error> {
    let config = notify::Config::default().with_poll_interval(interval);
    let mut watcher = PollWatcher::new(handler, config)?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(Box::new(watcher))
}

/// Resolves once a stop has been requested
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let stop = *shutdown.borrow_and_update();
        if stop {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Nobody can request a stop any more
            std::future::pending::<()>().await;
        }
    }
}

fn heartbeat_interval(period: Duration) -> Option<Interval> {
    (!period.is_zero()).then(|| tokio::time::interval_at(Instant::now() + period, period))
}

async fn next_beat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(watch: &Path) -> ServiceConfig {
        let mut config = ServiceConfig {
            watch_path: watch.to_path_buf(),
            move_to_folder: None,
            enable_printing: false,
            ..ServiceConfig::default()
        };
        config.timing.settle_delay_ms = 10;
        config.timing.shutdown_grace_ms = 500;
        config
    }

    #[test]
    fn test_initialize_creates_missing_directory() {
        let root = TempDir::new().unwrap();
        let watch = root.path().join("incoming/nested");

        let mut supervisor = WatchSupervisor::new(config_for(&watch), StrategyChain::builder().build());
        assert_eq!(supervisor.state(), SupervisorState::Uninitialized);

        let existing = supervisor.initialize().unwrap();
        assert!(existing.is_empty());
        assert!(watch.is_dir());
        assert!(supervisor.watch_dir().is_some());
    }

    #[test]
    fn test_initialize_seeds_existing_files() {
        let watch = TempDir::new().unwrap();
        fs::write(watch.path().join("old.txt"), "old").unwrap();

        let mut supervisor = WatchSupervisor::new(config_for(watch.path()), StrategyChain::builder().build());
        assert_eq!(supervisor.initialize().unwrap(), vec!["old.txt"]);
        assert!(supervisor.seen().is_preexisting("old.txt"));
    }

    #[test]
    fn test_initialize_rejects_file_as_watch_path() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        let mut supervisor = WatchSupervisor::new(config_for(&file), StrategyChain::builder().build());
        assert!(matches!(supervisor.initialize(), Err(InitError::NotADirectory(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_initialize_rejects_archive_aliasing_watch_folder() {
        let root = TempDir::new().unwrap();
        let watch = root.path().join("inbox");
        let alias = root.path().join("done");
        fs::create_dir(&watch).unwrap();
        std::os::unix::fs::symlink(&watch, &alias).unwrap();

        let mut config = config_for(&watch);
        config.move_to_folder = Some(alias);
        let mut supervisor = WatchSupervisor::new(config, StrategyChain::builder().build());
        assert!(matches!(supervisor.initialize(), Err(InitError::ArchiveIsWatchDir(_))));

        let mut config = config_for(&watch);
        config.move_to_folder = Some(root.path().join("archive-not-created-yet"));
        let mut supervisor = WatchSupervisor::new(config, StrategyChain::builder().build());
        assert!(supervisor.initialize().is_ok());
    }

    #[tokio::test]
    async fn test_stop_before_any_event() {
        let watch = TempDir::new().unwrap();
        let mut config = config_for(watch.path());
        config.watch_mode = WatchMode::Polling;
        config.poll_interval_ms = 50;

        let mut supervisor = WatchSupervisor::new(config, StrategyChain::builder().build());
        let handle = supervisor.shutdown_handle();
        let mut states = supervisor.state_changes();

        let running = tokio::spawn(async move {
            supervisor.run().await.unwrap();
            supervisor
        });

        states.wait_for(|state| *state == SupervisorState::Watching).await.unwrap();
        handle.stop();

        let supervisor = tokio::time::timeout(Duration::from_secs(5), running).await.unwrap().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_entry_errors_do_not_end_the_subscription() {
        let watch = TempDir::new().unwrap();
        let dir = watch.path();
        let entry = dir.join("broken-link");

        let walk = notify::Error::generic("IO error for operation on broken-link: No such file or directory");
        let metadata = notify::Error::io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).add_path(entry);
        assert!(!is_subscription_failure(&walk, dir));
        assert!(!is_subscription_failure(&metadata, dir));

        let overflow = notify::Error::io(std::io::Error::other("event queue overflow"));
        let root = notify::Error::io(std::io::Error::from(std::io::ErrorKind::NotFound)).add_path(dir.to_path_buf());
        assert!(is_subscription_failure(&overflow, dir));
        assert!(is_subscription_failure(&root, dir));
        assert!(is_subscription_failure(&notify::Error::new(ErrorKind::MaxFilesWatch), dir));
        assert!(is_subscription_failure(&notify::Error::path_not_found(), dir));
    }

    #[test]
    fn test_missing_watch_folder_is_a_subscription_failure() {
        let root = TempDir::new().unwrap();
        let gone = root.path().join("removed");
        assert!(is_subscription_failure(&notify::Error::generic("walk failed"), &gone));
    }

    fn spawn_watching(
        config: ServiceConfig,
    ) -> (
        ShutdownHandle,
        RawSender,
        watch::Receiver<SupervisorState>,
        mpsc::UnboundedReceiver<FileReport>,
        tokio::task::JoinHandle<WatchSupervisor>,
    ) {
        let (tx, reports) = mpsc::unbounded_channel();
        let mut supervisor = WatchSupervisor::new(config, StrategyChain::builder().build()).with_reports(tx);
        supervisor.initialize().unwrap();

        let handle = supervisor.shutdown_handle();
        let raw = supervisor.raw_events();
        let states = supervisor.state_changes();
        let task = tokio::spawn(async move {
            supervisor.run().await.unwrap();
            supervisor
        });
        (handle, raw, states, reports, task)
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dangling_symlink_keeps_polling_watch_alive() {
        let watch = TempDir::new().unwrap();
        let mut config = config_for(watch.path());
        config.watch_mode = WatchMode::Polling;
        config.poll_interval_ms = 50;
        config.timing.restart_delay_ms = 100;

        let (handle, _raw, mut states, mut reports, task) = spawn_watching(config);
        states.wait_for(|state| *state == SupervisorState::Watching).await.unwrap();

        let erroring = tokio::spawn(async move {
            let mut count = 0;
            while states.changed().await.is_ok() {
                if matches!(*states.borrow_and_update(), SupervisorState::Erroring { .. }) {
                    count += 1;
                }
            }
            count
        });

        std::os::unix::fs::symlink(watch.path().join("nowhere"), watch.path().join("broken-link")).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        fs::write(watch.path().join("after.txt"), "still watching").unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.file_name, "after.txt");

        handle.stop();
        let supervisor = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        drop(supervisor);
        assert_eq!(erroring.await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_subscription_recovers_and_rescans() {
        let watch = TempDir::new().unwrap();
        let mut config = config_for(watch.path());
        config.watch_mode = WatchMode::Polling;
        config.poll_interval_ms = 50;
        config.timing.restart_delay_ms = 300;

        let (handle, raw, mut states, mut reports, task) = spawn_watching(config);
        states.wait_for(|state| *state == SupervisorState::Watching).await.unwrap();

        raw.send(Err(notify::Error::io(std::io::Error::other("event queue overflow"))))
            .unwrap();
        states
            .wait_for(|state| *state == SupervisorState::Erroring { consecutive_failures: 1 })
            .await
            .unwrap();

        // Dropped while nothing is subscribed
        fs::write(watch.path().join("outage.txt"), "missed event").unwrap();

        states.wait_for(|state| *state == SupervisorState::Watching).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.file_name, "outage.txt");

        handle.stop();
        let supervisor = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[test]
    fn test_heartbeat_disabled_at_zero() {
        assert!(heartbeat_interval(Duration::ZERO).is_none());
    }
}
