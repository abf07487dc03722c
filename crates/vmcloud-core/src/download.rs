//! Background fetches of volume backing files, deduplicated by destination.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use vmcloud_common::{
    id_prefix, new_id, CloudError, DestinationKey, DownloadStatus, DownloadTask,
    HypervisorClient, Result,
};

use crate::command::run_remote;
use crate::provisioning::require_pool;

/// Invoked once with the final task snapshot and the failure, if any.
pub type CompletionCallback =
    Box<dyn FnOnce(DownloadTask, Option<Arc<CloudError>>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Seam for running detached work.
pub trait TaskRunner: Send + Sync {
    fn run(&self, work: BoxFuture<'static, ()>);
}

/// Detaches work onto the tokio runtime.
pub struct TokioRunner;

impl TaskRunner for TokioRunner {
    fn run(&self, work: BoxFuture<'static, ()>) {
        tokio::spawn(work);
    }
}

/// Runs work to completion on the calling thread with `futures::executor::block_on`.
///
/// The work must not need the tokio reactor: timers, sockets and process I/O
/// (including `HttpFetcher`) deadlock on a current-thread runtime and stall a
/// worker thread on a multi-threaded one. Suited to fakes only.
pub struct InlineRunner;

impl TaskRunner for InlineRunner {
    fn run(&self, work: BoxFuture<'static, ()>) {
        futures::executor::block_on(work);
    }
}

/// Moves bytes from a URL into a file on the hypervisor's node. Returns bytes written.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        hypervisor: Arc<dyn HypervisorClient>,
        dest: &Path,
    ) -> Result<u64>;
}

/// Streams with reqwest for local nodes, runs curl on remote ones.
pub struct HttpFetcher {
    client: reqwest::Client,
    curl_bin: PathBuf,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            curl_bin: PathBuf::from("curl"),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            ..Self::new()
        }
    }

    async fn fetch_local(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CloudError::tool(format!("download of {url}"), e))?;

        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CloudError::tool(format!("download of {url}"), e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        tokio::fs::rename(&partial, dest).await?;
        Ok(written)
    }

    async fn fetch_remote(
        &self,
        url: &str,
        hypervisor: &dyn HypervisorClient,
        dest: &Path,
    ) -> Result<u64> {
        let dest_arg = dest.to_string_lossy().into_owned();
        let command = crate::command::render(
            &self.curl_bin,
            &[
                "-fsSL".to_string(),
                "--create-dirs".to_string(),
                "-w".to_string(),
                "%{size_download}".to_string(),
                "-o".to_string(),
                dest_arg,
                url.to_string(),
            ],
        );
        let output = run_remote(hypervisor, &command).await?;
        Ok(output.stdout.trim().parse::<f64>().map(|b| b as u64).unwrap_or(0))
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        hypervisor: Arc<dyn HypervisorClient>,
        dest: &Path,
    ) -> Result<u64> {
        if hypervisor.is_remote() {
            self.fetch_remote(url, hypervisor.as_ref(), dest).await
        } else {
            self.fetch_local(url, dest).await
        }
    }
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, DownloadTask>,
    by_destination: HashMap<DestinationKey, String>,
    callbacks: HashMap<String, Vec<CompletionCallback>>,
    /// Tasks whose transfer has been handed to the runner.
    dispatched: HashSet<String>,
}

impl TaskTable {
    /// Existing non-terminal task for the key, or a fresh pending one.
    fn claim(&mut self, destination: &DestinationKey, url: &str) -> (DownloadTask, bool) {
        if let Some(existing_id) = self.by_destination.get(destination).cloned() {
            let live = self
                .tasks
                .get(&existing_id)
                .filter(|t| !t.status.is_terminal())
                .cloned();
            if let Some(existing) = live {
                return (existing, false);
            }
            self.tasks.remove(&existing_id);
            self.dispatched.remove(&existing_id);
        }

        let now = Utc::now();
        let task = DownloadTask {
            id: new_id(id_prefix::TASK),
            destination: destination.clone(),
            url: url.to_string(),
            status: DownloadStatus::Pending,
            error: None,
            bytes: None,
            created_at: now,
            updated_at: now,
        };
        self.by_destination
            .insert(destination.clone(), task.id.clone());
        self.tasks.insert(task.id.clone(), task.clone());
        (task, true)
    }
}

#[derive(Clone)]
pub struct DownloadManager {
    table: Arc<RwLock<TaskTable>>,
    runner: Arc<dyn TaskRunner>,
    fetcher: Arc<dyn Fetcher>,
}

impl DownloadManager {
    pub fn new(runner: Arc<dyn TaskRunner>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            table: Arc::new(RwLock::new(TaskTable::default())),
            runner,
            fetcher,
        }
    }

    /// Bookkeeping only: returns the live task for the key, or registers a new one.
    /// A task registered here is transferred by the first `start_download` for its key.
    pub async fn create_task(&self, destination: DestinationKey, url: &str) -> (DownloadTask, bool) {
        self.table.write().await.claim(&destination, url)
    }

    /// Create (or join) the task for `destination` and run the transfer through the
    /// runner. A joined task still gets `on_complete` invoked when it finishes, and a
    /// joined task that was only registered through `create_task` is dispatched here.
    #[instrument(skip(self, hypervisor, on_complete), fields(destination = %destination))]
    pub async fn start_download(
        &self,
        hypervisor: Arc<dyn HypervisorClient>,
        destination: DestinationKey,
        url: &str,
        on_complete: Option<CompletionCallback>,
    ) -> Result<(DownloadTask, bool)> {
        if hypervisor.node() != destination.node {
            return Err(CloudError::InvalidArgument(format!(
                "destination node {} does not match connection for {}",
                destination.node,
                hypervisor.node()
            )));
        }
        let pool = require_pool(hypervisor.as_ref(), &destination.pool).await?;
        let dest = pool.path.join(&destination.volume);

        let (task, is_new, dispatch) = {
            let mut table = self.table.write().await;
            let (task, is_new) = table.claim(&destination, url);
            if let Some(callback) = on_complete {
                table
                    .callbacks
                    .entry(task.id.clone())
                    .or_default()
                    .push(callback);
            }
            let dispatch = table.dispatched.insert(task.id.clone());
            (task, is_new, dispatch)
        };

        if !dispatch {
            debug!(task_id = %task.id, "Joined in-flight download");
            return Ok((task, is_new));
        }

        info!(task_id = %task.id, url = %task.url, "Starting download");
        let work = self
            .clone()
            .execute(task.id.clone(), hypervisor, task.url.clone(), dest);
        self.runner.run(Box::pin(work));
        Ok((task, is_new))
    }

    async fn execute(
        self,
        task_id: String,
        hypervisor: Arc<dyn HypervisorClient>,
        url: String,
        dest: PathBuf,
    ) {
        if let Err(e) = self
            .update_status(&task_id, DownloadStatus::Running, None)
            .await
        {
            warn!(%task_id, error = %e, "Download task vanished before start");
            return;
        }

        let pool = {
            let table = self.table.read().await;
            table.tasks.get(&task_id).map(|t| t.destination.pool.clone())
        };
        let result = match self.fetcher.fetch(&url, hypervisor.clone(), &dest).await {
            Ok(bytes) => match pool {
                Some(pool) => hypervisor.refresh_pool(&pool).await.map(|_| bytes),
                None => Ok(bytes),
            },
            Err(e) => Err(e),
        };

        let (status, failure) = match result {
            Ok(bytes) => {
                info!(%task_id, bytes, "Download completed");
                self.record_bytes(&task_id, bytes).await;
                (DownloadStatus::Completed, None)
            }
            Err(e) => {
                error!(%task_id, %url, error = %e, "Download failed");
                (DownloadStatus::Failed, Some(Arc::new(e)))
            }
        };

        let (snapshot, callbacks) = {
            let mut table = self.table.write().await;
            let snapshot = table.tasks.get_mut(&task_id).map(|task| {
                task.status = status;
                task.error = failure.as_ref().map(|e| e.to_string());
                task.updated_at = Utc::now();
                task.clone()
            });
            (snapshot, table.callbacks.remove(&task_id).unwrap_or_default())
        };

        let Some(snapshot) = snapshot else {
            return;
        };
        for callback in callbacks {
            callback(snapshot.clone(), failure.clone()).await;
        }
    }

    async fn record_bytes(&self, task_id: &str, bytes: u64) {
        if let Some(task) = self.table.write().await.tasks.get_mut(task_id) {
            task.bytes = Some(bytes);
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.table.read().await.tasks.get(task_id).cloned()
    }

    pub async fn get_task_by_destination(&self, destination: &DestinationKey) -> Option<DownloadTask> {
        let table = self.table.read().await;
        table
            .by_destination
            .get(destination)
            .and_then(|id| table.tasks.get(id))
            .cloned()
    }

    pub async fn update_status(
        &self,
        task_id: &str,
        status: DownloadStatus,
        error: Option<String>,
    ) -> Result<DownloadTask> {
        let mut table = self.table.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CloudError::NotFound(format!("download task {task_id}")))?;
        task.status = status;
        task.error = error;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Drop terminal tasks not updated within `ttl`. Returns how many were removed.
    pub async fn cleanup_older_than(&self, ttl: Duration) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let cutoff = Utc::now() - ttl;

        let mut table = self.table.write().await;
        let expired: Vec<String> = table
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            table.dispatched.remove(id);
            if let Some(task) = table.tasks.remove(id) {
                if table.by_destination.get(&task.destination) == Some(id) {
                    table.by_destination.remove(&task.destination);
                }
            }
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Cleaned up download tasks");
        }
        expired.len()
    }

    pub async fn list_active(&self) -> Vec<DownloadTask> {
        let mut active: Vec<DownloadTask> = self
            .table
            .read()
            .await
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|t| t.created_at);
        active
    }

    pub async fn list_tasks(&self) -> Vec<DownloadTask> {
        let mut tasks: Vec<DownloadTask> = self.table.read().await.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Periodic cleanup on the tokio runtime.
    pub fn spawn_janitor(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.cleanup_older_than(ttl).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFetcher, FakeHypervisor, ManualRunner};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> (DownloadManager, Arc<ManualRunner>) {
        let runner = Arc::new(ManualRunner::new());
        (
            DownloadManager::new(runner.clone(), Arc::new(FakeFetcher::new())),
            runner,
        )
    }

    fn key(volume: &str) -> DestinationKey {
        DestinationKey::new("local", "default", volume)
    }

    #[tokio::test]
    async fn test_create_task_deduplicates_until_terminal() {
        let (manager, _) = manager();

        let (first, is_new) = manager.create_task(key("a.qcow2"), "http://x/a").await;
        assert!(is_new);
        let (second, is_new) = manager.create_task(key("a.qcow2"), "http://x/a").await;
        assert!(!is_new);
        assert_eq!(first.id, second.id);

        manager
            .update_status(&first.id, DownloadStatus::Running, None)
            .await
            .unwrap();
        let (third, is_new) = manager.create_task(key("a.qcow2"), "http://x/a").await;
        assert!(!is_new);
        assert_eq!(third.id, first.id);

        manager
            .update_status(&first.id, DownloadStatus::Failed, Some("boom".into()))
            .await
            .unwrap();
        let (fresh, is_new) = manager.create_task(key("a.qcow2"), "http://x/a").await;
        assert!(is_new);
        assert_ne!(fresh.id, first.id);
        assert!(manager.get_task(&first.id).await.is_none());
        assert_eq!(
            manager.get_task_by_destination(&key("a.qcow2")).await.unwrap().id,
            fresh.id
        );
    }

    #[tokio::test]
    async fn test_returned_tasks_are_copies() {
        let (manager, _) = manager();
        let (mut task, _) = manager.create_task(key("b.qcow2"), "http://x/b").await;
        task.status = DownloadStatus::Completed;
        let stored = manager.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, DownloadStatus::Pending);
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_terminal_tasks() {
        let (manager, _) = manager();
        let (done, _) = manager.create_task(key("done.qcow2"), "http://x/1").await;
        let (pending, _) = manager.create_task(key("pending.qcow2"), "http://x/2").await;
        manager
            .update_status(&done.id, DownloadStatus::Completed, None)
            .await
            .unwrap();

        assert_eq!(manager.cleanup_older_than(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.cleanup_older_than(Duration::from_millis(1)).await, 1);

        assert!(manager.get_task(&done.id).await.is_none());
        assert!(manager.get_task_by_destination(&key("done.qcow2")).await.is_none());
        assert!(manager.get_task(&pending.id).await.is_some());
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test]
    async fn test_registered_task_is_dispatched_by_first_start() {
        let (manager, runner) = manager();
        let hypervisor: Arc<dyn HypervisorClient> = Arc::new(FakeHypervisor::new("local"));
        let finished = Arc::new(AtomicUsize::new(0));
        let on_complete = |finished: Arc<AtomicUsize>| -> CompletionCallback {
            Box::new(move |_task: DownloadTask, _failure: Option<Arc<CloudError>>| {
                async move {
                    finished.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };

        let (registered, is_new) = manager.create_task(key("c.qcow2"), "http://x/c").await;
        assert!(is_new);
        assert_eq!(runner.pending(), 0);

        let (joined, is_new) = manager
            .start_download(
                hypervisor.clone(),
                key("c.qcow2"),
                "http://x/c",
                Some(on_complete(finished.clone())),
            )
            .await
            .unwrap();
        assert!(!is_new);
        assert_eq!(joined.id, registered.id);
        assert_eq!(runner.pending(), 1);

        // Later joiners share the dispatched transfer.
        manager
            .start_download(
                hypervisor,
                key("c.qcow2"),
                "http://x/c",
                Some(on_complete(finished.clone())),
            )
            .await
            .unwrap();
        assert_eq!(runner.pending(), 1);

        runner.run_pending().await;
        let task = manager.get_task(&registered.id).await.unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
        assert!(task.bytes.is_some());
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_janitor_evicts_finished_tasks() {
        let (manager, _) = manager();
        let (done, _) = manager.create_task(key("old.qcow2"), "http://x/old").await;
        manager
            .update_status(&done.id, DownloadStatus::Completed, None)
            .await
            .unwrap();

        let janitor = manager.spawn_janitor(Duration::from_millis(10), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        janitor.abort();

        assert!(manager.get_task(&done.id).await.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_task() {
        let (manager, _) = manager();
        let err = manager
            .update_status("task-missing", DownloadStatus::Running, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_inline_runner_completes_before_returning() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        InlineRunner.run(Box::pin(async move {
            seen.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
    }
}
