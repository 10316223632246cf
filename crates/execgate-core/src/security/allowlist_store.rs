//! Durable per-agent allowlist.
//!
//! Every mutation is a read-modify-write of the whole approvals file, run
//! inside the per-file [`SerialQueue`] lane and under an advisory lock on
//! `<file>.lock`, then persisted with an atomic rename. Stores built with
//! [`AllowlistStore::new`] share one process-wide queue, so two stores on
//! the same file still take turns in submission order.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;

use crate::error::StoreError;
use crate::models::{
    AllowlistEntry, AllowlistMatch, ApprovalsFile, CommandAnalysis, EffectivePolicy,
};
use crate::security::analyzer;
use crate::security::path_resolver::Platform;
use crate::security::serial_queue::SerialQueue;

static SHARED_QUEUE: LazyLock<SerialQueue> = LazyLock::new(SerialQueue::new);

pub struct AllowlistStore {
    path: PathBuf,
    queue: SerialQueue,
}

impl AllowlistStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_queue(path, SHARED_QUEUE.clone())
    }

    /// Stores sharing a queue serialize against each other in-process.
    /// Use a private queue only for files no other store touches.
    pub fn with_queue(path: impl Into<PathBuf>, queue: SerialQueue) -> Self {
        Self {
            path: path.into(),
            queue,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current file. A missing file is an empty one.
    pub async fn load(&self) -> Result<ApprovalsFile, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_file(&path))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn patterns_for(&self, agent_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.load().await?.patterns_for(agent_id))
    }

    /// Analyzes `command` for `platform` against the policy allowlist plus
    /// this store's patterns for `agent_id`. Read-only.
    pub async fn evaluate(
        &self,
        agent_id: &str,
        command: &str,
        policy: &EffectivePolicy,
        cwd: &Path,
        env: &HashMap<String, String>,
        platform: Platform,
    ) -> Result<CommandAnalysis, StoreError> {
        let mut patterns = policy.allowlist.clone();
        for pattern in self.patterns_for(agent_id).await? {
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        Ok(analyzer::analyze(
            command,
            &patterns,
            &policy.safe_bins,
            cwd,
            env,
            platform,
        ))
    }

    /// Applies `mutate` to a copy of the file and persists it on success.
    /// An error from `mutate` leaves the file untouched.
    pub async fn update<F, T>(&self, mutate: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut ApprovalsFile) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        self.queue
            .run(self.path.clone(), move || async move {
                tokio::task::spawn_blocking(move || commit(&path, mutate))
                    .await
                    .map_err(|e| StoreError::Task(e.to_string()))?
            })
            .await
    }

    /// Adds `pattern` for `agent_id`. Returns `false` when it already existed.
    pub async fn add_entry(&self, agent_id: &str, pattern: &str) -> Result<bool, StoreError> {
        let agent_id = agent_id.to_string();
        let pattern = pattern.trim().to_string();
        if pattern.is_empty() {
            return Err(StoreError::Rejected("empty pattern".to_string()));
        }
        let added = self
            .update(move |file| {
                let agent = file.agents.entry(agent_id).or_default();
                if agent.allowlist.iter().any(|e| e.pattern == pattern) {
                    return Ok(false);
                }
                agent.allowlist.push(AllowlistEntry::new(pattern));
                Ok(true)
            })
            .await?;
        Ok(added)
    }

    /// Bumps usage stats of `pattern`. Matches on the agent first, then the
    /// wildcard agent; unknown patterns are ignored.
    pub async fn record_use(
        &self,
        agent_id: &str,
        pattern: &str,
        command: &str,
        resolved_path: Option<String>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        let pattern = pattern.to_string();
        let command = command.to_string();
        self.update(move |file| {
            for key in [agent_id.as_str(), crate::models::WILDCARD_AGENT] {
                if let Some(entry) = file
                    .agents
                    .get_mut(key)
                    .and_then(|agent| agent.find_mut(&pattern))
                {
                    entry.use_count += 1;
                    entry.last_used_at = Some(Utc::now().timestamp_millis());
                    entry.last_used_command = Some(command);
                    entry.last_resolved_path = resolved_path;
                    return Ok(());
                }
            }
            Ok(())
        })
        .await
    }

    /// Records every allowlist hit of one run. Failures are logged; usage
    /// stats never block execution.
    pub async fn record_matches(&self, agent_id: &str, command: &str, matches: &[AllowlistMatch]) {
        for hit in matches {
            if let Err(e) = self
                .record_use(agent_id, &hit.pattern, command, hit.resolved_path.clone())
                .await
            {
                tracing::warn!(
                    agent_id,
                    pattern = %hit.pattern,
                    error = %e,
                    "Failed to record allowlist use"
                );
            }
        }
    }

    pub async fn remove_entry(&self, agent_id: &str, pattern: &str) -> Result<bool, StoreError> {
        let agent_id = agent_id.to_string();
        let pattern = pattern.to_string();
        self.update(move |file| {
            let Some(agent) = file.agents.get_mut(&agent_id) else {
                return Ok(false);
            };
            let before = agent.allowlist.len();
            agent.allowlist.retain(|e| e.pattern != pattern);
            Ok(agent.allowlist.len() != before)
        })
        .await
    }
}

fn read_file(path: &Path) -> Result<ApprovalsFile, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(ApprovalsFile::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ApprovalsFile::default()),
        Err(err) => Err(err.into()),
    }
}

fn commit<F, T>(path: &Path, mutate: F) -> Result<T, StoreError>
where
    F: FnOnce(&mut ApprovalsFile) -> Result<T, StoreError>,
{
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let _lock = FileLock::acquire(path)?;

    let current = read_file(path)?;
    let mut next = current.clone();
    let output = mutate(&mut next)?;
    next.assign_missing_ids();
    if next != current {
        write_atomic(path, &next)?;
    }
    Ok(output)
}

fn write_atomic(path: &Path, file: &ApprovalsFile) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(file)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Advisory cross-process lock held for one read-modify-write.
struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        use fs2::FileExt;

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = <std::fs::File as fs2::FileExt>::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AllowlistStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AllowlistStore::new(dir.path().join("approvals").join("exec-approvals.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let (_dir, store) = store();
        let file = store.load().await.unwrap();
        assert!(file.agents.is_empty());
        assert!(store.patterns_for("main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_entry_is_idempotent() {
        let (_dir, store) = store();
        assert!(store.add_entry("main", "/usr/bin/git").await.unwrap());
        assert!(!store.add_entry("main", "/usr/bin/git").await.unwrap());
        assert!(store.add_entry("main", "/bin/ls").await.unwrap());

        let file = store.load().await.unwrap();
        assert_eq!(file.entry_count("main"), 2);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_record_use_bumps_stats() {
        let (_dir, store) = store();
        store.add_entry("*", "/bin/ls").await.unwrap();
        store
            .record_use("main", "/bin/ls", "ls /tmp", Some("/bin/ls".into()))
            .await
            .unwrap();
        store
            .record_use("main", "/bin/ls", "ls -la", Some("/bin/ls".into()))
            .await
            .unwrap();

        let file = store.load().await.unwrap();
        let entry = &file.agents["*"].allowlist[0];
        assert_eq!(entry.use_count, 2);
        assert_eq!(entry.last_used_command.as_deref(), Some("ls -la"));
        assert!(entry.last_used_at.is_some());
        assert_eq!(file.entry_count("main"), 0);
    }

    #[tokio::test]
    async fn test_failed_update_commits_nothing() {
        let (_dir, store) = store();
        store.add_entry("main", "/bin/ls").await.unwrap();

        let result: Result<(), StoreError> = store
            .update(|file| {
                file.agents.clear();
                Err(StoreError::Rejected("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.load().await.unwrap().entry_count("main"), 1);
    }

    #[tokio::test]
    async fn test_persisted_json_is_camel_case() {
        let (_dir, store) = store();
        store.add_entry("main", "/bin/ls").await.unwrap();
        store.record_use("main", "/bin/ls", "ls", None).await.unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"useCount\": 1"));
        assert!(raw.contains("\"lastUsedAt\""));
        assert!(raw.contains("\"version\": 1"));
    }

    #[tokio::test]
    async fn test_remove_entry() {
        let (_dir, store) = store();
        store.add_entry("main", "/bin/ls").await.unwrap();
        assert!(store.remove_entry("main", "/bin/ls").await.unwrap());
        assert!(!store.remove_entry("main", "/bin/ls").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load().await, Err(StoreError::Json(_))));
        assert!(store.add_entry("main", "/bin/ls").await.is_err());
    }

    #[tokio::test]
    async fn test_stores_on_one_file_take_turns() {
        let (_dir, first) = store();
        let second = AllowlistStore::new(first.path());

        let push = |pattern: &'static str| {
            move |file: &mut ApprovalsFile| {
                file.agents
                    .entry("main".to_string())
                    .or_default()
                    .allowlist
                    .push(AllowlistEntry::new(pattern));
                Ok::<_, StoreError>(file.patterns_for("main"))
            }
        };
        let (a, b, c) = tokio::join!(
            first.update(push("/bin/a")),
            second.update(push("/bin/b")),
            first.update(push("/bin/c")),
        );
        assert_eq!(a.unwrap(), vec!["/bin/a"]);
        assert_eq!(b.unwrap(), vec!["/bin/a", "/bin/b"]);
        assert_eq!(c.unwrap(), vec!["/bin/a", "/bin/b", "/bin/c"]);
    }

    #[tokio::test]
    async fn test_entry_ids_are_stable_once_committed() {
        let (_dir, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"version":1,"agents":{"main":{"allowlist":[{"pattern":"/bin/ls"}]}}}"#,
        )
        .unwrap();

        let unassigned = store.load().await.unwrap();
        assert!(unassigned.agents["main"].allowlist[0].id.is_empty());

        store.add_entry("main", "/bin/cat").await.unwrap();
        let first = store.load().await.unwrap();
        let id = first.agents["main"].allowlist[0].id.clone();
        assert!(!id.is_empty());

        store.add_entry("main", "/bin/echo").await.unwrap();
        let second = store.load().await.unwrap();
        assert_eq!(second.agents["main"].allowlist[0].id, id);
        assert_eq!(store.load().await.unwrap().agents["main"].allowlist[0].id, id);
    }

    #[cfg(unix)]
    fn policy(allowlist: Vec<String>) -> EffectivePolicy {
        let mut policy = crate::security::policy::resolve(&[]);
        policy.allowlist = allowlist;
        policy.safe_bins.clear();
        policy
    }

    #[cfg(unix)]
    fn on_path(bin: &str) -> String {
        which::which(bin).unwrap().display().to_string()
    }

    #[cfg(unix)]
    async fn evaluate_pipeline(
        store: &AllowlistStore,
        agent_id: &str,
        policy: &EffectivePolicy,
        cwd: &Path,
    ) -> CommandAnalysis {
        store
            .evaluate(agent_id, "ls | cat", policy, cwd, &HashMap::new(), Platform::current())
            .await
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_evaluate_merges_store_and_policy_patterns() {
        let (dir, store) = store();
        let policy = policy(vec![on_path("ls")]);

        let analysis = evaluate_pipeline(&store, "main", &policy, dir.path()).await;
        assert!(!analysis.allowlist_satisfied);
        assert!(!store.path().exists());

        store.add_entry("main", &on_path("cat")).await.unwrap();
        let analysis = evaluate_pipeline(&store, "main", &policy, dir.path()).await;
        assert!(analysis.allowlist_satisfied);
        let patterns: Vec<&str> = analysis
            .allowlist_matches
            .iter()
            .map(|m| m.pattern.as_str())
            .collect();
        assert!(patterns.contains(&on_path("ls").as_str()));
        assert!(patterns.contains(&on_path("cat").as_str()));

        let analysis = evaluate_pipeline(&store, "ops", &policy, dir.path()).await;
        assert!(!analysis.allowlist_satisfied);
        store.add_entry("*", &on_path("cat")).await.unwrap();
        let analysis = evaluate_pipeline(&store, "ops", &policy, dir.path()).await;
        assert!(analysis.allowlist_satisfied);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_evaluate_leaves_file_untouched() {
        let (dir, store) = store();
        store.add_entry("main", &on_path("ls")).await.unwrap();
        let before = std::fs::read_to_string(store.path()).unwrap();

        let analysis = store
            .evaluate(
                "main",
                "ls",
                &policy(Vec::new()),
                dir.path(),
                &HashMap::new(),
                Platform::current(),
            )
            .await
            .unwrap();
        assert!(analysis.allowlist_satisfied);
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), before);
    }
}
