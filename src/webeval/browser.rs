//! Browser session management.
//!
//! The underlying browser-automation library is not thread-safe: every call
//! that touches the environment handle must run on the same OS thread. This
//! module confines all environment work to a single dedicated "browser
//! thread" with an inbox of jobs; public operations are thin submit-and-wait
//! wrappers that hand a closure to the thread and await its completion over
//! a oneshot channel. The environment handle never leaves the thread.
//!
//! The manager also tracks every process spawned under this process during
//! environment creation so that cleanup can terminate the whole tree
//! (children first, SIGTERM then SIGKILL after a short grace) and report
//! orphans.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::error::Error;
//! use std::path::PathBuf;
//! use webeval::actions::Action;
//! use webeval::browser::{
//!     BrowserBackend, BrowserEnv, EnvironmentConfig, SessionManager, StepOutcome,
//! };
//! use webeval::observation::RawObservation;
//! use webeval::profiles::BenchmarkProfileRegistry;
//!
//! struct MyEnv;
//!
//! impl BrowserEnv for MyEnv {
//!     fn step(&mut self, _action: &Action) -> Result<StepOutcome, Box<dyn Error + Send + Sync>> {
//!         todo!("drive the real automation library")
//!     }
//!     fn observe(&mut self) -> Result<RawObservation, Box<dyn Error + Send + Sync>> {
//!         todo!()
//!     }
//!     fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyBackend;
//!
//! impl BrowserBackend for MyBackend {
//!     fn create(
//!         &mut self,
//!         _config: &EnvironmentConfig,
//!     ) -> Result<(Box<dyn BrowserEnv>, RawObservation), Box<dyn Error + Send + Sync>> {
//!         Ok((Box::new(MyEnv), RawObservation::default()))
//!     }
//! }
//!
//! # async {
//! let registry = BenchmarkProfileRegistry::new();
//! let manager = SessionManager::new(Box::new(MyBackend), PathBuf::from("datasets"), true)?;
//!
//! let profile = registry.get("webarena").unwrap();
//! let session = manager.create_session(profile, "webarena.nav-1", 10, None).await?;
//! println!("goal: {}", session.initial_observation.goal);
//!
//! let outcome = manager.step(Action::Click { bid: "13".to_string() }).await?;
//! println!("reward: {}", outcome.reward);
//!
//! let report = manager.cleanup().await?;
//! println!("cleanup: {}", report.status.as_str());
//! # Ok::<(), webeval::EvalError>(())
//! # };
//! ```

use chrono::Utc;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::webeval::actions::Action;
use crate::webeval::error::EvalError;
use crate::webeval::observation::RawObservation;
use crate::webeval::profiles::BenchmarkProfile;

/// Grace period between SIGTERM and SIGKILL during tree teardown.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Outcome of a single environment step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub observation: RawObservation,
    pub reward: f64,
    pub done: bool,
    pub truncated: bool,
    /// Explicit success flag, for environments that report one.
    pub task_success: Option<bool>,
}

/// Configuration for environment creation.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub task_id: String,
    pub benchmark: String,
    pub max_steps: u32,
    pub headless: bool,
    pub seed: Option<u64>,
}

/// A live browser environment. Implementations are **not** `Send`; they are
/// created and driven exclusively on the browser thread.
pub trait BrowserEnv {
    /// Execute one action against the environment.
    fn step(&mut self, action: &Action) -> Result<StepOutcome, Box<dyn Error + Send + Sync>>;

    /// Read the current observation without advancing the environment.
    fn observe(&mut self) -> Result<RawObservation, Box<dyn Error + Send + Sync>>;

    /// Close the environment and release browser resources.
    fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Factory for browser environments, moved onto the browser thread at
/// startup. Dataset resolution and process spawning happen inside `create`.
pub trait BrowserBackend: Send {
    /// Create an environment for the task and return it together with the
    /// initial observation.
    fn create(
        &mut self,
        config: &EnvironmentConfig,
    ) -> Result<(Box<dyn BrowserEnv>, RawObservation), Box<dyn Error + Send + Sync>>;
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    CleanupRequested,
    Cleaned,
}

/// One executed action in the session history.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action: Action,
    pub timestamp: String,
}

/// Per-task session metadata. The environment handle itself lives on the
/// browser thread; this is the `Send` view the rest of the process sees.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub task_id: String,
    pub benchmark: String,
    pub state: SessionState,
    pub action_history: Vec<ActionRecord>,
    pub browser_pids: Vec<u32>,
    pub initial_observation: RawObservation,
}

/// Cleanup outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStatus {
    Success,
    /// Primary close failed but the fallback teardown released the session.
    FallbackSuccess,
    Failed,
}

impl CleanupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStatus::Success => "success",
            CleanupStatus::FallbackSuccess => "fallback_success",
            CleanupStatus::Failed => "failed",
        }
    }
}

/// Report returned by [`SessionManager::cleanup`].
#[derive(Debug, Clone)]
pub struct CleanupReport {
    pub status: CleanupStatus,
    pub killed_process_ids: Vec<u32>,
    pub orphaned_count: usize,
}

impl CleanupReport {
    fn empty(status: CleanupStatus) -> Self {
        Self {
            status,
            killed_process_ids: Vec::new(),
            orphaned_count: 0,
        }
    }
}

struct WorkerState {
    backend: Box<dyn BrowserBackend>,
    env: Option<Box<dyn BrowserEnv>>,
}

type Job = Box<dyn FnOnce(&mut WorkerState) + Send + 'static>;

/// Handle to the dedicated browser thread.
struct BrowserThread {
    tx: mpsc::Sender<Job>,
}

impl BrowserThread {
    fn spawn(backend: Box<dyn BrowserBackend>) -> Result<Self, EvalError> {
        let (tx, rx) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name("browser".to_string())
            .spawn(move || {
                let mut state = WorkerState { backend, env: None };
                while let Ok(job) = rx.recv() {
                    job(&mut state);
                }
                // Inbox closed: the manager is gone, release any environment.
                if let Some(mut env) = state.env.take() {
                    if let Err(e) = env.close() {
                        log::warn!("browser thread shutdown close failed: {}", e);
                    }
                }
            })
            .map_err(|e| EvalError::Environment(format!("failed to spawn browser thread: {}", e)))?;
        Ok(Self { tx })
    }

    /// Run a closure on the browser thread and await its result.
    async fn submit<T, F>(&self, job: F) -> Result<T, EvalError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerState) -> T + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Box::new(move |state| {
                let _ = done_tx.send(job(state));
            }))
            .map_err(|_| EvalError::Environment("browser thread is gone".to_string()))?;
        done_rx
            .await
            .map_err(|_| EvalError::Environment("browser thread dropped the job".to_string()))
    }
}

/// Creates, drives, and tears down browser environments, one task at a time.
pub struct SessionManager {
    thread: BrowserThread,
    current: Mutex<Option<Session>>,
    dataset_root: PathBuf,
    headless: bool,
}

impl SessionManager {
    /// Start the manager and its browser thread.
    pub fn new(
        backend: Box<dyn BrowserBackend>,
        dataset_root: PathBuf,
        headless: bool,
    ) -> Result<Self, EvalError> {
        Ok(Self {
            thread: BrowserThread::spawn(backend)?,
            current: Mutex::new(None),
            dataset_root,
            headless,
        })
    }

    /// Create a session for the task. The previous session, if any, must be
    /// in the Cleaned state; at most one session is Active at a time.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let profile = registry.get("miniwob").unwrap();
    /// let session = manager.create_session(profile, "miniwob.click-test", 10, None).await?;
    /// assert_eq!(session.benchmark, "miniwob");
    /// ```
    pub async fn create_session(
        &self,
        profile: &BenchmarkProfile,
        task_id: &str,
        max_steps: u32,
        seed: Option<u64>,
    ) -> Result<Session, EvalError> {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            if session.state != SessionState::Cleaned {
                return Err(EvalError::Environment(format!(
                    "previous session {} is not cleaned up",
                    session.session_id
                )));
            }
        }

        resolve_dataset_env(profile, &self.dataset_root)?;

        let config = EnvironmentConfig {
            task_id: task_id.to_string(),
            benchmark: profile.benchmark_id.clone(),
            max_steps,
            headless: self.headless,
            seed,
        };

        let before = descendant_pids();
        let config_for_job = config.clone();
        let initial_observation = self
            .thread
            .submit(move |state| match state.backend.create(&config_for_job) {
                Ok((env, observation)) => {
                    state.env = Some(env);
                    Ok(observation)
                }
                Err(e) => Err(e.to_string()),
            })
            .await?
            .map_err(EvalError::Environment)?;
        let after = descendant_pids();
        let browser_pids: Vec<u32> = after.into_iter().filter(|pid| !before.contains(pid)).collect();

        log::info!(
            "created session for {} ({} spawned processes tracked)",
            task_id,
            browser_pids.len()
        );

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            benchmark: profile.benchmark_id.clone(),
            state: SessionState::Active,
            action_history: Vec::new(),
            browser_pids,
            initial_observation,
        };
        *current = Some(session.clone());
        Ok(session)
    }

    /// Execute one action on the active session's environment.
    pub async fn step(&self, action: Action) -> Result<StepOutcome, EvalError> {
        {
            let mut current = self.current.lock().await;
            let session = current
                .as_mut()
                .filter(|s| s.state == SessionState::Active)
                .ok_or_else(|| EvalError::Environment("no active session".to_string()))?;
            session.action_history.push(ActionRecord {
                action: action.clone(),
                timestamp: Utc::now().to_rfc3339(),
            });
        }

        self.thread
            .submit(move |state| match state.env.as_mut() {
                Some(env) => env.step(&action).map_err(|e| e.to_string()),
                None => Err("no environment on browser thread".to_string()),
            })
            .await?
            .map_err(EvalError::Environment)
    }

    /// Read the current observation from the active session's environment.
    pub async fn observe(&self) -> Result<RawObservation, EvalError> {
        if !self.has_active_session().await {
            return Err(EvalError::Environment("no active session".to_string()));
        }
        self.thread
            .submit(|state| match state.env.as_mut() {
                Some(env) => env.observe().map_err(|e| e.to_string()),
                None => Err("no environment on browser thread".to_string()),
            })
            .await?
            .map_err(EvalError::Environment)
    }

    /// Snapshot of the current session metadata.
    pub async fn current_session(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }

    /// Whether a session is currently Active.
    pub async fn has_active_session(&self) -> bool {
        matches!(
            self.current.lock().await.as_ref().map(|s| s.state),
            Some(SessionState::Active)
        )
    }

    /// Tear down the active session: close the environment, terminate the
    /// recorded process tree, and report orphans. Idempotent — a second call
    /// succeeds with nothing killed.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let report = manager.cleanup().await?;
    /// assert_eq!(report.status.as_str(), "success");
    /// // A second call is a no-op that still reports success.
    /// assert!(manager.cleanup().await?.killed_process_ids.is_empty());
    /// ```
    pub async fn cleanup(&self) -> Result<CleanupReport, EvalError> {
        let (session_id, pids) = {
            let mut current = self.current.lock().await;
            match current.as_mut() {
                None => return Ok(CleanupReport::empty(CleanupStatus::Success)),
                Some(session) if session.state == SessionState::Cleaned => {
                    return Ok(CleanupReport::empty(CleanupStatus::Success));
                }
                Some(session) => {
                    session.state = SessionState::CleanupRequested;
                    (session.session_id.clone(), session.browser_pids.clone())
                }
            }
        };

        let close_result = self
            .thread
            .submit(|state| match state.env.take() {
                Some(mut env) => env.close().map_err(|e| e.to_string()),
                None => Ok(()),
            })
            .await;

        let status = match close_result {
            Ok(Ok(())) => CleanupStatus::Success,
            Ok(Err(e)) => {
                // The handle is already dropped; the process sweep below is
                // the fallback path.
                log::warn!("session {} close failed: {}", session_id, e);
                CleanupStatus::FallbackSuccess
            }
            Err(e) => {
                log::error!("session {} cleanup could not reach browser thread: {}", session_id, e);
                CleanupStatus::Failed
            }
        };

        let (killed, orphaned) = kill_process_tree(&pids).await;
        if orphaned > 0 {
            log::warn!("session {} cleanup left {} orphaned processes", session_id, orphaned);
        }

        {
            let mut current = self.current.lock().await;
            if let Some(session) = current.as_mut() {
                session.state = SessionState::Cleaned;
                session.browser_pids.clear();
            }
        }

        Ok(CleanupReport {
            status,
            killed_process_ids: killed,
            orphaned_count: orphaned,
        })
    }
}

/// Point the benchmark's conventional environment variable at a `file://`
/// URL for the first existing candidate path under the dataset root. A
/// no-op for remote-dataset benchmarks.
fn resolve_dataset_env(profile: &BenchmarkProfile, dataset_root: &Path) -> Result<(), EvalError> {
    let candidates = match &profile.dataset.candidate_paths {
        Some(paths) => paths,
        None => return Ok(()),
    };

    for relative in candidates {
        let candidate = dataset_root.join(relative);
        if candidate.exists() {
            let absolute = candidate
                .canonicalize()
                .map_err(|e| EvalError::Environment(format!("dataset path {:?}: {}", candidate, e)))?;
            let url = format!("file://{}/", absolute.display());
            std::env::set_var(profile.dataset.env_var, &url);
            log::info!("resolved {}={}", profile.dataset.env_var, url);
            return Ok(());
        }
    }

    Err(EvalError::Environment(format!(
        "no dataset found for {} under {:?} (tried {:?})",
        profile.benchmark_id, dataset_root, candidates
    )))
}

/// All live descendant pids of the current process.
fn descendant_pids() -> Vec<u32> {
    let own_pid = match sysinfo::get_current_pid() {
        Ok(pid) => pid,
        Err(_) => return Vec::new(),
    };
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut descendants: Vec<u32> = Vec::new();
    let mut frontier = vec![own_pid];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent) {
                descendants.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    descendants.sort_unstable();
    descendants
}

/// Terminate the recorded process tree: current descendants of each recorded
/// pid first, then the recorded pids themselves, SIGTERM then SIGKILL after
/// a short grace. Returns the killed pids and the number of survivors.
async fn kill_process_tree(pids: &[u32]) -> (Vec<u32>, usize) {
    if pids.is_empty() {
        return (Vec::new(), 0);
    }

    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    // Children before parents so browsers cannot respawn helpers mid-sweep.
    let mut targets: Vec<u32> = Vec::new();
    for &root in pids {
        let root_pid = Pid::from_u32(root);
        let mut frontier = vec![root_pid];
        let mut subtree = Vec::new();
        while let Some(parent) = frontier.pop() {
            for (pid, process) in sys.processes() {
                if process.parent() == Some(parent) {
                    subtree.push(pid.as_u32());
                    frontier.push(*pid);
                }
            }
        }
        subtree.reverse();
        targets.extend(subtree);
        targets.push(root);
    }
    targets.dedup();

    for &pid in &targets {
        if let Some(process) = sys.process(Pid::from_u32(pid)) {
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
        }
    }

    tokio::time::sleep(KILL_GRACE).await;
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut killed = Vec::new();
    let mut orphaned = 0;
    for &pid in &targets {
        match sys.process(Pid::from_u32(pid)) {
            Some(process) => {
                if process.kill() {
                    killed.push(pid);
                } else {
                    orphaned += 1;
                }
            }
            None => killed.push(pid),
        }
    }
    (killed, orphaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webeval::profiles::BenchmarkProfileRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedEnv {
        rewards: Vec<f64>,
        step_index: usize,
        closes: Arc<AtomicUsize>,
    }

    impl BrowserEnv for ScriptedEnv {
        fn step(&mut self, _action: &Action) -> Result<StepOutcome, Box<dyn Error + Send + Sync>> {
            let reward = self.rewards.get(self.step_index).copied().unwrap_or(0.0);
            self.step_index += 1;
            Ok(StepOutcome {
                observation: RawObservation {
                    axtree_txt: format!("[1] RootWebArea 'step {}'", self.step_index),
                    ..RawObservation::default()
                },
                reward,
                done: reward > 0.0,
                truncated: false,
                task_success: None,
            })
        }

        fn observe(&mut self) -> Result<RawObservation, Box<dyn Error + Send + Sync>> {
            Ok(RawObservation {
                axtree_txt: format!("[1] RootWebArea 'after step {}'", self.step_index),
                ..RawObservation::default()
            })
        }

        fn close(&mut self) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedBackend {
        rewards: Vec<f64>,
        closes: Arc<AtomicUsize>,
    }

    impl BrowserBackend for ScriptedBackend {
        fn create(
            &mut self,
            config: &EnvironmentConfig,
        ) -> Result<(Box<dyn BrowserEnv>, RawObservation), Box<dyn Error + Send + Sync>> {
            let env = ScriptedEnv {
                rewards: self.rewards.clone(),
                step_index: 0,
                closes: self.closes.clone(),
            };
            let observation = RawObservation {
                axtree_txt: "[1] RootWebArea 'initial'".to_string(),
                goal: format!("goal for {}", config.task_id),
                ..RawObservation::default()
            };
            Ok((Box::new(env), observation))
        }
    }

    fn manager(rewards: Vec<f64>, closes: Arc<AtomicUsize>) -> SessionManager {
        SessionManager::new(
            Box::new(ScriptedBackend { rewards, closes }),
            PathBuf::from("/nonexistent-dataset-root"),
            true,
        )
        .unwrap()
    }

    fn remote_profile() -> BenchmarkProfile {
        BenchmarkProfileRegistry::new().get("webarena").unwrap().clone()
    }

    #[tokio::test]
    async fn test_create_session_returns_initial_observation() {
        let manager = manager(vec![1.0], Arc::new(AtomicUsize::new(0)));
        let session = manager
            .create_session(&remote_profile(), "webarena.nav-1", 10, None)
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Active);
        assert!(session.initial_observation.goal.contains("webarena.nav-1"));
        assert!(manager.has_active_session().await);
    }

    #[tokio::test]
    async fn test_second_session_requires_cleanup() {
        let manager = manager(vec![], Arc::new(AtomicUsize::new(0)));
        manager
            .create_session(&remote_profile(), "webarena.nav-1", 10, None)
            .await
            .unwrap();
        let err = manager
            .create_session(&remote_profile(), "webarena.nav-2", 10, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "environment_error");

        manager.cleanup().await.unwrap();
        manager
            .create_session(&remote_profile(), "webarena.nav-2", 10, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_step_records_history() {
        let manager = manager(vec![0.0, 1.0], Arc::new(AtomicUsize::new(0)));
        manager
            .create_session(&remote_profile(), "webarena.nav-1", 10, None)
            .await
            .unwrap();

        let first = manager.step(Action::Click { bid: "13".into() }).await.unwrap();
        assert!(!first.done);
        let second = manager.step(Action::Click { bid: "13".into() }).await.unwrap();
        assert!(second.done);
        assert_eq!(second.reward, 1.0);

        let session = manager.current_session().await.unwrap();
        assert_eq!(session.action_history.len(), 2);
        assert_eq!(session.action_history[0].action.tag(), "click");
    }

    #[tokio::test]
    async fn test_step_without_session_fails() {
        let manager = manager(vec![], Arc::new(AtomicUsize::new(0)));
        let err = manager.step(Action::NewTab).await.unwrap_err();
        assert_eq!(err.kind(), "environment_error");
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let manager = manager(vec![], closes.clone());
        manager
            .create_session(&remote_profile(), "webarena.nav-1", 10, None)
            .await
            .unwrap();

        let first = manager.cleanup().await.unwrap();
        assert_eq!(first.status, CleanupStatus::Success);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let second = manager.cleanup().await.unwrap();
        assert_eq!(second.status, CleanupStatus::Success);
        assert!(second.killed_process_ids.is_empty());
        assert_eq!(closes.load(Ordering::SeqCst), 1, "close runs exactly once");
    }

    #[tokio::test]
    async fn test_cleanup_without_session_is_success() {
        let manager = manager(vec![], Arc::new(AtomicUsize::new(0)));
        let report = manager.cleanup().await.unwrap();
        assert_eq!(report.status, CleanupStatus::Success);
        assert_eq!(report.orphaned_count, 0);
    }

    #[tokio::test]
    async fn test_local_dataset_resolution_failure_is_environment_error() {
        let manager = manager(vec![], Arc::new(AtomicUsize::new(0)));
        let registry = BenchmarkProfileRegistry::new();
        let miniwob = registry.get("miniwob").unwrap().clone();
        // The dataset root does not exist, so resolution must fail loudly.
        let err = manager
            .create_session(&miniwob, "miniwob.click-test", 10, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "environment_error");
        assert!(err.to_string().contains("miniwob"));
    }
}
