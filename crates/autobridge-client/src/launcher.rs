//! Peer process launcher.
//!
//! Starting the peer is an external collaborator: the bridge only needs a
//! pid back and a way to poll until the peer accepts connections.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use autobridge_settings::{AutoLaunchSettings, LaunchMode};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time;
use tracing::{debug, info};

/// Environment variable naming the editor executable when none is configured.
pub const EDITOR_PATH_ENV: &str = "UE_EDITOR_PATH";

/// Executable looked up on `PATH` when nothing else names the editor.
#[cfg(windows)]
pub const DEFAULT_EDITOR_PROGRAM: &str = "UnrealEditor.exe";
/// Executable looked up on `PATH` when nothing else names the editor.
#[cfg(not(windows))]
pub const DEFAULT_EDITOR_PROGRAM: &str = "UnrealEditor";

/// Why launching or waiting for the peer failed.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No project path configured.
    #[error("auto-launch requires a project path")]
    MissingProjectPath,
    /// The process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Executable that failed.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The peer did not become ready in time.
    #[error("peer was not ready within {timeout_ms}ms")]
    NotReady {
        /// Deadline that elapsed.
        timeout_ms: u64,
    },
}

/// What to launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Project file or directory handed to the editor.
    pub project_path: String,
    /// Editor executable. Resolved by [`resolve_editor_program`] when unset.
    pub editor_path: Option<String>,
    /// Editor or standalone game mode.
    pub mode: LaunchMode,
    /// Extra command-line arguments.
    pub additional_args: Vec<String>,
    /// Leave the process running when the launcher is dropped.
    pub detached: bool,
}

impl LaunchOptions {
    /// Build from auto-launch settings. Only the project path is required.
    pub fn from_settings(settings: &AutoLaunchSettings) -> Result<Self, LaunchError> {
        let project_path = settings
            .project_path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(LaunchError::MissingProjectPath)?;
        let editor_path = settings.editor_path.clone().filter(|p| !p.is_empty());
        Ok(Self {
            project_path,
            editor_path,
            mode: settings.mode,
            additional_args: settings.additional_args.clone(),
            detached: settings.detached,
        })
    }

    /// Arguments passed to the editor executable.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.additional_args.len() + 2);
        args.push(self.project_path.clone());
        if self.mode == LaunchMode::Game {
            args.push("-game".to_string());
        }
        args.extend(self.additional_args.iter().cloned());
        args
    }
}

/// Pick the editor executable: the configured path, then
/// [`EDITOR_PATH_ENV`], then [`DEFAULT_EDITOR_PROGRAM`] on `PATH`.
pub fn resolve_editor_program(configured: Option<&str>, from_env: Option<String>) -> String {
    configured
        .map(str::to_owned)
        .or_else(|| from_env.filter(|p| !p.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_EDITOR_PROGRAM.to_string())
}

/// A launched peer process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LaunchedPeer {
    /// Process id, when the platform reports one.
    pub pid: Option<u32>,
}

/// Starts the peer process.
#[async_trait]
pub trait PeerLauncher: Send + Sync + 'static {
    /// Start the peer. Returns once the process is spawned, not once it is ready.
    async fn launch(&self, options: &LaunchOptions) -> Result<LaunchedPeer, LaunchError>;
}

/// Launcher backed by `tokio::process::Command`.
///
/// Attached children are owned by the launcher and killed when it drops.
#[derive(Debug, Default)]
pub struct ProcessLauncher {
    children: Mutex<Vec<Child>>,
}

impl ProcessLauncher {
    /// Create a launcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached children still owned by the launcher.
    pub fn attached_count(&self) -> usize {
        self.children.lock().len()
    }
}

#[async_trait]
impl PeerLauncher for ProcessLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<LaunchedPeer, LaunchError> {
        let program = resolve_editor_program(
            options.editor_path.as_deref(),
            std::env::var(EDITOR_PATH_ENV).ok(),
        );
        let args = options.build_args();
        let mut cmd = Command::new(&program);
        let _ = cmd
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(!options.detached);

        debug!(%program, ?args, detached = options.detached, "spawning peer");

        let child = cmd
            .spawn()
            .map_err(|source| LaunchError::Spawn { program, source })?;
        let pid = child.id();
        info!(?pid, mode = ?options.mode, "peer process launched");

        if !options.detached {
            let mut children = self.children.lock();
            reap_exited(&mut children);
            children.push(child);
        }
        Ok(LaunchedPeer { pid })
    }
}

/// Drop children that have already exited.
fn reap_exited(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            debug!(pid = ?child.id(), %status, "attached peer exited");
            false
        }
        Ok(None) => true,
        Err(e) => {
            debug!(error = %e, "failed to poll attached peer, keeping it");
            true
        }
    });
}

/// Poll `ready` every `poll_interval` until it returns `true`.
///
/// Fails with [`LaunchError::NotReady`] once `timeout` elapses. A poll still
/// in flight at the deadline is cancelled.
pub async fn wait_until_ready<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    mut ready: F,
) -> Result<(), LaunchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let poll = async {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if ready().await {
                debug!(attempt, "peer ready");
                return;
            }
            time::sleep(poll_interval).await;
        }
    };
    time::timeout(timeout, poll).await.map_err(|_| {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u64;
        LaunchError::NotReady { timeout_ms }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn options(mode: LaunchMode) -> LaunchOptions {
        LaunchOptions {
            project_path: "/work/Demo.uproject".into(),
            editor_path: Some("/opt/editor".into()),
            mode,
            additional_args: vec!["-log".into()],
            detached: true,
        }
    }

    #[test]
    fn editor_mode_args() {
        assert_eq!(
            options(LaunchMode::Editor).build_args(),
            vec!["/work/Demo.uproject", "-log"]
        );
    }

    #[test]
    fn game_mode_adds_flag() {
        assert_eq!(
            options(LaunchMode::Game).build_args(),
            vec!["/work/Demo.uproject", "-game", "-log"]
        );
    }

    #[test]
    fn from_settings_requires_project_path_only() {
        let mut settings = AutoLaunchSettings::default();
        assert_matches!(
            LaunchOptions::from_settings(&settings),
            Err(LaunchError::MissingProjectPath)
        );
        settings.project_path = Some("/work/Demo.uproject".into());
        let opts = LaunchOptions::from_settings(&settings).unwrap();
        assert_eq!(opts.editor_path, None);
        assert_eq!(opts.detached, settings.detached);

        settings.editor_path = Some("/opt/editor".into());
        let opts = LaunchOptions::from_settings(&settings).unwrap();
        assert_eq!(opts.editor_path.as_deref(), Some("/opt/editor"));
    }

    #[test]
    fn editor_program_resolution_order() {
        assert_eq!(
            resolve_editor_program(Some("/opt/editor"), Some("/env/editor".into())),
            "/opt/editor"
        );
        assert_eq!(
            resolve_editor_program(None, Some("/env/editor".into())),
            "/env/editor"
        );
        assert_eq!(resolve_editor_program(None, Some("  ".into())), DEFAULT_EDITOR_PROGRAM);
        assert_eq!(resolve_editor_program(None, None), DEFAULT_EDITOR_PROGRAM);
    }

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let launcher = ProcessLauncher::new();
        let mut opts = options(LaunchMode::Editor);
        opts.editor_path = Some("/nonexistent/autobridge-editor".into());
        let err = launcher.launch(&opts).await.unwrap_err();
        assert_matches!(err, LaunchError::Spawn { ref program, .. } if program == "/nonexistent/autobridge-editor");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn attached_children_are_owned() {
        let launcher = ProcessLauncher::new();
        let mut opts = options(LaunchMode::Editor);
        opts.editor_path = Some("true".into());
        opts.detached = false;
        let peer = launcher.launch(&opts).await.unwrap();
        assert!(peer.pid.is_some());
        assert_eq!(launcher.attached_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_children_are_reaped_on_next_launch() {
        let launcher = ProcessLauncher::new();
        let mut opts = options(LaunchMode::Editor);
        opts.editor_path = Some("true".into());
        opts.detached = false;
        let _ = launcher.launch(&opts).await.unwrap();
        loop {
            if launcher.children.lock()[0].try_wait().unwrap().is_some() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }

        opts.editor_path = Some("sleep".into());
        opts.project_path = "5".into();
        opts.additional_args.clear();
        let _ = launcher.launch(&opts).await.unwrap();
        assert_eq!(launcher.attached_count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn detached_children_are_released() {
        let launcher = ProcessLauncher::new();
        let mut opts = options(LaunchMode::Editor);
        opts.editor_path = Some("true".into());
        let _ = launcher.launch(&opts).await.unwrap();
        assert_eq!(launcher.attached_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_polls() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let result = wait_until_ready(Duration::from_secs(10), Duration::from_millis(500), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { n >= 2 }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_ready_times_out() {
        let start = time::Instant::now();
        let result = wait_until_ready(Duration::from_secs(3), Duration::from_millis(500), || async {
            false
        })
        .await;
        assert_matches!(result, Err(LaunchError::NotReady { timeout_ms: 3_000 }));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }
}
