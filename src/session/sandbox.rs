//! Isolated test execution: sandbox contracts, the timeout-bounded lifecycle
//! and a child-process sandbox.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::compile::Artifact;

/// Id of the mutant to activate, unset for unmutated runs.
pub const ENV_ACTIVE_MUTANT: &str = "MUTANT_PLAYGROUND_ACTIVE_MUTANT";
/// `1` when the test suite may stop at the first failure.
pub const ENV_STOP_ON_ERROR: &str = "MUTANT_PLAYGROUND_STOP_ON_ERROR";

const SANDBOX_ARTIFACT_FILE: &str = "test-artifact";

/// Outcome of one test suite execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    /// Every test passed.
    Passed,
    /// At least one test failed.
    Failed,
    /// The run did not finish in time.
    Timeout,
}

/// Result of one sandbox invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    /// Overall status.
    pub status: TestRunStatus,
    /// Short human-readable summary.
    pub message: String,
    /// Captured output lines, in order.
    pub output: Vec<String>,
}

impl TestRunResult {
    /// Passing run.
    pub fn passed(message: impl Into<String>) -> Self {
        Self {
            status: TestRunStatus::Passed,
            message: message.into(),
            output: Vec::new(),
        }
    }

    /// Failing run.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TestRunStatus::Failed,
            message: message.into(),
            output: Vec::new(),
        }
    }

    /// Synthetic result for a run abandoned after `limit`.
    pub fn timed_out(limit: Duration) -> Self {
        Self {
            status: TestRunStatus::Timeout,
            message: format!("Test run did not finish within {} ms", limit.as_millis()),
            output: Vec::new(),
        }
    }

    /// Attach output lines.
    pub fn with_output(mut self, output: Vec<String>) -> Self {
        self.output = output;
        self
    }

    /// Transcript line describing the run.
    pub fn result_message(&self) -> String {
        let verdict = match self.status {
            TestRunStatus::Passed => "Test run passed",
            TestRunStatus::Failed => "Test run failed",
            TestRunStatus::Timeout => "Test run timed out",
        };
        if self.message.is_empty() {
            verdict.to_string()
        } else {
            format!("{verdict}: {}", self.message)
        }
    }
}

/// Parameters of one sandbox invocation.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    /// Artifact to run.
    pub artifact: &'a Artifact,
    /// Mutant to activate.
    pub active_mutant: Option<u32>,
    /// Allow the suite to stop at the first failing test.
    pub stop_on_error: bool,
}

/// Sandbox infrastructure errors.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No execution context could be provided.
    #[error("unable to acquire sandbox: {0}")]
    Acquire(String),
    /// The execution context failed outside of the tests themselves.
    #[error("sandbox execution failed: {0}")]
    Execute(String),
    /// The handle was used after release.
    #[error("sandbox was already released")]
    Released,
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One disposable execution context.
pub trait Sandbox {
    /// Run the artifact's test suite. May suspend for an arbitrary time and
    /// must tolerate being dropped mid-flight.
    fn execute(
        &mut self,
        request: ExecutionRequest<'_>,
    ) -> impl Future<Output = Result<TestRunResult, SandboxError>> + Send;

    /// Tear the context down. Idempotent.
    fn release(&mut self) -> impl Future<Output = ()> + Send;
}

/// Source of fresh sandboxes. Every call must return an isolated context.
pub trait SandboxProvider {
    /// Sandbox type handed out.
    type Sandbox: Sandbox + Send;

    /// Provide a new execution context.
    fn acquire(&self) -> impl Future<Output = Result<Self::Sandbox, SandboxError>> + Send;
}

/// How an isolated run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolatedRun {
    /// The run finished or timed out.
    Finished(TestRunResult),
    /// The session was cancelled first.
    Cancelled,
}

/// Acquire a fresh sandbox, execute once and release it.
///
/// The execution is raced against `limit` and `cancel`. A losing execution is
/// dropped, not awaited. The sandbox is released on every path after a
/// successful acquire and is never reused.
pub async fn run_isolated<P>(
    provider: &P,
    request: ExecutionRequest<'_>,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<IsolatedRun, SandboxError>
where
    P: SandboxProvider,
{
    let mut sandbox = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(IsolatedRun::Cancelled),
        acquired = provider.acquire() => acquired?,
    };

    let outcome = {
        let execution = bounded(sandbox.execute(request), limit);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = execution => Some(result),
        }
    };

    sandbox.release().await;

    match outcome {
        None => Ok(IsolatedRun::Cancelled),
        Some(result) => result.map(IsolatedRun::Finished),
    }
}

async fn bounded<F>(execution: F, limit: Option<Duration>) -> Result<TestRunResult, SandboxError>
where
    F: Future<Output = Result<TestRunResult, SandboxError>>,
{
    let Some(limit) = limit else {
        return execution.await;
    };
    match tokio::time::timeout(limit, execution).await {
        Ok(result) => result,
        Err(_) => {
            debug!(limit_ms = limit.as_millis() as u64, "test run abandoned after timeout");
            Ok(TestRunResult::timed_out(limit))
        }
    }
}

/// Hands out child-process sandboxes, each in its own scratch directory.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandboxProvider {
    launcher: Option<String>,
    envs: Vec<(String, String)>,
}

impl ProcessSandboxProvider {
    /// Execute artifacts directly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run artifacts through a launcher, e.g. `sh` for script artifacts.
    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = Some(launcher.into());
        self
    }

    /// Extra environment variable for every test run.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl SandboxProvider for ProcessSandboxProvider {
    type Sandbox = ProcessSandbox;

    async fn acquire(&self) -> Result<ProcessSandbox, SandboxError> {
        let dir = tempfile::Builder::new()
            .prefix("mutant-playground-sandbox-")
            .tempdir()
            .map_err(|err| SandboxError::Acquire(err.to_string()))?;
        Ok(ProcessSandbox {
            dir: Some(dir),
            launcher: self.launcher.clone(),
            envs: self.envs.clone(),
            group: None,
        })
    }
}

/// A scratch directory plus at most one running test process group.
///
/// The group is killed when the run finishes or its execution future is
/// dropped, so an abandoned run cannot outlive its sandbox.
#[derive(Debug)]
pub struct ProcessSandbox {
    dir: Option<TempDir>,
    launcher: Option<String>,
    envs: Vec<(String, String)>,
    group: Option<u32>,
}

/// Process group of one test run. Killed with `SIGKILL` when dropped, so
/// an abandoned run takes every process it started down with it.
struct ProcessGroup(Option<u32>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, error = %err, "failed to kill test process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(err) = pipe.read_to_end(&mut buf).await {
            debug!(error = %err, "test output pipe closed early");
        }
    }
    buf
}

impl ProcessSandbox {
    async fn write_artifact(path: &Path, artifact: &Artifact) -> Result<(), SandboxError> {
        tokio::fs::write(path, artifact.as_bytes()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        Ok(())
    }
}

impl Sandbox for ProcessSandbox {
    async fn execute(&mut self, request: ExecutionRequest<'_>) -> Result<TestRunResult, SandboxError> {
        let dir = self
            .dir
            .as_ref()
            .ok_or(SandboxError::Released)?
            .path()
            .to_path_buf();
        let artifact_path = dir.join(SANDBOX_ARTIFACT_FILE);
        Self::write_artifact(&artifact_path, request.artifact).await?;

        let mut command = match &self.launcher {
            Some(launcher) => {
                let mut command = Command::new(launcher);
                command.arg(&artifact_path);
                command
            }
            None => Command::new(&artifact_path),
        };
        command
            .current_dir(&dir)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(ENV_STOP_ON_ERROR, if request.stop_on_error { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(id) = request.active_mutant {
            command.env(ENV_ACTIVE_MUTANT, id.to_string());
        } else {
            command.env_remove(ENV_ACTIVE_MUTANT);
        }

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|err| SandboxError::Execute(format!("failed to start test artifact: {err}")))?;
        // The child leads its own process group, so its pid is the group id.
        let mut group = ProcessGroup(child.id());
        self.group = group.0;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, stdout, stderr) = tokio::join!(
            async {
                let status = child.wait().await;
                // Background processes left by the suite must not outlive the run.
                group.kill();
                status
            },
            read_pipe(stdout),
            read_pipe(stderr),
        );
        self.group = None;
        let status = status
            .map_err(|err| SandboxError::Execute(format!("failed to wait for test artifact: {err}")))?;

        let lines: Vec<String> = String::from_utf8_lossy(&stdout)
            .lines()
            .chain(String::from_utf8_lossy(&stderr).lines())
            .map(str::to_string)
            .collect();

        let result = match status.code() {
            Some(0) => TestRunResult::passed("all tests passed"),
            Some(code) => TestRunResult::failed(format!("test artifact exited with code {code}")),
            None => TestRunResult::failed("test artifact was terminated by a signal"),
        };
        Ok(result.with_output(lines))
    }

    async fn release(&mut self) {
        // Set only when an execution was abandoned mid-run.
        ProcessGroup(self.group.take()).kill();
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                warn!(error = %err, "failed to remove sandbox directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counters {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    struct ScriptedProvider {
        counters: Arc<Counters>,
        delay: Duration,
        result: TestRunResult,
    }

    struct ScriptedSandbox {
        counters: Arc<Counters>,
        delay: Duration,
        result: TestRunResult,
        released: bool,
    }

    impl SandboxProvider for ScriptedProvider {
        type Sandbox = ScriptedSandbox;

        async fn acquire(&self) -> Result<ScriptedSandbox, SandboxError> {
            self.counters.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedSandbox {
                counters: Arc::clone(&self.counters),
                delay: self.delay,
                result: self.result.clone(),
                released: false,
            })
        }
    }

    impl Sandbox for ScriptedSandbox {
        async fn execute(
            &mut self,
            _request: ExecutionRequest<'_>,
        ) -> Result<TestRunResult, SandboxError> {
            tokio::time::sleep(self.delay).await;
            Ok(self.result.clone())
        }

        async fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.counters.released.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn provider(delay: Duration, result: TestRunResult) -> ScriptedProvider {
        ScriptedProvider {
            counters: Arc::new(Counters::default()),
            delay,
            result,
        }
    }

    fn request(artifact: &Artifact) -> ExecutionRequest<'_> {
        ExecutionRequest {
            artifact,
            active_mutant: Some(1),
            stop_on_error: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_run_is_always_a_timeout() {
        let artifact = Artifact::from(Vec::new());
        let provider = provider(Duration::from_secs(60), TestRunResult::failed("late failure"));

        let run = run_isolated(
            &provider,
            request(&artifact),
            Some(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await
        .expect("run should finish");

        match run {
            IsolatedRun::Finished(result) => assert_eq!(result.status, TestRunStatus::Timeout),
            other => panic!("expected finished run, got {other:?}"),
        }
        assert_eq!(provider.counters.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(provider.counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_run_keeps_its_own_result() {
        let artifact = Artifact::from(Vec::new());
        let provider = provider(Duration::from_millis(10), TestRunResult::passed("ok"));

        let run = run_isolated(
            &provider,
            request(&artifact),
            Some(Duration::from_secs(1)),
            &CancellationToken::new(),
        )
        .await
        .expect("run should finish");

        assert_eq!(run, IsolatedRun::Finished(TestRunResult::passed("ok")));
        assert_eq!(provider.counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_the_sandbox() {
        let artifact = Artifact::from(Vec::new());
        let provider = provider(Duration::from_secs(60), TestRunResult::passed("ok"));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let run = run_isolated(&provider, request(&artifact), None, &cancel)
            .await
            .expect("cancelled run should not error");
        assert_eq!(run, IsolatedRun::Cancelled);
        assert_eq!(provider.counters.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_token_never_acquires() {
        let artifact = Artifact::from(Vec::new());
        let provider = provider(Duration::ZERO, TestRunResult::passed("ok"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = run_isolated(&provider, request(&artifact), None, &cancel)
            .await
            .expect("cancelled run should not error");
        assert_eq!(run, IsolatedRun::Cancelled);
        assert_eq!(provider.counters.acquired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn result_message_includes_status_and_detail() {
        assert_eq!(
            TestRunResult::failed("1 of 3 tests failed").result_message(),
            "Test run failed: 1 of 3 tests failed"
        );
        assert_eq!(
            TestRunResult::timed_out(Duration::from_millis(1500)).result_message(),
            "Test run timed out: Test run did not finish within 1500 ms"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_sandbox_passes_active_mutant_and_cleans_up() {
        let script = r#"
echo "mutant=${MUTANT_PLAYGROUND_ACTIVE_MUTANT:-none} stop=$MUTANT_PLAYGROUND_STOP_ON_ERROR"
if [ "$MUTANT_PLAYGROUND_ACTIVE_MUTANT" = "4" ]; then
  echo "assertion failed" >&2
  exit 1
fi
"#;
        let artifact = Artifact::from(script.as_bytes().to_vec());
        let provider = ProcessSandboxProvider::new().with_launcher("sh");

        let mut sandbox = provider.acquire().await.expect("sandbox should acquire");
        let baseline = sandbox
            .execute(ExecutionRequest {
                artifact: &artifact,
                active_mutant: None,
                stop_on_error: false,
            })
            .await
            .expect("baseline should run");
        assert_eq!(baseline.status, TestRunStatus::Passed);
        assert_eq!(baseline.output, vec!["mutant=none stop=0".to_string()]);

        let mutated = sandbox
            .execute(ExecutionRequest {
                artifact: &artifact,
                active_mutant: Some(4),
                stop_on_error: true,
            })
            .await
            .expect("mutant run should run");
        assert_eq!(mutated.status, TestRunStatus::Failed);
        assert_eq!(
            mutated.output,
            vec!["mutant=4 stop=1".to_string(), "assertion failed".to_string()]
        );

        sandbox.release().await;
        sandbox.release().await;
        assert!(matches!(
            sandbox
                .execute(ExecutionRequest {
                    artifact: &artifact,
                    active_mutant: None,
                    stop_on_error: false,
                })
                .await,
            Err(SandboxError::Released)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_process_is_abandoned_at_the_deadline() {
        let artifact = Artifact::from(b"while true; do sleep 1; done".to_vec());
        let provider = ProcessSandboxProvider::new().with_launcher("sh");

        let run = run_isolated(
            &provider,
            request(&artifact),
            Some(Duration::from_millis(200)),
            &CancellationToken::new(),
        )
        .await
        .expect("run should finish");

        match run {
            IsolatedRun::Finished(result) => assert_eq!(result.status, TestRunStatus::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn abandoned_run_cannot_write_after_timeout() {
        let shared = tempfile::tempdir().expect("shared dir should be created");
        let marker = shared.path().join("marker");
        let script = r#"
(sleep 0.5; echo leaked > "$SHARED_MARKER") &
sleep 30
"#;
        let artifact = Artifact::from(script.as_bytes().to_vec());
        let provider = ProcessSandboxProvider::new()
            .with_launcher("sh")
            .with_env("SHARED_MARKER", marker.to_string_lossy());

        let run = run_isolated(
            &provider,
            request(&artifact),
            Some(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await
        .expect("run should finish");
        match run {
            IsolatedRun::Finished(result) => assert_eq!(result.status, TestRunStatus::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background writer survived its sandbox");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn finished_run_stops_its_background_processes() {
        let shared = tempfile::tempdir().expect("shared dir should be created");
        let marker = shared.path().join("marker");
        let script = r#"
(sleep 0.3; echo leaked > "$SHARED_MARKER") &
echo "1 passed"
"#;
        let artifact = Artifact::from(script.as_bytes().to_vec());
        let provider = ProcessSandboxProvider::new()
            .with_launcher("sh")
            .with_env("SHARED_MARKER", marker.to_string_lossy());

        let run = run_isolated(
            &provider,
            request(&artifact),
            Some(Duration::from_secs(10)),
            &CancellationToken::new(),
        )
        .await
        .expect("run should finish");
        match run {
            IsolatedRun::Finished(result) => {
                assert_eq!(result.status, TestRunStatus::Passed);
                assert_eq!(result.output, vec!["1 passed".to_string()]);
            }
            other => panic!("expected finished run, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!marker.exists(), "background writer outlived a finished run");
    }
}
