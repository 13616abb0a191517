use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::registry::Control;
use crate::workspace::{SentinelState, TaskDir, Terminal};

/// Upper bound on draining pipes after the agent is gone.
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct AgentSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub max_output_bytes: usize,
    /// How long a stopped or finished agent may take to exit before it is killed.
    pub grace: Duration,
}

pub struct AgentRun<'a> {
    pub cwd: &'a Path,
    pub task_dir: &'a TaskDir,
    pub max_turns: u32,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuccessSignal {
    Sentinel,
    CleanExit,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AgentOutcome {
    Succeeded { via: SuccessSignal },
    Failed { reason: String, exit_code: Option<i32> },
    TimedOut,
    /// The worker was told to pause or stop.
    Stopped(Control),
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AgentOutcome::Succeeded { .. })
    }
}

#[derive(Clone, Debug)]
pub struct AgentReport {
    pub outcome: AgentOutcome,
    /// Tail of interleaved stdout and stderr.
    pub output: String,
    pub truncated: bool,
    pub sentinel: SentinelState,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

struct TailBuffer {
    buf: Vec<u8>,
    max: usize,
    truncated: bool,
}

impl TailBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max {
            let excess = self.buf.len() - self.max;
            self.buf.drain(..excess);
            self.truncated = true;
        }
    }
}

fn spawn_reader<R>(mut pipe: R, tail: Arc<Mutex<TailBuffer>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.lock().unwrap_or_else(|e| e.into_inner()).push(&chunk[..n]),
            }
        }
    })
}

fn substitute(args: &[String], run: &AgentRun<'_>) -> Vec<String> {
    let task_file = run.task_dir.instruction_file().display().to_string();
    let progress_file = run.task_dir.progress_file().display().to_string();
    let task_dir = run.task_dir.path.display().to_string();
    args.iter()
        .map(|a| {
            a.replace("{max_turns}", &run.max_turns.to_string())
                .replace("{task_file}", &task_file)
                .replace("{progress_file}", &progress_file)
                .replace("{task_dir}", &task_dir)
        })
        .collect()
}

enum Ended {
    Exited(std::io::Result<ExitStatus>),
    Marker,
    TimedOut,
    Stop(Control),
}

/// Let the agent exit within `grace`, then kill it.
async fn shutdown(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
        return Some(status);
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed, agent already gone");
    }
    child.wait().await.ok()
}

/// Run one agent invocation to completion. Only a spawn failure is an `Err`;
/// every other ending is reported in [`AgentReport::outcome`].
pub async fn run_agent(
    spec: &AgentSpec,
    run: AgentRun<'_>,
    mut control: watch::Receiver<Control>,
    on_spawn: impl FnOnce(Option<u32>),
) -> Result<AgentReport> {
    let started = Instant::now();
    let mut child = Command::new(&spec.program)
        .args(substitute(&spec.args, &run))
        .current_dir(run.cwd)
        .envs(run.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("HIVE_TASK_DIR", &run.task_dir.path)
        .env("HIVE_PROGRESS_FILE", run.task_dir.progress_file())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn agent {}", spec.program))?;
    let pid = child.id();
    on_spawn(pid);
    info!(pid = ?pid, cwd = %run.cwd.display(), "agent started");

    let tail = Arc::new(Mutex::new(TailBuffer { buf: Vec::new(), max: spec.max_output_bytes, truncated: false }));
    let mut readers = Vec::new();
    if let Some(out) = child.stdout.take() {
        readers.push(spawn_reader(out, tail.clone()));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(spawn_reader(err, tail.clone()));
    }

    let mut poll = tokio::time::interval(spec.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let ended = loop {
        let requested = *control.borrow_and_update();
        if requested != Control::Run {
            break Ended::Stop(requested);
        }
        tokio::select! {
            status = child.wait() => break Ended::Exited(status),
            _ = poll.tick() => {
                if run.task_dir.read_sentinel().terminal.is_some() {
                    debug!(pid = ?pid, "sentinel marker seen");
                    break Ended::Marker;
                }
            }
            _ = &mut deadline => break Ended::TimedOut,
            changed = control.changed() => {
                // The owning loop is gone.
                if changed.is_err() {
                    break Ended::Stop(Control::Stop);
                }
            }
        }
    };

    let exit_status = match &ended {
        Ended::Exited(status) => status.as_ref().ok().copied(),
        Ended::TimedOut => {
            warn!(pid = ?pid, timeout = ?spec.timeout, "agent timed out");
            shutdown(&mut child, Duration::ZERO).await
        }
        Ended::Marker | Ended::Stop(_) => shutdown(&mut child, spec.grace).await,
    };

    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(DRAIN_LIMIT, reader).await.is_err() {
            warn!(pid = ?pid, "output still open after agent exit, dropping the rest");
            abort.abort();
        }
    }

    let sentinel = run.task_dir.read_sentinel();
    let (output, truncated) = {
        let t = tail.lock().unwrap_or_else(|e| e.into_inner());
        (String::from_utf8_lossy(&t.buf).into_owned(), t.truncated)
    };
    let exit_code = exit_status.and_then(|s| s.code());

    let outcome = match ended {
        Ended::Stop(c) => AgentOutcome::Stopped(c),
        ended => match (&sentinel.terminal, ended) {
            (Some(Terminal::Error(reason)), _) => AgentOutcome::Failed { reason: reason.clone(), exit_code },
            (Some(Terminal::Done), _) => AgentOutcome::Succeeded { via: SuccessSignal::Sentinel },
            (None, Ended::TimedOut) => AgentOutcome::TimedOut,
            (None, Ended::Exited(Err(e))) => AgentOutcome::Failed { reason: format!("wait failed: {e}"), exit_code: None },
            (None, _) => match exit_status {
                Some(s) if s.success() => AgentOutcome::Succeeded { via: SuccessSignal::CleanExit },
                Some(s) => AgentOutcome::Failed { reason: format!("agent exited with {s}"), exit_code },
                None => AgentOutcome::Failed { reason: "agent exit status unknown".into(), exit_code: None },
            },
        },
    };

    let elapsed = started.elapsed();
    info!(pid = ?pid, outcome = ?outcome, elapsed_ms = elapsed.as_millis() as u64, "agent finished");
    Ok(AgentReport { outcome, output, truncated, sentinel, exit_code, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(script: &str) -> AgentSpec {
        AgentSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            max_output_bytes: 4096,
            grace: Duration::from_millis(200),
        }
    }

    async fn run_script(spec: &AgentSpec, control: watch::Receiver<Control>) -> AgentReport {
        let dir = tempdir().unwrap();
        let task_dir = TaskDir { path: dir.path().to_path_buf() };
        std::fs::write(task_dir.progress_file(), "").unwrap();
        let run = AgentRun { cwd: dir.path(), task_dir: &task_dir, max_turns: 5, env: vec![] };
        run_agent(spec, run, control, |_| {}).await.unwrap()
    }

    fn idle() -> watch::Receiver<Control> {
        let (tx, rx) = watch::channel(Control::Run);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn done_marker_succeeds_without_waiting_for_exit() {
        let s = spec(r#"echo working; echo DONE >> "$HIVE_PROGRESS_FILE"; exec sleep 30"#);
        let report = run_script(&s, idle()).await;
        assert_eq!(report.outcome, AgentOutcome::Succeeded { via: SuccessSignal::Sentinel });
        assert!(report.output.contains("working"));
        assert!(report.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn clean_exit_without_marker_succeeds() {
        let report = run_script(&spec("echo ok"), idle()).await;
        assert_eq!(report.outcome, AgentOutcome::Succeeded { via: SuccessSignal::CleanExit });
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn error_marker_and_nonzero_exit_fail() {
        let report = run_script(&spec(r#"echo "ERROR: no tests found" >> "$HIVE_PROGRESS_FILE""#), idle()).await;
        assert_eq!(report.outcome, AgentOutcome::Failed { reason: "no tests found".into(), exit_code: Some(0) });

        let report = run_script(&spec("echo boom >&2; exit 3"), idle()).await;
        match report.outcome {
            AgentOutcome::Failed { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(report.output.contains("boom"));
    }

    #[tokio::test]
    async fn wall_clock_timeout_kills_the_agent() {
        let mut s = spec("exec sleep 30");
        s.timeout = Duration::from_millis(200);
        let report = run_script(&s, idle()).await;
        assert_eq!(report.outcome, AgentOutcome::TimedOut);
        assert!(report.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn pause_keeps_output_written_before_the_kill() {
        let (tx, rx) = watch::channel(Control::Run);
        let s = spec("echo partial result; exec sleep 30");
        let handle = tokio::spawn(async move { run_script(&s, rx).await });
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send(Control::Pause).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.outcome, AgentOutcome::Stopped(Control::Pause));
        assert!(report.output.contains("partial result"));
    }

    #[tokio::test]
    async fn output_capture_is_bounded() {
        let report = run_script(&spec("i=0; while [ $i -lt 2000 ]; do echo line-$i; i=$((i+1)); done"), idle()).await;
        assert!(report.truncated);
        assert_eq!(report.output.len(), 4096);
        assert!(report.output.ends_with("line-1999\n"));
    }

    #[test]
    fn placeholders_are_substituted() {
        let task_dir = TaskDir { path: "/ws/task_1".into() };
        let run = AgentRun { cwd: Path::new("/ws"), task_dir: &task_dir, max_turns: 7, env: vec![] };
        let args = substitute(&["--max-turns".into(), "{max_turns}".into(), "read {task_file}".into()], &run);
        assert_eq!(args, vec!["--max-turns", "7", "read /ws/task_1/TASK.md"]);
    }
}
