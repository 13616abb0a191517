use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// External reasoning call used for complexity scoring and task splitting.
pub trait Reasoner: Send + Sync {
    fn reason(&self, prompt: &str) -> Result<String>;
}

/// Runs a one-shot agent CLI. A `{prompt}` argument is replaced by the prompt text;
/// without one the prompt is written to stdin.
#[derive(Clone, Debug)]
pub struct AgentCliReasoner {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

const POLL: Duration = Duration::from_millis(100);

impl AgentCliReasoner {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self { program: program.into(), args, timeout }
    }
}

impl Reasoner for AgentCliReasoner {
    fn reason(&self, prompt: &str) -> Result<String> {
        let inline = self.args.iter().any(|a| a.contains("{prompt}"));
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{prompt}", prompt)).collect();

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(if inline { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn reasoner {}", self.program))?;

        let mut stdout = child.stdout.take().context("reasoner stdout")?;
        let mut stderr = child.stderr.take().context("reasoner stderr")?;
        let out_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        });
        let err_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        });

        // The prompt is fed from its own thread so a child that never reads stdin
        // cannot hold the caller past the deadline.
        let started = Instant::now();
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            thread::spawn(move || match stdin.write_all(prompt.as_bytes()) {
                // A child that exits without reading its input is judged by its exit status.
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            })
        });

        let status = loop {
            if let Some(status) = child.try_wait().context("wait for reasoner")? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("reasoner {} timed out after {:?}", self.program, self.timeout));
            }
            thread::sleep(POLL);
        };

        if let Some(writer) = writer {
            match writer.join() {
                Ok(res) => res.context("write reasoner prompt")?,
                Err(_) => return Err(anyhow!("reasoner prompt writer panicked")),
            }
        }
        let out = out_reader.join().unwrap_or_default();
        let err = err_reader.join().unwrap_or_default();
        debug!(program = %self.program, elapsed_ms = started.elapsed().as_millis() as u64, "reasoner finished");
        if !status.success() {
            return Err(anyhow!(
                "reasoner {} failed: {}\nstderr:{}",
                self.program,
                status,
                String::from_utf8_lossy(&err)
            ));
        }
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_goes_to_stdin_by_default() {
        let r = AgentCliReasoner::new("cat", vec![], Duration::from_secs(5));
        assert_eq!(r.reason("hello").unwrap(), "hello");
    }

    #[test]
    fn prompt_placeholder_is_substituted() {
        let r = AgentCliReasoner::new("echo", vec!["-n".into(), "{prompt}".into()], Duration::from_secs(5));
        assert_eq!(r.reason("inline").unwrap(), "inline");
    }

    #[test]
    fn failures_and_timeouts_are_errors() {
        let r = AgentCliReasoner::new("sh", vec!["-c".into(), "echo nope >&2; exit 3".into()], Duration::from_secs(5));
        assert!(r.reason("x").unwrap_err().to_string().contains("nope"));
        let r = AgentCliReasoner::new("sh", vec!["-c".into(), "sleep 5".into()], Duration::from_millis(200));
        assert!(r.reason("x").unwrap_err().to_string().contains("timed out"));
    }

    #[test]
    fn timeout_holds_when_the_child_ignores_a_large_prompt() {
        let r = AgentCliReasoner::new("sh", vec!["-c".into(), "sleep 6".into()], Duration::from_millis(300));
        let prompt = "x".repeat(1 << 20);
        let started = Instant::now();
        let err = r.reason(&prompt).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    }

    #[test]
    fn large_prompt_is_delivered_in_full() {
        let r = AgentCliReasoner::new("wc", vec!["-c".into()], Duration::from_secs(5));
        let prompt = "y".repeat(1 << 20);
        assert_eq!(r.reason(&prompt).unwrap(), (1usize << 20).to_string());
    }
}
