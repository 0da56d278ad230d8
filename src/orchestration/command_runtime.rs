use crate::config::WorkerCommandConfig;
use crate::orchestration::gateway::{
    GatewayError, RuntimeExit, UnitOfWork, WorkerCapability, WorkerRuntime,
};
use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const ENV_CAPABILITY: &str = "PHASELOOM_CAPABILITY";
pub const ENV_BUNDLE_PATH: &str = "PHASELOOM_BUNDLE_PATH";
pub const ENV_OUTPUT_PATH: &str = "PHASELOOM_OUTPUT_PATH";
pub const ENV_SESSION_ID: &str = "PHASELOOM_SESSION_ID";
pub const ENV_TASK_ID: &str = "PHASELOOM_TASK_ID";

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_STDERR_CHARS: usize = 4_000;

struct RunningChild {
    key: String,
    child: Child,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

/// Runs each capability as a configured child process. Spawned children run
/// concurrently; `wait` polls one of them until it exits or times out.
pub struct CommandRuntime {
    commands: BTreeMap<WorkerCapability, WorkerCommandConfig>,
    next_id: AtomicU64,
    running: Mutex<BTreeMap<u64, RunningChild>>,
}

impl CommandRuntime {
    pub fn new(commands: BTreeMap<WorkerCapability, WorkerCommandConfig>) -> Self {
        Self {
            commands,
            next_id: AtomicU64::new(1),
            running: Mutex::new(BTreeMap::new()),
        }
    }
}

fn io_error(path: &str, source: std::io::Error) -> GatewayError {
    GatewayError::Io {
        path: path.to_string(),
        source,
    }
}

fn drain<R: Read + Send + 'static>(pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let mut reader = BufReader::new(pipe);
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

impl WorkerRuntime for CommandRuntime {
    fn spawn(&self, unit: &UnitOfWork) -> Result<u64, GatewayError> {
        let config = self
            .commands
            .get(&unit.capability)
            .ok_or(GatewayError::UnsupportedCapability {
                capability: unit.capability,
            })?;

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &config.env {
            command.env(key, value);
        }
        command
            .env(ENV_CAPABILITY, unit.capability.as_str())
            .env(ENV_BUNDLE_PATH, &unit.bundle_path)
            .env(ENV_OUTPUT_PATH, &unit.expected_output_path)
            .env(ENV_SESSION_ID, &unit.expected_output_key.session_id)
            .env(ENV_TASK_ID, &unit.expected_output_key.task_id);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(GatewayError::MissingBinary {
                    capability: unit.capability,
                    binary: config.command.clone(),
                })
            }
            Err(err) => return Err(io_error(&config.command, err)),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(&config.command, std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(&config.command, std::io::Error::other("missing stderr pipe")))?;

        let invocation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                invocation_id,
                RunningChild {
                    key: unit.expected_output_key.to_string(),
                    child,
                    stdout: drain(stdout),
                    stderr: drain(stderr),
                },
            );
        Ok(invocation_id)
    }

    fn wait(
        &self,
        invocation_id: u64,
        timeout: Option<Duration>,
    ) -> Result<RuntimeExit, GatewayError> {
        let RunningChild {
            key,
            mut child,
            stdout,
            stderr,
        } = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&invocation_id)
            .ok_or(GatewayError::UnknownInvocation { invocation_id })?;

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(limit) = timeout {
                        if start.elapsed() > limit {
                            let _ = child.kill();
                            child.wait().map_err(|e| io_error(&key, e))?;
                            let _ = stdout.join();
                            let _ = stderr.join();
                            return Err(GatewayError::Timeout {
                                key,
                                timeout_seconds: limit.as_secs(),
                            });
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(err) => return Err(io_error(&key, err)),
            }
        };

        let _stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if status.success() {
            return Ok(RuntimeExit::succeeded());
        }
        Ok(RuntimeExit {
            success: false,
            exit_code: status.code(),
            detail: stderr.trim().chars().take(MAX_STDERR_CHARS).collect(),
        })
    }
}
