//! Scripted in-memory engine for tests and development
//!
//! Exec behaviour is chosen by matching a substring of the joined command line
//! against registered scripts; unmatched commands exit 0 with no output.
//! Scripts registered with [`MockEngine::with_exec_once`] are consumed by
//! their first match.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{ExecSpec, ExecStatus, ExecutionEngine, InstanceSpec, InstanceState, OutputStream};
use crate::types::EngineError;

/// How a scripted exec stream ends after its chunks are delivered
#[derive(Debug, Clone)]
pub enum StreamEnd {
    Clean,
    /// End cleanly after waiting
    After(Duration),
    /// Fail mid-stream
    Error(String),
    /// Never end
    Hang,
}

/// Scripted result for a matching exec
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    pub chunks: Vec<Bytes>,
    pub exit_code: i64,
    pub end: StreamEnd,
}

impl ScriptedExec {
    pub fn ok(output: &str) -> Self {
        Self::exit(0, output)
    }

    pub fn exit(exit_code: i64, output: &str) -> Self {
        Self {
            chunks: vec![Bytes::copy_from_slice(output.as_bytes())],
            exit_code,
            end: StreamEnd::Clean,
        }
    }

    /// Emits `output` then never finishes. The engine still claims exit 0.
    pub fn hang(output: &str) -> Self {
        Self {
            end: StreamEnd::Hang,
            ..Self::ok(output)
        }
    }

    pub fn slow(output: &str, delay: Duration) -> Self {
        Self {
            end: StreamEnd::After(delay),
            ..Self::ok(output)
        }
    }

    pub fn stream_error(output: &str, message: &str) -> Self {
        Self {
            end: StreamEnd::Error(message.to_string()),
            ..Self::ok(output)
        }
    }

    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks
            .iter()
            .map(|c| Bytes::copy_from_slice(c.as_bytes()))
            .collect();
        self
    }
}

/// Record of an instance held by the mock
#[derive(Debug, Clone)]
pub struct MockInstance {
    pub id: String,
    pub spec: InstanceSpec,
    pub running: bool,
    pub removed: bool,
}

/// Record of a registered exec
#[derive(Debug, Clone)]
pub struct MockExec {
    pub instance_id: String,
    pub spec: ExecSpec,
    script: ScriptedExec,
}

/// Record of an extracted archive
#[derive(Debug, Clone)]
pub struct MockUpload {
    pub instance_id: String,
    pub path: String,
    pub archive: Bytes,
}

#[derive(Default)]
pub struct MockEngine {
    reachable: AtomicBool,
    failing_pings: AtomicUsize,
    pull_fails: AtomicBool,
    pull_delay: Mutex<Option<Duration>>,
    image_missing: AtomicBool,
    hidden_lookups: AtomicUsize,
    upload_fails: AtomicBool,
    next_id: AtomicUsize,
    calls: Mutex<HashMap<&'static str, usize>>,
    scripts: Mutex<Vec<(String, ScriptedExec, bool)>>,
    instances: Mutex<HashMap<String, MockInstance>>,
    execs: Mutex<HashMap<String, MockExec>>,
    exec_log: Mutex<Vec<MockExec>>,
    uploads: Mutex<Vec<MockUpload>>,
    events: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Every call fails as unreachable
    pub fn unreachable(self) -> Self {
        self.reachable.store(false, Ordering::SeqCst);
        self
    }

    /// The first `count` pings fail
    pub fn with_failing_pings(self, count: usize) -> Self {
        self.failing_pings.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_failing_pull(self) -> Self {
        self.pull_fails.store(true, Ordering::SeqCst);
        self
    }

    /// The image is not cached yet and pulling it takes `delay`. Creation
    /// fails until a pull has run to completion.
    pub fn with_pull_delay(self, delay: Duration) -> Self {
        *self.pull_delay.lock() = Some(delay);
        self.image_missing.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_failing_upload(self) -> Self {
        self.upload_fails.store(true, Ordering::SeqCst);
        self
    }

    /// Script every exec whose command line contains `pattern`.
    /// Earlier registrations win.
    pub fn with_exec(self, pattern: &str, script: ScriptedExec) -> Self {
        self.scripts.lock().push((pattern.to_string(), script, false));
        self
    }

    /// Like [`Self::with_exec`], but only for the first matching exec
    pub fn with_exec_once(self, pattern: &str, script: ScriptedExec) -> Self {
        self.scripts.lock().push((pattern.to_string(), script, true));
        self
    }

    /// Seed an existing instance, e.g. one left behind by an earlier process
    pub fn with_instance(self, spec: InstanceSpec, running: bool) -> Self {
        let id = self.allocate_id("instance");
        self.instances.lock().insert(
            spec.name.clone(),
            MockInstance {
                id,
                spec,
                running,
                removed: false,
            },
        );
        self
    }

    /// Seed a stopped instance that the first lookup misses, as if another
    /// process created it between our lookup and our create
    pub fn with_instance_created_concurrently(self, spec: InstanceSpec) -> Self {
        self.hidden_lookups.store(1, Ordering::SeqCst);
        self.with_instance(spec, false)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Total number of engine calls of any kind
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().get(operation).copied().unwrap_or(0)
    }

    pub fn instance(&self, name: &str) -> Option<MockInstance> {
        self.instances.lock().get(name).cloned()
    }

    pub fn instances(&self) -> Vec<MockInstance> {
        self.instances.lock().values().cloned().collect()
    }

    /// Command lines of every exec, in creation order
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.exec_log
            .lock()
            .iter()
            .map(|e| e.spec.command.clone())
            .collect()
    }

    pub fn exec_log(&self) -> Vec<MockExec> {
        self.exec_log.lock().clone()
    }

    pub fn uploads(&self) -> Vec<MockUpload> {
        self.uploads.lock().clone()
    }

    /// Execs and uploads in the order they reached the engine, as
    /// `exec <command line>` and `upload <path>`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn record(&self, operation: &'static str) -> Result<(), EngineError> {
        *self.calls.lock().entry(operation).or_insert(0) += 1;
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unreachable("connection refused".to_string()))
        }
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn script_for(&self, command: &[String]) -> ScriptedExec {
        let line = command.join(" ");
        let mut scripts = self.scripts.lock();
        let Some(index) = scripts
            .iter()
            .position(|(pattern, _, _)| line.contains(pattern.as_str()))
        else {
            return ScriptedExec::ok("");
        };
        if scripts[index].2 {
            scripts.remove(index).1
        } else {
            scripts[index].1.clone()
        }
    }

    fn with_instance_by_id<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MockInstance) -> T,
    ) -> Result<T, EngineError> {
        let mut instances = self.instances.lock();
        instances
            .values_mut()
            .find(|i| i.id == id && !i.removed)
            .map(f)
            .ok_or_else(|| EngineError::NotFound(format!("no such instance: {}", id)))
    }
}

#[async_trait]
impl ExecutionEngine for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.record("ping")?;
        let remaining = self.failing_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::Unreachable("daemon starting".to_string()));
        }
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.record("pull_image")?;
        if self.pull_fails.load(Ordering::SeqCst) {
            return Err(EngineError::request(
                "pull_image",
                format!("registry unavailable for {}", image),
            ));
        }
        let delay = *self.pull_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.image_missing.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect_instance(&self, name: &str) -> Result<Option<InstanceState>, EngineError> {
        self.record("inspect_instance")?;
        let hidden = self
            .hidden_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(None);
        }
        Ok(self
            .instances
            .lock()
            .get(name)
            .filter(|i| !i.removed)
            .map(|i| InstanceState {
                id: i.id.clone(),
                name: name.to_string(),
                running: i.running,
            }))
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String, EngineError> {
        self.record("create_instance")?;
        if self.image_missing.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound(format!("No such image: {}", spec.image)));
        }
        let mut instances = self.instances.lock();
        if instances.get(&spec.name).is_some_and(|i| !i.removed) {
            return Err(EngineError::Conflict(format!(
                "name {} already in use",
                spec.name
            )));
        }
        let id = self.allocate_id("instance");
        instances.insert(
            spec.name.clone(),
            MockInstance {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                removed: false,
            },
        );
        Ok(id)
    }

    async fn start_instance(&self, id: &str) -> Result<(), EngineError> {
        self.record("start_instance")?;
        self.with_instance_by_id(id, |i| i.running = true)
    }

    async fn remove_instance(&self, id: &str) -> Result<(), EngineError> {
        self.record("remove_instance")?;
        self.with_instance_by_id(id, |i| {
            i.running = false;
            i.removed = true;
        })
    }

    async fn extract_archive(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), EngineError> {
        self.record("extract_archive")?;
        if self.upload_fails.load(Ordering::SeqCst) {
            return Err(EngineError::request("extract_archive", "disk full"));
        }
        self.with_instance_by_id(id, |_| ())?;
        self.events.lock().push(format!("upload {}", path));
        self.uploads.lock().push(MockUpload {
            instance_id: id.to_string(),
            path: path.to_string(),
            archive,
        });
        Ok(())
    }

    async fn create_exec(&self, id: &str, spec: &ExecSpec) -> Result<String, EngineError> {
        self.record("create_exec")?;
        let running = self.with_instance_by_id(id, |i| i.running)?;
        if !running {
            return Err(EngineError::Conflict(format!("instance {} is not running", id)));
        }

        let exec_id = self.allocate_id("exec");
        let exec = MockExec {
            instance_id: id.to_string(),
            spec: spec.clone(),
            script: self.script_for(&spec.command),
        };
        self.events
            .lock()
            .push(format!("exec {}", spec.command.join(" ")));
        self.exec_log.lock().push(exec.clone());
        self.execs.lock().insert(exec_id.clone(), exec);
        Ok(exec_id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<OutputStream, EngineError> {
        self.record("start_exec")?;
        let script = self
            .execs
            .lock()
            .get(exec_id)
            .map(|e| e.script.clone())
            .ok_or_else(|| EngineError::NotFound(format!("no such exec: {}", exec_id)))?;

        let head = stream::iter(script.chunks.into_iter().map(Ok));
        let tail: OutputStream = match script.end {
            StreamEnd::Clean => stream::empty().boxed(),
            StreamEnd::After(delay) => stream::once(tokio::time::sleep(delay))
                .filter_map(|_| async { None })
                .boxed(),
            StreamEnd::Error(message) => {
                stream::once(async move { Err(EngineError::request("exec_output", message)) })
                    .boxed()
            }
            StreamEnd::Hang => stream::pending().boxed(),
        };

        Ok(head.chain(tail).boxed())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus, EngineError> {
        self.record("inspect_exec")?;
        self.execs
            .lock()
            .get(exec_id)
            .map(|e| ExecStatus {
                running: false,
                exit_code: Some(e.script.exit_code),
            })
            .ok_or_else(|| EngineError::NotFound(format!("no such exec: {}", exec_id)))
    }
}
