//! Phase executable invocation.
//!
//! A phase executable receives its work descriptor as JSON on stdin and as
//! `STAGEHAND_*` environment variables. It reports unit results through the
//! state store (for scripts, `stagehand report`). The exit status only tells
//! the orchestrator whether the invocation itself completed.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::fallback::{ContentCategory, EngineConfig, config_label};
use crate::phase::PhaseDefinition;

pub const ENV_STATE_FILE: &str = "STAGEHAND_STATE_FILE";
pub const ENV_PHASE: &str = "STAGEHAND_PHASE";
pub const ENV_FILE_ID: &str = "STAGEHAND_FILE_ID";
pub const ENV_UNIT_SCOPE: &str = "STAGEHAND_UNIT_SCOPE";
pub const ENV_ATTEMPT: &str = "STAGEHAND_ATTEMPT";
pub const ENV_ENGINE: &str = "STAGEHAND_ENGINE";
pub const ENV_ARTIFACT_ROOT: &str = "STAGEHAND_ARTIFACT_ROOT";

/// Which units an invocation should (re)produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitScope {
    All,
    Units(Vec<String>),
}

impl UnitScope {
    pub fn contains(&self, unit_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Units(ids) => ids.iter().any(|id| id == unit_id),
        }
    }

    /// Value exported as `STAGEHAND_UNIT_SCOPE`: `all` or a comma list.
    pub fn as_env(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Units(ids) => ids.join(","),
        }
    }
}

impl Serialize for UnitScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str("all"),
            Self::Units(ids) => ids.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for UnitScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            Ids(Vec<String>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Word(w) if w == "all" => Ok(Self::All),
            Raw::Word(w) => Err(serde::de::Error::custom(format!(
                "unit scope must be \"all\" or a list of unit ids, got \"{}\"",
                w
            ))),
            Raw::Ids(ids) => Ok(Self::Units(ids)),
        }
    }
}

/// Everything a phase executable needs to do one piece of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub phase: String,
    pub file_id: String,
    /// Artifacts of upstream phases (or the source document for root phases)
    pub input_artifact_refs: Vec<PathBuf>,
    pub unit_scope: UnitScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<EngineConfig>,
    pub content_category: ContentCategory,
    /// Dispatch round: 1 for the primary pass, then one per retry round
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_units: Option<usize>,
    pub artifact_root: PathBuf,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    Completed,
    Failed { exit_code: Option<i32>, stderr_tail: String },
    TimedOut { after: Duration },
    SpawnFailed(String),
}

impl InvocationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Reason recorded on every in-scope unit after an abnormal exit.
    pub fn failure_reason(&self) -> Option<String> {
        let detail = match self {
            Self::Completed => return None,
            Self::Failed {
                exit_code: Some(code),
                stderr_tail,
            } if stderr_tail.is_empty() => format!("exit code {}", code),
            Self::Failed {
                exit_code: Some(code),
                stderr_tail,
            } => format!("exit code {}: {}", code, stderr_tail),
            Self::Failed {
                exit_code: None, ..
            } => "terminated by signal".to_string(),
            Self::TimedOut { after } => format!("timed out after {}s", after.as_secs()),
            Self::SpawnFailed(e) => format!("spawn failed: {}", e),
        };
        Some(format!("invocation_failed: {}", detail))
    }
}

/// Seam between the orchestrator and the phase executables.
#[async_trait]
pub trait PhaseInvoker: Send + Sync {
    async fn invoke(
        &self,
        phase: &PhaseDefinition,
        work: &WorkDescriptor,
        deadline: Duration,
    ) -> InvocationOutcome;
}

/// Runs phase commands through `sh -c`.
pub struct ProcessInvoker {
    /// Working directory for phase commands
    project_dir: PathBuf,
    state_file: PathBuf,
    /// Per-invocation stdout/stderr logs land here
    log_dir: PathBuf,
}

impl ProcessInvoker {
    pub fn new(
        project_dir: impl AsRef<Path>,
        state_file: impl AsRef<Path>,
        log_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            project_dir: project_dir.as_ref().to_path_buf(),
            state_file: state_file.as_ref().to_path_buf(),
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    fn log_path(&self, work: &WorkDescriptor) -> PathBuf {
        let scope = match &work.unit_scope {
            UnitScope::All => "all".to_string(),
            UnitScope::Units(ids) => format!("u{}", ids.join("-")),
        };
        self.log_dir.join(format!(
            "{}-{}-{}-attempt{}.log",
            work.phase, work.file_id, scope, work.attempt
        ))
    }

    async fn write_log(&self, work: &WorkDescriptor, stdout: &[u8], stderr: &[u8]) {
        let mut content = Vec::with_capacity(stdout.len() + stderr.len() + 32);
        content.extend_from_slice(b"--- stdout ---\n");
        content.extend_from_slice(stdout);
        content.extend_from_slice(b"\n--- stderr ---\n");
        content.extend_from_slice(stderr);
        let path = self.log_path(work);
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            tracing::warn!(error = %e, "failed to create log directory");
            return;
        }
        if let Err(e) = tokio::fs::write(&path, content).await {
            tracing::warn!(error = %e, path = %path.display(), "failed to write invocation log");
        }
    }
}

fn tail(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

#[async_trait]
impl PhaseInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        phase: &PhaseDefinition,
        work: &WorkDescriptor,
        deadline: Duration,
    ) -> InvocationOutcome {
        let payload = match serde_json::to_string(work) {
            Ok(p) => p,
            Err(e) => return InvocationOutcome::SpawnFailed(format!("serialize descriptor: {}", e)),
        };

        tracing::debug!(
            phase = %work.phase,
            file_id = %work.file_id,
            scope = %work.unit_scope.as_env(),
            attempt = work.attempt,
            command = %phase.command,
            "spawning phase executable"
        );

        let start = Instant::now();
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(&phase.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(ENV_STATE_FILE, &self.state_file)
            .env(ENV_PHASE, &work.phase)
            .env(ENV_FILE_ID, &work.file_id)
            .env(ENV_UNIT_SCOPE, work.unit_scope.as_env())
            .env(ENV_ATTEMPT, work.attempt.to_string())
            .env(ENV_ENGINE, config_label(work.configuration.as_ref()))
            .env(ENV_ARTIFACT_ROOT, &work.artifact_root)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return InvocationOutcome::SpawnFailed(e.to_string()),
        };

        if let Some(mut stdin) = child.stdin.take() {
            // The executable may exit without reading stdin.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::debug!(error = %e, "phase executable did not read its descriptor");
            }
            drop(stdin);
        }

        let output = match timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return InvocationOutcome::SpawnFailed(e.to_string()),
            Err(_) => {
                tracing::warn!(
                    phase = %work.phase,
                    file_id = %work.file_id,
                    timeout_secs = deadline.as_secs(),
                    "phase executable timed out"
                );
                return InvocationOutcome::TimedOut { after: deadline };
            }
        };

        self.write_log(work, &output.stdout, &output.stderr).await;
        tracing::debug!(
            phase = %work.phase,
            file_id = %work.file_id,
            exit_code = output.status.code().unwrap_or(-1),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "phase executable finished"
        );

        if output.status.success() {
            InvocationOutcome::Completed
        } else {
            InvocationOutcome::Failed {
                exit_code: output.status.code(),
                stderr_tail: tail(&output.stderr, 200),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn work(scope: UnitScope) -> WorkDescriptor {
        WorkDescriptor {
            phase: "synthesize".into(),
            file_id: "ch1".into(),
            input_artifact_refs: vec![PathBuf::from("ch1.chunks.json")],
            unit_scope: scope,
            configuration: None,
            content_category: ContentCategory::Narration,
            attempt: 1,
            expected_units: Some(3),
            artifact_root: PathBuf::from("."),
        }
    }

    fn setup() -> (ProcessInvoker, TempDir) {
        let dir = tempdir().unwrap();
        let invoker = ProcessInvoker::new(
            dir.path(),
            dir.path().join("state.json"),
            dir.path().join("logs"),
        );
        (invoker, dir)
    }

    #[test]
    fn unit_scope_wire_format() {
        assert_eq!(serde_json::to_string(&UnitScope::All).unwrap(), "\"all\"");
        let ids = UnitScope::Units(vec!["3".into(), "7".into()]);
        assert_eq!(serde_json::to_string(&ids).unwrap(), "[\"3\",\"7\"]");
        assert_eq!(
            serde_json::from_str::<UnitScope>("[\"3\",\"7\"]").unwrap(),
            ids
        );
        assert!(serde_json::from_str::<UnitScope>("\"some\"").is_err());
        assert_eq!(ids.as_env(), "3,7");
        assert!(ids.contains("7") && !ids.contains("1"));
    }

    #[tokio::test]
    async fn descriptor_reaches_stdin_and_env() {
        let (invoker, dir) = setup();
        let phase = PhaseDefinition::new(
            "synthesize",
            "cat > descriptor.json; printf '%s|%s|%s' \"$STAGEHAND_PHASE\" \"$STAGEHAND_FILE_ID\" \"$STAGEHAND_UNIT_SCOPE\" > env.txt",
        );
        let work = work(UnitScope::Units(vec!["2".into()]));

        let outcome = invoker.invoke(&phase, &work, Duration::from_secs(10)).await;
        assert_eq!(outcome, InvocationOutcome::Completed);

        let received: WorkDescriptor =
            serde_json::from_slice(&std::fs::read(dir.path().join("descriptor.json")).unwrap())
                .unwrap();
        assert_eq!(received, work);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("env.txt")).unwrap(),
            "synthesize|ch1|2"
        );
        assert!(dir.path().join("logs/synthesize-ch1-u2-attempt1.log").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let (invoker, _dir) = setup();
        let phase = PhaseDefinition::new("synthesize", "echo 'model crashed' >&2; exit 3");
        let outcome = invoker
            .invoke(&phase, &work(UnitScope::All), Duration::from_secs(10))
            .await;
        assert_eq!(
            outcome,
            InvocationOutcome::Failed {
                exit_code: Some(3),
                stderr_tail: "model crashed".into()
            }
        );
        assert_eq!(
            outcome.failure_reason().unwrap(),
            "invocation_failed: exit code 3: model crashed"
        );
    }

    #[tokio::test]
    async fn deadline_expiry_is_timeout() {
        let (invoker, _dir) = setup();
        let phase = PhaseDefinition::new("synthesize", "sleep 5");
        let outcome = invoker
            .invoke(&phase, &work(UnitScope::All), Duration::from_millis(200))
            .await;
        assert!(matches!(outcome, InvocationOutcome::TimedOut { .. }));
        assert!(outcome.failure_reason().unwrap().starts_with("invocation_failed"));
    }
}
