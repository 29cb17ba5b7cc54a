//! Pipeline configuration.
//!
//! Reads `.stagehand/pipeline.toml` and layers it: file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! state_file = "state/pipeline.json"
//! lock_timeout_secs = 30
//! lock_retries = 3
//! backup_retention = 20
//!
//! [run]
//! input_id = "moby-dick"
//! inputs = ["input/*.txt"]
//! artifact_root = "artifacts"
//! max_retries = 1
//! crash_retry_same_config = false
//!
//! [[phases]]
//! name = "chunk"
//! command = "./bin/chunk"
//!
//! [[phases]]
//! name = "synthesize"
//! command = "./bin/tts"
//! depends_on = ["chunk"]
//! expected_units = 40
//! engine = { kind = "xtts", voice = { type = "cloned", reference_audio = "voices/narrator.wav" } }
//!
//! [[fallbacks]]
//! primary = "xtts"
//! fallback = "kokoro"
//! category = "narration"
//! voice_id = "af_bella"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fallback::{FallbackRule, FallbackTable};
use crate::phase::{PhaseDefinition, PhasePlan};
use crate::state::{StateStore, StoreOptions};

/// Directory holding config, state, backups and logs.
pub const STAGEHAND_DIR: &str = ".stagehand";
pub const CONFIG_FILE: &str = "pipeline.toml";

pub const ENV_LOCK_TIMEOUT_SECS: &str = "STAGEHAND_LOCK_TIMEOUT_SECS";
pub const ENV_BACKUP_RETENTION: &str = "STAGEHAND_BACKUP_RETENTION";
pub const ENV_MAX_RETRIES: &str = "STAGEHAND_MAX_RETRIES";

/// State store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Relative paths resolve against `.stagehand/`
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Commit attempts retried after lock contention
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state/pipeline.json")
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_retries() -> u32 {
    3
}

fn default_backup_retention() -> usize {
    20
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_retries: default_lock_retries(),
            backup_retention: default_backup_retention(),
        }
    }
}

/// Run-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Identity recorded in the state document; defaults to the project directory name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_id: Option<String>,
    /// Glob patterns for source documents, relative to the project directory
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Base for relative artifact paths; defaults to the project directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_root: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Grant one free same-config retry after a crash or timeout
    #[serde(default)]
    pub crash_retry_same_config: bool,
}

fn default_max_retries() -> u32 {
    1
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            input_id: None,
            inputs: Vec::new(),
            artifact_root: None,
            max_retries: default_max_retries(),
            crash_retry_same_config: false,
        }
    }
}

/// The complete pipeline.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineToml {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub run: RunSection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<PhaseDefinition>,
    /// Overrides for the builtin fallback voice table
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<FallbackRule>,
}

impl PipelineToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipeline.toml")
    }

    /// Returns the default configuration if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize pipeline.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Non-fatal problems worth printing.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.phases.is_empty() {
            warnings.push("No [[phases]] configured".to_string());
        }
        if self.store.backup_retention == 0 {
            warnings.push(
                "backup_retention = 0 is raised to 1; the newest backup is always kept".to_string(),
            );
        }
        if self.run.max_retries > 1 {
            warnings.push(format!(
                "max_retries = {} exceeds the two-configuration limit per unit; extra retries are ignored",
                self.run.max_retries
            ));
        }
        for phase in &self.phases {
            if phase.expected_units == Some(0) {
                warnings.push(format!("phase '{}' expects zero units", phase.name));
            }
        }
        warnings
    }
}

/// Values set on the command line, highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_retries: Option<u32>,
    pub worker_override: Option<usize>,
    pub inputs: Vec<PathBuf>,
}

/// A source document and the file ID it is tracked under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub file_id: String,
    pub path: PathBuf,
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub project_dir: PathBuf,
    pub stagehand_dir: PathBuf,
    pub config_path: PathBuf,
    pub toml: PipelineToml,
    pub cli: CliOverrides,
}

impl PipelineConfig {
    /// Load configuration for a project; `config_path` overrides the default location.
    pub fn new(project_dir: PathBuf, config_path: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let stagehand_dir = project_dir.join(STAGEHAND_DIR);
        let config_path = config_path.unwrap_or_else(|| stagehand_dir.join(CONFIG_FILE));
        let toml = PipelineToml::load_or_default(&config_path)?;

        Ok(Self {
            project_dir,
            stagehand_dir,
            config_path,
            toml,
            cli: CliOverrides::default(),
        })
    }

    pub fn with_cli_overrides(mut self, cli: CliOverrides) -> Self {
        self.cli = cli;
        self
    }

    pub fn state_file(&self) -> PathBuf {
        let configured = &self.toml.store.state_file;
        if configured.is_absolute() {
            configured.clone()
        } else {
            self.stagehand_dir.join(configured)
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.stagehand_dir.join("logs")
    }

    pub fn artifact_root(&self) -> PathBuf {
        match &self.toml.run.artifact_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => self.project_dir.join(root),
            None => self.project_dir.clone(),
        }
    }

    pub fn input_id(&self) -> String {
        self.toml.run.input_id.clone().unwrap_or_else(|| {
            self.project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "pipeline".to_string())
        })
    }

    /// Lock timeout (env → file).
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(
            env_override(ENV_LOCK_TIMEOUT_SECS).unwrap_or(self.toml.store.lock_timeout_secs),
        )
    }

    /// Backup retention (env → file).
    pub fn backup_retention(&self) -> usize {
        env_override(ENV_BACKUP_RETENTION).unwrap_or(self.toml.store.backup_retention)
    }

    /// Max retries (CLI → env → file).
    pub fn max_retries(&self) -> u32 {
        self.cli
            .max_retries
            .or_else(|| env_override(ENV_MAX_RETRIES))
            .unwrap_or(self.toml.run.max_retries)
    }

    pub fn lock_retries(&self) -> u32 {
        self.toml.store.lock_retries
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_lock_timeout(self.lock_timeout())
            .with_backup_retention(self.backup_retention())
    }

    pub fn open_store(&self) -> StateStore {
        StateStore::open(self.state_file(), self.store_options())
    }

    pub fn plan(&self) -> Result<PhasePlan> {
        Ok(PhasePlan::build(self.toml.phases.clone())?)
    }

    pub fn fallback_table(&self) -> FallbackTable {
        FallbackTable::with_rules(&self.toml.fallbacks)
    }

    /// Source documents: CLI `--input` paths, else the configured globs.
    ///
    /// File IDs are file stems and must be unique.
    pub fn input_files(&self) -> Result<Vec<InputFile>> {
        let mut paths: Vec<PathBuf> = Vec::new();
        if !self.cli.inputs.is_empty() {
            for input in &self.cli.inputs {
                let path = if input.is_absolute() {
                    input.clone()
                } else {
                    self.project_dir.join(input)
                };
                if !path.is_file() {
                    bail!("Input file not found: {}", path.display());
                }
                paths.push(path);
            }
        } else {
            for pattern in &self.toml.run.inputs {
                let full = self.project_dir.join(pattern);
                let matches = glob::glob(&full.to_string_lossy())
                    .with_context(|| format!("Invalid input pattern: {}", pattern))?;
                let mut found: Vec<PathBuf> = matches
                    .filter_map(|entry| entry.ok())
                    .filter(|p| p.is_file())
                    .collect();
                found.sort();
                paths.extend(found);
            }
        }

        let mut files: Vec<InputFile> = Vec::new();
        for path in paths {
            let file_id = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .with_context(|| format!("Input has no file name: {}", path.display()))?;
            if let Some(existing) = files.iter().find(|f| f.file_id == file_id) {
                if existing.path == path {
                    continue;
                }
                bail!(
                    "Inputs {} and {} share file id '{}'",
                    existing.path.display(),
                    path.display(),
                    file_id
                );
            }
            files.push(InputFile { file_id, path });
        }
        Ok(files)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Store options for processes that only know the state file path.
///
/// Phase executables inherit the orchestrator's environment, so the env
/// overrides still apply.
pub fn store_options_from_env() -> StoreOptions {
    let defaults = StoreSection::default();
    StoreOptions::default()
        .with_lock_timeout(Duration::from_secs(
            env_override(ENV_LOCK_TIMEOUT_SECS).unwrap_or(defaults.lock_timeout_secs),
        ))
        .with_backup_retention(
            env_override(ENV_BACKUP_RETENTION).unwrap_or(defaults.backup_retention),
        )
}

fn env_override<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
