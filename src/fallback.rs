//! Engine fallback selection for units that fail validation.
//!
//! A unit gets at most [`MAX_CONFIGURATIONS_PER_UNIT`] configurations per run:
//! its primary engine config, then the fallback engine's own builtin voice for
//! the content category. A cloned voice identity is never carried across
//! engines.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Hard ceiling on configurations tried per unit per run.
pub const MAX_CONFIGURATIONS_PER_UNIT: u32 = 2;

/// Speech synthesis engines the pipeline can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Voice-cloning engine driven by a reference recording.
    Xtts,
    /// Builtin-voice engine.
    Kokoro,
    /// Lightweight builtin-voice engine.
    Piper,
}

impl EngineKind {
    pub fn supports_voice_cloning(&self) -> bool {
        matches!(self, Self::Xtts)
    }

    /// Engine switched to when this one fails.
    pub fn default_fallback(&self) -> EngineKind {
        match self {
            Self::Xtts => Self::Kokoro,
            Self::Kokoro => Self::Piper,
            Self::Piper => Self::Kokoro,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xtts => "xtts",
            Self::Kokoro => "kokoro",
            Self::Piper => "piper",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content being narrated; selects the builtin voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    #[default]
    Narration,
    Dialogue,
}

/// Which voice an engine speaks with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VoiceIdentity {
    /// One of the engine's own voices.
    Builtin { voice_id: String },
    /// A cloned identity from a reference recording. Only valid on engines
    /// that support cloning.
    Cloned { reference_audio: PathBuf },
}

/// Engine plus voice identity handed to a phase executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub voice: VoiceIdentity,
}

impl EngineConfig {
    pub fn builtin(kind: EngineKind, voice_id: impl Into<String>) -> Self {
        Self {
            kind,
            voice: VoiceIdentity::Builtin {
                voice_id: voice_id.into(),
            },
        }
    }

    pub fn cloned(kind: EngineKind, reference_audio: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            voice: VoiceIdentity::Cloned {
                reference_audio: reference_audio.into(),
            },
        }
    }

    /// Short label stored as a unit's `engine_used`.
    pub fn label(&self) -> String {
        match &self.voice {
            VoiceIdentity::Builtin { voice_id } => format!("{}:{}", self.kind, voice_id),
            VoiceIdentity::Cloned { reference_audio } => format!(
                "{}:cloned:{}",
                self.kind,
                reference_audio
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            ),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match &self.voice {
            VoiceIdentity::Cloned { .. } if !self.kind.supports_voice_cloning() => Err(format!(
                "engine {} does not support cloned voice identities",
                self.kind
            )),
            VoiceIdentity::Builtin { voice_id } if voice_id.trim().is_empty() => {
                Err(format!("engine {} has an empty builtin voice id", self.kind))
            }
            _ => Ok(()),
        }
    }
}

/// One row of the fallback table as written in `pipeline.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub primary: EngineKind,
    pub fallback: EngineKind,
    #[serde(default)]
    pub category: ContentCategory,
    pub voice_id: String,
}

/// Maps `(primary, fallback, category)` to the fallback's builtin voice.
#[derive(Debug, Clone)]
pub struct FallbackTable {
    voices: HashMap<(EngineKind, EngineKind, ContentCategory), String>,
    preferred: HashMap<EngineKind, EngineKind>,
}

impl Default for FallbackTable {
    fn default() -> Self {
        use ContentCategory::*;
        use EngineKind::*;

        let voices = [
            (Xtts, Kokoro, Narration, "af_bella"),
            (Xtts, Kokoro, Dialogue, "am_michael"),
            (Xtts, Piper, Narration, "en_US-lessac-medium"),
            (Xtts, Piper, Dialogue, "en_US-ryan-high"),
            (Kokoro, Piper, Narration, "en_US-lessac-medium"),
            (Kokoro, Piper, Dialogue, "en_US-ryan-high"),
            (Piper, Kokoro, Narration, "af_bella"),
            (Piper, Kokoro, Dialogue, "am_michael"),
        ]
        .into_iter()
        .map(|(p, f, c, v)| ((p, f, c), v.to_string()))
        .collect();

        let preferred = [Xtts, Kokoro, Piper]
            .into_iter()
            .map(|k| (k, k.default_fallback()))
            .collect();

        Self { voices, preferred }
    }
}

impl FallbackTable {
    /// Defaults with configured rules layered on top.
    ///
    /// The first rule listed for a primary engine also becomes its preferred
    /// fallback.
    pub fn with_rules(rules: &[FallbackRule]) -> Self {
        let mut table = Self::default();
        let mut seen_primary = Vec::new();
        for rule in rules {
            table.voices.insert(
                (rule.primary, rule.fallback, rule.category),
                rule.voice_id.clone(),
            );
            if !seen_primary.contains(&rule.primary) {
                table.preferred.insert(rule.primary, rule.fallback);
                seen_primary.push(rule.primary);
            }
        }
        table
    }

    /// Builtin voice of `fallback` to use when replacing `primary`.
    pub fn builtin_default(
        &self,
        primary: EngineKind,
        fallback: EngineKind,
        category: ContentCategory,
    ) -> Option<&str> {
        self.voices
            .get(&(primary, fallback, category))
            .map(String::as_str)
    }

    /// Full fallback config for a primary engine, if one is configured.
    pub fn fallback_for(
        &self,
        primary: EngineKind,
        category: ContentCategory,
    ) -> Option<EngineConfig> {
        let fallback = *self.preferred.get(&primary)?;
        if fallback == primary {
            return None;
        }
        let voice_id = self.builtin_default(primary, fallback, category)?;
        Some(EngineConfig::builtin(fallback, voice_id))
    }
}

/// Label for a possibly absent configuration.
pub fn config_label(config: Option<&EngineConfig>) -> String {
    config.map_or_else(|| "default".to_string(), EngineConfig::label)
}

/// One failed attempt at producing a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    /// `None` for phases that run without an engine configuration.
    pub config: Option<EngineConfig>,
    pub reason: String,
    /// The invocation crashed or timed out rather than failing validation.
    pub crashed: bool,
    /// A same-config retry after a crash that did not count toward the bound.
    pub free_retry: bool,
}

/// Failed attempts for one unit within the current run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureHistory {
    attempts: Vec<Attempt>,
}

impl FailureHistory {
    pub fn record(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn last(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Attempts that count toward [`MAX_CONFIGURATIONS_PER_UNIT`].
    pub fn counted(&self) -> u32 {
        self.attempts.iter().filter(|a| !a.free_retry).count() as u32
    }

    pub fn used_free_retry(&self) -> bool {
        self.attempts.iter().any(|a| a.free_retry)
    }

    pub fn tried_kind(&self, kind: EngineKind) -> bool {
        self.attempts
            .iter()
            .any(|a| a.config.as_ref().is_some_and(|c| c.kind == kind))
    }

    /// Labels of every configuration tried, in order.
    pub fn labels(&self) -> Vec<String> {
        self.attempts
            .iter()
            .map(|a| config_label(a.config.as_ref()))
            .collect()
    }
}

/// What to do next with a failed unit.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackDecision {
    /// Free re-run with the configuration that crashed.
    CrashRetry(Option<EngineConfig>),
    /// Counted re-run with the same configuration; only for phases without
    /// an engine, which have nothing to fall back to.
    RetrySame(Option<EngineConfig>),
    /// Counted re-run with a different engine's builtin configuration.
    Fallback(EngineConfig),
    /// Give up: the unit is permanently failed for this run.
    Exhausted { reason: String },
}

impl FallbackDecision {
    pub fn config(&self) -> Option<&EngineConfig> {
        match self {
            Self::CrashRetry(c) | Self::RetrySame(c) => c.as_ref(),
            Self::Fallback(c) => Some(c),
            Self::Exhausted { .. } => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::CrashRetry(_))
    }
}

/// Chooses fallback configurations for failed units.
#[derive(Debug, Clone)]
pub struct FallbackCoordinator {
    table: FallbackTable,
    max_configurations: u32,
    crash_retry_same_config: bool,
}

impl FallbackCoordinator {
    /// `max_retries` is the number of re-dispatch rounds allowed after the
    /// primary attempt; it can lower but never raise the per-unit ceiling.
    pub fn new(table: FallbackTable, max_retries: u32) -> Self {
        Self {
            table,
            max_configurations: (1 + max_retries).min(MAX_CONFIGURATIONS_PER_UNIT),
            crash_retry_same_config: false,
        }
    }

    pub fn with_crash_retry_same_config(mut self, enabled: bool) -> Self {
        self.crash_retry_same_config = enabled;
        self
    }

    pub fn max_configurations(&self) -> u32 {
        self.max_configurations
    }

    /// Pick the next configuration for a unit whose failed attempts are in
    /// `history`. An empty history means the primary has not run yet.
    pub fn select_fallback(
        &self,
        primary: Option<&EngineConfig>,
        category: ContentCategory,
        history: &FailureHistory,
    ) -> FallbackDecision {
        let Some(last) = history.last() else {
            return FallbackDecision::RetrySame(primary.cloned());
        };

        if self.crash_retry_same_config && last.crashed && !history.used_free_retry() {
            return FallbackDecision::CrashRetry(last.config.clone());
        }

        if history.counted() >= self.max_configurations {
            return FallbackDecision::Exhausted {
                reason: format!(
                    "failed under {} configuration(s), last: {} ({})",
                    history.counted(),
                    config_label(last.config.as_ref()),
                    last.reason
                ),
            };
        }

        let Some(primary) = primary else {
            return FallbackDecision::RetrySame(None);
        };
        match self.table.fallback_for(primary.kind, category) {
            Some(config) if !history.tried_kind(config.kind) => FallbackDecision::Fallback(config),
            _ => FallbackDecision::Exhausted {
                reason: format!(
                    "no fallback engine available for {} ({})",
                    primary.kind, last.reason
                ),
            },
        }
    }
}
