//! Skip/reuse decisions for a phase and file.
//!
//! A phase is skipped only when its recorded result is still valid for the
//! current input: status `success`, every recorded artifact present and
//! non-empty, and the recorded content hash equal to the freshly computed one.
//! Nothing is cached between calls.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::hashing;
use crate::state::{StateDocument, Status};

/// Why a phase runs or is skipped for a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UpToDate,
    NotSucceeded(Status),
    MissingArtifact(PathBuf),
    EmptyArtifact(PathBuf),
    HashChanged,
    NoRecordedHash,
    /// The caller asked for a run regardless of state.
    Forced(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "up to date"),
            Self::NotSucceeded(status) => write!(f, "status is {}", status),
            Self::MissingArtifact(p) => write!(f, "artifact missing: {}", p.display()),
            Self::EmptyArtifact(p) => write!(f, "artifact is empty: {}", p.display()),
            Self::HashChanged => write!(f, "input hash changed"),
            Self::NoRecordedHash => write!(f, "no recorded input hash"),
            Self::Forced(why) => write!(f, "forced: {}", why),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: SkipReason,
}

impl SkipDecision {
    fn run(reason: SkipReason) -> Self {
        Self {
            skip: false,
            reason,
        }
    }

    pub fn forced(why: impl Into<String>) -> Self {
        Self::run(SkipReason::Forced(why.into()))
    }
}

/// Resolve an artifact path recorded in state against the artifact root.
pub fn resolve_artifact(root: &Path, recorded: &Path) -> PathBuf {
    if recorded.is_absolute() {
        recorded.to_path_buf()
    } else {
        root.join(recorded)
    }
}

/// Whether a resolved artifact exists and has content.
pub fn artifact_is_usable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
}

/// Decides whether a phase can reuse its previous result for a file.
pub struct DependencyResolver<'a> {
    doc: &'a StateDocument,
    artifact_root: &'a Path,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(doc: &'a StateDocument, artifact_root: &'a Path) -> Self {
        Self { doc, artifact_root }
    }

    pub fn should_skip(&self, phase: &str, file_id: &str, current_input_hash: &str) -> SkipDecision {
        let Some(record) = self.doc.file(phase, file_id) else {
            return SkipDecision::run(SkipReason::NotSucceeded(Status::Pending));
        };

        if record.status != Status::Success {
            return SkipDecision::run(SkipReason::NotSucceeded(record.status));
        }

        for recorded in &record.artifact_paths {
            let path = resolve_artifact(self.artifact_root, recorded);
            if !path.exists() {
                return SkipDecision::run(SkipReason::MissingArtifact(path));
            }
            if !artifact_is_usable(&path) {
                return SkipDecision::run(SkipReason::EmptyArtifact(path));
            }
        }

        match record.content_hash.as_deref() {
            None => SkipDecision::run(SkipReason::NoRecordedHash),
            Some(recorded) if recorded != current_input_hash => {
                SkipDecision::run(SkipReason::HashChanged)
            }
            Some(_) => SkipDecision {
                skip: true,
                reason: SkipReason::UpToDate,
            },
        }
    }
}

/// Computes the input hash a phase would consume for a file.
///
/// Root phases hash the source document. Dependent phases chain each
/// upstream's recorded input hash with the digests of that upstream's
/// artifacts, so a change anywhere upstream changes every downstream hash.
pub struct InputHasher<'a> {
    doc: &'a StateDocument,
    artifact_root: &'a Path,
}

impl<'a> InputHasher<'a> {
    pub fn new(doc: &'a StateDocument, artifact_root: &'a Path) -> Self {
        Self { doc, artifact_root }
    }

    pub fn input_hash(&self, upstream: &[String], file_id: &str, source: &Path) -> io::Result<String> {
        if upstream.is_empty() {
            return hashing::sha256_file(source);
        }

        let mut parts: Vec<(String, String)> = Vec::new();
        for dep in upstream {
            let record = self.doc.file(dep, file_id);
            let hash = record
                .and_then(|r| r.content_hash.clone())
                .unwrap_or_else(|| "none".to_string());
            parts.push(("upstream".to_string(), dep.clone()));
            parts.push(("hash".to_string(), hash));

            for recorded in record.map(|r| r.artifact_paths.as_slice()).unwrap_or_default() {
                let path = resolve_artifact(self.artifact_root, recorded);
                let digest = match hashing::sha256_file(&path) {
                    Ok(d) => d,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => "missing".to_string(),
                    Err(e) => return Err(e),
                };
                parts.push((recorded.to_string_lossy().to_string(), digest));
            }
        }

        Ok(hashing::combine(
            parts.iter().map(|(l, v)| (l.as_str(), v.as_str())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FileRecord;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (StateDocument, TempDir) {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("chapter1.txt"), b"It was a dark night.").unwrap();
        fs::write(dir.path().join("chapter1.chunks.json"), b"[\"It was\"]").unwrap();
        (StateDocument::new("book"), dir)
    }

    fn succeed(doc: &mut StateDocument, phase: &str, hash: &str, artifact: &str) {
        *doc.file_mut(phase, "chapter1") = FileRecord {
            status: Status::Success,
            content_hash: Some(hash.to_string()),
            artifact_paths: vec![PathBuf::from(artifact)],
            ..Default::default()
        };
    }

    #[test]
    fn skips_when_everything_matches() {
        let (mut doc, dir) = setup();
        let hash = InputHasher::new(&doc, dir.path())
            .input_hash(&[], "chapter1", &dir.path().join("chapter1.txt"))
            .unwrap();
        succeed(&mut doc, "chunk", &hash, "chapter1.chunks.json");

        let resolver = DependencyResolver::new(&doc, dir.path());
        let decision = resolver.should_skip("chunk", "chapter1", &hash);
        assert!(decision.skip);
        assert_eq!(decision.reason, SkipReason::UpToDate);

        // Evaluated fresh each time, same answer.
        assert_eq!(resolver.should_skip("chunk", "chapter1", &hash), decision);
    }

    #[test]
    fn runs_when_never_recorded() {
        let (doc, dir) = setup();
        let decision = DependencyResolver::new(&doc, dir.path()).should_skip("chunk", "chapter1", "h");
        assert!(!decision.skip);
    }

    #[test]
    fn runs_when_not_success() {
        let (mut doc, dir) = setup();
        succeed(&mut doc, "chunk", "h", "chapter1.chunks.json");
        doc.file_mut("chunk", "chapter1").status = Status::Partial;
        let decision = DependencyResolver::new(&doc, dir.path()).should_skip("chunk", "chapter1", "h");
        assert_eq!(decision.reason, SkipReason::NotSucceeded(Status::Partial));
    }

    #[test]
    fn runs_when_artifact_missing_or_empty() {
        let (mut doc, dir) = setup();
        succeed(&mut doc, "chunk", "h", "gone.json");
        let decision = DependencyResolver::new(&doc, dir.path()).should_skip("chunk", "chapter1", "h");
        assert!(matches!(decision.reason, SkipReason::MissingArtifact(_)));

        fs::write(dir.path().join("empty.json"), b"").unwrap();
        succeed(&mut doc, "chunk", "h", "empty.json");
        let decision = DependencyResolver::new(&doc, dir.path()).should_skip("chunk", "chapter1", "h");
        assert!(matches!(decision.reason, SkipReason::EmptyArtifact(_)));
    }

    #[test]
    fn runs_when_hash_differs() {
        let (mut doc, dir) = setup();
        succeed(&mut doc, "chunk", "old", "chapter1.chunks.json");
        let decision =
            DependencyResolver::new(&doc, dir.path()).should_skip("chunk", "chapter1", "new");
        assert_eq!(decision.reason, SkipReason::HashChanged);
    }

    #[test]
    fn upstream_change_invalidates_downstream_hash() {
        let (mut doc, dir) = setup();
        let source = dir.path().join("chapter1.txt");
        let root_hash = InputHasher::new(&doc, dir.path())
            .input_hash(&[], "chapter1", &source)
            .unwrap();
        succeed(&mut doc, "chunk", &root_hash, "chapter1.chunks.json");

        let upstream = vec!["chunk".to_string()];
        let before = InputHasher::new(&doc, dir.path())
            .input_hash(&upstream, "chapter1", &source)
            .unwrap();
        succeed(&mut doc, "synthesize", &before, "chapter1.chunks.json");

        // Edit the source: the root phase hash changes.
        fs::write(&source, b"It was a bright morning.").unwrap();
        let new_root = InputHasher::new(&doc, dir.path())
            .input_hash(&[], "chapter1", &source)
            .unwrap();
        assert_ne!(new_root, root_hash);

        // The root phase re-runs and records the new hash; downstream follows.
        succeed(&mut doc, "chunk", &new_root, "chapter1.chunks.json");
        let after = InputHasher::new(&doc, dir.path())
            .input_hash(&upstream, "chapter1", &source)
            .unwrap();
        assert_ne!(before, after);
        assert!(!DependencyResolver::new(&doc, dir.path())
            .should_skip("synthesize", "chapter1", &after)
            .skip);
    }

    #[test]
    fn upstream_artifact_bytes_feed_downstream_hash() {
        let (mut doc, dir) = setup();
        succeed(&mut doc, "chunk", "h", "chapter1.chunks.json");
        let upstream = vec!["chunk".to_string()];
        let source = dir.path().join("chapter1.txt");

        let before = InputHasher::new(&doc, dir.path())
            .input_hash(&upstream, "chapter1", &source)
            .unwrap();
        fs::write(dir.path().join("chapter1.chunks.json"), b"[\"changed\"]").unwrap();
        let after = InputHasher::new(&doc, dir.path())
            .input_hash(&upstream, "chapter1", &source)
            .unwrap();
        assert_ne!(before, after);
    }
}
