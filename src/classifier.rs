//! Finds which units of a file need to be re-dispatched.

use std::path::{Path, PathBuf};

use crate::resolver::{artifact_is_usable, resolve_artifact};
use crate::state::{StateDocument, Status, Unit};

/// Unit IDs for a declared count: `"1"..="n"`.
pub fn expected_unit_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| i.to_string()).collect()
}

/// Classifies unit-level failures for one phase and file.
#[derive(Debug, Clone)]
pub struct UnitClassifier {
    artifact_root: PathBuf,
}

impl UnitClassifier {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
        }
    }

    /// Failed unit IDs, in priority order:
    ///
    /// 1. units explicitly marked `failed`, in insertion order;
    /// 2. otherwise, expected units without a usable output artifact.
    ///
    /// `expected` falls back to the record's declared unit count, and then to
    /// the units already recorded.
    pub fn failed_units(
        &self,
        doc: &StateDocument,
        phase: &str,
        file_id: &str,
        expected: Option<usize>,
    ) -> Vec<String> {
        let record = doc.file(phase, file_id);
        let units = record.map(|r| r.units.as_slice()).unwrap_or_default();

        let explicit: Vec<String> = units
            .iter()
            .filter(|u| u.status == Status::Failed)
            .map(|u| u.unit_id.clone())
            .collect();
        if !explicit.is_empty() {
            return explicit;
        }

        let expected_ids = match expected.or_else(|| record.and_then(|r| r.expected_units)) {
            Some(count) => expected_unit_ids(count),
            None => units.iter().map(|u| u.unit_id.clone()).collect(),
        };

        expected_ids
            .into_iter()
            .filter(|id| {
                !units
                    .iter()
                    .find(|u| &u.unit_id == id)
                    .is_some_and(|u| self.has_usable_output(u))
            })
            .collect()
    }

    fn has_usable_output(&self, unit: &Unit) -> bool {
        unit.has_output_ref()
            && unit
                .output_ref
                .as_deref()
                .is_some_and(|r| artifact_is_usable(&resolve_artifact(&self.artifact_root, Path::new(r))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (UnitClassifier, StateDocument, TempDir) {
        let dir = tempdir().unwrap();
        (
            UnitClassifier::new(dir.path()),
            StateDocument::new("book"),
            dir,
        )
    }

    fn write_audio(dir: &TempDir, name: &str) -> String {
        fs::write(dir.path().join(name), b"RIFF....WAVE").unwrap();
        name.to_string()
    }

    #[test]
    fn explicit_failures_win_in_insertion_order() {
        let (classifier, mut doc, dir) = setup();
        let record = doc.file_mut("synthesize", "ch1");
        record.upsert_unit(Unit::failed("5", "silence"));
        record.upsert_unit(Unit::succeeded("1", write_audio(&dir, "1.wav")));
        record.upsert_unit(Unit::failed("2", "wer_too_high"));

        assert_eq!(
            classifier.failed_units(&doc, "synthesize", "ch1", Some(10)),
            vec!["5", "2"]
        );
    }

    #[test]
    fn missing_units_are_detected_from_expected_count() {
        let (classifier, mut doc, dir) = setup();
        let record = doc.file_mut("synthesize", "ch1");
        for i in (1..=10).filter(|i| *i != 3 && *i != 7) {
            let name = write_audio(&dir, &format!("{}.wav", i));
            record.upsert_unit(Unit::succeeded(i.to_string(), name));
        }

        assert_eq!(
            classifier.failed_units(&doc, "synthesize", "ch1", Some(10)),
            vec!["3", "7"]
        );
    }

    #[test]
    fn success_with_missing_or_empty_artifact_counts_as_missing() {
        let (classifier, mut doc, dir) = setup();
        fs::write(dir.path().join("2.wav"), b"").unwrap();
        let record = doc.file_mut("synthesize", "ch1");
        record.upsert_unit(Unit::succeeded("1", "deleted.wav"));
        record.upsert_unit(Unit::succeeded("2", "2.wav"));
        record.upsert_unit(Unit::succeeded("3", write_audio(&dir, "3.wav")));

        assert_eq!(
            classifier.failed_units(&doc, "synthesize", "ch1", Some(3)),
            vec!["1", "2"]
        );
    }

    #[test]
    fn record_expected_units_used_when_not_given() {
        let (classifier, mut doc, _dir) = setup();
        doc.file_mut("synthesize", "ch1").expected_units = Some(2);
        assert_eq!(
            classifier.failed_units(&doc, "synthesize", "ch1", None),
            vec!["1", "2"]
        );
    }

    #[test]
    fn nothing_recorded_and_nothing_expected_is_empty() {
        let (classifier, doc, _dir) = setup();
        assert!(classifier.failed_units(&doc, "synthesize", "ch1", None).is_empty());
    }
}
