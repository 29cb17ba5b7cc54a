//! The phase driver.
//!
//! Files run concurrently, one task per file. Within a file, phases run in
//! dependency order. Every invocation holds a permit from its phase's
//! semaphore for exactly as long as the executable runs, so retries never
//! wait on a permit held by their own file task.

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::report::{Disposition, PhaseFileOutcome, RunReport, UnitFailure};
use crate::classifier::{UnitClassifier, expected_unit_ids};
use crate::errors::{OrchestratorError, StateError};
use crate::fallback::{
    Attempt, EngineConfig, FailureHistory, FallbackCoordinator, FallbackDecision, FallbackTable,
    config_label,
};
use crate::invoke::{InvocationOutcome, PhaseInvoker, UnitScope, WorkDescriptor};
use crate::phase::{PhaseDefinition, PhasePlan};
use crate::pipeline_config::InputFile;
use crate::resolver::{
    DependencyResolver, InputHasher, SkipDecision, SkipReason, resolve_artifact,
};
use crate::state::{ErrorEntry, FileRecord, StateDocument, StateStore, Status, Transaction, Unit};
use crate::workers::WorkerPolicy;

const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Knobs for one `run`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Recorded in the state document on first initialization
    pub input_id: String,
    /// Requested phases; empty runs every configured phase
    pub phases: Vec<String>,
    pub resume: bool,
    pub max_retries: u32,
    pub crash_retry_same_config: bool,
    /// Commit attempts retried after lock contention
    pub lock_retries: u32,
    pub artifact_root: PathBuf,
    pub fallback_table: FallbackTable,
    pub workers: WorkerPolicy,
}

impl RunOptions {
    pub fn new(input_id: impl Into<String>, artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            input_id: input_id.into(),
            phases: Vec::new(),
            resume: true,
            max_retries: 1,
            crash_retry_same_config: false,
            lock_retries: 3,
            artifact_root: artifact_root.into(),
            fallback_table: FallbackTable::default(),
            workers: WorkerPolicy::detect(None),
        }
    }
}

/// Refuse to run `phase` for `file_id` unless every dependency succeeded.
pub fn ensure_dependencies(
    doc: &StateDocument,
    phase: &PhaseDefinition,
    file_id: &str,
) -> Result<(), OrchestratorError> {
    for dep in &phase.depends_on {
        let status = doc.file_status(dep, file_id);
        if status != Status::Success {
            return Err(OrchestratorError::DependencyViolation {
                phase: phase.name.clone(),
                file_id: file_id.to_string(),
                dependency: dep.clone(),
                status,
            });
        }
    }
    Ok(())
}

pub struct Orchestrator {
    store: StateStore,
    plan: PhasePlan,
    invoker: Arc<dyn PhaseInvoker>,
    options: RunOptions,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        plan: PhasePlan,
        invoker: Arc<dyn PhaseInvoker>,
        options: RunOptions,
    ) -> Self {
        Self {
            store,
            plan,
            invoker,
            options,
        }
    }

    /// Drive every requested phase over `inputs`.
    ///
    /// Returns `Err` only for failures that stop the run as a whole (state
    /// store errors, bad phase selection). Phase and unit failures are in the
    /// report.
    pub async fn run(&self, inputs: &[InputFile]) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let mut report = RunReport::new(&run_id);

        let phases: Vec<PhaseDefinition> = self
            .plan
            .select(&self.options.phases)?
            .into_iter()
            .cloned()
            .collect();

        let semaphores: HashMap<String, Arc<Semaphore>> = phases
            .iter()
            .map(|p| {
                let workers = self.options.workers.worker_count(p.max_workers);
                tracing::debug!(phase = %p.name, workers, "phase worker pool");
                (p.name.clone(), Arc::new(Semaphore::new(workers)))
            })
            .collect();

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            store: self.store.clone(),
            invoker: Arc::clone(&self.invoker),
            classifier: UnitClassifier::new(&self.options.artifact_root),
            fallback: FallbackCoordinator::new(
                self.options.fallback_table.clone(),
                self.options.max_retries,
            )
            .with_crash_retry_same_config(self.options.crash_retry_same_config),
            phases,
            semaphores,
            options: self.options.clone(),
            aborted: AtomicBool::new(false),
            abort_reason: Mutex::new(None),
        });

        let input_id = self.options.input_id.clone();
        ctx.blocking(move |store| store.initialize(&input_id))
            .await?;
        let rid = run_id.clone();
        ctx.commit("run_start", move |txn| {
            txn.metadata.run_id = Some(rid.clone());
            Ok(())
        })
        .await?;

        tracing::info!(
            run_id = %run_id,
            phases = ?ctx.phases.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            files = inputs.len(),
            resume = self.options.resume,
            "starting run"
        );

        let mut tasks = JoinSet::new();
        for (index, input) in inputs.iter().cloned().enumerate() {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move { (index, ctx.process_file(input).await) });
        }

        let mut per_file: BTreeMap<usize, Vec<PhaseFileOutcome>> = BTreeMap::new();
        let mut fatal: Option<OrchestratorError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(outcomes))) => {
                    per_file.insert(index, outcomes);
                }
                Ok((_, Err(err))) => {
                    ctx.abort(err.to_string());
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    ctx.abort(join_err.to_string());
                    fatal.get_or_insert(OrchestratorError::Other(anyhow::anyhow!(
                        "file task failed: {}",
                        join_err
                    )));
                }
            }
        }

        if let Some(err) = fatal {
            tracing::error!(run_id = %run_id, error = %err, "run failed");
            return Err(err);
        }

        report.outcomes = per_file.into_values().flatten().collect();
        report.aborted = ctx.abort_reason();
        report.finished_at = Utc::now();
        tracing::info!(
            run_id = %run_id,
            status = %report.overall_status(),
            outcomes = report.outcomes.len(),
            "run finished"
        );
        Ok(report)
    }
}

/// One invocation to make in a dispatch round.
#[derive(Debug, Clone)]
struct Dispatch {
    scope: UnitScope,
    config: Option<EngineConfig>,
    /// Free crash retry; does not count toward the configuration bound
    free: bool,
}

/// Everything decided before a phase is invoked for a file.
struct Prepared {
    hash: String,
    decision: SkipDecision,
    scope: UnitScope,
    /// Every unit is already valid; only the final commit is missing
    complete: bool,
    snapshot: FileRecord,
    input_refs: Vec<PathBuf>,
    expected: Option<usize>,
}

/// Result of committing one dispatch round.
struct RoundCommit {
    failed: Vec<String>,
    record: FileRecord,
    /// Set when a scope-`all` invocation failed for a phase that declares no
    /// units; the whole file is then retried as one implicit unit.
    file_failure: Option<String>,
}

struct RunContext {
    run_id: String,
    store: StateStore,
    invoker: Arc<dyn PhaseInvoker>,
    classifier: UnitClassifier,
    fallback: FallbackCoordinator,
    phases: Vec<PhaseDefinition>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    options: RunOptions,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl RunContext {
    fn abort(&self, reason: String) {
        if let Ok(mut slot) = self.abort_reason.lock()
            && slot.is_none()
        {
            tracing::warn!(%reason, "aborting run");
            *slot = Some(reason);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn abort_reason(&self) -> Option<String> {
        self.abort_reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// Run a synchronous store operation off the async workers.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StateError>
    where
        F: FnOnce(&StateStore) -> Result<T, StateError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StateError::io("State task failed", std::io::Error::other(e.to_string())))?
    }

    /// Commit a transaction, retrying lock contention `lock_retries` times.
    async fn commit<T, F>(&self, operation: &'static str, mutate: F) -> Result<T, StateError>
    where
        F: Fn(&mut Transaction<'_>) -> Result<T, StateError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let mutate = Arc::new(mutate);
        let mut retries = 0u32;
        loop {
            let m = Arc::clone(&mutate);
            let result = self
                .blocking(move |store| store.transaction(operation, |txn| m(txn)))
                .await;
            match result {
                Err(err) if err.is_lock_contention() && retries < self.options.lock_retries => {
                    retries += 1;
                    tracing::warn!(operation, retries, "state lock contended, retrying commit");
                    tokio::time::sleep(LOCK_RETRY_BACKOFF * retries).await;
                }
                other => return other,
            }
        }
    }

    async fn process_file(&self, input: InputFile) -> Result<Vec<PhaseFileOutcome>, OrchestratorError> {
        let mut outcomes = Vec::new();
        let mut reran: HashSet<String> = HashSet::new();

        for phase in &self.phases {
            let outcome = |disposition| PhaseFileOutcome {
                phase: phase.name.clone(),
                file_id: input.file_id.clone(),
                disposition,
            };

            if self.is_aborted() {
                outcomes.push(outcome(Disposition::Stopped));
                continue;
            }

            let upstream_reran = phase
                .depends_on
                .iter()
                .find(|dep| reran.contains(*dep))
                .cloned();

            match self.run_phase(phase, &input, upstream_reran).await {
                Ok(disposition) => {
                    if let Disposition::Ran { status, .. } = &disposition {
                        reran.insert(phase.name.clone());
                        if *status == Status::Failed && phase.required {
                            self.abort(format!(
                                "required phase '{}' failed for {}",
                                phase.name, input.file_id
                            ));
                        }
                    }
                    outcomes.push(outcome(disposition));
                }
                Err(OrchestratorError::DependencyViolation {
                    dependency, status, ..
                }) => {
                    tracing::warn!(
                        phase = %phase.name,
                        file_id = %input.file_id,
                        %dependency,
                        %status,
                        "phase blocked by dependency"
                    );
                    outcomes.push(outcome(Disposition::Blocked { dependency, status }));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }

    async fn run_phase(
        &self,
        phase: &PhaseDefinition,
        input: &InputFile,
        upstream_reran: Option<String>,
    ) -> Result<Disposition, OrchestratorError> {
        let prep = self.prepare(phase, input, upstream_reran).await?;
        if prep.decision.skip {
            tracing::info!(phase = %phase.name, file_id = %input.file_id, "skipping, up to date");
            return Ok(Disposition::Skipped {
                reason: prep.decision.reason.to_string(),
            });
        }

        if prep.complete {
            tracing::info!(
                phase = %phase.name,
                file_id = %input.file_id,
                "all units already valid, finalizing without invoking"
            );
            let status = self
                .commit_finish(phase, &input.file_id, &prep, Vec::new(), 0, true)
                .await?;
            return Ok(Disposition::Ran {
                status,
                retried_units: Vec::new(),
                failures: Vec::new(),
            });
        }

        tracing::info!(
            phase = %phase.name,
            file_id = %input.file_id,
            reason = %prep.decision.reason,
            scope = %prep.scope.as_env(),
            "running phase"
        );
        self.commit_start(phase, &input.file_id, &prep).await?;

        let mut snapshot = prep.snapshot.clone();
        let mut histories: BTreeMap<String, FailureHistory> = BTreeMap::new();
        let mut file_history = FailureHistory::default();
        let mut failures: Vec<UnitFailure> = Vec::new();
        let mut retried: Vec<String> = Vec::new();
        let mut round = vec![Dispatch {
            scope: prep.scope.clone(),
            config: phase.engine.clone(),
            free: false,
        }];
        let mut attempt = 1u32;

        let last_round_ok = loop {
            let results = self.dispatch_round(phase, input, &prep, round, attempt).await;
            let round_ok = results.iter().all(|(_, outcome)| outcome.is_success());
            let committed = self
                .commit_round(phase, &input.file_id, &snapshot, &results, prep.expected)
                .await?;

            for (dispatch, outcome) in &results {
                let ids: Vec<&String> = match &dispatch.scope {
                    UnitScope::All => committed.failed.iter().collect(),
                    UnitScope::Units(ids) => ids
                        .iter()
                        .filter(|id| committed.failed.contains(*id))
                        .collect(),
                };
                for id in ids {
                    let reason = committed
                        .record
                        .unit(id)
                        .map(Unit::failure_reason)
                        .unwrap_or_else(|| "no output produced".to_string());
                    histories.entry(id.clone()).or_default().record(Attempt {
                        config: dispatch.config.clone(),
                        reason,
                        crashed: !outcome.is_success(),
                        free_retry: dispatch.free,
                    });
                }
            }
            snapshot = committed.record;

            let mut next = Vec::new();
            if let Some(reason) = &committed.file_failure {
                if let Some((dispatch, _)) = results.iter().find(|(d, _)| d.scope == UnitScope::All) {
                    file_history.record(Attempt {
                        config: dispatch.config.clone(),
                        reason: reason.clone(),
                        crashed: true,
                        free_retry: dispatch.free,
                    });
                }
                match self.fallback.select_fallback(
                    phase.engine.as_ref(),
                    phase.content_category,
                    &file_history,
                ) {
                    FallbackDecision::Exhausted { reason } => {
                        tracing::warn!(
                            phase = %phase.name,
                            file_id = %input.file_id,
                            %reason,
                            "file permanently failed"
                        );
                    }
                    decision => next.push(Dispatch {
                        scope: UnitScope::All,
                        config: decision.config().cloned(),
                        free: decision.is_free(),
                    }),
                }
            }

            for id in &committed.failed {
                if failures.iter().any(|f| &f.unit_id == id) {
                    continue;
                }
                let history = histories.entry(id.clone()).or_default();
                match self
                    .fallback
                    .select_fallback(phase.engine.as_ref(), phase.content_category, history)
                {
                    FallbackDecision::Exhausted { reason } => {
                        tracing::warn!(
                            phase = %phase.name,
                            file_id = %input.file_id,
                            unit_id = %id,
                            %reason,
                            "unit permanently failed"
                        );
                        failures.push(UnitFailure {
                            unit_id: id.clone(),
                            reason: history.last().map_or(reason, |a| a.reason.clone()),
                            engines: history.labels(),
                        });
                    }
                    decision => {
                        if !retried.contains(id) {
                            retried.push(id.clone());
                        }
                        next.push(Dispatch {
                            scope: UnitScope::Units(vec![id.clone()]),
                            config: decision.config().cloned(),
                            free: decision.is_free(),
                        });
                    }
                }
            }

            if next.is_empty() {
                break round_ok;
            }
            tracing::info!(
                phase = %phase.name,
                file_id = %input.file_id,
                units = ?next.iter().map(|d| d.scope.as_env()).collect::<Vec<_>>(),
                "re-dispatching failed work"
            );
            round = next;
            attempt += 1;
        };

        let status = self
            .commit_finish(
                phase,
                &input.file_id,
                &prep,
                failures.clone(),
                retried.len(),
                last_round_ok,
            )
            .await?;
        tracing::info!(phase = %phase.name, file_id = %input.file_id, %status, "phase finished");

        Ok(Disposition::Ran {
            status,
            retried_units: retried,
            failures,
        })
    }

    /// Dependency check, input hash, skip decision and retry scope.
    async fn prepare(
        &self,
        phase: &PhaseDefinition,
        input: &InputFile,
        upstream_reran: Option<String>,
    ) -> Result<Prepared, OrchestratorError> {
        let store = self.store.clone();
        let phase = phase.clone();
        let input = input.clone();
        let root = self.options.artifact_root.clone();
        let resume = self.options.resume;
        let classifier = self.classifier.clone();

        tokio::task::spawn_blocking(move || -> Result<Prepared, OrchestratorError> {
            let doc = store.read()?;
            ensure_dependencies(&doc, &phase, &input.file_id)?;

            let hash = InputHasher::new(&doc, &root)
                .input_hash(&phase.depends_on, &input.file_id, &input.path)
                .map_err(|e| {
                    anyhow::Error::new(e).context(format!(
                        "Failed to hash input of phase '{}' for {}",
                        phase.name, input.file_id
                    ))
                })?;

            let decision = if !resume {
                SkipDecision::forced("resume disabled")
            } else if let Some(up) = upstream_reran {
                SkipDecision::forced(format!("upstream '{}' re-ran", up))
            } else {
                DependencyResolver::new(&doc, &root).should_skip(&phase.name, &input.file_id, &hash)
            };

            let snapshot = doc
                .file(&phase.name, &input.file_id)
                .cloned()
                .unwrap_or_default();
            let expected = phase.expected_units.or(snapshot.expected_units);

            // Resume only the broken units of an unfinished result for the same input.
            let resumable = matches!(
                decision.reason,
                SkipReason::NotSucceeded(Status::Partial | Status::Failed | Status::Running)
            ) && snapshot.content_hash.as_deref() == Some(hash.as_str())
                && !snapshot.units.is_empty();
            let pending = resumable
                .then(|| classifier.failed_units(&doc, &phase.name, &input.file_id, expected));
            // Interrupted after every unit reported valid but before the final commit.
            let complete = pending.as_ref().is_some_and(Vec::is_empty)
                && snapshot.units.iter().all(|u| u.status == Status::Success);
            let scope = match pending {
                Some(ids) if !ids.is_empty() => UnitScope::Units(ids),
                _ => UnitScope::All,
            };

            let input_refs = if phase.depends_on.is_empty() {
                vec![input.path.clone()]
            } else {
                phase
                    .depends_on
                    .iter()
                    .filter_map(|dep| doc.file(dep, &input.file_id))
                    .flat_map(|r| r.artifact_paths.iter())
                    .map(|p| resolve_artifact(&root, p))
                    .collect()
            };

            Ok(Prepared {
                hash,
                decision,
                scope,
                complete,
                snapshot,
                input_refs,
                expected,
            })
        })
        .await
        .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("prepare task failed: {}", e)))?
    }

    async fn commit_start(
        &self,
        phase: &PhaseDefinition,
        file_id: &str,
        prep: &Prepared,
    ) -> Result<(), StateError> {
        let phase_name = phase.name.clone();
        let file_id = file_id.to_string();
        let hash = prep.hash.clone();
        let expected = prep.expected;
        let scope = prep.scope.clone();

        self.commit("phase_start", move |txn| {
            let now = txn.now();
            let block = txn.phase_mut(&phase_name);
            if block.status != Status::Running {
                block.timestamps.begin(now);
            }
            let record = txn.file_mut(&phase_name, &file_id);
            record.status = Status::Running;
            record.timestamps.begin(now);
            record.content_hash = Some(hash.clone());
            if expected.is_some() {
                record.expected_units = expected;
            }
            for unit in record.units.iter_mut().filter(|u| scope.contains(&u.unit_id)) {
                unit.attempts = 0;
            }
            Ok(())
        })
        .await
    }

    async fn dispatch_round(
        &self,
        phase: &PhaseDefinition,
        input: &InputFile,
        prep: &Prepared,
        round: Vec<Dispatch>,
        attempt: u32,
    ) -> Vec<(Dispatch, InvocationOutcome)> {
        let semaphore = self.semaphores.get(&phase.name).cloned();

        let invocations = round.into_iter().map(|dispatch| {
            let work = WorkDescriptor {
                phase: phase.name.clone(),
                file_id: input.file_id.clone(),
                input_artifact_refs: prep.input_refs.clone(),
                unit_scope: dispatch.scope.clone(),
                configuration: dispatch.config.clone(),
                content_category: phase.content_category,
                attempt,
                expected_units: prep.expected,
                artifact_root: self.options.artifact_root.clone(),
            };
            let deadline = match &dispatch.scope {
                UnitScope::All => phase.timeout(),
                UnitScope::Units(ids) => (phase.unit_timeout() * ids.len().max(1) as u32)
                    .min(phase.timeout()),
            };
            let semaphore = semaphore.clone();

            async move {
                let _permit = match semaphore {
                    Some(s) => match s.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            return (
                                dispatch,
                                InvocationOutcome::SpawnFailed("worker pool closed".into()),
                            );
                        }
                    },
                    None => None,
                };
                let outcome = self.invoker.invoke(phase, &work, deadline).await;
                if let Some(reason) = outcome.failure_reason() {
                    tracing::warn!(
                        phase = %work.phase,
                        file_id = %work.file_id,
                        scope = %work.unit_scope.as_env(),
                        attempt,
                        %reason,
                        "invocation failed"
                    );
                }
                (dispatch, outcome)
            }
        });

        join_all(invocations).await
    }

    /// Record one round's outcomes and classify what still needs work.
    async fn commit_round(
        &self,
        phase: &PhaseDefinition,
        file_id: &str,
        snapshot: &FileRecord,
        results: &[(Dispatch, InvocationOutcome)],
        expected: Option<usize>,
    ) -> Result<RoundCommit, StateError> {
        let phase_name = phase.name.clone();
        let file_id = file_id.to_string();
        let snapshot = snapshot.clone();
        let results = results.to_vec();
        let classifier = self.classifier.clone();

        // Units outside every dispatched scope must come out of the round unchanged.
        let round_scope: Option<Vec<String>> = if results
            .iter()
            .any(|(d, _)| d.scope == UnitScope::All)
        {
            None
        } else {
            Some(
                results
                    .iter()
                    .flat_map(|(d, _)| match &d.scope {
                        UnitScope::Units(ids) => ids.clone(),
                        UnitScope::All => Vec::new(),
                    })
                    .collect(),
            )
        };

        self.commit("phase_round", move |txn| {
            if let Some(scope) = &round_scope {
                let restored = txn.restore_out_of_scope(&phase_name, &file_id, &snapshot, scope);
                if !restored.is_empty() {
                    tracing::warn!(
                        phase = %phase_name,
                        file_id = %file_id,
                        units = ?restored,
                        "restored units modified outside the retry scope"
                    );
                }
            }

            let mut file_failure = None;
            let record = txn.file_mut(&phase_name, &file_id);
            for (dispatch, outcome) in &results {
                let declared = match &dispatch.scope {
                    UnitScope::Units(ids) => ids.clone(),
                    UnitScope::All => declared_units(record, expected),
                };
                let label = config_label(dispatch.config.as_ref());

                if let Some(reason) = outcome.failure_reason() {
                    record.errors.push(ErrorEntry {
                        file_id: Some(file_id.clone()),
                        ..ErrorEntry::new(reason.clone())
                    });
                    if declared.is_empty() {
                        file_failure = Some(reason.clone());
                    }
                    for id in &declared {
                        let mut unit = Unit::failed(id.clone(), reason.clone()).with_engine(label.clone());
                        if let Some(previous) = record.unit(id) {
                            unit.errors = previous.errors.clone();
                            unit.attempts = previous.attempts;
                        }
                        unit.errors.push(reason.clone());
                        record.upsert_unit(unit);
                    }
                }

                for id in &declared {
                    if let Some(unit) = record.unit_mut(id) {
                        unit.attempts += 1;
                        if unit.engine_used.is_none() {
                            unit.engine_used = Some(label.clone());
                        }
                    }
                }
            }

            let failed = classifier.failed_units(&**txn, &phase_name, &file_id, expected);
            let record = txn.file(&phase_name, &file_id).cloned().unwrap_or_default();
            Ok(RoundCommit {
                failed,
                record,
                file_failure,
            })
        })
        .await
    }

    /// Final status, hash, timestamps and permanent failures in one commit.
    async fn commit_finish(
        &self,
        phase: &PhaseDefinition,
        file_id: &str,
        prep: &Prepared,
        failures: Vec<UnitFailure>,
        retried: usize,
        last_round_ok: bool,
    ) -> Result<Status, StateError> {
        let phase_name = phase.name.clone();
        let file_id = file_id.to_string();
        let hash = prep.hash.clone();
        let expected = prep.expected;
        let run_id = self.run_id.clone();

        self.commit("phase_finish", move |txn| {
            let now = txn.now();
            let record = txn.file_mut(&phase_name, &file_id);
            record.content_hash = Some(hash.clone());
            record.timestamps.finish(now);
            // Clear the running marker; with units present the status is derived.
            record.status = if !record.units.is_empty() {
                Status::Pending
            } else if last_round_ok && expected.unwrap_or(0) == 0 {
                Status::Success
            } else {
                Status::Failed
            };
            record.recompute();

            let entries: Vec<ErrorEntry> = failures
                .iter()
                .map(|f| {
                    ErrorEntry::for_unit(
                        &file_id,
                        &f.unit_id,
                        format!(
                            "permanently failed: {} [{}]",
                            f.reason,
                            f.engines.join(" -> ")
                        ),
                    )
                })
                .collect();
            record.errors.extend(entries.iter().cloned());
            record.metrics.insert("run_id".into(), json!(run_id));
            record.metrics.insert("retried_units".into(), json!(retried));
            record
                .metrics
                .insert("permanent_failures".into(), json!(failures.len()));
            let status = record.status;

            let block = txn.phase_mut(&phase_name);
            block.errors.extend(entries);
            block.recompute();
            if block.status.is_terminal() {
                block.timestamps.finish(now);
            }
            Ok(status)
        })
        .await
    }
}

/// Units an invocation with scope `all` was responsible for.
fn declared_units(record: &FileRecord, expected: Option<usize>) -> Vec<String> {
    let mut ids = expected.map(expected_unit_ids).unwrap_or_default();
    for unit in &record.units {
        if !ids.contains(&unit.unit_id) {
            ids.push(unit.unit_id.clone());
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::EngineKind;
    use crate::hashing;
    use crate::state::StoreOptions;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{TempDir, tempdir};

    /// What a fake executable does for one descriptor.
    #[derive(Default)]
    struct Reply {
        units: Vec<Unit>,
        artifacts: Vec<String>,
        outcome: Option<InvocationOutcome>,
    }

    type Behavior = dyn Fn(&WorkDescriptor) -> Reply + Send + Sync;

    /// Stands in for phase executables: writes artifacts and reports
    /// results through the store, like a script calling `stagehand report`.
    struct FakeInvoker {
        store: StateStore,
        root: PathBuf,
        behavior: Box<Behavior>,
        calls: Mutex<Vec<WorkDescriptor>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeInvoker {
        fn new(store: &StateStore, root: &std::path::Path, behavior: Box<Behavior>) -> Self {
            Self {
                store: store.clone(),
                root: root.to_path_buf(),
                behavior,
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> Vec<WorkDescriptor> {
            self.calls.lock().unwrap().clone()
        }

        fn calls_for(&self, phase: &str) -> Vec<WorkDescriptor> {
            self.calls().into_iter().filter(|c| c.phase == phase).collect()
        }
    }

    #[async_trait]
    impl PhaseInvoker for FakeInvoker {
        async fn invoke(
            &self,
            _phase: &PhaseDefinition,
            work: &WorkDescriptor,
            _deadline: Duration,
        ) -> InvocationOutcome {
            self.calls.lock().unwrap().push(work.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let reply = (self.behavior)(work);
            let outputs = reply
                .units
                .iter()
                .filter_map(|u| u.output_ref.clone())
                .chain(reply.artifacts.iter().cloned());
            for output in outputs {
                let path = self.root.join(output);
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, format!("{}:{}", work.file_id, work.attempt)).unwrap();
            }
            let (phase, file_id) = (work.phase.clone(), work.file_id.clone());
            let Reply {
                units, artifacts, ..
            } = reply;
            if !units.is_empty() || !artifacts.is_empty() {
                self.store
                    .transaction("report", |txn| {
                        for unit in units {
                            txn.record_unit(&phase, &file_id, unit);
                        }
                        let record = txn.file_mut(&phase, &file_id);
                        for a in artifacts {
                            let a = PathBuf::from(a);
                            if !record.artifact_paths.contains(&a) {
                                record.artifact_paths.push(a);
                            }
                        }
                        Ok(())
                    })
                    .unwrap();
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            reply.outcome.unwrap_or(InvocationOutcome::Completed)
        }
    }

    fn out(work: &WorkDescriptor, unit: &str) -> String {
        format!("{}/{}/{}.wav", work.phase, work.file_id, unit)
    }

    fn ok(work: &WorkDescriptor, unit: &str, engine: &str) -> Unit {
        Unit::succeeded(unit, out(work, unit)).with_engine(engine)
    }

    fn scope_ids(work: &WorkDescriptor, expected: usize) -> Vec<String> {
        match &work.unit_scope {
            UnitScope::All => expected_unit_ids(expected),
            UnitScope::Units(ids) => ids.clone(),
        }
    }

    struct Fixture {
        dir: TempDir,
        store: StateStore,
        inputs: Vec<InputFile>,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let dir = tempdir().unwrap();
        let store = StateStore::open(
            dir.path().join(".stagehand/state/pipeline.json"),
            StoreOptions::default(),
        );
        fs::create_dir_all(dir.path().join("input")).unwrap();
        let inputs = files
            .iter()
            .map(|id| {
                let path = dir.path().join("input").join(format!("{}.txt", id));
                fs::write(&path, format!("text of {}", id)).unwrap();
                InputFile {
                    file_id: id.to_string(),
                    path,
                }
            })
            .collect();
        Fixture { dir, store, inputs }
    }

    fn options(fx: &Fixture, workers: usize) -> RunOptions {
        RunOptions {
            workers: WorkerPolicy {
                batch_child: false,
                worker_override: Some(workers),
                physical_cores: 4,
            },
            ..RunOptions::new("book", fx.dir.path())
        }
    }

    fn synth_phase() -> PhaseDefinition {
        PhaseDefinition::new("synthesize", "unused")
            .with_expected_units(2)
            .with_engine(EngineConfig::cloned(EngineKind::Xtts, "voices/narrator.wav"))
    }

    fn orchestrator(
        fx: &Fixture,
        phases: Vec<PhaseDefinition>,
        fake: &Arc<FakeInvoker>,
        options: RunOptions,
    ) -> Orchestrator {
        let invoker: Arc<dyn PhaseInvoker> = fake.clone();
        Orchestrator::new(
            fx.store.clone(),
            PhasePlan::build(phases).unwrap(),
            invoker,
            options,
        )
    }

    #[tokio::test]
    async fn failed_unit_is_retried_with_fallback_and_file_recovers() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| {
                let engine = work.configuration.as_ref().map(|c| c.kind);
                let units = scope_ids(work, 2)
                    .iter()
                    .map(|id| match (id.as_str(), engine) {
                        ("2", Some(EngineKind::Xtts)) => Unit::failed("2", "duration_mismatch"),
                        (id, Some(EngineKind::Xtts)) => ok(work, id, "xtts"),
                        (id, _) => ok(work, id, "fallback"),
                    })
                    .collect();
                Reply {
                    units,
                    ..Default::default()
                }
            }),
        ));
        let orch = orchestrator(&fx, vec![synth_phase()], &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(report.exit_code(), 0);
        assert_eq!(
            report.outcomes[0].disposition,
            Disposition::Ran {
                status: Status::Success,
                retried_units: vec!["2".into()],
                failures: vec![],
            }
        );

        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].unit_scope, UnitScope::Units(vec!["2".into()]));
        assert_eq!(
            calls[1].configuration,
            Some(EngineConfig::builtin(EngineKind::Kokoro, "af_bella"))
        );
        assert_eq!(calls[1].attempt, 2);

        let doc = fx.store.read().unwrap();
        let record = doc.file("synthesize", "ch1").unwrap();
        assert_eq!(record.status, Status::Success);
        assert_eq!(record.unit("1").unwrap().engine_used.as_deref(), Some("xtts"));
        assert_eq!(record.unit("1").unwrap().attempts, 1);
        let unit2 = record.unit("2").unwrap();
        assert_eq!(unit2.status, Status::Success);
        assert_eq!(unit2.engine_used.as_deref(), Some("fallback"));
        assert_eq!(doc.phase("synthesize").unwrap().status, Status::Success);
        assert_eq!(doc.metadata.run_id.as_deref(), Some(report.run_id.as_str()));
    }

    #[tokio::test]
    async fn unit_failing_both_configurations_stops_after_two_attempts() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| Reply {
                units: scope_ids(work, 2)
                    .iter()
                    .map(|id| match id.as_str() {
                        "2" => Unit::failed("2", "wer_too_high"),
                        id => ok(work, id, "xtts"),
                    })
                    .collect(),
                ..Default::default()
            }),
        ));
        let mut opts = options(&fx, 2);
        opts.max_retries = 5;
        let orch = orchestrator(&fx, vec![synth_phase()], &fake, opts);

        let report = orch.run(&fx.inputs).await.unwrap();
        let unit2_calls = fake
            .calls()
            .iter()
            .filter(|c| c.unit_scope.contains("2"))
            .count();
        assert_eq!(unit2_calls, 2);

        let Disposition::Ran {
            status, failures, ..
        } = &report.outcomes[0].disposition
        else {
            panic!("expected phase to run");
        };
        assert_eq!(*status, Status::Partial);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].unit_id, "2");
        assert_eq!(failures[0].reason, "wer_too_high");
        assert_eq!(
            failures[0].engines,
            vec!["xtts:cloned:narrator.wav", "kokoro:af_bella"]
        );
        assert_eq!(report.exit_code(), 0);

        let doc = fx.store.read().unwrap();
        let record = doc.file("synthesize", "ch1").unwrap();
        assert_eq!(record.unit("2").unwrap().attempts, 2);
        assert!(record
            .errors
            .iter()
            .any(|e| e.unit_id.as_deref() == Some("2") && e.message.contains("wer_too_high")));
        assert!(!doc.phase("synthesize").unwrap().errors.is_empty());
    }

    #[tokio::test]
    async fn resume_redispatches_only_failed_units_and_protects_the_rest() {
        let fx = fixture(&["ch1"]);
        let source_hash = hashing::sha256_file(&fx.inputs[0].path).unwrap();
        fx.store.initialize("book").unwrap();
        let root = fx.dir.path().to_path_buf();
        fx.store
            .transaction("seed", |txn| {
                let record = txn.file_mut("synthesize", "ch1");
                record.content_hash = Some(source_hash.clone());
                record.expected_units = Some(10);
                for i in 1..=10 {
                    let id = i.to_string();
                    if i == 3 || i == 7 {
                        record.upsert_unit(Unit::failed(id, "silence"));
                    } else {
                        let rel = format!("synthesize/ch1/{}.wav", i);
                        fs::create_dir_all(root.join("synthesize/ch1")).unwrap();
                        fs::write(root.join(&rel), b"audio").unwrap();
                        record.upsert_unit(Unit::succeeded(id, rel).with_engine("xtts"));
                    }
                }
                Ok(())
            })
            .unwrap();
        let before = fx.store.read().unwrap();
        assert_eq!(before.file_status("synthesize", "ch1"), Status::Partial);

        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| {
                let mut units: Vec<Unit> = scope_ids(work, 10)
                    .iter()
                    .map(|id| ok(work, id, "xtts-retry"))
                    .collect();
                // A misbehaving executable also rewrites a unit it was not asked for.
                units.push(Unit::failed("1", "clobbered"));
                Reply {
                    units,
                    ..Default::default()
                }
            }),
        ));
        let phase = PhaseDefinition::new("synthesize", "unused")
            .with_expected_units(10)
            .with_engine(EngineConfig::cloned(EngineKind::Xtts, "voices/narrator.wav"));
        let orch = orchestrator(&fx, vec![phase], &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        let calls = fake.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].unit_scope,
            UnitScope::Units(vec!["3".into(), "7".into()])
        );
        assert_eq!(report.exit_code(), 0);

        let after = fx.store.read().unwrap();
        let record = after.file("synthesize", "ch1").unwrap();
        assert_eq!(record.status, Status::Success);
        let old = before.file("synthesize", "ch1").unwrap();
        for id in ["1", "2", "4", "5", "6", "8", "9", "10"] {
            assert_eq!(record.unit(id), old.unit(id), "unit {id} changed");
        }
        assert_eq!(
            record.unit("3").unwrap().engine_used.as_deref(),
            Some("xtts-retry")
        );
    }

    #[tokio::test]
    async fn interrupted_phase_with_every_unit_valid_is_finalized_without_invoking() {
        let fx = fixture(&["ch1"]);
        let source_hash = hashing::sha256_file(&fx.inputs[0].path).unwrap();
        fx.store.initialize("book").unwrap();
        let root = fx.dir.path().to_path_buf();
        fx.store
            .transaction("seed", |txn| {
                let record = txn.file_mut("synthesize", "ch1");
                record.status = Status::Running;
                record.content_hash = Some(source_hash.clone());
                record.expected_units = Some(2);
                for id in ["1", "2"] {
                    let rel = format!("synthesize/ch1/{}.wav", id);
                    fs::create_dir_all(root.join("synthesize/ch1")).unwrap();
                    fs::write(root.join(&rel), b"audio").unwrap();
                    record.upsert_unit(Unit::succeeded(id, rel).with_engine("xtts"));
                }
                Ok(())
            })
            .unwrap();
        let before = fx.store.read().unwrap();
        assert_eq!(before.file_status("synthesize", "ch1"), Status::Running);

        let fake = Arc::new(FakeInvoker::new(&fx.store, fx.dir.path(), healthy()));
        let orch = orchestrator(&fx, vec![synth_phase()], &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert!(fake.calls().is_empty());
        assert_eq!(report.outcomes[0].status(), Some(Status::Success));
        assert_eq!(report.exit_code(), 0);

        let after = fx.store.read().unwrap();
        let record = after.file("synthesize", "ch1").unwrap();
        assert_eq!(record.status, Status::Success);
        let old = before.file("synthesize", "ch1").unwrap();
        for id in ["1", "2"] {
            assert_eq!(record.unit(id), old.unit(id), "unit {id} changed");
        }
        assert_eq!(after.phase("synthesize").unwrap().status, Status::Success);
    }

    fn chunk_then_synth() -> Vec<PhaseDefinition> {
        vec![
            PhaseDefinition::new("chunk", "unused"),
            PhaseDefinition::new("synthesize", "unused")
                .with_depends_on(&["chunk"])
                .with_expected_units(2),
        ]
    }

    fn healthy() -> Box<Behavior> {
        Box::new(|work: &WorkDescriptor| match work.phase.as_str() {
            "chunk" => Reply {
                artifacts: vec![format!("chunk/{}.json", work.file_id)],
                ..Default::default()
            },
            _ => Reply {
                units: scope_ids(work, 2).iter().map(|id| ok(work, id, "piper")).collect(),
                artifacts: vec![format!("synthesize/{}.m4b", work.file_id)],
                ..Default::default()
            },
        })
    }

    #[tokio::test]
    async fn second_run_skips_everything() {
        let fx = fixture(&["ch1", "ch2"]);
        let fake = Arc::new(FakeInvoker::new(&fx.store, fx.dir.path(), healthy()));
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, options(&fx, 2));

        let first = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(first.exit_code(), 0);
        assert_eq!(fake.calls().len(), 4);
        let doc_after_first = fx.store.read().unwrap();

        let second = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(fake.calls().len(), 4);
        assert!(second
            .outcomes
            .iter()
            .all(|o| matches!(o.disposition, Disposition::Skipped { .. })));

        let doc_after_second = fx.store.read().unwrap();
        assert_eq!(doc_after_first.phases, doc_after_second.phases);
    }

    #[tokio::test]
    async fn editing_the_source_reruns_the_whole_chain() {
        let fx = fixture(&["ch1", "ch2"]);
        let fake = Arc::new(FakeInvoker::new(&fx.store, fx.dir.path(), healthy()));
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, options(&fx, 2));
        orch.run(&fx.inputs).await.unwrap();

        fs::write(&fx.inputs[0].path, "revised text").unwrap();
        orch.run(&fx.inputs).await.unwrap();

        assert_eq!(fake.calls_for("chunk").len(), 3);
        let synth_ch1 = fake
            .calls_for("synthesize")
            .into_iter()
            .filter(|c| c.file_id == "ch1")
            .count();
        assert_eq!(synth_ch1, 2);
        let synth_ch2 = fake
            .calls_for("synthesize")
            .into_iter()
            .filter(|c| c.file_id == "ch2")
            .count();
        assert_eq!(synth_ch2, 1);
    }

    #[tokio::test]
    async fn no_resume_forces_every_phase() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(&fx.store, fx.dir.path(), healthy()));
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, options(&fx, 2));
        orch.run(&fx.inputs).await.unwrap();

        let mut opts = options(&fx, 2);
        opts.resume = false;
        let forced = orchestrator(&fx, chunk_then_synth(), &fake, opts);
        forced.run(&fx.inputs).await.unwrap();
        assert_eq!(fake.calls().len(), 4);
    }

    #[tokio::test]
    async fn abnormal_exit_fails_every_declared_unit() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| match &work.unit_scope {
                UnitScope::All => Reply {
                    outcome: Some(InvocationOutcome::Failed {
                        exit_code: Some(137),
                        stderr_tail: String::new(),
                    }),
                    ..Default::default()
                },
                UnitScope::Units(ids) => Reply {
                    units: ids.iter().map(|id| ok(work, id, "default")).collect(),
                    ..Default::default()
                },
            }),
        ));
        let phase = PhaseDefinition::new("synthesize", "unused").with_expected_units(2);
        let orch = orchestrator(&fx, vec![phase], &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(fake.calls().len(), 3);
        assert_eq!(report.outcomes[0].status(), Some(Status::Success));

        let doc = fx.store.read().unwrap();
        let record = doc.file("synthesize", "ch1").unwrap();
        for id in ["1", "2"] {
            let unit = record.unit(id).unwrap();
            assert_eq!(unit.status, Status::Success);
            assert!(unit.errors.iter().any(|e| e.starts_with("invocation_failed")));
        }
        assert!(record
            .errors
            .iter()
            .any(|e| e.message == "invocation_failed: exit code 137"));
    }

    #[tokio::test]
    async fn crash_retry_reuses_the_crashed_configuration_when_enabled() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| {
                if work.attempt == 1 {
                    Reply {
                        outcome: Some(InvocationOutcome::TimedOut {
                            after: Duration::from_secs(1),
                        }),
                        ..Default::default()
                    }
                } else {
                    Reply {
                        units: scope_ids(work, 1).iter().map(|id| ok(work, id, "xtts")).collect(),
                        ..Default::default()
                    }
                }
            }),
        ));
        let phase = synth_phase().with_expected_units(1);
        let mut opts = options(&fx, 1);
        opts.crash_retry_same_config = true;
        let orch = orchestrator(&fx, vec![phase.clone()], &fake, opts);

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(report.outcomes[0].status(), Some(Status::Success));
        let calls = fake.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].configuration, phase.engine);
    }

    #[tokio::test]
    async fn failed_required_phase_aborts_remaining_work() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|_: &WorkDescriptor| Reply {
                outcome: Some(InvocationOutcome::SpawnFailed("no such file".into())),
                ..Default::default()
            }),
        ));
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(report.outcomes[0].status(), Some(Status::Failed));
        assert_eq!(report.outcomes[1].disposition, Disposition::Stopped);
        assert!(report.aborted.is_some());
        assert_eq!(report.exit_code(), 1);
        // Both configurations of the file-level phase were tried before aborting.
        assert_eq!(fake.calls_for("chunk").len(), 2);
        assert!(fake.calls_for("synthesize").is_empty());
    }

    #[tokio::test]
    async fn crashed_file_level_phase_is_retried_before_the_run_aborts() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(
            &fx.store,
            fx.dir.path(),
            Box::new(|work: &WorkDescriptor| match work.phase.as_str() {
                "chunk" if work.attempt == 1 => Reply {
                    outcome: Some(InvocationOutcome::Failed {
                        exit_code: Some(1),
                        stderr_tail: "segfault".into(),
                    }),
                    ..Default::default()
                },
                "chunk" => Reply {
                    artifacts: vec![format!("chunk/{}.json", work.file_id)],
                    ..Default::default()
                },
                _ => Reply {
                    units: scope_ids(work, 2).iter().map(|id| ok(work, id, "piper")).collect(),
                    ..Default::default()
                },
            }),
        ));
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert!(report.aborted.is_none());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.outcomes[0].status(), Some(Status::Success));
        assert_eq!(report.outcomes[1].status(), Some(Status::Success));

        let chunk_calls = fake.calls_for("chunk");
        assert_eq!(chunk_calls.len(), 2);
        assert_eq!(chunk_calls[1].unit_scope, UnitScope::All);
        assert_eq!(chunk_calls[1].attempt, 2);

        let doc = fx.store.read().unwrap();
        let record = doc.file("chunk", "ch1").unwrap();
        assert_eq!(record.status, Status::Success);
        assert!(record.units.is_empty());
        assert!(record.errors.iter().any(|e| e.message.contains("exit code 1")));
    }

    #[tokio::test]
    async fn downstream_phase_is_blocked_until_dependency_succeeds() {
        let fx = fixture(&["ch1"]);
        let fake = Arc::new(FakeInvoker::new(&fx.store, fx.dir.path(), healthy()));
        let mut opts = options(&fx, 2);
        opts.phases = vec!["synthesize".into()];
        let orch = orchestrator(&fx, chunk_then_synth(), &fake, opts);

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(
            report.outcomes[0].disposition,
            Disposition::Blocked {
                dependency: "chunk".into(),
                status: Status::Pending
            }
        );
        assert!(fake.calls().is_empty());
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn ensure_dependencies_refuses_unsuccessful_dependency() {
        let mut doc = StateDocument::new("book");
        let phase = PhaseDefinition::new("synthesize", "x").with_depends_on(&["chunk"]);
        doc.file_mut("chunk", "ch1").status = Status::Partial;
        assert!(matches!(
            ensure_dependencies(&doc, &phase, "ch1"),
            Err(OrchestratorError::DependencyViolation {
                status: Status::Partial,
                ..
            })
        ));
        doc.file_mut("chunk", "ch1").status = Status::Success;
        assert!(ensure_dependencies(&doc, &phase, "ch1").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_files_respect_the_worker_limit() {
        let fx = fixture(&["a", "b", "c", "d", "e", "f"]);
        let mut fake = FakeInvoker::new(&fx.store, fx.dir.path(), healthy());
        fake.delay = Duration::from_millis(50);
        let fake = Arc::new(fake);
        let phases = vec![PhaseDefinition::new("chunk", "unused")];
        let orch = orchestrator(&fx, phases, &fake, options(&fx, 2));

        let report = orch.run(&fx.inputs).await.unwrap();
        assert_eq!(report.outcomes.len(), 6);
        assert!(report.outcomes.iter().all(|o| o.status() == Some(Status::Success)));
        let max = fake.max_in_flight.load(Ordering::SeqCst);
        assert!((1..=2).contains(&max), "max in flight {max}");
    }

    #[tokio::test]
    async fn batch_child_runs_one_invocation_at_a_time() {
        let fx = fixture(&["a", "b", "c"]);
        let mut fake = FakeInvoker::new(&fx.store, fx.dir.path(), healthy());
        fake.delay = Duration::from_millis(20);
        let fake = Arc::new(fake);
        let mut opts = options(&fx, 8);
        opts.workers.batch_child = true;
        let orch = orchestrator(&fx, vec![PhaseDefinition::new("chunk", "unused")], &fake, opts);

        orch.run(&fx.inputs).await.unwrap();
        assert_eq!(fake.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
