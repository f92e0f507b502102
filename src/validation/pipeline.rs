//! Batch validation pipeline.
//!
//! The pipeline feeds many requests through the engine, chunk by chunk:
//! - Every record races a per-record timeout; a timeout or engine error
//!   becomes a failing result instead of aborting the batch
//! - A record first waits for an engine admission slot, so workers
//!   abandoned by earlier timeouts delay later records instead of failing
//!   them
//! - A separate result cache short-circuits repeated records
//! - Progress is published after every finished record
//! - Settings notifications reconfigure the pipeline and clear its cache

use crate::control::stop::StopSignal;
use crate::core::events::EventBus;
use crate::core::services::PipelineControl;
use crate::core::settings::{PipelineSettings, SettingsEvent, ValidationSettings};
use crate::core::error::SystemError;
use crate::core::types::{Aspect, IssueCounts, ValidationIssue, ValidationRequest, ValidationResult};
use crate::execution::cache::ResultCache;
use crate::execution::engine::ValidationEngine;
use crate::execution::progress::{ProgressTracker, ProgressUpdate};
use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use indexmap::IndexMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Issue code for a record that did not finish within the timeout.
pub const PIPELINE_TIMEOUT: &str = "PIPELINE_TIMEOUT";
/// Issue code for a record the engine failed on.
pub const PIPELINE_ERROR: &str = "PIPELINE_ERROR";

/// How many (code, message) pairs the summary keeps.
const TOP_ISSUES: usize = 10;

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per chunk.
    pub max_concurrent: usize,
    /// Per-record timeout in milliseconds.
    pub record_timeout_ms: u64,
    /// Longest wait for an engine admission slot, in milliseconds.
    pub admission_wait_ms: u64,
    /// Run the records of a chunk in parallel.
    pub parallel: bool,
    /// Use the pipeline result cache.
    pub cache_enabled: bool,
    /// Pipeline cache TTL in milliseconds.
    pub cache_ttl_ms: u64,
    /// Pipeline cache capacity.
    pub cache_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&PipelineSettings::default())
    }
}

impl From<&PipelineSettings> for PipelineConfig {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            max_concurrent: settings.max_concurrent.max(1),
            record_timeout_ms: settings.record_timeout_ms,
            admission_wait_ms: settings.admission_wait_ms,
            parallel: settings.parallel,
            cache_enabled: settings.cache_enabled,
            cache_ttl_ms: settings.cache_ttl_ms,
            cache_capacity: settings.cache_capacity,
        }
    }
}

impl PipelineConfig {
    /// Set the chunk size.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Set the per-record timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.record_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the longest wait for an engine admission slot.
    pub fn with_admission_wait(mut self, wait: Duration) -> Self {
        self.admission_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Enable or disable the result cache.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Process records one at a time, in order.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    /// Per-record timeout.
    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    /// Longest wait for an engine admission slot.
    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    fn new_cache(&self) -> ResultCache {
        ResultCache::new(self.cache_capacity.max(1), Duration::from_millis(self.cache_ttl_ms))
    }
}

/// Who started a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Id to run under; generated when absent.
    pub pipeline_id: Option<String>,
    /// Requesting user or system.
    pub requester: Option<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PipelineContext {
    /// Context with a fixed pipeline id.
    pub fn with_id(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.into()),
            ..Self::default()
        }
    }
}

/// Lifecycle events published by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A run started.
    Started {
        /// Pipeline id.
        pipeline_id: String,
        /// Records submitted.
        total: usize,
    },
    /// A record finished.
    Progress {
        /// Pipeline id.
        pipeline_id: String,
        /// Progress after the record.
        update: ProgressUpdate,
    },
    /// A run finished.
    Completed {
        /// Pipeline id.
        pipeline_id: String,
        /// Run summary.
        summary: PipelineSummary,
    },
    /// A run was cancelled.
    Cancelled {
        /// Pipeline id.
        pipeline_id: String,
    },
    /// Configuration was reloaded from settings.
    Reconfigured {
        /// Settings version applied.
        version: u32,
    },
}

/// Status of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStatus {
    /// The run is in progress.
    Running {
        /// When it started.
        started_at: DateTime<Utc>,
        /// Current progress.
        progress: ProgressUpdate,
    },
    /// No run with that id is in progress.
    NotFound,
}

/// Frequency of one (code, message) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueFrequency {
    /// Issue code.
    pub code: String,
    /// Issue message.
    pub message: String,
    /// Occurrences across the run.
    pub count: usize,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Records validated.
    pub total: usize,
    /// Valid records.
    pub passed: usize,
    /// Invalid records.
    pub failed: usize,
    /// Mean record score.
    pub overall_score: u32,
    /// Issue counts by severity.
    pub issue_counts: IssueCounts,
    /// Issue counts by aspect.
    pub issues_by_aspect: BTreeMap<Aspect, usize>,
    /// Most frequent (code, message) pairs, most frequent first.
    pub top_issues: Vec<IssueFrequency>,
    /// Records that timed out.
    pub timed_out: usize,
    /// Records the engine failed on.
    pub errored: usize,
}

impl PipelineSummary {
    /// Summarize a set of results.
    pub fn from_results(results: &[ValidationResult]) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.is_valid).count();
        let overall_score = if total == 0 {
            100
        } else {
            let sum: u64 = results.iter().map(|r| r.score as u64).sum();
            (sum as f64 / total as f64).round() as u32
        };

        let all_issues: Vec<&ValidationIssue> = results.iter().flat_map(|r| r.issues.iter()).collect();
        let mut issues_by_aspect = BTreeMap::new();
        let mut frequencies: IndexMap<(&str, &str), usize> = IndexMap::new();
        for issue in &all_issues {
            *issues_by_aspect.entry(issue.aspect).or_insert(0) += 1;
            *frequencies
                .entry((issue.code.as_str(), issue.message.as_str()))
                .or_insert(0) += 1;
        }

        // Stable sort keeps first-seen order among equal counts
        let mut top_issues: Vec<IssueFrequency> = frequencies
            .into_iter()
            .map(|((code, message), count)| IssueFrequency {
                code: code.to_string(),
                message: message.to_string(),
                count,
            })
            .collect();
        top_issues.sort_by(|a, b| b.count.cmp(&a.count));
        top_issues.truncate(TOP_ISSUES);

        let has_code = |r: &ValidationResult, code: &str| r.issues.iter().any(|i| i.code == code);

        Self {
            total,
            passed,
            failed: total - passed,
            overall_score,
            issue_counts: IssueCounts::from_issues(all_issues.iter().copied()),
            issues_by_aspect,
            top_issues,
            timed_out: results.iter().filter(|r| has_code(r, PIPELINE_TIMEOUT)).count(),
            errored: results.iter().filter(|r| has_code(r, PIPELINE_ERROR)).count(),
        }
    }
}

/// Timing of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelinePerformance {
    /// Wall time of the run.
    pub total_ms: u64,
    /// Mean per-record time.
    pub average_ms: f64,
    /// Fastest record.
    pub min_ms: u64,
    /// Slowest record.
    pub max_ms: u64,
    /// Records per second.
    pub throughput_per_sec: f64,
    /// Records served from the pipeline cache.
    pub cache_hits: usize,
}

impl PipelinePerformance {
    fn from_durations(durations: &[u64], total: Duration, cache_hits: usize) -> Self {
        let total_ms = total.as_millis() as u64;
        if durations.is_empty() {
            return Self {
                total_ms,
                ..Self::default()
            };
        }

        let secs = total.as_secs_f64();
        Self {
            total_ms,
            average_ms: durations.iter().sum::<u64>() as f64 / durations.len() as f64,
            min_ms: durations.iter().copied().min().unwrap_or(0),
            max_ms: durations.iter().copied().max().unwrap_or(0),
            throughput_per_sec: if secs > 0.0 { durations.len() as f64 / secs } else { 0.0 },
            cache_hits,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Pipeline id.
    pub pipeline_id: String,
    /// One result per processed request, in input order.
    pub results: Vec<ValidationResult>,
    /// Aggregate outcome.
    pub summary: PipelineSummary,
    /// Timing.
    pub performance: PipelinePerformance,
    /// Whether the run stopped early.
    pub cancelled: bool,
    /// Requesting user or system.
    pub requester: Option<String>,
}

/// A run in progress.
struct ActivePipeline {
    tracker: ProgressTracker,
    started_at: DateTime<Utc>,
}

/// Messages from a record worker to the waiting pipeline.
enum WorkerMessage {
    /// The engine admitted the record; its timeout starts now.
    Admitted,
    /// The validation finished or was rejected.
    Finished(Result<ValidationResult, SystemError>),
}

/// Outcome of one record inside a run.
struct RecordOutcome {
    result: ValidationResult,
    duration_ms: u64,
    cached: bool,
}

/// Batch validation pipeline.
pub struct ValidationPipeline {
    engine: Arc<ValidationEngine>,
    config: RwLock<PipelineConfig>,
    cache: RwLock<Arc<ResultCache>>,
    active: Mutex<HashMap<String, Arc<ActivePipeline>>>,
    events: EventBus<PipelineEvent>,
    stop: Option<StopSignal>,
}

impl ValidationPipeline {
    /// Create a pipeline over an engine, configured from its active settings.
    pub fn new(engine: Arc<ValidationEngine>) -> Self {
        let config = PipelineConfig::from(&engine.active_settings().pipeline);
        Self::with_config(engine, config)
    }

    /// Create a pipeline with an explicit configuration.
    pub fn with_config(engine: Arc<ValidationEngine>, config: PipelineConfig) -> Self {
        Self {
            cache: RwLock::new(Arc::new(config.new_cache())),
            engine,
            config: RwLock::new(config),
            active: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            stop: None,
        }
    }

    /// Stop between chunks whenever `signal` is raised.
    pub fn with_stop_signal(mut self, signal: StopSignal) -> Self {
        self.stop = Some(signal);
        self
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Current configuration.
    pub fn config(&self) -> PipelineConfig {
        self.config.read().clone()
    }

    /// The engine records are validated with.
    pub fn engine(&self) -> &Arc<ValidationEngine> {
        &self.engine
    }

    /// Entries in the pipeline cache.
    pub fn cached_results(&self) -> usize {
        self.cache.read().len()
    }

    /// Validate a batch of requests.
    ///
    /// `config` overrides the pipeline configuration for this run only. The
    /// run stops between chunks when it is cancelled or the stop signal is
    /// raised; records already started still finish.
    pub fn execute_pipeline(
        &self,
        requests: Vec<ValidationRequest>,
        config: Option<PipelineConfig>,
        context: Option<PipelineContext>,
    ) -> PipelineResult {
        let config = config.unwrap_or_else(|| self.config());
        let context = context.unwrap_or_default();
        let pipeline_id = context
            .pipeline_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let start = Instant::now();
        let run = Arc::new(ActivePipeline {
            tracker: ProgressTracker::new(requests.len()),
            started_at: Utc::now(),
        });
        self.active.lock().insert(pipeline_id.clone(), run.clone());
        info!("Pipeline {} started with {} records", pipeline_id, requests.len());
        self.events.emit(PipelineEvent::Started {
            pipeline_id: pipeline_id.clone(),
            total: requests.len(),
        });

        let settings = self.engine.active_settings();
        let cache = self.cache.read().clone();
        let mut outcomes: Vec<RecordOutcome> = Vec::with_capacity(requests.len());
        let mut cancelled = false;

        for chunk in requests.chunks(config.max_concurrent) {
            if run.tracker.is_cancelled() || self.stop.as_ref().map_or(false, StopSignal::is_raised) {
                cancelled = true;
                break;
            }

            let process = |request: &ValidationRequest| {
                let outcome = self.process_record(request, &config, &cache, &settings);
                let update = run.tracker.record_completed(&outcome.result, outcome.duration_ms);
                self.events.emit(PipelineEvent::Progress {
                    pipeline_id: pipeline_id.clone(),
                    update,
                });
                outcome
            };

            if config.parallel {
                let chunk_outcomes: Vec<_> = chunk.par_iter().map(process).collect();
                outcomes.extend(chunk_outcomes);
            } else {
                outcomes.extend(chunk.iter().map(process));
            }
        }
        // A cancel that lands during the last chunk still counts
        cancelled = cancelled || run.tracker.is_cancelled();

        let cache_hits = outcomes.iter().filter(|o| o.cached).count();
        let durations: Vec<u64> = outcomes.iter().map(|o| o.duration_ms).collect();
        let results: Vec<ValidationResult> = outcomes.into_iter().map(|o| o.result).collect();
        let summary = PipelineSummary::from_results(&results);
        let performance = PipelinePerformance::from_durations(&durations, start.elapsed(), cache_hits);

        self.active.lock().remove(&pipeline_id);
        if cancelled {
            info!(
                "Pipeline {} stopped after {}/{} records",
                pipeline_id,
                results.len(),
                requests.len()
            );
        } else {
            info!(
                "Pipeline {} completed: {} passed, {} failed in {} ms",
                pipeline_id, summary.passed, summary.failed, performance.total_ms
            );
            self.events.emit(PipelineEvent::Completed {
                pipeline_id: pipeline_id.clone(),
                summary: summary.clone(),
            });
        }

        PipelineResult {
            pipeline_id,
            results,
            summary,
            performance,
            cancelled,
            requester: context.requester,
        }
    }

    /// Cancel a running pipeline.
    ///
    /// Records already being validated are not interrupted; the run stops at
    /// the next chunk boundary. Returns false if the id is not running.
    pub fn cancel_pipeline(&self, pipeline_id: &str) -> bool {
        let Some(run) = self.active.lock().remove(pipeline_id) else {
            return false;
        };
        run.tracker.cancel();
        info!("Pipeline {} cancelled", pipeline_id);
        self.events.emit(PipelineEvent::Cancelled {
            pipeline_id: pipeline_id.to_string(),
        });
        true
    }

    /// Status of a pipeline run.
    pub fn get_pipeline_status(&self, pipeline_id: &str) -> PipelineStatus {
        match self.active.lock().get(pipeline_id) {
            Some(run) => PipelineStatus::Running {
                started_at: run.started_at,
                progress: run.tracker.snapshot(),
            },
            None => PipelineStatus::NotFound,
        }
    }

    /// Reload configuration after a settings notification and clear the cache.
    pub fn apply_settings_event(&self, event: &SettingsEvent) {
        match self.engine.settings_service().active_settings() {
            Ok(settings) => {
                let config = PipelineConfig::from(&settings.pipeline);
                *self.cache.write() = Arc::new(config.new_cache());
                *self.config.write() = config;
                info!("Pipeline reconfigured from settings version {}", event.version());
                self.events.emit(PipelineEvent::Reconfigured {
                    version: event.version(),
                });
            }
            Err(err) => {
                warn!("Settings reload failed ({}), keeping pipeline configuration", err);
                self.cache.read().clear();
            }
        }
    }

    /// Watch the settings service and reconfigure on every notification.
    ///
    /// The watcher holds only a weak reference and exits once the pipeline
    /// is dropped or the settings service goes away.
    pub fn spawn_settings_watcher(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let events = self.engine.settings_service().subscribe();
        let pipeline: Weak<Self> = Arc::downgrade(self);

        std::thread::Builder::new()
            .name("pariksha-settings-watcher".to_string())
            .spawn(move || loop {
                match events.recv_timeout(Duration::from_millis(250)) {
                    Ok(event) => match pipeline.upgrade() {
                        Some(pipeline) => pipeline.apply_settings_event(&event),
                        None => break,
                    },
                    Err(RecvTimeoutError::Timeout) => {
                        if pipeline.strong_count() == 0 {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
    }

    fn process_record(
        &self,
        request: &ValidationRequest,
        config: &PipelineConfig,
        cache: &ResultCache,
        settings: &ValidationSettings,
    ) -> RecordOutcome {
        let start = Instant::now();
        let key = ValidationEngine::cache_key(request, settings);

        if config.cache_enabled {
            if let Some(result) = cache.get(&key) {
                return RecordOutcome {
                    result,
                    duration_ms: start.elapsed().as_millis() as u64,
                    cached: true,
                };
            }
        }

        let result = match self.validate_with_timeout(request, config.admission_wait(), config.record_timeout()) {
            Ok(result) => {
                if config.cache_enabled {
                    cache.put(key, result.clone(), start.elapsed());
                }
                result
            }
            Err(err) => {
                let code = match err {
                    SystemError::PipelineTimeout { .. } => PIPELINE_TIMEOUT,
                    _ => PIPELINE_ERROR,
                };
                debug!("{} failed in pipeline: {}", request.label(), err);
                ValidationResult::synthesized_failure(
                    request,
                    ValidationIssue::error(Aspect::Structural, code, err.to_string())
                        .with_context("errorCode", err.code()),
                )
            }
        };

        RecordOutcome {
            result,
            duration_ms: start.elapsed().as_millis() as u64,
            cached: false,
        }
    }

    /// Run one validation on a worker thread.
    ///
    /// The worker first waits up to `admission_wait` for an engine slot;
    /// workers abandoned by earlier timeouts still hold theirs. Once
    /// admitted, the record gets at most `timeout`. A timed-out worker keeps
    /// running and its result is discarded.
    fn validate_with_timeout(
        &self,
        request: &ValidationRequest,
        admission_wait: Duration,
        timeout: Duration,
    ) -> Result<ValidationResult, SystemError> {
        let (tx, rx) = bounded(2);
        let engine = self.engine.clone();
        let owned = request.clone();

        std::thread::Builder::new()
            .name("pariksha-record".to_string())
            .spawn(move || {
                let admitted = tx.clone();
                let outcome = engine.validate_resource_waiting(&owned, admission_wait, move || {
                    let _ = admitted.send(WorkerMessage::Admitted);
                });
                let _ = tx.send(WorkerMessage::Finished(outcome));
            })
            .map_err(|e| SystemError::Pipeline(format!("could not start worker: {}", e)))?;

        let died = || SystemError::Pipeline(format!("worker for {} died", request.label()));
        match rx.recv() {
            Ok(WorkerMessage::Admitted) => {}
            Ok(WorkerMessage::Finished(outcome)) => return outcome,
            Err(_) => return Err(died()),
        }

        match rx.recv_timeout(timeout) {
            Ok(WorkerMessage::Finished(outcome)) => outcome,
            Ok(WorkerMessage::Admitted) => Err(SystemError::Pipeline(format!(
                "worker for {} was admitted twice",
                request.label()
            ))),
            Err(RecvTimeoutError::Timeout) => Err(SystemError::PipelineTimeout {
                record: request.label(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(died()),
        }
    }
}

impl PipelineControl for ValidationPipeline {
    fn cancel_pipeline(&self, pipeline_id: &str) -> bool {
        ValidationPipeline::cancel_pipeline(self, pipeline_id)
    }

    fn active_pipelines(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }
}
