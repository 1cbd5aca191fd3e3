use crate::cache::IndicatorCache;
use crate::config::BacktestConfig;
use crate::error::TaskError;
use crate::models::{BacktestResult, BarSeries, TaskStatus};
use crate::pipeline::{run_backtest, BacktestInputs};
use crate::scorer::Scorer;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One independent (symbol, config) unit of work.
#[derive(Clone)]
pub struct BacktestTask {
    pub key: String,
    pub series: Arc<BarSeries>,
    pub config: BacktestConfig,
    pub scorer: Option<Arc<dyn Scorer>>,
}

impl BacktestTask {
    pub fn new(series: Arc<BarSeries>, config: BacktestConfig) -> Self {
        Self {
            key: series.symbol.clone(),
            series,
            config,
            scorer: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

type TaskOutcome = (String, Result<BacktestResult, TaskError>);

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: BTreeMap<String, Result<BacktestResult, TaskError>>,
    /// Tasks refused before dispatch because their key was already taken.
    pub rejected: Vec<(String, TaskError)>,
}

#[derive(Serialize)]
struct ReportEntry<'a> {
    key: &'a str,
    #[serde(flatten)]
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a BacktestResult>,
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    tasks: Vec<ReportEntry<'a>>,
    rejected: Vec<ReportEntry<'a>>,
}

fn failed_entry<'a>(key: &'a str, error: &TaskError) -> ReportEntry<'a> {
    ReportEntry {
        key,
        status: TaskStatus::Failed {
            reason: error.to_string(),
        },
        error_kind: Some(error.kind()),
        result: None,
    }
}

impl RunReport {
    pub fn get(&self, key: &str) -> Option<&Result<BacktestResult, TaskError>> {
        self.results.get(key)
    }

    pub fn status(&self, key: &str) -> Option<TaskStatus> {
        self.results.get(key).map(|outcome| match outcome {
            Ok(result) => result.status.clone(),
            Err(error) => TaskStatus::Failed {
                reason: error.to_string(),
            },
        })
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, &BacktestResult)> {
        self.results
            .iter()
            .filter_map(|(key, outcome)| outcome.as_ref().ok().map(|r| (key.as_str(), r)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &TaskError)> {
        self.results
            .iter()
            .filter_map(|(key, outcome)| outcome.as_ref().err().map(|e| (key.as_str(), e)))
    }

    /// Attribute a failure that happened before dispatch, such as unreadable
    /// input, to `key`. A key that already holds a result keeps it and the
    /// failure is listed in `rejected` instead.
    pub fn record_failure(&mut self, key: impl Into<String>, error: TaskError) {
        let key = key.into();
        if self.results.contains_key(&key) {
            warn!("Task key '{}' already has a result; rejecting: {}", key, error);
            self.rejected.push((key, error));
        } else {
            self.results.insert(key, Err(error));
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        let tasks = self
            .results
            .iter()
            .map(|(key, outcome)| match outcome {
                Ok(result) => ReportEntry {
                    key,
                    status: result.status.clone(),
                    error_kind: None,
                    result: Some(result),
                },
                Err(error) => failed_entry(key, error),
            })
            .collect();
        let rejected = self
            .rejected
            .iter()
            .map(|(key, error)| failed_entry(key, error))
            .collect();

        serde_json::to_string_pretty(&ReportDocument {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            tasks,
            rejected,
        })
    }
}

/// Fans independent backtests out over a bounded pool of worker threads.
#[derive(Clone)]
pub struct RunOrchestrator {
    workers: Option<usize>,
    cache: Option<Arc<dyn IndicatorCache>>,
    cancel: Arc<AtomicBool>,
    show_progress: bool,
}

impl Default for RunOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl RunOrchestrator {
    pub fn new() -> Self {
        Self {
            workers: None,
            cache: None,
            cancel: Arc::new(AtomicBool::new(false)),
            show_progress: false,
        }
    }

    /// Fixed pool size. Defaults to the number of CPUs.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn IndicatorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Tasks not yet picked up by a worker are cancelled. Clones of this
    /// orchestrator share the flag, so another thread can cancel a running batch.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn run(&self, tasks: Vec<BacktestTask>) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        let mut accepted = Vec::with_capacity(tasks.len());
        for task in tasks {
            if seen.insert(task.key.clone()) {
                accepted.push(task);
            } else {
                warn!("Rejecting duplicate task key '{}'", task.key);
                rejected.push((
                    task.key.clone(),
                    TaskError::DuplicateTask { key: task.key },
                ));
            }
        }

        let results = self.run_parallel(accepted);
        if self.is_cancelled() {
            warn!("Run {} was cancelled before every task was dispatched", run_id);
        }

        RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
            rejected,
        }
    }

    fn run_parallel(
        &self,
        tasks: Vec<BacktestTask>,
    ) -> BTreeMap<String, Result<BacktestResult, TaskError>> {
        let mut results = BTreeMap::new();
        let task_count = tasks.len();
        if task_count == 0 {
            return results;
        }

        let available = self
            .workers
            .unwrap_or_else(|| std::cmp::max(1, num_cpus::get()));
        let num_workers = std::cmp::min(task_count, available);
        info!(
            "Running {} backtests on {} worker threads",
            task_count, num_workers
        );

        let (tx, rx): (Sender<BacktestTask>, Receiver<BacktestTask>) = bounded(task_count);
        let (result_tx, result_rx): (Sender<TaskOutcome>, Receiver<TaskOutcome>) =
            bounded(task_count);

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let cache = self.cache.clone();
            let cancel = Arc::clone(&self.cancel);

            let handle = thread::spawn(move || {
                while let Ok(task) = rx.recv() {
                    let key = task.key.clone();
                    let outcome = if cancel.load(Ordering::SeqCst) {
                        Err(TaskError::Cancelled)
                    } else {
                        let start_time = Instant::now();
                        let outcome = execute_task(&task, cache.as_deref());
                        match &outcome {
                            Ok(result) => debug!(
                                "Worker {} finished {} in {:.2}s. Return: {:.2}%, Trades: {}",
                                worker_id,
                                key,
                                start_time.elapsed().as_secs_f64(),
                                result.metrics.total_return * 100.0,
                                result.metrics.total_trades
                            ),
                            Err(error) => warn!("Task {} failed: {}", key, error),
                        }
                        outcome
                    };

                    if result_tx.send((key, outcome)).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        let mut pending: HashSet<String> = HashSet::with_capacity(task_count);
        for task in tasks {
            pending.insert(task.key.clone());
            if let Err(err) = tx.send(task) {
                let task = err.into_inner();
                warn!("No worker available for task {}", task.key);
                pending.remove(&task.key);
                results.insert(
                    task.key,
                    Err(TaskError::Panicked {
                        message: "worker pool shut down before dispatch".to_string(),
                    }),
                );
            }
        }
        drop(tx);

        let progress = if self.show_progress {
            ProgressBar::new(task_count as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            progress.set_style(style.progress_chars("#>-"));
        }

        let mut completed = results.len();
        let mut failed = 0usize;
        while completed < task_count {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok((key, outcome)) => {
                    completed += 1;
                    progress.set_position(completed as u64);
                    if outcome.is_err() {
                        failed += 1;
                    }
                    pending.remove(&key);
                    results.insert(key, outcome);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some results may be lost.");
                    break;
                }
            }
        }

        for key in pending {
            results.insert(
                key,
                Err(TaskError::Panicked {
                    message: "worker exited without reporting a result".to_string(),
                }),
            );
        }

        if failed > 0 {
            warn!("Backtesting completed with {} failed task(s)", failed);
            progress.finish_with_message("Backtesting completed with errors");
        } else {
            progress.finish_with_message("Backtesting completed");
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("Backtest worker thread panicked");
            }
        }

        results
    }
}

/// Run one task, converting a panic anywhere in the pipeline into a task error.
fn execute_task(
    task: &BacktestTask,
    cache: Option<&dyn IndicatorCache>,
) -> Result<BacktestResult, TaskError> {
    catch_unwind(AssertUnwindSafe(|| {
        run_backtest(BacktestInputs {
            series: &task.series,
            config: &task.config,
            scorer: task.scorer.as_deref(),
            cache,
        })
    }))
    .unwrap_or_else(|payload| {
        Err(TaskError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryIndicatorCache;
    use crate::models::{Bar, MlScore};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn series(symbol: &str, count: usize, drift: f64) -> Arc<BarSeries> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let bars = (0..count)
            .map(|i| {
                let base = 50.0 + drift * i as f64 + (i as f64 * 0.45).cos() * 2.0;
                Bar {
                    timestamp: start + ChronoDuration::hours(i as i64),
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.25,
                    volume: 500.0,
                    gap: false,
                }
            })
            .collect();
        Arc::new(BarSeries::new(symbol, "1h", bars))
    }

    fn config() -> BacktestConfig {
        let mut config = BacktestConfig::default();
        config.indicators.ema_fast = 4;
        config.indicators.ema_slow = 10;
        config.indicators.adx_period = 4;
        config.indicators.donchian_period = 6;
        config.signals.threshold = 0.9;
        config.signals.exit_threshold = 0.9;
        config
    }

    #[derive(Debug)]
    struct PanickingScorer;

    impl Scorer for PanickingScorer {
        fn name(&self) -> &str {
            "panicking"
        }

        fn lookback(&self) -> usize {
            1
        }

        fn predict(&self, _window: &[Bar]) -> Option<MlScore> {
            panic!("model exploded")
        }
    }

    #[test]
    fn results_do_not_depend_on_pool_size() {
        let tasks: Vec<BacktestTask> = ["AAA", "BBB", "CCC", "DDD"]
            .iter()
            .enumerate()
            .map(|(i, symbol)| BacktestTask::new(series(symbol, 90, 0.1 * i as f64), config()))
            .collect();

        let single = RunOrchestrator::new().with_workers(1).run(tasks.clone());
        let pooled = RunOrchestrator::new()
            .with_workers(4)
            .with_cache(Arc::new(MemoryIndicatorCache::new()))
            .run(tasks);

        assert_eq!(single.len(), 4);
        assert_eq!(single.results, pooled.results);
        assert_ne!(single.run_id, pooled.run_id);
    }

    #[test]
    fn panic_is_captured_without_affecting_siblings() {
        let tasks = vec![
            BacktestTask::new(series("AAA", 60, 0.2), config()),
            BacktestTask::new(series("BAD", 60, 0.2), config())
                .with_scorer(Arc::new(PanickingScorer)),
        ];
        let report = RunOrchestrator::new().with_workers(2).run(tasks);

        assert!(report.get("AAA").map(|r| r.is_ok()).unwrap_or(false));
        match report.get("BAD") {
            Some(Err(TaskError::Panicked { message })) => assert_eq!(message, "model exploded"),
            other => panic!("expected captured panic, got {:?}", other),
        }
        assert!(matches!(
            report.status("BAD"),
            Some(TaskStatus::Failed { .. })
        ));
    }

    #[test]
    fn cancelled_run_dispatches_nothing() {
        let orchestrator = RunOrchestrator::new().with_workers(2);
        assert!(!orchestrator.is_cancelled());
        orchestrator.clone().cancel();
        assert!(orchestrator.is_cancelled());

        let tasks = vec![
            BacktestTask::new(series("AAA", 40, 0.1), config()),
            BacktestTask::new(series("BBB", 40, 0.1), config()),
        ];
        let report = orchestrator.run(tasks);
        assert_eq!(report.failures().count(), 2);
        assert!(report
            .failures()
            .all(|(_, error)| *error == TaskError::Cancelled));
    }

    #[test]
    fn duplicate_keys_are_rejected_not_run_twice() {
        let data = series("AAA", 40, 0.1);
        let tasks = vec![
            BacktestTask::new(Arc::clone(&data), config()),
            BacktestTask::new(data, config()),
        ];
        let report = RunOrchestrator::new().run(tasks);
        assert_eq!(report.len(), 1);
        assert_eq!(
            report.rejected,
            vec![(
                "AAA".to_string(),
                TaskError::DuplicateTask {
                    key: "AAA".to_string()
                }
            )]
        );
    }

    #[test]
    fn report_serializes_successes_and_failures() {
        let mut broken = config();
        broken.indicators.ema_fast = 20;
        let tasks = vec![
            BacktestTask::new(series("AAA", 40, 0.1), config()),
            BacktestTask::new(series("BBB", 40, 0.1), broken),
        ];
        let report = RunOrchestrator::new().run(tasks);
        let json: serde_json::Value =
            serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();

        let entries = json["tasks"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["key"], "AAA");
        assert!(entries[0]["result"].is_object());
        assert_eq!(entries[1]["status"], "failed");
        assert_eq!(entries[1]["error_kind"], "config_error");
    }

    #[test]
    fn recorded_failures_sit_beside_run_results() {
        let mut report =
            RunOrchestrator::new().run(vec![BacktestTask::new(series("AAA", 40, 0.1), config())]);
        let unreadable = TaskError::Data(crate::error::DataError::Unreadable {
            path: "ZZZ.csv".to_string(),
            reason: "missing".to_string(),
        });

        report.record_failure("ZZZ", unreadable.clone());
        report.record_failure("AAA", unreadable.clone());

        assert_eq!(report.len(), 2);
        assert!(report.get("AAA").map(|r| r.is_ok()).unwrap_or(false));
        assert_eq!(report.get("ZZZ"), Some(&Err(unreadable.clone())));
        assert_eq!(report.rejected, vec![("AAA".to_string(), unreadable)]);
    }

    #[test]
    fn empty_run_is_empty_report() {
        let report = RunOrchestrator::new().run(Vec::new());
        assert!(report.is_empty());
        assert!(report.rejected.is_empty());
    }
}
