use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config, HeaderProfile};
use crate::parse::extract;
use crate::persist::{run_sink, SinkSummary, StoreFile};
use crate::progress::Progress;
use crate::record::{Outcome, ResultRecord};
use crate::registry::Registry;
use crate::request::{probe_proxy, Fetch, HttpFetcher};
use crate::retry::RetryPolicy;
use crate::{info_time, Error, Result, RECORD_CHANNEL_CAPACITY};

/// Loads the rolls, checks the proxy, and runs the whole pipeline.
pub async fn process_rolls(config: Config, cancel: CancellationToken) -> Result<RunSummary> {
    config.validate()?;
    let start_time = Local::now();

    let store_file = StoreFile::new(&config.store);
    let registry = Registry::load(&config.rolls, &store_file).await?;
    let pending = registry.pending();
    info_time!(start_time, "Total rolls to process: {}", pending.len());

    if pending.is_empty() {
        info_time!("All rolls already processed!");
        return Ok(RunSummary::default());
    }

    let headers = HeaderProfile::for_endpoint(&config.endpoint)?;
    let proxy = match &config.proxies {
        Some(path) => {
            let proxies = config::load_proxies(path).await?;
            config::choose_proxy(&proxies).map(str::to_string)
        }
        None => None,
    };

    if let Some(proxy) = &proxy {
        match probe_proxy(proxy, &config.probe_url).await {
            Ok(body) => tracing::info!(proxy = %proxy, probe = %body.trim(), "Proxy is reachable"),
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        }
    }

    let fetcher = HttpFetcher::new(
        &config.endpoint,
        &config.exam,
        headers,
        proxy.as_deref(),
        config.timeout(),
    )?;

    run_pipeline(
        pending,
        Arc::new(fetcher),
        PipelineOptions::from(&config),
        store_file,
        cancel,
    )
    .await
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub flush_idle: Duration,
    pub shutdown_grace: Duration,
}

impl From<&Config> for PipelineOptions {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            flush_idle: config.flush_idle(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pool: PoolSummary,
    pub sink: SinkSummary,
}

/// Fans the pending rolls out to the worker pool and funnels every record
/// into one sink task that owns the store file.
pub async fn run_pipeline(
    pending: Vec<String>,
    fetcher: Arc<dyn Fetch>,
    options: PipelineOptions,
    store_file: StoreFile,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let start_time = Local::now();
    let (record_tx, record_rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let sink_handle = tokio::spawn(run_sink(
        record_rx,
        cancel.clone(),
        store_file,
        options.flush_idle,
    ));

    let pool = WorkerPool::new(fetcher, options.retry, options.concurrency);
    let pool_result = pool.run(pending, record_tx, cancel.clone()).await;
    info_time!(start_time, "Finished PROCESSING all rolls.");

    // Every sender is gone now, so the sink is on its last flush.
    let sink = if cancel.is_cancelled() {
        match tokio::time::timeout(options.shutdown_grace, sink_handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                tracing::error!(
                    grace_secs = options.shutdown_grace.as_secs(),
                    "Store writer didn't finish in time, some results may be unsaved"
                );
                SinkSummary::default()
            }
        }
    } else {
        sink_handle.await?
    };

    Ok(RunSummary {
        pool: pool_result?,
        sink,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    /// Claimed but given up on because of cancellation. Still pending.
    pub cancelled: usize,
}

impl PoolSummary {
    fn count(&mut self, outcome: Option<Outcome>) {
        match outcome {
            Some(Outcome::Passed) => self.passed += 1,
            Some(Outcome::Failed) => self.failed += 1,
            Some(Outcome::Error) => self.errored += 1,
            None => self.cancelled += 1,
        }
    }

    fn merge(&mut self, other: PoolSummary) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.cancelled += other.cancelled;
    }

    pub fn completed(&self) -> usize {
        self.passed + self.failed + self.errored
    }
}

/// A fixed number of workers pulling rolls off a shared cursor.
///
/// Each roll is claimed exactly once. Nothing else is shared between workers
/// apart from the record channel and the cancellation token.
pub struct WorkerPool {
    fetcher: Arc<dyn Fetch>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(fetcher: Arc<dyn Fetch>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            fetcher,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Returns once every worker has exited. `record_tx` is dropped on return.
    pub async fn run(
        &self,
        pending: Vec<String>,
        record_tx: mpsc::Sender<ResultRecord>,
        cancel: CancellationToken,
    ) -> Result<PoolSummary> {
        let total = pending.len();
        let rolls: Arc<[String]> = pending.into();
        let cursor = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(Progress::new(total));

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency.min(total) {
            workers.spawn(worker_loop(
                rolls.clone(),
                cursor.clone(),
                progress.clone(),
                self.fetcher.clone(),
                self.retry,
                record_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(record_tx);

        let mut summary = PoolSummary::default();
        while let Some(worker) = workers.join_next().await {
            summary.merge(worker??);
        }

        progress.log_summary();
        tracing::info!(
            passed = summary.passed,
            failed = summary.failed,
            errored = summary.errored,
            cancelled = summary.cancelled,
            "Worker pool finished"
        );
        Ok(summary)
    }
}

async fn worker_loop(
    rolls: Arc<[String]>,
    cursor: Arc<AtomicUsize>,
    progress: Arc<Progress>,
    fetcher: Arc<dyn Fetch>,
    retry: RetryPolicy,
    record_tx: mpsc::Sender<ResultRecord>,
    cancel: CancellationToken,
) -> Result<PoolSummary> {
    let mut summary = PoolSummary::default();

    while !cancel.is_cancelled() {
        let index = cursor.fetch_add(1, Ordering::Relaxed);
        let Some(roll) = rolls.get(index) else {
            break;
        };
        progress.log_claim(index + 1, roll);

        let record = process_roll(roll, fetcher.as_ref(), &retry, &cancel).await;
        summary.count(record.as_ref().map(|r| r.status));

        if let Some(record) = record {
            progress.mark_done();
            tracing::debug!(roll = %record.roll, status = ?record.status, "Processed roll");
            record_tx.send(record).await?;
        }
    }

    Ok(summary)
}

/// Fetch, retry, extract. Failures become ERROR records, `None` means cancelled.
async fn process_roll(
    roll: &str,
    fetcher: &dyn Fetch,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Option<ResultRecord> {
    let html = match retry.run(roll, cancel, || fetcher.fetch(roll)).await {
        Ok(html) => html,
        Err(Error::Cancelled) => {
            tracing::debug!(roll, "Stopped by user");
            return None;
        }
        Err(e) => {
            tracing::error!(roll, error = %e, "Error processing roll");
            return Some(ResultRecord::error(roll, e.to_string()));
        }
    };

    match extract(roll.to_string(), html).await {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::error!(roll, error = %e, "Error processing roll");
            Some(ResultRecord::error(roll, e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::FAILED_PHRASE;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers from a fixed script, counting calls per roll.
    struct Scripted {
        pages: HashMap<String, String>,
        calls: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl Fetch for Scripted {
        async fn fetch(&self, roll: &str) -> Result<String> {
            *self
                .calls
                .lock()
                .unwrap()
                .entry(roll.to_string())
                .or_default() += 1;
            match self.pages.get(roll) {
                Some(page) => Ok(page.clone()),
                None => Err(Error::Transient {
                    roll: roll.to_string(),
                    reason: "Empty response".into(),
                }),
            }
        }
    }

    fn failed_page() -> String {
        format!(r#"<table><tr><td><span class="red12bold">{FAILED_PHRASE}</span></td></tr></table>"#)
    }

    #[tokio::test]
    async fn failures_stay_isolated_per_roll() {
        let mut pages = HashMap::new();
        pages.insert("A".to_string(), failed_page());
        pages.insert("B".to_string(), "<html>maintenance</html>".to_string());
        let fetcher = Arc::new(Scripted {
            pages,
            calls: Mutex::default(),
        });

        let pool = WorkerPool::new(
            fetcher.clone(),
            RetryPolicy::new(2, Duration::from_millis(1)),
            4,
        );
        let (tx, mut rx) = mpsc::channel(16);
        let summary = pool
            .run(
                vec!["A".into(), "B".into(), "C".into()],
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errored, 2);

        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        records.sort_by(|a, b| a.roll.cmp(&b.roll));
        assert_eq!(records[0], ResultRecord::failed("A"));
        assert_eq!(records[1].status, Outcome::Error);
        assert!(records[2].error.as_deref().unwrap().contains("after 2 attempts"));

        let calls = fetcher.calls.lock().unwrap();
        assert_eq!(calls["A"], 1);
        assert_eq!(calls["B"], 1);
        assert_eq!(calls["C"], 2);
    }

    #[tokio::test]
    async fn cancelled_pool_claims_nothing() {
        let fetcher = Arc::new(Scripted {
            pages: HashMap::new(),
            calls: Mutex::default(),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pool = WorkerPool::new(fetcher.clone(), RetryPolicy::new(1, Duration::ZERO), 2);
        let (tx, mut rx) = mpsc::channel(4);
        let summary = pool
            .run(vec!["A".into(), "B".into()], tx, cancel)
            .await
            .unwrap();

        assert_eq!(summary, PoolSummary::default());
        assert!(rx.recv().await.is_none());
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }
}
