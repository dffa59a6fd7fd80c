//! 🎬 *[a channel fills with rendered log events. somewhere, a worker waits.]*
//! *[the clock on the wall reads 2:47am.]*
//! *[nobody asked for this backlog. and yet, here we are.]*
//!
//! 🚰 The shipping pipeline — the host role, played by this crate's own CLI.
//!
//! One source worker reads pre-rendered NDJSON events (plain file or `.gz`)
//! and pumps [`Record`]s into a bounded channel. N shipper workers drain the
//! channel in transaction-sized chunks and drive a [`Worker`] through
//! begin → do_action × n → end. A suspension backs the shipper off, runs the
//! resume path, and replays the chunk.
//!
//! 🧠 Knowledge graph:
//! - **Backpressure**: the channel is bounded; a slow cluster slows the
//!   file reader instead of inflating memory
//! - **Enum-dispatched sources**: File for production, InMemory for tests —
//!   same trait, zero dynamic dispatch
//! - **Retry drain**: when the action reinjects failures, the CLI registers
//!   the ruleset as a logging drain. Embedding hosts register their own
//!   consumer instead and do something smarter with the messages
//!
//! 🦆 (the duck has been promoted to backpressure management. it is
//! overwhelmed but coping.)

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::{Module, Worker};
use crate::app_config::AppConfig;
use crate::event::Record;
use crate::progress::ProgressMetrics;
use crate::retry::RulesetRegistry;
use crate::stats::Stats;
use crate::transport::Suspended;

/// 🔁 How many times one chunk gets replayed across suspensions before the
/// pipeline gives up and surfaces the error.
const MAX_SHIP_ATTEMPTS: usize = 5;

/// 🚰 A source of rendered events. One next_record at a time until `None`.
#[async_trait]
pub(crate) trait EventSource {
    async fn next_record(&mut self) -> Result<Option<Record>>;
    /// called once, after the source returns its final record
    fn finish(&self) {}
}

/// 🎭 The casting agency for sources: File reads NDJSON (gzipped or not),
/// InMemory vends a canned list for tests.
pub(crate) enum EventSourceBackend {
    File(FileEventSource),
    InMemory(InMemorySource),
}

#[async_trait]
impl EventSource for EventSourceBackend {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        match self {
            EventSourceBackend::File(source) => source.next_record().await,
            EventSourceBackend::InMemory(source) => source.next_record().await,
        }
    }

    fn finish(&self) {
        match self {
            EventSourceBackend::File(source) => source.finish(),
            EventSourceBackend::InMemory(source) => source.finish(),
        }
    }
}

/// 📄 Line-oriented readers: async for plain files, sync-behind-the-scenes
/// for gzip (the decoder is synchronous; lines are short and so is the stall).
enum LineReader {
    Plain(tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>),
    Gzip(std::io::Lines<std::io::BufReader<GzDecoder<std::fs::File>>>),
}

impl std::fmt::Debug for LineReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineReader::Plain(_) => f.write_str("LineReader::Plain(..)"),
            LineReader::Gzip(_) => f.write_str("LineReader::Gzip(..)"),
        }
    }
}

/// 📂 Reads one rendered payload per line. Empty lines are skipped — trailing
/// newlines at EOF should not become empty documents.
#[derive(Debug)]
pub(crate) struct FileEventSource {
    reader: LineReader,
    progress: ProgressMetrics,
}

impl FileEventSource {
    pub(crate) async fn new(file_name: &str) -> Result<Self> {
        if file_name.ends_with(".gz") {
            let file = std::fs::File::open(file_name).with_context(|| {
                format!("💀 The door to '{file_name}' would not budge. We knocked. We pleaded.")
            })?;
            // decompressed size is unknowable up front → spinner mode
            let progress = ProgressMetrics::new(file_name, 0);
            let reader = std::io::BufReader::new(GzDecoder::new(file)).lines();
            Ok(FileEventSource {
                reader: LineReader::Gzip(reader),
                progress,
            })
        } else {
            let file = tokio::fs::File::open(file_name).await.with_context(|| {
                format!("💀 The door to '{file_name}' would not budge. We knocked. We pleaded.")
            })?;
            let total = file.metadata().await.map(|m| m.len()).unwrap_or(0);
            let progress = ProgressMetrics::new(file_name, total);
            let reader = tokio::io::BufReader::new(file).lines();
            Ok(FileEventSource {
                reader: LineReader::Plain(reader),
                progress,
            })
        }
    }

}

#[async_trait]
impl EventSource for FileEventSource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let line = match &mut self.reader {
                LineReader::Plain(lines) => lines
                    .next_line()
                    .await
                    .context("error reading event file")?,
                LineReader::Gzip(lines) => lines
                    .next()
                    .transpose()
                    .context("error reading gzipped event file")?,
            };
            match line {
                None => return Ok(None),
                Some(line) => {
                    self.progress.add_record(line.len() as u64 + 1);
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(Record::from_payload(line)));
                }
            }
        }
    }

    fn finish(&self) {
        self.progress.finish();
    }
}

/// 🧪 A canned source for tests: no I/O, no regrets.
pub(crate) struct InMemorySource {
    records: std::collections::VecDeque<Record>,
}

impl InMemorySource {
    pub(crate) fn new(payloads: Vec<String>) -> Self {
        InMemorySource {
            records: payloads.into_iter().map(Record::from_payload).collect(),
        }
    }
}

#[async_trait]
impl EventSource for InMemorySource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.pop_front())
    }
}

/// 🏗️ A background worker that does work. duh.
pub(crate) trait PipelineWorker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 🚰 Pumps records from the source into the channel, then hangs up.
/// The dropped sender is the end-of-input signal — no sentinel values.
struct SourcePump {
    tx: Sender<Record>,
    source: EventSourceBackend,
}

impl PipelineWorker for SourcePump {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("source pump started");
            while let Some(record) = self.source.next_record().await? {
                if self.tx.send(record).await.is_err() {
                    warn!("all shippers are gone; stopping the source early");
                    break;
                }
            }
            self.source.finish();
            debug!("source pump finished");
            Ok(())
        })
    }
}

/// 📦 Drains the channel in transaction-sized chunks and ships each one,
/// replaying across suspensions with backoff + resume.
struct Shipper {
    rx: Receiver<Record>,
    worker: Worker,
    transaction_size: usize,
}

impl PipelineWorker for Shipper {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("shipper started");
            let mut chunk: Vec<Record> = Vec::with_capacity(self.transaction_size);
            loop {
                match self.rx.recv().await {
                    Ok(record) => {
                        chunk.push(record);
                        if chunk.len() >= self.transaction_size {
                            ship_chunk(&mut self.worker, &chunk).await?;
                            chunk.clear();
                        }
                    }
                    Err(_) => {
                        // channel closed — final flush, then lights out
                        if !chunk.is_empty() {
                            ship_chunk(&mut self.worker, &chunk).await?;
                        }
                        debug!("shipper: channel closed, goodnight 💤");
                        return Ok(());
                    }
                }
            }
        })
    }
}

/// 📬 One chunk, one transaction — retried across suspensions.
///
/// On a replay the whole chunk is resubmitted; the durability hints from
/// `do_action` are for hosts with finer-grained replay bookkeeping than a
/// CLI needs.
async fn ship_chunk(worker: &mut Worker, chunk: &[Record]) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ship_once(worker, chunk).await {
            Ok(()) => return Ok(()),
            Err(err) if err.downcast_ref::<Suspended>().is_some() && attempt < MAX_SHIP_ATTEMPTS => {
                let pause = backoff(attempt);
                warn!(attempt, ?pause, "shipment suspended; backing off before resume");
                tokio::time::sleep(pause).await;
                if let Err(resume_err) = worker.try_resume().await {
                    debug!(%resume_err, "resume probe failed; will retry the chunk anyway");
                }
            }
            Err(err) => return Err(err),
        }
    }
}

async fn ship_once(worker: &mut Worker, chunk: &[Record]) -> Result<()> {
    worker.begin_transaction();
    for record in chunk {
        worker.do_action(record).await?;
    }
    worker.end_transaction().await
}

/// ⏳ 1s, 2s, 4s, 8s — capped, because a cluster that needs more than 8s of
/// apology is not coming back because we waited politely.
fn backoff(attempt: usize) -> Duration {
    let exp = attempt.min(4) as u32;
    Duration::from_millis(500u64 << exp)
}

/// 🚀 The grand entry point: build the module and action, wire the retry
/// drain, spawn the pump and the shippers, and see every record out the door.
pub(crate) async fn run(app_config: AppConfig) -> Result<Arc<Stats>> {
    let input = app_config
        .input
        .clone()
        .context("no [input] section configured - nothing to ship")?;
    let source = EventSourceBackend::File(FileEventSource::new(&input.file_name).await?);
    run_with_source(app_config, source).await
}

/// 🧪 Same pipeline, caller-supplied source. Tests enter here.
pub(crate) async fn run_with_source(
    app_config: AppConfig,
    source: EventSourceBackend,
) -> Result<Arc<Stats>> {
    let runtime = app_config.runtime.clone();

    // 🎟️ the CLI's host role: give the retry ruleset somewhere to drain to
    let mut registry = RulesetRegistry::new();
    let drain_rx = match (
        app_config.action.retryfailures,
        app_config.action.retryruleset.as_deref(),
    ) {
        (true, Some(name)) => Some(registry.register(name, runtime.queue_capacity)),
        _ => None,
    };
    let drain_handle = drain_rx.map(|rx| {
        tokio::spawn(async move {
            let mut drained = 0u64;
            while let Ok(msg) = rx.recv().await {
                drained += 1;
                debug!(
                    writeoperation = %msg.omes["writeoperation"],
                    status = %msg.omes["status"],
                    raw = %msg.raw,
                    "retry ruleset received a message"
                );
            }
            if drained > 0 {
                info!(drained, "retry drain finished");
            }
        })
    });

    let mut module = Module::new();
    let action = module.add_action(app_config.action, Some(&registry))?;
    // the registry's own senders must go away, or the drain outlives the run
    drop(registry);
    action.debug_dump();
    let stats = module.stats();

    let (tx, rx) = async_channel::bounded(runtime.queue_capacity);

    let mut handles = Vec::with_capacity(runtime.shipper_parallelism + 1);
    for _ in 0..runtime.shipper_parallelism {
        let shipper = Shipper {
            rx: rx.clone(),
            worker: Worker::new(action.clone())?,
            transaction_size: runtime.transaction_size.max(1),
        };
        handles.push(shipper.start());
    }
    handles.push(SourcePump { tx, source }.start());
    drop(rx);

    let results = futures::future::join_all(handles).await;
    for result in results {
        // 🤯 result?? — the outer `?` unwraps the JoinHandle, the inner `?` the work
        result??;
    }

    // release the action so the retry channel closes and the drain can retire
    module.remove_action(&action);
    drop(action);
    drop(module);
    if let Some(handle) = drain_handle {
        let _ = handle.await;
    }

    info!("shipping complete");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::{ActionConfig, EsVersionConfig, RuntimeConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_config(server_uri: &str, transaction_size: usize) -> AppConfig {
        AppConfig {
            action: ActionConfig {
                server: vec![server_uri.to_string()],
                searchindex: Some("logs".into()),
                bulkmode: true,
                esversion: EsVersionConfig { major: 8 },
                ..ActionConfig::default()
            },
            runtime: RuntimeConfig {
                queue_capacity: 8,
                shipper_parallelism: 1,
                transaction_size,
            },
            input: None,
        }
    }

    #[tokio::test]
    async fn the_one_where_four_events_made_it_home_safely() {
        // 🧪 full pipeline: InMemory source → channel → shipper → mock cluster.
        // transaction_size 2 → two bulk posts of two documents each.
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": false,
                "items": [{"index": {"status": 201}}, {"index": {"status": 201}}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let payloads = (1..=4).map(|n| format!("{{\"doc\":{n}}}")).collect();
        let source = EventSourceBackend::InMemory(InMemorySource::new(payloads));

        let stats = run_with_source(app_config(&server.uri(), 2), source)
            .await
            .expect("pipeline completes");

        assert_eq!(stats.submitted.get(), 4);
        assert_eq!(stats.success.get(), 4);
        assert_eq!(stats.es_fail.get(), 0);
    }

    #[tokio::test]
    async fn the_one_where_the_file_source_reads_plain_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("events.ndjson");
        std::fs::write(&file_path, "{\"a\":1}\n{\"a\":2}\n\n{\"a\":3}\n").unwrap();

        let mut source = FileEventSource::new(file_path.to_str().unwrap())
            .await
            .expect("file opens");

        let mut payloads = Vec::new();
        while let Some(record) = source.next_record().await.unwrap() {
            payloads.push(record.payload);
        }
        // the blank line in the middle vanished; three real events remain
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"a\":2}", "{\"a\":3}"]);
    }

    #[tokio::test]
    async fn the_one_where_the_file_source_inhales_gzip() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("events.ndjson.gz");
        let file = std::fs::File::create(&file_path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(b"{\"z\":1}\n{\"z\":2}\n").unwrap();
        encoder.finish().unwrap();

        let mut source = FileEventSource::new(file_path.to_str().unwrap())
            .await
            .expect("gz file opens");

        let mut count = 0;
        while let Some(record) = source.next_record().await.unwrap() {
            assert!(record.payload.starts_with("{\"z\":"));
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn the_one_where_a_missing_input_file_fails_loudly() {
        let err = FileEventSource::new("/no/such/file.ndjson")
            .await
            .expect_err("missing files are an error, not a silent empty source");
        assert!(err.to_string().contains("would not budge"), "got: {err}");
    }

    #[test]
    fn the_one_where_backoff_grows_then_plateaus() {
        assert_eq!(backoff(1), Duration::from_millis(1000));
        assert_eq!(backoff(2), Duration::from_millis(2000));
        assert_eq!(backoff(4), Duration::from_millis(8000));
        assert_eq!(backoff(9), Duration::from_millis(8000), "capped");
    }
}
