//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 *[dramatic orchestral music swells]*
//! 🎬 "In a world where log events pile up faster than anyone can read them..."
//! 🎬 "One action instance dared to POST them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 Actions, workers, transactions — the lifecycle layer.
//!
//! 🧠 Knowledge graph:
//! - **[`Module`]**: owns every [`Action`] in the process plus the shared
//!   stats. Actions are added during config load, removed on teardown —
//!   O(n) removal, and n is "how many output actions did you configure",
//!   so nobody will ever notice
//! - **[`Action`]**: one configured sink — canonicalized base URLs, error
//!   sink, rate limiter, resolved retry ruleset. Shared (`Arc`) by all of
//!   its workers; holds nothing a worker mutates
//! - **[`Worker`]**: one per concurrent worker thread/task — its own HTTP
//!   sessions, batch scratch, server index, last-URL string. Never shared
//! - **Transactions**: `begin_transaction` resets the batch, `do_action`
//!   appends (flushing first if the byte cap says so), `end_transaction`
//!   flushes what's left. [`Commit::PreviousCommitted`] tells the host that
//!   everything before the current record is durable and need not be
//!   replayed if the transaction later dies
//! - **Suspension**: transport-level failures return [`Suspended`] inside
//!   the error; the host backs off and calls [`Worker::try_resume`], which
//!   re-runs the health prober
//!
//! ⚠️ Workers are single-threaded on purpose. The only await points are
//! HTTP I/O and retry-queue backpressure. Do not add more.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::app_config::ActionConfig;
use crate::bulk::{Batch, estimate_record_size, render_meta};
use crate::error_file::ErrorSink;
use crate::event::{Keys, Record};
use crate::health;
use crate::ratelimit::RateLimiter;
use crate::response;
use crate::retry::{RetryRuleset, RulesetRegistry};
use crate::stats::Stats;
use crate::transport::{Sessions, Suspended, apply_auth};
use crate::url;

/// 🧾 What `do_action` tells the host about durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
    /// the record was posted immediately and is done
    Done,
    /// the record is buffered; commit happens at transaction end
    Defer,
    /// the record is buffered AND everything before it is already durable —
    /// on a later failure, only records from here on need replaying
    PreviousCommitted,
}

/// 🎛️ Host feature queries. Short list. Honest answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// collapsing "last message repeated n times" runs upstream of us — fine
    RepeatedMsgReduction,
}

/// 📦 One configured output action: where to post, how to batch, what to do
/// when the cluster says no.
#[derive(Debug)]
pub struct Action {
    pub(crate) cfg: ActionConfig,
    /// canonicalized `scheme://host:port/` per configured server
    pub(crate) base_urls: Vec<String>,
    pub(crate) stats: Arc<Stats>,
    pub(crate) error_sink: ErrorSink,
    /// present iff `retryfailures` is on
    pub(crate) ratelimiter: Option<RateLimiter>,
    /// resolved at creation; `None` when the ruleset isn't registered
    pub(crate) retry_ruleset: Option<RetryRuleset>,
}

impl Action {
    /// 🏗️ Validate the config, canonicalize the endpoints, wire the error
    /// sink and the retry machinery. This is the config-check moment: bad
    /// definitions die here, before any worker exists.
    pub fn new(
        mut cfg: ActionConfig,
        stats: Arc<Stats>,
        registry: Option<&RulesetRegistry>,
    ) -> Result<Arc<Action>> {
        cfg.validate()?;

        let base_urls = cfg
            .server
            .iter()
            .map(|s| url::base_url(s, cfg.serverport, cfg.usehttps))
            .collect();
        let error_sink = ErrorSink::new(cfg.errorfile.clone().map(PathBuf::from));

        let (ratelimiter, retry_ruleset) = if cfg.retryfailures {
            let limiter = RateLimiter::new(cfg.ratelimit.interval, cfg.ratelimit.burst);
            let ruleset = match (&cfg.retryruleset, registry) {
                (Some(name), Some(registry)) => {
                    let resolved = registry.resolve(name);
                    if resolved.is_none() {
                        warn!(
                            ruleset = %name,
                            "retryruleset not found - no retry ruleset will be used"
                        );
                    }
                    resolved
                }
                (Some(name), None) => {
                    warn!(
                        ruleset = %name,
                        "no ruleset registry available - no retry ruleset will be used"
                    );
                    None
                }
                (None, _) => None,
            };
            (Some(limiter), ruleset)
        } else {
            (None, None)
        };

        Ok(Arc::new(Action {
            cfg,
            base_urls,
            stats,
            error_sink,
            ratelimiter,
            retry_ruleset,
        }))
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn supports(&self, feature: Feature) -> bool {
        matches!(feature, Feature::RepeatedMsgReduction)
    }

    /// 🔄 HUP handling: close the error file so the next write reopens it.
    pub fn hup(&self) {
        self.error_sink.hup();
    }

    /// 🔍 Dump the effective configuration at debug level — the first thing
    /// anyone wants when "it's configured right, I swear" meets reality.
    pub fn debug_dump(&self) {
        let cfg = &self.cfg;
        debug!(servers = ?self.base_urls, "action endpoints");
        debug!(
            template = cfg.template.as_deref().unwrap_or("(not configured)"),
            healthchecktimeout = cfg.healthchecktimeout,
            indextimeout = cfg.indextimeout,
            serverport = cfg.serverport,
            usehttps = cfg.usehttps,
            "action transport"
        );
        debug!(
            searchindex = cfg.searchindex.as_deref().unwrap_or("(not configured)"),
            searchtype = cfg.searchtype.as_deref().unwrap_or("(not configured)"),
            pipelinename = cfg.pipelinename.as_deref().unwrap_or("(not configured)"),
            dynsearchindex = cfg.dynsearchindex,
            dynsearchtype = cfg.dynsearchtype,
            dynparent = cfg.dynparent,
            dynbulkid = cfg.dynbulkid,
            dynpipelinename = cfg.dynpipelinename,
            skippipelineifempty = cfg.skippipelineifempty,
            writeoperation = cfg.writeoperation.as_str(),
            "action routing"
        );
        debug!(
            bulkmode = cfg.bulkmode,
            maxbytes = cfg.maxbytes,
            rebindinterval = cfg.rebindinterval,
            errorfile = cfg.errorfile.as_deref().unwrap_or("(not configured)"),
            erroronly = cfg.erroronly,
            interleaved = cfg.interleaved,
            retryfailures = cfg.retryfailures,
            ratelimit_interval = cfg.ratelimit.interval,
            ratelimit_burst = cfg.ratelimit.burst,
            "action behavior"
        );
    }
}

/// 📚 The module handle: every action in the process, plus the shared stats.
#[derive(Debug)]
pub struct Module {
    actions: Vec<Arc<Action>>,
    stats: Arc<Stats>,
}

impl Module {
    pub fn new() -> Self {
        Module {
            actions: Vec::new(),
            stats: Arc::new(Stats::default()),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// ➕ Config-load path: validate and adopt one action.
    pub fn add_action(
        &mut self,
        cfg: ActionConfig,
        registry: Option<&RulesetRegistry>,
    ) -> Result<Arc<Action>> {
        let action = Action::new(cfg, self.stats.clone(), registry)?;
        self.actions.push(action.clone());
        Ok(action)
    }

    /// ➖ Teardown path. Linear scan; instance counts are tiny.
    pub fn remove_action(&mut self, action: &Arc<Action>) {
        self.actions.retain(|a| !Arc::ptr_eq(a, action));
    }

    /// 🔄 HUP every action — error files close, next writes reopen.
    pub fn hup_all(&self) {
        for action in &self.actions {
            action.hup();
        }
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }
}

impl Default for Module {
    fn default() -> Self {
        Module::new()
    }
}

/// 🧵 One worker's execution context: sessions, scratch, and a server index
/// all its own. Create on attach, drop on detach.
#[derive(Debug)]
pub struct Worker {
    action: Arc<Action>,
    sessions: Sessions,
    server_index: usize,
    /// last used REST URL, kept for error reports
    last_url: String,
    batch: Batch,
}

impl Worker {
    pub fn new(action: Arc<Action>) -> Result<Worker> {
        let sessions = Sessions::new(&action.cfg)?;
        Ok(Worker {
            action,
            sessions,
            server_index: 0,
            last_url: String::new(),
            batch: Batch::new(),
        })
    }

    pub fn action(&self) -> &Arc<Action> {
        &self.action
    }

    /// 🎬 Transaction start: in bulk mode, the batch scratch starts clean.
    pub fn begin_transaction(&mut self) {
        if self.action.cfg.bulkmode {
            self.batch.reset();
        }
    }

    /// 📨 Handle one record.
    ///
    /// Bulk mode: if the byte cap says this record would overflow the batch,
    /// flush first, then append. The commit result tells the host whether
    /// earlier records are durable. Non-bulk: post it right now.
    pub async fn do_action(&mut self, record: &Record) -> Result<Commit> {
        let action = self.action.clone();
        let cfg = &action.cfg;
        action.stats.submitted.inc();

        if cfg.bulkmode {
            let keys = Keys::resolve(cfg, Some(record));
            let projected = estimate_record_size(
                cfg.writeoperation,
                &keys,
                cfg.skippipelineifempty,
                record.payload.len(),
            );
            if cfg.maxbytes > 0 && self.batch.len() + projected > cfg.maxbytes {
                debug!(
                    count = self.batch.count(),
                    "maxbytes limit reached, submitting partial batch"
                );
                self.submit_batch().await?;
                self.batch.reset();
            }
            let meta = render_meta(cfg.writeoperation, &keys, cfg.skippipelineifempty);
            self.batch.append(&meta, &record.payload);

            // sole item in a fresh batch → everything before it is durable
            Ok(if self.batch.count() == 1 {
                Commit::PreviousCommitted
            } else {
                Commit::Defer
            })
        } else {
            let body = record.payload.clone();
            self.post(body, Some(record), 1).await?;
            Ok(Commit::Done)
        }
    }

    /// 🏁 Transaction end: flush whatever the batch still holds.
    pub async fn end_transaction(&mut self) -> Result<()> {
        if self.action.cfg.bulkmode && !self.batch.is_empty() {
            self.submit_batch().await?;
        } else {
            debug!("end of transaction with an empty batch, nothing to send");
        }
        Ok(())
    }

    /// 🩺 The resume path: re-run the prober. Called by the host after a
    /// suspension, once it feels like trying again.
    pub async fn try_resume(&mut self) -> Result<()> {
        debug!("tryResume called");
        health::check_conn(
            &self.action.cfg,
            &self.sessions,
            &self.action.base_urls,
            &mut self.server_index,
            &self.action.stats,
        )
        .await
    }

    async fn submit_batch(&mut self) -> Result<()> {
        let body = self.batch.body().to_owned();
        let count = self.batch.count();
        debug!(bytes = body.len(), count, "submitting batch");
        self.post(body, None, count).await
    }

    /// 📡 One POST, fully supervised: rebind bookkeeping, optional health
    /// probe, URL selection, transport classification, reply analysis.
    async fn post(&mut self, body: String, record: Option<&Record>, nmsgs: usize) -> Result<()> {
        let result = self.post_inner(body, record, nmsgs).await;
        // round-robin load spreading: one step per post, success or not
        self.server_index = (self.server_index + 1) % self.action.base_urls.len();
        result
    }

    async fn post_inner(
        &mut self,
        body: String,
        record: Option<&Record>,
        nmsgs: usize,
    ) -> Result<()> {
        let action = self.action.clone();
        let cfg = &action.cfg;

        let forbid_reuse = self.sessions.prepare_rebind(cfg, &action.stats)?;

        // the prober only earns its keep with somewhere to fail over to;
        // with a single server the POST itself is the health check
        if action.base_urls.len() > 1 {
            health::check_conn(
                cfg,
                &self.sessions,
                &action.base_urls,
                &mut self.server_index,
                &action.stats,
            )
            .await?;
        }

        let keys = Keys::resolve(cfg, record);
        let post_url = url::post_url(
            &action.base_urls[self.server_index],
            &keys,
            cfg.timeout.as_deref(),
            cfg.skippipelineifempty,
            cfg.bulkmode,
        );
        debug!(url = %post_url, "using REST URL");
        self.last_url = post_url;

        let mut request = apply_auth(self.sessions.post.post(&self.last_url), cfg);
        if forbid_reuse {
            request = request.header("Connection", "close");
        }

        let response = match request.body(body.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                action.stats.http_req_fail.inc();
                action.stats.http_fail.add(nmsgs as u64);
                warn!(%err, "suspending ourselves due to server failure");
                return Err(Suspended::new(err.to_string()).into());
            }
        };

        let reply = match response.text().await {
            Ok(text) => text,
            Err(err) => {
                // the reply body died mid-read — same class as a dead wire
                action.stats.http_req_fail.inc();
                action.stats.http_fail.add(nmsgs as u64);
                warn!(%err, "suspending ourselves due to server failure");
                return Err(Suspended::new(err.to_string()).into());
            }
        };
        self.sessions.note_operation(cfg);

        if reply.is_empty() {
            debug!("empty reply body, nothing to analyze");
            return Ok(());
        }
        response::analyze_reply(&action, &self.last_url, Some(&body), &reply).await
    }
}
