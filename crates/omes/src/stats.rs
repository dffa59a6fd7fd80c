//! 📊 stats.rs — the scoreboard. Every document that ever dared to travel
//! through this sink ends up as a +1 somewhere in here.
//!
//! 🧠 Knowledge graph:
//! - **Origin**: counters publish under `omelasticsearch` — the sink's
//!   registered stats origin, kept stable so existing dashboards keep working
//! - **Resettable**: every counter can be zeroed without tearing the set down
//! - **Who increments what**: submit path → `submitted`; transport layer →
//!   `failed.http*` / `rebinds`; prober → `failed.checkConn`; reply analyzer →
//!   `failed.es` + the whole `response.*` family
//!
//! ⚠️ These are plain relaxed atomics. They count things. They do not
//! synchronize things. Do not build a lock out of a scoreboard.

use std::sync::atomic::{AtomicU64, Ordering};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};

/// 📛 The stats origin this sink registers under. Grep-stable on purpose —
/// monitoring configs in the wild key off this exact string.
pub const STATS_ORIGIN: &str = "omelasticsearch";

/// 🔢 One resettable counter. `inc`/`add` on the hot path, `get`/`reset`
/// from whoever is reading the scoreboard.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// 📊 The full counter set for one process. Shared via `Arc` between every
/// worker of every action — workers bump, operators read, nobody waits.
///
/// Field ↔ published-name mapping lives in [`Stats::snapshot`]. If you add a
/// counter here and forget it there, it counts in total silence forever.
#[derive(Debug, Default)]
pub struct Stats {
    /// 🚀 messages handed to the sink (bulk-buffered or posted directly)
    pub submitted: Counter,
    /// 💀 messages lost to transport-level failures (sum of batch sizes)
    pub http_fail: Counter,
    /// 💀 HTTP requests that never completed (DNS, connect, TLS, timeout)
    pub http_req_fail: Counter,
    /// 🩺 health probes that got no answer
    pub check_conn_fail: Counter,
    /// 🗑️ replies that were unusable, or bulk replies carrying failures
    pub es_fail: Counter,
    /// ✅ per-item 200/201
    pub success: Counter,
    /// 🤷 per-item responses we could not make sense of
    pub bad_response: Counter,
    /// 👯 per-item 409 on an effectively-create operation
    pub duplicate: Counter,
    /// 🚫 per-item 400 or sub-200 weirdness
    pub bad_argument: Counter,
    /// 🛑 per-item 429 with a typed error — the cluster said "not now"
    pub bulk_rejection: Counter,
    /// 🎲 per-item typed errors that fit no other bucket
    pub other_response: Counter,
    /// 🔌 forced fresh connections (rebind interval crossed)
    pub rebinds: Counter,
}

impl Stats {
    /// 📸 (published name, current value) for every counter, in display order.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("submitted", self.submitted.get()),
            ("failed.http", self.http_fail.get()),
            ("failed.httprequests", self.http_req_fail.get()),
            ("failed.checkConn", self.check_conn_fail.get()),
            ("failed.es", self.es_fail.get()),
            ("response.success", self.success.get()),
            ("response.bad", self.bad_response.get()),
            ("response.duplicate", self.duplicate.get()),
            ("response.badargument", self.bad_argument.get()),
            ("response.bulkrejection", self.bulk_rejection.get()),
            ("response.other", self.other_response.get()),
            ("rebinds", self.rebinds.get()),
        ]
    }

    /// 🧹 Zero the whole board. The counters are resettable by contract —
    /// stats pollers read-then-reset and we don't get a vote.
    pub fn reset_all(&self) {
        self.submitted.reset();
        self.http_fail.reset();
        self.http_req_fail.reset();
        self.check_conn_fail.reset();
        self.es_fail.reset();
        self.success.reset();
        self.bad_response.reset();
        self.duplicate.reset();
        self.bad_argument.reset();
        self.bulk_rejection.reset();
        self.other_response.reset();
        self.rebinds.reset();
    }

    /// 🍽️ Render the scoreboard as a table fit for a terminal and a tired
    /// operator. Right-aligned numbers, because we are not animals.
    pub fn render_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new(format!("counter ({STATS_ORIGIN})")),
                Cell::new("value").set_alignment(CellAlignment::Right),
            ]);
        for (name, value) in self.snapshot() {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(value).set_alignment(CellAlignment::Right),
            ]);
        }
        table
    }
}
