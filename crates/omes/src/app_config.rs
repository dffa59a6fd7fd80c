//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the
//! fridge. In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Knowledge graph: three layers live here —
//! - [`ActionConfig`]: everything one output action knows about itself
//!   (servers, routing keys and their dyn flags, bulk knobs, TLS material,
//!   error-file and retry behavior). Parameter names are wire-stable.
//! - [`RuntimeConfig`]: how the shipping pipeline runs (queue, parallelism,
//!   transaction size).
//! - [`InputConfig`]: where the CLI reads events from.
//!
//! Validation ([`ActionConfig::validate`]) runs at config-check time and
//! fails loudly with the *name* of the offending parameter pair. A config
//! error at startup costs a minute. The same error discovered at 2am costs
//! a postmortem doc with seventeen comments.

use std::path::Path;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::event::WriteOperation;

// ============================================================
// 🔧 ActionConfig — the knobs of one output action
// ============================================================

/// 🔒 TLS material for talking to clusters that take themselves seriously.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// 📜 CA bundle (PEM) that signed the cluster's certs
    #[serde(default)]
    pub cacert: Option<String>,
    /// 🪪 our client certificate (PEM)
    #[serde(default)]
    pub mycert: Option<String>,
    /// 🔑 the private key matching `mycert` (PEM)
    #[serde(default)]
    pub myprivkey: Option<String>,
}

/// 🚦 How hard the retry reinjector may lean on the retry ruleset.
#[derive(Debug, Deserialize, Clone)]
pub struct RatelimitConfig {
    /// ⏱️ window length in seconds; 0 disables limiting
    #[serde(default = "default_ratelimit_interval")]
    pub interval: u32,
    /// 🎫 admits per window
    #[serde(default = "default_ratelimit_burst")]
    pub burst: u32,
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        RatelimitConfig {
            interval: default_ratelimit_interval(),
            burst: default_ratelimit_burst(),
        }
    }
}

// 🔢 600s/20000: one window per stats interval, a burst big enough for a bad
// batch, small enough to strangle a feedback loop before it strangles us.
fn default_ratelimit_interval() -> u32 {
    600
}
fn default_ratelimit_burst() -> u32 {
    20000
}

/// 🏷️ The cluster's major version, when the operator cares to say.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EsVersionConfig {
    /// 0 = unknown; ≥8 skips the legacy index/type defaults
    #[serde(default)]
    pub major: u32,
}

/// 📦 One configured output action — endpoints, routing, batching, error
/// handling. Many of these may exist per process; each gets its own workers.
#[derive(Debug, Deserialize, Clone)]
pub struct ActionConfig {
    /// 📡 server base URLs, tried round-robin; empty → localhost with a warning
    #[serde(default)]
    pub server: Vec<String>,
    /// 🔢 port appended to any server that didn't bring its own
    #[serde(default = "default_serverport")]
    pub serverport: u16,
    /// 🩺 health probe budget, milliseconds
    #[serde(default = "default_healthchecktimeout")]
    pub healthchecktimeout: u64,
    /// ⏱️ per-POST budget, milliseconds; 0 = wait forever (bulk bodies are meaty)
    #[serde(default)]
    pub indextimeout: u64,
    /// 🔒 basic-auth user. The bouncer checks the list.
    #[serde(default)]
    pub uid: Option<String>,
    /// 🔒 basic-auth password. "password123" is not a password. It is a confession.
    #[serde(default)]
    pub pwd: Option<String>,
    /// 📦 target index — a literal name, or (with `dynsearchindex`) the name
    /// of the template the host renders per message
    #[serde(default)]
    pub searchindex: Option<String>,
    /// 🏷️ target type; empty/absent becomes `_doc` on the wire
    #[serde(default)]
    pub searchtype: Option<String>,
    /// 🚰 ingest pipeline name (literal or template, see `dynpipelinename`)
    #[serde(default)]
    pub pipelinename: Option<String>,
    #[serde(default)]
    pub dynpipelinename: bool,
    /// 🚰 drop the pipeline parameter entirely when its rendered name is empty
    #[serde(default)]
    pub skippipelineifempty: bool,
    /// 👨‍👧 parent routing value (literal or template, see `dynparent`)
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub dynsearchindex: bool,
    #[serde(default)]
    pub dynsearchtype: bool,
    #[serde(default)]
    pub dynparent: bool,
    /// 📦 batch records into `_bulk` posts instead of one POST per document
    #[serde(default)]
    pub bulkmode: bool,
    /// 📏 flush the batch before a record would push it past this many bytes
    #[serde(default = "default_maxbytes")]
    pub maxbytes: usize,
    #[serde(default)]
    pub usehttps: bool,
    /// ⏱️ the cluster-side `timeout=` query value (e.g. "1m") — a string the
    /// cluster parses, not a number we do
    #[serde(default)]
    pub timeout: Option<String>,
    /// 🗃️ where rejected items get recorded; absent = no error file
    #[serde(default)]
    pub errorfile: Option<String>,
    #[serde(default)]
    pub erroronly: bool,
    #[serde(default)]
    pub interleaved: bool,
    /// 📝 name of the host template that renders the payload
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub dynbulkid: bool,
    /// 🔑 document `_id` (literal or template, see `dynbulkid`)
    #[serde(default)]
    pub bulkid: Option<String>,
    /// 🔓 accept certs no CA vouched for. Lab flag. Please keep it in the lab.
    #[serde(default)]
    pub allowunsignedcerts: bool,
    /// 🔓 skip hostname verification. Same lab. Same plea.
    #[serde(default)]
    pub skipverifyhost: bool,
    #[serde(default)]
    pub tls: TlsConfig,
    /// 🖋️ `index` or `create` — see [`WriteOperation`]
    #[serde(default)]
    pub writeoperation: WriteOperation,
    /// 🔁 reinject failed items as synthetic messages instead of writing
    /// them to the error file
    #[serde(default)]
    pub retryfailures: bool,
    #[serde(default)]
    pub ratelimit: RatelimitConfig,
    /// 🎟️ name of the ruleset that receives reinjected messages
    #[serde(default)]
    pub retryruleset: Option<String>,
    /// 🔌 force a fresh connection after this many operations; −1 disables
    #[serde(default = "default_rebindinterval")]
    pub rebindinterval: i64,
    #[serde(default)]
    pub esversion: EsVersionConfig,
    /// 🦴 accepted for compatibility with ancient configs; does nothing
    #[serde(default)]
    pub asyncrepl: Option<bool>,
}

fn default_serverport() -> u16 {
    9200
}
fn default_healthchecktimeout() -> u64 {
    3500
}
// 📏 100 MiB — the bulk-size ceiling clusters ship with by default
fn default_maxbytes() -> usize {
    100 * 1024 * 1024
}
fn default_rebindinterval() -> i64 {
    -1
}

impl Default for ActionConfig {
    fn default() -> Self {
        ActionConfig {
            server: Vec::new(),
            serverport: default_serverport(),
            healthchecktimeout: default_healthchecktimeout(),
            indextimeout: 0,
            uid: None,
            pwd: None,
            searchindex: None,
            searchtype: None,
            pipelinename: None,
            dynpipelinename: false,
            skippipelineifempty: false,
            parent: None,
            dynsearchindex: false,
            dynsearchtype: false,
            dynparent: false,
            bulkmode: false,
            maxbytes: default_maxbytes(),
            usehttps: false,
            timeout: None,
            errorfile: None,
            erroronly: false,
            interleaved: false,
            template: None,
            dynbulkid: false,
            bulkid: None,
            allowunsignedcerts: false,
            skipverifyhost: false,
            tls: TlsConfig::default(),
            writeoperation: WriteOperation::default(),
            retryfailures: false,
            ratelimit: RatelimitConfig::default(),
            retryruleset: None,
            rebindinterval: default_rebindinterval(),
            esversion: EsVersionConfig::default(),
            asyncrepl: None,
        }
    }
}

impl ActionConfig {
    /// 🕵️ Config-check: catch the mistakes that would otherwise surface as
    /// 2am mysteries, and fill in the legacy defaults where they apply.
    ///
    /// Rules enforced here:
    /// - every `dyn*` flag needs its name slot filled (the slot carries the
    ///   template name in that setup)
    /// - a password without a user is a riddle we refuse to ship
    /// - clusters below major version 8 get the legacy `system`/`events`
    ///   index/type defaults, and `create` there requires a bulk id
    /// - TLS file paths must be readable *now*, not at first handshake
    /// - no servers → localhost, with a warning so nobody is surprised later
    pub fn validate(&mut self) -> Result<()> {
        if self.asyncrepl.is_some() {
            warn!("'asyncrepl' parameter is deprecated and ignored");
        }
        if self.pwd.is_some() && self.uid.is_none() {
            bail!("password is provided, but no uid - action definition invalid");
        }

        // 🔗 dyn flag + empty name slot = a template reference pointing at nothing
        let pairs: [(&str, bool, &Option<String>); 5] = [
            ("searchindex", self.dynsearchindex, &self.searchindex),
            ("searchtype", self.dynsearchtype, &self.searchtype),
            ("parent", self.dynparent, &self.parent),
            ("bulkid", self.dynbulkid, &self.bulkid),
            ("pipelinename", self.dynpipelinename, &self.pipelinename),
        ];
        for (name, dynamic, slot) in pairs {
            if dynamic && slot.is_none() {
                bail!(
                    "requested dynamic {name}, but no name for {name} template given \
                     - action definition invalid"
                );
            }
        }

        if self.esversion.major < 8 {
            // 🦴 pre-8 legacy defaults, kept for configs that predate us all
            if self.searchindex.is_none() {
                self.searchindex = Some("system".into());
            }
            if self.searchtype.is_none() {
                self.searchtype = Some("events".into());
            }
            if self.writeoperation != WriteOperation::Index && self.bulkid.is_none() {
                bail!(
                    "writeoperation '{}' requires bulkid",
                    self.writeoperation.as_str()
                );
            }
        }

        for (name, path) in [
            ("tls.cacert", &self.tls.cacert),
            ("tls.mycert", &self.tls.mycert),
            ("tls.myprivkey", &self.tls.myprivkey),
        ] {
            if let Some(path) = path {
                std::fs::File::open(path)
                    .with_context(|| format!("'{name}' file {path} couldn't be accessed"))?;
            }
        }

        if self.server.is_empty() {
            warn!("no servers specified, using localhost");
            self.server.push("localhost".into());
        }

        Ok(())
    }
}

// ============================================================
// ⚙️ RuntimeConfig / InputConfig — how the pipeline runs
// ============================================================

/// ⚙️ Pipeline knobs: queue depth, shipper count, transaction size.
///
/// 🎯 Defaults are conservative enough to not immediately explode on first
/// run, ambitious enough to ship actual logs. 🦆
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 📬 bounded channel capacity between the source and the shippers
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 🧵 how many shipper workers run in parallel
    #[serde(default = "default_shipper_parallelism", alias = "num_shippers")]
    pub shipper_parallelism: usize,
    /// 📦 how many records one transaction wraps before committing
    #[serde(default = "default_transaction_size")]
    pub transaction_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            queue_capacity: default_queue_capacity(),
            shipper_parallelism: default_shipper_parallelism(),
            transaction_size: default_transaction_size(),
        }
    }
}

// 🔢 64 records in flight: enough to keep shippers fed, small enough that
// backpressure reaches the source before memory does.
fn default_queue_capacity() -> usize {
    64
}
// 🧵 one shipper lane by default: fewer moving parts, fewer ways to invent
// folklore during debugging.
fn default_shipper_parallelism() -> usize {
    1
}
// 📦 1024 records per transaction — batches stay chunky without any single
// commit holding the door open forever.
fn default_transaction_size() -> usize {
    1024
}

/// 📂 Where the CLI reads events from: an NDJSON file, one rendered payload
/// per line. A `.gz` suffix means what you hope it means.
#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    pub file_name: String,
}

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub action: ActionConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// absent when omes is embedded and the host feeds records itself
    #[serde(default)]
    pub input: Option<InputConfig>,
}

/// 🚀 Load the config — env vars (OMES_*) as the base layer, an optional
/// TOML file merged on top. TOML wins on conflicts.
///
/// 💀 Returns an error if the config is unparseable. Check the message —
/// it's contextual, informative, and written with love. Or despair.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("OMES_"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment \
             variables (OMES_*). The file exists in our hearts, but apparently \
             its contents disagree with the schema.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables \
                 (OMES_*). No file was provided — this one's all on the \
                 environment. Classic."
            .to_string(),
    };

    config.extract().context(context_msg)
}
