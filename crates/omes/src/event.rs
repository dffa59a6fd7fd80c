//! 📦 Event records — the building blocks of omes
//!
//! ---
//!
//! 🎬 COLD OPEN — INT. LOG PIPELINE — 3:47 AM
//!
//! 🌩️  Somewhere upstream, a template engine has just finished rendering a log
//! event into a JSON payload. It is proud of its work. It should be. The
//! payload is about to be stapled to an action-meta line, zipped into an
//! NDJSON batch, and flung at a cluster that may or may not be awake.
//!
//! ✅ This module defines the handoff shape for that moment: one [`Record`]
//! per message, carrying the payload and whichever routing keys the host
//! rendered dynamically. No positional arrays. No implicit slot ordering.
//! Every field has a name, because implicit ordering is how 3am happens.
//!
//! 🦆
//!
//! ⚠️  NOTE: Records don't validate payloads. Whatever the template rendered
//! is what the cluster receives. Garbage in, garbage indexed.

use serde::Deserialize;

use crate::app_config::ActionConfig;

/// 🖋️ Which bulk operation this sink performs per document.
///
/// Only `index` and `create` exist on the wire. Update/upsert are a different
/// lifestyle (read-modify-write) that an append-only log shipper does not live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    /// 📥 `index` — upsert-by-id semantics, last write wins
    #[default]
    Index,
    /// 🆕 `create` — insert-only, 409 on a duplicate `_id`
    Create,
}

impl WriteOperation {
    /// The operation key as it appears on the wire and in replies.
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOperation::Index => "index",
            WriteOperation::Create => "create",
        }
    }
}

/// 🎯 One message, ready to ship — the payload plus the per-message routing
/// keys the host rendered for it.
///
/// A field here is only *consulted* when the matching `dyn*` flag is set in
/// the action config; otherwise the static config value applies. The host
/// fills what it rendered and leaves the rest `None`. See [`Keys::resolve`]
/// for the merge.
///
/// Fields are `Option` because this codebase knows that hope is fragile and
/// you should never assume you have a bulk id until you've unwrapped it and
/// cried about it first.
#[derive(Debug, Clone, Default)]
pub struct Record {
    /// 📄 The rendered source document — shipped verbatim as the second NDJSON line.
    pub payload: String,
    /// 📡 Per-message index name (used when `dynsearchindex` is on)
    pub index: Option<String>,
    /// 🏷️ Per-message type name (used when `dynsearchtype` is on)
    pub doc_type: Option<String>,
    /// 👨‍👧 Per-message parent (used when `dynparent` is on)
    pub parent: Option<String>,
    /// 🔑 Per-message `_id` (used when `dynbulkid` is on)
    pub bulk_id: Option<String>,
    /// 🚰 Per-message ingest pipeline (used when `dynpipelinename` is on)
    pub pipeline: Option<String>,
}

impl Record {
    /// 🚀 The common case: a payload and nothing else. Static config keys rule.
    pub fn from_payload(payload: impl Into<String>) -> Self {
        Record {
            payload: payload.into(),
            ..Record::default()
        }
    }
}

/// 🔑 The resolved routing keys for one message — dynamic where configured,
/// static everywhere else. Borrowed views; nothing is cloned to decide a URL.
#[derive(Debug, Clone, Copy)]
pub struct Keys<'a> {
    pub index: Option<&'a str>,
    pub doc_type: Option<&'a str>,
    pub parent: Option<&'a str>,
    pub bulk_id: Option<&'a str>,
    pub pipeline: Option<&'a str>,
}

impl<'a> Keys<'a> {
    /// 🔀 Merge static config values with the record's dynamic ones.
    ///
    /// Per key: if the `dyn*` flag is set, read the record (a missing record
    /// field then resolves to `None` — the host promised a value and didn't
    /// deliver, we don't invent one). Flag off → static config value.
    pub fn resolve(cfg: &'a ActionConfig, record: Option<&'a Record>) -> Keys<'a> {
        // 🧮 tiny closure: pick dynamic-or-static per flag. Runs five times.
        let pick = |dynamic: bool, rec: Option<&'a String>, stat: &'a Option<String>| {
            if dynamic {
                rec.map(String::as_str)
            } else {
                stat.as_deref()
            }
        };
        Keys {
            index: pick(
                cfg.dynsearchindex,
                record.and_then(|r| r.index.as_ref()),
                &cfg.searchindex,
            ),
            doc_type: pick(
                cfg.dynsearchtype,
                record.and_then(|r| r.doc_type.as_ref()),
                &cfg.searchtype,
            ),
            parent: pick(
                cfg.dynparent,
                record.and_then(|r| r.parent.as_ref()),
                &cfg.parent,
            ),
            bulk_id: pick(
                cfg.dynbulkid,
                record.and_then(|r| r.bulk_id.as_ref()),
                &cfg.bulkid,
            ),
            pipeline: pick(
                cfg.dynpipelinename,
                record.and_then(|r| r.pipeline.as_ref()),
                &cfg.pipelinename,
            ),
        }
    }

    /// 🚰 The pipeline name, honoring `skippipelineifempty` — an empty rendered
    /// name is treated as "no pipeline" when the skip flag is on.
    pub fn effective_pipeline(&self, skip_if_empty: bool) -> Option<&'a str> {
        match self.pipeline {
            Some(p) if skip_if_empty && p.is_empty() => None,
            other => other,
        }
    }
}
