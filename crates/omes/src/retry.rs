//! 🔁 Retry reinjection — failed bulk items get a second life as messages.
//!
//! 🎬 *[a 429 lands. somewhere, a document that did nothing wrong is told
//! to go home. this module is the part where it gets back in line.]*
//!
//! When `retryfailures` is on, each response item of a failed bulk reply is
//! rebuilt into a synthetic log message and enqueued into a named retry
//! ruleset — a host-side processing queue whose filters decide, per message,
//! whether to resubmit, divert, or drop. We don't decide here. We package.
//!
//! 🧠 Knowledge graph:
//! - **[`flatten_bulk_op`]**: `{"index":{…fields…}}` → top-level fields plus
//!   `writeoperation`, first writer wins — request metadata is flattened
//!   before the reply item, so the request's operation name sticks
//! - **[`RetryMessage`]**: raw text (the source doc's `message` field, or the
//!   whole source line), the parsed source under the root tree (`!`), and the
//!   flattened request+reply metadata under the local tree (`.omes`)
//! - **[`RulesetRegistry`]**: name → bounded channel sender. Resolution
//!   happens at config-check time; a missing ruleset is a warning, not an
//!   error — messages are still built, they just have nowhere to go
//! - **Backpressure**: enqueue awaits on a bounded channel — full-delay flow
//!   control, the shipper slows down rather than ballooning memory
//!
//! 🦆 (the duck asked what happens to a message with no ruleset.
//! we told it the truth. the duck needed a minute.)

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use serde_json::Value;
use tracing::{debug, warn};

/// 📛 Input name stamped on every synthetic retry message.
pub const INPUT_NAME: &str = "omelasticsearch";

/// 🏷️ Tag stamped on every synthetic retry message.
pub const TAG: &str = "omes";

/// 🚦 Flow-control class of a synthetic message — how much the pipeline may
/// delay the producer to get it enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// never delay the producer
    NoDelay,
    /// delay a little if the queue is tight
    LightDelay,
    /// delay as long as it takes — retry traffic must not be dropped silently
    FullDelay,
}

/// 🔁 One failed (or walked) bulk item, repackaged as a log message.
///
/// The retry ruleset's filters read `.omes` — `writeoperation`, `status`,
/// `error.type` — to decide the item's fate. The original document rides
/// under the root tree so a resubmit template can reproduce it.
#[derive(Debug, Clone)]
pub struct RetryMessage {
    /// 📄 raw message text: the source document's `message` field when it has
    /// one, otherwise the entire source line
    pub raw: String,
    /// 🌳 the parsed source document, attached under the root variable `!`
    pub source: Value,
    /// 📎 flattened request+reply metadata, attached as the local variable `.omes`
    pub omes: Value,
    pub flow_control: FlowControl,
    pub input_name: &'static str,
    pub tag: &'static str,
}

impl RetryMessage {
    /// 🏗️ Build a message from one source line and its prepared `.omes` tree.
    ///
    /// The source line must parse as JSON — it came out of our own submitted
    /// body, so a parse failure means the pairing walked off the rails and
    /// the caller counts it as a bad response instead of enqueuing garbage.
    pub(crate) fn build(source_line: &str, omes: serde_json::Map<String, Value>) -> Result<Self> {
        let source: Value = serde_json::from_str(source_line).with_context(|| {
            format!(
                "could not parse original request document back into JSON [{source_line}]"
            )
        })?;
        let raw = source
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            // no `message` field → the whole document is the raw text
            .unwrap_or_else(|| source_line.to_owned());
        Ok(RetryMessage {
            raw,
            source,
            omes: Value::Object(omes),
            flow_control: FlowControl::FullDelay,
            input_name: INPUT_NAME,
            tag: TAG,
        })
    }
}

/// 🔄 Lift a bulk-op envelope into a flat metadata object.
///
/// Input shape: `{"someoperation":{"field1":…,"field2":…}}`. Output: the
/// operation name lands under `writeoperation`, the inner fields land at the
/// top level. Existing keys are never overwritten — call this with the
/// request metadata first and the reply item second, and the request's
/// operation plus any shared fields take precedence.
pub(crate) fn flatten_bulk_op(input: &Value, out: &mut serde_json::Map<String, Value>) {
    let envelope = input.as_object();
    if !out.contains_key("writeoperation") {
        let optype = envelope
            .and_then(|o| o.keys().next())
            .map(String::as_str)
            .unwrap_or("unknown");
        out.insert("writeoperation".into(), Value::String(optype.to_owned()));
    }
    if let Some(inner) = envelope
        .and_then(|o| o.values().next())
        .and_then(Value::as_object)
    {
        for (key, value) in inner {
            if !out.contains_key(key) {
                out.insert(key.clone(), value.clone());
            }
        }
    }
}

/// 🎟️ A resolved retry ruleset — a name and the channel that feeds it.
#[derive(Debug, Clone)]
pub struct RetryRuleset {
    name: String,
    tx: Sender<RetryMessage>,
}

impl RetryRuleset {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 📬 Enqueue one message, waiting for room (full-delay flow control).
    /// A closed ruleset logs and drops — the host tore down its consumer,
    /// there is nobody left to apologize to.
    pub(crate) async fn enqueue(&self, msg: RetryMessage) {
        if self.tx.send(msg).await.is_err() {
            warn!(ruleset = %self.name, "retry ruleset channel is closed; dropping message");
        }
    }
}

/// 📚 The host's ruleset directory: names on the outside, bounded channels on
/// the inside. Populate it before config check; resolution is by exact name.
#[derive(Debug, Default)]
pub struct RulesetRegistry {
    rulesets: HashMap<String, Sender<RetryMessage>>,
}

impl RulesetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📬 Register a ruleset and get the consuming end back. The capacity is
    /// the backpressure knob: small queue, honest latency.
    pub fn register(&mut self, name: impl Into<String>, capacity: usize) -> Receiver<RetryMessage> {
        let (tx, rx) = async_channel::bounded(capacity);
        self.rulesets.insert(name.into(), tx);
        rx
    }

    /// 🔎 Resolve a name into a usable handle. `None` is not an error —
    /// the caller warns once at config time and carries on without retry.
    pub fn resolve(&self, name: &str) -> Option<RetryRuleset> {
        match self.rulesets.get(name) {
            Some(tx) => Some(RetryRuleset {
                name: name.to_owned(),
                tx: tx.clone(),
            }),
            None => {
                debug!(ruleset = name, "ruleset not present in registry");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_the_envelope_gets_flattened() {
        let input = json!({"create": {"_index": "logs", "_id": "abc", "status": 409}});
        let mut out = serde_json::Map::new();
        flatten_bulk_op(&input, &mut out);
        assert_eq!(out["writeoperation"], "create");
        assert_eq!(out["_index"], "logs");
        assert_eq!(out["status"], 409);
    }

    #[test]
    fn the_one_where_the_first_writer_keeps_the_pen() {
        // 🧪 request metadata first, reply second: writeoperation and shared
        // keys stick with the request; reply-only keys still come through.
        let request_meta = json!({"index": {"_index": "logs"}});
        let reply_item = json!({"create": {"_index": "other", "status": 429,
                                           "error": {"type": "es_rejected_execution_exception"}}});
        let mut out = serde_json::Map::new();
        flatten_bulk_op(&request_meta, &mut out);
        flatten_bulk_op(&reply_item, &mut out);
        assert_eq!(out["writeoperation"], "index", "request op wins");
        assert_eq!(out["_index"], "logs", "request index wins");
        assert_eq!(out["status"], 429, "reply-only fields come through");
        assert_eq!(out["error"]["type"], "es_rejected_execution_exception");
    }

    #[test]
    fn the_one_where_an_empty_envelope_is_an_unknown_operation() {
        let mut out = serde_json::Map::new();
        flatten_bulk_op(&json!({}), &mut out);
        assert_eq!(out["writeoperation"], "unknown");
    }

    #[test]
    fn the_one_where_the_raw_text_comes_from_the_message_field() {
        let mut omes = serde_json::Map::new();
        omes.insert("status".into(), json!(429));
        let msg = RetryMessage::build(r#"{"message":"hello world","level":"warn"}"#, omes)
            .expect("valid source line");
        assert_eq!(msg.raw, "hello world");
        assert_eq!(msg.source["level"], "warn");
        assert_eq!(msg.omes["status"], 429);
        assert_eq!(msg.input_name, "omelasticsearch");
        assert_eq!(msg.tag, "omes");
        assert_eq!(msg.flow_control, FlowControl::FullDelay);
    }

    #[test]
    fn the_one_where_a_messageless_document_rides_whole() {
        let msg = RetryMessage::build(r#"{"m":1}"#, serde_json::Map::new()).unwrap();
        assert_eq!(msg.raw, r#"{"m":1}"#);
    }

    #[test]
    fn the_one_where_a_garbage_source_line_is_refused() {
        assert!(RetryMessage::build("not json at all", serde_json::Map::new()).is_err());
    }

    #[tokio::test]
    async fn the_one_where_the_registry_knows_its_rulesets() {
        let mut registry = RulesetRegistry::new();
        let rx = registry.register("retry-es", 4);

        assert!(registry.resolve("nope").is_none());
        let ruleset = registry.resolve("retry-es").expect("registered name resolves");
        assert_eq!(ruleset.name(), "retry-es");

        let msg = RetryMessage::build(r#"{"m":1}"#, serde_json::Map::new()).unwrap();
        ruleset.enqueue(msg).await;
        let received = rx.recv().await.expect("message arrives");
        assert_eq!(received.raw, r#"{"m":1}"#);
    }
}
