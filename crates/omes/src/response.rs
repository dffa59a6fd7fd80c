//! 🔬 Reply analysis — where the cluster's verdict gets read, item by item.
//!
//! 🎬 COLD OPEN — INT. WORKER TASK — MICROSECONDS AFTER THE POST
//!
//! A reply body arrives. `{"errors":true,…}`. Somewhere inside, an `items`
//! array holds one verdict per document, in the exact order we sent them.
//! The only way to know *which* document a verdict belongs to is to walk the
//! reply and the submitted body in lockstep — two newline-terminated lines
//! per item on our side, one array entry per item on theirs.
//!
//! 🧠 Knowledge graph:
//! - **[`PairCursor`]**: tokenizes the submitted NDJSON body once, up front —
//!   each step yields (meta line, source line, raw pair). Runs out of lines
//!   before the reply runs out of items? The pair is simply absent; the item
//!   is classified as a bad response instead of sinking the whole walk
//! - **[`classify`]**: the per-item outcome table. Exhaustive: every
//!   (status, operation, error.type) combination lands in exactly one bucket
//! - **Counters always, reinjection when asked**: walking increments the
//!   `response.*` family whether or not `retryfailures` is set; only the
//!   synthetic-message enqueue is gated on the flag
//! - **Error file**: with retry off, a reply carrying failures produces one
//!   error-file record in the configured render mode
//!
//! ⚠️ A reply that doesn't parse, or parses into the wrong shape, is a
//! *reply-level* failure (`failed.es`) — per-item buckets only apply once we
//! have items to walk.

use anyhow::{Result, bail};
use memchr::memchr;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::action::Action;
use crate::error_file::{ErrorMode, ItemView, render};
use crate::event::WriteOperation;
use crate::retry::{RetryMessage, flatten_bulk_op};

/// 📎 One originating request pair, sliced out of the submitted body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequestPair<'a> {
    /// the action-meta line (no trailing newline)
    pub meta: &'a str,
    /// the source-document line (no trailing newline)
    pub source: &'a str,
    /// both lines verbatim, trailing newlines included — what error records carry
    pub raw: &'a str,
}

/// ✂️ Walks a submitted bulk body two `\n`-terminated lines at a time.
///
/// memchr does the scanning; we do the bookkeeping. A body that ends
/// mid-pair (truncated, or simply shorter than the reply claims) yields
/// `None` from then on — the caller treats the request as absent.
pub(crate) struct PairCursor<'a> {
    body: &'a str,
    pos: usize,
}

impl<'a> PairCursor<'a> {
    pub(crate) fn new(body: &'a str) -> Self {
        PairCursor { body, pos: 0 }
    }
}

impl<'a> Iterator for PairCursor<'a> {
    type Item = RequestPair<'a>;

    fn next(&mut self) -> Option<RequestPair<'a>> {
        let rest = &self.body[self.pos..];
        let bytes = rest.as_bytes();
        let first_nl = memchr(b'\n', bytes)?;
        let second_nl = first_nl + 1 + memchr(b'\n', &bytes[first_nl + 1..])?;
        let pair = RequestPair {
            meta: &rest[..first_nl],
            source: &rest[first_nl + 1..second_nl],
            raw: &rest[..=second_nl],
        };
        self.pos += second_nl + 1;
        Some(pair)
    }
}

/// 🏷️ Where one reply item landed on the outcome table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Duplicate,
    BadArgument,
    BulkRejection,
    OtherResponse,
    BadResponse,
}

/// 🔎 Pull the per-item result object out of a reply item: the value under
/// `create`, else under `index`. Anything else is not a bulk verdict.
pub(crate) fn item_result(item: &Value) -> Option<&Value> {
    item.get("create")
        .filter(|v| v.is_object())
        .or_else(|| item.get("index").filter(|v| v.is_object()))
}

/// 🔢 The item's HTTP status, when the reply actually carries an integer one.
pub(crate) fn item_status(result: &Value) -> Option<i64> {
    result.get("status").and_then(Value::as_i64)
}

/// ❓ Bad item: status missing, non-integer, or outside [0, 299].
pub(crate) fn is_bad_status(status: Option<i64>) -> bool {
    !matches!(status, Some(s) if (0..=299).contains(&s))
}

/// ⚖️ The per-item outcome table.
///
/// `operation` comes from the flattened metadata (`writeoperation` — request
/// first, reply as fallback). "Effectively create" covers two cases: the
/// reply literally says `create`, or it says `index` while this action is
/// configured for index writes — which keeps a 409 on a duplicate id
/// meaningful for plain index operations too.
pub(crate) fn classify(
    status: i64,
    omes: &Map<String, Value>,
    configured_op: WriteOperation,
) -> Outcome {
    let optype = omes
        .get("writeoperation")
        .and_then(Value::as_str)
        .filter(|o| *o != "unknown");
    let Some(optype) = optype else {
        return Outcome::BadResponse;
    };
    let effectively_create = optype == "create"
        || (optype == "index" && configured_op == WriteOperation::Index);

    match status {
        200 | 201 => Outcome::Success,
        409 if effectively_create => Outcome::Duplicate,
        s if s == 400 || s < 200 => Outcome::BadArgument,
        s => {
            let typed_error = omes
                .get("error")
                .and_then(|e| e.get("type"))
                .is_some();
            if typed_error {
                if s == 429 {
                    Outcome::BulkRejection
                } else {
                    Outcome::OtherResponse
                }
            } else {
                Outcome::BadResponse
            }
        }
    }
}

/// 📊 Route one outcome to its counter.
fn count_outcome(action: &Action, outcome: Outcome) {
    let stats = &action.stats;
    match outcome {
        Outcome::Success => stats.success.inc(),
        Outcome::Duplicate => stats.duplicate.inc(),
        Outcome::BadArgument => stats.bad_argument.inc(),
        Outcome::BulkRejection => stats.bulk_rejection.inc(),
        Outcome::OtherResponse => stats.other_response.inc(),
        Outcome::BadResponse => stats.bad_response.inc(),
    }
}

/// 🔬 Analyze one reply. Entry point for the submitter.
///
/// A body that won't parse as JSON is a hard reply failure. Everything past
/// that point is handled locally — item failures are counted, recorded,
/// and/or reinjected, and the batch is considered dealt with.
pub(crate) async fn analyze_reply(
    action: &Action,
    last_url: &str,
    request_body: Option<&str>,
    reply_text: &str,
) -> Result<()> {
    let root: Value = match serde_json::from_str(reply_text) {
        Ok(root) => root,
        Err(err) => {
            action.stats.es_fail.inc();
            bail!("could not parse JSON result ({err}); reply was: {reply_text}");
        }
    };

    if action.cfg.bulkmode {
        analyze_bulk(action, last_url, request_body, &root).await
    } else {
        analyze_single(action, last_url, request_body, &root);
        Ok(())
    }
}

/// 🔎 Single-document replies: a top-level `status` field means the cluster
/// rejected the document. Count it, record it, move on.
fn analyze_single(action: &Action, last_url: &str, request_body: Option<&str>, root: &Value) {
    if root.get("status").is_some() {
        debug!(reply = %root, "single-document indexing failed");
        data_failure(action, last_url, request_body, root);
    }
}

/// 🗃️ Reply-level data failure: bump `failed.es` and drop a default-mode
/// record with everything we know.
fn data_failure(action: &Action, last_url: &str, request_body: Option<&str>, root: &Value) {
    action.stats.es_fail.inc();
    if action.error_sink.is_configured() {
        let record = render(
            ErrorMode::Default,
            last_url,
            request_body.unwrap_or(""),
            root,
            &[],
        );
        action.error_sink.write_record(&record);
    }
}

/// 🔬 The bulk walk: reply items and request pairs, in lockstep.
async fn analyze_bulk(
    action: &Action,
    last_url: &str,
    request_body: Option<&str>,
    root: &Value,
) -> Result<()> {
    let Some(items) = root.get("items").and_then(Value::as_array) else {
        warn!(reply = %root, "bulkmode insert did not return an items array");
        data_failure(action, last_url, request_body, root);
        return Ok(());
    };

    let errors = root
        .get("errors")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    // 🎉 the happy fast path: nothing failed, nobody asked for reinjection —
    // credit the whole batch and go home early.
    if !errors && !action.cfg.retryfailures {
        action.stats.success.add(items.len() as u64);
        return Ok(());
    }

    let mut pairs = PairCursor::new(request_body.unwrap_or(""));
    let retrying = action.cfg.retryfailures;
    let mut views: Vec<ItemView> = Vec::new();
    let mut any_bad = false;

    debug!(items = items.len(), "walking bulk reply");
    for (i, item) in items.iter().enumerate() {
        let Some(result) = item_result(item) else {
            warn!(item = i, "cannot obtain result object for reply item");
            data_failure(action, last_url, request_body, root);
            return Ok(());
        };

        let status = item_status(result);
        let bad = is_bad_status(status);
        any_bad |= bad;
        let pair = pairs.next();

        if !retrying && action.error_sink.is_configured() {
            views.push(ItemView {
                request: pair.map(|p| p.raw.to_owned()),
                reply: result.to_string(),
                bad,
            });
        }

        // 📎 request metadata back into JSON — without it there is neither a
        // trustworthy operation name nor a reinjectable message.
        let meta: Option<Value> = match pair {
            Some(p) => match serde_json::from_str(p.meta) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    warn!(item = i, %err, "could not parse original request metadata");
                    None
                }
            },
            None => {
                debug!(item = i, "couldn't get post request for reply item");
                None
            }
        };
        let Some(meta) = meta else {
            action.stats.bad_response.inc();
            continue;
        };

        let mut omes = Map::new();
        flatten_bulk_op(&meta, &mut omes);

        // 🔁 with retry on, the message is built *before* classification so a
        // garbage source line counts as a bad response, not a half-classified one
        let retry_msg = if retrying {
            let pair = pair.expect("meta parsed implies pair exists");
            match RetryMessage::build(pair.source, Map::new()) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    warn!(item = i, %err, "could not rebuild message from request");
                    action.stats.bad_response.inc();
                    continue;
                }
            }
        } else {
            None
        };

        flatten_bulk_op(item, &mut omes);
        let outcome = classify(status.unwrap_or(0), &omes, action.cfg.writeoperation);
        count_outcome(action, outcome);

        if let Some(mut msg) = retry_msg {
            msg.omes = Value::Object(omes);
            reinject(action, msg).await;
        }
    }

    if !retrying && any_bad {
        action.stats.es_fail.inc();
        if action.error_sink.is_configured() {
            let mode = ErrorMode::from_flags(action.cfg.erroronly, action.cfg.interleaved);
            let record = render(mode, last_url, request_body.unwrap_or(""), root, &views);
            action.error_sink.write_record(&record);
        }
    }

    Ok(())
}

/// 📬 Hand one synthetic message to the retry ruleset, rate limiter willing.
/// No resolved ruleset → the message was built for nothing and knows it.
async fn reinject(action: &Action, msg: RetryMessage) {
    let Some(limiter) = &action.ratelimiter else {
        return;
    };
    if !limiter.admit() {
        return;
    }
    match &action.retry_ruleset {
        Some(ruleset) => ruleset.enqueue(msg).await,
        None => {
            debug!("no retry ruleset resolved; constructed message will never execute");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ✂️ ——— pair cursor ———

    #[test]
    fn the_one_where_pairs_come_back_in_lockstep_order() {
        let body = "{\"index\":{ }}\n{\"m\":1}\n{\"create\":{ }}\n{\"m\":2}\n";
        let mut cursor = PairCursor::new(body);

        let first = cursor.next().unwrap();
        assert_eq!(first.meta, "{\"index\":{ }}");
        assert_eq!(first.source, "{\"m\":1}");
        assert_eq!(first.raw, "{\"index\":{ }}\n{\"m\":1}\n");

        let second = cursor.next().unwrap();
        assert_eq!(second.source, "{\"m\":2}");
        assert!(cursor.next().is_none(), "two pairs, not three");
    }

    #[test]
    fn the_one_where_a_truncated_body_stops_yielding() {
        // 🧪 a meta line with no source newline is not a pair — absent, not a panic
        let mut cursor = PairCursor::new("{\"index\":{ }}\n{\"m\":1}");
        assert!(cursor.next().is_none());

        let mut cursor = PairCursor::new("");
        assert!(cursor.next().is_none());
    }

    // ⚖️ ——— the outcome table ———

    fn omes_for(op: &str, error_type: Option<&str>) -> Map<String, Value> {
        let mut omes = Map::new();
        omes.insert("writeoperation".into(), json!(op));
        if let Some(t) = error_type {
            omes.insert("error".into(), json!({ "type": t }));
        }
        omes
    }

    #[test]
    fn the_one_where_two_hundreds_are_simply_fine() {
        let omes = omes_for("index", None);
        assert_eq!(classify(200, &omes, WriteOperation::Index), Outcome::Success);
        assert_eq!(classify(201, &omes, WriteOperation::Create), Outcome::Success);
    }

    #[test]
    fn the_one_where_a_409_on_create_is_a_duplicate() {
        let omes = omes_for("create", None);
        assert_eq!(
            classify(409, &omes, WriteOperation::Create),
            Outcome::Duplicate
        );
    }

    #[test]
    fn the_one_where_a_409_on_a_plain_index_op_still_counts_as_duplicate() {
        // 🧪 quirk, preserved on purpose: reply says `index`, config says
        // index → "effectively create", so the duplicate bucket applies.
        let omes = omes_for("index", None);
        assert_eq!(
            classify(409, &omes, WriteOperation::Index),
            Outcome::Duplicate
        );
        // …but an `index` reply under a create config is NOT effectively create
        assert_ne!(
            classify(409, &omes, WriteOperation::Create),
            Outcome::Duplicate
        );
    }

    #[test]
    fn the_one_where_400_and_sub_200_mean_bad_argument() {
        let omes = omes_for("index", None);
        assert_eq!(
            classify(400, &omes, WriteOperation::Index),
            Outcome::BadArgument
        );
        assert_eq!(
            classify(199, &omes, WriteOperation::Index),
            Outcome::BadArgument
        );
        // status 0 is what a missing status collapses to — same bucket
        assert_eq!(
            classify(0, &omes, WriteOperation::Index),
            Outcome::BadArgument
        );
    }

    #[test]
    fn the_one_where_429_with_a_typed_error_is_a_bulk_rejection() {
        let omes = omes_for("index", Some("es_rejected_execution_exception"));
        assert_eq!(
            classify(429, &omes, WriteOperation::Index),
            Outcome::BulkRejection
        );
    }

    #[test]
    fn the_one_where_other_typed_errors_fall_in_the_other_bucket() {
        let omes = omes_for("create", Some("mapper_parsing_exception"));
        assert_eq!(
            classify(503, &omes, WriteOperation::Create),
            Outcome::OtherResponse
        );
    }

    #[test]
    fn the_one_where_an_untyped_failure_is_just_bad() {
        let omes = omes_for("index", None);
        assert_eq!(
            classify(503, &omes, WriteOperation::Index),
            Outcome::BadResponse
        );
    }

    #[test]
    fn the_one_where_an_unknown_operation_is_bad_no_matter_the_status() {
        let omes = omes_for("unknown", None);
        assert_eq!(classify(200, &omes, WriteOperation::Index), Outcome::BadResponse);
        let empty = Map::new();
        assert_eq!(classify(200, &empty, WriteOperation::Index), Outcome::BadResponse);
    }

    // 🔎 ——— item helpers ———

    #[test]
    fn the_one_where_create_is_checked_before_index() {
        let item = json!({"create": {"status": 409}});
        assert_eq!(item_result(&item).unwrap()["status"], 409);
        let item = json!({"index": {"status": 200}});
        assert_eq!(item_result(&item).unwrap()["status"], 200);
        let item = json!({"delete": {"status": 200}});
        assert!(item_result(&item).is_none());
    }

    #[test]
    fn the_one_where_bad_status_means_outside_the_2xx_neighborhood() {
        assert!(!is_bad_status(Some(200)));
        assert!(!is_bad_status(Some(0)));
        assert!(!is_bad_status(Some(299)));
        assert!(is_bad_status(Some(300)));
        assert!(is_bad_status(Some(-1)));
        assert!(is_bad_status(None));
    }
}
