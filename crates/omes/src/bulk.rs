//! 📡 Bulk batch assembly — formatting documents for the bulk API's peculiar tastes 🚀
//!
//! 🎬 COLD OPEN — INT. ELASTICSEARCH CLUSTER — BULK ENDPOINT — HIGH NOON
//!
//! The bulk API has rules. Written rules, technically, but scattered across a
//! documentation page with three contradictory examples in the same paragraph.
//!
//! Rule 1: Two lines per document. Action metadata, then document source. Always.
//! Rule 2: Newline-delimited. Not comma-separated. Not XML. NEWLINES.
//! Rule 3: Every line is terminated by `\n`, including the last one. It MATTERS.
//!          Engineers have lost weekends to this. One of them still flinches
//!          when they see `\n`.
//!
//! 🧠 Knowledge graph:
//! - **Meta line**: `{"index":{…}}` or `{"create":{…}}` — emitted by
//!   [`render_meta`] through a tiny typed emitter that tracks whether any
//!   field was written and picks the closing token deterministically
//! - **Source line**: the rendered payload verbatim, `\n`-terminated
//! - **[`Batch`]**: the append-only scratch buffer one worker fills between
//!   transaction boundaries; byte length + member count, nothing else
//! - **[`estimate_record_size`]**: conservative upper bound used by the
//!   submitter to flush *before* a record would cross the byte cap
//!
//! ⚠️ Key values are emitted verbatim — the host's template layer owns
//! escaping. An index name with a `"` in it is a host bug, not a wire bug
//! we can fix down here.

use crate::event::{Keys, WriteOperation};

// 🧱 wire tokens. The spacing inside these strings is load-bearing: it is the
// exact shape peers and test fixtures have seen on the wire for years.
const HDR_INDEX: &str = "{\"index\":{";
const HDR_CREATE: &str = "{\"create\":{";

// first-field spellings (nothing before them to close)
const FIRST_INDEX: &str = "\"_index\": \"";
const FIRST_PARENT: &str = "\"_parent\":\"";
const FIRST_PIPELINE: &str = "\"pipeline\":\"";
const FIRST_ID: &str = "\"_id\":\"";

// continuation spellings (each closes the previous value's quote first)
const JOIN_TYPE: &str = "\",\"_type\":\"";
const JOIN_PARENT: &str = "\",\"_parent\":\"";
const JOIN_PIPELINE: &str = "\",\"pipeline\":\"";
const JOIN_ID: &str = "\", \"_id\":\"";

// closers: quoted form when a field left an open string, bare form otherwise
const END_QUOTED: &str = "\"}}\n";
const END_BARE: &str = " }}\n";

/// 🖋️ The meta-line emitter. Fields go in, one valid action-meta line comes
/// out, and the open-quote bookkeeping lives in exactly one place instead of
/// being a flag threaded through forty lines of appends.
struct MetaEmitter {
    buf: String,
    any_field: bool,
}

impl MetaEmitter {
    fn new(op: WriteOperation) -> Self {
        let mut buf = String::with_capacity(96);
        buf.push_str(match op {
            WriteOperation::Index => HDR_INDEX,
            WriteOperation::Create => HDR_CREATE,
        });
        MetaEmitter {
            buf,
            any_field: false,
        }
    }

    /// ➕ Emit one `"key":"value` fragment. The first field uses its bare
    /// spelling; every later field uses the joined spelling that closes the
    /// previous value's quote. The final close is [`MetaEmitter::finish`]'s job.
    fn field(&mut self, first: &str, joined: &str, value: &str) {
        self.buf
            .push_str(if self.any_field { joined } else { first });
        self.buf.push_str(value);
        self.any_field = true;
    }

    /// 🏁 Close the meta object and terminate the line. Quoted close when a
    /// field left a string open, bare close for the empty `{"create":{ }}` case.
    fn finish(mut self) -> String {
        self.buf
            .push_str(if self.any_field { END_QUOTED } else { END_BARE });
        self.buf
    }
}

/// 🖋️ Render one action-meta line (`\n` included) for the given operation and
/// resolved keys.
///
/// Field order on the wire: `_index` (+ `_type`), `_parent`, `pipeline`,
/// `_id`. An `index` op always carries a type next to its `_index` — `_doc`
/// standing in when the resolved type is unset or empty, mirroring the
/// `/idx/_doc` default in the URL composer. A `create` op only names a type
/// that was actually configured.
pub fn render_meta(
    op: WriteOperation,
    keys: &Keys<'_>,
    skip_pipeline_if_empty: bool,
) -> String {
    let mut meta = MetaEmitter::new(op);
    if let Some(index) = keys.index {
        meta.field(FIRST_INDEX, FIRST_INDEX, index);
        match keys.doc_type {
            Some(t) if !t.is_empty() => meta.field(JOIN_TYPE, JOIN_TYPE, t),
            _ if op == WriteOperation::Index => meta.field(JOIN_TYPE, JOIN_TYPE, "_doc"),
            _ => {}
        }
    }
    if let Some(parent) = keys.parent {
        meta.field(FIRST_PARENT, JOIN_PARENT, parent);
    }
    if let Some(pipeline) = keys.effective_pipeline(skip_pipeline_if_empty) {
        meta.field(FIRST_PIPELINE, JOIN_PIPELINE, pipeline);
    }
    if let Some(id) = keys.bulk_id {
        meta.field(FIRST_ID, JOIN_ID, id);
    }
    meta.finish()
}

/// 🧮 Upper bound on the bytes one record adds to a batch: meta header, every
/// key that would be emitted (joined spellings — the longer ones), the meta
/// closer, the payload, and its line terminator.
///
/// The submitter compares `batch.len() + estimate` against the byte cap and
/// flushes first when the sum would cross it. Overestimating by a few bytes
/// costs an early flush; underestimating would cost a 413 — so we round up.
pub fn estimate_record_size(
    op: WriteOperation,
    keys: &Keys<'_>,
    skip_pipeline_if_empty: bool,
    payload_len: usize,
) -> usize {
    let mut size = END_QUOTED.len() + 1; // meta closer + payload's '\n'
    size += match op {
        WriteOperation::Index => HDR_INDEX.len(),
        WriteOperation::Create => HDR_CREATE.len(),
    };
    size += payload_len;
    if let Some(index) = keys.index {
        size += FIRST_INDEX.len() + index.len();
        match keys.doc_type {
            Some(t) if !t.is_empty() => size += JOIN_TYPE.len() + t.len(),
            _ if op == WriteOperation::Index => size += JOIN_TYPE.len() + 4, // "_doc"
            _ => {}
        }
    }
    if let Some(parent) = keys.parent {
        size += JOIN_PARENT.len() + parent.len();
    }
    if let Some(pipeline) = keys.effective_pipeline(skip_pipeline_if_empty) {
        size += JOIN_PIPELINE.len() + pipeline.len();
    }
    if let Some(id) = keys.bulk_id {
        size += JOIN_ID.len() + id.len();
    }
    size
}

/// 📦 The in-flight batch: an append-only NDJSON buffer plus a member count.
///
/// Owned by one worker, reset at transaction start and after every flush.
/// Every append contributes exactly two `\n`-terminated lines — the invariant
/// the reply analyzer leans on when it pairs response items back to requests.
#[derive(Debug)]
pub struct Batch {
    buf: String,
    count: usize,
}

impl Default for Batch {
    fn default() -> Self {
        Batch::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Batch {
            buf: String::with_capacity(1024),
            count: 0,
        }
    }

    /// 🧹 Empty the buffer, keep the allocation. Flushing is frequent;
    /// reallocating a fresh buffer every transaction would be rude to malloc.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.count = 0;
    }

    /// ➕ Append one request pair: a pre-rendered meta line (terminator
    /// included) and the payload, which gets its `\n` here.
    pub fn append(&mut self, meta_line: &str, payload: &str) {
        self.buf.push_str(meta_line);
        self.buf.push_str(payload);
        self.buf.push('\n');
        self.count += 1;
    }

    /// 📏 Current byte size of the assembled body.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// 🔢 Number of request pairs in the batch.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// 📄 The wire body as assembled so far.
    pub fn body(&self) -> &str {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn keys(
        index: Option<&'static str>,
        doc_type: Option<&'static str>,
        parent: Option<&'static str>,
        bulk_id: Option<&'static str>,
        pipeline: Option<&'static str>,
    ) -> Keys<'static> {
        Keys {
            index,
            doc_type,
            parent,
            bulk_id,
            pipeline,
        }
    }

    #[test]
    fn the_one_where_a_plain_index_meta_matches_the_wire_byte_for_byte() {
        // 🧪 the canonical shape: index op, index name, no explicit type.
        // The spacing after `"_index":` is part of the format. Do not "fix" it.
        let k = keys(Some("logs"), None, None, None, None);
        assert_eq!(
            render_meta(WriteOperation::Index, &k, false),
            "{\"index\":{\"_index\": \"logs\",\"_type\":\"_doc\"}}\n"
        );
    }

    #[test]
    fn the_one_where_create_with_a_bulk_id_keeps_its_comma_space() {
        // 🧪 note the `, "_id"` — comma, space, key. Wire archaeology, preserved.
        // Also: no `_type` — a create op only names a type that was configured.
        let k = keys(Some("logs"), None, None, Some("abc"), None);
        assert_eq!(
            render_meta(WriteOperation::Create, &k, false),
            "{\"create\":{\"_index\": \"logs\", \"_id\":\"abc\"}}\n"
        );
    }

    #[test]
    fn the_one_where_a_bare_create_closes_without_a_quote() {
        // 🧪 no fields at all → the bare closer, space included
        let k = keys(None, None, None, None, None);
        assert_eq!(
            render_meta(WriteOperation::Create, &k, false),
            "{\"create\":{ }}\n"
        );
    }

    #[test]
    fn the_one_where_a_parent_only_create_is_still_valid_json() {
        // 🧪 first-field spelling: no dangling `",` before `_parent` when
        // nothing came before it. The emitter picks the right opener.
        let k = keys(None, None, Some("p1"), None, None);
        let meta = render_meta(WriteOperation::Create, &k, false);
        assert_eq!(meta, "{\"create\":{\"_parent\":\"p1\"}}\n");
        let parsed: Value =
            serde_json::from_str(meta.trim_end()).expect("meta line must parse as JSON");
        assert_eq!(parsed["create"]["_parent"], "p1");
    }

    #[test]
    fn the_one_where_every_meta_variant_parses_as_json() {
        // 🧪 sweep the field combinations; each rendered line must be one
        // JSON object whose single top-level key names the operation.
        let combos = [
            keys(Some("idx"), Some("t"), None, None, None),
            keys(Some("idx"), Some(""), Some("par"), None, None),
            keys(Some("idx"), None, Some("par"), Some("id-1"), Some("pipe")),
            keys(None, None, None, Some("id-2"), None),
            keys(None, None, Some("par"), None, Some("pipe")),
        ];
        for op in [WriteOperation::Index, WriteOperation::Create] {
            for k in &combos {
                let meta = render_meta(op, k, false);
                let parsed: Value = serde_json::from_str(meta.trim_end())
                    .unwrap_or_else(|e| panic!("unparseable meta {meta:?}: {e}"));
                let obj = parsed.as_object().expect("meta is an object");
                assert_eq!(obj.len(), 1, "exactly one operation key");
                assert!(obj.contains_key(op.as_str()));
            }
        }
    }

    #[test]
    fn the_one_where_the_pipeline_skip_flag_reaches_the_meta_line() {
        let k = keys(Some("idx"), Some("t"), None, None, Some(""));
        let skipped = render_meta(WriteOperation::Index, &k, true);
        assert!(!skipped.contains("pipeline"), "empty pipeline must be skipped");
        let kept = render_meta(WriteOperation::Index, &k, false);
        assert!(kept.contains("\"pipeline\":\""), "flag off keeps the empty name");
    }

    #[test]
    fn the_one_where_a_batch_of_three_is_exactly_six_lines() {
        // 🧪 the NDJSON shape invariant: N records → 2N newline-terminated
        // lines; odd lines are action metas, even lines are documents.
        let mut batch = Batch::new();
        let k = keys(Some("logs"), None, None, None, None);
        for n in 1..=3 {
            let meta = render_meta(WriteOperation::Index, &k, false);
            batch.append(&meta, &format!("{{\"m\":{n}}}"));
        }
        assert_eq!(batch.count(), 3);

        let body = batch.body();
        assert!(body.ends_with('\n'));
        let lines: Vec<&str> = body.trim_end_matches('\n').split('\n').collect();
        assert_eq!(lines.len(), 6);
        for (i, line) in lines.iter().enumerate() {
            let parsed: Value = serde_json::from_str(line).expect("each line parses");
            if i % 2 == 0 {
                let obj = parsed.as_object().unwrap();
                assert_eq!(obj.len(), 1);
                assert!(obj.contains_key("index") || obj.contains_key("create"));
            }
        }
    }

    #[test]
    fn the_one_where_the_estimate_never_undershoots() {
        // 🧪 the whole point of the estimate: batch.len() + estimate must be
        // a safe comparison against the byte cap. Undershoot = 413 = pager.
        let combos = [
            keys(Some("logs"), None, None, None, None),
            keys(Some("logs"), Some("events"), Some("par"), Some("abc"), Some("pipe")),
            keys(None, None, None, None, None),
            keys(None, None, Some("par"), Some("id"), None),
        ];
        for op in [WriteOperation::Index, WriteOperation::Create] {
            for k in &combos {
                let payload = "{\"msg\":\"hello world\"}";
                let estimate = estimate_record_size(op, k, false, payload.len());
                let mut batch = Batch::new();
                batch.append(&render_meta(op, k, false), payload);
                assert!(
                    estimate >= batch.len(),
                    "estimate {estimate} < actual {} for {op:?}/{k:?}",
                    batch.len()
                );
            }
        }
    }

    #[test]
    fn the_one_where_reset_keeps_nothing_but_the_allocation() {
        let mut batch = Batch::new();
        batch.append("{\"index\":{ }}\n", "{}");
        assert!(!batch.is_empty());
        batch.reset();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.body(), "");
    }
}
