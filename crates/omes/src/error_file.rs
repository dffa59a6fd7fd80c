//! 🗃️ The error file — where rejected documents go to be understood.
//!
//! 🎬 *[INT. OPS ROOM — morning after. someone opens a file with `jq`.
//! every line is a complete story: what we sent, what came back.]*
//!
//! When a bulk reply carries failures and retry reinjection is off, the
//! evidence gets appended here: one JSON object per line, rendered in one of
//! four shapes depending on how much the operator wants to relive the night.
//!
//! 🧠 Knowledge graph:
//! - **Default**: `{url, postdata, reply}` — the whole request body and the
//!   whole parsed reply. Maximal on purpose: post-mortems want everything,
//!   and the subset that failed is rarely the subset that explains why
//! - **erroronly**: `{url, request: […], reply: […]}` — parallel arrays over
//!   failed items only
//! - **interleaved**: `{url, response: [{request, reply}, …]}` — every item,
//!   request and verdict side by side
//! - **erroronly + interleaved**: interleaved, failed items only
//! - **File discipline**: lazy open, append-only, mode 0660; one record =
//!   one line; writes serialized by the action's mutex; HUP closes the
//!   handle and the next write reopens it (log rotation without restarts)
//!
//! ⚠️ Write errors are logged and swallowed. The error file is a diagnostic
//! best effort — failing the batch because the *error log* is unwritable
//! would be a bad trade at 3am.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::{Value, json};
use tracing::{debug, error};

/// 🎛️ Which of the four record shapes the operator asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorMode {
    Default,
    ErrorOnly,
    Interleaved,
    ErrorOnlyInterleaved,
}

impl ErrorMode {
    pub(crate) fn from_flags(error_only: bool, interleaved: bool) -> Self {
        match (error_only, interleaved) {
            (false, false) => ErrorMode::Default,
            (true, false) => ErrorMode::ErrorOnly,
            (false, true) => ErrorMode::Interleaved,
            (true, true) => ErrorMode::ErrorOnlyInterleaved,
        }
    }
}

/// 📎 One walked reply item, prepared for rendering: the originating request
/// pair (absent when the submitted body ran out of lines first), the reply
/// verdict serialized compact, and whether the item failed.
#[derive(Debug)]
pub(crate) struct ItemView {
    pub request: Option<String>,
    pub reply: String,
    pub bad: bool,
}

impl ItemView {
    /// the request string as written to the file — an absent pair renders
    /// as empty rather than sinking the whole record
    fn request_str(&self) -> &str {
        self.request.as_deref().unwrap_or("")
    }
}

/// 🖋️ Render one error record in the requested shape.
pub(crate) fn render(
    mode: ErrorMode,
    url: &str,
    postdata: &str,
    reply_root: &Value,
    items: &[ItemView],
) -> Value {
    match mode {
        ErrorMode::Default => json!({
            "url": url,
            "postdata": postdata,
            "reply": reply_root,
        }),
        ErrorMode::ErrorOnly => {
            // 📇 parallel arrays, original order, failures only
            let requests: Vec<&str> = items
                .iter()
                .filter(|i| i.bad)
                .map(|i| i.request_str())
                .collect();
            let replies: Vec<&str> = items
                .iter()
                .filter(|i| i.bad)
                .map(|i| i.reply.as_str())
                .collect();
            json!({ "url": url, "request": requests, "reply": replies })
        }
        ErrorMode::Interleaved | ErrorMode::ErrorOnlyInterleaved => {
            let failed_only = mode == ErrorMode::ErrorOnlyInterleaved;
            let response: Vec<Value> = items
                .iter()
                .filter(|i| !failed_only || i.bad)
                .map(|i| json!({ "request": i.request_str(), "reply": i.reply }))
                .collect();
            json!({ "url": url, "response": response })
        }
    }
}

/// 🗃️ The append-only error file with its lazy handle.
///
/// Shared by every worker of one action; the mutex makes each record an
/// atomic line — concurrent workers never interleave bytes.
#[derive(Debug)]
pub(crate) struct ErrorSink {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl ErrorSink {
    pub(crate) fn new(path: Option<PathBuf>) -> Self {
        ErrorSink {
            path,
            file: Mutex::new(None),
        }
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.path.is_some()
    }

    /// 📝 Append one record as a single `\n`-terminated line.
    ///
    /// Lazy-opens the file on first use (append | create, mode 0660). Any
    /// I/O failure is logged and dropped; the batch was already handled.
    pub(crate) fn write_record(&self, record: &Value) {
        let Some(path) = &self.path else {
            debug!("no error file configured; dropping error record");
            return;
        };

        let mut guard = self.file.lock().expect("error file mutex poisoned");
        if guard.is_none() {
            match OpenOptions::new()
                .append(true)
                .create(true)
                .mode(0o660)
                .open(path)
            {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    error!(path = %path.display(), %err, "cannot open error file");
                    return;
                }
            }
        }

        let mut line = record.to_string();
        line.push('\n');
        if let Some(file) = guard.as_mut() {
            if let Err(err) = file.write_all(line.as_bytes()) {
                error!(path = %path.display(), %err, "error writing error file");
            }
        }
    }

    /// 🔄 HUP: drop the handle so the next record reopens the path.
    /// This is how log rotation works without restarting anything.
    pub(crate) fn hup(&self) {
        let mut guard = self.file.lock().expect("error file mutex poisoned");
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn three_items() -> Vec<ItemView> {
        vec![
            ItemView {
                request: Some("{\"index\":{ }}\n{\"m\":1}\n".into()),
                reply: "{\"status\":400}".into(),
                bad: true,
            },
            ItemView {
                request: Some("{\"index\":{ }}\n{\"m\":2}\n".into()),
                reply: "{\"status\":201}".into(),
                bad: false,
            },
            ItemView {
                request: Some("{\"index\":{ }}\n{\"m\":3}\n".into()),
                reply: "{\"status\":429}".into(),
                bad: true,
            },
        ]
    }

    #[test]
    fn the_one_where_flags_pick_the_mode() {
        assert_eq!(ErrorMode::from_flags(false, false), ErrorMode::Default);
        assert_eq!(ErrorMode::from_flags(true, false), ErrorMode::ErrorOnly);
        assert_eq!(ErrorMode::from_flags(false, true), ErrorMode::Interleaved);
        assert_eq!(ErrorMode::from_flags(true, true), ErrorMode::ErrorOnlyInterleaved);
    }

    #[test]
    fn the_one_where_the_default_record_keeps_everything() {
        // 🧪 default mode is the maximal diagnostic: full body, full reply
        let reply = json!({"errors": true, "items": []});
        let record = render(
            ErrorMode::Default,
            "http://h:9200/_bulk",
            "{\"index\":{ }}\n{\"m\":1}\n",
            &reply,
            &three_items(),
        );
        assert_eq!(record["url"], "http://h:9200/_bulk");
        assert_eq!(record["postdata"], "{\"index\":{ }}\n{\"m\":1}\n");
        assert_eq!(record["reply"], reply);
    }

    #[test]
    fn the_one_where_error_only_keeps_parallel_arrays_of_failures() {
        // 🧪 items 1 and 3 failed → both arrays length 2, original order
        let record = render(
            ErrorMode::ErrorOnly,
            "http://h:9200/_bulk",
            "",
            &json!({}),
            &three_items(),
        );
        let requests = record["request"].as_array().unwrap();
        let replies = record["reply"].as_array().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(replies.len(), 2);
        assert!(requests[0].as_str().unwrap().contains("{\"m\":1}"));
        assert!(requests[1].as_str().unwrap().contains("{\"m\":3}"));
        assert_eq!(replies[1], "{\"status\":429}");
    }

    #[test]
    fn the_one_where_interleaved_pairs_every_item() {
        let record = render(
            ErrorMode::Interleaved,
            "http://h:9200/_bulk",
            "",
            &json!({}),
            &three_items(),
        );
        let response = record["response"].as_array().unwrap();
        assert_eq!(response.len(), 3, "interleaved mode keeps all items");
        assert_eq!(response[1]["reply"], "{\"status\":201}");
    }

    #[test]
    fn the_one_where_both_flags_mean_interleaved_failures_only() {
        let record = render(
            ErrorMode::ErrorOnlyInterleaved,
            "http://h:9200/_bulk",
            "",
            &json!({}),
            &three_items(),
        );
        let response = record["response"].as_array().unwrap();
        assert_eq!(response.len(), 2);
        assert_eq!(response[0]["reply"], "{\"status\":400}");
        assert_eq!(response[1]["reply"], "{\"status\":429}");
    }

    #[test]
    fn the_one_where_an_absent_request_renders_as_empty() {
        // 🧪 the submitted body ran out of lines — the record still lands,
        // with an empty request string instead of a missing entry
        let items = vec![ItemView {
            request: None,
            reply: "{\"status\":500}".into(),
            bad: true,
        }];
        let record = render(ErrorMode::ErrorOnly, "u", "", &json!({}), &items);
        assert_eq!(record["request"][0], "");
    }

    #[test]
    fn the_one_where_records_land_as_single_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("es-errors.json");
        let sink = ErrorSink::new(Some(path.clone()));

        sink.write_record(&json!({"url": "u1", "postdata": "a\nb\n"}));
        sink.write_record(&json!({"url": "u2"}));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.trim_end().split('\n').collect();
        assert_eq!(lines.len(), 2, "one record per line, newlines inside stay escaped");
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["url"], "u1");
        assert_eq!(first["postdata"], "a\nb\n");
    }

    #[test]
    fn the_one_where_hup_closes_and_the_next_write_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("es-errors.json");
        let sink = ErrorSink::new(Some(path.clone()));

        sink.write_record(&json!({"n": 1}));
        sink.hup();
        // 🔄 rotated away? doesn't matter — append reopens the path fresh
        sink.write_record(&json!({"n": 2}));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim_end().split('\n').count(), 2);
    }

    #[test]
    fn the_one_where_no_path_means_no_panic() {
        let sink = ErrorSink::new(None);
        assert!(!sink.is_configured());
        sink.write_record(&json!({"into": "the void"}));
        sink.hup();
    }
}
