//! 🧭 URL composition — where "localhost" becomes an address the HTTP client
//! will actually dial.
//!
//! 🧠 Knowledge graph:
//! - **Base URLs**: canonicalized once at action setup — scheme, port,
//!   trailing slash. After that, every composer here just concatenates.
//! - **Doc URLs**: `<base><index>/<type-or-_doc>` plus query params in the
//!   fixed order pipeline → timeout → parent.
//! - **Separator law**: the first query param gets `?`, everything after
//!   gets `&`. One `?` per URL. This is not negotiable. RFC 3986 is watching.
//!
//! 🦆 (the duck asked why `_doc`. since 7.x the cluster rejects made-up types.
//! the duck accepted this and moved on. be like the duck.)

use crate::event::Keys;

const SCHEME_HTTP: &str = "http://";
const SCHEME_HTTPS: &str = "https://";

/// 🩺 Liveness probe path, GET against a base URL.
pub(crate) const HEALTH_PATH: &str = "_cat/health";

/// 📦 Bulk ingestion path, POST against a base URL.
pub(crate) const BULK_PATH: &str = "_bulk";

/// 🧭 Canonicalize one configured server string into `scheme://host:port/`.
///
/// Accepts all the shapes operators actually write: `h`, `h:9200`,
/// `http://h`, `https://h:9243`, any of those with a trailing `/`. Missing
/// scheme → `https://` when the action wants TLS, `http://` otherwise.
/// Missing port (no `:` after the scheme) → the configured default port.
/// Always ends in exactly one `/` so path composition is pure concatenation.
pub(crate) fn base_url(server: &str, default_port: u16, use_https: bool) -> String {
    // 🧹 trailing-slash hygiene first — `https://host//my-index` is one slash
    // of difference and infinite suffering of difference.
    let server = server.trim_end_matches('/');

    let lower = server.to_ascii_lowercase();
    let has_scheme = lower.starts_with(SCHEME_HTTP) || lower.starts_with(SCHEME_HTTPS);

    let mut url = String::with_capacity(server.len() + 16);
    if !has_scheme {
        url.push_str(if use_https { SCHEME_HTTPS } else { SCHEME_HTTP });
    }
    url.push_str(server);

    // 🔢 the host part is whatever follows the scheme; a ':' in there means
    // a port was given and we keep our default to ourselves.
    let host = if has_scheme {
        &server[server.find("//").map(|i| i + 2).unwrap_or(0)..]
    } else {
        server
    };
    if !host.contains(':') {
        url.push(':');
        url.push_str(&default_port.to_string());
    }

    url.push('/');
    url
}

/// ➕ Tiny separator ratchet: hands out `?` once, then `&` forever.
struct QuerySep(char);

impl QuerySep {
    fn new() -> Self {
        QuerySep('?')
    }
    fn next(&mut self) -> char {
        let sep = self.0;
        self.0 = '&';
        sep
    }
}

/// 📡 Compose the POST URL for one request.
///
/// Bulk mode: `<base>_bulk[?timeout=…]` — routing lives in the meta lines,
/// not the URL, so index/type/parent stay home.
///
/// Single-document mode: `<base><index>/<type>` with `_doc` standing in for
/// an unset/empty type, then `pipeline`, `timeout`, `parent` as query params
/// in that order.
pub(crate) fn post_url(
    base: &str,
    keys: &Keys<'_>,
    timeout: Option<&str>,
    skip_pipeline_if_empty: bool,
    bulkmode: bool,
) -> String {
    let mut url = String::with_capacity(base.len() + 48);
    url.push_str(base);
    let mut sep = QuerySep::new();

    if bulkmode {
        url.push_str(BULK_PATH);
    } else {
        if let Some(index) = keys.index {
            url.push_str(index);
            url.push('/');
            url.push_str(match keys.doc_type {
                Some(t) if !t.is_empty() => t,
                // since 7.x the API wants /idx/_doc when no real type exists
                _ => "_doc",
            });
        }
        if let Some(pipeline) = keys.effective_pipeline(skip_pipeline_if_empty) {
            url.push(sep.next());
            url.push_str("pipeline=");
            url.push_str(pipeline);
        }
    }

    if let Some(timeout) = timeout {
        url.push(sep.next());
        url.push_str("timeout=");
        url.push_str(timeout);
    }

    // 👨‍👧 parent routing is a per-document concern — bulk meta carries it there
    if !bulkmode {
        if let Some(parent) = keys.parent {
            url.push(sep.next());
            url.push_str("parent=");
            url.push_str(parent);
        }
    }

    url
}

/// 🩺 `<base>_cat/health` — the cheapest question you can ask a cluster.
pub(crate) fn health_url(base: &str) -> String {
    format!("{base}{HEALTH_PATH}")
}
