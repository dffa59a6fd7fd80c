//! 🔌 Transport — the two HTTP sessions every worker carries, and the rebind
//! discipline that keeps long-lived connections from getting weird.
//!
//! 🧠 Knowledge graph:
//! - **Two clients per worker**: one for health probes (short timeout), one
//!   for posting (the indexing timeout, which may be "none"). They never
//!   share a pool, so a wedged bulk upload can't starve the prober
//! - **Both carry**: the fixed JSON content type, the TLS material, and the
//!   accept-invalid knobs. Credentials ride per-request via [`apply_auth`]
//! - **Rebind**: once the op counter *exceeds* the interval, the post client
//!   is rebuilt — new pool, new TCP, `rebinds` counter bumped. When the
//!   counter *equals* the interval, this one request asks the server to
//!   close the connection after use (`Connection: close`)
//! - **[`Suspended`]**: the typed "stop sending, back off, re-probe later"
//!   error. Transport failures wear it; hosts downcast for it
//!
//! 🦆 (the duck asked why anyone force-closes perfectly good connections.
//! we told it about load balancers that pin a worker to one backend for six
//! days. the duck closes its connections now.)

use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Certificate, Client, Identity, RequestBuilder};

use crate::app_config::ActionConfig;
use crate::stats::Stats;

/// 📜 Every request carries this. Clusters answer 406 to anything creative.
pub(crate) const CONTENT_JSON: &str = "application/json; charset=utf-8";

/// 🛑 The worker cannot reach the service and wants the host to stop feeding
/// it, wait, and run the resume path (which re-probes) before retrying.
///
/// Travels inside `anyhow::Error`; detect it with
/// `err.downcast_ref::<Suspended>()`.
#[derive(Debug)]
pub struct Suspended {
    reason: String,
}

impl Suspended {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Suspended {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Suspended {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "suspending ourselves due to server failure: {}", self.reason)
    }
}

impl std::error::Error for Suspended {}

/// 🏗️ Build one client for this action: default headers, timeout, TLS.
fn build_client(cfg: &ActionConfig, timeout_ms: u64) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_JSON));

    let mut builder = Client::builder().default_headers(headers);
    // timeout 0 = unbounded — bulk uploads to a busy cluster take what they take
    if timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }
    if cfg.allowunsignedcerts {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if cfg.skipverifyhost {
        builder = builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(ca_path) = &cfg.tls.cacert {
        let pem = std::fs::read(ca_path)
            .with_context(|| format!("cannot read tls.cacert file {ca_path}"))?;
        let cert = Certificate::from_pem(&pem)
            .with_context(|| format!("tls.cacert file {ca_path} is not a usable PEM"))?;
        builder = builder.add_root_certificate(cert);
    }
    match (&cfg.tls.mycert, &cfg.tls.myprivkey) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path)
                .with_context(|| format!("cannot read tls.mycert file {cert_path}"))?;
            let key_pem = std::fs::read(key_path)
                .with_context(|| format!("cannot read tls.myprivkey file {key_path}"))?;
            let identity = Identity::from_pkcs8_pem(&cert_pem, &key_pem)
                .context("client certificate and key do not make a usable identity")?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => bail!("tls.mycert and tls.myprivkey must be configured together"),
    }

    builder.build().context(
        "💀 The HTTP client refused to be born. Probably a missing TLS cert or a \
         cursed system OpenSSL. Either way: tragic.",
    )
}

/// 🔒 Attach basic-auth credentials when the action has them.
pub(crate) fn apply_auth(request: RequestBuilder, cfg: &ActionConfig) -> RequestBuilder {
    match &cfg.uid {
        Some(uid) => request.basic_auth(uid, cfg.pwd.as_deref()),
        None => request,
    }
}

/// 🔌 One worker's pair of HTTP sessions plus the rebind op counter.
#[derive(Debug)]
pub(crate) struct Sessions {
    /// 🩺 short-fuse client for `_cat/health`
    pub(crate) health: Client,
    /// 📡 the posting client — rebuilt wholesale on rebind
    pub(crate) post: Client,
    /// 🔢 operations since the last rebind
    n_operations: i64,
}

impl Sessions {
    pub(crate) fn new(cfg: &ActionConfig) -> Result<Self> {
        Ok(Sessions {
            health: build_client(cfg, cfg.healthchecktimeout)?,
            post: build_client(cfg, cfg.indextimeout)?,
            n_operations: 0,
        })
    }

    /// 🔄 Run the rebind bookkeeping for the request about to go out.
    ///
    /// Counter past the interval → rebuild the post client (dropping its
    /// pool closes the old connections), reset the counter, count a rebind.
    /// Returns whether *this* request must forbid connection reuse — true
    /// exactly when the counter sits on the interval itself, so the
    /// connection is closed right after the request that maxes it out.
    pub(crate) fn prepare_rebind(&mut self, cfg: &ActionConfig, stats: &Stats) -> Result<bool> {
        if cfg.rebindinterval > -1 && self.n_operations > cfg.rebindinterval {
            self.post = build_client(cfg, cfg.indextimeout)?;
            self.n_operations = 0;
            stats.rebinds.inc();
        }
        Ok(cfg.rebindinterval > -1 && self.n_operations == cfg.rebindinterval)
    }

    /// ➕ One more operation survived transport. Only counted while the
    /// rebind feature is on — the counter is meaningless otherwise.
    pub(crate) fn note_operation(&mut self, cfg: &ActionConfig) {
        if cfg.rebindinterval > -1 {
            self.n_operations += 1;
        }
    }
}
