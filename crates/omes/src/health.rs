//! 🩺 Health probing and failover — "Hello? Is this cluster on?"
//!
//! Before a multi-server action posts anywhere, it asks the current server
//! the cheapest question in the API: `GET _cat/health`. Any answer at all —
//! even a grumpy 5xx — proves the wire works, and the wire is all we're
//! testing here. No answer means we move one server to the right and ask
//! again, wrapping around the whole list exactly once.
//!
//! 🧠 Knowledge graph:
//! - **Round robin**: the server index lives on the worker and survives
//!   between calls — failover is sticky, not per-request amnesia
//! - **Every miss** bumps `failed.checkConn`
//! - **A full wrap with no answers** → [`Suspended`]: the host backs off and
//!   calls the resume path, which lands right back here
//!
//! 🦆 (the duck knocked on all three doors. nobody home. the duck is
//! suspended now. it's in the stats.)

use anyhow::Result;
use tracing::{debug, warn};

use crate::app_config::ActionConfig;
use crate::stats::Stats;
use crate::transport::{Sessions, Suspended, apply_auth};
use crate::url::health_url;

/// 🩺 Probe servers starting at `*server_index`, advancing on every failure.
///
/// Success leaves the index pointing at the server that answered. Total
/// failure leaves it where it started (a full wrap is a no-op modulo the
/// server count) and returns [`Suspended`].
pub(crate) async fn check_conn(
    cfg: &ActionConfig,
    sessions: &Sessions,
    base_urls: &[String],
    server_index: &mut usize,
    stats: &Stats,
) -> Result<()> {
    for attempt in 0..base_urls.len() {
        let server = &base_urls[*server_index];
        let url = health_url(server);
        let request = apply_auth(sessions.health.get(&url), cfg);
        match request.send().await {
            Ok(_) => {
                debug!(server, attempt, "health check completed with success");
                return Ok(());
            }
            Err(err) => {
                debug!(server, attempt, %err, "health check failed");
                stats.check_conn_fail.inc();
                *server_index = (*server_index + 1) % base_urls.len();
            }
        }
    }

    warn!(
        attempts = base_urls.len(),
        "health check failed on every configured server"
    );
    Err(Suspended::new("health check failed on every configured server").into())
}
