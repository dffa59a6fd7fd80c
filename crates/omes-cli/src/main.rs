//! 🚀 omes-cli — the front door, the bouncer, the maitre d' of omes.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config,
//! sets up logging, ships the events, and prints the scoreboard.
//! Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📡 Ship NDJSON log events into an Elasticsearch-compatible cluster.
#[derive(Debug, Parser)]
#[command(name = "omes", version, about)]
struct Args {
    /// Path to the TOML config (action + runtime + input sections).
    #[arg(short, long, default_value = "omes.toml")]
    config: PathBuf,

    /// Input file override — NDJSON, one rendered payload per line,
    /// `.gz` welcome. Wins over the config's [input] section.
    #[arg(short, long)]
    input: Option<String>,

    /// Print the statistics table even when everything went fine.
    #[arg(long)]
    stats: bool,
}

/// 🚀 main() — where it all begins. The genesis. The big bang.
/// The "I pressed Enter and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args
/// 3. Load config (the moment of truth)
/// 4. Ship the things (send it and pray 🙏)
/// 5. Handle errors (cry)
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 Set up tracing — because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // 🔒 Validate the config file exists before we get too emotionally attached
    let config_path = args
        .config
        .try_exists()
        .with_context(|| {
            format!(
                "💀 Configuration file may not exist, couldn't find it. Double check \
                 that it exists, or maybe it's a pwd/relative-path situation. Was \
                 checking here: '{}'",
                args.config.display()
            )
        })?
        .then_some(args.config.as_path());

    let mut app_config = omes::app_config::load_config(config_path).context(
        "💀 Couldn't load the config. Take a look at the file, make sure it's \
         correct, and that nothing obvious was forgotten.",
    )?;

    if let Some(input) = args.input {
        app_config.input = Some(omes::app_config::InputConfig { file_name: input });
    }

    // 🚀 SEND IT. No take-backs. This is not a drill.
    let result = omes::run(app_config).await;

    match result {
        Ok(stats) => {
            let failed = stats.http_fail.get() + stats.es_fail.get();
            if args.stats || failed > 0 {
                println!("{}", stats.render_table());
            }
            Ok(())
        }
        Err(err) => {
            // 💀 Error handling: the part where we find out what went wrong
            // and print it in a way that's helpful at 3am
            error!("💀 error: {}", err);
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                // 🕵️ sniff the cause like a truffle pig hunting for connection problems
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                    || cause_str.contains("server failure")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            // 📡 if it smells like a connection problem, it's probably a connection problem
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the cluster isn't reachable. Double-check that \
                     Elasticsearch is actually running and that the configured servers \
                     point at it. If you're using Docker, try `docker ps` to see what's \
                     up, or `docker compose up -d` to resurrect it. Even clusters need \
                     a nudge sometimes. ☕"
                );
            }

            // 🗑️ Exit with prejudice. Process exitus maximus.
            std::process::exit(1);
        }
    }
}
