//! Ghostshift command-line client.
//!
//! Records schema change sets, plans and runs zero-downtime migrations between
//! versions, and retires versions no longer in use.

mod commands;
mod config;
mod formatter;

use clap::Parser;
use config::Args;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ghostshift=info,ghostshift_core=info,ghostshift_postgres=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, command) = Args::parse().into_config();
    tracing::debug!(
        state_path = %config.state_path.display(),
        batch_size = config.batch_size,
        batch_delay_ms = config.batch_delay_ms,
        use_upsert = config.use_upsert,
        "configuration loaded"
    );

    let cancel = CancellationToken::new();
    watch_ctrl_c(cancel.clone());

    let formatter = formatter::create_formatter(config.format);
    match commands::run(command, &config, &*formatter, &cancel) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Cancel `token` on the first Ctrl+C. A running backfill stops between batches.
fn watch_ctrl_c(token: CancellationToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install ctrl+c handler");
                return;
            }
        };
        if let Err(e) = runtime.block_on(tokio::signal::ctrl_c()) {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            return;
        }
        tracing::info!("received ctrl+c, cancelling after the current batch");
        token.cancel();
    });
}
