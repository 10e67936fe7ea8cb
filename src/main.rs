use clap::Parser;
use pg_relay::{LogHandler, ReplicationOptions, Replicator, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-relay")]
#[command(about = "Streams PostgreSQL logical replication changes to stdout", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Drop the replication slot and publication, then exit")]
    teardown: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-relay v{}", env!("CARGO_PKG_VERSION"));

    let options = match ReplicationOptions::from_env() {
        Ok(options) => options,
        Err(e) => {
            error!("Failed to load options: {e}");
            eprintln!("\nRequired environment variables:");
            eprintln!("  PG_DATABASE      - PostgreSQL database name");
            eprintln!("  PG_USERNAME      - PostgreSQL username");
            eprintln!("  PG_PASSWORD      - PostgreSQL password");
            eprintln!("  PG_SLOT_NAME     - replication slot / publication name");
            eprintln!("\nOptional: PG_HOST, PG_PORT, PG_TABLES, PG_MONITOR_UPDATE_COLUMNS");
            std::process::exit(1);
        }
    };

    info!(
        postgres_host = %options.postgres.host,
        postgres_port = %options.postgres.port,
        postgres_database = %options.postgres.database,
        slot_name = %options.slot_name,
        tables = ?options.tables,
        "Configuration summary"
    );

    let mut replicator = Replicator::new(options, LogHandler);

    if args.teardown {
        return replicator.teardown().await;
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    match replicator.start(cancel).await {
        Ok(()) => {
            info!("Replication stopped");
            Ok(())
        }
        Err(e) => {
            error!("Replication failed: {e}");
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
