use tracing::{error, info};

use courier_db::Database;
use courier_reconcile::{Options, run};

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=info".into()),
        )
        .init();

    let opts = match Options::parse(std::env::args().skip(1), std::env::var("COURIER_DB_PATH").ok()) {
        Ok(opts) => opts,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("usage: courier-reconcile [--dry-run] [--db <path>]");
            std::process::exit(2);
        }
    };

    info!("Reconciling {}{}", opts.db_path.display(), if opts.dry_run { " (dry run)" } else { "" });
    let db = Database::open(&opts.db_path)?;
    run(&db, opts.dry_run)?;
    Ok(())
}
