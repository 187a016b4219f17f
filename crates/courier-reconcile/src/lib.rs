//! Out-of-band repair of the one-conversation-per-pair rule.
//!
//! Safe to run against a live database and safe to run repeatedly: a second
//! run over repaired data reports nothing to do.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::Utc;
use tracing::info;

use courier_db::Database;
use courier_db::reconcile::ReconcileReport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub db_path: PathBuf,
    pub dry_run: bool,
}

impl Options {
    /// `args` excludes the program name. The database path comes from
    /// `--db <path>`, then `COURIER_DB_PATH`, then `courier.db`.
    pub fn parse(args: impl IntoIterator<Item = String>, env_db_path: Option<String>) -> Result<Self> {
        let mut db_path = env_db_path.map(PathBuf::from);
        let mut dry_run = false;

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--dry-run" | "-n" => dry_run = true,
                "--db" => match args.next() {
                    Some(path) => db_path = Some(path.into()),
                    None => bail!("--db needs a path"),
                },
                other => bail!("unknown argument: {}", other),
            }
        }

        Ok(Self {
            db_path: db_path.unwrap_or_else(|| "courier.db".into()),
            dry_run,
        })
    }
}

pub fn run(db: &Database, dry_run: bool) -> Result<ReconcileReport> {
    let report = db.reconcile(dry_run, Utc::now())?;

    info!(
        "{}: {} duplicate set(s), {} conversation(s) merged, {} message(s) moved, {} stat(s) corrected, {} pair key(s) backfilled",
        if dry_run { "Dry run" } else { "Reconciled" },
        report.duplicate_sets,
        report.conversations_merged,
        report.messages_moved,
        report.stats_corrected,
        report.pair_keys_backfilled
    );
    if report.is_noop() {
        info!("Nothing to repair");
    }
    if !dry_run && !report.pair_index_enforced {
        bail!("pair uniqueness index could not be created; duplicates remain");
    }
    Ok(report)
}
