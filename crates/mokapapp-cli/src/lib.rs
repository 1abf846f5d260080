//! `mokapapp`: synchronise PanelApp gene panels into the Moka database.
//!
//! The binary is a thin wrapper over [`run_cli`]. The stages are exposed
//! separately so they can run against any transport and gateway:
//! - [`fetch_derived`] pulls registry panels and derives coloured panels.
//! - [`check_panel_count`] guards against truncated registry responses.
//! - [`import_panels`] reconciles, applies and verifies against a gateway.

pub mod config;
pub mod logging;

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use mokapapp_core::{
    apply, derive_panels, reconcile, verify, Colour, DerivedPanel, PanelError, PanelGateway,
    RunStats, TargetState,
};
use mokapapp_panelapp::{PanelAppSource, PanelAppTransport, UreqTransport};
use mokapapp_store_sqlite::SqliteMokaStore;
use tracing::{error, info};

use crate::config::Config;
use crate::logging::LogSettings;

#[derive(Debug, Parser)]
#[command(name = "mokapapp")]
#[command(about = "Import PanelApp gene panels into the Moka database")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Directory for the daily log file.
    #[arg(short, long, default_value = ".")]
    logdir: PathBuf,

    /// `[database.<section>]` to import into.
    #[arg(long, default_value = "production")]
    db: String,

    /// Log filter, e.g. `debug` or `mokapapp_core=debug,info`. Overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch, reconcile and apply registry panels (default).
    Import(ImportArgs),
    /// Print derived panels as JSON without touching the database.
    Query(QueryArgs),
}

#[derive(Debug, Default, Args)]
pub struct ImportArgs {
    /// Stop after this many registry panels.
    #[arg(long)]
    limit: Option<usize>,
    /// Overrides `mokapapp.min_panel_count`.
    #[arg(long)]
    min_panel_count: Option<usize>,
}

#[derive(Debug, Default, Args)]
pub struct QueryArgs {
    #[arg(long)]
    limit: Option<usize>,
}

/// Runs a parsed command line. Logging is installed first; every later
/// failure is logged before it is returned.
///
/// # Errors
/// Returns an error when logging cannot be set up or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let log_file = logging::init(&LogSettings {
        logdir: cli.logdir.clone(),
        level: cli.log_level.clone(),
    })?;
    info!(log_file = %log_file.display(), "mokapapp started");

    let result = run_command(&cli);
    if let Err(err) = &result {
        error!("mokapapp failed: {err:#}");
    }
    result
}

fn run_command(cli: &Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;
    let source = PanelAppSource::new(
        UreqTransport::new(config.http_timeout),
        config.endpoints.clone(),
    );

    match &cli.command {
        Some(Command::Query(args)) => {
            let derived = fetch_derived(&source, &config.colours, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&derived)?);
            Ok(())
        }
        Some(Command::Import(args)) => run_import(cli, &config, &source, args),
        None => run_import(cli, &config, &source, &ImportArgs::default()),
    }
}

fn run_import<T: PanelAppTransport>(
    cli: &Cli,
    config: &Config,
    source: &PanelAppSource<T>,
    args: &ImportArgs,
) -> Result<()> {
    let db_path = config.database_path(&cli.db)?;
    let min_panel_count = args.min_panel_count.unwrap_or(config.min_panel_count);

    let derived = fetch_derived(source, &config.colours, args.limit)?;
    check_panel_count(derived.len(), min_panel_count)?;

    let mut store = SqliteMokaStore::open(db_path)?;
    let stats = import_panels(&derived, &mut store)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Drains the registry and derives one panel per (panel, colour) pair.
///
/// # Errors
/// Returns the first network or malformed-response error, or an unknown
/// confidence level found during derivation.
pub fn fetch_derived<T: PanelAppTransport>(
    source: &PanelAppSource<T>,
    colours: &BTreeSet<Colour>,
    limit: Option<usize>,
) -> Result<Vec<DerivedPanel>, PanelError> {
    let raw = source.fetch(limit).collect::<Result<Vec<_>, _>>()?;
    info!(raw_panels = raw.len(), "fetched registry panels");

    let derived = derive_panels(&raw, colours)?;
    info!(
        derived_panels = derived.len(),
        colours = ?colours,
        "derived coloured panels"
    );
    Ok(derived)
}

/// # Errors
/// Returns [`PanelError::Invariant`] when nothing was derived or the count
/// does not exceed `min_panel_count`.
pub fn check_panel_count(count: usize, min_panel_count: usize) -> Result<(), PanelError> {
    if count == 0 {
        return Err(PanelError::Invariant(
            "no panels derived from registry".to_string(),
        ));
    }
    if count <= min_panel_count {
        return Err(PanelError::Invariant(format!(
            "derived {count} panels; expected more than {min_panel_count}"
        )));
    }
    Ok(())
}

/// Reconciles `derived` against the gateway, applies the mutations and
/// verifies the result.
///
/// # Errors
/// Returns missing HGNC ids before any mutation, the first persistence
/// failure during apply, or an invariant violation found by verification.
pub fn import_panels<G: PanelGateway + ?Sized>(
    derived: &[DerivedPanel],
    gateway: &mut G,
) -> Result<RunStats, PanelError> {
    let state = TargetState::load(gateway)?;
    let mutations = reconcile(derived, &state)?;
    let stats = apply(&mutations, gateway)?;
    verify(&mutations, gateway)?;

    info!(
        new_panel_keys = stats.new_keys,
        new_versions = stats.new_versions,
        inserted = stats.inserted,
        updated = stats.updated,
        unchanged = stats.unchanged,
        deactivated = stats.deactivated,
        "import complete"
    );
    Ok(stats)
}
