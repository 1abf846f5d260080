use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = mokapapp_cli::Cli::parse();
    mokapapp_cli::run_cli(cli)
}
