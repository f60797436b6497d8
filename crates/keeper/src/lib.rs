//! An auction keeper: an autonomous agent bidding in the collateral-debt
//! system's flip, clip, flap and flop auctions on behalf of one account,
//! with prices supplied by an external model process per auction.

pub mod arguments;
pub mod auctions;
pub mod balances;
pub mod gas;
pub mod model;
pub mod run;
pub mod strategy;
pub mod submission;
pub mod vaults;

use {clap::Parser, std::process::ExitCode};

pub async fn start(args: impl Iterator<Item = String>) -> ExitCode {
    let args = arguments::Arguments::parse_from(args);
    observe::tracing::initialize(&args.log_filter);
    observe::panic_hook::install();
    observe::metrics::setup_registry(Some("keeper".to_string()));
    if let Err(err) = args.validate() {
        tracing::error!("invalid configuration: {err:#}");
        return ExitCode::from(1);
    }
    tracing::info!("running keeper with {args:#?}");
    match run::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!(error = ?fatal.error(), "keeper failed");
            ExitCode::from(fatal.exit_code())
        }
    }
}
