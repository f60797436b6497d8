use {
    crate::{balances::DaiTarget, gas::GasConfig},
    alloy_primitives::{Address, U256},
    anyhow::{ensure, Context, Result},
    dss::AuctionKind,
    std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration},
    url::Url,
};

#[derive(Debug, clap::Parser)]
pub struct Arguments {
    /// Account the keeper operates from.
    #[clap(long, env)]
    pub eth_from: Address,

    /// Which auction family to participate in.
    #[clap(long = "type", env = "AUCTION_TYPE", value_parser = AuctionKind::from_str)]
    pub auction_type: AuctionKind,

    /// Pricing model command. The keeper appends `--id <auction id>` and
    /// exchanges line-delimited JSON over the child's stdin/stdout.
    #[clap(long, env)]
    pub model: String,

    /// Collateral name, e.g. VLX-A. Required for flip and clip keepers.
    #[clap(long, env)]
    pub ilk: Option<String>,

    /// Block to start replaying vault and liquidation history from.
    #[clap(long, env, default_value = "1")]
    pub from_block: u64,

    /// Vat stablecoin balance to maintain: "all" or a fixed amount.
    #[clap(long, env, value_parser = DaiTarget::from_str)]
    pub vat_dai_target: Option<DaiTarget>,

    /// Seconds between returning won collateral to token form.
    #[clap(long, env, default_value = "300", value_parser = duration_from_seconds)]
    pub return_gem_interval: Duration,

    /// Only bid on existing auctions, never kick new ones.
    #[clap(long, env)]
    pub bid_only: bool,

    /// Do not exit vat stablecoin on shutdown.
    #[clap(long, env)]
    pub keep_dai_in_vat_on_exit: bool,

    /// Do not exit vat collateral on shutdown.
    #[clap(long, env)]
    pub keep_gem_in_vat_on_exit: bool,

    /// Ignore auctions with a lower id.
    #[clap(long, env, default_value = "1")]
    pub min_auction: u64,

    /// Cap on concurrently tracked auctions (and model processes).
    #[clap(long, env, default_value = "1000")]
    pub max_auctions: usize,

    /// Seconds between stance re-polls without a full contract re-read.
    #[clap(long, env, default_value = "2", value_parser = duration_from_seconds)]
    pub bid_check_interval: Duration,

    /// Seconds between checks for a new block.
    #[clap(long, env, default_value = "13", value_parser = duration_from_seconds)]
    pub block_check_interval: Duration,

    /// Seconds a stance must stand before it is acted on.
    #[clap(long, env, default_value = "0", value_parser = duration_from_seconds)]
    pub bid_delay: Duration,

    /// Pause bidding when the account's ETH drops below this many wei.
    #[clap(long, env, default_value = "0")]
    pub gas_reservation: u128,

    /// Hard cap in wei on scheduled gas prices.
    #[clap(long, env)]
    pub gas_maximum: Option<u128>,

    /// Factor on the node gas price for the first attempt.
    #[clap(long, env, default_value = "1.0")]
    pub gas_initial_multiplier: f64,

    /// Growth factor applied every gas update interval.
    #[clap(long, env, default_value = "1.125")]
    pub gas_reactive_multiplier: f64,

    /// Seconds between gas re-evaluations of a pending submission.
    #[clap(long, env, default_value = "30", value_parser = duration_from_seconds)]
    pub gas_update_interval: Duration,

    /// How often a crashed model is restarted before its auction is
    /// ignored.
    #[clap(long, env, default_value = "5")]
    pub model_retries: u32,

    /// Node RPC endpoint.
    #[clap(long, env = "ETH_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: Url,

    /// Seconds before a node request is abandoned.
    #[clap(long, env, default_value = "60", value_parser = duration_from_seconds)]
    pub rpc_timeout: Duration,

    /// Keystore file of the operating account.
    #[clap(long, env = "ETH_KEYFILE")]
    pub eth_keyfile: PathBuf,

    /// File holding the keystore password.
    #[clap(long, env = "ETH_PASSWORD")]
    pub eth_password: PathBuf,

    /// JSON file with the deployment's contract addresses.
    #[clap(long, env)]
    pub addresses: PathBuf,

    #[clap(long, env, default_value = "info,keeper=debug")]
    pub log_filter: String,

    #[clap(long, env, default_value = "0.0.0.0:9598")]
    pub metrics_address: SocketAddr,
}

impl Arguments {
    /// Cross-flag constraints that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        match self.auction_type {
            AuctionKind::Flip | AuctionKind::Clip => {
                ensure!(
                    self.ilk.is_some(),
                    "--ilk is required for {} keepers",
                    self.auction_type
                );
            }
            AuctionKind::Flap | AuctionKind::Flop => {
                ensure!(
                    self.ilk.is_none(),
                    "--ilk does not apply to {} keepers",
                    self.auction_type
                );
            }
        }
        ensure!(
            self.gas_initial_multiplier >= 1.0 && self.gas_reactive_multiplier > 1.0,
            "gas multipliers must not shrink the price"
        );
        ensure!(
            !self.gas_update_interval.is_zero(),
            "--gas-update-interval must be positive"
        );
        ensure!(
            !self.bid_check_interval.is_zero(),
            "--bid-check-interval must be positive"
        );
        ensure!(self.min_auction >= 1, "--min-auction starts at 1");
        Ok(())
    }

    pub fn gas_config(&self) -> GasConfig {
        GasConfig {
            initial_multiplier: self.gas_initial_multiplier,
            reactive_multiplier: self.gas_reactive_multiplier,
            update_interval: self.gas_update_interval,
            maximum: self.gas_maximum.map(U256::from),
        }
    }

    pub fn keystore_password(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.eth_password)
            .with_context(|| format!("read password file {}", self.eth_password.display()))?;
        Ok(raw.trim_end_matches(['\n', '\r']).to_string())
    }
}

fn duration_from_seconds(s: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(s.parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(extra: &str) -> Arguments {
        let base = "keeper --eth-from 0x50FF810797f75f6bfbf2227442e0c961a8562F4C \
                    --model ./model.sh --eth-keyfile key.json --eth-password pass.txt \
                    --addresses addresses.json";
        Arguments::parse_from(format!("{base} {extra}").split_whitespace())
    }

    #[test]
    fn flip_requires_an_ilk() {
        assert!(parse("--type flip").validate().is_err());
        assert!(parse("--type flip --ilk VLX-A").validate().is_ok());
    }

    #[test]
    fn flap_refuses_an_ilk() {
        assert!(parse("--type flap").validate().is_ok());
        assert!(parse("--type flap --ilk VLX-A").validate().is_err());
    }

    #[test]
    fn parses_the_dai_target() {
        let args = parse("--type flop --vat-dai-target all");
        assert_eq!(args.vat_dai_target, Some(DaiTarget::All));
        let args = parse("--type flop --vat-dai-target 1500");
        assert_eq!(
            args.vat_dai_target,
            Some(DaiTarget::Amount("1500".parse().unwrap()))
        );
    }

    #[test]
    fn gas_flags_feed_the_schedule() {
        let args = parse("--type flop --gas-maximum 2000000000 --gas-update-interval 60");
        let config = args.gas_config();
        assert_eq!(config.maximum, Some(U256::from(2_000_000_000u64)));
        assert_eq!(config.update_interval, Duration::from_secs(60));
    }
}
