//! Keeps the operator's vat stablecoin near the configured target and
//! returns won collateral to token form periodically.

use {
    crate::submission::{Key, TxManager},
    alloy_primitives::{Address, B256},
    dss::{Ledger, TokenJoin},
    number::Wad,
    std::{
        str::FromStr,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
};

/// The `--vat-dai-target` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaiTarget {
    /// Keep everything joined; never exit proactively.
    All,
    /// Keep the vat balance at this many stablecoins.
    Amount(Wad),
}

impl FromStr for DaiTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        Ok(Self::Amount(s.parse().map_err(|err| {
            anyhow::anyhow!("invalid stablecoin target {s:?}: {err}")
        })?))
    }
}

pub struct Rebalancer {
    ledger: Arc<dyn Ledger>,
    dai_join: Arc<dyn TokenJoin>,
    gem_join: Option<Arc<dyn TokenJoin>>,
    ilk: Option<B256>,
    our_address: Address,
    target: Option<DaiTarget>,
    return_gem_interval: Duration,
    last_gem_return: Mutex<Option<Instant>>,
    exit_dai_on_shutdown: bool,
    exit_gem_on_shutdown: bool,
}

impl Rebalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        dai_join: Arc<dyn TokenJoin>,
        gem_join: Option<Arc<dyn TokenJoin>>,
        ilk: Option<B256>,
        our_address: Address,
        target: Option<DaiTarget>,
        return_gem_interval: Duration,
        exit_dai_on_shutdown: bool,
        exit_gem_on_shutdown: bool,
    ) -> Self {
        Self {
            ledger,
            dai_join,
            gem_join,
            ilk,
            our_address,
            target,
            return_gem_interval,
            last_gem_return: Mutex::new(None),
            exit_dai_on_shutdown,
            exit_gem_on_shutdown,
        }
    }

    /// Moves stablecoin between token and vat form towards the target.
    pub async fn rebalance_dai(&self, txmgr: &mut TxManager) {
        let Some(target) = self.target else {
            return;
        };
        let us = self.our_address;
        let vat = match self.ledger.dai(us).await {
            Ok(balance) => balance.to_wad(),
            Err(err) => {
                tracing::warn!(?err, "failed to read vat balance");
                return;
            }
        };
        let token = match self.dai_join.token_balance(us).await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(?err, "failed to read token balance");
                return;
            }
        };
        match target {
            DaiTarget::All => {
                if !token.is_zero() {
                    tracing::info!(%token, "joining all token stablecoin");
                    txmgr.submit(Key::JoinDai, self.dai_join.join(us, token), None);
                }
            }
            DaiTarget::Amount(target) => {
                if vat < target && !token.is_zero() {
                    let amount = (target - vat).min(token);
                    tracing::info!(%amount, %vat, %target, "topping the vat up to target");
                    txmgr.submit(Key::JoinDai, self.dai_join.join(us, amount), None);
                } else if vat > target {
                    let amount = vat - target;
                    tracing::info!(%amount, %vat, %target, "exiting vat surplus over target");
                    txmgr.submit(Key::ExitDai, self.dai_join.exit(us, amount), None);
                }
            }
        }
    }

    /// Exits vat-held collateral back to token form, at most once per
    /// configured interval. Collateral only accumulates from won auctions
    /// and is never needed for a bid, so everything goes back.
    pub async fn return_gems(&self, txmgr: &mut TxManager) {
        let (Some(gem_join), Some(ilk)) = (&self.gem_join, self.ilk) else {
            return;
        };
        {
            let last = self.last_gem_return.lock().unwrap();
            if last.is_some_and(|last| last.elapsed() < self.return_gem_interval) {
                return;
            }
        }
        let balance = match self.ledger.gem(ilk, self.our_address).await {
            Ok(balance) => balance,
            Err(err) => {
                tracing::warn!(?err, "failed to read vat collateral balance");
                return;
            }
        };
        *self.last_gem_return.lock().unwrap() = Some(Instant::now());
        if balance.is_zero() {
            return;
        }
        tracing::info!(%balance, "returning won collateral to token form");
        txmgr.submit(
            Key::ExitGem,
            gem_join.exit(self.our_address, balance),
            None,
        );
    }

    /// Shutdown rebalancing per the keep-in-vat flags.
    pub async fn on_shutdown(&self, txmgr: &mut TxManager) {
        let us = self.our_address;
        if self.exit_dai_on_shutdown {
            match self.ledger.dai(us).await {
                Ok(balance) if !balance.to_wad().is_zero() => {
                    tracing::info!(balance = %balance.to_wad(), "exiting vat stablecoin on shutdown");
                    txmgr.submit(Key::ExitDai, self.dai_join.exit(us, balance.to_wad()), None);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(?err, "failed to read vat balance on shutdown"),
            }
        }
        if self.exit_gem_on_shutdown {
            if let (Some(gem_join), Some(ilk)) = (&self.gem_join, self.ilk) {
                match self.ledger.gem(ilk, us).await {
                    Ok(balance) if !balance.is_zero() => {
                        tracing::info!(%balance, "exiting vat collateral on shutdown");
                        txmgr.submit(Key::ExitGem, gem_join.exit(us, balance), None);
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(?err, "failed to read vat collateral on shutdown"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::gas::GasConfig,
        alloy_primitives::{B256, U256},
        dss::{
            node::BlockInfo, Call, MockLedger, MockTokenJoin, Node, Receipt, SendError, TxSpec,
        },
        number::Rad,
        std::sync::Mutex as StdMutex,
    };

    struct StubNode {
        sent: StdMutex<Vec<TxSpec>>,
    }

    #[async_trait::async_trait]
    impl Node for StubNode {
        async fn latest_block(&self) -> anyhow::Result<BlockInfo> {
            Ok(Default::default())
        }

        async fn gas_price(&self) -> anyhow::Result<U256> {
            Ok(U256::from(1000))
        }

        async fn eth_balance(&self, _address: Address) -> anyhow::Result<U256> {
            Ok(U256::MAX)
        }

        async fn nonce(&self, _address: Address) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn send(&self, tx: &TxSpec) -> Result<B256, SendError> {
            self.sent.lock().unwrap().push(tx.clone());
            Ok(B256::ZERO)
        }

        async fn receipt(&self, _hash: B256) -> anyhow::Result<Option<Receipt>> {
            Ok(None)
        }
    }

    fn txmgr() -> TxManager {
        TxManager::new(
            Arc::new(StubNode {
                sent: StdMutex::new(Vec::new()),
            }),
            us(),
            GasConfig::default(),
            Duration::from_millis(10),
        )
    }

    fn us() -> Address {
        Address::repeat_byte(0x11)
    }

    fn join_call(amount: Wad) -> Call {
        Call {
            to: Address::repeat_byte(0xdd),
            data: amount.to_string().into_bytes().into(),
        }
    }

    fn rebalancer(
        vat: &str,
        token: &str,
        target: Option<DaiTarget>,
    ) -> (Rebalancer, Arc<StdMutex<Vec<String>>>) {
        let actions = Arc::new(StdMutex::new(Vec::new()));
        let mut ledger = MockLedger::new();
        let vat: Rad = vat.parse().unwrap();
        ledger.expect_dai().returning(move |_| Ok(vat));
        let mut dai_join = MockTokenJoin::new();
        let token: Wad = token.parse().unwrap();
        dai_join
            .expect_token_balance()
            .returning(move |_| Ok(token));
        {
            let actions = actions.clone();
            dai_join.expect_join().returning(move |_, amount| {
                actions.lock().unwrap().push(format!("join {amount}"));
                join_call(amount)
            });
        }
        {
            let actions = actions.clone();
            dai_join.expect_exit().returning(move |_, amount| {
                actions.lock().unwrap().push(format!("exit {amount}"));
                join_call(amount)
            });
        }
        let rebalancer = Rebalancer::new(
            Arc::new(ledger),
            Arc::new(dai_join),
            None,
            None,
            us(),
            target,
            Duration::from_secs(300),
            false,
            false,
        );
        (rebalancer, actions)
    }

    #[tokio::test]
    async fn all_target_joins_the_full_token_balance() {
        let (rebalancer, actions) = rebalancer("0", "77", Some(DaiTarget::All));
        let mut txmgr = txmgr();
        rebalancer.rebalance_dai(&mut txmgr).await;
        assert_eq!(actions.lock().unwrap().as_slice(), ["join 77"]);
        assert!(txmgr.has_pending(Key::JoinDai));
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn fixed_target_joins_only_the_shortfall() {
        let (rebalancer, actions) =
            rebalancer("30", "100", Some(DaiTarget::Amount("50".parse().unwrap())));
        let mut txmgr = txmgr();
        rebalancer.rebalance_dai(&mut txmgr).await;
        assert_eq!(actions.lock().unwrap().as_slice(), ["join 20"]);
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn fixed_target_exits_the_excess() {
        let (rebalancer, actions) =
            rebalancer("80", "0", Some(DaiTarget::Amount("50".parse().unwrap())));
        let mut txmgr = txmgr();
        rebalancer.rebalance_dai(&mut txmgr).await;
        assert_eq!(actions.lock().unwrap().as_slice(), ["exit 30"]);
        assert!(txmgr.has_pending(Key::ExitDai));
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn no_target_means_no_rebalancing() {
        let (rebalancer, actions) = rebalancer("0", "77", None);
        let mut txmgr = txmgr();
        rebalancer.rebalance_dai(&mut txmgr).await;
        assert!(actions.lock().unwrap().is_empty());
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn gem_returns_are_rate_limited() {
        let mut ledger = MockLedger::new();
        ledger
            .expect_gem()
            .times(1)
            .returning(|_, _| Ok(Wad::from_integer(3)));
        let mut gem_join = MockTokenJoin::new();
        gem_join
            .expect_exit()
            .times(1)
            .returning(|_, amount| join_call(amount));
        let rebalancer = Rebalancer::new(
            Arc::new(ledger),
            Arc::new(MockTokenJoin::new()),
            Some(Arc::new(gem_join)),
            Some(dss::ilk_id("VLX-A")),
            us(),
            None,
            Duration::from_secs(300),
            false,
            false,
        );
        let mut txmgr = txmgr();
        rebalancer.return_gems(&mut txmgr).await;
        assert!(txmgr.has_pending(Key::ExitGem));
        // Within the interval nothing is read or exited again.
        rebalancer.return_gems(&mut txmgr).await;
        txmgr.abort_all();
    }

    #[test]
    fn parses_targets() {
        assert_eq!("all".parse::<DaiTarget>().unwrap(), DaiTarget::All);
        assert_eq!(
            "1500.5".parse::<DaiTarget>().unwrap(),
            DaiTarget::Amount("1500.5".parse().unwrap())
        );
        assert!("bogus".parse::<DaiTarget>().is_err());
    }
}
