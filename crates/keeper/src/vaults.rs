//! Discovery work that starts auctions rather than bidding on them: unsafe
//! vaults for flip/clip keepers, and the vow's surplus/debt queues for
//! flap/flop keepers.

use {
    crate::submission::{Key, TxManager},
    alloy_primitives::{Address, B256},
    anyhow::Result,
    dss::{node::BlockInfo, History, Imbalances, Ledger, Liquidator},
    std::{
        collections::HashSet,
        sync::Arc,
    },
};

/// How many blocks of history one log query spans.
const CHUNK: u64 = 20_000;

/// Watches every vault of the configured collateral and kicks the ones that
/// have become unsafe.
pub struct VaultScanner {
    ledger: Arc<dyn Ledger>,
    liquidator: Arc<dyn Liquidator>,
    history: Arc<dyn History>,
    ilk: B256,
    our_address: Address,
    known_urns: HashSet<Address>,
    next_block: u64,
}

impl VaultScanner {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        liquidator: Arc<dyn Liquidator>,
        history: Arc<dyn History>,
        ilk: B256,
        our_address: Address,
        from_block: u64,
    ) -> Self {
        Self {
            ledger,
            liquidator,
            history,
            ilk,
            our_address,
            known_urns: HashSet::new(),
            next_block: from_block,
        }
    }

    pub async fn check_vaults(&mut self, now: BlockInfo, txmgr: &mut TxManager) {
        if let Err(err) = self.refresh_urns(now.number).await {
            tracing::warn!(?err, "urn discovery failed, working from the cached set");
        }
        let ilk = match self.ledger.ilk(self.ilk).await {
            Ok(ilk) => ilk,
            Err(err) => {
                tracing::warn!(?err, "failed to read collateral parameters");
                return;
            }
        };
        for owner in self.known_urns.iter().copied().collect::<Vec<_>>() {
            let urn = match self.ledger.urn(self.ilk, owner).await {
                Ok(urn) => urn,
                Err(err) => {
                    tracing::warn!(%owner, ?err, "failed to read vault");
                    continue;
                }
            };
            if ilk.is_safe(&urn) {
                continue;
            }
            match self.liquidator.can_kick(&ilk, &urn).await {
                Ok(true) => {
                    tracing::info!(%owner, ink = %urn.ink, art = %urn.art, "liquidating unsafe vault");
                    txmgr.submit(
                        Key::Kick(owner),
                        self.liquidator.kick(self.ilk, owner, self.our_address),
                        None,
                    );
                }
                Ok(false) => {
                    tracing::debug!(%owner, "unsafe vault cannot be kicked right now");
                }
                Err(err) => tracing::warn!(%owner, ?err, "liquidation check failed"),
            }
        }
    }

    async fn refresh_urns(&mut self, tip: u64) -> Result<()> {
        while self.next_block <= tip {
            let to = (self.next_block + CHUNK - 1).min(tip);
            let urns = self
                .history
                .touched_urns(self.ilk, self.next_block, to)
                .await?;
            self.known_urns.extend(urns);
            self.next_block = to + 1;
        }
        Ok(())
    }
}

/// Watches the vow and kicks surplus (flap) or debt (flop) auctions when the
/// system's imbalance allows one.
pub struct QueueScanner {
    vow: Arc<dyn Imbalances>,
    history: Arc<dyn History>,
    next_block: u64,
    eras: Vec<u64>,
}

impl QueueScanner {
    pub fn new(vow: Arc<dyn Imbalances>, history: Arc<dyn History>, from_block: u64) -> Self {
        Self {
            vow,
            history,
            next_block: from_block,
            eras: Vec::new(),
        }
    }

    /// Kicks a surplus auction once accumulated surplus clears the buffer.
    /// Outstanding unqueued debt must be healed away first, because the vow
    /// refuses to auction surplus while it carries nettable debt.
    pub async fn check_flap(&self, txmgr: &mut TxManager) {
        let state = match self.vow.state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(?err, "failed to read vow state");
                return;
            }
        };
        let woe = state.woe();
        if !woe.is_zero() && !state.joy.is_zero() {
            let amount = woe.min(state.joy);
            tracing::info!(%amount, "healing debt before a surplus auction");
            txmgr.submit(Key::Heal, self.vow.heal(amount), None);
            return;
        }
        if state.can_flap() {
            tracing::info!(surplus = %state.joy, "kicking surplus auction");
            txmgr.submit(Key::KickFlap, self.vow.kick_flap(), None);
        }
    }

    /// Kicks a debt auction once enough debt has matured out of the queue.
    /// Queued debt is flogged era by era as it passes the vow's wait, and
    /// surplus is healed away first because the vow refuses to auction debt
    /// while it holds stablecoin.
    pub async fn check_flop(&mut self, now: BlockInfo, txmgr: &mut TxManager) {
        if let Err(err) = self.refresh_eras(now.number).await {
            tracing::warn!(?err, "liquidation history replay failed");
        }
        let state = match self.vow.state().await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(?err, "failed to read vow state");
                return;
            }
        };
        for era in &self.eras {
            if era + state.wait > now.timestamp {
                continue;
            }
            match self.vow.queued_debt(*era).await {
                Ok(queued) if !queued.is_zero() => {
                    tracing::info!(era, %queued, "flogging matured queued debt");
                    txmgr.submit(Key::Flog(*era), self.vow.flog(*era), None);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(era, ?err, "failed to read queued debt"),
            }
        }
        if !state.joy.is_zero() && state.joy <= state.woe() {
            tracing::info!(surplus = %state.joy, "healing surplus before a debt auction");
            txmgr.submit(Key::Heal, self.vow.heal(state.joy), None);
            return;
        }
        if state.can_flop() {
            tracing::info!(woe = %state.woe(), "kicking debt auction");
            txmgr.submit(Key::KickFlop, self.vow.kick_flop(), None);
        }
    }

    async fn refresh_eras(&mut self, tip: u64) -> Result<()> {
        while self.next_block <= tip {
            let to = (self.next_block + CHUNK - 1).min(tip);
            let eras = self.history.bite_timestamps(self.next_block, to).await?;
            self.eras.extend(eras);
            self.next_block = to + 1;
        }
        self.eras.sort_unstable();
        self.eras.dedup();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::gas::GasConfig,
        alloy_primitives::{B256, U256},
        dss::{
            Call, Ilk, MockHistory, MockImbalances, MockLedger, MockLiquidator, Node, Receipt,
            SendError, TxSpec, Urn, VowState,
        },
        number::{Rad, Ray, Wad},
        std::{sync::Mutex, time::Duration},
    };

    struct StubNode {
        sent: Mutex<Vec<TxSpec>>,
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
                sent: Mutex::new(Vec::new()),
            }),
            Address::repeat_byte(0x11),
            GasConfig::default(),
            Duration::from_millis(10),
        )
    }

    fn ilk() -> Ilk {
        Ilk {
            id: dss::ilk_id("VLX-A"),
            rate: Ray::ONE,
            spot: Ray::from_integer(100),
            line: "1000000".parse().unwrap(),
            dust: "20".parse().unwrap(),
        }
    }

    fn call() -> Call {
        Call {
            to: Address::repeat_byte(0xcc),
            data: vec![1, 2, 3].into(),
        }
    }

    fn now() -> BlockInfo {
        BlockInfo {
            number: 50_000,
            timestamp: 1_000_000,
        }
    }

    #[tokio::test]
    async fn kicks_only_unsafe_kickable_vaults() {
        let unsafe_owner = Address::repeat_byte(0xaa);
        let safe_owner = Address::repeat_byte(0xbb);

        let mut history = MockHistory::new();
        history
            .expect_touched_urns()
            .returning(move |_, _, _| Ok(vec![unsafe_owner, safe_owner]));

        let mut ledger = MockLedger::new();
        ledger.expect_ilk().returning(|_| Ok(ilk()));
        ledger.expect_urn().returning(move |_, owner| {
            Ok(if owner == unsafe_owner {
                // 1 collateral at spot 100 covering 150 debt: unsafe.
                Urn {
                    ink: Wad::from_integer(1),
                    art: Wad::from_integer(150),
                }
            } else {
                Urn {
                    ink: Wad::from_integer(10),
                    art: Wad::from_integer(150),
                }
            })
        });

        let mut liquidator = MockLiquidator::new();
        liquidator
            .expect_can_kick()
            .times(1)
            .returning(|_, _| Ok(true));
        liquidator.expect_kick().returning(|_, _, _| call());

        let mut scanner = VaultScanner::new(
            Arc::new(ledger),
            Arc::new(liquidator),
            Arc::new(history),
            dss::ilk_id("VLX-A"),
            Address::repeat_byte(0x11),
            1,
        );
        let mut txmgr = txmgr();
        scanner.check_vaults(now(), &mut txmgr).await;

        assert!(txmgr.has_pending(Key::Kick(unsafe_owner)));
        assert!(!txmgr.has_pending(Key::Kick(safe_owner)));
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn pages_history_in_chunks_and_remembers_progress() {
        let mut history = MockHistory::new();
        history
            .expect_touched_urns()
            .withf(|_, from, to| (*from, *to) == (1, 20_000))
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        history
            .expect_touched_urns()
            .withf(|_, from, to| (*from, *to) == (20_001, 40_000))
            .times(1)
            .returning(|_, _, _| Ok(vec![]));
        history
            .expect_touched_urns()
            .withf(|_, from, to| (*from, *to) == (40_001, 50_000))
            .times(1)
            .returning(|_, _, _| Ok(vec![]));

        let mut ledger = MockLedger::new();
        ledger.expect_ilk().returning(|_| Ok(ilk()));

        let mut scanner = VaultScanner::new(
            Arc::new(ledger),
            Arc::new(MockLiquidator::new()),
            Arc::new(history),
            dss::ilk_id("VLX-A"),
            Address::repeat_byte(0x11),
            1,
        );
        let mut txmgr = txmgr();
        scanner.check_vaults(now(), &mut txmgr).await;
        // A second scan at the same tip replays nothing.
        scanner.check_vaults(now(), &mut txmgr).await;
        txmgr.abort_all();
    }

    fn vow_state(joy: &str, awe: &str, queued: &str, on_auction: &str) -> VowState {
        VowState {
            joy: joy.parse().unwrap(),
            awe: awe.parse().unwrap(),
            queued: queued.parse().unwrap(),
            on_auction: on_auction.parse().unwrap(),
            bump: "10000".parse().unwrap(),
            hump: "5000".parse().unwrap(),
            sump: "50000".parse().unwrap(),
            wait: 600,
        }
    }

    #[tokio::test]
    async fn heals_debt_before_kicking_a_surplus_auction() {
        let mut vow = MockImbalances::new();
        // 100 woe outstanding with plenty of surplus.
        vow.expect_state()
            .returning(|| Ok(vow_state("100000", "100", "0", "0")));
        vow.expect_heal()
            .withf(|amount| *amount == "100".parse::<Rad>().unwrap())
            .returning(|_| call());
        let scanner = QueueScanner::new(Arc::new(vow), Arc::new(MockHistory::new()), 1);
        let mut txmgr = txmgr();
        scanner.check_flap(&mut txmgr).await;
        assert!(txmgr.has_pending(Key::Heal));
        assert!(!txmgr.has_pending(Key::KickFlap));
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn kicks_a_surplus_auction_over_the_buffer() {
        let mut vow = MockImbalances::new();
        // joy >= awe + bump + hump and no woe.
        vow.expect_state()
            .returning(|| Ok(vow_state("100000", "0", "0", "0")));
        vow.expect_kick_flap().returning(call);
        let scanner = QueueScanner::new(Arc::new(vow), Arc::new(MockHistory::new()), 1);
        let mut txmgr = txmgr();
        scanner.check_flap(&mut txmgr).await;
        assert!(txmgr.has_pending(Key::KickFlap));
        txmgr.abort_all();
    }

    #[tokio::test]
    async fn flogs_matured_eras_and_kicks_a_debt_auction() {
        let mut history = MockHistory::new();
        history
            .expect_bite_timestamps()
            .returning(|_, _| Ok(vec![900_000, 999_900]));

        let mut vow = MockImbalances::new();
        // 60 000 unqueued debt, no surplus: a flop is possible.
        vow.expect_state()
            .returning(|| Ok(vow_state("0", "60000", "0", "0")));
        // Only the matured era still has queued debt.
        vow.expect_queued_debt()
            .withf(|era| *era == 900_000)
            .returning(|_| Ok("500".parse().unwrap()));
        vow.expect_queued_debt()
            .withf(|era| *era == 999_900)
            .returning(|_| Ok(Rad::ZERO));
        vow.expect_flog().returning(|_| call());
        vow.expect_kick_flop().returning(call);

        let mut scanner = QueueScanner::new(Arc::new(vow), Arc::new(history), 1);
        let mut txmgr = txmgr();
        scanner.check_flop(now(), &mut txmgr).await;

        assert!(txmgr.has_pending(Key::Flog(900_000)));
        assert!(!txmgr.has_pending(Key::Flog(999_900)));
        assert!(txmgr.has_pending(Key::KickFlop));
        txmgr.abort_all();
    }
}
