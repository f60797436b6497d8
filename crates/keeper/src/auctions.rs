//! The per-auction state machine: discovery through the contract's `kicks`
//! counter, model lifecycle, bid decisions against the per-scan reservoir,
//! settlement and cleanup.

use {
    crate::{
        model::{Model, ModelFactory, Status},
        strategy::{AuctionStrategy, Plan},
        submission::{Key, Outcome, TxManager},
    },
    alloy_primitives::Address,
    dss::{node::BlockInfo, Ledger, Phase, TokenJoin, TokenView},
    number::Rad,
    std::{
        collections::{BTreeMap, HashSet},
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// Per-scan accounting of vat stablecoin not yet spoken for by a bid
/// decision. Prevents several bids in one pass from jointly overspending a
/// balance that only covers one of them.
#[derive(Debug)]
pub struct Reservoir {
    remaining: Rad,
}

impl Reservoir {
    pub fn new(balance: Rad) -> Self {
        Self { remaining: balance }
    }

    /// Reserves `cost` if it is still covered.
    pub fn check(&mut self, cost: Rad) -> bool {
        if cost <= self.remaining {
            self.remaining = self.remaining - cost;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> Rad {
        self.remaining
    }
}

struct Record {
    auction: dss::Auction,
    model: Model,
    last_stance: Option<crate::model::Stance>,
    stance_since: Instant,
}

pub struct Registry {
    strategy: Arc<dyn AuctionStrategy>,
    model_factory: ModelFactory,
    ledger: Arc<dyn Ledger>,
    dai_join: Arc<dyn TokenJoin>,
    gov: Option<Arc<dyn TokenView>>,
    our_address: Address,
    min_auction: u64,
    max_auctions: usize,
    bid_delay: Duration,
    bidding_enabled: bool,
    records: BTreeMap<u64, Record>,
    /// Ids observed terminal, never fetched again.
    finished: HashSet<u64>,
    /// Vat balance observed at the start of the last full scan; the cheap
    /// bid pass reuses it instead of re-reading the ledger.
    vat_balance: Rad,
}

impl Registry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        strategy: Arc<dyn AuctionStrategy>,
        model_factory: ModelFactory,
        ledger: Arc<dyn Ledger>,
        dai_join: Arc<dyn TokenJoin>,
        gov: Option<Arc<dyn TokenView>>,
        our_address: Address,
        min_auction: u64,
        max_auctions: usize,
        bid_delay: Duration,
    ) -> Self {
        Self {
            strategy,
            model_factory,
            ledger,
            dai_join,
            gov,
            our_address,
            min_auction: min_auction.max(1),
            max_auctions,
            bid_delay,
            bidding_enabled: true,
            records: BTreeMap::new(),
            finished: HashSet::new(),
            vat_balance: Rad::ZERO,
        }
    }

    pub fn live_auctions(&self) -> usize {
        self.records.len()
    }

    /// Draining keepers (and keepers short on gas money) settle and clean
    /// up but place no new bids.
    pub fn set_bidding(&mut self, enabled: bool) {
        if self.bidding_enabled != enabled {
            tracing::info!(enabled, "bidding toggled");
        }
        self.bidding_enabled = enabled;
    }

    /// Full pass: re-read every live auction from the contract, feed the
    /// models, and act on the resulting stances.
    pub async fn check_all_auctions(&mut self, now: BlockInfo, txmgr: &mut TxManager) {
        let kicks = match self.strategy.kicks().await {
            Ok(kicks) => kicks,
            Err(err) => {
                tracing::warn!(?err, "failed to read auction count");
                return;
            }
        };
        let mut reservoir = self.refresh_reservoir().await;
        let known: Vec<u64> = self.records.keys().copied().collect();
        let mut ids: Vec<u64> = (self.min_auction..=kicks).collect();
        ids.extend(known);
        ids.sort_unstable();
        ids.dedup();
        for id in ids {
            if self.finished.contains(&id) {
                continue;
            }
            self.check_auction(id, now, &mut reservoir, txmgr).await;
        }
    }

    /// Cheap pass between blocks: only re-reads stances for auctions already
    /// known, no contract reads. Works against the vat balance cached by the
    /// last full scan; until one has run, that balance is zero and nothing
    /// is bid.
    pub async fn check_for_bids(&mut self, txmgr: &mut TxManager) {
        let mut reservoir = Reservoir::new(self.vat_balance);
        let ids: Vec<u64> = self.records.keys().copied().collect();
        for id in ids {
            self.consider_bid(id, &mut reservoir, txmgr).await;
        }
    }

    /// Re-reads the vat balance, caches it for the cheap pass, and opens a
    /// fresh reservoir for this scan.
    async fn refresh_reservoir(&mut self) -> Reservoir {
        match self.ledger.dai(self.our_address).await {
            Ok(balance) => self.vat_balance = balance,
            Err(err) => {
                tracing::warn!(?err, "failed to read vat balance, assuming zero");
                self.vat_balance = Rad::ZERO;
            }
        }
        Reservoir::new(self.vat_balance)
    }

    async fn check_auction(
        &mut self,
        id: u64,
        now: BlockInfo,
        reservoir: &mut Reservoir,
        txmgr: &mut TxManager,
    ) {
        let strategy = self.strategy.clone();
        let auction = match strategy.fetch(id, now.timestamp).await {
            Ok(auction) => auction,
            Err(err) => {
                tracing::warn!(id, ?err, "failed to read auction, skipping this scan");
                return;
            }
        };

        match auction.phase(now.timestamp) {
            Phase::Dealt => {
                self.finish(id, "dealt").await;
                return;
            }
            Phase::Expired => {
                if auction.guy == self.our_address {
                    if let Some(call) = strategy.deal(id) {
                        tracing::info!(id, "settling won auction");
                        txmgr.submit(Key::Deal(id), call, None);
                    }
                    // Keep the record until the contract reports it dealt.
                    self.update_record(id, auction);
                } else if auction.no_bids() {
                    tracing::info!(id, "restarting expired auction with no bids");
                    txmgr.submit(Key::Restart(id), strategy.restart(id), None);
                    self.update_record(id, auction);
                } else {
                    // Someone else won; nothing left for us here.
                    self.finish(id, "lost").await;
                }
                return;
            }
            Phase::Take => {
                if let dss::Details::Clip { needs_redo: true, .. } = auction.details {
                    tracing::info!(id, "resetting stale collateral sale");
                    txmgr.submit(Key::Restart(id), strategy.restart(id), None);
                    self.update_record(id, auction);
                    return;
                }
            }
            Phase::Tend | Phase::Dent => {}
        }

        if !self.records.contains_key(&id) && self.records.len() >= self.max_auctions {
            tracing::debug!(
                id,
                cap = self.max_auctions,
                "auction cap reached, not taking on more"
            );
            return;
        }
        self.update_record(id, auction.clone());

        if let Some(record) = self.records.get_mut(&id) {
            record.model.send_status(Status::of(&auction));
        }
        self.consider_bid(id, reservoir, txmgr).await;
    }

    async fn consider_bid(&mut self, id: u64, reservoir: &mut Reservoir, txmgr: &mut TxManager) {
        if !self.bidding_enabled {
            return;
        }
        let strategy = self.strategy.clone();
        let gov = self.gov.clone();
        let dai_join = self.dai_join.clone();
        let our_address = self.our_address;
        let bid_delay = self.bid_delay;

        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        let Some(stance) = record.model.stance() else {
            return;
        };
        if record.last_stance.as_ref() != Some(&stance) {
            record.last_stance = Some(stance.clone());
            record.stance_since = Instant::now();
        }
        if record.stance_since.elapsed() < bid_delay {
            return;
        }

        let plan = strategy.plan(&record.auction, &stance, our_address);
        let (call, cost, gov_cost) = match plan {
            Plan::Bid {
                call,
                cost,
                gov_cost,
            } => (call, cost, gov_cost),
            Plan::Skip(reason) => {
                tracing::trace!(id, ?reason, "not bidding");
                return;
            }
        };

        if !reservoir.check(cost) {
            tracing::warn!(
                id,
                %cost,
                remaining = %reservoir.remaining(),
                "insufficient vat stablecoin for this bid"
            );
            // On-bid top-up: move whatever stablecoin we hold in token form
            // into the vat and revisit this bid on the next pass.
            match dai_join.token_balance(our_address).await {
                Ok(balance) if !balance.is_zero() => {
                    tracing::info!(%balance, "joining token stablecoin to cover bids");
                    txmgr.submit(Key::JoinDai, dai_join.join(our_address, balance), None);
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(?err, "failed to read token balance"),
            }
            return;
        }

        if !gov_cost.is_zero() {
            if let Some(gov) = &gov {
                match gov.balance(our_address).await {
                    Ok(balance) if balance < gov_cost => {
                        tracing::warn!(
                            id,
                            %gov_cost,
                            %balance,
                            "insufficient governance tokens for this bid"
                        );
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(?err, "failed to read governance token balance");
                        return;
                    }
                }
            }
        }

        txmgr.submit(Key::Bid(id), call, stance.gas());
    }

    /// Routes a submission result back into the per-auction state. Bid
    /// failures need no bookkeeping: the key is free again and the next
    /// scan recomputes from fresh contract state.
    pub async fn on_completion(&mut self, key: Key, outcome: &Outcome) {
        if let (Key::Deal(id), Outcome::Mined(_)) = (key, outcome) {
            self.finish(id, "settled").await;
        }
    }

    /// Settles every auction we are winning, cancels bids we are not
    /// winning, and terminates every model. The caller waits for the
    /// submitted deals to complete.
    pub async fn drain(&mut self, txmgr: &mut TxManager) {
        self.set_bidding(false);
        let strategy = self.strategy.clone();
        for (id, record) in &self.records {
            if record.auction.guy == self.our_address {
                // Dutch takes settle within the take itself, so there is
                // nothing to deal for those.
                if let Some(call) = strategy.deal(*id) {
                    tracing::info!(id, "settling won auction before terminating");
                    txmgr.submit(Key::Deal(*id), call, None);
                }
            } else if txmgr.has_pending(Key::Bid(*id)) {
                txmgr.cancel(Key::Bid(*id));
            }
        }
        let ids: Vec<u64> = self.records.keys().copied().collect();
        for id in ids {
            if let Some(record) = self.records.remove(&id) {
                record.model.terminate().await;
            }
        }
    }

    fn update_record(&mut self, id: u64, auction: dss::Auction) {
        match self.records.get_mut(&id) {
            Some(record) => record.auction = auction,
            None => {
                tracing::info!(id, kind = %self.strategy.kind(), "new auction");
                self.records.insert(
                    id,
                    Record {
                        auction,
                        model: self.model_factory.create(id),
                        last_stance: None,
                        stance_since: Instant::now(),
                    },
                );
            }
        }
    }

    async fn finish(&mut self, id: u64, why: &'static str) {
        self.finished.insert(id);
        if let Some(record) = self.records.remove(&id) {
            tracing::info!(id, why, "dropping auction");
            record.model.terminate().await;
        }
    }
}
