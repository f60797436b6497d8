//! Wires the configured deployment into the keeper and drives it: full scans
//! on new blocks, stance re-polls in between, completion routing, and the
//! Initialising → Running → Draining → Terminated lifecycle.

use {
    crate::{
        arguments::Arguments,
        auctions::Registry,
        balances::Rebalancer,
        model::ModelFactory,
        strategy::{AuctionStrategy, ClipStrategy, FlapStrategy, FlipStrategy, FlopStrategy},
        submission::{Completion, Key, Outcome, TxManager},
        vaults::{QueueScanner, VaultScanner},
    },
    alloy::{
        network::EthereumWallet,
        providers::{Provider, ProviderBuilder},
    },
    alloy_primitives::{Address, U256},
    alloy_signer_local::PrivateKeySigner,
    anyhow::{anyhow, Context, Result},
    dss::{node::BlockInfo, Addresses, AuctionKind, Deployment, Ledger, Node, TokenJoin, TokenView},
    observe::metrics::LivenessChecking,
    std::{
        sync::{Arc, RwLock},
        time::{Duration, Instant},
    },
    tracing::Instrument,
};

/// How long draining waits for settlements and shutdown rebalancing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
/// How long startup waits for approval transactions.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

/// Unrecoverable startup failures, mapped onto the process exit codes.
#[derive(Debug)]
pub enum Fatal {
    Config(anyhow::Error),
    Signing(anyhow::Error),
    Node(anyhow::Error),
    Contract(anyhow::Error),
}

impl Fatal {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Signing(_) | Self::Node(_) => 2,
            Self::Contract(_) => 3,
        }
    }

    pub fn error(&self) -> &anyhow::Error {
        match self {
            Self::Config(err) | Self::Signing(err) | Self::Node(err) | Self::Contract(err) => err,
        }
    }
}

/// The keeper's transition out of the Running state: resolves once the
/// operator asks it to stop, by OS signal or by a manual trigger.
pub struct Shutdown(tokio::sync::oneshot::Receiver<()>);

impl Shutdown {
    /// Armed on SIGINT and, on unix, SIGTERM.
    pub fn on_signal() -> Self {
        let (trigger, shutdown) = Self::manual();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, draining"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, draining"),
                }
            }
            #[cfg(not(unix))]
            {
                tokio::signal::ctrl_c()
                    .await
                    .expect("install CTRL+C handler");
                tracing::info!("received SIGINT, draining");
            }
            let _ = trigger.send(());
        });
        shutdown
    }

    /// A manually triggered variant for tests and embedding; sending on the
    /// returned channel stops the keeper.
    pub fn manual() -> (tokio::sync::oneshot::Sender<()>, Self) {
        let (trigger, receiver) = tokio::sync::oneshot::channel();
        (trigger, Self(receiver))
    }

    async fn requested(&mut self) {
        let _ = (&mut self.0).await;
    }
}

/// Fails liveness when no scan completed within the window.
pub struct Liveness {
    max_scan_age: Duration,
    last_scan: RwLock<Instant>,
}

impl Liveness {
    fn new(max_scan_age: Duration) -> Self {
        Self {
            max_scan_age,
            last_scan: RwLock::new(Instant::now()),
        }
    }

    fn scan_completed(&self) {
        *self.last_scan.write().unwrap() = Instant::now();
    }
}

#[async_trait::async_trait]
impl LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        self.last_scan.read().unwrap().elapsed() <= self.max_scan_age
    }
}

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "keeper")]
struct Metrics {
    /// Number of seconds the keeper has been running for.
    seconds_alive: prometheus::IntGauge,
    /// Auctions currently tracked with a live model.
    active_auctions: prometheus::IntGauge,
    /// Finished submissions by outcome.
    #[metric(labels("outcome"))]
    submissions: prometheus::IntCounterVec,
    /// Full scans completed.
    scans: prometheus::IntCounter,
}

pub async fn run(args: Arguments) -> Result<(), Fatal> {
    let password = args.keystore_password().map_err(Fatal::Config)?;
    let signer = PrivateKeySigner::decrypt_keystore(&args.eth_keyfile, password)
        .map_err(|err| Fatal::Signing(anyhow!(err).context("unlock keystore")))?;
    if signer.address() != args.eth_from {
        return Err(Fatal::Config(anyhow!(
            "--eth-from {} does not match the keystore account {}",
            args.eth_from,
            signer.address()
        )));
    }
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http(args.rpc_url.clone())
        .erased();
    let addresses = Addresses::load(&args.addresses).map_err(Fatal::Config)?;
    let deployment = Deployment::connect(
        provider,
        addresses,
        args.auction_type,
        args.ilk.as_deref(),
        args.rpc_timeout,
    )
    .await
    .map_err(Fatal::Contract)?;

    let mut keeper = Keeper::new(&args, deployment).map_err(Fatal::Config)?;
    tokio::spawn(observe::metrics::serve(
        keeper.liveness.clone(),
        args.metrics_address,
    ));

    keeper.startup().await.map_err(Fatal::Contract)?;
    keeper.main_loop(Shutdown::on_signal()).await;
    keeper.drain().await;
    tracing::info!("keeper terminated cleanly");
    Ok(())
}

pub struct Keeper {
    kind: AuctionKind,
    our_address: Address,
    gas_reservation: U256,
    block_check_interval: Duration,
    bid_check_interval: Duration,
    node: Arc<dyn Node>,
    ledger: Arc<dyn Ledger>,
    dai_join: Arc<dyn TokenJoin>,
    gem_join: Option<Arc<dyn TokenJoin>>,
    gov: Option<Arc<dyn TokenView>>,
    auction_house: Address,
    registry: Registry,
    vault_scanner: Option<VaultScanner>,
    queue_scanner: Option<QueueScanner>,
    rebalancer: Rebalancer,
    txmgr: TxManager,
    metrics: &'static Metrics,
    liveness: Arc<Liveness>,
    started: Instant,
    last_block: u64,
}

impl Keeper {
    pub fn new(args: &Arguments, deployment: Deployment) -> Result<Self> {
        let our_address = args.eth_from;
        let ilk_id = args.ilk.as_deref().map(dss::ilk_id);

        let (strategy, auction_house): (Arc<dyn AuctionStrategy>, Address) =
            match args.auction_type {
                AuctionKind::Flip => {
                    let flipper = deployment.flipper.clone().context("flipper missing")?;
                    (Arc::new(FlipStrategy { flipper: flipper.clone() }), flipper.address())
                }
                AuctionKind::Flap => {
                    let flapper = deployment.flapper.clone().context("flapper missing")?;
                    (Arc::new(FlapStrategy { flapper: flapper.clone() }), flapper.address())
                }
                AuctionKind::Flop => {
                    let flopper = deployment.flopper.clone().context("flopper missing")?;
                    (Arc::new(FlopStrategy { flopper: flopper.clone() }), flopper.address())
                }
                AuctionKind::Clip => {
                    let clipper = deployment.clipper.clone().context("clipper missing")?;
                    (
                        Arc::new(ClipStrategy {
                            clipper: clipper.clone(),
                            our_address,
                        }),
                        clipper.address(),
                    )
                }
            };

        let model_factory = ModelFactory::new(&args.model, args.model_retries)?;
        let registry = Registry::new(
            strategy,
            model_factory,
            deployment.ledger.clone(),
            deployment.dai_join.clone(),
            deployment.gov.clone(),
            our_address,
            args.min_auction,
            args.max_auctions,
            args.bid_delay,
        );

        let vault_scanner = match (args.auction_type, args.bid_only) {
            (AuctionKind::Flip | AuctionKind::Clip, false) => Some(VaultScanner::new(
                deployment.ledger.clone(),
                deployment.liquidator.clone().context("liquidator missing")?,
                deployment.history.clone(),
                ilk_id.context("ilk missing")?,
                our_address,
                args.from_block,
            )),
            _ => None,
        };
        let queue_scanner = match (args.auction_type, args.bid_only) {
            (AuctionKind::Flap | AuctionKind::Flop, false) => Some(QueueScanner::new(
                deployment.vow.clone(),
                deployment.history.clone(),
                args.from_block,
            )),
            _ => None,
        };

        let rebalancer = Rebalancer::new(
            deployment.ledger.clone(),
            deployment.dai_join.clone(),
            deployment.gem_join.clone(),
            ilk_id,
            our_address,
            args.vat_dai_target,
            args.return_gem_interval,
            !args.keep_dai_in_vat_on_exit,
            !args.keep_gem_in_vat_on_exit,
        );

        let txmgr = TxManager::new(
            deployment.node.clone(),
            our_address,
            args.gas_config(),
            args.bid_check_interval,
        );

        Ok(Self {
            kind: args.auction_type,
            our_address,
            gas_reservation: U256::from(args.gas_reservation),
            block_check_interval: args.block_check_interval,
            bid_check_interval: args.bid_check_interval,
            node: deployment.node.clone(),
            ledger: deployment.ledger.clone(),
            dai_join: deployment.dai_join.clone(),
            gem_join: deployment.gem_join.clone(),
            gov: deployment.gov.clone(),
            auction_house,
            registry,
            vault_scanner,
            queue_scanner,
            rebalancer,
            txmgr,
            metrics: Metrics::instance(observe::metrics::get_registry())
                .expect("metrics registration"),
            liveness: Arc::new(Liveness::new(args.block_check_interval * 10)),
            started: Instant::now(),
            last_block: 0,
        })
    }

    /// One-time authorizations bidding and rebalancing require, plus a
    /// warning if the keeper starts without any stablecoin to bid.
    pub async fn startup(&mut self) -> Result<()> {
        let us = self.our_address;
        for target in [self.auction_house, self.dai_join.address()] {
            if !self.ledger.can(us, target).await? {
                tracing::info!(%target, "authorizing vat access");
                self.txmgr
                    .submit(Key::Approve(target), self.ledger.hope(target), None);
            }
        }
        if !self.dai_join.approved(us).await? {
            let adapter = self.dai_join.address();
            tracing::info!(%adapter, "approving stablecoin adapter");
            self.txmgr
                .submit(Key::Approve(adapter), self.dai_join.approve(), None);
        }
        if let Some(gem_join) = &self.gem_join {
            if !gem_join.approved(us).await? {
                let adapter = gem_join.address();
                tracing::info!(%adapter, "approving collateral adapter");
                self.txmgr
                    .submit(Key::Approve(adapter), gem_join.approve(), None);
            }
        }
        if self.kind == AuctionKind::Flap {
            if let Some(gov) = &self.gov {
                if !gov.approved(us, self.auction_house).await? {
                    tracing::info!("approving governance token for surplus bids");
                    self.txmgr.submit(
                        Key::Approve(self.auction_house),
                        gov.approve(self.auction_house),
                        None,
                    );
                }
            }
        }
        let deadline = Instant::now() + APPROVAL_TIMEOUT;
        while self.txmgr.pending_count() > 0 && Instant::now() < deadline {
            if let Ok(done) =
                tokio::time::timeout(Duration::from_secs(1), self.txmgr.next_completion()).await
            {
                tracing::info!(key = ?done.key, outcome = ?done.outcome, "approval finished");
            }
        }
        anyhow::ensure!(
            self.txmgr.pending_count() == 0,
            "approvals were not confirmed in time"
        );

        let vat = self.ledger.dai(us).await?;
        let token = self.dai_join.token_balance(us).await?;
        if vat.is_zero() && token.is_zero() {
            tracing::warn!("keeper holds no stablecoin; it can kick but never win a bid");
        }
        Ok(())
    }

    /// Running state: full scans per block, stance re-polls in between.
    pub async fn main_loop(&mut self, mut shutdown: Shutdown) {
        let mut block_timer = tokio::time::interval(self.block_check_interval);
        let mut bid_timer = tokio::time::interval(self.bid_check_interval);
        loop {
            tokio::select! {
                _ = shutdown.requested() => {
                    tracing::info!("shutting down");
                    break;
                }
                _ = block_timer.tick() => {
                    match self.node.latest_block().await {
                        Ok(block) if block.number > self.last_block => {
                            self.last_block = block.number;
                            self.full_scan(block)
                                .instrument(tracing::info_span!("scan", block = block.number))
                                .await;
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(?err, "failed to read latest block"),
                    }
                }
                _ = bid_timer.tick() => {
                    self.registry.check_for_bids(&mut self.txmgr).await;
                }
            }
            while let Some(done) = self.txmgr.try_completion() {
                self.handle_completion(done).await;
            }
            self.metrics
                .seconds_alive
                .set(i64::try_from(self.started.elapsed().as_secs()).unwrap_or(i64::MAX));
        }
    }

    async fn full_scan(&mut self, block: BlockInfo) {
        if !self.gas_reservation.is_zero() {
            match self.node.eth_balance(self.our_address).await {
                Ok(balance) if balance < self.gas_reservation => {
                    tracing::warn!(
                        %balance,
                        reservation = %self.gas_reservation,
                        "ETH below the gas reservation, pausing bids"
                    );
                    self.registry.set_bidding(false);
                }
                Ok(_) => self.registry.set_bidding(true),
                Err(err) => tracing::warn!(?err, "failed to read ETH balance"),
            }
        }
        if let Some(scanner) = &mut self.vault_scanner {
            scanner.check_vaults(block, &mut self.txmgr).await;
        }
        if let Some(queue) = &mut self.queue_scanner {
            match self.kind {
                AuctionKind::Flap => queue.check_flap(&mut self.txmgr).await,
                AuctionKind::Flop => queue.check_flop(block, &mut self.txmgr).await,
                _ => {}
            }
        }
        self.registry
            .check_all_auctions(block, &mut self.txmgr)
            .await;
        self.rebalancer.rebalance_dai(&mut self.txmgr).await;
        self.rebalancer.return_gems(&mut self.txmgr).await;
        self.liveness.scan_completed();
        self.metrics.scans.inc();
        self.metrics
            .active_auctions
            .set(i64::try_from(self.registry.live_auctions()).unwrap_or(i64::MAX));
    }

    async fn handle_completion(&mut self, done: Completion) {
        let label = match &done.outcome {
            Outcome::Mined(_) => "mined",
            Outcome::Reverted(_) => "reverted",
            Outcome::Cancelled(_) => "cancelled",
            Outcome::Rejected(_) => "rejected",
            Outcome::Failed(_) => "failed",
        };
        self.metrics.submissions.with_label_values(&[label]).inc();
        match &done.outcome {
            Outcome::Mined(receipt) => {
                tracing::info!(key = ?done.key, block = receipt.block_number, "transaction mined")
            }
            Outcome::Cancelled(_) => tracing::info!(key = ?done.key, "submission cancelled"),
            Outcome::Reverted(receipt) => tracing::error!(
                key = ?done.key,
                tx = %receipt.transaction_hash,
                "transaction reverted on-chain"
            ),
            Outcome::Rejected(reason) => {
                tracing::warn!(key = ?done.key, reason, "submission rejected, skipping this round")
            }
            Outcome::Failed(reason) => {
                tracing::error!(key = ?done.key, reason, "submission failed")
            }
        }
        self.registry.on_completion(done.key, &done.outcome).await;
    }

    /// Draining: refuse new bids, settle what we won, cancel the rest,
    /// terminate models and run shutdown rebalancing.
    pub async fn drain(&mut self) {
        tracing::info!("draining");
        self.registry.drain(&mut self.txmgr).await;
        self.rebalancer.on_shutdown(&mut self.txmgr).await;
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.txmgr.pending_count() > 0 && Instant::now() < deadline {
            if let Ok(done) =
                tokio::time::timeout(Duration::from_secs(1), self.txmgr.next_completion()).await
            {
                self.handle_completion(done).await;
            }
        }
        self.txmgr.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use {
        crate::{gas::GasConfig, strategy::MockAuctionStrategy},
        alloy_primitives::{keccak256, B256},
        dss::{Auction, Call, Details, MockLedger, MockTokenJoin, Receipt, SendError, TxSpec},
        number::Rad,
        std::{
            io::Write,
            os::unix::fs::PermissionsExt,
            sync::{
                atomic::{AtomicU64, Ordering},
                Mutex,
            },
        },
    };

    /// A node whose chain height grows on every poll and which only mines
    /// transactions aimed at the listed recipients.
    struct StubNode {
        sent: Mutex<Vec<TxSpec>>,
        height: AtomicU64,
        mine_to: Vec<Address>,
    }

    impl StubNode {
        fn new(mine_to: Vec<Address>) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                height: AtomicU64::new(0),
                mine_to,
            })
        }

        fn sent(&self) -> Vec<TxSpec> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn tx_hash(tx: &TxSpec) -> B256 {
        keccak256(
            [
                tx.data.to_vec(),
                tx.to.to_vec(),
                tx.gas_price.to_be_bytes::<32>().to_vec(),
            ]
            .concat(),
        )
    }

    #[async_trait::async_trait]
    impl Node for StubNode {
        async fn latest_block(&self) -> Result<BlockInfo> {
            Ok(BlockInfo {
                number: self.height.fetch_add(1, Ordering::SeqCst) + 1,
                timestamp: 1000,
            })
        }

        async fn gas_price(&self) -> Result<U256> {
            Ok(U256::from(1000))
        }

        async fn eth_balance(&self, _address: Address) -> Result<U256> {
            Ok(U256::MAX)
        }

        async fn nonce(&self, _address: Address) -> Result<u64> {
            Ok(0)
        }

        async fn send(&self, tx: &TxSpec) -> std::result::Result<B256, SendError> {
            self.sent.lock().unwrap().push(tx.clone());
            Ok(tx_hash(tx))
        }

        async fn receipt(&self, hash: B256) -> Result<Option<Receipt>> {
            let sent = self.sent.lock().unwrap();
            Ok(sent
                .iter()
                .find(|tx| tx_hash(tx) == hash && self.mine_to.contains(&tx.to))
                .map(|tx| Receipt {
                    transaction_hash: hash,
                    block_number: 1,
                    successful: true,
                    effective_gas_price: tx.gas_price,
                }))
        }
    }

    fn us() -> Address {
        Address::repeat_byte(0x11)
    }

    fn deal_target() -> Address {
        Address::repeat_byte(0xde)
    }

    fn silent_model() -> ModelFactory {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\nsleep 30").unwrap();
        let path = file.into_temp_path();
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        let factory = ModelFactory::new(path.to_str().unwrap(), 3).unwrap();
        std::mem::forget(path);
        factory
    }

    fn flap(id: u64, guy: Address, tic: u64) -> Auction {
        Auction {
            id,
            guy,
            tic,
            end: 2000,
            era: 1000,
            details: Details::Flap {
                bid: number::Wad::ZERO,
                lot: "50000".parse().unwrap(),
                beg: "1.05".parse().unwrap(),
            },
        }
    }

    fn keeper(strategy: MockAuctionStrategy, node: Arc<StubNode>) -> Keeper {
        let mut ledger = MockLedger::new();
        ledger.expect_dai().returning(|_| Ok(Rad::ZERO));
        let ledger: Arc<dyn Ledger> = Arc::new(ledger);
        let dai_join: Arc<dyn TokenJoin> = Arc::new(MockTokenJoin::new());
        let registry = Registry::new(
            Arc::new(strategy),
            silent_model(),
            ledger.clone(),
            dai_join.clone(),
            None,
            us(),
            1,
            100,
            Duration::ZERO,
        );
        let rebalancer = Rebalancer::new(
            ledger.clone(),
            dai_join.clone(),
            None,
            None,
            us(),
            None,
            Duration::from_secs(300),
            false,
            false,
        );
        let txmgr = TxManager::new(
            node.clone(),
            us(),
            GasConfig::default(),
            Duration::from_millis(10),
        );
        Keeper {
            kind: AuctionKind::Flap,
            our_address: us(),
            gas_reservation: U256::ZERO,
            block_check_interval: Duration::from_millis(50),
            bid_check_interval: Duration::from_millis(20),
            node: node.clone(),
            ledger,
            dai_join,
            gem_join: None,
            gov: None,
            auction_house: Address::repeat_byte(0xfa),
            registry,
            vault_scanner: None,
            queue_scanner: None,
            rebalancer,
            txmgr,
            metrics: Metrics::instance(observe::metrics::get_registry())
                .expect("metrics registration"),
            liveness: Arc::new(Liveness::new(Duration::from_secs(60))),
            started: Instant::now(),
            last_block: 0,
        }
    }

    #[tokio::test]
    async fn draining_settles_winners_and_cancels_the_rest() {
        let mut strategy = MockAuctionStrategy::new();
        strategy.expect_kicks().returning(|| Ok(2));
        // Auction 1 is ours, auction 2 belongs to someone else; both are
        // still live when the shutdown arrives.
        strategy.expect_fetch().returning(|id, _| {
            let guy = if id == 1 { us() } else { Address::repeat_byte(0x22) };
            Ok(flap(id, guy, 1500))
        });
        strategy.expect_kind().return_const(AuctionKind::Flap);
        strategy.expect_deal().times(1).returning(|id| {
            Some(Call {
                to: deal_target(),
                data: vec![u8::try_from(id).unwrap(); 4].into(),
            })
        });
        // Deals and cancellation self-transfers mine; the stale bid never
        // does, so only its replacement can win the nonce.
        let node = StubNode::new(vec![deal_target(), us()]);
        let mut keeper = keeper(strategy, node.clone());

        keeper
            .full_scan(BlockInfo {
                number: 100,
                timestamp: 1000,
            })
            .await;
        assert_eq!(keeper.registry.live_auctions(), 2);

        // A bid on the auction we are losing is still in flight.
        keeper.txmgr.submit(
            Key::Bid(2),
            Call {
                to: Address::repeat_byte(0xb1),
                data: vec![9; 4].into(),
            },
            None,
        );
        while node.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        keeper.drain().await;

        let sent = node.sent();
        assert!(
            sent.iter()
                .any(|tx| tx.to == deal_target() && tx.data.to_vec() == vec![1u8; 4]),
            "the won auction must be dealt: {sent:?}"
        );
        assert!(
            sent.iter().any(|tx| tx.to == us() && tx.data.is_empty()),
            "the losing bid must be cancelled by a self-transfer: {sent:?}"
        );
        assert_eq!(keeper.registry.live_auctions(), 0);
        assert_eq!(keeper.txmgr.pending_count(), 0);
    }

    #[tokio::test]
    async fn main_loop_scans_new_blocks_until_told_to_stop() {
        let mut strategy = MockAuctionStrategy::new();
        strategy.expect_kicks().times(1..).returning(|| Ok(0));
        strategy.expect_kind().return_const(AuctionKind::Flap);
        let node = StubNode::new(Vec::new());
        let mut keeper = keeper(strategy, node.clone());

        let (trigger, shutdown) = Shutdown::manual();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = trigger.send(());
        });
        keeper.main_loop(shutdown).await;

        assert!(keeper.last_block > 0, "the block timer must drive scans");
        keeper.drain().await;
    }
}
