//! Per-kind bid computation behind one facade. The arithmetic lives in pure
//! functions over auction snapshots so it can be tested without a chain; the
//! trait implementations attach the concrete contract calls.

use {
    crate::model::Stance,
    alloy_primitives::Address,
    anyhow::Result,
    dss::{
        auctions::{Clipper, Flapper, Flipper, Flopper},
        Auction, AuctionKind, Call, Details, Phase,
    },
    number::{Rad, Wad},
    std::sync::Arc,
};

/// The outcome of one bid computation.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Bid {
        call: Call,
        /// Vat stablecoin this bid consumes when it wins, reserved against
        /// the per-scan reservoir.
        cost: Rad,
        /// Governance tokens this bid consumes (flap only).
        gov_cost: Wad,
    },
    Skip(Skip),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// The model has not produced a usable price.
    NoStance,
    /// Our own bid already stands at or beyond what the model wants.
    AlreadyWinning,
    /// The computed bid does not clear the contract's increment rules.
    BelowIncrement,
    /// The Dutch price is still above what the model will pay.
    PriceTooLow,
    /// Bidding on this auction is over.
    Finished,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait AuctionStrategy: Send + Sync {
    fn kind(&self) -> AuctionKind;
    /// Highest auction id the contract has started.
    async fn kicks(&self) -> Result<u64>;
    async fn fetch(&self, id: u64, now: u64) -> Result<Auction>;
    /// Computes the bid the latest stance implies for this snapshot.
    fn plan(&self, auction: &Auction, stance: &Stance, our_address: Address) -> Plan;
    /// `None` for Dutch auctions, which settle within `take`.
    fn deal(&self, id: u64) -> Option<Call>;
    /// `tick` for English auctions, `redo` for Dutch ones.
    fn restart(&self, id: u64) -> Call;
    /// Per-bid ttl; zero for Dutch auctions.
    fn ttl(&self) -> u64;
}

pub struct FlipStrategy {
    pub flipper: Arc<Flipper>,
}

#[async_trait::async_trait]
impl AuctionStrategy for FlipStrategy {
    fn kind(&self) -> AuctionKind {
        AuctionKind::Flip
    }

    async fn kicks(&self) -> Result<u64> {
        self.flipper.kicks().await
    }

    async fn fetch(&self, id: u64, now: u64) -> Result<Auction> {
        self.flipper.auction(id, now).await
    }

    fn plan(&self, auction: &Auction, stance: &Stance, our_address: Address) -> Plan {
        match plan_flip(auction, stance, our_address) {
            FlipBid::Tend { lot, bid, cost } => Plan::Bid {
                call: self.flipper.tend(auction.id, lot, bid),
                cost,
                gov_cost: Wad::ZERO,
            },
            FlipBid::Dent { lot, bid, cost } => Plan::Bid {
                call: self.flipper.dent(auction.id, lot, bid),
                cost,
                gov_cost: Wad::ZERO,
            },
            FlipBid::Skip(skip) => Plan::Skip(skip),
        }
    }

    fn deal(&self, id: u64) -> Option<Call> {
        Some(self.flipper.deal(id))
    }

    fn restart(&self, id: u64) -> Call {
        self.flipper.tick(id)
    }

    fn ttl(&self) -> u64 {
        self.flipper.ttl()
    }
}

pub struct FlapStrategy {
    pub flapper: Arc<Flapper>,
}

#[async_trait::async_trait]
impl AuctionStrategy for FlapStrategy {
    fn kind(&self) -> AuctionKind {
        AuctionKind::Flap
    }

    async fn kicks(&self) -> Result<u64> {
        self.flapper.kicks().await
    }

    async fn fetch(&self, id: u64, now: u64) -> Result<Auction> {
        self.flapper.auction(id, now).await
    }

    fn plan(&self, auction: &Auction, stance: &Stance, our_address: Address) -> Plan {
        match plan_flap(auction, stance, our_address) {
            Ok((lot, bid)) => Plan::Bid {
                call: self.flapper.tend(auction.id, lot, bid),
                cost: Rad::ZERO,
                gov_cost: bid,
            },
            Err(skip) => Plan::Skip(skip),
        }
    }

    fn deal(&self, id: u64) -> Option<Call> {
        Some(self.flapper.deal(id))
    }

    fn restart(&self, id: u64) -> Call {
        self.flapper.tick(id)
    }

    fn ttl(&self) -> u64 {
        self.flapper.ttl()
    }
}

pub struct FlopStrategy {
    pub flopper: Arc<Flopper>,
}

#[async_trait::async_trait]
impl AuctionStrategy for FlopStrategy {
    fn kind(&self) -> AuctionKind {
        AuctionKind::Flop
    }

    async fn kicks(&self) -> Result<u64> {
        self.flopper.kicks().await
    }

    async fn fetch(&self, id: u64, now: u64) -> Result<Auction> {
        self.flopper.auction(id, now).await
    }

    fn plan(&self, auction: &Auction, stance: &Stance, our_address: Address) -> Plan {
        match plan_flop(auction, stance, our_address) {
            Ok((lot, bid, cost)) => Plan::Bid {
                call: self.flopper.dent(auction.id, lot, bid),
                cost,
                gov_cost: Wad::ZERO,
            },
            Err(skip) => Plan::Skip(skip),
        }
    }

    fn deal(&self, id: u64) -> Option<Call> {
        Some(self.flopper.deal(id))
    }

    fn restart(&self, id: u64) -> Call {
        self.flopper.tick(id)
    }

    fn ttl(&self) -> u64 {
        self.flopper.ttl()
    }
}

pub struct ClipStrategy {
    pub clipper: Arc<Clipper>,
    pub our_address: Address,
}

#[async_trait::async_trait]
impl AuctionStrategy for ClipStrategy {
    fn kind(&self) -> AuctionKind {
        AuctionKind::Clip
    }

    async fn kicks(&self) -> Result<u64> {
        self.clipper.kicks().await
    }

    async fn fetch(&self, id: u64, now: u64) -> Result<Auction> {
        self.clipper.auction(id, now).await
    }

    fn plan(&self, auction: &Auction, stance: &Stance, our_address: Address) -> Plan {
        match plan_clip(auction, stance) {
            Ok((amt, max, cost)) => Plan::Bid {
                call: self.clipper.take(auction.id, amt, max, our_address),
                cost,
                gov_cost: Wad::ZERO,
            },
            Err(skip) => Plan::Skip(skip),
        }
    }

    fn deal(&self, _id: u64) -> Option<Call> {
        None
    }

    fn restart(&self, id: u64) -> Call {
        self.clipper.redo(id, self.our_address)
    }

    fn ttl(&self) -> u64 {
        0
    }
}

#[derive(Debug, PartialEq)]
pub enum FlipBid {
    Tend { lot: Wad, bid: Rad, cost: Rad },
    Dent { lot: Wad, bid: Rad, cost: Rad },
    Skip(Skip),
}

/// Flip bidding. In the tend phase the bid is `lot · price` capped at `tab`
/// (the cap deliberately ignores the increment floor, so the auction can
/// transition into its lot-reducing phase); in the dent phase the lot is
/// `tab / price`.
pub fn plan_flip(auction: &Auction, stance: &Stance, our_address: Address) -> FlipBid {
    let Details::Flip { bid, lot, tab, beg } = &auction.details else {
        return FlipBid::Skip(Skip::Finished);
    };
    let Some(price) = stance.price.filter(|price| !price.is_zero()) else {
        return FlipBid::Skip(Skip::NoStance);
    };
    match auction.phase(auction.era) {
        Phase::Tend => {
            let our_bid = (*lot * price).to_rad().min(*tab);
            if our_bid <= *bid {
                return FlipBid::Skip(if auction.guy == our_address {
                    Skip::AlreadyWinning
                } else {
                    Skip::BelowIncrement
                });
            }
            if our_bid != *tab && our_bid < *bid * *beg {
                return FlipBid::Skip(Skip::BelowIncrement);
            }
            let cost = if auction.guy == our_address {
                our_bid - *bid
            } else {
                our_bid
            };
            FlipBid::Tend {
                lot: *lot,
                bid: our_bid,
                cost,
            }
        }
        Phase::Dent => {
            let our_lot = bid.to_wad() / price;
            if auction.guy == our_address && our_lot >= *lot {
                return FlipBid::Skip(Skip::AlreadyWinning);
            }
            if our_lot * *beg > *lot {
                return FlipBid::Skip(Skip::BelowIncrement);
            }
            let cost = if auction.guy == our_address {
                Rad::ZERO
            } else {
                *bid
            };
            FlipBid::Dent {
                lot: our_lot,
                bid: *bid,
                cost,
            }
        }
        _ => FlipBid::Skip(Skip::Finished),
    }
}

/// Flap bidding: we offer `lot / price` governance tokens for the
/// stablecoin lot.
pub fn plan_flap(
    auction: &Auction,
    stance: &Stance,
    our_address: Address,
) -> Result<(Rad, Wad), Skip> {
    let Details::Flap { bid, lot, beg } = &auction.details else {
        return Err(Skip::Finished);
    };
    let Some(price) = stance.price.filter(|price| !price.is_zero()) else {
        return Err(Skip::NoStance);
    };
    if auction.phase(auction.era) != Phase::Tend {
        return Err(Skip::Finished);
    }
    let our_bid = lot.to_wad() / price;
    if our_bid <= *bid {
        return Err(if auction.guy == our_address {
            Skip::AlreadyWinning
        } else {
            Skip::BelowIncrement
        });
    }
    if our_bid < *bid * *beg {
        return Err(Skip::BelowIncrement);
    }
    Ok((*lot, our_bid))
}

/// Flop bidding: we accept `bid / price` governance tokens for paying the
/// fixed stablecoin bid.
pub fn plan_flop(
    auction: &Auction,
    stance: &Stance,
    our_address: Address,
) -> Result<(Wad, Rad, Rad), Skip> {
    let Details::Flop { bid, lot, beg } = &auction.details else {
        return Err(Skip::Finished);
    };
    let Some(price) = stance.price.filter(|price| !price.is_zero()) else {
        return Err(Skip::NoStance);
    };
    if auction.phase(auction.era) != Phase::Dent {
        return Err(Skip::Finished);
    }
    let our_lot = bid.to_wad() / price;
    if our_lot >= *lot {
        return Err(if auction.guy == our_address {
            Skip::AlreadyWinning
        } else {
            Skip::BelowIncrement
        });
    }
    if our_lot * *beg > *lot {
        return Err(Skip::BelowIncrement);
    }
    let cost = if auction.guy == our_address {
        Rad::ZERO
    } else {
        *bid
    };
    Ok((our_lot, *bid, cost))
}

/// Clip taking: buy the full lot whenever the model price reaches the
/// contract's current Dutch price, reserving `lot · price`.
pub fn plan_clip(auction: &Auction, stance: &Stance) -> Result<(Wad, number::Ray, Rad), Skip> {
    let Details::Clip {
        needs_redo,
        price: clip_price,
        lot,
        tab,
    } = &auction.details
    else {
        return Err(Skip::Finished);
    };
    if *needs_redo {
        // A reset auction has no valid price; the registry issues the redo.
        return Err(Skip::Finished);
    }
    if lot.is_zero() && tab.is_zero() {
        return Err(Skip::Finished);
    }
    let Some(price) = stance.price.filter(|price| !price.is_zero()) else {
        return Err(Skip::NoStance);
    };
    let our_price = price.to_ray();
    if our_price < *clip_price {
        return Err(Skip::PriceTooLow);
    }
    Ok((*lot, our_price, *lot * *clip_price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use number::Ray;

    fn us() -> Address {
        Address::repeat_byte(0x11)
    }

    fn other() -> Address {
        Address::repeat_byte(0x22)
    }

    fn stance(price: &str) -> Stance {
        Stance {
            price: Some(price.parse().unwrap()),
            gas_price: None,
        }
    }

    fn flap(bid: &str, lot: &str, guy: Address) -> Auction {
        Auction {
            id: 1,
            guy,
            tic: 0,
            end: 2000,
            era: 1000,
            details: Details::Flap {
                bid: bid.parse().unwrap(),
                lot: lot.parse().unwrap(),
                beg: "1.05".parse().unwrap(),
            },
        }
    }

    fn flop(bid: &str, lot: &str, guy: Address) -> Auction {
        Auction {
            id: 1,
            guy,
            tic: 0,
            end: 2000,
            era: 1000,
            details: Details::Flop {
                bid: bid.parse().unwrap(),
                lot: lot.parse().unwrap(),
                beg: "1.05".parse().unwrap(),
            },
        }
    }

    fn flip(bid: &str, lot: &str, tab: &str, guy: Address) -> Auction {
        Auction {
            id: 1,
            guy,
            tic: 0,
            end: 2000,
            era: 1000,
            details: Details::Flip {
                bid: bid.parse().unwrap(),
                lot: lot.parse().unwrap(),
                tab: tab.parse().unwrap(),
                beg: "1.05".parse().unwrap(),
            },
        }
    }

    #[test]
    fn initial_flap_bid_is_lot_over_price() {
        // 50 000 stablecoin lot at a price of 10 is a 5 000 token bid.
        let auction = flap("0", "50000", Address::ZERO);
        let (lot, bid) = plan_flap(&auction, &stance("10.0"), us()).unwrap();
        assert_eq!(lot, "50000".parse().unwrap());
        assert_eq!(bid, "5000".parse().unwrap());
    }

    #[test]
    fn flap_respects_the_increment() {
        // 50000/10.2 = 4901.96… < 4800 * 1.05 = 5040.
        let auction = flap("4800", "50000", other());
        assert_eq!(
            plan_flap(&auction, &stance("10.2"), us()),
            Err(Skip::BelowIncrement)
        );
        // Our own standing bid is not outbid.
        let ours = flap("5000", "50000", us());
        assert_eq!(
            plan_flap(&ours, &stance("10.0"), us()),
            Err(Skip::AlreadyWinning)
        );
    }

    #[test]
    fn flop_overbid_shrinks_the_lot() {
        let auction = flop("50000", "50000", Address::ZERO);
        let (lot, bid, cost) = plan_flop(&auction, &stance("100.0"), us()).unwrap();
        assert_eq!(lot, "500".parse().unwrap());
        assert_eq!(bid, "50000".parse().unwrap());
        assert_eq!(cost, "50000".parse().unwrap());

        // The price moves to 110; the replacement lot is 50000/110.
        let auction = flop("50000", "500", us());
        let (lot, _, cost) = plan_flop(&auction, &stance("110.0"), us()).unwrap();
        assert_eq!(lot.to_string(), "454.545454545454545454");
        assert_eq!(cost, Rad::ZERO);
    }

    #[test]
    fn flip_tend_caps_at_tab_for_the_phase_transition() {
        // price · lot = 160 · 1.2 = 192 > tab = 100: tend exactly tab.
        let auction = flip("0", "1.2", "100", Address::ZERO);
        let FlipBid::Tend { lot, bid, cost } = plan_flip(&auction, &stance("160"), us()) else {
            panic!("expected a tend");
        };
        assert_eq!(lot, "1.2".parse().unwrap());
        assert_eq!(bid, "100".parse().unwrap());
        assert_eq!(cost, "100".parse().unwrap());

        // Next scan, bid == tab: dent at the true price, 100/160 = 0.625.
        let auction = flip("100", "1.2", "100", us());
        let FlipBid::Dent { lot, bid, cost } = plan_flip(&auction, &stance("160"), us()) else {
            panic!("expected a dent");
        };
        assert_eq!(lot, "0.625".parse().unwrap());
        assert_eq!(bid, "100".parse().unwrap());
        assert_eq!(cost, Rad::ZERO);
    }

    #[test]
    fn flip_tend_increment_rules() {
        // 40 * 1.05 = 42; a 41 bid (price ≈ 34.17) is below the increment.
        let auction = flip("40", "1.2", "100", other());
        assert_eq!(
            plan_flip(&auction, &stance("34.17"), us()),
            FlipBid::Skip(Skip::BelowIncrement)
        );
        // But a bid reaching tab is legal regardless of the increment.
        let FlipBid::Tend { bid, .. } = plan_flip(&auction, &stance("160"), us()) else {
            panic!("expected a tend");
        };
        assert_eq!(bid, "100".parse().unwrap());
    }

    #[test]
    fn flip_rebid_cost_is_the_difference_when_winning() {
        let auction = flip("50", "1.2", "100", us());
        let FlipBid::Tend { bid, cost, .. } = plan_flip(&auction, &stance("50"), us()) else {
            panic!("expected a tend");
        };
        assert_eq!(bid, "60".parse().unwrap());
        assert_eq!(cost, "10".parse().unwrap());
    }

    #[test]
    fn silent_model_never_bids() {
        let auction = flip("0", "1.2", "100", Address::ZERO);
        assert_eq!(
            plan_flip(&auction, &Stance::default(), us()),
            FlipBid::Skip(Skip::NoStance)
        );
    }

    #[test]
    fn clip_takes_once_the_curve_reaches_the_model_price() {
        let auction = Auction {
            id: 1,
            guy: Address::ZERO,
            tic: 0,
            end: 0,
            era: 1000,
            details: Details::Clip {
                needs_redo: false,
                price: Ray::from_integer(150),
                lot: "2".parse().unwrap(),
                tab: "400".parse().unwrap(),
            },
        };
        assert_eq!(plan_clip(&auction, &stance("140")), Err(Skip::PriceTooLow));

        let (amt, max, cost) = plan_clip(&auction, &stance("160")).unwrap();
        assert_eq!(amt, "2".parse().unwrap());
        assert_eq!(max, Ray::from_integer(160));
        // Reserves lot · clip_price = 2 · 150.
        assert_eq!(cost, "300".parse().unwrap());
    }
}
