use {
    alloy_primitives::{Address, Bytes, B256},
    number::{Rad, Ray, Wad},
    std::fmt,
};

/// Converts a collateral name like `"VLX-A"` into its on-chain `bytes32`
/// identifier (ASCII, right-padded with zeros).
pub fn ilk_id(name: &str) -> B256 {
    let mut id = [0u8; 32];
    let bytes = name.as_bytes();
    assert!(bytes.len() <= 32, "collateral name longer than 32 bytes");
    id[..bytes.len()].copy_from_slice(bytes);
    B256::from(id)
}

/// The four auction families the keeper can participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionKind {
    /// Collateral-for-stablecoin English auction in two phases.
    Flip,
    /// Collateral-for-stablecoin continuous Dutch auction.
    Clip,
    /// Surplus auction: stablecoin lot, governance-token bids.
    Flap,
    /// Debt auction: fixed stablecoin bid, shrinking governance-token lot.
    Flop,
}

impl std::str::FromStr for AuctionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flip" => Ok(Self::Flip),
            "clip" => Ok(Self::Clip),
            "flap" => Ok(Self::Flap),
            "flop" => Ok(Self::Flop),
            other => anyhow::bail!("unknown auction type {other:?}"),
        }
    }
}

impl fmt::Display for AuctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Flip => "flip",
            Self::Clip => "clip",
            Self::Flap => "flap",
            Self::Flop => "flop",
        };
        f.write_str(name)
    }
}

/// A vault: locked collateral and normalized debt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Urn {
    pub ink: Wad,
    pub art: Wad,
}

/// Per-collateral parameters read from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ilk {
    pub id: B256,
    /// Debt multiplier accumulating stability fees.
    pub rate: Ray,
    /// Price with safety margin applied.
    pub spot: Ray,
    /// Debt ceiling.
    pub line: Rad,
    /// Minimum vault debt.
    pub dust: Rad,
}

impl Ilk {
    /// A vault is safe while its debt is covered by collateral at the
    /// margin-adjusted price.
    pub fn is_safe(&self, urn: &Urn) -> bool {
        urn.art * self.rate <= urn.ink * self.spot
    }
}

/// An unsigned contract invocation, ready for the transaction manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub data: Bytes,
}

/// Bid-relevant auction state, merged from the contract's per-id storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auction {
    pub id: u64,
    /// Current high bidder; the zero address before the first bid.
    pub guy: Address,
    /// Per-bid expiry timestamp, zero until the first bid.
    pub tic: u64,
    /// Absolute auction expiry timestamp.
    pub end: u64,
    /// Block timestamp at which this snapshot was taken.
    pub era: u64,
    pub details: Details,
}

/// The kind-specific quantities of an auction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Details {
    Flip {
        bid: Rad,
        lot: Wad,
        /// Stablecoin amount the auction is recovering; the tend phase ends
        /// when `bid == tab`.
        tab: Rad,
        beg: Wad,
    },
    Flap {
        /// Governance-token bid.
        bid: Wad,
        /// Stablecoin lot.
        lot: Rad,
        beg: Wad,
    },
    Flop {
        /// Stablecoin bid, fixed at kick time.
        bid: Rad,
        /// Governance-token lot, shrinking with each bid.
        lot: Wad,
        beg: Wad,
    },
    Clip {
        needs_redo: bool,
        /// Current Dutch price from the contract's decay curve.
        price: Ray,
        lot: Wad,
        tab: Rad,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Bid-raising phase (flip before `bid == tab`, and all flap bidding).
    Tend,
    /// Lot-reducing phase (flip after `bid == tab`, and all flop bidding).
    Dent,
    /// Dutch take phase (clip only).
    Take,
    /// Bidding is over; the auction awaits `deal` or restart.
    Expired,
    /// Terminal: the contract has deleted the record.
    Dealt,
}

impl Auction {
    pub fn kind(&self) -> AuctionKind {
        match self.details {
            Details::Flip { .. } => AuctionKind::Flip,
            Details::Flap { .. } => AuctionKind::Flap,
            Details::Flop { .. } => AuctionKind::Flop,
            Details::Clip { .. } => AuctionKind::Clip,
        }
    }

    pub fn phase(&self, now: u64) -> Phase {
        match &self.details {
            Details::Clip { lot, tab, .. } => {
                if lot.is_zero() && tab.is_zero() {
                    Phase::Dealt
                } else {
                    Phase::Take
                }
            }
            Details::Flip { lot, tab, bid, .. } => {
                if lot.is_zero() && tab.is_zero() {
                    Phase::Dealt
                } else if self.finished(now) {
                    Phase::Expired
                } else if bid < tab {
                    Phase::Tend
                } else {
                    Phase::Dent
                }
            }
            Details::Flap { lot, .. } => {
                if lot.is_zero() && self.guy == Address::ZERO {
                    Phase::Dealt
                } else if self.finished(now) {
                    Phase::Expired
                } else {
                    Phase::Tend
                }
            }
            Details::Flop { lot, .. } => {
                if lot.is_zero() && self.guy == Address::ZERO {
                    Phase::Dealt
                } else if self.finished(now) {
                    Phase::Expired
                } else {
                    Phase::Dent
                }
            }
        }
    }

    /// Whether bidding is over, either because the last bid's expiry passed
    /// or because the auction itself ran out.
    pub fn finished(&self, now: u64) -> bool {
        (self.tic != 0 && now > self.tic) || now > self.end
    }

    /// Whether nobody has bid yet.
    pub fn no_bids(&self) -> bool {
        self.tic == 0
    }

    /// The implied price of the current state, stablecoin per token, used
    /// for the model status feed. `None` when a division is undefined.
    pub fn price(&self) -> Option<Wad> {
        match &self.details {
            Details::Flip { bid, lot, .. } | Details::Flop { bid, lot, .. } => {
                (!lot.is_zero()).then(|| bid.to_wad() / *lot)
            }
            Details::Flap { bid, lot, .. } => {
                // Reciprocal: stablecoin lot per governance-token bid.
                (!bid.is_zero()).then(|| lot.to_wad() / *bid)
            }
            Details::Clip { price, .. } => Some(price.to_wad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flip(bid: &str, tab: &str, tic: u64, end: u64) -> Auction {
        Auction {
            id: 1,
            guy: Address::ZERO,
            tic,
            end,
            era: 1000,
            details: Details::Flip {
                bid: bid.parse().unwrap(),
                lot: "1.2".parse().unwrap(),
                tab: tab.parse().unwrap(),
                beg: "1.05".parse().unwrap(),
            },
        }
    }

    #[test]
    fn ilk_ids_are_ascii_padded() {
        let id = ilk_id("VLX-A");
        assert_eq!(&id[..5], b"VLX-A");
        assert!(id[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn flip_phase_transitions_at_tab() {
        assert_eq!(flip("50", "100", 0, 2000).phase(1000), Phase::Tend);
        assert_eq!(flip("100", "100", 0, 2000).phase(1000), Phase::Dent);
    }

    #[test]
    fn passed_bid_expiry_finishes_the_auction() {
        assert_eq!(flip("50", "100", 900, 2000).phase(1000), Phase::Expired);
        assert_eq!(flip("50", "100", 1100, 2000).phase(1000), Phase::Tend);
        assert_eq!(flip("50", "100", 0, 900).phase(1000), Phase::Expired);
    }

    #[test]
    fn deleted_records_are_dealt() {
        let mut dealt = flip("0", "0", 0, 2000);
        dealt.details = Details::Flip {
            bid: Rad::ZERO,
            lot: Wad::ZERO,
            tab: Rad::ZERO,
            beg: Wad::ZERO,
        };
        assert_eq!(dealt.phase(1000), Phase::Dealt);
    }

    #[test]
    fn status_price_is_bid_over_lot() {
        let auction = flip("60", "100", 0, 2000);
        assert_eq!(auction.price().unwrap(), "50".parse().unwrap());
    }
}
