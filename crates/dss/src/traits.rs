//! The trait seams the keeper core consumes. Production implementations live
//! in [`crate::deployment`]; tests use the generated mocks (behind the
//! `test-util` feature).

use {
    crate::types::{Call, Ilk, Urn},
    alloy_primitives::{Address, B256},
    anyhow::Result,
    number::{Rad, Wad},
};

/// Read access to the vat plus the authorization call it takes to bid.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn dai(&self, usr: Address) -> Result<Rad>;
    async fn sin(&self, usr: Address) -> Result<Rad>;
    async fn gem(&self, ilk: B256, usr: Address) -> Result<Wad>;
    async fn urn(&self, ilk: B256, usr: Address) -> Result<Urn>;
    async fn ilk(&self, ilk: B256) -> Result<Ilk>;
    /// Whether `usr` may manipulate `bit`'s balances.
    async fn can(&self, bit: Address, usr: Address) -> Result<bool>;
    fn hope(&self, usr: Address) -> Call;
    fn address(&self) -> Address;
}

/// The liquidation engine for the configured collateral: `cat` for flip
/// keepers, `dog` for clip keepers.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait Liquidator: Send + Sync {
    /// Whether kicking this vault is currently possible. The dust guard is
    /// always applied; engine-specific room limits are checked where the
    /// contract exposes them.
    async fn can_kick(&self, ilk: &Ilk, urn: &Urn) -> Result<bool>;
    fn kick(&self, ilk: B256, urn_owner: Address, keeper: Address) -> Call;
    /// The auction contract this engine kicks into, per its ilk registry.
    async fn auction_contract(&self, ilk: B256) -> Result<Address>;
}

/// Aggregate surplus/debt state of the vow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VowState {
    /// Stablecoin held by the vow (`vat.dai(vow)`).
    pub joy: Rad,
    /// Total debt booked against the vow (`vat.sin(vow)`).
    pub awe: Rad,
    /// Debt still queued by era (`vow.Sin`).
    pub queued: Rad,
    /// Debt currently on flop auctions (`vow.Ash`).
    pub on_auction: Rad,
    /// Surplus auction lot size.
    pub bump: Rad,
    /// Surplus buffer that must remain after a flap.
    pub hump: Rad,
    /// Debt auction bid size.
    pub sump: Rad,
    /// Seconds a queued debt era must age before it can be flogged.
    pub wait: u64,
}

impl VowState {
    /// Debt that is neither queued nor on auction, available to heal or
    /// flop against.
    pub fn woe(&self) -> Rad {
        self.awe - self.queued - self.on_auction
    }

    /// Whether a surplus auction can be kicked once outstanding woe is
    /// healed away.
    pub fn can_flap(&self) -> bool {
        self.joy >= self.awe + self.bump + self.hump && self.woe().is_zero()
    }

    /// Whether a debt auction can be kicked once surplus is healed away.
    pub fn can_flop(&self) -> bool {
        self.woe() >= self.sump && self.joy.is_zero()
    }
}

/// The vow: the system's surplus and debt imbalance queues.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait Imbalances: Send + Sync {
    async fn state(&self) -> Result<VowState>;
    /// Debt queued under the era of a particular liquidation.
    async fn queued_debt(&self, era: u64) -> Result<Rad>;
    fn heal(&self, amount: Rad) -> Call;
    fn flog(&self, era: u64) -> Call;
    fn kick_flap(&self) -> Call;
    fn kick_flop(&self) -> Call;
    fn address(&self) -> Address;
}

/// A token adapter (stablecoin or collateral) moving balances between the
/// ERC-20 and the vat ledger, plus the token-side reads the rebalancer
/// needs. Amounts are normalized `Wad`s regardless of the token's decimals.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait TokenJoin: Send + Sync {
    async fn token_balance(&self, usr: Address) -> Result<Wad>;
    async fn approved(&self, usr: Address) -> Result<bool>;
    fn approve(&self) -> Call;
    fn join(&self, usr: Address, amount: Wad) -> Call;
    fn exit(&self, usr: Address, amount: Wad) -> Call;
    fn address(&self) -> Address;
}

/// Balance reads on a plain token that is never joined into the vat, such
/// as the governance token surplus auctions are bid with.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait TokenView: Send + Sync {
    async fn balance(&self, usr: Address) -> Result<Wad>;
    async fn approved(&self, usr: Address, spender: Address) -> Result<bool>;
    fn approve(&self, spender: Address) -> Call;
}

/// Event replay over the node's log index.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait::async_trait]
pub trait History: Send + Sync {
    /// Owners of vaults touched by `frob`/`fork` in the block range.
    async fn touched_urns(&self, ilk: B256, from_block: u64, to_block: u64)
        -> Result<Vec<Address>>;
    /// Timestamps of liquidations in the block range, the eras the vow
    /// queues debt under.
    async fn bite_timestamps(&self, from_block: u64, to_block: u64) -> Result<Vec<u64>>;
}
