//! Typed views of the collateral-debt-system contracts.
//!
//! The keeper core talks to the chain exclusively through the trait seams in
//! [`traits`]; the concrete implementations here wrap inline [`alloy::sol!`]
//! bindings over a [`alloy::providers::DynProvider`]. Domain quantities use
//! the fixed-point types from the `number` crate throughout; raw `U256`
//! never crosses into the keeper.

pub mod auctions;
mod bindings;
pub mod deployment;
pub mod node;
pub mod traits;
pub mod types;

pub use {
    deployment::{Addresses, Deployment},
    node::{BlockInfo, Node, Receipt, SendError, TxSpec},
    traits::{History, Imbalances, Ledger, Liquidator, TokenJoin, TokenView, VowState},
    types::{ilk_id, Auction, AuctionKind, Call, Details, Ilk, Phase, Urn},
};

#[cfg(feature = "test-util")]
pub use traits::{
    MockHistory, MockImbalances, MockLedger, MockLiquidator, MockTokenJoin, MockTokenView,
};
#[cfg(feature = "test-util")]
pub use node::MockNode;
