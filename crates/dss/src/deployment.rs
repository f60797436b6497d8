//! Concrete, RPC-backed implementations of the trait seams, bundled into a
//! [`Deployment`] per configured auction type. Address wiring comes from a
//! JSON file; constraints between the addresses are validated here so that
//! misconfiguration fails before the first scan.

use {
    crate::{
        auctions::{Clipper, Flapper, Flipper, Flopper},
        bindings,
        node::{Node, RpcNode},
        traits::{
            History, Imbalances, Ledger, Liquidator, TokenJoin, TokenView, VowState,
        },
        types::{AuctionKind, Call, Ilk, Urn},
    },
    alloy::{
        providers::{DynProvider, Provider},
        rpc::types::Filter,
        sol_types::{SolCall, SolEvent},
    },
    alloy_primitives::{keccak256, Address, B256, U256},
    anyhow::{bail, Context, Result},
    number::{Rad, Ray, Wad},
    std::{collections::HashMap, path::Path, sync::Arc},
};

/// Contract addresses of one deployment, as shipped in the `--addresses`
/// JSON file.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Addresses {
    pub vat: Address,
    pub vow: Address,
    pub dai_join: Address,
    pub dai: Address,
    #[serde(default)]
    pub cat: Option<Address>,
    #[serde(default)]
    pub dog: Option<Address>,
    #[serde(default)]
    pub gov: Option<Address>,
    #[serde(default)]
    pub flipper: Option<Address>,
    #[serde(default)]
    pub flapper: Option<Address>,
    #[serde(default)]
    pub flopper: Option<Address>,
    #[serde(default)]
    pub clipper: Option<Address>,
    #[serde(default)]
    pub gem_join: Option<Address>,
    #[serde(default)]
    pub gem: Option<Address>,
}

impl Addresses {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read addresses file {}", path.display()))?;
        serde_json::from_str(&raw).context("parse addresses file")
    }
}

/// Everything the keeper needs to talk to one deployment, behind the trait
/// seams the core is written against.
pub struct Deployment {
    pub node: Arc<dyn Node>,
    pub ledger: Arc<dyn Ledger>,
    pub vow: Arc<dyn Imbalances>,
    pub history: Arc<dyn History>,
    pub dai_join: Arc<dyn TokenJoin>,
    pub gem_join: Option<Arc<dyn TokenJoin>>,
    pub gov: Option<Arc<dyn TokenView>>,
    pub liquidator: Option<Arc<dyn Liquidator>>,
    pub flipper: Option<Arc<Flipper>>,
    pub flapper: Option<Arc<Flapper>>,
    pub flopper: Option<Arc<Flopper>>,
    pub clipper: Option<Arc<Clipper>>,
}

impl Deployment {
    pub async fn connect(
        provider: DynProvider,
        addresses: Addresses,
        kind: AuctionKind,
        ilk: Option<&str>,
        rpc_timeout: std::time::Duration,
    ) -> Result<Self> {
        if addresses.flipper.is_some() && addresses.clipper.is_some() {
            bail!("both a flipper and a clipper are configured for this collateral; the two liquidation engines are mutually exclusive");
        }
        match kind {
            AuctionKind::Flip => {
                if addresses.flipper.is_none() || addresses.cat.is_none() {
                    bail!("flip keeper requires flipper and cat addresses");
                }
            }
            AuctionKind::Clip => {
                if addresses.clipper.is_none() || addresses.dog.is_none() {
                    bail!("clip keeper requires clipper and dog addresses");
                }
            }
            AuctionKind::Flap => {
                if addresses.flapper.is_none() || addresses.gov.is_none() {
                    bail!("flap keeper requires flapper and governance token addresses");
                }
            }
            AuctionKind::Flop => {
                if addresses.flopper.is_none() {
                    bail!("flop keeper requires a flopper address");
                }
            }
        }
        if matches!(kind, AuctionKind::Flip | AuctionKind::Clip) {
            if ilk.is_none() {
                bail!("{kind} keeper requires a collateral (--ilk)");
            }
            if addresses.gem_join.is_none() || addresses.gem.is_none() {
                bail!("{kind} keeper requires gem and gem join addresses");
            }
        }

        let flipper = match addresses.flipper {
            Some(address) => Some(Arc::new(Flipper::connect(address, provider.clone()).await?)),
            None => None,
        };
        let flapper = match addresses.flapper {
            Some(address) => Some(Arc::new(Flapper::connect(address, provider.clone()).await?)),
            None => None,
        };
        let flopper = match addresses.flopper {
            Some(address) => Some(Arc::new(Flopper::connect(address, provider.clone()).await?)),
            None => None,
        };
        let clipper = addresses
            .clipper
            .map(|address| Arc::new(Clipper::new(address, provider.clone())));

        let liquidator: Option<Arc<dyn Liquidator>> = match (addresses.cat, addresses.dog) {
            (Some(cat), None) => Some(Arc::new(CatEngine::new(cat, provider.clone()))),
            (None, Some(dog)) => Some(Arc::new(DogEngine::new(dog, provider.clone()))),
            (Some(_), Some(_)) => {
                bail!("both cat and dog are configured; the two liquidation engines are mutually exclusive")
            }
            (None, None) => None,
        };

        let gem_join = match (addresses.gem_join, addresses.gem) {
            (Some(join), Some(gem)) => Some(Arc::new(
                JoinAdapter::connect(join, gem, provider.clone(), None).await?,
            ) as Arc<dyn TokenJoin>),
            _ => None,
        };

        Ok(Self {
            node: Arc::new(RpcNode::new(provider.clone(), rpc_timeout)),
            ledger: Arc::new(VatLedger::new(addresses.vat, provider.clone())),
            vow: Arc::new(VowImbalances::new(
                addresses.vow,
                addresses.vat,
                provider.clone(),
            )),
            history: Arc::new(LogHistory::new(
                provider.clone(),
                addresses.vat,
                addresses.cat,
                addresses.dog,
            )),
            dai_join: Arc::new(
                JoinAdapter::connect(addresses.dai_join, addresses.dai, provider.clone(), Some(18))
                    .await?,
            ),
            gem_join,
            gov: addresses
                .gov
                .map(|gov| Arc::new(PlainToken::new(gov, provider.clone())) as Arc<dyn TokenView>),
            liquidator,
            flipper,
            flapper,
            flopper,
            clipper,
        })
    }

}

pub struct VatLedger {
    instance: bindings::VatInstance<DynProvider>,
}

impl VatLedger {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Vat::new(address, provider),
        }
    }
}

#[async_trait::async_trait]
impl Ledger for VatLedger {
    async fn dai(&self, usr: Address) -> Result<Rad> {
        Ok(Rad::from_raw(
            self.instance.dai(usr).call().await.context("vat dai")?,
        ))
    }

    async fn sin(&self, usr: Address) -> Result<Rad> {
        Ok(Rad::from_raw(
            self.instance.sin(usr).call().await.context("vat sin")?,
        ))
    }

    async fn gem(&self, ilk: B256, usr: Address) -> Result<Wad> {
        Ok(Wad::from_raw(
            self.instance
                .gem(ilk, usr)
                .call()
                .await
                .context("vat gem")?,
        ))
    }

    async fn urn(&self, ilk: B256, usr: Address) -> Result<Urn> {
        let urn = self
            .instance
            .urns(ilk, usr)
            .call()
            .await
            .context("vat urns")?;
        Ok(Urn {
            ink: Wad::from_raw(urn.ink),
            art: Wad::from_raw(urn.art),
        })
    }

    async fn ilk(&self, ilk: B256) -> Result<Ilk> {
        let out = self.instance.ilks(ilk).call().await.context("vat ilks")?;
        Ok(Ilk {
            id: ilk,
            rate: Ray::from_raw(out.rate),
            spot: Ray::from_raw(out.spot),
            line: Rad::from_raw(out.line),
            dust: Rad::from_raw(out.dust),
        })
    }

    async fn can(&self, bit: Address, usr: Address) -> Result<bool> {
        let can = self
            .instance
            .can(bit, usr)
            .call()
            .await
            .context("vat can")?;
        Ok(can == U256::from(1))
    }

    fn hope(&self, usr: Address) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Vat::hopeCall { usr }.abi_encode().into(),
        }
    }

    fn address(&self) -> Address {
        *self.instance.address()
    }
}

/// The pre-liquidation-2.0 engine: `cat.bite` kicking flip auctions.
pub struct CatEngine {
    instance: bindings::CatInstance<DynProvider>,
}

impl CatEngine {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Cat::new(address, provider),
        }
    }
}

#[async_trait::async_trait]
impl Liquidator for CatEngine {
    async fn can_kick(&self, ilk: &Ilk, urn: &Urn) -> Result<bool> {
        // The box-room limit is not readable through this interface; a bite
        // racing the box simply reverts and is retried next scan.
        Ok(!ilk.is_safe(urn) && !urn.art.is_zero() && urn.art * ilk.rate >= ilk.dust)
    }

    fn kick(&self, ilk: B256, urn_owner: Address, _keeper: Address) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Cat::biteCall {
                ilk,
                urn: urn_owner,
            }
            .abi_encode()
            .into(),
        }
    }

    async fn auction_contract(&self, ilk: B256) -> Result<Address> {
        let out = self.instance.ilks(ilk).call().await.context("cat ilks")?;
        Ok(out.flip)
    }
}

/// The liquidation-2.0 engine: `dog.bark` kicking clip auctions.
pub struct DogEngine {
    instance: bindings::DogInstance<DynProvider>,
}

impl DogEngine {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Dog::new(address, provider),
        }
    }
}

#[async_trait::async_trait]
impl Liquidator for DogEngine {
    async fn can_kick(&self, ilk: &Ilk, urn: &Urn) -> Result<bool> {
        if ilk.is_safe(urn) || urn.art.is_zero() || urn.art * ilk.rate < ilk.dust {
            return Ok(false);
        }
        let hole = Rad::from_raw(self.instance.Hole().call().await.context("dog Hole")?);
        let dirt = Rad::from_raw(self.instance.Dirt().call().await.context("dog Dirt")?);
        if dirt >= hole {
            return Ok(false);
        }
        let out = self
            .instance
            .ilks(ilk.id)
            .call()
            .await
            .context("dog ilks")?;
        Ok(Rad::from_raw(out.dirt) < Rad::from_raw(out.hole))
    }

    fn kick(&self, ilk: B256, urn_owner: Address, keeper: Address) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Dog::barkCall {
                ilk,
                urn: urn_owner,
                kpr: keeper,
            }
            .abi_encode()
            .into(),
        }
    }

    async fn auction_contract(&self, ilk: B256) -> Result<Address> {
        let out = self.instance.ilks(ilk).call().await.context("dog ilks")?;
        Ok(out.clip)
    }
}

pub struct VowImbalances {
    instance: bindings::VowInstance<DynProvider>,
    vat: bindings::VatInstance<DynProvider>,
}

impl VowImbalances {
    pub fn new(vow: Address, vat: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Vow::new(vow, provider.clone()),
            vat: bindings::Vat::new(vat, provider),
        }
    }
}

#[async_trait::async_trait]
impl Imbalances for VowImbalances {
    async fn state(&self) -> Result<VowState> {
        let vow = *self.instance.address();
        Ok(VowState {
            joy: Rad::from_raw(self.vat.dai(vow).call().await.context("vat dai(vow)")?),
            awe: Rad::from_raw(self.vat.sin(vow).call().await.context("vat sin(vow)")?),
            queued: Rad::from_raw(self.instance.Sin().call().await.context("vow Sin")?),
            on_auction: Rad::from_raw(self.instance.Ash().call().await.context("vow Ash")?),
            bump: Rad::from_raw(self.instance.bump().call().await.context("vow bump")?),
            hump: Rad::from_raw(self.instance.hump().call().await.context("vow hump")?),
            sump: Rad::from_raw(self.instance.sump().call().await.context("vow sump")?),
            wait: u64::try_from(self.instance.wait().call().await.context("vow wait")?)?,
        })
    }

    async fn queued_debt(&self, era: u64) -> Result<Rad> {
        Ok(Rad::from_raw(
            self.instance
                .sin(U256::from(era))
                .call()
                .await
                .context("vow sin(era)")?,
        ))
    }

    fn heal(&self, amount: Rad) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Vow::healCall { rad: amount.0 }.abi_encode().into(),
        }
    }

    fn flog(&self, era: u64) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Vow::flogCall {
                era: U256::from(era),
            }
            .abi_encode()
            .into(),
        }
    }

    fn kick_flap(&self) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Vow::flapCall {}.abi_encode().into(),
        }
    }

    fn kick_flop(&self) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Vow::flopCall {}.abi_encode().into(),
        }
    }

    fn address(&self) -> Address {
        *self.instance.address()
    }
}

/// A token adapter together with its ERC-20, normalizing between token
/// units and 18-digit wads.
pub struct JoinAdapter {
    join: bindings::JoinInstance<DynProvider>,
    token: bindings::TokenInstance<DynProvider>,
    /// `10^(18 - dec)`, the factor between token units and wads.
    scale: U256,
}

impl JoinAdapter {
    pub async fn connect(
        join: Address,
        token: Address,
        provider: DynProvider,
        decimals: Option<u32>,
    ) -> Result<Self> {
        let join = bindings::Join::new(join, provider.clone());
        let decimals = match decimals {
            Some(dec) => dec,
            None => u32::try_from(join.dec().call().await.context("join dec")?)?,
        };
        if decimals > 18 {
            bail!("tokens with more than 18 decimals are not supported");
        }
        Ok(Self {
            join,
            token: bindings::Token::new(token, provider),
            scale: U256::from(10u64).pow(U256::from(18 - decimals)),
        })
    }
}

#[async_trait::async_trait]
impl TokenJoin for JoinAdapter {
    async fn token_balance(&self, usr: Address) -> Result<Wad> {
        let raw = self
            .token
            .balanceOf(usr)
            .call()
            .await
            .context("token balance")?;
        Ok(Wad::from_raw(raw * self.scale))
    }

    async fn approved(&self, usr: Address) -> Result<bool> {
        let allowance = self
            .token
            .allowance(usr, *self.join.address())
            .call()
            .await
            .context("token allowance")?;
        Ok(!allowance.is_zero())
    }

    fn approve(&self) -> Call {
        Call {
            to: *self.token.address(),
            data: bindings::Token::approveCall {
                spender: *self.join.address(),
                amount: U256::MAX,
            }
            .abi_encode()
            .into(),
        }
    }

    fn join(&self, usr: Address, amount: Wad) -> Call {
        Call {
            to: *self.join.address(),
            data: bindings::Join::joinCall {
                usr,
                amt: amount.0 / self.scale,
            }
            .abi_encode()
            .into(),
        }
    }

    fn exit(&self, usr: Address, amount: Wad) -> Call {
        Call {
            to: *self.join.address(),
            data: bindings::Join::exitCall {
                usr,
                amt: amount.0 / self.scale,
            }
            .abi_encode()
            .into(),
        }
    }

    fn address(&self) -> Address {
        *self.join.address()
    }
}

pub struct PlainToken {
    instance: bindings::TokenInstance<DynProvider>,
}

impl PlainToken {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Token::new(address, provider),
        }
    }
}

#[async_trait::async_trait]
impl TokenView for PlainToken {
    async fn balance(&self, usr: Address) -> Result<Wad> {
        Ok(Wad::from_raw(
            self.instance
                .balanceOf(usr)
                .call()
                .await
                .context("token balance")?,
        ))
    }

    async fn approved(&self, usr: Address, spender: Address) -> Result<bool> {
        let allowance = self
            .instance
            .allowance(usr, spender)
            .call()
            .await
            .context("token allowance")?;
        Ok(!allowance.is_zero())
    }

    fn approve(&self, spender: Address) -> Call {
        Call {
            to: *self.instance.address(),
            data: bindings::Token::approveCall {
                spender,
                amount: U256::MAX,
            }
            .abi_encode()
            .into(),
        }
    }
}

/// Urn and liquidation discovery by replaying logs.
///
/// The vat notes every `frob`/`fork` through an anonymous `LogNote` whose
/// first topic is the 4-byte selector left-aligned in 32 bytes; the urn
/// addresses sit right-aligned in the argument topics.
pub struct LogHistory {
    provider: DynProvider,
    vat: Address,
    liquidator: Option<Address>,
    frob_topic: B256,
    fork_topic: B256,
}

impl LogHistory {
    pub fn new(
        provider: DynProvider,
        vat: Address,
        cat: Option<Address>,
        dog: Option<Address>,
    ) -> Self {
        Self {
            provider,
            vat,
            liquidator: cat.or(dog),
            frob_topic: note_topic("frob(bytes32,address,address,address,int256,int256)"),
            fork_topic: note_topic("fork(bytes32,address,address,int256,int256)"),
        }
    }
}

fn note_topic(signature: &str) -> B256 {
    let selector = keccak256(signature.as_bytes());
    let mut topic = [0u8; 32];
    topic[..4].copy_from_slice(&selector[..4]);
    B256::from(topic)
}

fn address_from_topic(topic: &B256) -> Address {
    Address::from_slice(&topic[12..])
}

#[async_trait::async_trait]
impl History for LogHistory {
    async fn touched_urns(
        &self,
        ilk: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Address>> {
        let filter = Filter::new()
            .address(self.vat)
            .event_signature(vec![self.frob_topic, self.fork_topic])
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .context("vat note logs")?;
        let mut urns = Vec::new();
        for log in logs {
            let topics = log.topics();
            if topics.len() < 3 || topics[1] != ilk {
                continue;
            }
            if topics[0] == self.frob_topic {
                urns.push(address_from_topic(&topics[2]));
            } else if topics[0] == self.fork_topic && topics.len() >= 4 {
                // A fork moves a position between two urns; both change.
                urns.push(address_from_topic(&topics[2]));
                urns.push(address_from_topic(&topics[3]));
            }
        }
        urns.sort();
        urns.dedup();
        Ok(urns)
    }

    async fn bite_timestamps(&self, from_block: u64, to_block: u64) -> Result<Vec<u64>> {
        let Some(liquidator) = self.liquidator else {
            return Ok(Vec::new());
        };
        let filter = Filter::new()
            .address(liquidator)
            .event_signature(vec![
                bindings::Cat::Bite::SIGNATURE_HASH,
                bindings::Dog::Bark::SIGNATURE_HASH,
            ])
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .context("liquidation logs")?;
        let mut timestamps_by_block: HashMap<u64, u64> = HashMap::new();
        let mut eras = Vec::new();
        for log in logs {
            let Some(number) = log.block_number else {
                continue;
            };
            let timestamp = match timestamps_by_block.get(&number) {
                Some(timestamp) => *timestamp,
                None => {
                    let block = self
                        .provider
                        .get_block_by_number(number.into())
                        .await
                        .context("block for liquidation log")?
                        .with_context(|| format!("missing block {number}"))?;
                    timestamps_by_block.insert(number, block.header.timestamp);
                    block.header.timestamp
                }
            };
            eras.push(timestamp);
        }
        eras.sort_unstable();
        eras.dedup();
        Ok(eras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn note_topics_are_left_aligned_selectors() {
        // keccak("frob(bytes32,address,address,address,int256,int256)")[..4]
        // is 0x7608870..., the selector the vat notes frobs under.
        let topic = note_topic("frob(bytes32,address,address,address,int256,int256)");
        assert_eq!(topic[..4], hex!("76088703"));
        assert!(topic[4..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn urn_addresses_sit_in_the_low_bytes() {
        let mut raw = [0u8; 32];
        raw[12..].copy_from_slice(&[0x11; 20]);
        assert_eq!(
            address_from_topic(&B256::from(raw)),
            Address::from([0x11; 20])
        );
    }
}
