//! Typed wrappers around the four auction contracts. Immutable auction
//! parameters (`beg`, `ttl`, `tau`) are read once at connection time.

use {
    crate::{
        bindings,
        types::{Auction, Call, Details},
    },
    alloy::{providers::DynProvider, sol_types::SolCall},
    alloy_primitives::{Address, Bytes, U256},
    anyhow::{Context, Result},
    number::{Rad, Ray, Wad},
};

pub struct Flipper {
    instance: bindings::FlipperInstance<DynProvider>,
    beg: Wad,
    ttl: u64,
    tau: u64,
}

impl Flipper {
    pub async fn connect(address: Address, provider: DynProvider) -> Result<Self> {
        let instance = bindings::Flipper::new(address, provider);
        Ok(Self {
            beg: Wad::from_raw(instance.beg().call().await.context("flipper beg")?),
            ttl: u64::try_from(instance.ttl().call().await.context("flipper ttl")?)?,
            tau: u64::try_from(instance.tau().call().await.context("flipper tau")?)?,
            instance,
        })
    }

    pub fn address(&self) -> Address {
        *self.instance.address()
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn tau(&self) -> u64 {
        self.tau
    }

    pub async fn kicks(&self) -> Result<u64> {
        Ok(u64::try_from(
            self.instance.kicks().call().await.context("flipper kicks")?,
        )?)
    }

    pub async fn auction(&self, id: u64, now: u64) -> Result<Auction> {
        let bids = self
            .instance
            .bids(U256::from(id))
            .call()
            .await
            .with_context(|| format!("flipper bids {id}"))?;
        Ok(Auction {
            id,
            guy: bids.guy,
            tic: u64::try_from(bids.tic)?,
            end: u64::try_from(bids.end)?,
            era: now,
            details: Details::Flip {
                bid: Rad::from_raw(bids.bid),
                lot: Wad::from_raw(bids.lot),
                tab: Rad::from_raw(bids.tab),
                beg: self.beg,
            },
        })
    }

    pub fn tend(&self, id: u64, lot: Wad, bid: Rad) -> Call {
        self.invocation(
            bindings::Flipper::tendCall {
                id: U256::from(id),
                lot: lot.0,
                bid: bid.0,
            }
            .abi_encode(),
        )
    }

    pub fn dent(&self, id: u64, lot: Wad, bid: Rad) -> Call {
        self.invocation(
            bindings::Flipper::dentCall {
                id: U256::from(id),
                lot: lot.0,
                bid: bid.0,
            }
            .abi_encode(),
        )
    }

    pub fn deal(&self, id: u64) -> Call {
        self.invocation(bindings::Flipper::dealCall { id: U256::from(id) }.abi_encode())
    }

    pub fn tick(&self, id: u64) -> Call {
        self.invocation(bindings::Flipper::tickCall { id: U256::from(id) }.abi_encode())
    }

    fn invocation(&self, data: Vec<u8>) -> Call {
        Call {
            to: self.address(),
            data: data.into(),
        }
    }
}

pub struct Flapper {
    instance: bindings::FlapperInstance<DynProvider>,
    beg: Wad,
    ttl: u64,
    tau: u64,
}

impl Flapper {
    pub async fn connect(address: Address, provider: DynProvider) -> Result<Self> {
        let instance = bindings::Flapper::new(address, provider);
        Ok(Self {
            beg: Wad::from_raw(instance.beg().call().await.context("flapper beg")?),
            ttl: u64::try_from(instance.ttl().call().await.context("flapper ttl")?)?,
            tau: u64::try_from(instance.tau().call().await.context("flapper tau")?)?,
            instance,
        })
    }

    pub fn address(&self) -> Address {
        *self.instance.address()
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn tau(&self) -> u64 {
        self.tau
    }

    pub async fn kicks(&self) -> Result<u64> {
        Ok(u64::try_from(
            self.instance.kicks().call().await.context("flapper kicks")?,
        )?)
    }

    pub async fn auction(&self, id: u64, now: u64) -> Result<Auction> {
        let bids = self
            .instance
            .bids(U256::from(id))
            .call()
            .await
            .with_context(|| format!("flapper bids {id}"))?;
        Ok(Auction {
            id,
            guy: bids.guy,
            tic: u64::try_from(bids.tic)?,
            end: u64::try_from(bids.end)?,
            era: now,
            details: Details::Flap {
                bid: Wad::from_raw(bids.bid),
                lot: Rad::from_raw(bids.lot),
                beg: self.beg,
            },
        })
    }

    pub fn tend(&self, id: u64, lot: Rad, bid: Wad) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flapper::tendCall {
                id: U256::from(id),
                lot: lot.0,
                bid: bid.0,
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn deal(&self, id: u64) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flapper::dealCall { id: U256::from(id) }
                .abi_encode()
                .into(),
        }
    }

    pub fn tick(&self, id: u64) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flapper::tickCall { id: U256::from(id) }
                .abi_encode()
                .into(),
        }
    }
}

pub struct Flopper {
    instance: bindings::FlopperInstance<DynProvider>,
    beg: Wad,
    ttl: u64,
    tau: u64,
}

impl Flopper {
    pub async fn connect(address: Address, provider: DynProvider) -> Result<Self> {
        let instance = bindings::Flopper::new(address, provider);
        Ok(Self {
            beg: Wad::from_raw(instance.beg().call().await.context("flopper beg")?),
            ttl: u64::try_from(instance.ttl().call().await.context("flopper ttl")?)?,
            tau: u64::try_from(instance.tau().call().await.context("flopper tau")?)?,
            instance,
        })
    }

    pub fn address(&self) -> Address {
        *self.instance.address()
    }

    pub fn ttl(&self) -> u64 {
        self.ttl
    }

    pub fn tau(&self) -> u64 {
        self.tau
    }

    pub async fn kicks(&self) -> Result<u64> {
        Ok(u64::try_from(
            self.instance.kicks().call().await.context("flopper kicks")?,
        )?)
    }

    pub async fn auction(&self, id: u64, now: u64) -> Result<Auction> {
        let bids = self
            .instance
            .bids(U256::from(id))
            .call()
            .await
            .with_context(|| format!("flopper bids {id}"))?;
        Ok(Auction {
            id,
            guy: bids.guy,
            tic: u64::try_from(bids.tic)?,
            end: u64::try_from(bids.end)?,
            era: now,
            details: Details::Flop {
                bid: Rad::from_raw(bids.bid),
                lot: Wad::from_raw(bids.lot),
                beg: self.beg,
            },
        })
    }

    pub fn dent(&self, id: u64, lot: Wad, bid: Rad) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flopper::dentCall {
                id: U256::from(id),
                lot: lot.0,
                bid: bid.0,
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn deal(&self, id: u64) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flopper::dealCall { id: U256::from(id) }
                .abi_encode()
                .into(),
        }
    }

    pub fn tick(&self, id: u64) -> Call {
        Call {
            to: self.address(),
            data: bindings::Flopper::tickCall { id: U256::from(id) }
                .abi_encode()
                .into(),
        }
    }
}

pub struct Clipper {
    instance: bindings::ClipperInstance<DynProvider>,
}

impl Clipper {
    pub fn new(address: Address, provider: DynProvider) -> Self {
        Self {
            instance: bindings::Clipper::new(address, provider),
        }
    }

    pub fn address(&self) -> Address {
        *self.instance.address()
    }

    pub async fn kicks(&self) -> Result<u64> {
        Ok(u64::try_from(
            self.instance.kicks().call().await.context("clipper kicks")?,
        )?)
    }

    pub async fn auction(&self, id: u64, now: u64) -> Result<Auction> {
        let status = self
            .instance
            .getStatus(U256::from(id))
            .call()
            .await
            .with_context(|| format!("clipper status {id}"))?;
        Ok(Auction {
            id,
            guy: Address::ZERO,
            tic: 0,
            end: 0,
            era: now,
            details: Details::Clip {
                needs_redo: status.needsRedo,
                price: Ray::from_raw(status.price),
                lot: Wad::from_raw(status.lot),
                tab: Rad::from_raw(status.tab),
            },
        })
    }

    /// Buys up to `amt` collateral at no more than `max`, sending it to
    /// `who`.
    pub fn take(&self, id: u64, amt: Wad, max: Ray, who: Address) -> Call {
        Call {
            to: self.address(),
            data: bindings::Clipper::takeCall {
                id: U256::from(id),
                amt: amt.0,
                max: max.0,
                who,
                data: Bytes::new(),
            }
            .abi_encode()
            .into(),
        }
    }

    pub fn redo(&self, id: u64, keeper: Address) -> Call {
        Call {
            to: self.address(),
            data: bindings::Clipper::redoCall {
                id: U256::from(id),
                kpr: keeper,
            }
            .abi_encode()
            .into(),
        }
    }
}
