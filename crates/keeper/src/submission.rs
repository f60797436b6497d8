//! The transaction manager: at most one in-flight transaction per logical
//! submission key, replacement by nonce reuse with the mempool's 12.5 % gas
//! bump, and cancellation by replacing with a zero-value self-transfer.
//!
//! Each in-flight submission is owned by one worker task holding the account
//! nonce it claimed at spawn time. The scanner communicates with workers only
//! through watch channels (replacement requests) and a bounded completion
//! channel back.

use {
    crate::gas::{minimum_replacement, GasConfig},
    alloy_primitives::{Address, B256, U256},
    dss::{Call, Node, Receipt, SendError, TxSpec},
    std::{
        collections::HashMap,
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::sync::{mpsc, watch},
};

/// Stable identity of a submission. A later `submit` under the same key
/// replaces the pending transaction instead of queueing a second one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Bid(u64),
    Deal(u64),
    Restart(u64),
    Kick(Address),
    KickFlap,
    KickFlop,
    Heal,
    Flog(u64),
    JoinDai,
    ExitDai,
    ExitGem,
    Approve(Address),
}

#[derive(Debug)]
pub enum Outcome {
    /// Mined successfully.
    Mined(Receipt),
    /// Mined, but the call reverted on-chain.
    Reverted(Receipt),
    /// The cancellation self-transfer won the nonce.
    Cancelled(Receipt),
    /// The node refused the submission predicting a revert.
    Rejected(String),
    /// Terminal failure, e.g. the nonce was consumed by a foreign
    /// transaction.
    Failed(String),
}

#[derive(Debug)]
pub struct Completion {
    pub key: Key,
    pub outcome: Outcome,
    seq: u64,
}

#[derive(Debug, Clone)]
struct Request {
    call: Call,
    model_gas: Option<U256>,
    cancel: bool,
}

struct PendingTx {
    seq: u64,
    requests: watch::Sender<Request>,
    task: tokio::task::JoinHandle<()>,
}

pub struct TxManager {
    node: Arc<dyn Node>,
    sender: Address,
    gas: GasConfig,
    poll_interval: Duration,
    pending: HashMap<Key, PendingTx>,
    next_seq: u64,
    completions: mpsc::Sender<Completion>,
    inbox: mpsc::Receiver<Completion>,
}

impl TxManager {
    pub fn new(
        node: Arc<dyn Node>,
        sender: Address,
        gas: GasConfig,
        poll_interval: Duration,
    ) -> Self {
        let (completions, inbox) = mpsc::channel(64);
        Self {
            node,
            sender,
            gas,
            poll_interval,
            pending: HashMap::new(),
            next_seq: 0,
            completions,
            inbox,
        }
    }

    pub fn has_pending(&self, key: Key) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_keys(&self) -> Vec<Key> {
        self.pending.keys().copied().collect()
    }

    /// Submits a transaction, or updates the in-flight submission under this
    /// key. An update that changes neither the call nor the model gas
    /// override is a no-op.
    pub fn submit(&mut self, key: Key, call: Call, model_gas: Option<U256>) {
        if let Some(pending) = self.pending.get(&key) {
            if !pending.task.is_finished() {
                let current = pending.requests.borrow().clone();
                if current.cancel || (current.call == call && current.model_gas == model_gas) {
                    return;
                }
                tracing::debug!(?key, "updating in-flight submission");
                let _ = pending.requests.send(Request {
                    call,
                    model_gas,
                    cancel: false,
                });
                return;
            }
            // The worker exited but its completion has not been drained yet;
            // spawning now would put two transactions in flight.
            tracing::debug!(?key, "submission finished but not yet drained, deferring");
            return;
        }
        self.spawn(key, call, model_gas);
    }

    /// Requests cancellation of the in-flight submission under `key` by
    /// replacing it with a zero-value self-transfer at the same nonce.
    pub fn cancel(&mut self, key: Key) {
        if let Some(pending) = self.pending.get(&key) {
            if !pending.task.is_finished() {
                let _ = pending.requests.send(Request {
                    call: Call {
                        to: self.sender,
                        data: Default::default(),
                    },
                    model_gas: None,
                    cancel: true,
                });
            }
        }
    }

    /// Waits for the next worker to finish and releases its key.
    pub async fn next_completion(&mut self) -> Completion {
        let done = self
            .inbox
            .recv()
            .await
            .expect("completion sender is owned by the manager and never dropped");
        if self
            .pending
            .get(&done.key)
            .is_some_and(|pending| pending.seq == done.seq)
        {
            self.pending.remove(&done.key);
        }
        done
    }

    /// Non-blocking variant of [`Self::next_completion`] for the run loop.
    pub fn try_completion(&mut self) -> Option<Completion> {
        let done = self.inbox.try_recv().ok()?;
        if self
            .pending
            .get(&done.key)
            .is_some_and(|pending| pending.seq == done.seq)
        {
            self.pending.remove(&done.key);
        }
        Some(done)
    }

    /// Aborts all workers without cancellation transactions. Only used on
    /// final teardown after draining.
    pub fn abort_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.task.abort();
        }
    }

    fn spawn(&mut self, key: Key, call: Call, model_gas: Option<U256>) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let (requests, receiver) = watch::channel(Request {
            call,
            model_gas,
            cancel: false,
        });
        let task = tokio::spawn(worker(
            self.node.clone(),
            self.sender,
            self.gas.clone(),
            self.poll_interval,
            key,
            seq,
            receiver,
            self.completions.clone(),
        ));
        self.pending.insert(
            key,
            PendingTx {
                seq,
                requests,
                task,
            },
        );
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker(
    node: Arc<dyn Node>,
    sender: Address,
    gas: GasConfig,
    poll_interval: Duration,
    key: Key,
    seq: u64,
    mut requests: watch::Receiver<Request>,
    completions: mpsc::Sender<Completion>,
) {
    let started = Instant::now();
    // The nonce is claimed once and reused for every replacement, so the
    // chain can only ever mine one of our broadcasts for this key.
    let nonce = loop {
        match node.nonce(sender).await {
            Ok(nonce) => break nonce,
            Err(err) => {
                tracing::warn!(?key, ?err, "failed to fetch nonce, retrying");
                tokio::time::sleep(poll_interval).await;
            }
        }
    };

    let mut last_sent: Option<TxSpec> = None;
    let mut broadcast: Vec<(B256, bool)> = Vec::new();
    let mut nonce_low_strikes = 0u32;
    let mut node_errors = 0u32;

    let outcome = loop {
        let request = requests.borrow_and_update().clone();
        let call = if request.cancel {
            Call {
                to: sender,
                data: Default::default(),
            }
        } else {
            request.call.clone()
        };

        let node_price = node.gas_price().await.ok();
        let scheduled = gas.price(started.elapsed(), node_price, request.model_gas);
        let decision = match &last_sent {
            None => scheduled,
            Some(previous) => {
                let floor = minimum_replacement(previous.gas_price);
                let changed = previous.to != call.to || previous.data != call.data;
                match scheduled {
                    Some(price) if price >= floor => Some(price),
                    // A changed call must go out even when the schedule has
                    // not caught up; price it at the replacement floor.
                    _ if changed => Some(floor),
                    _ => None,
                }
            }
        };

        if let Some(gas_price) = decision {
            let spec = TxSpec {
                from: sender,
                to: call.to,
                value: U256::ZERO,
                data: call.data.clone(),
                nonce,
                gas_price,
            };
            match node.send(&spec).await {
                Ok(hash) => {
                    tracing::debug!(?key, %hash, %gas_price, nonce, "broadcast");
                    broadcast.push((hash, request.cancel));
                    last_sent = Some(spec);
                    node_errors = 0;
                }
                Err(SendError::AlreadyKnown) => {
                    last_sent = Some(spec);
                }
                Err(SendError::Underpriced) => {
                    // Record the attempt so the next round prices above it.
                    tracing::debug!(?key, %gas_price, "underpriced, bumping");
                    last_sent = Some(spec);
                }
                Err(SendError::NonceTooLow) => {
                    nonce_low_strikes += 1;
                }
                Err(SendError::Reverted(reason)) => {
                    break Outcome::Rejected(reason);
                }
                Err(SendError::Node(err)) => {
                    node_errors += 1;
                    tracing::warn!(?key, ?err, "node error on submit");
                }
            }
        }

        // Whichever broadcast is mined first under this nonce decides the
        // outcome, regardless of which replacement won.
        let mut mined = None;
        for (hash, was_cancel) in &broadcast {
            match node.receipt(*hash).await {
                Ok(Some(receipt)) => {
                    mined = Some((receipt, *was_cancel));
                    break;
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(?key, ?err, "receipt poll failed"),
            }
        }
        if let Some((receipt, was_cancel)) = mined {
            break if was_cancel {
                Outcome::Cancelled(receipt)
            } else if receipt.successful {
                Outcome::Mined(receipt)
            } else {
                Outcome::Reverted(receipt)
            };
        }

        if nonce_low_strikes > 3 {
            break Outcome::Failed("nonce consumed by a transaction that is not ours".into());
        }

        let backoff = poll_interval * 2u32.saturating_pow(node_errors.min(5));
        tokio::select! {
            _ = requests.changed() => {}
            _ = tokio::time::sleep(backoff) => {}
        }
    };

    tracing::debug!(?key, ?outcome, "submission finished");
    let _ = completions.send(Completion { key, outcome, seq }).await;
}
