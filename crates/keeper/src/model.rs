//! One external pricing-model process per live auction. The keeper streams
//! auction status as line-delimited JSON into the child's stdin and reads
//! stances back from its stdout; only the most recent stance counts.

use {
    alloy_primitives::U256,
    anyhow::{Context, Result},
    dss::{Auction, Details},
    number::Wad,
    serde::{Deserialize, Serialize},
    std::{process::Stdio, time::Duration},
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, Command},
        sync::{mpsc, watch},
    },
};

/// How long a terminated model gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// One auction snapshot on the wire. Quantities are decimal strings so the
/// model never loses precision to a float round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub id: u64,
    pub kind: String,
    pub bid: String,
    pub lot: String,
    pub tab: Option<String>,
    pub beg: Option<String>,
    pub guy: String,
    pub era: u64,
    pub end: u64,
    pub tic: u64,
    pub price: Option<String>,
}

impl Status {
    pub fn of(auction: &Auction) -> Self {
        let (bid, lot, tab, beg) = match &auction.details {
            Details::Flip { bid, lot, tab, beg } => (
                bid.to_string(),
                lot.to_string(),
                Some(tab.to_string()),
                Some(beg.to_string()),
            ),
            Details::Flap { bid, lot, beg } => {
                (bid.to_string(), lot.to_string(), None, Some(beg.to_string()))
            }
            Details::Flop { bid, lot, beg } => {
                (bid.to_string(), lot.to_string(), None, Some(beg.to_string()))
            }
            Details::Clip { lot, tab, .. } => (
                "0".to_string(),
                lot.to_string(),
                Some(tab.to_string()),
                None,
            ),
        };
        Self {
            id: auction.id,
            kind: auction.kind().to_string(),
            bid,
            lot,
            tab,
            beg,
            guy: auction.guy.to_string(),
            era: auction.era,
            end: auction.end,
            tic: auction.tic,
            price: auction.price().map(|price| price.to_string()),
        }
    }
}

/// The model's answer. An absent or null price means "do not bid".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Stance {
    #[serde(default)]
    pub price: Option<Wad>,
    #[serde(default)]
    pub gas_price: Option<u128>,
}

impl Stance {
    pub fn gas(&self) -> Option<U256> {
        self.gas_price.map(U256::from)
    }
}

#[derive(Debug, Clone)]
pub struct ModelFactory {
    command: Vec<String>,
    max_restarts: u32,
}

impl ModelFactory {
    pub fn new(command: &str, max_restarts: u32) -> Result<Self> {
        let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        anyhow::ensure!(!command.is_empty(), "model command must not be empty");
        Ok(Self {
            command,
            max_restarts,
        })
    }

    pub fn create(&self, id: u64) -> Model {
        let mut model = Model {
            id,
            command: self.command.clone(),
            max_restarts: self.max_restarts,
            restarts: 0,
            running: None,
            dead: false,
        };
        model.ensure_running();
        model
    }
}

struct Running {
    child: Child,
    statuses: mpsc::Sender<Status>,
    stance: watch::Receiver<Option<Stance>>,
}

pub struct Model {
    id: u64,
    command: Vec<String>,
    max_restarts: u32,
    restarts: u32,
    running: Option<Running>,
    dead: bool,
}

impl Model {
    /// Restarts a crashed child within the restart budget. Returns `false`
    /// once the model has been given up on.
    pub fn ensure_running(&mut self) -> bool {
        if self.dead {
            return false;
        }
        let crashed = match &mut self.running {
            None => true,
            Some(running) => match running.child.try_wait() {
                Ok(None) => false,
                Ok(Some(code)) => {
                    tracing::warn!(model = self.id, ?code, "model process exited");
                    true
                }
                Err(err) => {
                    tracing::warn!(model = self.id, ?err, "cannot poll model process");
                    true
                }
            },
        };
        if !crashed {
            return true;
        }
        if self.running.is_some() {
            self.restarts += 1;
        }
        if self.restarts > self.max_restarts {
            self.dead = true;
            tracing::error!(
                model = self.id,
                restarts = self.restarts,
                "model crashed too often, ignoring this auction"
            );
            return false;
        }
        match spawn(self.id, &self.command) {
            Ok(running) => {
                self.running = Some(running);
                true
            }
            Err(err) => {
                tracing::error!(model = self.id, ?err, "failed to start model");
                self.restarts += 1;
                false
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Feeds a status line to the model. Never blocks the scanner: a model
    /// that stopped reading just loses snapshots.
    pub fn send_status(&mut self, status: Status) {
        if !self.ensure_running() {
            return;
        }
        if let Some(running) = &self.running {
            if running.statuses.try_send(status).is_err() {
                tracing::debug!(model = self.id, "status backlog full, dropping snapshot");
            }
        }
    }

    /// The most recent stance, if the model has produced any.
    pub fn stance(&self) -> Option<Stance> {
        self.running
            .as_ref()
            .and_then(|running| running.stance.borrow().clone())
    }

    /// SIGTERM, a grace period, then SIGKILL.
    pub async fn terminate(mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        drop(running.statuses);
        #[cfg(unix)]
        if let Some(pid) = running.child.id() {
            if let Ok(pid) = i32::try_from(pid) {
                unsafe {
                    libc::kill(pid, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = running.child.start_kill();
        match tokio::time::timeout(TERMINATE_GRACE, running.child.wait()).await {
            Ok(_) => tracing::debug!(model = self.id, "model terminated"),
            Err(_) => {
                tracing::warn!(model = self.id, "model ignored SIGTERM, killing");
                let _ = running.child.kill().await;
            }
        }
    }
}

fn spawn(id: u64, command: &[String]) -> Result<Running> {
    let mut child = Command::new(&command[0])
        .args(&command[1..])
        .arg("--id")
        .arg(id.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawn model {:?}", command[0]))?;
    let mut stdin = child.stdin.take().context("model stdin")?;
    let stdout = child.stdout.take().context("model stdout")?;

    let (status_tx, mut status_rx) = mpsc::channel::<Status>(8);
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            let mut line = match serde_json::to_vec(&status) {
                Ok(line) => line,
                Err(_) => break,
            };
            line.push(b'\n');
            if stdin.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let (stance_tx, stance_rx) = watch::channel(None);
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Stance>(line) {
                        Ok(stance) => {
                            let _ = stance_tx.send(Some(stance));
                        }
                        Err(err) => {
                            tracing::warn!(model = id, ?err, "dropping malformed model output")
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(model = id, ?err, "model stdout read failed");
                    break;
                }
            }
        }
    });

    Ok(Running {
        child,
        statuses: status_tx,
        stance: stance_rx,
    })
}
