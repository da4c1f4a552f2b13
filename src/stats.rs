//! Per-upstream win counters.
//!
//! A single task owns the counters; racers only ever send it messages, so
//! concurrent winners never touch shared state directly.

use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Forwarded replies between two breakdown reports.
pub const REPORT_EVERY: u64 = 100;

enum Command {
    Hit(usize),
    Snapshot(oneshot::Sender<StatsSnapshot>),
}

/// Handle to the statistics task. Cheap to clone.
#[derive(Clone)]
pub struct Stats {
    commands: mpsc::UnboundedSender<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits: Vec<(SocketAddr, u64)>,
    pub total: u64,
}

impl StatsSnapshot {
    pub fn count(&self, upstream: SocketAddr) -> u64 {
        self.hits
            .iter()
            .find(|(addr, _)| *addr == upstream)
            .map_or(0, |(_, count)| *count)
    }
}

impl Stats {
    /// Spawns the aggregator for `upstreams`, indexed in the same order the
    /// racer uses. With `report_every` set, a breakdown is logged each time
    /// the total reaches a multiple of it.
    pub fn spawn(upstreams: Vec<SocketAddr>, report_every: Option<u64>) -> Stats {
        let (commands, receiver) = mpsc::unbounded_channel();
        let aggregator = Aggregator {
            hits: vec![0; upstreams.len()],
            upstreams,
            report_every,
        };

        tokio::spawn(aggregator.run(receiver));

        Stats { commands }
    }

    pub fn record_hit(&self, index: usize) {
        if self.commands.send(Command::Hit(index)).is_err() {
            warn!(index, "Statistics task has stopped, dropping hit");
        }
    }

    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        let (sender, receiver) = oneshot::channel();
        self.commands.send(Command::Snapshot(sender)).ok()?;
        receiver.await.ok()
    }
}

struct Aggregator {
    upstreams: Vec<SocketAddr>,
    hits: Vec<u64>,
    report_every: Option<u64>,
}

impl Aggregator {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Hit(index) => self.record_hit(index),
                Command::Snapshot(reply) => {
                    // Requester may have given up waiting
                    let _ = reply.send(self.snapshot());
                }
            }
        }
    }

    fn record_hit(&mut self, index: usize) {
        match self.hits.get_mut(index) {
            Some(count) => *count += 1,
            None => {
                warn!(index, "Hit recorded for unknown upstream");
                return;
            }
        }

        if let Some(every) = self.report_every {
            if every > 0 && self.total() % every == 0 {
                self.report();
            }
        }
    }

    fn total(&self) -> u64 {
        self.hits.iter().sum()
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self
                .upstreams
                .iter()
                .copied()
                .zip(self.hits.iter().copied())
                .collect(),
            total: self.total(),
        }
    }

    fn report(&self) {
        info!(total = self.total(), "DNS breakdown");
        for (upstream, count) in self.upstreams.iter().zip(&self.hits) {
            info!("\t{:>10}\t{}", count, upstream);
        }
    }
}
