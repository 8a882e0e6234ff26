//! Monte Carlo estimate of pi, run as an unbounded stream of sampling tasks.
//!
//! The job itself produces no value; the estimate accumulates in the
//! [`PiEstimate`] callback as results arrive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use common::job::{GridTask, PayloadTask, ResultCallback, TaskContext, UnboundedJob};
use common::utils::{from_payload, to_payload};
use common::TaskId;

#[derive(Serialize, Deserialize)]
struct Round {
    seed: u64,
    samples: u64,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
struct Hits {
    inside: u64,
    total: u64,
}

fn sample(_ctx: &TaskContext, input: Bytes) -> Result<Bytes> {
    let round: Round = from_payload(&input)?;
    let mut rng = StdRng::seed_from_u64(round.seed);
    let mut inside = 0;
    for _ in 0..round.samples {
        let x: f64 = rng.gen();
        let y: f64 = rng.gen();
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }
    to_payload(&Hits {
        inside,
        total: round.samples,
    })
}

pub struct PiSampling {
    rounds: u64,
    samples_per_round: u64,
    issued: AtomicU64,
}

impl PiSampling {
    pub fn new(rounds: u64, samples_per_round: u64) -> Self {
        Self {
            rounds,
            samples_per_round,
            issued: AtomicU64::new(0),
        }
    }
}

impl UnboundedJob for PiSampling {
    fn next_task(&self) -> Result<Option<Arc<dyn GridTask>>> {
        let seed = self.issued.fetch_add(1, Ordering::SeqCst);
        if seed >= self.rounds {
            return Ok(None);
        }
        let round = Round {
            seed,
            samples: self.samples_per_round,
        };
        Ok(Some(PayloadTask::shared(sample, to_payload(&round)?)))
    }
}

#[derive(Debug, Default)]
pub struct PiEstimate {
    inside: AtomicU64,
    total: AtomicU64,
}

impl PiEstimate {
    pub fn samples(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn estimate(&self) -> Option<f64> {
        let total = self.samples();
        if total == 0 {
            return None;
        }
        Some(4.0 * self.inside.load(Ordering::SeqCst) as f64 / total as f64)
    }
}

impl ResultCallback for PiEstimate {
    fn on_result(&self, _task_id: TaskId, result: &Bytes) -> Result<()> {
        let hits: Hits = from_payload(result)?;
        self.inside.fetch_add(hits.inside, Ordering::SeqCst);
        self.total.fetch_add(hits.total, Ordering::SeqCst);
        Ok(())
    }
}
