//! Sample jobs that can be run on the grid by name.

use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;

use common::job::{JobDefinition, ResultCallback};

pub mod pi;
pub mod vertex_degree;
pub mod word_count;

/// Knobs shared by the sample workloads. Each one reads what it needs.
#[derive(Debug, Clone)]
pub struct Params {
    /// Text input of line-oriented workloads.
    pub input: Bytes,

    /// Lines per task for line-oriented workloads.
    pub chunk_lines: usize,

    /// Number of tasks of sampling workloads.
    pub rounds: u64,

    /// Samples drawn per task by sampling workloads.
    pub samples_per_round: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            input: Bytes::new(),
            chunk_lines: 1000,
            rounds: 100,
            samples_per_round: 10_000,
        }
    }
}

enum Render {
    Text,
    Pi(Arc<pi::PiEstimate>),
}

/// A workload ready for submission.
pub struct Workload {
    pub name: &'static str,
    pub definition: JobDefinition,
    pub callback: Option<Arc<dyn ResultCallback>>,
    render: Render,
}

impl Workload {
    /// Human readable rendering of the job's final value.
    pub fn render(&self, aggregate: &Bytes) -> Result<String> {
        match &self.render {
            Render::Text => common::utils::string_from_bytes(aggregate.clone()),
            Render::Pi(estimate) => match estimate.estimate() {
                Some(value) => Ok(format!(
                    "pi ~= {value:.6} from {} samples",
                    estimate.samples()
                )),
                None => bail!("no samples were collected"),
            },
        }
    }
}

/// Look up a workload by name.
pub fn try_named(name: &str, params: &Params) -> Option<Workload> {
    match name {
        "vertex-degree" => Some(Workload {
            name: "vertex-degree",
            definition: JobDefinition::split_aggregate(vertex_degree::VertexDegree::new(
                params.input.clone(),
                params.chunk_lines,
            )),
            callback: None,
            render: Render::Text,
        }),
        "word-count" => Some(Workload {
            name: "word-count",
            definition: JobDefinition::split_aggregate(word_count::WordCount::new(
                params.input.clone(),
                params.chunk_lines,
            )),
            callback: None,
            render: Render::Text,
        }),
        "pi" => {
            let estimate = Arc::new(pi::PiEstimate::default());
            Some(Workload {
                name: "pi",
                definition: JobDefinition::unbounded(pi::PiSampling::new(
                    params.rounds,
                    params.samples_per_round,
                )),
                callback: Some(estimate.clone() as Arc<dyn ResultCallback>),
                render: Render::Pi(estimate),
            })
        }
        _ => None,
    }
}

/// Split line-oriented input into chunks of at most `lines` lines.
pub fn chunk_lines(input: &Bytes, lines: usize) -> Result<Vec<Bytes>> {
    let text = std::str::from_utf8(input)?;
    let lines = lines.max(1);
    let all: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    Ok(all
        .chunks(lines)
        .map(|chunk| Bytes::from(chunk.join("\n")))
        .collect())
}
