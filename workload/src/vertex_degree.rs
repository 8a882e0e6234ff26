//! Computes the degree of each vertex in a graph, given a list of edges.
//!
//! Each task counts the edge endpoints in its chunk of edge lines; the
//! aggregate sums the partial counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

use common::job::{GridTask, PayloadTask, SplitAggregateJob, TaskContext};
use common::utils::{from_payload, string_from_bytes, to_payload};
use common::TaskId;

use crate::chunk_lines;

type Degrees = BTreeMap<u64, u64>;

fn parse_line(line: &str) -> Result<(u64, u64)> {
    let mut iter = line.split_whitespace().take(2);
    let a = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    let b = iter
        .next()
        .ok_or_else(|| anyhow!("Invalid input file format"))?
        .parse()?;
    Ok((a, b))
}

fn count_degrees(_ctx: &TaskContext, input: Bytes) -> Result<Bytes> {
    let s = string_from_bytes(input)?;
    let mut degrees = Degrees::new();
    for line in s.lines() {
        let (a, b) = parse_line(line)?;
        *degrees.entry(a).or_default() += 1;
        *degrees.entry(b).or_default() += 1;
    }
    to_payload(&degrees)
}

pub struct VertexDegree {
    input: Bytes,
    chunk_lines: usize,
}

impl VertexDegree {
    pub fn new(input: Bytes, chunk_lines: usize) -> Self {
        Self { input, chunk_lines }
    }
}

impl SplitAggregateJob for VertexDegree {
    fn split(&self) -> Result<Vec<Arc<dyn GridTask>>> {
        Ok(chunk_lines(&self.input, self.chunk_lines)?
            .into_iter()
            .map(|chunk| PayloadTask::shared(count_degrees, chunk))
            .collect())
    }

    fn aggregate(&self, results: BTreeMap<TaskId, Bytes>) -> Result<Bytes> {
        let mut total = Degrees::new();
        for partial in results.values() {
            let partial: Degrees = from_payload(partial)?;
            for (vertex, count) in partial {
                *total.entry(vertex).or_default() += count;
            }
        }

        let mut value = BytesMut::with_capacity(24 * total.len());
        for (vertex, count) in total {
            value.put(format!("{}, deg={}\n", vertex, count).as_bytes());
        }
        Ok(value.freeze())
    }
}

#[cfg(test)]
mod tests {
    use common::resolver::UnavailableResolver;
    use common::{JobId, NodeId};

    use super::*;

    fn ctx() -> TaskContext {
        TaskContext::new(
            JobId::from_raw("c-o-1"),
            0,
            NodeId::new("w"),
            Arc::new(UnavailableResolver),
        )
    }

    fn run(job: &VertexDegree) -> Result<String> {
        let mut results = BTreeMap::new();
        for (id, task) in job.split()?.into_iter().enumerate() {
            results.insert(id as TaskId, task.execute(&ctx())?);
        }
        string_from_bytes(job.aggregate(results)?)
    }

    #[test]
    fn degrees_across_chunks() {
        let job = VertexDegree::new(Bytes::from("1 2\n2 3\n3 1\n1 4\n"), 1);
        assert_eq!(job.split().unwrap().len(), 4);
        assert_eq!(
            run(&job).unwrap(),
            "1, deg=3\n2, deg=2\n3, deg=2\n4, deg=1\n"
        );
    }

    #[test]
    fn malformed_edge_fails_the_task() {
        let job = VertexDegree::new(Bytes::from("1 2\n3\n"), 10);
        let tasks = job.split().unwrap();
        assert!(tasks[0].execute(&ctx()).is_err());
    }
}
