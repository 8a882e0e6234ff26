//! Counts word occurrences in a text, case-insensitively.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use common::job::{GridTask, PayloadTask, SplitAggregateJob, TaskContext};
use common::utils::{from_payload, string_from_bytes, to_payload};
use common::TaskId;

use crate::chunk_lines;

type Counts = BTreeMap<String, u64>;

fn count_words(_ctx: &TaskContext, input: Bytes) -> Result<Bytes> {
    let text = string_from_bytes(input)?;
    let mut counts = Counts::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        *counts.entry(word.to_lowercase()).or_default() += 1;
    }
    to_payload(&counts)
}

pub struct WordCount {
    input: Bytes,
    chunk_lines: usize,
}

impl WordCount {
    pub fn new(input: Bytes, chunk_lines: usize) -> Self {
        Self { input, chunk_lines }
    }
}

impl SplitAggregateJob for WordCount {
    fn split(&self) -> Result<Vec<Arc<dyn GridTask>>> {
        Ok(chunk_lines(&self.input, self.chunk_lines)?
            .into_iter()
            .map(|chunk| PayloadTask::shared(count_words, chunk))
            .collect())
    }

    /// One `word count` line per word, most frequent first.
    fn aggregate(&self, results: BTreeMap<TaskId, Bytes>) -> Result<Bytes> {
        let mut total = Counts::new();
        for partial in results.values() {
            let partial: Counts = from_payload(partial)?;
            for (word, count) in partial {
                *total.entry(word).or_default() += count;
            }
        }

        let mut ranked: Vec<(String, u64)> = total.into_iter().collect();
        ranked.sort_by(|(wa, ca), (wb, cb)| cb.cmp(ca).then_with(|| wa.cmp(wb)));
        let out: String = ranked
            .into_iter()
            .map(|(word, count)| format!("{word} {count}\n"))
            .collect();
        Ok(Bytes::from(out))
    }
}
