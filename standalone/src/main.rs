mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{GridContext, NodeId, WorkerProfile};
use grid_coordinator::{JobCoordinator, JobRequest};
use grid_worker::WorkerNode;

use args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let input = match &args.input {
        Some(path) => Bytes::from(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read input `{}`", path.display()))?,
        ),
        None => Bytes::new(),
    };
    let params = workload::Params {
        input,
        chunk_lines: args.chunk_lines,
        rounds: args.rounds,
        samples_per_round: args.samples,
    };
    let workload = workload::try_named(&args.workload, &params)
        .ok_or_else(|| anyhow!("The workload `{}` is not a known workload", args.workload))?;

    let ctx = GridContext::in_memory(args.cluster.clone());
    let coordinator = JobCoordinator::builder(ctx.clone()).build();

    let mut workers = Vec::with_capacity(args.workers);
    for i in 0..args.workers {
        let profile = WorkerProfile::new(NodeId::random(), format!("worker-{i}"));
        let node = Arc::new(WorkerNode::new(profile, ctx.clone(), coordinator.clone()));
        let handle = node.start();
        workers.push((node, handle));
    }
    info!("Started {} worker(s)", workers.len());

    let mut request = JobRequest::new(NodeId::new("standalone"), workload.definition.clone());
    if let Some(callback) = &workload.callback {
        request = request.with_callback(callback.clone());
    }
    let future = coordinator.submit_watched(request)?;
    info!("Submitted `{}` as job {}", workload.name, future.job_id());

    let outcome = future
        .result(Some(Duration::from_secs(args.timeout)))
        .await;

    for (node, handle) in workers {
        node.shutdown();
        let _ = handle.await;
        let telemetry = node.telemetry();
        info!(
            "Worker {} ran {} task(s), {} failed, {:?} busy",
            node.id(),
            telemetry.tasks_total(),
            telemetry.tasks_failed,
            telemetry.execution_time
        );
    }
    coordinator.shutdown();

    match outcome? {
        Some(value) => println!("{}", workload.render(&value)?),
        None => warn!("Job {} was canceled", future.job_id()),
    }
    Ok(())
}
