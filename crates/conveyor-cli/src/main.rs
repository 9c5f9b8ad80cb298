//! Demo: a two-partition engine serving one push stream and one polling
//! worker group, with a handler that fails twice before succeeding.
//!
//! Run with `RUST_LOG=debug` to watch the activation flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::sleep;

use conveyor_core::worker::{
    HandlerRegistry, JobFailure, JobHandler, PollWorkerGroup, PollWorkerOptions,
};
use conveyor_core::{ActivatedJob, Engine, JobSpec, JobType};

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl JobHandler for GreetHandler {
    async fn handle(&self, job: &ActivatedJob) -> Result<Option<serde_json::Value>, JobFailure> {
        let payload: GreetPayload = serde_json::from_value(job.variables.clone())
            .map_err(|e| JobFailure::fatal(format!("json decode: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(JobFailure::retry_after(
                job,
                format!("intentional failure (left={left})"),
                Duration::from_millis(100),
            ));
        }

        println!("Hello, {}!", payload.name);
        Ok(Some(serde_json::json!({ "greeted": payload.name })))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // (A) Engine with two partitions.
    let engine = Arc::new(
        Engine::builder()
            .partitions(2)
            .tick_interval(Duration::from_millis(200))
            .build()?,
    );

    // (B) A push stream for "notify" jobs, consumed on its own task.
    let mut stream = engine
        .open_job_stream(JobType::new("notify"), "stream-consumer")
        .await?;
    let stream_engine = Arc::clone(&engine);
    let stream_task = tokio::spawn(async move {
        while let Some(job) = stream.recv().await {
            println!("pushed: job={} variables={}", job.key, job.variables);
            if let Err(err) = stream_engine.complete_job(job.key, None).await {
                tracing::warn!(job = %job.key, error = %err, "stream complete failed");
            }
        }
    });

    // (C) A polling worker group for "greet" jobs.
    let mut registry = HandlerRegistry::new();
    registry.register(JobType::new("greet"), Arc::new(GreetHandler::new(2)))?;
    let workers = PollWorkerGroup::spawn(
        2,
        Arc::clone(&engine),
        Arc::new(registry),
        PollWorkerOptions {
            worker: "greeter".to_string(),
            request_timeout: Duration::from_millis(500),
            ..PollWorkerOptions::default()
        },
    );

    // (D) Create some jobs; round-robin spreads them over both partitions.
    engine
        .create_job(
            JobSpec::new(JobType::new("greet"))
                .with_variables(serde_json::json!({ "name": "conveyor" }))
                .with_retries(5),
        )
        .await?;
    for i in 0..3 {
        engine
            .create_job(
                JobSpec::new(JobType::new("notify"))
                    .with_variables(serde_json::json!({ "seq": i })),
            )
            .await?;
    }

    tracing::info!("created 4 jobs across 2 partitions");

    // (E) Wait until everything is done, then print the final counts.
    loop {
        let status = engine.status().await?;
        if status.totals().completed == 4 {
            println!("status: {}", serde_json::to_string_pretty(&status)?);
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    workers.shutdown_and_join().await;
    stream_task.abort();
    engine.shutdown().await;
    Ok(())
}
