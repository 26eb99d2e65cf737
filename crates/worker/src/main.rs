use std::time::Duration;

use anyhow::Context;

use mediaforge_infra::WorkerConfig;
use mediaforge_worker::app;

/// Submits each command-line argument as a prompt, waits for every job to
/// finish, and prints one JSON report per job.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("loading MEDIAFORGE_* configuration")?;
    mediaforge_observability::init_with(config.log_format);

    let prompts: Vec<String> = std::env::args().skip(1).collect();
    if prompts.is_empty() {
        anyhow::bail!("usage: mediaforge-worker <prompt>...");
    }

    let worker = app::start(&config).await.context("starting worker")?;

    let mut jobs = Vec::with_capacity(prompts.len());
    for prompt in &prompts {
        let job = worker
            .service()
            .submit(prompt)
            .await
            .with_context(|| format!("submitting prompt {prompt:?}"))?;
        tracing::info!(job_id = %job.id, "submitted");
        jobs.push(job.id);
    }

    for id in jobs {
        let report = worker
            .wait_for_terminal(id, Duration::from_millis(100))
            .await
            .with_context(|| format!("waiting for job {id}"))?;
        println!("{}", serde_json::to_string(&report)?);
    }

    let stats = worker.shutdown().await;
    tracing::info!(stats = ?stats, "worker stopped");
    Ok(())
}
