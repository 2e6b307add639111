// CLI commands for operating the judge queue
use anyhow::{anyhow, bail, Context, Result};
use judge_common::{JobDetail, JobQueue, JobStore, NewJob, QueueStatus, RequestRef};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::RequestKind;

fn parse_status(value: &str) -> Result<QueueStatus> {
    value.parse::<QueueStatus>().map_err(|e| {
        anyhow!(
            "{} (expected one of: {})",
            e,
            QueueStatus::ALL.map(|s| s.as_str()).join(", ")
        )
    })
}

/// Load and sanity-check a job detail file
pub fn load_detail(path: &Path) -> Result<JobDetail> {
    if !path.exists() {
        bail!("Detail file not found: {}", path.display());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let detail: JobDetail = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if detail.time_ms == 0 || detail.memory_mb == 0 {
        bail!("time_ms and memory_mb must both be positive");
    }
    if detail.file_dir.is_empty() || detail.result_dir.is_empty() {
        bail!("file_dir and result_dir are required");
    }
    if detail.build_tasks.is_empty() && detail.judge_tasks.is_empty() {
        bail!("Job has no build or judge tasks");
    }

    Ok(detail)
}

pub async fn enqueue(store: &dyn JobStore, kind: RequestKind, request_id: i64, detail_path: &Path) -> Result<JobQueue> {
    let detail = load_detail(detail_path)?;
    let request = match kind {
        RequestKind::Validation => RequestRef::Validation { request_id },
        RequestKind::Grading => RequestRef::Grading { request_id },
    };

    println!("🚀 Enqueueing job for {}", request);
    let job = store
        .insert_job(NewJob { request, detail })
        .await
        .context("Failed to insert job")?;

    println!("✅ Job {} is {}", job.id, job.status);
    println!(
        "   {} build task(s), {} judge task(s), {} ms, {} MB",
        job.detail.build_tasks.len(),
        job.detail.judge_tasks.len(),
        job.detail.time_ms,
        job.detail.memory_mb
    );
    Ok(job)
}

pub async fn status(store: &dyn JobStore) -> Result<()> {
    let counts = store.count_by_status().await.context("Failed to count jobs")?;

    println!("📊 Queue status:\n");
    println!("{:<12} {:>8}", "STATUS", "JOBS");
    println!("{}", "─".repeat(21));
    for (status, count) in &counts {
        println!("{:<12} {:>8}", status, count);
    }

    let total: u64 = counts.iter().map(|(_, c)| c).sum();
    println!("\n✅ Total: {} job(s)", total);
    Ok(())
}

pub async fn show(store: &dyn JobStore, job_id: i64) -> Result<()> {
    let Some(job) = store.get_job(job_id).await.context("Failed to load job")? else {
        bail!("Job {} not found", job_id);
    };
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

pub async fn list(store: &dyn JobStore, status: &str, limit: usize) -> Result<Vec<JobQueue>> {
    let status = parse_status(status)?;
    let jobs = store
        .fetch_by_status(status, limit)
        .await
        .context("Failed to list jobs")?;

    if jobs.is_empty() {
        println!("No {} jobs.", status);
        return Ok(jobs);
    }

    println!("📋 {} jobs:\n", status);
    println!("{:<8} {:<20} {:<26}", "ID", "REQUEST", "UPDATED");
    println!("{}", "─".repeat(56));
    for job in &jobs {
        println!(
            "{:<8} {:<20} {:<26}",
            job.id,
            job.request.to_string(),
            job.updated_at.to_rfc3339()
        );
    }
    Ok(jobs)
}

pub async fn reclaim(store: &dyn JobStore, from: &str, stale_after_secs: u64) -> Result<Vec<JobQueue>> {
    let from = parse_status(from)?;
    if !matches!(from, QueueStatus::Processing | QueueStatus::Fetched) {
        bail!("Only processing or fetched jobs can be reclaimed, not {}", from);
    }

    println!("♻️  Reclaiming {} jobs older than {}s...", from, stale_after_secs);
    let moved = store
        .reclaim_stale(from, QueueStatus::Pending, Duration::from_secs(stale_after_secs))
        .await
        .context("Failed to reclaim jobs")?;

    for job in &moved {
        println!("  ✅ job {} ({}) -> {}", job.id, job.request, job.status);
    }
    println!("\n✅ Reclaimed {} job(s)", moved.len());
    Ok(moved)
}
