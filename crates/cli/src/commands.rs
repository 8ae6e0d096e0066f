// crates/cli/src/commands.rs
//! One function per subcommand. Human output goes to stdout, logs to stderr.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use chrono::DateTime;
use darkhorses_core::upstream::{create_source, UpstreamSource};
use darkhorses_core::{Config, Plan, RequestPacer, TransformDef, VerificationDef};
use darkhorses_db::backfill::build_transform;
use darkhorses_db::{
    BackfillJob, BackfillRunner, Database, MigrationExecutor, MigrationRecord, MigrationStatus,
    MigrationSummary, ReconciliationReport, Verifier,
};
use darkhorses_jobs::{JobRegistry, JobStatus};
use futures_util::TryStreamExt;
use serde::Serialize;
use tracing::{info, warn};

use crate::args::Output;
use crate::exit::Outcome;
use crate::progress;

/// Resolved configuration plus the open database.
pub struct Context {
    pub config: Config,
    pub db: Database,
}

impl Context {
    pub async fn open(config: Config) -> Result<Self> {
        let path = config.db_path()?;
        let db = Database::new(&path)
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        Ok(Self { config, db })
    }

    fn plan(&self) -> Result<Plan> {
        let path = self.config.plan_path();
        Plan::load(&path).with_context(|| format!("loading plan {}", path.display()))
    }

    fn executor(&self) -> MigrationExecutor {
        MigrationExecutor::new(self.db.clone())
            .with_statement_timeout(self.config.database.statement_timeout())
    }

    fn runner(&self) -> BackfillRunner {
        BackfillRunner::new(self.db.clone(), self.config.runner.clone())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_ts(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn format_versions(versions: &[i64]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ── migrate ──────────────────────────────────────────────────────────

pub async fn migrate(ctx: &Context, dry_run: bool, output: Output) -> Result<Outcome> {
    let plan = ctx.plan()?;
    let summary = ctx.executor().apply_plan(&plan, dry_run).await?;
    if output.json {
        print_json(&summary)?;
    } else {
        print_migration_summary(&summary);
    }
    Ok(Outcome::Success)
}

fn print_migration_summary(summary: &MigrationSummary) {
    if summary.is_noop() {
        println!("Schema is up to date ({} migration(s) already applied)", summary.skipped.len());
        return;
    }
    if summary.dry_run {
        println!("Would apply: {}", format_versions(&summary.pending));
        return;
    }
    println!("Applied: {}", format_versions(&summary.applied));
    for step in &summary.steps {
        let rows = match (step.rows_before, step.rows_after) {
            (Some(before), Some(after)) => format!(" rows {before} -> {after}"),
            _ => String::new(),
        };
        let cols = match (step.columns_before, step.columns_after) {
            (Some(before), Some(after)) if before != after => format!(" columns {before} -> {after}"),
            _ => String::new(),
        };
        println!("  v{:<4} {:<40} {:?}{rows}{cols}", step.version, step.step, step.action);
    }
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
}

// ── status / history / ledger ────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusReport {
    latest_applied_version: Option<i64>,
    /// `None` when no plan file could be read.
    pending: Option<Vec<i64>>,
    failed: Vec<i64>,
    backfills: Vec<BackfillJob>,
}

pub async fn status(ctx: &Context, output: Output) -> Result<Outcome> {
    let latest_applied_version = ctx.db.latest_applied_version().await?;
    let failed = ctx
        .db
        .ledger_entries()
        .await?
        .into_iter()
        .filter(|r| r.status == MigrationStatus::Failed)
        .map(|r| r.version)
        .collect();
    let pending = match ctx.plan() {
        Ok(plan) => Some(
            ctx.executor()
                .pending(&plan)
                .await?
                .into_iter()
                .map(|m| m.version)
                .collect(),
        ),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "plan unavailable; pending migrations unknown");
            None
        }
    };
    let report = StatusReport {
        latest_applied_version,
        pending,
        failed,
        backfills: ctx.runner().list().await?,
    };

    if output.json {
        print_json(&report)?;
        return Ok(Outcome::Success);
    }
    match report.latest_applied_version {
        Some(v) => println!("Latest applied version: {v}"),
        None => println!("Latest applied version: none"),
    }
    match &report.pending {
        Some(p) if p.is_empty() => println!("Pending: none"),
        Some(p) => println!("Pending: {}", format_versions(p)),
        None => println!("Pending: unknown (no plan)"),
    }
    if !report.failed.is_empty() {
        println!("Failed: {}", format_versions(&report.failed));
    }
    if !report.backfills.is_empty() {
        println!();
        print_jobs(&report.backfills);
    }
    Ok(Outcome::Success)
}

pub async fn history(ctx: &Context, after: Option<i64>, output: Output) -> Result<Outcome> {
    let records: Vec<MigrationRecord> = ctx.db.history_from(after).try_collect().await?;
    if output.json {
        print_json(&records)?;
        return Ok(Outcome::Success);
    }
    for r in &records {
        let when = r.applied_at.unwrap_or(r.attempted_at);
        println!(
            "{:>6}  {:<12} {}  {}",
            r.version,
            r.status,
            format_ts(when),
            r.description
        );
        if let Some(detail) = &r.error_detail {
            println!("        {detail}");
        }
    }
    Ok(Outcome::Success)
}

pub async fn ledger_rollback(ctx: &Context, version: i64) -> Result<Outcome> {
    let record = ctx.db.mark_rolled_back(version).await?;
    info!(version, "ledger entry marked rolled back");
    println!("Migration {} ({}) marked {}", record.version, record.description, record.status);
    Ok(Outcome::Success)
}

// ── backfill ─────────────────────────────────────────────────────────

pub async fn backfill_start(ctx: &Context, job_id: &str, no_run: bool) -> Result<Outcome> {
    let plan = ctx.plan()?;
    let def = plan
        .backfill(job_id)
        .ok_or_else(|| anyhow!("backfill {job_id} is not declared in the plan"))?;
    let job = ctx.runner().start(def).await?;
    println!(
        "Registered {} on {}: {} row(s) pending",
        job.job_id, job.target_table, job.initial_pending
    );
    if no_run {
        return Ok(Outcome::Success);
    }
    run_jobs(ctx, &plan, &[job_id.to_string()]).await
}

pub async fn backfill_resume(ctx: &Context, job_ids: &[String]) -> Result<Outcome> {
    let plan = ctx.plan()?;
    run_jobs(ctx, &plan, job_ids).await
}

/// Run the given jobs concurrently until each completes, pauses or fails.
/// Ctrl-C pauses all of them at their next batch boundary.
async fn run_jobs(ctx: &Context, plan: &Plan, job_ids: &[String]) -> Result<Outcome> {
    let mut defs = Vec::with_capacity(job_ids.len());
    for id in job_ids {
        let def = plan
            .backfill(id)
            .ok_or_else(|| anyhow!("backfill {id} is not declared in the plan"))?;
        defs.push(def);
    }

    let needs_api = defs
        .iter()
        .any(|d| matches!(d.transform, TransformDef::Upstream { .. }));
    let source: Option<Arc<dyn UpstreamSource>> = if needs_api {
        Some(create_source(&ctx.config.upstream)?)
    } else {
        None
    };
    // One budget shared by every job in this process
    let pacer = Arc::new(RequestPacer::new(ctx.config.upstream.requests_per_second));

    let runner = Arc::new(ctx.runner());
    let registry = Arc::new(JobRegistry::new());
    let render = progress::render(registry.subscribe(), defs.len());

    let mut spawned = Vec::with_capacity(defs.len());
    for def in defs {
        let transform = build_transform(&def.transform, source.clone(), Arc::clone(&pacer))?;
        spawned.push((def.job_id.clone(), runner.spawn(&registry, def.job_id.clone(), transform)));
    }

    let interrupt = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, pausing at the next batch boundary");
                registry.cancel_all();
            }
        })
    };

    let mut finished = Vec::new();
    let mut first_error = None;
    for (job_id, job) in spawned {
        match job.wait().await {
            Ok(job) => finished.push(job),
            Err(e) => {
                eprintln!("{job_id}: {e}");
                first_error.get_or_insert(anyhow::Error::new(e).context(format!("backfill {job_id}")));
            }
        }
    }
    interrupt.abort();
    let _ = tokio::time::timeout(std::time::Duration::from_millis(250), render).await;

    for job in &finished {
        print_job_line(job);
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    if finished.iter().any(|j| j.status == JobStatus::Paused) {
        return Ok(Outcome::Paused);
    }
    Ok(Outcome::Success)
}

pub async fn backfill_pause(ctx: &Context, job_id: &str) -> Result<Outcome> {
    let job = ctx.runner().pause(job_id).await?;
    print_job_line(&job);
    Ok(Outcome::Success)
}

pub async fn backfill_list(ctx: &Context, output: Output) -> Result<Outcome> {
    let jobs = ctx.runner().list().await?;
    if output.json {
        print_json(&jobs)?;
    } else if jobs.is_empty() {
        println!("No backfill jobs");
    } else {
        print_jobs(&jobs);
    }
    Ok(Outcome::Success)
}

fn print_jobs(jobs: &[BackfillJob]) {
    println!(
        "{:<24} {:<10} {:>10} {:>10} {:>10}  {:<12} {}",
        "JOB", "STATUS", "EXAMINED", "UPDATED", "SKIPPED", "CURSOR", "UPDATED AT"
    );
    for j in jobs {
        let cursor = j
            .checkpoint_cursor
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<24} {:<10} {:>10} {:>10} {:>10}  {:<12} {}",
            j.job_id,
            j.status,
            j.rows_examined_total,
            j.rows_updated_total,
            j.rows_skipped_total,
            cursor,
            format_ts(j.updated_at)
        );
    }
}

fn print_job_line(job: &BackfillJob) {
    let cursor = job
        .checkpoint_cursor
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "start".into());
    println!(
        "{}: {} ({} examined, {} updated, {} skipped, cursor {cursor})",
        job.job_id, job.status, job.rows_examined_total, job.rows_updated_total, job.rows_skipped_total
    );
    if let Some(detail) = &job.error_detail {
        println!("  {detail}");
    }
}

// ── verify ───────────────────────────────────────────────────────────

/// Pick the plan entries to check; `--threshold` replaces per-entry thresholds.
pub fn select_verifications(
    plan: &Plan,
    table: Option<&str>,
    threshold: Option<f64>,
) -> Result<Vec<VerificationDef>> {
    let mut defs: Vec<VerificationDef> = plan
        .verifications
        .iter()
        .filter(|v| table.map_or(true, |t| v.table == t))
        .cloned()
        .collect();
    if let Some(t) = table {
        if defs.is_empty() {
            return Err(anyhow!("no verification declared for table {t}"));
        }
    }
    if let Some(threshold) = threshold {
        for def in &mut defs {
            def.coverage_threshold = Some(threshold);
        }
    }
    Ok(defs)
}

pub async fn verify(
    ctx: &Context,
    table: Option<&str>,
    threshold: Option<f64>,
    output: Output,
) -> Result<Outcome> {
    let plan = ctx.plan()?;
    let defs = select_verifications(&plan, table, threshold)?;
    let verifier =
        Verifier::new(ctx.db.clone()).with_threshold(ctx.config.verify.coverage_threshold);

    let mut reports = Vec::with_capacity(defs.len());
    for def in &defs {
        reports.push(verifier.run(def).await?);
    }

    if output.json {
        print_json(&reports)?;
    } else if reports.is_empty() {
        println!("Nothing to verify");
    } else {
        for report in &reports {
            print_report(report);
        }
    }

    if reports.iter().all(ReconciliationReport::is_clean) {
        Ok(Outcome::Success)
    } else {
        Ok(Outcome::AttentionNeeded)
    }
}

fn print_report(report: &ReconciliationReport) {
    println!(
        "{} ({} rows, threshold {:.1}%)",
        report.table_name, report.total_rows, report.threshold
    );
    for c in &report.columns {
        println!(
            "  {:<24} {:>8} populated  {:>6.2}%  {:?}",
            c.column, c.populated_rows, c.coverage_pct, c.status
        );
    }
    for finding in &report.findings {
        println!("  ! {finding}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
[[verifications]]
table = "horses"
columns = ["sire_id"]
coverage_threshold = 99.0

[[verifications]]
table = "races"
columns = ["going"]
"#;

    #[test]
    fn test_select_all_verifications() {
        let plan = Plan::from_toml_str(PLAN).unwrap();
        let defs = select_verifications(&plan, None, None).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].coverage_threshold, Some(99.0));
        assert_eq!(defs[1].coverage_threshold, None);
    }

    #[test]
    fn test_select_by_table_with_threshold_override() {
        let plan = Plan::from_toml_str(PLAN).unwrap();
        let defs = select_verifications(&plan, Some("horses"), Some(90.0)).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].coverage_threshold, Some(90.0));
    }

    #[test]
    fn test_select_unknown_table_errors() {
        let plan = Plan::from_toml_str(PLAN).unwrap();
        assert!(select_verifications(&plan, Some("jockeys"), None).is_err());
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01 00:00:00");
        assert_eq!(format_versions(&[1, 2, 18]), "1, 2, 18");
    }
}
