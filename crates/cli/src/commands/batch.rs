// Batch command: drive a synthetic batch through the pool and report on it

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use raytask_pool::{
    AtomicPoolMetrics, MetricsSnapshot, PoolConfig, PoolError, RunSummary, ShutdownMode, Task,
    TaskOutput, WorkerPool,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::output::{print_field, OutputFormat};

/// Granularity at which synthetic work polls its cancellation scope
const WORK_SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct BatchArgs {
    pub tasks: usize,
    pub work: Duration,
    /// Every n-th task reports an error (0 = never)
    pub fail_every: usize,
    /// Every n-th task panics (0 = never)
    pub panic_every: usize,
    pub foreground: bool,
    pub shutdown: ShutdownMode,
    pub task_timeout: Option<Duration>,
}

#[derive(Debug, Serialize)]
struct BatchReport {
    summary: RunSummary,
    metrics: MetricsSnapshot,
    errors: Vec<TaskErrorLine>,
}

#[derive(Debug, Serialize)]
struct TaskErrorLine {
    name: String,
    state: String,
    error: String,
}

fn every(n: usize, index: usize) -> bool {
    n > 0 && (index + 1) % n == 0
}

/// Work function: args are `[index, work_ms, fail_every, panic_every]`
fn synthetic_work(_outer: &CancellationToken, inner: &CancellationToken, args: &[Value]) -> TaskOutput {
    let params: Vec<u64> = args.iter().filter_map(Value::as_u64).collect();
    let &[index, work_ms, fail_every, panic_every] = params.as_slice() else {
        return TaskOutput::err(anyhow!("expected [index, work_ms, fail_every, panic_every], got {:?}", args));
    };
    let index = index as usize;

    if every(panic_every as usize, index) {
        panic!("synthetic panic in task {}", index);
    }

    let mut slices = 0u64;
    let deadline = std::time::Instant::now() + Duration::from_millis(work_ms);
    while std::time::Instant::now() < deadline {
        if inner.is_cancelled() {
            return TaskOutput::err(anyhow!("task {} cancelled after {} slices", index, slices));
        }
        std::thread::sleep(WORK_SLICE);
        slices += 1;
    }

    let output = TaskOutput::ok(vec![json!({ "index": index, "slices": slices })]);
    if every(fail_every as usize, index) {
        return output.with_error(anyhow!("synthetic failure in task {}", index));
    }
    output
}

fn build_tasks(facade: &WorkerPool, args: &BatchArgs) -> Result<Vec<Task>, PoolError> {
    (0..args.tasks)
        .map(|index| -> Result<Task, PoolError> {
            let task = facade.task(
                format!("task-{}", index),
                synthetic_work,
                vec![
                    json!(index),
                    json!(args.work.as_millis() as u64),
                    json!(args.fail_every),
                    json!(args.panic_every),
                ],
            )?;
            Ok(match args.task_timeout {
                Some(limit) => task.with_timeout(limit),
                None => task,
            })
        })
        .collect()
}

pub async fn run(
    args: &BatchArgs,
    config: PoolConfig,
    output: OutputFormat,
    root: &CancellationToken,
) -> Result<()> {
    if args.tasks == 0 {
        bail!("batch must contain at least one task");
    }

    let metrics = Arc::new(AtomicPoolMetrics::new());
    let facade = WorkerPool::with_metrics(Some(root), 1, "batch", config, metrics.clone());
    let tasks = build_tasks(&facade, args).context("Failed to build tasks")?;

    info!(
        tasks = args.tasks,
        foreground = args.foreground,
        shutdown = %args.shutdown,
        "Running batch"
    );

    let summary = if args.foreground {
        let summary = facade.pool().run_foreground(&tasks).await;
        facade
            .shutdown(args.shutdown)
            .await
            .context("Failed to shut down worker pool")?;
        summary.context("Foreground batch failed")?
    } else {
        facade.start().context("Failed to start worker pool")?;
        let summary = facade.submit_batch(&tasks).await;
        facade
            .shutdown(args.shutdown)
            .await
            .context("Failed to shut down worker pool")?;
        summary.context("Batch submission failed")?
    };

    let errors = tasks
        .iter()
        .filter_map(|task| {
            task.error().map(|error| TaskErrorLine {
                name: task.name(),
                state: task.state().to_string(),
                error: error.to_string(),
            })
        })
        .collect();
    for task in tasks {
        facade.recycle(task);
    }

    let report = BatchReport {
        summary,
        metrics: metrics.snapshot(),
        errors,
    };
    print_report(&report, output)
}

fn print_report(report: &BatchReport, output: OutputFormat) -> Result<()> {
    if !output.is_text() {
        return output.print_value(report);
    }

    let summary = &report.summary;
    print_field("Tasks", &summary.total.to_string());
    print_field("Succeeded", &summary.succeeded.to_string());
    print_field("Failed", &summary.failed.to_string());
    if summary.stopped > 0 {
        print_field("Stopped", &summary.stopped.to_string());
    }
    if summary.panicked > 0 {
        print_field("Panicked", &summary.panicked.to_string());
    }
    if summary.timed_out > 0 {
        print_field("Timed out", &summary.timed_out.to_string());
    }
    if summary.pending > 0 {
        print_field("Not run", &summary.pending.to_string());
    }
    print_field("Elapsed", &format!("{}ms", summary.elapsed.as_millis()));
    print_field(
        "Busy time",
        &format!("{}ms", report.metrics.busy_time.as_millis()),
    );
    print_field("Worker restarts", &report.metrics.worker_respawns.to_string());
    print_field("Tasks recycled", &report.metrics.tasks_released.to_string());

    if !report.errors.is_empty() {
        println!();
        for line in &report.errors {
            println!("{} [{}]: {}", line.name, line.state, line.error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(tasks: usize) -> BatchArgs {
        BatchArgs {
            tasks,
            work: Duration::ZERO,
            fail_every: 0,
            panic_every: 0,
            foreground: false,
            shutdown: ShutdownMode::Soft,
            task_timeout: None,
        }
    }

    fn config() -> PoolConfig {
        PoolConfig::new()
            .with_worker_concurrency(2)
            .with_task_queue_size(4)
            .with_worker_poll_interval(Duration::from_millis(2))
    }

    #[test]
    fn test_every() {
        assert!(!every(0, 0));
        assert!(every(1, 0));
        assert!(every(3, 2));
        assert!(!every(3, 3));
    }

    #[test]
    fn test_synthetic_work_fails_on_schedule() {
        let scope = CancellationToken::new();
        let inner = scope.child_token();

        let ok = synthetic_work(&scope, &inner, &[json!(0), json!(0), json!(2), json!(0)]);
        assert!(ok.error.is_none());
        assert_eq!(ok.results[0]["index"], 0);

        let failed = synthetic_work(&scope, &inner, &[json!(1), json!(0), json!(2), json!(0)]);
        assert!(failed.error.is_some());
        assert_eq!(failed.results.len(), 1);
    }

    #[test]
    fn test_synthetic_work_observes_cancellation() {
        let scope = CancellationToken::new();
        let inner = scope.child_token();
        scope.cancel();

        let output = synthetic_work(&scope, &inner, &[json!(0), json!(1000), json!(0), json!(0)]);
        assert!(output.error.is_some());
        assert!(output.results.is_empty());
    }

    #[test]
    fn test_synthetic_work_rejects_bad_args() {
        let scope = CancellationToken::new();
        let output = synthetic_work(&scope, &scope.child_token(), &[json!("x")]);
        assert!(output.error.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_background_batch_completes() {
        let args = BatchArgs {
            fail_every: 3,
            ..args(12)
        };
        run(&args, config(), OutputFormat::Json, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_foreground_batch_with_panics_completes() {
        let args = BatchArgs {
            panic_every: 4,
            foreground: true,
            shutdown: ShutdownMode::Hard,
            ..args(8)
        };
        run(&args, config(), OutputFormat::Json, &CancellationToken::new())
            .await
            .unwrap();
    }
}
