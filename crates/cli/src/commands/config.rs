// Config command: show the pool configuration a batch would use

use anyhow::Result;
use raytask_pool::PoolConfig;

use crate::output::{print_field, OutputFormat};

pub fn run(config: &PoolConfig, output: OutputFormat) -> Result<()> {
    let resolved = config.clone().resolved();

    if !output.is_text() {
        return output.print_value(&resolved);
    }

    print_field("Workers", &resolved.worker_concurrency.to_string());
    print_field("Queue size", &resolved.task_queue_size.to_string());
    print_field(
        "Shutdown timeout",
        &format!("{}ms", resolved.shutdown_timeout.as_millis()),
    );
    print_field(
        "Poll interval",
        &format!("{}ms", resolved.worker_poll_interval.as_millis()),
    );
    print_field("Respawn on fault", &resolved.respawn_on_fault.to_string());
    Ok(())
}
