//! `marathon cancel`: idempotent cancellation of a task the caller owns.

use marathon_core::task::Task;

use crate::http_client::{resolve_client, CliError};

pub async fn run(address: Option<&str>, port: Option<u16>, task_id: &str) -> Result<(), CliError> {
    let client = resolve_client(address, port).map_err(|e| CliError::usage(e.to_string()))?;
    let task: Task = client.delete(&format!("/tasks/{task_id}")).await?;
    println!("Task {} is now {}.", task.id, task.state);
    Ok(())
}
