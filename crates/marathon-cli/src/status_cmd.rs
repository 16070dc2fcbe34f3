//! `marathon status`: show one task's detail, or list every task the
//! caller owns when no task ID is given.

use marathon_core::task::Task;

use crate::http_client::{resolve_client, CliError};

fn status_icon(task: &Task) -> &'static str {
    use marathon_core::task::TaskState::*;
    match task.state {
        Unspecified => " ",
        Queued => ".",
        Starting => ">",
        Running => "*",
        Completed => "+",
        Failed => "!",
        Cancelled => "x",
    }
}

pub async fn run(address: Option<&str>, port: Option<u16>, task_id: Option<String>, state_filter: Option<String>) -> Result<(), CliError> {
    let client = resolve_client(address, port).map_err(|e| CliError::usage(e.to_string()))?;

    match task_id {
        Some(id) => {
            let task: Task = client.get(&format!("/tasks/{id}")).await?;
            print_task_detail(&task);
        }
        None => {
            let path = match state_filter {
                Some(s) => format!("/tasks?state={s}"),
                None => "/tasks".to_string(),
            };
            let tasks: Vec<Task> = client.get(&path).await?;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            for task in &tasks {
                println!(
                    "  [{}] {} {} ({}, retries={})",
                    status_icon(task),
                    task.id,
                    task.state,
                    task.payload.repo_url,
                    task.retry_count,
                );
            }
        }
    }

    Ok(())
}

fn print_task_detail(task: &Task) {
    println!("Task: {}", task.id);
    println!("State: {}", task.state);
    println!("Repo: {} ({})", task.payload.repo_url, task.payload.branch);
    println!("Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(started_at) = task.started_at {
        println!("Started: {}", started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed_at) = task.completed_at {
        println!("Completed: {}", completed_at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(node_id) = task.assigned_node_id {
        println!("Assigned node: {node_id}");
    }
    println!("Retries: {}", task.retry_count);
    println!(
        "Usage: input={} output={} compute_ms={} tool_calls={}",
        task.usage.input_tokens, task.usage.output_tokens, task.usage.compute_time_ms, task.usage.tool_calls
    );
    if let Some(pr_url) = &task.pr_url {
        println!("Pull request: {pr_url}");
    }
    if let Some(error_message) = &task.error_message {
        println!("Error: {error_message}");
    }
}
