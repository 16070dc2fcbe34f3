//! `marathon submit`: build a `TaskPayload` from flags, POST it to the
//! gateway, and (with `-f/--follow`) stream its lifecycle to stdout.

use futures::StreamExt;

use marathon_core::event::{Delivery, TaskEventKind};
use marathon_core::task::{EnvVar, Task, TaskPayload, TaskState};

use crate::http_client::{resolve_client, CliError};

#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub repo: String,
    pub branch: String,
    pub prompt: String,
    pub create_pr: bool,
    pub pr_title: Option<String>,
    pub pr_body: Option<String>,
    pub env: Vec<String>,
    pub max_iterations: u32,
    pub completion_promise: Option<String>,
    pub follow: bool,
}

fn parse_env_var(raw: &str) -> Result<EnvVar, CliError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok(EnvVar { key: key.to_string(), value: value.to_string() }),
        _ => Err(CliError::usage(format!("invalid -e value {raw:?}, expected KEY=VALUE"))),
    }
}

pub async fn run(address: Option<&str>, port: Option<u16>, args: SubmitArgs) -> Result<(), CliError> {
    if args.repo.trim().is_empty() {
        return Err(CliError::usage("--repo is required"));
    }
    if args.prompt.trim().is_empty() {
        return Err(CliError::usage("--prompt is required"));
    }

    let env_vars = args.env.iter().map(|s| parse_env_var(s)).collect::<Result<Vec<_>, _>>()?;

    let payload = TaskPayload {
        repo_url: args.repo,
        branch: args.branch,
        prompt: args.prompt,
        github_token: std::env::var("GITHUB_TOKEN").ok(),
        create_pr: args.create_pr,
        pr_title: args.pr_title,
        pr_body: args.pr_body,
        env_vars,
        max_iterations: args.max_iterations,
        completion_promise: args.completion_promise,
        required_capabilities: Vec::new(),
    };

    let client = resolve_client(address, port).map_err(|e| CliError::usage(e.to_string()))?;
    let task: Task = client.post("/tasks", &payload, true).await?;
    println!("Submitted task {} (state: {})", task.id, task.state);

    if !args.follow {
        return Ok(());
    }

    follow(&client, task.id.to_string()).await
}

async fn follow(client: &crate::http_client::GatewayClient, task_id: String) -> Result<(), CliError> {
    let resp = client.get_stream(&format!("/tasks/{task_id}/events?from_sequence=0")).await?;
    let mut stream = resp.bytes_stream();
    let mut buf = String::new();
    let mut terminal = false;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CliError::connection(format!("event stream interrupted: {e}")))?;
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find("\n\n") {
            let block: String = buf.drain(..pos + 2).collect();
            if let Some(delivery) = parse_sse_block(&block) {
                if print_delivery(delivery) {
                    terminal = true;
                }
            }
        }

        if terminal {
            break;
        }
    }

    if terminal {
        let task: Task = client.get(&format!("/tasks/{task_id}")).await?;
        match task.state {
            TaskState::Completed => {
                if let Some(pr_url) = task.pr_url {
                    println!("Completed. Pull request: {pr_url}");
                } else {
                    println!("Completed.");
                }
            }
            TaskState::Failed => {
                println!("Failed: {}", task.error_message.unwrap_or_else(|| "no error message reported".to_string()));
            }
            TaskState::Cancelled => println!("Cancelled."),
            other => println!("Stream ended in unexpected state {other}"),
        }
    }

    Ok(())
}

/// Parse one `\n\n`-terminated SSE block into a [`Delivery`], returning
/// `None` for keep-alive comments and anything else that is not a data
/// event this stream emits.
fn parse_sse_block(block: &str) -> Option<Delivery> {
    let mut event_name = None;
    let mut data = None;
    for line in block.lines() {
        if let Some(name) = line.strip_prefix("event: ") {
            event_name = Some(name.to_string());
        } else if let Some(d) = line.strip_prefix("data: ") {
            data = Some(d.to_string());
        }
    }
    match (event_name.as_deref(), data) {
        (Some("event"), Some(data)) => serde_json::from_str(&data).ok().map(Delivery::Event),
        (Some("gap"), Some(data)) => serde_json::from_str::<Delivery>(&data).ok(),
        (Some("recovered"), _) => Some(Delivery::Recovered),
        _ => None,
    }
}

/// Print one delivered item; returns `true` if it signals the task reached
/// a terminal state change.
fn print_delivery(delivery: Delivery) -> bool {
    match delivery {
        Delivery::Gap { from, to } => {
            println!("[gap: events {from}..={to} dropped, subscriber was lagging]");
            false
        }
        Delivery::Recovered => {
            println!("[stream resumed from a new sequence origin after an orchestrator restart]");
            false
        }
        Delivery::Event(event) => {
            let terminal = event.state.is_some_and(TaskState::is_terminal);
            match event.kind {
                TaskEventKind::StateChange => {
                    if let Some(state) = event.state {
                        println!("[{}] state -> {state}", event.sequence);
                    }
                }
                TaskEventKind::Log => println!("[{}] log: {}", event.sequence, String::from_utf8_lossy(&event.data)),
                TaskEventKind::Progress => {
                    println!("[{}] progress: {}", event.sequence, String::from_utf8_lossy(&event.data))
                }
                TaskEventKind::Usage => println!("[{}] usage reported", event.sequence),
            }
            terminal
        }
    }
}
