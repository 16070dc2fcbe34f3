//! `marathon usage`: the caller's rolling token/compute usage totals.

use marathon_core::task::UsageCounters;

use crate::http_client::{resolve_client, CliError};

pub async fn run(address: Option<&str>, port: Option<u16>) -> Result<(), CliError> {
    let client = resolve_client(address, port).map_err(|e| CliError::usage(e.to_string()))?;
    let usage: UsageCounters = client.get("/usage").await?;
    println!("input_tokens:    {}", usage.input_tokens);
    println!("output_tokens:   {}", usage.output_tokens);
    println!("compute_time_ms: {}", usage.compute_time_ms);
    println!("tool_calls:      {}", usage.tool_calls);
    Ok(())
}
