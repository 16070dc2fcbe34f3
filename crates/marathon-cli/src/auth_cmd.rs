//! `marathon login` / `marathon register`: exchange credentials for a
//! bearer token against the gateway's `/auth/*` routes, then persist the
//! token into the config file's session section so every other command
//! can authenticate without asking again.

use crate::http_client::{resolve_client, CliError};
use crate::serve_cmd::{AuthResponse, CredentialsBody};

pub async fn run_register(address: Option<&str>, port: Option<u16>, username: &str, password: &str) -> Result<(), CliError> {
    run(address, port, "/auth/register", username, password, "registered").await
}

pub async fn run_login(address: Option<&str>, port: Option<u16>, username: &str, password: &str) -> Result<(), CliError> {
    run(address, port, "/auth/login", username, password, "logged in").await
}

async fn run(
    address: Option<&str>,
    port: Option<u16>,
    path: &str,
    username: &str,
    password: &str,
    verb: &str,
) -> Result<(), CliError> {
    let client = resolve_client(address, port).map_err(|e| CliError::usage(e.to_string()))?;
    let body = CredentialsBody { username: username.to_string(), password: password.to_string() };
    let resp: AuthResponse = client.post(path, &body, false).await?;

    if !resp.success {
        return Err(CliError::server(resp.message));
    }

    let token = resp.token.ok_or_else(|| CliError::server("gateway reported success with no token".to_string()))?;
    crate::config::save_session_token(&token).map_err(|e| CliError::server(e.to_string()))?;

    println!("{verb} as {username}.");
    if let Some(api_key) = resp.api_key {
        println!("API key (save this, it will not be shown again): {api_key}");
    }
    Ok(())
}
