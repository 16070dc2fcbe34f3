//! A thin `reqwest` client against the orchestrator's HTTP gateway.
//!
//! Every command-mode subcommand (`submit`, `status`, `cancel`, `usage`,
//! `login`, `register`) goes through here rather than touching the
//! database or the façade directly -- the CLI is a client of the gateway,
//! the same way `gator-cli`'s commands were callers of its local pool.

use std::fmt;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::MarathonConfig;

/// A command-level failure, carrying the exit code §6 assigns it.
#[derive(Debug)]
pub struct CliError {
    pub exit_code: i32,
    pub message: String,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CliError {}

impl CliError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self { exit_code: 1, message: message.into() }
    }
    pub fn server(message: impl Into<String>) -> Self {
        Self { exit_code: 2, message: message.into() }
    }
    pub fn connection(message: impl Into<String>) -> Self {
        Self { exit_code: 3, message: message.into() }
    }
}

pub struct GatewayClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(config: &MarathonConfig) -> Self {
        Self { http: reqwest::Client::new(), base_url: config.gateway_url(), token: None }
    }

    /// Attach the bearer token saved by a prior `login`/`register`. Every
    /// command except `login`/`register` themselves needs this.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn require_token(&self) -> Result<&str, CliError> {
        self.token.as_deref().ok_or_else(|| {
            CliError::usage("not logged in; run `marathon login` or `marathon register` first")
        })
    }

    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, CliError> {
        let token = self.require_token()?.to_string();
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(connection_error)?;
        handle_response(resp).await
    }

    pub async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B, authed: bool) -> Result<R, CliError> {
        let mut req = self.http.post(format!("{}{path}", self.base_url)).json(body);
        if authed {
            req = req.bearer_auth(self.require_token()?.to_string());
        }
        let resp = req.send().await.map_err(connection_error)?;
        handle_response(resp).await
    }

    pub async fn delete<R: DeserializeOwned>(&self, path: &str) -> Result<R, CliError> {
        let token = self.require_token()?.to_string();
        let resp = self
            .http
            .delete(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(connection_error)?;
        handle_response(resp).await
    }

    /// Open a raw streaming GET (used by `submit --follow`'s SSE read) --
    /// the caller pumps `bytes_stream()` itself rather than deserializing
    /// a single JSON body.
    pub async fn get_stream(&self, path: &str) -> Result<reqwest::Response, CliError> {
        let token = self.require_token()?.to_string();
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(connection_error)?;
        if !resp.status().is_success() {
            return Err(server_error_from_status(resp.status()));
        }
        Ok(resp)
    }
}

fn connection_error(err: reqwest::Error) -> CliError {
    CliError::connection(format!("failed to reach orchestrator gateway: {err}"))
}

fn server_error_from_status(status: reqwest::StatusCode) -> CliError {
    CliError::server(format!("orchestrator gateway returned {status}"))
}

async fn handle_response<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, CliError> {
    let status = resp.status();
    if status.is_success() {
        resp.json::<R>().await.map_err(|e| CliError::server(format!("malformed response body: {e}")))
    } else {
        #[derive(serde::Deserialize)]
        struct ErrBody {
            code: String,
            message: String,
        }
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrBody>(&text) {
            Ok(body) => Err(CliError::server(format!("{} ({}): {}", status, body.code, body.message))),
            Err(_) => Err(CliError::server(format!("{status}: {text}"))),
        }
    }
}

/// Load the saved config and session token, as every gateway-talking
/// command needs both.
pub fn resolve_client(cli_address: Option<&str>, cli_port: Option<u16>) -> Result<GatewayClient> {
    let config = MarathonConfig::resolve(cli_address, cli_port, None).context("failed to resolve marathon configuration")?;
    let token = crate::config::load_config().ok().and_then(|c| c.session.token);
    Ok(GatewayClient::new(&config).with_token(token))
}
