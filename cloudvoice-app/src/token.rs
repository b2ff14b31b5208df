use std::time::Duration;

use anyhow::{bail, Context};
use cloudvoice_core::TokenSource;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenReply {
    token: String,
}

/// Fetches a bearer token with a plain GET against `url`, expecting
/// `{"token": "..."}` back.
///
/// The blocking client is built per fetch so it never lives on (or is
/// dropped from) an async worker thread.
pub struct HttpTokenSource {
    url: String,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl TokenSource for HttpTokenSource {
    fn fetch_token(&self) -> anyhow::Result<String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building token client")?;
        let response = client
            .get(&self.url)
            .send()
            .with_context(|| format!("requesting token from {}", self.url))?;
        if !response.status().is_success() {
            bail!("token endpoint returned {}", response.status());
        }
        let reply: TokenReply = response.json().context("parsing token reply")?;
        debug!(len = reply.token.len(), "token fetched");
        Ok(reply.token)
    }
}
