/*
 * Workspaces Platform - Runtime Controller
 * Copyright (C) 2025 Workspaces Platform
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Signing proxy sidecar
//!
//! Validates the caller's signed token on every listener and forwards
//! accepted requests to the server it guards on localhost.

use anyhow::Context;
use clap::Parser;
use runtime_controller::server::proxy;
use runtime_controller::server::signer::ProxyConfig;
use runtime_controller::server::token::{PublicKeyFile, VerifyingKey};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "signer-proxy")]
#[command(about = "Token-validating proxy for secured workspace servers")]
#[command(version)]
struct Cli {
    /// Listener configuration rendered by the controller
    #[arg(long, env = "SIGNER_PROXY_CONFIG")]
    config: String,

    /// Public half of the workspace's signing key
    #[arg(long, env = "SIGNER_PROXY_KEY")]
    key: String,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read proxy configuration {}", cli.config))?;
    let config: ProxyConfig =
        serde_json::from_str(&raw).context("Failed to parse proxy configuration")?;

    let raw_key = std::fs::read_to_string(&cli.key)
        .with_context(|| format!("Failed to read public key {}", cli.key))?;
    let key_file: PublicKeyFile = serde_json::from_str(&raw_key).context("Failed to parse public key")?;
    let key = VerifyingKey::from_public_key_file(&key_file).context("Invalid public key")?;

    info!(
        workspace_id = %config.workspace_id,
        listeners = config.listeners.len(),
        key_id = %key.key_id(),
        "Starting signer proxy v{}",
        env!("CARGO_PKG_VERSION")
    );
    proxy::run(config, key).await
}
