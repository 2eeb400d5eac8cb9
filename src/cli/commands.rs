use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    client,
    config::{expand_path, AppConfig},
    observer::TracingObserver,
    server,
};

use super::cert;
use super::config::{check_config, check_config_file_permissions};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = resolve_config_path(config);
            check_config(&config_path, format)?;
        }
        Commands::Template {
            template_type,
            output,
        } => {
            template::generate_config_template(template_type, output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
        Commands::Server { config } => {
            run_server(config).await?;
        }
        Commands::Client { config } => {
            run_client(config).await?;
        }
    }

    Ok(())
}

/// 展开配置文件路径（`~` 与环境变量）
fn resolve_config_path(config: &str) -> String {
    expand_path(Path::new(config))
        .to_string_lossy()
        .into_owned()
}

/// 运行本地代理
async fn run_server(config: &str) -> Result<()> {
    let config_path = resolve_config_path(config);
    check_config_file_permissions(&config_path)?;

    info!("Loading server configuration from: {}", config_path);
    let server_config = AppConfig::load_server_config(&config_path)?;

    server::run_server(server_config).await
}

/// 运行中继拨号端
async fn run_client(config: &str) -> Result<()> {
    let config_path = resolve_config_path(config);
    check_config_file_permissions(&config_path)?;

    info!("Loading client configuration from: {}", config_path);
    let client_config = AppConfig::load_client_config(&config_path)?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping client...");
            signal_token.cancel();
        }
    });

    client::run_client(client_config, Arc::new(TracingObserver), shutdown).await
}
