use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use crate::config::{AppConfig, ClientConfig, ServerFullConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 口令以明文保存，其他用户可读时给出提示
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}); \
             it may contain the relay passkey. Consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    config_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

fn server_summary(config: &ServerFullConfig) -> (serde_json::Value, Vec<String>) {
    let mut warnings = Vec::new();
    let mut details = serde_json::json!({
        "bind_addr": config.server.bind_addr,
        "bind_port": config.server.bind_port,
        "connect_timeout_secs": config.server.connect_timeout_secs,
        "idle_timeout_secs": config.server.idle_timeout_secs,
    });

    if let Some(mitm) = config.active_mitm() {
        for path in [&mitm.cert_path, &mitm.key_path] {
            if !path.exists() {
                warnings.push(format!("File not found: {}", path.display()));
            }
        }
        details["mitm"] = serde_json::json!({
            "cert_path": mitm.cert_path,
            "key_path": mitm.key_path,
            "hosts": mitm.hosts,
            "rewrite": mitm.rewrite.as_ref().filter(|r| r.enabled).map(|r| serde_json::json!({
                "model": r.model,
                "temperature": r.temperature,
            })),
        });
    }

    if let Some(relay) = config.active_relay() {
        if relay.passkey.trim().is_empty() {
            warnings.push("relay.passkey is empty: any HELLO will be accepted".to_string());
        }
        details["relay"] = serde_json::json!({
            "passkey_length": relay.passkey.trim().len(),
            "command_timeout_secs": relay.command_timeout_secs,
            "route_http": relay.route_http,
        });
    }

    (details, warnings)
}

fn client_summary(config: &ClientConfig) -> (serde_json::Value, Vec<String>) {
    let mut warnings = Vec::new();
    if config.passkey.is_empty() {
        warnings.push("passkey is empty".to_string());
    }
    let details = serde_json::json!({
        "server_addr": config.server_addr,
        "server_port": config.server_port,
        "passkey_length": config.passkey.len(),
        "reconnect_delay_secs": config.reconnect_delay().as_secs(),
    });
    (details, warnings)
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);
    let json = format == "json";

    let loaded = if path.exists() {
        AppConfig::from_file(config_path)
    } else {
        Err(anyhow::anyhow!(
            "Configuration file not found: {}",
            config_path
        ))
    };

    let (config_type, details, warnings) = match &loaded {
        Ok(AppConfig::Server(config)) => {
            let (details, warnings) = server_summary(config);
            ("server", details, warnings)
        }
        Ok(AppConfig::Client(config)) => {
            let (details, warnings) = client_summary(config);
            ("client", details, warnings)
        }
        Err(_) => ("unknown", serde_json::json!({}), Vec::new()),
    };

    if json {
        let result = CheckResult {
            valid: loaded.is_ok(),
            config_type: config_type.to_string(),
            warnings: warnings.clone(),
            error: loaded.as_ref().err().map(|e| format!("{:#}", e)),
            details: details.clone(),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Checking configuration file: {}\n", config_path);
        match &loaded {
            Ok(_) => {
                println!("✓ Configuration type: {}", config_type);
                if let Some(obj) = details.as_object() {
                    for (key, value) in obj {
                        println!("✓ {}: {}", key, value);
                    }
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Err(e) => println!("✗ {:#}", e),
        }
    }

    loaded.map(|_| ())
}
