use anyhow::{Context, Result};

const SERVER_TEMPLATE: &str = r#"# relay-mitm-proxy server (local proxy / relay accept side)

[server]
bind_addr = "127.0.0.1"
bind_port = 8888
connect_timeout_secs = 15
idle_timeout_secs = 300

# TLS interception; remove this section to tunnel all CONNECT requests unmodified
[mitm]
enabled = true
cert_path = "mitm-cert.pem"
key_path = "mitm-key.pem"
# empty list = intercept every port-443 host
hosts = ["api.openai.com"]
# upstream_ca_path = "extra-ca.pem"
max_header_bytes = 65536
max_body_bytes = 1048576

[mitm.rewrite]
enabled = true
model = "gpt-5-mini"
temperature = 1.0

# Relay registration; remove this section for direct outbound connections
[relay]
enabled = true
passkey = "change-me"
command_timeout_secs = 15
route_http = true
"#;

const CLIENT_TEMPLATE: &str = r#"# relay-mitm-proxy client (relay dial side)

[client]
server_addr = "proxy.example.net"
server_port = 8888
passkey = "change-me"
reconnect_delay_secs = 5
connect_timeout_secs = 15
idle_timeout_secs = 300
"#;

/// 模板内容
pub fn template_content(template_type: &str) -> Result<&'static str> {
    match template_type {
        "server" => Ok(SERVER_TEMPLATE),
        "client" => Ok(CLIENT_TEMPLATE),
        other => anyhow::bail!("Unknown template type: {}", other),
    }
}

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = template_content(template_type)?;

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
