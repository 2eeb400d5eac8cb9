pub mod cert;
pub mod commands;
pub mod config;
pub mod template;

use clap::{Parser, Subcommand};

pub use commands::execute_command;

#[derive(Parser, Debug)]
#[command(name = "relay-mitm-proxy")]
#[command(author, version, about = "Local forward proxy with TLS interception and NAT relay", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志详细程度（-v info，-vv debug，-vvv trace）
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行本地代理（接受端）
    Server {
        /// 配置文件路径
        #[arg(short, long, default_value = "server.toml")]
        config: String,
    },
    /// 运行中继拨号端
    Client {
        /// 配置文件路径
        #[arg(short, long, default_value = "client.toml")]
        config: String,
    },
    /// 检查配置文件格式是否正确
    Check {
        /// 配置文件路径
        #[arg(short, long)]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
    /// 生成配置模板
    Template {
        /// 模板类型 (server, client)
        #[arg(value_parser = ["server", "client"])]
        template_type: String,

        /// 输出文件路径（省略则打印到标准输出）
        #[arg(short, long)]
        output: Option<String>,
    },
    /// 生成自签名证书（可用作拦截证书）
    Cert {
        /// 证书输出路径
        #[arg(long, default_value = "mitm-cert.pem")]
        cert_out: String,

        /// 私钥输出路径
        #[arg(long, default_value = "mitm-key.pem")]
        key_out: String,

        /// 证书的 Common Name
        #[arg(long, default_value = "localhost")]
        common_name: String,

        /// 证书的 SubjectAltName（用逗号分隔多个）
        #[arg(long, value_delimiter = ',', value_name = "DNS,...")]
        alt_names: Vec<String>,
    },
}
