use anyhow::{Context, Result};
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

/// 拦截隧道中只解析 HTTP/1.1
const HTTP11_ALPN: &[u8] = b"http/1.1";

/// 读取 PEM 证书链
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {:?}", path);
    }
    Ok(certs)
}

/// 读取 PEM 私钥
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .context("Failed to parse private key")?
        .context("No private key found")
}

/// 加载面向客户端的拦截证书（TLS 服务端角色）
pub fn load_mitm_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to create server config")?;

    // 不宣告 h2，确保客户端在隧道内使用 HTTP/1.1
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];

    Ok(Arc::new(config))
}

/// 加载连接真实目标的 TLS 配置（TLS 客户端角色，标准信任校验）
///
/// 使用系统根证书；`extra_ca_path` 中的证书作为额外的信任锚加入。
pub fn load_upstream_client_config(extra_ca_path: Option<&Path>) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs();
    for err in &native_certs.errors {
        tracing::warn!("Failed to load a native root certificate: {}", err);
    }
    for cert in native_certs.certs {
        root_store.add(cert).ok();
    }

    if let Some(ca_path) = extra_ca_path {
        for cert in load_certs(ca_path)? {
            root_store
                .add(cert)
                .context("Failed to add CA certificate")?;
        }
    }

    Ok(client_config_with_roots(root_store))
}

/// 仅信任给定 CA 的客户端配置（测试或封闭环境使用）
pub fn client_config_trusting(ca_path: &Path) -> Result<Arc<rustls::ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        root_store
            .add(cert)
            .context("Failed to add CA certificate")?;
    }
    Ok(client_config_with_roots(root_store))
}

fn client_config_with_roots(root_store: rustls::RootCertStore) -> Arc<rustls::ClientConfig> {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Arc::new(config)
}

/// 生成自签名证书和私钥并写入指定路径
pub fn generate_self_signed_cert(
    common_name: &str,
    alt_names: &[String],
    cert_out: &Path,
    key_out: &Path,
) -> Result<()> {
    // rcgen 至少需要一个 SAN；确保包含 CN
    let mut names: Vec<String> = if alt_names.is_empty() {
        vec![common_name.to_string()]
    } else {
        alt_names.to_vec()
    };

    if !names.iter().any(|n| n == common_name) {
        names.push(common_name.to_string());
    }

    let cert =
        generate_simple_self_signed(names).context("Failed to generate self-signed certificate")?;
    let cert_pem = cert.cert.pem();
    let key_pem = cert.signing_key.serialize_pem();

    std::fs::write(cert_out, cert_pem)
        .with_context(|| format!("Failed to write certificate to {:?}", cert_out))?;
    std::fs::write(key_out, key_pem)
        .with_context(|| format!("Failed to write private key to {:?}", key_out))?;

    Ok(())
}
