use anyhow::Result;
use std::path::Path;

use crate::tls;

/// 生成自签名证书
pub fn generate_certificate(
    cert_out: &str,
    key_out: &str,
    common_name: &str,
    alt_names: &[String],
) -> Result<()> {
    let cert_path = crate::config::expand_path(Path::new(cert_out));
    let key_path = crate::config::expand_path(Path::new(key_out));

    tls::generate_self_signed_cert(common_name, alt_names, &cert_path, &key_path)?;

    println!("Generated self-signed certificate: {}", cert_path.display());
    println!("Generated private key: {}", key_path.display());
    println!("Clients must trust this certificate before interception works.");

    Ok(())
}
