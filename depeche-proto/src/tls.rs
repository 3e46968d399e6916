use std::sync::Arc;

use anyhow::{Context, Result};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use depeche_user::config::TlsConfig;

/// Load the configured certificate and key into an acceptor usable for
/// implicit TLS (IMAP/POP3) and STARTTLS (LMTP/ManageSieve) alike.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut std::io::BufReader::new(
        std::fs::File::open(&config.cert_file)
            .with_context(|| format!("opening {}", config.cert_file.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(
        std::fs::File::open(&config.key_file)
            .with_context(|| format!("opening {}", config.key_file.display()))?,
    ))?
    .context("no private key found")?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
