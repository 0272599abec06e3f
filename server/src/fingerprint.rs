//! Trust-on-first-use certificate fingerprint capture.
//!
//! The first contact with a node records the SHA-256 fingerprint of its leaf
//! certificate; later connections pin against it. Re-capture only happens on
//! an explicit cluster refresh, never behind the user's back.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{format_err, Error};
use openssl::hash::MessageDigest;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

/// Connect to `host:port` and return the presented leaf certificate's
/// SHA-256 fingerprint as colon separated hex.
///
/// The chain is *not* verified; this is the capture half of TOFU pinning.
pub async fn fetch_fingerprint(host: &str, port: u16, timeout: Duration) -> Result<String, Error> {
    let host = host.to_string();
    let handshake = async move {
        let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;

        let mut connector = SslConnector::builder(SslMethod::tls_client())?;
        connector.set_verify(SslVerifyMode::NONE);

        let mut config = connector.build().configure()?;
        config.set_verify_hostname(false);

        let ssl = config.into_ssl(&host)?;
        let mut stream = tokio_openssl::SslStream::new(ssl, stream)?;
        Pin::new(&mut stream).connect().await?;

        let cert = stream
            .ssl()
            .peer_certificate()
            .ok_or_else(|| format_err!("no peer certificate presented"))?;
        let digest = cert.digest(MessageDigest::sha256())?;

        Ok::<_, Error>(format_fingerprint(&digest))
    };

    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| format_err!("timeout while fetching certificate from {port}"))?
}

/// Format a raw digest as the usual colon separated hex fingerprint.
pub fn format_fingerprint(digest: &[u8]) -> String {
    let hex = hex::encode(digest);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_formatting() {
        let digest = [0xabu8, 0xcd, 0x01, 0x23];
        assert_eq!(format_fingerprint(&digest), "ab:cd:01:23");
    }
}
