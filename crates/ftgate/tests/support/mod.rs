#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ftgate::{ProxyConfig, TlsSettings, TlsVersion};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn base_config(origin_addr: SocketAddr) -> ProxyConfig {
    ProxyConfig {
        listen_address: "127.0.0.1:0".to_string(),
        default_origin_address: origin_addr.to_string(),
        idle_timeout_seconds: 5,
        ..ProxyConfig::default()
    }
}

pub async fn read_line<R>(reader: &mut R) -> String
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    tokio::time::timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .expect("read line");
    line
}

pub async fn write_line<W>(writer: &mut W, line: &str)
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await.expect("write line");
    writer.write_all(b"\r\n").await.expect("write line ending");
    writer.flush().await.expect("flush line");
}

pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
    std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        now.as_nanos()
    ))
}

pub fn proxy_tls_settings() -> TlsSettings {
    let dir = unique_temp_dir("ftgate-proxy-cert");
    fs::create_dir_all(&dir).expect("create cert dir");

    let key = KeyPair::generate().expect("key pair");
    let params = CertificateParams::new(vec!["localhost".to_string()]).expect("cert params");
    let cert = params.self_signed(&key).expect("self signed cert");

    let cert_file = dir.join("proxy-cert.pem");
    let key_file = dir.join("proxy-key.pem");
    fs::write(&cert_file, cert.pem()).expect("write cert");
    fs::write(&key_file, key.serialize_pem()).expect("write key");

    TlsSettings {
        cert_file,
        key_file,
        min_version: TlsVersion::Tls12,
        max_version: TlsVersion::Tls13,
    }
}

pub fn origin_tls_server_config(host: &str) -> Arc<rustls::ServerConfig> {
    let key = KeyPair::generate().expect("key pair");
    let params = CertificateParams::new(vec![host.to_string()]).expect("cert params");
    let cert = params.self_signed(&key).expect("self signed cert");

    let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key_der)
        .expect("origin server config");
    Arc::new(config)
}
