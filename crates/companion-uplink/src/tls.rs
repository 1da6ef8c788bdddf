use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::client::WebPkiServerVerifier;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::cert_pin::PinnedCertVerifier;
use crate::codec::{StreamSink, StreamSource};
use crate::transport::{Connection, Connector, LinkError};
use crate::UplinkConfig;

/// `tls://host:port` -> (host, port)
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let ep = endpoint
        .strip_prefix("tls://")
        .context("endpoint must start with tls://")?;
    let (host, port) = ep.rsplit_once(':').context("endpoint is missing :port")?;
    anyhow::ensure!(!host.is_empty(), "endpoint is missing a host");
    let port = port.parse().with_context(|| format!("bad port in endpoint: {}", port))?;
    Ok((host.to_string(), port))
}

/// Client-certificate TLS to the ground server.
pub struct TlsConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn from_config(cfg: &UplinkConfig) -> Result<Self> {
        let (host, port) = parse_endpoint(&cfg.endpoint)?;

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca) = &cfg.ca_cert {
            for cert in CertificateDer::pem_file_iter(ca).with_context(|| format!("read ca_cert {}", ca))? {
                let cert = cert.with_context(|| format!("parse ca_cert {}", ca))?;
                roots.add(cert).context("add ca_cert to root store")?;
            }
        }

        let builder = if cfg.pinned_server_spki_sha256.is_empty() {
            warn!("uplink: server SPKI pin not configured, relying on CA validation only");
            ClientConfig::builder().with_root_certificates(roots)
        } else {
            let inner = WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| anyhow::anyhow!("build server verifier: {}", e))?;
            let pinned = PinnedCertVerifier::new(&cfg.pinned_server_spki_sha256, inner)?;
            info!("uplink: server SPKI pinning enabled");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(pinned))
        };

        let client = match (&cfg.client_cert, &cfg.client_key) {
            (Some(cert), Some(key)) => {
                let chain = CertificateDer::pem_file_iter(cert)
                    .with_context(|| format!("read client_cert {}", cert))?
                    .collect::<Result<Vec<_>, _>>()
                    .with_context(|| format!("parse client_cert {}", cert))?;
                anyhow::ensure!(!chain.is_empty(), "client_cert {} holds no certificate", cert);
                let key = PrivateKeyDer::from_pem_file(key).with_context(|| format!("read client_key {}", key))?;
                builder.with_client_auth_cert(chain, key).context("client certificate rejected")?
            }
            (None, None) => {
                warn!("uplink: no client certificate configured");
                builder.with_no_client_auth()
            }
            _ => anyhow::bail!("uplink.client_cert and uplink.client_key must be set together"),
        };

        Ok(Self {
            host,
            port,
            connect_timeout: Duration::from_secs_f64(cfg.send_timeout_s.max(0.1)),
            tls: tokio_rustls::TlsConnector::from(Arc::new(client)),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<Connection, LinkError> {
        let name = ServerName::try_from(self.host.clone()).map_err(|e| LinkError::Tls(e.to_string()))?;
        let handshake = async {
            let tcp = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(LinkError::from_io)?;
            tcp.set_nodelay(true).map_err(LinkError::from_io)?;
            self.tls
                .connect(name, tcp)
                .await
                .map_err(|e| LinkError::Tls(e.to_string()))
        };
        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| LinkError::Timeout)??;
        let (r, w) = tokio::io::split(stream);
        Ok((Box::new(StreamSink::new(w)), Box::new(StreamSource::new(r))))
    }

    fn describe(&self) -> String {
        format!("tls://{}:{}", self.host, self.port)
    }
}
