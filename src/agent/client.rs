//! HTTP delivery of metric batches to the collector.

use std::future::Future;
use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use reqwest::Url;
use tracing::debug;

use crate::codec::{self, Encryptor, ENCRYPTED_HEADER, HASH_HEADER, REAL_IP_HEADER};
use crate::config::{AgentConfig, Compression};
use crate::export::health::HealthMetrics;
use crate::metric::{wire, Metric};

/// Sends one batch to the collector.
pub trait Deliver: Send + Sync + 'static {
    fn deliver(&self, batch: &[Metric]) -> impl Future<Output = Result<()>> + Send;
}

/// A request body after every transform, with the headers it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub gzip: bool,
    pub encrypted: bool,
}

/// Delivers batches as JSON arrays to `{address}/updates/`.
pub struct HttpDelivery {
    client: reqwest::Client,
    url: Url,
    compression: Compression,
    key: String,
    encryptor: Option<Encryptor>,
    real_ip: Option<IpAddr>,
    health: Option<Arc<HealthMetrics>>,
}

impl HttpDelivery {
    pub fn new(cfg: &AgentConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let base = Url::parse(&cfg.address)
            .with_context(|| format!("parsing collector address {:?}", cfg.address))?;
        let url = base.join("updates/").context("building updates URL")?;

        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("building HTTP client")?;

        let encryptor = cfg
            .crypto_key
            .as_deref()
            .map(|path| {
                Encryptor::load(path)
                    .with_context(|| format!("loading public key {}", path.display()))
            })
            .transpose()?;

        let real_ip = outbound_ip(&url);
        debug!(url = %url, real_ip = ?real_ip, "delivery client ready");

        Ok(Self {
            client,
            url,
            compression: cfg.compression,
            key: cfg.key.clone(),
            encryptor,
            real_ip,
            health,
        })
    }

    /// Applies JSON encoding, signing, compression and encryption in order.
    ///
    /// The signature covers the uncompressed JSON.
    pub fn encode(&self, batch: &[Metric]) -> Result<EncodedBody> {
        let json = wire::encode_batch(batch).context("encoding batch")?;

        let signature = if self.key.is_empty() {
            None
        } else {
            Some(codec::sign(&self.key, &json).context("signing batch")?)
        };

        let gzip = self.compression == Compression::Gzip;
        let mut body = if gzip {
            codec::gzip_compress(&json).context("compressing batch")?
        } else {
            json
        };

        let encrypted = self.encryptor.is_some();
        if let Some(encryptor) = &self.encryptor {
            body = encryptor.encrypt(&body).context("encrypting batch")?;
        }

        Ok(EncodedBody {
            body,
            signature,
            gzip,
            encrypted,
        })
    }

    async fn send(&self, batch: &[Metric]) -> Result<()> {
        let encoded = self.encode(batch)?;
        let bytes = encoded.body.len();

        let mut request = self
            .client
            .post(self.url.clone())
            .header("Content-Type", "application/json")
            .body(encoded.body);

        if encoded.gzip {
            request = request.header("Content-Encoding", "gzip");
        }
        if encoded.encrypted {
            request = request.header(ENCRYPTED_HEADER, "rsa");
        }
        if let Some(signature) = encoded.signature {
            request = request.header(HASH_HEADER, signature);
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }

        let resp = request.send().await.context("sending metrics batch")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("collector returned {status}");
        }

        debug!(metrics = batch.len(), bytes, "delivered batch");

        Ok(())
    }
}

impl Deliver for HttpDelivery {
    async fn deliver(&self, batch: &[Metric]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let result = self.send(batch).await;

        if let Some(h) = &self.health {
            h.delivery_duration.observe(started.elapsed().as_secs_f64());
            let label = if result.is_ok() { "ok" } else { "failed" };
            h.deliveries.with_label_values(&[label]).inc();
        }

        result
    }
}

/// Local address the OS would route from to reach the collector.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
fn outbound_ip(url: &Url) -> Option<IpAddr> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let bind = if host.parse::<std::net::Ipv6Addr>().is_ok() {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind).ok()?;
    socket.connect((host, port)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs8::LineEnding;
    use rsa::RsaPrivateKey;

    use super::*;
    use crate::codec::Decryptor;

    fn config(address: &str) -> AgentConfig {
        AgentConfig {
            address: address.to_string(),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn batch() -> Vec<Metric> {
        vec![Metric::counter("PollCount", 5), Metric::gauge("Alloc", 1.5)]
    }

    #[test]
    fn test_url_joins_updates_path() {
        let client = HttpDelivery::new(&config("http://127.0.0.1:8080"), None).expect("client");
        assert_eq!(client.url.as_str(), "http://127.0.0.1:8080/updates/");
    }

    #[test]
    fn test_encode_plain_json_without_key() {
        let mut cfg = config("http://127.0.0.1:8080");
        cfg.compression = Compression::None;
        let client = HttpDelivery::new(&cfg, None).expect("client");

        let encoded = client.encode(&batch()).expect("encode");
        assert!(!encoded.gzip);
        assert!(!encoded.encrypted);
        assert!(encoded.signature.is_none());
        assert_eq!(
            wire::decode_batch(&encoded.body).expect("decode"),
            batch()
        );
    }

    #[test]
    fn test_encode_signs_uncompressed_json() {
        let mut cfg = config("http://127.0.0.1:8080");
        cfg.key = "secret".to_string();
        let client = HttpDelivery::new(&cfg, None).expect("client");

        let encoded = client.encode(&batch()).expect("encode");
        assert!(encoded.gzip);

        let json = codec::gzip_decompress(&encoded.body).expect("gunzip");
        let signature = encoded.signature.expect("signature");
        codec::verify("secret", &json, &signature).expect("signature covers json");
    }

    #[test]
    fn test_encode_encrypts_compressed_body() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).expect("keygen");
        let pem = private
            .to_public_key()
            .to_pkcs1_pem(LineEnding::LF)
            .expect("pem");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("public.pem");
        std::fs::write(&path, pem).expect("write key");

        let mut cfg = config("http://127.0.0.1:8080");
        cfg.crypto_key = Some(path);
        let client = HttpDelivery::new(&cfg, None).expect("client");

        let encoded = client.encode(&batch()).expect("encode");
        assert!(encoded.encrypted);
        assert_eq!(encoded.body.len() % 128, 0);

        let plain = Decryptor::new(private).decrypt(&encoded.body).expect("decrypt");
        let json = codec::gzip_decompress(&plain).expect("gunzip");
        assert_eq!(wire::decode_batch(&json).expect("decode"), batch());
    }

    #[test]
    fn test_missing_key_file_fails_construction() {
        let mut cfg = config("http://127.0.0.1:8080");
        cfg.crypto_key = Some("/nonexistent/public.pem".into());
        let err = HttpDelivery::new(&cfg, None).err().expect("missing key");
        assert!(format!("{err:#}").contains("loading public key"));
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        // Nothing listens on port 9; an actual request would fail.
        let client = HttpDelivery::new(&config("http://127.0.0.1:9"), None).expect("client");
        client.deliver(&[]).await.expect("empty batch is a no-op");
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_an_error() {
        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let client = HttpDelivery::new(&config("http://127.0.0.1:9"), Some(health.clone()))
            .expect("client");

        assert!(client.deliver(&batch()).await.is_err());
        assert_eq!(health.deliveries.with_label_values(&["failed"]).get(), 1.0);
    }

    #[test]
    fn test_outbound_ip_for_loopback() {
        let url = Url::parse("http://127.0.0.1:8080/").expect("url");
        assert_eq!(outbound_ip(&url), Some(IpAddr::from([127, 0, 0, 1])));
    }
}
