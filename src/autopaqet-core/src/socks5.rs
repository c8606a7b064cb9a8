//! SOCKS5 readiness polling and tunnel verification
//!
//! A listening SOCKS port only proves the tunnel process is up. Readiness
//! here means a full no-auth handshake plus a CONNECT to an external probe
//! target succeeded through the proxy. Verification goes one step further
//! and pushes real HTTP requests through it.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ReadinessError, VerifyError};

/// External target used for readiness CONNECTs
pub const PROBE_TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(1, 1, 1, 1), 80);

/// Delay between readiness attempts
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on a single handshake attempt
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on each verification request
pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// IP-literal URL: a response proves data flows without needing DNS
pub const DATA_FLOW_URL: &str = "http://1.1.1.1/";

/// Hostname URL resolved by the proxy: a response proves remote DNS works
pub const DNS_URL: &str = "http://www.gstatic.com/generate_204";

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn reply_error(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

async fn negotiate(proxy: &str, target: SocketAddrV4) -> Result<(), ReadinessError> {
    let mut stream = TcpStream::connect(proxy).await?;

    // greeting: version 5, one method, no auth
    stream.write_all(&[SOCKS_VERSION, 0x01, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice != [SOCKS_VERSION, NO_AUTH] {
        return Err(ReadinessError::Handshake(format!(
            "unexpected greeting response {choice:?}"
        )));
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(ReadinessError::Handshake(format!(
            "invalid version {} in reply",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(ReadinessError::Handshake(format!(
            "connect failed: {} ({})",
            reply_error(header[1]),
            header[1]
        )));
    }

    // bound address + port
    let remaining = match header[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(ReadinessError::Handshake(format!(
                "unknown address type {other} in reply"
            )))
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// One bounded SOCKS5 handshake + CONNECT through `proxy`.
pub async fn try_socks5_connect(
    proxy: &str,
    target: SocketAddrV4,
    attempt_timeout: Duration,
) -> Result<(), ReadinessError> {
    tokio::time::timeout(attempt_timeout, negotiate(proxy, target))
        .await
        .map_err(|_| ReadinessError::Handshake(format!("no reply within {attempt_timeout:?}")))?
}

/// Waits for the local proxy to forward a real connection.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn wait_ready(
        &self,
        socks_addr: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError>;
}

/// Polls with real SOCKS5 CONNECTs: once immediately, then every interval.
#[derive(Debug, Clone)]
pub struct Socks5Poller {
    target: SocketAddrV4,
    interval: Duration,
    attempt_timeout: Duration,
}

impl Default for Socks5Poller {
    fn default() -> Self {
        Self {
            target: PROBE_TARGET,
            interval: POLL_INTERVAL,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }
}

impl Socks5Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: SocketAddrV4) -> Self {
        self.target = target;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    async fn attempt(&self, socks_addr: &str) -> bool {
        match try_socks5_connect(socks_addr, self.target, self.attempt_timeout).await {
            Ok(()) => true,
            Err(e) => {
                debug!(%e, socks_addr, "SOCKS5 not ready yet");
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessProbe for Socks5Poller {
    async fn wait_ready(
        &self,
        socks_addr: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ReadinessError> {
        let started = Instant::now();
        let expires = tokio::time::sleep(deadline);
        tokio::pin!(expires);

        if self.attempt(socks_addr).await {
            info!(socks_addr, elapsed = ?started.elapsed(), "SOCKS5 tunnel ready");
            return Ok(());
        }

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled),
                _ = &mut expires => {
                    return Err(ReadinessError::Timeout {
                        addr: socks_addr.to_string(),
                        after: deadline,
                    })
                }
                _ = ticker.tick() => {
                    if self.attempt(socks_addr).await {
                        info!(socks_addr, elapsed = ?started.elapsed(), "SOCKS5 tunnel ready");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// What flowed through the tunnel during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// An HTTP response came back from an IP-literal URL
    pub data_flow: bool,
    /// An HTTP response came back from a hostname URL
    pub dns: bool,
}

/// Pushes application traffic through the proxy.
///
/// `Err` means no data flowed at all. `Ok` with `dns == false` means the
/// tunnel forwards but names do not resolve through it.
#[async_trait]
pub trait TunnelVerifier: Send + Sync {
    async fn verify(&self, socks_addr: &str, timeout: Duration)
        -> Result<VerifyOutcome, VerifyError>;
}

/// HTTP verifier over `socks5h://` so the proxy performs name resolution.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    data_flow_url: String,
    dns_url: String,
}

impl Default for HttpVerifier {
    fn default() -> Self {
        Self {
            data_flow_url: DATA_FLOW_URL.to_string(),
            dns_url: DNS_URL.to_string(),
        }
    }
}

impl HttpVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_urls(data_flow_url: impl Into<String>, dns_url: impl Into<String>) -> Self {
        Self {
            data_flow_url: data_flow_url.into(),
            dns_url: dns_url.into(),
        }
    }
}

#[async_trait]
impl TunnelVerifier for HttpVerifier {
    async fn verify(
        &self,
        socks_addr: &str,
        timeout: Duration,
    ) -> Result<VerifyOutcome, VerifyError> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{socks_addr}"))
            .map_err(|e| VerifyError::Client(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| VerifyError::Client(e.to_string()))?;

        // Any status code counts: a response proves data crossed the tunnel.
        let resp = client
            .get(&self.data_flow_url)
            .send()
            .await
            .map_err(|e| VerifyError::Request(e.to_string()))?;
        let _ = resp.bytes().await;

        let dns = match client.get(&self.dns_url).send().await {
            Ok(resp) => {
                let _ = resp.bytes().await;
                true
            }
            Err(e) => {
                debug!(%e, "Hostname request through tunnel failed");
                false
            }
        };

        Ok(VerifyOutcome {
            data_flow: true,
            dns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_codes_are_named() {
        assert_eq!(reply_error(0x05), "connection refused");
        assert_eq!(reply_error(0x42), "unknown error");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_fast() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = try_socks5_connect(&addr, PROBE_TARGET, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Io(_)));
    }

    #[tokio::test]
    async fn silent_listener_hits_attempt_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = try_socks5_connect(&addr, PROBE_TARGET, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadinessError::Handshake(_)));
    }
}
