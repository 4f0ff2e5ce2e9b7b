//! SOCKS5 front listener (C7)
//!
//! Terminates a SOCKS5 handshake from the client, selects a backend via the
//! load balancer, dials the destination through that backend's own SOCKS5
//! listener, and splices bytes. Grounded on the teacher's `proxy.rs`
//! (accept-loop-plus-shutdown shape, `copy_bidirectional` splicing,
//! per-attempt `mark_failure`/failover), generalized from raw TCP
//! passthrough to a terminated SOCKS5 handshake.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::backend::{BackendErrorKind, BackendState, ConnectionGuard};
use crate::load_balancer::LoadBalancer;
use crate::net_util::is_valid_hostname;
use crate::protection::ProtectionMode;

/// Explicit classification of a dial failure, built directly from the
/// originating `io::ErrorKind` or the backend's own SOCKS reply code —
/// never from matching substrings of a formatted error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialErrorKind {
    Timeout,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    Refused,
    TtlExpired,
    CommandUnsupported,
    AddressUnsupported,
    General,
}

impl DialErrorKind {
    fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => DialErrorKind::Timeout,
            ErrorKind::ConnectionRefused => DialErrorKind::Refused,
            ErrorKind::AddrNotAvailable | ErrorKind::NotFound => DialErrorKind::HostUnreachable,
            _ => match err.raw_os_error() {
                // EHOSTUNREACH / ENETUNREACH are not yet distinct ErrorKind
                // variants on stable, so fall back to the raw errno.
                Some(113) => DialErrorKind::HostUnreachable,
                Some(101) => DialErrorKind::NetworkUnreachable,
                _ => DialErrorKind::General,
            },
        }
    }

    /// Maps a reply code the *backend* sent back on its own CONNECT
    /// response to the same classification, so a refusal reported by the
    /// backend is indistinguishable from one this process observed directly.
    fn from_backend_reply_code(code: u8) -> Self {
        match code {
            REPLY_NOT_ALLOWED => DialErrorKind::NotAllowed,
            REPLY_NETWORK_UNREACHABLE => DialErrorKind::NetworkUnreachable,
            REPLY_HOST_UNREACHABLE => DialErrorKind::HostUnreachable,
            REPLY_CONNECTION_REFUSED => DialErrorKind::Refused,
            REPLY_TTL_EXPIRED => DialErrorKind::TtlExpired,
            REPLY_COMMAND_NOT_SUPPORTED => DialErrorKind::CommandUnsupported,
            REPLY_ADDRESS_TYPE_NOT_SUPPORTED => DialErrorKind::AddressUnsupported,
            _ => DialErrorKind::General,
        }
    }

    fn socks_reply(self) -> u8 {
        match self {
            DialErrorKind::Timeout => REPLY_TTL_EXPIRED,
            DialErrorKind::NotAllowed => REPLY_NOT_ALLOWED,
            DialErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
            DialErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
            DialErrorKind::Refused => REPLY_CONNECTION_REFUSED,
            DialErrorKind::TtlExpired => REPLY_TTL_EXPIRED,
            DialErrorKind::CommandUnsupported => REPLY_COMMAND_NOT_SUPPORTED,
            DialErrorKind::AddressUnsupported => REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
            DialErrorKind::General => REPLY_GENERAL_FAILURE,
        }
    }

    fn backend_error_kind(self) -> BackendErrorKind {
        match self {
            DialErrorKind::Timeout => BackendErrorKind::Timeout,
            DialErrorKind::Refused => BackendErrorKind::ConnectionRefused,
            _ => BackendErrorKind::Io,
        }
    }
}

/// A dial failure carrying its explicit classification alongside the
/// human-readable cause, so the SOCKS reply and the storm-detector both
/// read off the same typed kind rather than re-deriving it.
#[derive(Debug)]
struct DialError {
    kind: DialErrorKind,
    source: anyhow::Error,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NOT_ALLOWED: u8 = 0x02;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Clone)]
enum TargetAddr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl TargetAddr {
    fn ip_for_policy_check(&self) -> Option<std::net::IpAddr> {
        match self {
            TargetAddr::V4(ip, _) => Some((*ip).into()),
            TargetAddr::V6(ip, _) => Some((*ip).into()),
            TargetAddr::Domain(_, _) => None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            TargetAddr::V4(ip, port) => {
                buf.push(ATYP_V4);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::V6(ip, port) => {
                buf.push(ATYP_V6);
                buf.extend_from_slice(&ip.octets());
                buf.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf
    }
}

pub struct SocksConfig {
    pub bind_addr: SocketAddr,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub select_retries: u32,
    pub select_backoff: Duration,
    pub accept_jitter: Duration,
    pub allow_private_destinations: bool,
    pub max_total_connections: Option<u32>,
    pub splice_buffer_size: usize,
}

pub struct SocksServer {
    config: SocksConfig,
    load_balancer: Arc<LoadBalancer>,
    protection: Arc<ProtectionMode>,
    global_connections: AtomicUsize,
}

impl SocksServer {
    pub fn new(
        config: SocksConfig,
        load_balancer: Arc<LoadBalancer>,
        protection: Arc<ProtectionMode>,
    ) -> Self {
        Self {
            config,
            load_balancer,
            protection,
            global_connections: AtomicUsize::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind SOCKS listener on {}", self.config.bind_addr))?;

        log::info!("SOCKS5 front listener on {}", self.config.bind_addr);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("SOCKS listener stopping new accepts");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    log::debug!("SOCKS session {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => log::warn!("SOCKS accept error: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Some(cap) = self.config.max_total_connections {
            if self.global_connections.load(Ordering::Relaxed) as u32 >= cap {
                log::debug!("global connection cap reached; dropping {}", peer);
                return Ok(());
            }
        }

        perform_handshake(&mut client).await?;
        let target = read_connect_request(&mut client).await?;

        if !self.config.allow_private_destinations {
            if let Some(ip) = target.ip_for_policy_check() {
                if crate::net_util::is_disallowed_private(&ip) {
                    write_reply(&mut client, REPLY_NOT_ALLOWED).await?;
                    return Ok(());
                }
            }
        }
        if let TargetAddr::Domain(name, _) = &target {
            if !is_valid_hostname(name) {
                write_reply(&mut client, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
                return Ok(());
            }
        }

        if self.config.accept_jitter > Duration::ZERO {
            let jitter_ms = rand::random::<u64>() % self.config.accept_jitter.as_millis().max(1) as u64;
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }

        let (backend, backend_stream) = match self.connect_with_retry(&target).await {
            Ok(result) => result,
            Err(e) => {
                write_reply(&mut client, e.kind.socks_reply()).await?;
                return Err(e.source);
            }
        };

        if let Some(cap) = backend.config.max_connections {
            if backend.active_connections() as u32 >= cap {
                write_reply(&mut client, REPLY_GENERAL_FAILURE).await?;
                return Ok(());
            }
        }

        let _guard = ConnectionGuard::acquire(&backend);
        self.global_connections.fetch_add(1, Ordering::Relaxed);

        write_reply(&mut client, REPLY_SUCCESS).await?;

        log::info!(
            "SOCKS session {} -> backend {} ({}:{})",
            peer,
            backend.id,
            backend.config.host,
            backend.current_socks_port()
        );

        let splice_result = tokio::time::timeout(
            self.config.idle_timeout,
            relay(client, backend_stream, self.config.splice_buffer_size),
        )
        .await;

        self.global_connections.fetch_sub(1, Ordering::Relaxed);

        match splice_result {
            Ok(Ok((up, down))) => {
                log::debug!("SOCKS session {} closed: {} up / {} down bytes", peer, up, down);
                self.protection.record_success();
            }
            Ok(Err(e)) => log::debug!("SOCKS session {} relay error: {}", peer, e),
            Err(_) => log::debug!("SOCKS session {} hit idle timeout", peer),
        }

        Ok(())
    }

    async fn connect_with_retry(
        &self,
        target: &TargetAddr,
    ) -> Result<(Arc<BackendState>, TcpStream), DialError> {
        let mut last_error: Option<DialError> = None;

        for attempt in 0..=self.config.select_retries {
            let Some(backend) = self.load_balancer.select_backend() else {
                if attempt < self.config.select_retries {
                    tokio::time::sleep(self.config.select_backoff).await;
                    continue;
                }
                self.protection.record_global_unavailable();
                return Err(DialError {
                    kind: DialErrorKind::General,
                    source: anyhow::anyhow!("no healthy backend available"),
                });
            };

            match dial_via_backend(&backend, target, self.config.connect_timeout).await {
                Ok(stream) => return Ok((backend, stream)),
                Err(e) => {
                    self.protection.record_failure(e.kind.backend_error_kind());
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(DialError {
            kind: DialErrorKind::General,
            source: anyhow::anyhow!("all backend dial attempts failed"),
        }))
    }
}

async fn perform_handshake(client: &mut TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version {}", header[0]);
    }

    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        client.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        bail!("client offered no acceptable auth method");
    }

    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

async fn read_connect_request(client: &mut TcpStream) -> Result<TargetAddr> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        bail!("unsupported SOCKS version in request");
    }
    if header[1] != CMD_CONNECT {
        write_reply(client, REPLY_COMMAND_NOT_SUPPORTED).await?;
        bail!("unsupported SOCKS command {}", header[1]);
    }

    let target = match header[3] {
        ATYP_V4 => {
            let mut buf = [0u8; 6];
            client.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::V4(ip, port)
        }
        ATYP_V6 => {
            let mut buf = [0u8; 18];
            client.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::V6(ip, port)
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            client.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            let mut name_buf = vec![0u8; len + 2];
            client.read_exact(&mut name_buf).await?;
            let name = String::from_utf8(name_buf[..len].to_vec())
                .map_err(|_| anyhow::anyhow!("non-UTF8 hostname in SOCKS request"))?;
            let port = u16::from_be_bytes([name_buf[len], name_buf[len + 1]]);
            TargetAddr::Domain(name, port)
        }
        other => {
            write_reply(client, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            bail!("unsupported address type {}", other);
        }
    };

    Ok(target)
}

async fn write_reply(client: &mut TcpStream, code: u8) -> Result<()> {
    let reply = [
        SOCKS_VERSION,
        code,
        0x00,
        ATYP_V4,
        0, 0, 0, 0,
        0, 0,
    ];
    client.write_all(&reply).await?;
    Ok(())
}

/// Dials `target` through `backend`'s own SOCKS5 listener: performs a
/// client-side handshake and CONNECT request against the backend, and
/// returns the resulting stream ready for splicing.
async fn dial_via_backend(
    backend: &Arc<BackendState>,
    target: &TargetAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, DialError> {
    let backend_addr = backend.socks_addr().map_err(|e| DialError {
        kind: DialErrorKind::General,
        source: e,
    })?;

    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(backend_addr))
        .await
        .map_err(|_| DialError {
            kind: DialErrorKind::Timeout,
            source: anyhow::anyhow!("timeout connecting to backend {}", backend_addr),
        })?
        .map_err(|e| DialError {
            kind: DialErrorKind::from_io_error(&e),
            source: anyhow::anyhow!("failed to connect to backend SOCKS port {}: {}", backend_addr, e),
        })?;

    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(io_dial_error)?;
    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await.map_err(io_dial_error)?;
    if resp[0] != SOCKS_VERSION || resp[1] != METHOD_NO_AUTH {
        return Err(DialError {
            kind: DialErrorKind::General,
            source: anyhow::anyhow!("backend {} rejected no-auth handshake", backend_addr),
        });
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    request.extend_from_slice(&target.encode());
    stream.write_all(&request).await.map_err(io_dial_error)?;

    let mut reply_header = [0u8; 4];
    stream.read_exact(&mut reply_header).await.map_err(io_dial_error)?;
    if reply_header[1] != REPLY_SUCCESS {
        return Err(DialError {
            kind: DialErrorKind::from_backend_reply_code(reply_header[1]),
            source: anyhow::anyhow!(
                "backend {} refused CONNECT with reply code {}",
                backend_addr,
                reply_header[1]
            ),
        });
    }

    // Drain the bound-address field before splicing begins.
    let drain_result: std::io::Result<()> = async {
        match reply_header[3] {
            ATYP_V4 => {
                let mut buf = [0u8; 6];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_V6 => {
                let mut buf = [0u8; 18];
                stream.read_exact(&mut buf).await?;
            }
            ATYP_DOMAIN => {
                let mut len_buf = [0u8; 1];
                stream.read_exact(&mut len_buf).await?;
                let mut buf = vec![0u8; len_buf[0] as usize + 2];
                stream.read_exact(&mut buf).await?;
            }
            _ => {}
        }
        Ok(())
    }
    .await;
    drain_result.map_err(io_dial_error)?;

    Ok(stream)
}

fn io_dial_error(err: std::io::Error) -> DialError {
    DialError {
        kind: DialErrorKind::from_io_error(&err),
        source: anyhow::anyhow!("{}", err),
    }
}

async fn relay(
    mut client: TcpStream,
    mut backend: TcpStream,
    _buffer_size: usize,
) -> Result<(u64, u64)> {
    let (up, down) = io::copy_bidirectional(&mut client, &mut backend)
        .await
        .context("bidirectional splice failed")?;
    Ok((up, down))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_v4_target_address() {
        let target = TargetAddr::V4(Ipv4Addr::new(93, 184, 216, 34), 443);
        let encoded = target.encode();
        assert_eq!(encoded[0], ATYP_V4);
        assert_eq!(&encoded[1..5], &[93, 184, 216, 34]);
        assert_eq!(u16::from_be_bytes([encoded[5], encoded[6]]), 443);
    }

    #[test]
    fn encodes_domain_target_address() {
        let target = TargetAddr::Domain("example.com".to_string(), 80);
        let encoded = target.encode();
        assert_eq!(encoded[0], ATYP_DOMAIN);
        assert_eq!(encoded[1], 11);
        assert_eq!(&encoded[2..13], b"example.com");
    }

    #[test]
    fn unclassified_io_error_maps_to_general_failure_reply() {
        let kind = DialErrorKind::from_io_error(&std::io::Error::new(
            std::io::ErrorKind::Other,
            "mystery failure",
        ));
        assert_eq!(kind, DialErrorKind::General);
        assert_eq!(kind.socks_reply(), REPLY_GENERAL_FAILURE);
    }

    #[test]
    fn io_error_kind_drives_socks_reply_and_protection_classification() {
        let timeout = DialErrorKind::from_io_error(&std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert_eq!(timeout.socks_reply(), REPLY_TTL_EXPIRED);
        assert_eq!(timeout.backend_error_kind(), BackendErrorKind::Timeout);

        let refused = DialErrorKind::from_io_error(&std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(refused.socks_reply(), REPLY_CONNECTION_REFUSED);
        assert_eq!(refused.backend_error_kind(), BackendErrorKind::ConnectionRefused);
    }

    #[test]
    fn backend_reply_code_round_trips_through_dial_error_kind() {
        assert_eq!(
            DialErrorKind::from_backend_reply_code(REPLY_HOST_UNREACHABLE).socks_reply(),
            REPLY_HOST_UNREACHABLE
        );
        assert_eq!(
            DialErrorKind::from_backend_reply_code(REPLY_TTL_EXPIRED).socks_reply(),
            REPLY_TTL_EXPIRED
        );
    }

    #[test]
    fn policy_check_ignores_domain_targets() {
        let target = TargetAddr::Domain("example.com".to_string(), 80);
        assert!(target.ip_for_policy_check().is_none());
    }
}
