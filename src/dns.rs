//! DNS proxy (C6)
//!
//! Accepts UDP and TCP DNS queries on the common listener, consults the
//! response cache, and forwards cache misses to a load-balancer-selected
//! backend's DNS endpoint. Grounded on spec §4.3; wire parsing uses
//! `hickory-proto` (enrichment pick attested in the pack's manifests).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::dns_cache::DnsCache;
use crate::load_balancer::LoadBalancer;

const MAX_UDP_MESSAGE: usize = 4096;

pub struct DnsProxy {
    bind_addr: SocketAddr,
    cache: Arc<DnsCache>,
    load_balancer: Arc<LoadBalancer>,
    timeout: Duration,
}

impl DnsProxy {
    pub fn new(
        bind_addr: SocketAddr,
        cache: Arc<DnsCache>,
        load_balancer: Arc<LoadBalancer>,
        timeout: Duration,
    ) -> Self {
        Self {
            bind_addr,
            cache,
            load_balancer,
            timeout,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let udp_socket = Arc::new(
            UdpSocket::bind(self.bind_addr)
                .await
                .with_context(|| format!("Failed to bind DNS UDP listener on {}", self.bind_addr))?,
        );
        let tcp_listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind DNS TCP listener on {}", self.bind_addr))?;

        log::info!("DNS proxy listening on {} (udp+tcp)", self.bind_addr);

        let mut udp_shutdown = shutdown.resubscribe();
        let udp_task = {
            let udp_socket = Arc::clone(&udp_socket);
            let cache = Arc::clone(&self.cache);
            let lb = Arc::clone(&self.load_balancer);
            let timeout = self.timeout;
            tokio::spawn(async move {
                let mut buf = vec![0u8; MAX_UDP_MESSAGE];
                loop {
                    tokio::select! {
                        _ = udp_shutdown.recv() => break,
                        result = udp_socket.recv_from(&mut buf) => {
                            match result {
                                Ok((len, peer)) => {
                                    let query = buf[..len].to_vec();
                                    let socket = Arc::clone(&udp_socket);
                                    let cache = Arc::clone(&cache);
                                    let lb = Arc::clone(&lb);
                                    tokio::spawn(async move {
                                        let response = process_query(&query, &cache, &lb, timeout).await;
                                        if let Some(response) = response {
                                            let _ = socket.send_to(&response, peer).await;
                                        }
                                    });
                                }
                                Err(e) => {
                                    log::warn!("DNS UDP recv error: {}", e);
                                }
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = tcp_listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let cache = Arc::clone(&self.cache);
                            let lb = Arc::clone(&self.load_balancer);
                            let timeout = self.timeout;
                            tokio::spawn(async move {
                                if let Err(e) = handle_tcp_connection(stream, &cache, &lb, timeout).await {
                                    log::debug!("DNS TCP session with {} ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => log::warn!("DNS TCP accept error: {}", e),
                    }
                }
            }
        }

        udp_task.abort();
        Ok(())
    }
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    cache: &Arc<DnsCache>,
    lb: &Arc<LoadBalancer>,
    timeout: Duration,
) -> Result<()> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    let mut query = vec![0u8; len];
    stream.read_exact(&mut query).await?;

    if let Some(response) = process_query(&query, cache, lb, timeout).await {
        let len_prefix = (response.len() as u16).to_be_bytes();
        stream.write_all(&len_prefix).await?;
        stream.write_all(&response).await?;
    }

    Ok(())
}

async fn process_query(
    query_bytes: &[u8],
    cache: &Arc<DnsCache>,
    lb: &Arc<LoadBalancer>,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let query = Message::from_bytes(query_bytes).ok()?;
    let transaction_id = query.id();

    let question = match query.queries().first() {
        Some(q) => q.clone(),
        None => return Some(format_error_response(transaction_id, ResponseCode::FormErr)),
    };

    let qname = question.name().to_utf8();
    let qtype = question.query_type();

    if cache.is_enabled() {
        if let Some((mut cached, remaining_ttl)) = cache.get(&qname, qtype).await {
            if let Some(rewritten) = rewrite_cached_response(&mut cached, transaction_id, remaining_ttl) {
                return Some(rewritten);
            }
        }
    }

    let backend = match lb.select_backend() {
        Some(backend) => backend,
        None => return Some(format_error_response(transaction_id, ResponseCode::ServFail)),
    };
    let dns_addr = match backend.dns_addr() {
        Ok(addr) => addr,
        Err(_) => return Some(format_error_response(transaction_id, ResponseCode::ServFail)),
    };

    let response_bytes = match tokio::time::timeout(timeout, forward_query(query_bytes, dns_addr)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            log::debug!("DNS forward to {} failed: {}", dns_addr, e);
            return Some(format_error_response(transaction_id, ResponseCode::ServFail));
        }
        Err(_) => {
            log::debug!("DNS forward to {} timed out", dns_addr);
            return Some(format_error_response(transaction_id, ResponseCode::ServFail));
        }
    };

    if cache.is_enabled() {
        if let Ok(response) = Message::from_bytes(&response_bytes) {
            if response.response_code() == ResponseCode::NoError {
                let min_ttl = effective_min_ttl(&response);
                let clamped = cache.clamp_ttl(min_ttl);
                if clamped > 0 {
                    cache.put(&qname, qtype, response_bytes.clone(), clamped).await;
                }
            }
        }
    }

    Some(response_bytes)
}

async fn forward_query(query_bytes: &[u8], backend_addr: SocketAddr) -> Result<Vec<u8>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(backend_addr).await?;
    socket.send(query_bytes).await?;

    let mut buf = vec![0u8; MAX_UDP_MESSAGE];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

/// Minimum TTL across answer and authority records, excluding OPT
/// (pseudo-)records, per spec §4.3.
fn effective_min_ttl(response: &Message) -> u32 {
    let records: Vec<&Record> = response
        .answers()
        .iter()
        .chain(response.name_servers().iter())
        .filter(|r| r.record_type() != RecordType::OPT)
        .collect();

    records.iter().map(|r| r.ttl()).min().unwrap_or(0)
}

fn rewrite_cached_response(raw: &mut [u8], transaction_id: u16, remaining_ttl: u32) -> Option<Vec<u8>> {
    let mut message = Message::from_bytes(raw).ok()?;
    message.set_id(transaction_id);

    for record in message.answers_mut() {
        record.set_ttl(record.ttl().min(remaining_ttl));
    }
    for record in message.authorities_mut() {
        record.set_ttl(record.ttl().min(remaining_ttl));
    }

    message.to_bytes().ok()
}

fn format_error_response(transaction_id: u16, code: ResponseCode) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(transaction_id);
    message.set_message_type(MessageType::Response);
    message.set_op_code(OpCode::Query);
    message.set_response_code(code);
    message.to_bytes().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData};
    use std::str::FromStr;

    fn sample_response(ttl: u32) -> Message {
        let mut message = Message::new();
        message.set_id(42);
        message.set_message_type(MessageType::Response);
        message.set_response_code(ResponseCode::NoError);

        let name = Name::from_str("example.com.").unwrap();
        let record = Record::from_rdata(name, ttl, RData::A(A::new(93, 184, 216, 34)));
        message.add_answer(record);
        message
    }

    #[test]
    fn effective_min_ttl_reads_answer_section() {
        let message = sample_response(300);
        assert_eq!(effective_min_ttl(&message), 300);
    }

    #[test]
    fn format_error_response_sets_formerr_and_preserves_id() {
        let bytes = format_error_response(7, ResponseCode::FormErr);
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.response_code(), ResponseCode::FormErr);
    }

    #[test]
    fn format_error_response_supports_servfail_for_unreachable_backends() {
        let bytes = format_error_response(99, ResponseCode::ServFail);
        let parsed = Message::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.id(), 99);
        assert_eq!(parsed.response_code(), ResponseCode::ServFail);
    }

    #[test]
    fn rewrite_cached_response_updates_id_and_clamps_ttl() {
        let message = sample_response(300);
        let mut bytes = message.to_bytes().unwrap();
        let rewritten = rewrite_cached_response(&mut bytes, 99, 60).unwrap();

        let parsed = Message::from_bytes(&rewritten).unwrap();
        assert_eq!(parsed.id(), 99);
        assert_eq!(parsed.answers()[0].ttl(), 60);
    }
}
