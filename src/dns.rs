//! UDP DNS server that intercepts the registry hostname.
//!
//! A queries for the configured hostname are answered authoritatively with
//! the mirror's IPv4 so clients connect to the cache instead of the real
//! registry. Every other query (other names, other record types) is
//! forwarded verbatim to the upstream resolver and its reply relayed
//! verbatim, so the server is invisible for everything it does not
//! intercept. IPv6 lookups for the registry are deliberately forwarded:
//! clients resolving AAAA bypass the cache, which operators accept.

use anyhow::Context;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{rdata::A, DNSClass, RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Answer TTL for intercepted names.
const INTERCEPT_TTL: u32 = 300;

/// How long to wait for the upstream resolver before answering SERVFAIL.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_PACKET: usize = 4096;

/// The DNS interceptor/forwarder.
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    upstream_dns: String,
    registry_host: String,
    redirect_ip: Ipv4Addr,
}

impl DnsServer {
    /// Bind the UDP socket. Binding fails fast so startup errors surface
    /// before the server advertises itself as ready.
    pub async fn bind(
        addr: &str,
        port: u16,
        upstream_dns: String,
        registry_host: &str,
        redirect_ip: Ipv4Addr,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((addr, port))
            .await
            .with_context(|| format!("failed to bind DNS listener on {addr}:{port}"))?;
        Ok(Self {
            socket: Arc::new(socket),
            upstream_dns,
            registry_host: normalize_name(registry_host),
            redirect_ip,
        })
    }

    /// Address the socket actually bound to (useful when port 0 was asked).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until the shutdown signal trips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr()?,
            intercept = %self.registry_host,
            redirect = %self.redirect_ip,
            upstream = %self.upstream_dns,
            "DNS server listening"
        );

        let handler = Arc::new(QueryHandler {
            upstream_dns: self.upstream_dns,
            registry_host: self.registry_host,
            redirect_ip: self.redirect_ip,
        });

        let mut buf = [0u8; MAX_PACKET];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("DNS server shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received.context("DNS socket receive failed")?;
                    let packet = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Some(reply) = handler.handle(&packet).await {
                            if let Err(e) = socket.send_to(&reply, peer).await {
                                warn!(peer = %peer, error = %e, "Failed to send DNS response");
                            }
                        }
                    });
                }
            }
        }
    }
}

struct QueryHandler {
    upstream_dns: String,
    registry_host: String,
    redirect_ip: Ipv4Addr,
}

impl QueryHandler {
    /// Produce the reply bytes for one incoming packet, or `None` to drop
    /// it (malformed packets get no answer, like a dead resolver).
    async fn handle(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(packet) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Dropping malformed DNS packet");
                return None;
            }
        };

        if self.intercepts(&request) {
            let name = request
                .queries()
                .first()
                .map(|q| q.name().to_ascii())
                .unwrap_or_default();
            info!(name = %name, redirect = %self.redirect_ip, "Intercepting DNS query");
            return match build_intercept_response(&request, self.redirect_ip).to_vec() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(error = %e, "Failed to encode DNS response");
                    None
                }
            };
        }

        match self.forward(packet).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(upstream = %self.upstream_dns, error = %e, "DNS forward failed");
                Message::error_msg(request.id(), request.op_code(), ResponseCode::ServFail)
                    .to_vec()
                    .ok()
            }
        }
    }

    /// Whether every question asks for an A record of the intercepted host.
    /// Real resolvers send exactly one question; anything mixed goes
    /// upstream untouched.
    fn intercepts(&self, request: &Message) -> bool {
        !request.queries().is_empty()
            && request.queries().iter().all(|q| {
                q.query_type() == RecordType::A
                    && normalize_name(&q.name().to_ascii()) == self.registry_host
            })
    }

    /// Relay the raw query to the upstream resolver and return the raw
    /// reply, both verbatim.
    async fn forward(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("failed to bind forwarding socket")?;
        socket
            .send_to(packet, &self.upstream_dns)
            .await
            .context("failed to send query upstream")?;

        let mut buf = [0u8; MAX_PACKET];
        let (len, _) = tokio::time::timeout(FORWARD_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .context("upstream resolver timed out")?
            .context("failed to receive upstream reply")?;
        Ok(buf[..len].to_vec())
    }
}

/// Build the authoritative reply for an intercepted query: one A record
/// per question, TTL 300, class IN.
fn build_intercept_response(request: &Message, redirect_ip: Ipv4Addr) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_authoritative(true);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(false);
    response.set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());
        let mut record = Record::from_rdata(query.name().clone(), INTERCEPT_TTL, RData::A(A(redirect_ip)));
        record.set_dns_class(DNSClass::IN);
        response.add_answer(record);
    }
    response
}

/// Lowercase and strip the trailing root dot.
fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
