use parking_lot::Mutex;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::UpstreamConfig;
use crate::error::{ResolveError, Result};
use crate::message::Message;

const MAX_POOLED_SOCKETS: usize = 5;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const UDP_BUFFER: usize = 4096;

/// A live, reusable handle to one upstream resolver. Exchanges go over
/// UDP with pooled connected sockets, falling back to TCP when the
/// response comes back truncated.
pub struct Upstream {
    tag: String,
    addr: SocketAddr,
    dial_addr: SocketAddr,
    idle_timeout: Duration,
    pool: Mutex<Vec<(UdpSocket, Instant)>>,
}

impl Upstream {
    pub(crate) fn new(cfg: &UpstreamConfig) -> Result<Self> {
        let addr = parse_addr(&cfg.addr)?;
        let dial_addr = match &cfg.dial_addr {
            Some(dial) => parse_addr(dial)?,
            None => addr,
        };
        if cfg.socks5.is_some()
            || cfg.so_mark.is_some()
            || cfg.bind_to_device.is_some()
            || cfg.bootstrap.is_some()
            || cfg.enable_http3
        {
            debug!(
                tag = %cfg.tag,
                "transport options beyond dial_addr/idle_timeout are not applied by the plain UDP/TCP transport"
            );
        }
        Ok(Upstream {
            tag: cfg.tag.clone(),
            addr,
            dial_addr,
            idle_timeout: cfg
                .idle_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_IDLE_TIMEOUT),
            pool: Mutex::new(Vec::new()),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn exchange(&self, query: &Message) -> Result<Message> {
        let bytes = query.serialize()?;
        let resp = self.exchange_udp(query, &bytes).await?;
        if resp.header.tc {
            debug!(upstream = %self.addr, "UDP response truncated, retrying over TCP");
            return self.exchange_tcp(query, &bytes).await;
        }
        Ok(resp)
    }

    async fn exchange_udp(&self, query: &Message, bytes: &[u8]) -> Result<Message> {
        let socket = self.take_socket().await?;
        socket.send(bytes).await?;

        let mut buf = vec![0u8; UDP_BUFFER];
        let resp = loop {
            let n = socket.recv(&mut buf).await?;
            match Message::parse(&buf[..n]) {
                Ok(resp) if resp.header.id == query.header.id => break resp,
                // Late answer to an abandoned exchange on a pooled socket.
                Ok(_) => trace!(upstream = %self.addr, "dropping datagram with stale transaction id"),
                Err(e) => {
                    return Err(ResolveError::Protocol(format!(
                        "bad response from {}: {e}",
                        self.addr
                    )));
                }
            }
        };
        self.return_socket(socket);
        Ok(resp)
    }

    async fn exchange_tcp(&self, query: &Message, bytes: &[u8]) -> Result<Message> {
        let mut stream = TcpStream::connect(self.dial_addr).await?;
        stream.write_all(&(bytes.len() as u16).to_be_bytes()).await?;
        stream.write_all(bytes).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let mut resp_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut resp_buf).await?;

        let resp = Message::parse(&resp_buf)
            .map_err(|e| ResolveError::Protocol(format!("bad response from {}: {e}", self.addr)))?;
        if resp.header.id != query.header.id {
            return Err(ResolveError::Protocol(format!(
                "transaction id mismatch from {}",
                self.addr
            )));
        }
        Ok(resp)
    }

    async fn take_socket(&self) -> Result<UdpSocket> {
        let reused = {
            let now = Instant::now();
            let mut pool = self.pool.lock();
            let mut found = None;
            while let Some((socket, last_used)) = pool.pop() {
                if now.duration_since(last_used) <= self.idle_timeout {
                    found = Some(socket);
                    break;
                }
                // Idle past the timeout; dropped on the spot.
            }
            found
        };
        if let Some(socket) = reused {
            trace!(upstream = %self.addr, "reusing pooled socket");
            return Ok(socket);
        }

        let bind_addr: SocketAddr = if self.dial_addr.is_ipv4() {
            "0.0.0.0:0".parse().expect("wildcard v4 address is valid")
        } else {
            "[::]:0".parse().expect("wildcard v6 address is valid")
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.dial_addr).await?;
        Ok(socket)
    }

    fn return_socket(&self, socket: UdpSocket) {
        let mut pool = self.pool.lock();
        if pool.len() < MAX_POOLED_SOCKETS {
            pool.push((socket, Instant::now()));
        }
    }
}

fn parse_addr(s: &str) -> Result<SocketAddr> {
    let trimmed = s.strip_prefix("udp://").unwrap_or(s);
    trimmed
        .parse()
        .map_err(|_| ResolveError::Protocol(format!("invalid upstream address: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing_accepts_udp_scheme() {
        assert!(parse_addr("127.0.0.1:53").is_ok());
        assert!(parse_addr("udp://127.0.0.1:53").is_ok());
        assert!(parse_addr("not-an-addr").is_err());
    }
}
