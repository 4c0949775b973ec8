//! SOCKS5 Framer (C5) — parses the GREETING/AUTH/REQUEST handshake and
//! bridges FORWARDING per RFC 1928/1929, exactly as spec.md §4.5 specifies.
//!
//! Grounded on `forwarding::dynamic::handle_socks5_connection`/
//! `send_socks5_reply`, generalized per Design Notes §9 into explicit,
//! independently testable pieces: `wire` holds pure parse/encode functions
//! driven by one already-read buffer (no ad-hoc single-shot promises), and
//! [`Socks5Framer`] drives GREETING → (AUTH)? → REQUEST against a live
//! stream with the 30s-per-phase deadlines spec.md §5 requires. FORWARDING
//! itself (`forward`) has no idle timeout — spec.md §4.5 states it relies on
//! the peer, unlike the teacher's 300s `SOCKS5_IDLE_TIMEOUT`.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-phase deadline for GREETING/AUTH/REQUEST (spec.md §5).
pub const PHASE_TIMEOUT: Duration = Duration::from_secs(30);

pub mod wire {
    //! Pure byte-level parsing/encoding, independent of any I/O.

    use super::FramerError;
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub const VERSION: u8 = 0x05;
    pub const AUTH_VERSION: u8 = 0x01;

    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const METHOD_USER_PASS: u8 = 0x02;
    pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

    pub const CMD_CONNECT: u8 = 0x01;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

    /// Choose the auth method per spec.md §4.5: 0x02 iff proxy auth is
    /// configured and offered; else 0x00 iff offered; else 0xFF.
    pub fn choose_method(offered: &[u8], auth_configured: bool) -> u8 {
        if auth_configured && offered.contains(&METHOD_USER_PASS) {
            METHOD_USER_PASS
        } else if offered.contains(&METHOD_NO_AUTH) {
            METHOD_NO_AUTH
        } else {
            METHOD_NO_ACCEPTABLE
        }
    }

    /// Build the 2-byte method-selection reply.
    pub fn method_reply(method: u8) -> [u8; 2] {
        [VERSION, method]
    }

    /// Build the 2-byte RFC 1929 auth reply.
    pub fn auth_reply(success: bool) -> [u8; 2] {
        [AUTH_VERSION, if success { 0x00 } else { 0x01 }]
    }

    /// Build the 10-byte CONNECT reply. BND.ADDR/BND.PORT are always
    /// 0.0.0.0:0 (spec.md §4.5).
    pub fn connect_reply(rep: u8) -> [u8; 10] {
        [VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }

    /// Parsed CONNECT request target.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Target {
        Ipv4(Ipv4Addr),
        Domain(String),
        Ipv6(Ipv6Addr),
    }

    impl Target {
        /// Host string suitable for passing to `channel_open_direct_tcpip`.
        /// IPv6 renders in canonical compressed form (std's `Display` impl
        /// already implements RFC 5952).
        pub fn host_string(&self) -> String {
            match self {
                Target::Ipv4(ip) => ip.to_string(),
                Target::Domain(d) => d.clone(),
                Target::Ipv6(ip) => ip.to_string(),
            }
        }
    }

    pub fn validate_version(ver: u8) -> Result<(), FramerError> {
        if ver != VERSION {
            return Err(FramerError::Malformed("unsupported SOCKS version"));
        }
        Ok(())
    }

    pub fn validate_cmd(cmd: u8) -> Result<(), FramerError> {
        if cmd != CMD_CONNECT {
            return Err(FramerError::UnsupportedCommand);
        }
        Ok(())
    }

    pub fn parse_ipv4(bytes: &[u8; 4]) -> Ipv4Addr {
        Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    pub fn parse_ipv6(bytes: &[u8; 16]) -> Ipv6Addr {
        let mut groups = [0u16; 8];
        for i in 0..8 {
            groups[i] = u16::from_be_bytes([bytes[i * 2], bytes[i * 2 + 1]]);
        }
        Ipv6Addr::new(
            groups[0], groups[1], groups[2], groups[3], groups[4], groups[5], groups[6], groups[7],
        )
    }

    pub fn parse_domain(bytes: &[u8]) -> Result<String, FramerError> {
        if bytes.is_empty() {
            return Err(FramerError::Malformed("zero-length domain"));
        }
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn parse_port(bytes: &[u8; 2]) -> u16 {
        u16::from_be_bytes(*bytes)
    }

    /// Constant-time credential comparison (RFC 1929 AUTH).
    pub fn credentials_match(uname: &[u8], passwd: &[u8], configured_user: &str, configured_pass: &str) -> bool {
        use super::ConstantTimeEq;
        let user_ok: bool = uname.ct_eq(configured_user.as_bytes()).into();
        let pass_ok: bool = passwd.ct_eq(configured_pass.as_bytes()).into();
        user_ok & pass_ok
    }
}

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("malformed SOCKS5 request: {0}")]
    Malformed(&'static str),
    #[error("unsupported SOCKS5 command")]
    UnsupportedCommand,
    #[error("unsupported SOCKS5 address type")]
    UnsupportedAddressType,
    #[error("no acceptable auth method")]
    NoAcceptableMethod,
    #[error("auth failed")]
    AuthFailed,
    #[error("phase timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A successfully parsed CONNECT request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub target: wire::Target,
    pub port: u16,
}

/// Proxy-level auth configuration for one tunnel's SOCKS5 listener
/// (spec.md §3's `proxyUsername`/`proxyPassword`).
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Drives GREETING → (AUTH)? → REQUEST against a stream. FORWARDING is
/// handled separately by [`forward`] once the caller has opened the SSH
/// channel for the parsed target.
pub struct Socks5Framer {
    pub auth: Option<ProxyAuth>,
}

impl Socks5Framer {
    pub fn new(auth: Option<ProxyAuth>) -> Self {
        Self { auth }
    }

    /// Run GREETING, optional AUTH, and REQUEST. On any failure the caller
    /// is responsible for having already had the appropriate reply written
    /// (this function writes failure replies itself where the protocol
    /// defines one; malformed/truncated input simply returns `Err` for the
    /// caller to close the socket on, per spec.md §4.5).
    pub async fn negotiate<S>(&self, stream: &mut S) -> Result<ConnectRequest, FramerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.greeting_and_auth(stream).await?;
        self.request(stream).await
    }

    async fn greeting_and_auth<S>(&self, stream: &mut S) -> Result<(), FramerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        with_timeout(async {
            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await?;
            wire::validate_version(head[0])?;
            let nmethods = head[1] as usize;

            let mut methods = vec![0u8; nmethods];
            stream.read_exact(&mut methods).await?;

            let method = wire::choose_method(&methods, self.auth.is_some());
            stream.write_all(&wire::method_reply(method)).await?;

            if method == wire::METHOD_NO_ACCEPTABLE {
                return Err(FramerError::NoAcceptableMethod);
            }

            if method == wire::METHOD_USER_PASS {
                let mut auth_head = [0u8; 2];
                stream.read_exact(&mut auth_head).await?;
                let ulen = auth_head[1] as usize;
                let mut uname = vec![0u8; ulen];
                stream.read_exact(&mut uname).await?;

                let mut plen_buf = [0u8; 1];
                stream.read_exact(&mut plen_buf).await?;
                let mut passwd = vec![0u8; plen_buf[0] as usize];
                stream.read_exact(&mut passwd).await?;

                let configured = self.auth.as_ref().expect("method chosen implies auth configured");
                let ok = wire::credentials_match(&uname, &passwd, &configured.username, &configured.password);

                stream.write_all(&wire::auth_reply(ok)).await?;
                if !ok {
                    return Err(FramerError::AuthFailed);
                }
            }

            Ok(())
        })
        .await
    }

    async fn request<S>(&self, stream: &mut S) -> Result<ConnectRequest, FramerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        with_timeout(async {
            let mut head = [0u8; 4];
            stream.read_exact(&mut head).await?;
            wire::validate_version(head[0])?;

            if let Err(e) = wire::validate_cmd(head[1]) {
                stream.write_all(&wire::connect_reply(wire::REP_CMD_NOT_SUPPORTED)).await?;
                return Err(e);
            }

            let atyp = head[3];
            let target = match atyp {
                wire::ATYP_IPV4 => {
                    let mut buf = [0u8; 4];
                    stream.read_exact(&mut buf).await?;
                    wire::Target::Ipv4(wire::parse_ipv4(&buf))
                }
                wire::ATYP_DOMAIN => {
                    let mut len_buf = [0u8; 1];
                    stream.read_exact(&mut len_buf).await?;
                    let mut buf = vec![0u8; len_buf[0] as usize];
                    stream.read_exact(&mut buf).await?;
                    match wire::parse_domain(&buf) {
                        Ok(domain) => wire::Target::Domain(domain),
                        Err(e) => return Err(e),
                    }
                }
                wire::ATYP_IPV6 => {
                    let mut buf = [0u8; 16];
                    stream.read_exact(&mut buf).await?;
                    wire::Target::Ipv6(wire::parse_ipv6(&buf))
                }
                _ => {
                    stream.write_all(&wire::connect_reply(wire::REP_ADDR_NOT_SUPPORTED)).await?;
                    return Err(FramerError::UnsupportedAddressType);
                }
            };

            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let port = wire::parse_port(&port_buf);

            Ok(ConnectRequest { target, port })
        })
        .await
    }
}

async fn with_timeout<F, T>(fut: F) -> Result<T, FramerError>
where
    F: std::future::Future<Output = Result<T, FramerError>>,
{
    tokio::time::timeout(PHASE_TIMEOUT, fut)
        .await
        .unwrap_or(Err(FramerError::Timeout))
}

/// Reply success (BND.ADDR=0.0.0.0:0) to the CONNECT request.
pub async fn reply_success<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.write_all(&wire::connect_reply(wire::REP_SUCCESS)).await
}

/// Reply general failure (channel could not be opened).
pub async fn reply_failure<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.write_all(&wire::connect_reply(wire::REP_GENERAL_FAILURE)).await
}

/// Bidirectional copy between the SOCKS5 client stream and the SSH
/// direct-tcpip channel, counting bytes on each half. Either half-close
/// propagates; the whole bridge ends when both halves end or either side
/// errors. No idle timeout — FORWARDING relies on the peer (spec.md §4.5).
pub async fn forward<S>(mut stream: S, mut channel: Channel<Msg>) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(&mut stream);

    let mut bytes_in: u64 = 0; // client -> remote
    let mut bytes_out: u64 = 0; // remote -> client
    let mut buf = vec![0u8; 32 * 1024];
    let mut local_eof = false;

    loop {
        tokio::select! {
            result = local_read.read(&mut buf), if !local_eof => {
                match result {
                    Ok(0) => {
                        local_eof = true;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        bytes_in += n as u64;
                        if channel.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("socks forward: local read error: {}", e);
                        break;
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        bytes_out += data.len() as u64;
                        if local_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => break,
                    Some(_) => continue,
                    None => break,
                }
            }
        }
    }

    let _ = channel.close().await;
    (bytes_in, bytes_out)
}

#[cfg(test)]
mod tests {
    use super::wire::*;
    use super::*;
    use tokio::io::DuplexStream;

    fn pair() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(4096)
    }

    #[tokio::test]
    async fn s1_greeting_no_auth() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(None);

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

        let server_task = tokio::spawn(async move { framer.greeting_and_auth(&mut server).await });

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
        assert!(server_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn s2_unsupported_command_replies_and_closes() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(None);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut greet_reply = [0u8; 2];
            client.read_exact(&mut greet_reply).await.unwrap();

            // CMD=0x03 (BIND), unsupported.
            client
                .write_all(&[0x05, 0x03, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
                .await
                .unwrap();

            let mut reply = [0u8; 10];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        });

        let result = framer.negotiate(&mut server).await;
        assert!(matches!(result, Err(FramerError::UnsupportedCommand)));
    }

    #[tokio::test]
    async fn s3_ipv6_target_parsed() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(None);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut greet_reply = [0u8; 2];
            client.read_exact(&mut greet_reply).await.unwrap();

            let mut request = vec![0x05, 0x01, 0x00, 0x04];
            request.extend_from_slice(&hex("20010db8000000000000000000000001"));
            request.extend_from_slice(&[0x01, 0xbb]);
            client.write_all(&request).await.unwrap();
        });

        let request = framer.negotiate(&mut server).await.unwrap();
        assert_eq!(request.target.host_string(), "2001:db8::1");
        assert_eq!(request.port, 443);
    }

    #[tokio::test]
    async fn s4_auth_required_and_rejects_bad_methods() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(Some(ProxyAuth {
            username: "x".into(),
            password: "y".into(),
        }));

        tokio::spawn(async move {
            // Offer only NO_AUTH -> rejected.
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0xFF]);
        });

        let result = framer.greeting_and_auth(&mut server).await;
        assert!(matches!(result, Err(FramerError::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn s4_auth_success_then_failure_on_next_connection() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(Some(ProxyAuth {
            username: "x".into(),
            password: "y".into(),
        }));

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, [0x05, 0x02]);

            // AUTH: uname="x", passwd="y" -> success.
            client.write_all(&[0x01, 0x01, b'x', 0x01, b'y']).await.unwrap();
            let mut auth_reply = [0u8; 2];
            client.read_exact(&mut auth_reply).await.unwrap();
            assert_eq!(auth_reply, [0x01, 0x00]);
        });

        assert!(framer.greeting_and_auth(&mut server).await.is_ok());

        let (mut client2, mut server2) = pair();
        tokio::spawn(async move {
            client2.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
            let mut reply = [0u8; 2];
            client2.read_exact(&mut reply).await.unwrap();

            // AUTH: uname="x", passwd="z" (wrong) -> failure.
            client2.write_all(&[0x01, 0x01, b'x', 0x01, b'z']).await.unwrap();
            let mut auth_reply = [0u8; 2];
            client2.read_exact(&mut auth_reply).await.unwrap();
            assert_eq!(auth_reply, [0x01, 0x01]);
        });

        let result = framer.greeting_and_auth(&mut server2).await;
        assert!(matches!(result, Err(FramerError::AuthFailed)));
    }

    #[tokio::test]
    async fn domain_target_round_trips() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(None);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut greet_reply = [0u8; 2];
            client.read_exact(&mut greet_reply).await.unwrap();

            let domain = b"example.com";
            let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
            request.extend_from_slice(domain);
            request.extend_from_slice(&80u16.to_be_bytes());
            client.write_all(&request).await.unwrap();
        });

        let request = framer.negotiate(&mut server).await.unwrap();
        assert_eq!(request.target.host_string(), "example.com");
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn zero_length_domain_rejected() {
        let (mut client, mut server) = pair();
        let framer = Socks5Framer::new(None);

        tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut greet_reply = [0u8; 2];
            client.read_exact(&mut greet_reply).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00, 0x03, 0x00]).await.unwrap();
        });

        let result = framer.negotiate(&mut server).await;
        assert!(matches!(result, Err(FramerError::Malformed(_))));
    }

    #[test]
    fn method_selection_prefers_userpass_when_configured_and_offered() {
        assert_eq!(choose_method(&[0x00, 0x02], true), METHOD_USER_PASS);
        assert_eq!(choose_method(&[0x00], true), METHOD_NO_AUTH);
        assert_eq!(choose_method(&[0x00], false), METHOD_NO_AUTH);
        assert_eq!(choose_method(&[0x02], false), METHOD_NO_ACCEPTABLE);
    }

    #[test]
    fn boundary_ports_accepted() {
        assert_eq!(parse_port(&1u16.to_be_bytes()), 1);
        assert_eq!(parse_port(&65535u16.to_be_bytes()), 65535);
    }

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }
}
