//! SMTP capture listener
//!
//! [`SmtpSession`] is a pure command state machine; [`serve_session`]
//! drives it over any byte stream with bounded line reads and idle
//! timeouts. A transaction is recorded once its DATA terminator arrives,
//! after the final reply has been written. Sessions cut short by a
//! timeout or disconnect are discarded.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_native_tls::TlsAcceptor;
use tracing::{debug, info};

use super::{Capture, CaptureContext, Listener};
use crate::error::{Result, VigilError};
use crate::models::{ParsedProbe, Probe, ProbeResponse, Protocol, SmtpRequest, SmtpResponse};
use crate::registry::{ZoneMatch, ZoneRegistry};

/// Unrecognized commands tolerated before the session is dropped
const MAX_ERRORS: u32 = 10;

/// Position in the SMTP dialogue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Greeting,
    Helo,
    Mail,
    Rcpt,
    Data,
    Complete,
    Error,
}

/// A numbered reply, possibly multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Wire form, CRLF-terminated
    pub fn render(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        out
    }
}

/// A finished transaction ready for rule evaluation
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request: SmtpRequest,
    pub zone: ZoneMatch,
    /// Domain of the first accepted recipient
    pub hostname: String,
}

/// What the driver should do after a line
#[derive(Debug)]
pub enum Step {
    Reply(Reply),
    /// Write the reply, then close
    Close(Reply),
    /// A message line was buffered; nothing to write
    Absorbed,
    Deliver(Delivery),
}

/// Command state machine for one connection
pub struct SmtpSession {
    registry: Arc<ZoneRegistry>,
    hostname: String,
    max_data: usize,
    state: SmtpState,
    helo: String,
    mail_from: String,
    rcpt_tos: Vec<String>,
    data: String,
    target: Option<(ZoneMatch, String)>,
    errors: u32,
}

impl SmtpSession {
    pub fn new(registry: Arc<ZoneRegistry>, hostname: impl Into<String>, max_data: usize) -> Self {
        Self {
            registry,
            hostname: hostname.into(),
            max_data,
            state: SmtpState::Greeting,
            helo: String::new(),
            mail_from: String::new(),
            rcpt_tos: Vec::new(),
            data: String::new(),
            target: None,
            errors: 0,
        }
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} ESMTP ready", self.hostname))
    }

    /// Feeds one line, stripped of its CRLF
    pub fn handle_line(&mut self, line: &str) -> Step {
        if self.state == SmtpState::Data {
            return self.data_line(line);
        }

        let (verb, arg) = split_command(line);
        match verb.as_str() {
            "HELO" | "EHLO" => self.hello(&verb, arg),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.start_data(),
            "RSET" => {
                self.reset_transaction();
                if self.state != SmtpState::Greeting {
                    self.state = SmtpState::Helo;
                }
                Step::Reply(Reply::new(250, "OK"))
            }
            "NOOP" => Step::Reply(Reply::new(250, "OK")),
            "VRFY" => Step::Reply(Reply::new(252, "Cannot VRFY user")),
            "QUIT" => Step::Close(Reply::new(221, format!("{} closing connection", self.hostname))),
            _ => self.unrecognized(),
        }
    }

    fn hello(&mut self, verb: &str, arg: &str) -> Step {
        if arg.is_empty() {
            return Step::Reply(Reply::new(501, format!("Syntax: {verb} hostname")));
        }
        self.reset_transaction();
        self.helo = arg.to_string();
        self.state = SmtpState::Helo;

        let greeting = format!("{} Hello {}", self.hostname, arg);
        if verb == "EHLO" {
            Step::Reply(Reply {
                code: 250,
                lines: vec![greeting, format!("SIZE {}", self.max_data), "8BITMIME".into()],
            })
        } else {
            Step::Reply(Reply::new(250, greeting))
        }
    }

    fn mail(&mut self, arg: &str) -> Step {
        if !matches!(self.state, SmtpState::Helo | SmtpState::Complete) {
            return self.bad_sequence();
        }
        let Some(path) = strip_keyword(arg, "FROM:") else {
            return Step::Reply(Reply::new(501, "Syntax: MAIL FROM:<address>"));
        };
        self.reset_transaction();
        self.mail_from = parse_path(path);
        self.state = SmtpState::Mail;
        Step::Reply(Reply::new(250, "OK"))
    }

    fn rcpt(&mut self, arg: &str) -> Step {
        if !matches!(self.state, SmtpState::Mail | SmtpState::Rcpt) {
            return self.bad_sequence();
        }
        let Some(path) = strip_keyword(arg, "TO:") else {
            return Step::Reply(Reply::new(501, "Syntax: RCPT TO:<address>"));
        };
        let address = parse_path(path);
        let Some((_, domain)) = address.rsplit_once('@') else {
            return Step::Reply(Reply::new(501, "Recipient address must include a domain"));
        };

        let Some(zone) = self.registry.resolve(domain) else {
            debug!("Refusing recipient {}", address);
            return Step::Reply(Reply::new(550, "Relay access denied"));
        };
        if self.target.is_none() {
            self.target = Some((zone, domain.to_ascii_lowercase()));
        }
        self.rcpt_tos.push(address);
        self.state = SmtpState::Rcpt;
        Step::Reply(Reply::new(250, "OK"))
    }

    fn start_data(&mut self) -> Step {
        if self.state != SmtpState::Rcpt || self.target.is_none() {
            return self.bad_sequence();
        }
        self.state = SmtpState::Data;
        Step::Reply(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
    }

    fn data_line(&mut self, line: &str) -> Step {
        if line == "." {
            let Some((zone, hostname)) = self.target.take() else {
                return self.bad_sequence();
            };
            let request = SmtpRequest {
                helo: self.helo.clone(),
                mail_from: std::mem::take(&mut self.mail_from),
                rcpt_tos: std::mem::take(&mut self.rcpt_tos),
                data: std::mem::take(&mut self.data),
            };
            self.state = SmtpState::Complete;
            return Step::Deliver(Delivery {
                request,
                zone,
                hostname,
            });
        }

        let line = if line.starts_with("..") { &line[1..] } else { line };
        if self.data.len() + line.len() + 2 > self.max_data {
            self.state = SmtpState::Error;
            return Step::Close(Reply::new(552, "Message size exceeds fixed maximum message size"));
        }
        self.data.push_str(line);
        self.data.push_str("\r\n");
        Step::Absorbed
    }

    fn bad_sequence(&mut self) -> Step {
        self.state = SmtpState::Error;
        Step::Close(Reply::new(503, "Bad sequence of commands"))
    }

    fn unrecognized(&mut self) -> Step {
        self.errors += 1;
        if self.errors >= MAX_ERRORS {
            self.state = SmtpState::Error;
            return Step::Close(Reply::new(421, "Too many errors, closing connection"));
        }
        Step::Reply(Reply::new(500, "Command unrecognized"))
    }

    fn reset_transaction(&mut self) {
        self.mail_from.clear();
        self.rcpt_tos.clear();
        self.data.clear();
        self.target = None;
    }
}

fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(' ') {
        Some((verb, arg)) => (verb.to_ascii_uppercase(), arg.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

fn strip_keyword<'a>(arg: &'a str, keyword: &str) -> Option<&'a str> {
    let head = arg.get(..keyword.len())?;
    head.eq_ignore_ascii_case(keyword)
        .then(|| arg[keyword.len()..].trim())
}

/// Extracts the address from `<addr> PARAMS` or a bare `addr`
fn parse_path(path: &str) -> String {
    let path = path.trim();
    let address = match path.strip_prefix('<') {
        Some(rest) => rest.split('>').next().unwrap_or_default(),
        None => path.split_whitespace().next().unwrap_or_default(),
    };
    address.trim().to_string()
}

enum LineRead {
    Line,
    Eof,
    TooLong,
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let n = (&mut *reader)
        .take(limit as u64 + 1)
        .read_until(b'\n', buf)
        .await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() == Some(&b'\n') {
        return Ok(LineRead::Line);
    }
    Ok(if n > limit {
        LineRead::TooLong
    } else {
        LineRead::Eof
    })
}

fn deliver(ctx: &CaptureContext, delivery: Delivery, remote: SocketAddr) -> Capture {
    let Delivery {
        request,
        zone,
        hostname,
    } = delivery;
    let probe = ParsedProbe::new(hostname, remote, Probe::Smtp(request));
    let default = ProbeResponse::Smtp(SmtpResponse::default());
    let (response, matched) = ctx.respond(&zone, &probe.payload, default);
    Capture {
        zone,
        probe,
        response,
        matched,
    }
}

/// Runs one SMTP dialogue over `stream`
pub async fn serve_session<S>(
    stream: S,
    remote: SocketAddr,
    ctx: &CaptureContext,
    hostname: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut session = SmtpSession::new(
        Arc::clone(&ctx.registry),
        hostname,
        ctx.limits.max_data_bytes,
    );
    writer.write_all(session.greeting().render().as_bytes()).await?;

    let mut line = Vec::with_capacity(256);
    loop {
        let read = timeout(
            ctx.limits.idle_timeout,
            read_line(&mut reader, &mut line, ctx.limits.max_line_bytes),
        )
        .await;
        match read {
            Err(_) => {
                debug!("SMTP session from {} idle in {:?}", remote, session.state());
                let _ = writer
                    .write_all(Reply::new(421, "Idle timeout, closing connection").render().as_bytes())
                    .await;
                break;
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(LineRead::Eof)) => break,
            Ok(Ok(LineRead::TooLong)) => {
                writer
                    .write_all(Reply::new(500, "Line too long").render().as_bytes())
                    .await?;
                break;
            }
            Ok(Ok(LineRead::Line)) => {}
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        match session.handle_line(text) {
            Step::Absorbed => {}
            Step::Reply(reply) => writer.write_all(reply.render().as_bytes()).await?,
            Step::Close(reply) => {
                writer.write_all(reply.render().as_bytes()).await?;
                break;
            }
            Step::Deliver(delivery) => {
                let capture = deliver(ctx, delivery, remote);
                let reply = match &capture.response {
                    ProbeResponse::Smtp(r) => Reply::new(r.code, r.message.clone()),
                    _ => Reply::new(250, "OK"),
                };
                writer.write_all(reply.render().as_bytes()).await?;
                ctx.record(capture).await;
            }
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

async fn accept_session(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: &CaptureContext,
    tls: Option<TlsAcceptor>,
    hostname: &str,
) -> Result<()> {
    match tls {
        Some(acceptor) => {
            let stream = timeout(ctx.limits.idle_timeout, acceptor.accept(stream))
                .await
                .map_err(|_| VigilError::ListenerError("TLS handshake timed out".into()))??;
            serve_session(stream, remote, ctx, hostname).await
        }
        None => serve_session(stream, remote, ctx, hostname).await,
    }
}

/// SMTP on a TCP port, optionally wrapped in implicit TLS
pub struct SmtpListener {
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Arc<CaptureContext>,
    tls: Option<TlsAcceptor>,
    hostname: String,
}

impl SmtpListener {
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<CaptureContext>,
        hostname: impl Into<String>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            VigilError::ListenerError(format!("cannot bind SMTP on {addr}: {e}"))
        })?;
        Self::from_listener(listener, ctx, hostname, tls)
    }

    pub fn from_listener(
        listener: TcpListener,
        ctx: Arc<CaptureContext>,
        hostname: impl Into<String>,
        tls: Option<TlsAcceptor>,
    ) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            ctx,
            tls,
            hostname: hostname.into(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for SmtpListener {
    fn name(&self) -> String {
        let scheme = if self.tls.is_some() { "smtps" } else { "smtp" };
        format!("{} {}", scheme, self.addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Smtp
    }

    async fn run(&self) -> Result<()> {
        info!("SMTP listening on {}", self.name());

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!("SMTP accept error: {}", e);
                    continue;
                }
            };
            let Some(permit) = self.ctx.limiter.try_acquire(remote.ip()) else {
                continue;
            };

            let ctx = Arc::clone(&self.ctx);
            let tls = self.tls.clone();
            let hostname = self.hostname.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let session = accept_session(stream, remote, &ctx, tls, &hostname);
                match timeout(ctx.limits.max_session, session).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("SMTP session from {} failed: {}", remote, e),
                    Err(_) => debug!("SMTP session from {} hit the session cap", remote),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SmtpSession {
        let registry = Arc::new(ZoneRegistry::new());
        registry
            .register_domain("ssrf.uk", Default::default(), "admin")
            .unwrap();
        registry.issue_zone("ssrf.uk", "alice", Some("alice")).unwrap();
        SmtpSession::new(registry, "mx.test", 64)
    }

    fn code(step: Step) -> u16 {
        match step {
            Step::Reply(r) | Step::Close(r) => r.code,
            Step::Absorbed => 0,
            Step::Deliver(_) => 1,
        }
    }

    #[test]
    fn test_full_transaction() {
        let mut s = session();
        assert_eq!(code(s.handle_line("HELO x")), 250);
        assert_eq!(code(s.handle_line("MAIL FROM:<a@b.c>")), 250);
        assert_eq!(code(s.handle_line("RCPT TO:<z@alice.ssrf.uk>")), 250);
        assert_eq!(code(s.handle_line("DATA")), 354);
        assert!(matches!(s.handle_line("hello"), Step::Absorbed));
        match s.handle_line(".") {
            Step::Deliver(d) => {
                assert_eq!(d.request.data, "hello\r\n");
                assert_eq!(d.request.mail_from, "a@b.c");
                assert_eq!(d.request.rcpt_tos, vec!["z@alice.ssrf.uk"]);
                assert_eq!(d.zone.zone.fqdn, "alice.ssrf.uk");
            }
            other => panic!("expected delivery, got {other:?}"),
        }
        assert_eq!(s.state(), SmtpState::Complete);
        assert_eq!(code(s.handle_line("MAIL FROM:<again@b.c>")), 250);
    }

    #[test]
    fn test_out_of_order_closes() {
        let mut s = session();
        assert!(matches!(s.handle_line("DATA"), Step::Close(r) if r.code == 503));
        assert_eq!(s.state(), SmtpState::Error);
    }

    #[test]
    fn test_recipient_checks() {
        let mut s = session();
        s.handle_line("EHLO x");
        s.handle_line("MAIL FROM:<>");
        assert_eq!(code(s.handle_line("RCPT TO:<nobody>")), 501);
        assert_eq!(code(s.handle_line("RCPT TO:<z@elsewhere.org>")), 550);
        assert_eq!(s.state(), SmtpState::Mail);
    }

    #[test]
    fn test_dot_unstuffing_and_size_cap() {
        let mut s = session();
        s.handle_line("HELO x");
        s.handle_line("MAIL FROM:<a@b.c>");
        s.handle_line("RCPT TO:<z@alice.ssrf.uk>");
        s.handle_line("DATA");
        s.handle_line("..leading dot");
        assert!(matches!(s.handle_line(&"x".repeat(80)), Step::Close(r) if r.code == 552));
    }

    #[test]
    fn test_reply_render() {
        let reply = Reply {
            code: 250,
            lines: vec!["a".into(), "b".into()],
        };
        assert_eq!(reply.render(), "250-a\r\n250 b\r\n");
    }
}
