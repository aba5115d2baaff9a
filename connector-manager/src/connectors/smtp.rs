//! SMTP mail connector.
//!
//! Speaks just enough SMTP to submit mail: greeting, EHLO, AUTH PLAIN, NOOP,
//! MAIL/RCPT/DATA and QUIT. The wire is behind [`SmtpTransport`] so sessions
//! can be swapped out; the bundled [`TcpSmtpTransport`] is plain TCP only.

use crate::connector::{Connector, MessageSender};
use crate::error::{classify, ConnectorError};
use crate::types::{Capability, ConnectorDescriptor, ConnectorKind, OutboundMessage, SendReceipt};
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use conduit::credentials::Credentials;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

const PROVIDER: &str = "smtp";

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Envelope sender. Falls back to the login name.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_port() -> u16 {
    587
}

impl SmtpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(10_000))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub message: String,
}

impl SmtpReply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

/// Opens SMTP sessions.
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    /// Connects and consumes the server greeting.
    async fn open(&self, config: &SmtpConfig) -> Result<Box<dyn SmtpSession>, ConnectorError>;

    fn supports_tls(&self) -> bool {
        false
    }
}

/// An open SMTP conversation.
#[async_trait]
pub trait SmtpSession: Send {
    /// Sends one command line and reads the full reply.
    async fn command(&mut self, line: &str) -> Result<SmtpReply, ConnectorError>;

    /// Sends the message content after a 354 and reads the reply.
    async fn data(&mut self, content: &str) -> Result<SmtpReply, ConnectorError>;
}

pub struct TcpSmtpTransport;

#[async_trait]
impl SmtpTransport for TcpSmtpTransport {
    async fn open(&self, config: &SmtpConfig) -> Result<Box<dyn SmtpSession>, ConnectorError> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&addr))
            .await
            .with_context(|| format!("connecting to {}", addr))
            .map_err(|e| classify(PROVIDER, e))?
            .with_context(|| format!("connecting to {}", addr))
            .map_err(|e| classify(PROVIDER, e))?;

        let (read, write) = stream.into_split();
        let mut session = TcpSmtpSession {
            reader: BufReader::new(read),
            writer: write,
        };
        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(ConnectorError::external(
                PROVIDER,
                format!("unexpected greeting {} {}", greeting.code, greeting.message),
            ));
        }
        debug!(addr = %addr, "SMTP session opened");
        Ok(Box::new(session))
    }
}

struct TcpSmtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TcpSmtpSession {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), ConnectorError> {
        self.writer
            .write_all(bytes)
            .await
            .context("writing to smtp server")
            .map_err(|e| classify(PROVIDER, e))
    }

    async fn read_reply(&mut self) -> Result<SmtpReply, ConnectorError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .context("reading smtp reply")
                .map_err(|e| classify(PROVIDER, e))?;
            if n == 0 {
                return Err(ConnectorError::external(PROVIDER, "connection closed by server"));
            }

            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| ConnectorError::external(PROVIDER, format!("malformed reply '{}'", line)))?;
            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if !more {
                return Ok(SmtpReply::new(code, lines.join("\n")));
            }
        }
    }
}

#[async_trait]
impl SmtpSession for TcpSmtpSession {
    async fn command(&mut self, line: &str) -> Result<SmtpReply, ConnectorError> {
        self.write_all(format!("{}\r\n", line).as_bytes()).await?;
        self.read_reply().await
    }

    async fn data(&mut self, content: &str) -> Result<SmtpReply, ConnectorError> {
        let mut wire = String::with_capacity(content.len() + 8);
        for line in content.split("\r\n") {
            if line.starts_with('.') {
                wire.push('.');
            }
            wire.push_str(line);
            wire.push_str("\r\n");
        }
        wire.push_str(".\r\n");
        self.write_all(wire.as_bytes()).await?;
        self.read_reply().await
    }
}

pub struct SmtpConnector {
    descriptor: ConnectorDescriptor,
    transport: Arc<dyn SmtpTransport>,
    config: Option<SmtpConfig>,
    session: tokio::sync::Mutex<Option<Box<dyn SmtpSession>>>,
    username: RwLock<Option<String>>,
}

impl SmtpConnector {
    pub fn new() -> Self {
        Self::with_transport(Arc::new(TcpSmtpTransport))
    }

    pub fn with_transport(transport: Arc<dyn SmtpTransport>) -> Self {
        Self {
            descriptor: ConnectorDescriptor::new(
                PROVIDER,
                ConnectorKind::Mail,
                env!("CARGO_PKG_VERSION"),
                [Capability::SendMessages],
            ),
            transport,
            config: None,
            session: tokio::sync::Mutex::new(None),
            username: RwLock::new(None),
        }
    }

    fn config(&self) -> Result<&SmtpConfig, ConnectorError> {
        self.config
            .as_ref()
            .ok_or_else(|| ConnectorError::configuration("smtp connector is not configured"))
    }

    fn sender_address(&self) -> Result<String, ConnectorError> {
        let config = self.config()?;
        config
            .from
            .clone()
            .or_else(|| self.username.read().unwrap().clone())
            .ok_or_else(|| ConnectorError::configuration("no sender address"))
    }
}

impl Default for SmtpConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn login(credentials: &Credentials) -> Result<(&str, &str), ConnectorError> {
    match credentials {
        Credentials::Basic { username, password } if !username.is_empty() && !password.is_empty() => {
            Ok((username.as_str(), password.as_str()))
        }
        _ => Err(ConnectorError::authentication("smtp requires a username and password")),
    }
}

/// Fails unless the reply carries `code`. 5xx is permanent, anything else transient.
fn expect(reply: SmtpReply, code: u16, step: &str) -> Result<SmtpReply, ConnectorError> {
    if reply.code == code {
        return Ok(reply);
    }
    let message = format!("{} rejected: {} {}", step, reply.code, reply.message);
    if reply.code >= 500 {
        Err(ConnectorError::configuration(message))
    } else {
        Err(ConnectorError::external(PROVIDER, message))
    }
}

/// Rejects addresses that could break out of a `MAIL FROM:<..>` or `RCPT TO:<..>` line.
fn check_address(address: &str) -> Result<(), ConnectorError> {
    if address.trim().is_empty() || address.contains(['\r', '\n', '<', '>']) {
        return Err(ConnectorError::configuration(format!(
            "invalid mail address {:?}",
            address
        )));
    }
    Ok(())
}

fn check_header(name: &str, value: &str) -> Result<(), ConnectorError> {
    if value.contains(['\r', '\n']) {
        return Err(ConnectorError::configuration(format!(
            "{} header contains a line break",
            name
        )));
    }
    Ok(())
}

fn check_message(from: &str, message: &OutboundMessage) -> Result<(), ConnectorError> {
    if message.to.is_empty() {
        return Err(ConnectorError::configuration("message has no recipients"));
    }
    check_address(from)?;
    for rcpt in &message.to {
        check_address(rcpt)?;
    }
    if let Some(subject) = &message.subject {
        check_header("Subject", subject)?;
    }
    if let Some(thread) = &message.thread_id {
        check_header("In-Reply-To", thread)?;
    }
    Ok(())
}

fn render(from: &str, message: &OutboundMessage, message_id: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("From: {}\r\n", from));
    out.push_str(&format!("To: {}\r\n", message.to.join(", ")));
    if let Some(subject) = &message.subject {
        out.push_str(&format!("Subject: {}\r\n", subject));
    }
    if let Some(thread) = &message.thread_id {
        out.push_str(&format!("In-Reply-To: {}\r\n", thread));
        out.push_str(&format!("References: {}\r\n", thread));
    }
    out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
    out.push_str(&format!("Message-ID: {}\r\n", message_id));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("\r\n");
    out.push_str(&message.body.replace("\r\n", "\n").replace('\n', "\r\n"));
    out
}

#[async_trait]
impl Connector for SmtpConnector {
    fn descriptor(&self) -> &ConnectorDescriptor {
        &self.descriptor
    }

    fn configure(&mut self, config: &Value) -> Result<(), ConnectorError> {
        let config: SmtpConfig = serde_json::from_value(config.clone())
            .map_err(|e| ConnectorError::configuration(format!("invalid smtp config: {}", e)))?;
        if config.host.trim().is_empty() {
            return Err(ConnectorError::configuration("smtp host is required"));
        }
        if config.port == 0 {
            return Err(ConnectorError::configuration("smtp port must be non-zero"));
        }
        if config.tls && !self.transport.supports_tls() {
            return Err(ConnectorError::configuration("transport does not support TLS"));
        }
        if let Some(from) = &config.from {
            check_address(from)?;
        }
        self.config = Some(config);
        Ok(())
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        login(credentials).map(|_| ())
    }

    async fn validate_auth(&self, credentials: &Credentials) -> Result<bool, ConnectorError> {
        Ok(login(credentials).is_ok())
    }

    async fn connect(&self, credentials: &Credentials) -> Result<(), ConnectorError> {
        let config = self.config()?;
        let (username, password) = login(credentials)?;

        let mut session = self.transport.open(config).await?;
        expect(session.command("EHLO localhost").await?, 250, "EHLO")?;

        let token = BASE64.encode(format!("\0{}\0{}", username, password));
        let reply = session.command(&format!("AUTH PLAIN {}", token)).await?;
        match reply.code {
            235 => {}
            530 | 534 | 535 => {
                let _ = session.command("QUIT").await;
                return Err(ConnectorError::authentication(format!(
                    "server rejected login: {} {}",
                    reply.code, reply.message
                )));
            }
            _ => {
                expect(reply, 235, "AUTH")?;
            }
        }

        *self.username.write().unwrap() = Some(username.to_string());
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            if let Err(e) = session.command("QUIT").await {
                debug!(error = %e, "SMTP QUIT failed");
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<bool, ConnectorError> {
        let mut guard = self.session.lock().await;
        match guard.as_mut() {
            Some(session) => Ok(session.command("NOOP").await?.code == 250),
            None => Ok(false),
        }
    }

    fn as_message_sender(&self) -> Option<&dyn MessageSender> {
        Some(self)
    }
}

impl SmtpConnector {
    async fn transact(
        session: &mut dyn SmtpSession,
        from: &str,
        host: &str,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, ConnectorError> {
        expect(session.command(&format!("MAIL FROM:<{}>", from)).await?, 250, "MAIL FROM")?;

        let mut accepted = Vec::new();
        for rcpt in &message.to {
            let reply = session.command(&format!("RCPT TO:<{}>", rcpt)).await?;
            if reply.is_positive() {
                accepted.push(rcpt.clone());
            } else {
                warn!(recipient = %rcpt, code = reply.code, "SMTP recipient rejected");
            }
        }
        if accepted.is_empty() {
            return Err(ConnectorError::configuration("all recipients rejected"));
        }

        expect(session.command("DATA").await?, 354, "DATA")?;
        let message_id = format!("<{}@{}>", Uuid::now_v7(), host);
        expect(
            session.data(&render(from, message, &message_id)).await?,
            250,
            "message",
        )?;

        Ok(SendReceipt {
            message_id,
            accepted,
            sent_at: Utc::now(),
        })
    }
}

#[async_trait]
impl MessageSender for SmtpConnector {
    async fn send_message(&self, message: &OutboundMessage) -> Result<SendReceipt, ConnectorError> {
        let from = self.sender_address()?;
        check_message(&from, message)?;
        let host = self.config()?.host.clone();

        // The session is out of its slot for the whole transaction, so a failed
        // or cancelled send leaves nothing behind to reuse.
        let mut guard = self.session.lock().await;
        let mut session = guard.take().ok_or_else(ConnectorError::not_connected)?;

        match Self::transact(session.as_mut(), &from, &host, message).await {
            Ok(receipt) => {
                *guard = Some(session);
                Ok(receipt)
            }
            Err(e) => {
                warn!(error = %e, "SMTP transaction failed, dropping session");
                if let Err(quit) = session.command("QUIT").await {
                    debug!(error = %quit, "SMTP QUIT failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Script {
        log: Mutex<Vec<String>>,
        reject_login: bool,
        drop_next_mail: std::sync::atomic::AtomicBool,
    }

    impl Script {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    struct MockTransport(Arc<Script>);

    struct MockSession(Arc<Script>);

    #[async_trait]
    impl SmtpTransport for MockTransport {
        async fn open(&self, _config: &SmtpConfig) -> Result<Box<dyn SmtpSession>, ConnectorError> {
            Ok(Box::new(MockSession(self.0.clone())))
        }
    }

    #[async_trait]
    impl SmtpSession for MockSession {
        async fn command(&mut self, line: &str) -> Result<SmtpReply, ConnectorError> {
            self.0.log.lock().unwrap().push(line.to_string());
            let verb = line.split_whitespace().next().unwrap_or("");
            if verb == "MAIL" && self.0.drop_next_mail.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ConnectorError::external(PROVIDER, "connection reset"));
            }
            let reply = match verb {
                "EHLO" => SmtpReply::new(250, "mx.test"),
                "AUTH" if self.0.reject_login => SmtpReply::new(535, "bad credentials"),
                "AUTH" => SmtpReply::new(235, "ok"),
                "RCPT" if line.contains("nobody@") => SmtpReply::new(550, "no such user"),
                "DATA" => SmtpReply::new(354, "go ahead"),
                "QUIT" => SmtpReply::new(221, "bye"),
                _ => SmtpReply::new(250, "ok"),
            };
            Ok(reply)
        }

        async fn data(&mut self, content: &str) -> Result<SmtpReply, ConnectorError> {
            self.0.log.lock().unwrap().push(format!("<data>{}", content));
            Ok(SmtpReply::new(250, "queued"))
        }
    }

    fn connector(script: Arc<Script>) -> SmtpConnector {
        let mut c = SmtpConnector::with_transport(Arc::new(MockTransport(script)));
        c.configure(&json!({"host": "mx.test", "port": 2525})).unwrap();
        c
    }

    fn creds() -> Credentials {
        Credentials::basic("mailer@test", "hunter2")
    }

    #[test]
    fn test_configure_validates() {
        let mut c = SmtpConnector::new();
        assert!(c.configure(&json!({"port": 25})).is_err());
        assert!(c.configure(&json!({"host": ""})).is_err());
        assert!(c.configure(&json!({"host": "mx", "tls": true})).is_err());
        c.configure(&json!({"host": "mx"})).unwrap();
        assert_eq!(c.config().unwrap().port, 587);
    }

    #[tokio::test]
    async fn test_authenticate_requires_basic() {
        let c = SmtpConnector::new();
        assert!(c.authenticate(&creds()).await.is_ok());
        assert!(matches!(
            c.authenticate(&Credentials::bearer("t")).await,
            Err(ConnectorError::Authentication(_))
        ));
        assert!(!c.validate_auth(&Credentials::basic("u", "")).await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_sends_auth_plain() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();
        assert!(c.ping().await.unwrap());

        let log = script.log.lock().unwrap().clone();
        let expected = BASE64.encode("\0mailer@test\0hunter2");
        assert_eq!(log[0], "EHLO localhost");
        assert_eq!(log[1], format!("AUTH PLAIN {}", expected));
        assert_eq!(log[2], "NOOP");
    }

    #[tokio::test]
    async fn test_rejected_login_is_authentication_error() {
        let script = Arc::new(Script {
            reject_login: true,
            ..Script::default()
        });
        let c = connector(script);
        let err = c.connect(&creds()).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Authentication(_)));
        assert!(!c.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_send_message_envelope() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();

        let receipt = c
            .send_message(&OutboundMessage {
                to: vec!["a@test".to_string(), "nobody@test".to_string()],
                subject: Some("Hello".to_string()),
                body: "line one\n.hidden".to_string(),
                thread_id: None,
            })
            .await
            .unwrap();
        assert_eq!(receipt.accepted, vec!["a@test".to_string()]);
        assert!(receipt.message_id.ends_with("@mx.test>"));

        let log = script.log.lock().unwrap().clone();
        assert!(log.contains(&"MAIL FROM:<mailer@test>".to_string()));
        assert!(log.contains(&"RCPT TO:<a@test>".to_string()));
        let data = log.iter().find(|l| l.starts_with("<data>")).unwrap();
        assert!(data.contains("Subject: Hello\r\n"));
        assert!(data.contains("\r\n\r\nline one\r\n.hidden"));
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: vec![to.to_string()],
            subject: Some("Hi".to_string()),
            body: "x".to_string(),
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn test_line_breaks_rejected_before_envelope() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();

        let bad = vec![
            message("a@test>\r\nRCPT TO:<victim@test"),
            message("a@test\nDATA"),
            message("<a@test"),
            OutboundMessage {
                subject: Some("Hi\r\nBcc: victim@test".to_string()),
                ..message("a@test")
            },
            OutboundMessage {
                thread_id: Some("<t@test>\r\nBcc: victim@test".to_string()),
                ..message("a@test")
            },
        ];
        for m in &bad {
            let err = c.send_message(m).await.unwrap_err();
            assert!(matches!(err, ConnectorError::Configuration(_)), "{:?}", m);
        }

        let log = script.log();
        assert!(!log.iter().any(|l| l.starts_with("MAIL") || l.starts_with("RCPT")));
        // Session untouched by the rejections
        c.send_message(&message("a@test")).await.unwrap();
    }

    #[test]
    fn test_configured_sender_validated() {
        let mut c = SmtpConnector::new();
        let err = c
            .configure(&json!({"host": "mx", "from": "bot@test>\r\nRCPT TO:<x@test"}))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failed_transaction_drops_session() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();

        script
            .drop_next_mail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = c.send_message(&message("a@test")).await.unwrap_err();
        assert!(matches!(err, ConnectorError::ExternalService { .. }));
        assert_eq!(script.log().last().unwrap(), "QUIT");

        let err = c.send_message(&message("a@test")).await.unwrap_err();
        assert_eq!(err, ConnectorError::not_connected());
        assert!(!c.ping().await.unwrap());

        c.connect(&creds()).await.unwrap();
        c.send_message(&message("a@test")).await.unwrap();
    }

    #[tokio::test]
    async fn test_all_recipients_rejected_drops_session() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();

        let err = c.send_message(&message("nobody@test")).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
        assert!(!script.log().iter().any(|l| l == "DATA"));
        assert_eq!(
            c.send_message(&message("a@test")).await.unwrap_err(),
            ConnectorError::not_connected()
        );
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let c = connector(Arc::new(Script::default()));
        let err = c
            .send_message(&OutboundMessage {
                to: vec!["a@test".to_string()],
                subject: None,
                body: "x".to_string(),
                thread_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_disconnect_quits() {
        let script = Arc::new(Script::default());
        let c = connector(script.clone());
        c.connect(&creds()).await.unwrap();
        c.disconnect().await.unwrap();
        assert_eq!(script.log.lock().unwrap().last().unwrap(), "QUIT");
        assert!(!c.ping().await.unwrap());
    }

    #[tokio::test]
    async fn test_tcp_transport_against_local_server() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"220 local ESMTP\r\n").await.unwrap();
            while let Some(line) = lines.next_line().await.unwrap() {
                let reply: &[u8] = if line.starts_with("EHLO") {
                    b"250-local\r\n250 AUTH PLAIN\r\n"
                } else if line.starts_with("AUTH") {
                    b"235 ok\r\n"
                } else if line.starts_with("QUIT") {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    b"250 ok\r\n"
                };
                write.write_all(reply).await.unwrap();
            }
        });

        let mut c = SmtpConnector::new();
        c.configure(&json!({"host": "127.0.0.1", "port": port})).unwrap();
        c.connect(&creds()).await.unwrap();
        assert!(c.ping().await.unwrap());
        c.disconnect().await.unwrap();
        server.await.unwrap();
    }
}
