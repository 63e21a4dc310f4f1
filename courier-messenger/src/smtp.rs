//! SMTP messenger backed by a pool of `lettre` transports.
//!
//! Every configured server gets its own connection pool. Each message goes to
//! a server picked at random, which spreads load across relays without any
//! shared bookkeeping.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{Header, internal, outgoing};
use lettre::{
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
    address::Envelope,
    message::{
        Mailbox, Mailboxes, MultiPart,
        header::{ContentType, HeaderName, HeaderValue},
    },
    transport::smtp::{
        PoolConfig,
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
        extension::ClientId,
    },
};
use rand::Rng;
use serde::Deserialize;

use crate::{Message, Messenger, MessengerError};

const fn default_port() -> u16 {
    25
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_idle_timeout() -> u64 {
    15
}

const fn default_timeout() -> u64 {
    5
}

fn default_name() -> String {
    "email".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProtocol {
    #[default]
    None,
    Plain,
    Login,
    Cram,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsType {
    #[default]
    None,
    Tls,
    StartTls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpServerConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub auth: AuthProtocol,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub tls: TlsType,

    /// Accept invalid certificates from this server (testing only)
    ///
    /// **SECURITY WARNING**: Disables certificate validation for the
    /// connection, making it vulnerable to Man-in-the-Middle attacks.
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Name sent with EHLO, defaults to the local hostname
    #[serde(default)]
    pub hello_hostname: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Connect/read timeout for a single SMTP command
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Headers added to every message sent through this server
    #[serde(default)]
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_name")]
    pub name: String,

    pub servers: Vec<SmtpServerConfig>,
}

struct Server {
    host: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    headers: Vec<Header>,
}

pub struct SmtpMessenger {
    name: String,
    servers: Vec<Server>,
    closed: AtomicBool,
}

impl SmtpMessenger {
    /// Build the pools for every configured server.
    ///
    /// # Errors
    ///
    /// If no server is configured, if a server asks for CRAM-MD5 (not offered
    /// by the SMTP client), or if TLS parameters cannot be built.
    pub fn new(config: &SmtpConfig) -> Result<Self, MessengerError> {
        if config.servers.is_empty() {
            return Err(MessengerError::Configuration(format!(
                "messenger {} has no SMTP servers",
                config.name
            )));
        }

        let servers = config
            .servers
            .iter()
            .map(|server| {
                Ok(Server {
                    host: server.host.clone(),
                    transport: transport(server)?,
                    headers: server.headers.clone(),
                })
            })
            .collect::<Result<Vec<_>, MessengerError>>()?;

        internal!(
            "SMTP messenger {} ready with {} server(s)",
            config.name,
            servers.len()
        );

        Ok(Self {
            name: config.name.clone(),
            servers,
            closed: AtomicBool::new(false),
        })
    }

    fn pick(&self) -> &Server {
        let index = if self.servers.len() == 1 {
            0
        } else {
            rand::rng().random_range(0..self.servers.len())
        };

        &self.servers[index]
    }
}

fn transport(
    config: &SmtpServerConfig,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, MessengerError> {
    let tls_parameters = || {
        TlsParameters::builder(config.host.clone())
            .dangerous_accept_invalid_certs(config.tls_skip_verify)
            .build()
            .map_err(|e| MessengerError::Configuration(format!("{}: {e}", config.host)))
    };

    let tls = match config.tls {
        TlsType::None => Tls::None,
        TlsType::Tls => Tls::Wrapper(tls_parameters()?),
        TlsType::StartTls => Tls::Required(tls_parameters()?),
    };

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        .port(config.port)
        .tls(tls)
        .timeout(Some(Duration::from_secs(config.timeout_secs)))
        .pool_config(
            PoolConfig::new()
                .max_size(config.max_connections)
                .idle_timeout(Duration::from_secs(config.idle_timeout_secs)),
        );

    let mechanism = match config.auth {
        AuthProtocol::None => None,
        AuthProtocol::Plain => Some(Mechanism::Plain),
        AuthProtocol::Login => Some(Mechanism::Login),
        AuthProtocol::Cram => {
            return Err(MessengerError::Configuration(format!(
                "{}: CRAM-MD5 is not supported for SMTP",
                config.host
            )));
        }
    };

    if let Some(mechanism) = mechanism {
        builder = builder
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .authentication(vec![mechanism]);
    }

    if let Some(hello) = &config.hello_hostname {
        builder = builder.hello_name(ClientId::Domain(hello.clone()));
    }

    Ok(builder.build())
}

fn parse_mailbox(value: &str) -> Result<Mailbox, MessengerError> {
    value
        .parse::<Mailbox>()
        .map_err(|e| MessengerError::address(value, e))
}

fn parse_mailboxes(value: &str) -> Result<Mailboxes, MessengerError> {
    value
        .parse::<Mailboxes>()
        .map_err(|e| MessengerError::address(value, e))
}

fn parse_address(value: &str) -> Result<Address, MessengerError> {
    let trimmed = value.trim().trim_start_matches('<').trim_end_matches('>');
    trimmed
        .parse::<Address>()
        .map_err(|e| MessengerError::address(value, e))
}

/// Render `message` into wire bytes plus the SMTP envelope.
///
/// `Return-Path` becomes the envelope sender, `Cc`/`Bcc` recipients join the
/// envelope, every other header is copied verbatim.
pub(crate) fn compose(
    message: &Message,
    extra_headers: &[Header],
) -> Result<(Envelope, Vec<u8>), MessengerError> {
    let from = parse_mailbox(&message.from)?;
    let mut envelope_from = from.email.clone();
    let mut recipients = Vec::with_capacity(message.to.len());

    let mut builder = lettre::Message::builder()
        .from(from)
        .subject(message.subject.clone());

    for to in &message.to {
        let mailbox = parse_mailbox(to)?;
        recipients.push(mailbox.email.clone());
        builder = builder.to(mailbox);
    }

    for header in message.headers.iter().chain(extra_headers) {
        match header.name.to_ascii_lowercase().as_str() {
            "return-path" => envelope_from = parse_address(&header.value)?,
            "cc" => {
                for mailbox in parse_mailboxes(&header.value)? {
                    recipients.push(mailbox.email.clone());
                    builder = builder.cc(mailbox);
                }
            }
            "bcc" => {
                for mailbox in parse_mailboxes(&header.value)? {
                    recipients.push(mailbox.email.clone());
                    builder = builder.bcc(mailbox);
                }
            }
            _ => {
                let name = HeaderName::new_from_ascii(header.name.clone())
                    .map_err(|e| MessengerError::Build(format!("{}: {e}", header.name)))?;
                builder = builder.raw_header(HeaderValue::new(name, header.value.clone()));
            }
        }
    }

    let body = String::from_utf8_lossy(&message.body).into_owned();
    let email = if message.content_type.is_plain() {
        builder.header(ContentType::TEXT_PLAIN).body(body)
    } else if let Some(alt) = &message.alt_body {
        let alt = String::from_utf8_lossy(alt).into_owned();
        builder.multipart(MultiPart::alternative_plain_html(alt, body))
    } else {
        builder.header(ContentType::TEXT_HTML).body(body)
    }
    .map_err(|e| MessengerError::Build(e.to_string()))?;

    let envelope = Envelope::new(Some(envelope_from), recipients)
        .map_err(|e| MessengerError::Build(e.to_string()))?;

    Ok((envelope, email.formatted()))
}

#[async_trait]
impl Messenger for SmtpMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: &Message) -> Result<(), MessengerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessengerError::Closed(self.name.clone()));
        }

        let server = self.pick();
        let (envelope, raw) = compose(message, &server.headers)?;

        outgoing!(
            "Sending to {:?} through {}",
            envelope.to(),
            server.host
        );

        server
            .transport
            .send_raw(&envelope, &raw)
            .await
            .map_err(|e| MessengerError::Transport(e.to_string()))?;

        Ok(())
    }

    async fn flush(&self) -> Result<(), MessengerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MessengerError> {
        self.closed.store(true, Ordering::Release);
        internal!("SMTP messenger {} closed", self.name);
        Ok(())
    }
}
