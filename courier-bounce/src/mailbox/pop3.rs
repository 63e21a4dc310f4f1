//! Minimal POP3 client (RFC 1939) with implicit TLS and the `USER`/`PASS`,
//! `AUTH LOGIN` and `AUTH CRAM-MD5` login mechanisms.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing, tracing};
use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};

use crate::error::MailboxError;

/// Initial size of the read buffer.
const BUFFER_SIZE: usize = 8192;

/// Largest single reply line accepted before the server is considered broken.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    async fn send(&mut self, data: &[u8]) -> Result<(), MailboxError> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MailboxError> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(MailboxError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, skip_verify: bool) -> Result<Self, MailboxError> {
        let Self::Plain(stream) = self else {
            return Err(MailboxError::Tls("connection is already TLS".to_string()));
        };

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            roots
                .add(cert)
                .map_err(|e| MailboxError::Tls(format!("failed to add certificate: {e}")))?;
        }
        if !native.errors.is_empty() {
            tracing::warn!(?native.errors, "Some certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        if skip_verify {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| MailboxError::Tls(format!("invalid domain: {e}")))?;
        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, stream)
            .await
            .map_err(|e| MailboxError::Tls(e.to_string()))?;

        Ok(Self::Tls(Box::new(stream)))
    }
}

/// Accepts any server certificate. Only installed with `tls_skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

/// First line of a server reply.
#[derive(Debug, PartialEq, Eq)]
enum Reply {
    /// `+OK` and its text.
    Ok(String),
    /// `+ ` SASL continuation and its base64 challenge.
    Continue(String),
}

fn parse_reply(command: &str, line: &str) -> Result<Reply, MailboxError> {
    if let Some(text) = line.strip_prefix("+OK") {
        Ok(Reply::Ok(text.trim().to_string()))
    } else if let Some(text) = line.strip_prefix("-ERR") {
        Err(MailboxError::Server {
            command: command.to_string(),
            message: text.trim().to_string(),
        })
    } else if let Some(text) = line.strip_prefix('+') {
        Ok(Reply::Continue(text.trim().to_string()))
    } else {
        Err(MailboxError::Protocol(format!(
            "unexpected reply to {command}: {line}"
        )))
    }
}

pub struct Pop3Client {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    timeout: Duration,
}

impl Pop3Client {
    /// Connects, optionally wraps the stream in TLS, and reads the greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, the TLS handshake or the greeting
    /// fails.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        skip_verify: bool,
        timeout: Duration,
    ) -> Result<Self, MailboxError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| MailboxError::Timeout)??;

        let mut connection = Connection::Plain(stream);
        if tls {
            connection = tokio::time::timeout(timeout, connection.upgrade_to_tls(host, skip_verify))
                .await
                .map_err(|_| MailboxError::Timeout)??;
        }

        let mut client = Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            timeout,
        };
        client.expect_ok("greeting").await?;

        Ok(client)
    }

    /// `USER` followed by `PASS`.
    pub async fn login_plain(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.command(&format!("USER {username}"), "USER").await?;
        self.command(&format!("PASS {password}"), "PASS")
            .await
            .map_err(auth_error)?;
        Ok(())
    }

    /// `AUTH LOGIN`: username and password sent base64 encoded in reply to
    /// two continuations.
    pub async fn login_sasl(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.send("AUTH LOGIN", "AUTH LOGIN").await?;
        self.expect_continue("AUTH LOGIN").await?;

        self.send(&STANDARD.encode(username), "AUTH LOGIN username").await?;
        self.expect_continue("AUTH LOGIN").await?;

        self.send(&STANDARD.encode(password), "AUTH LOGIN password").await?;
        self.expect_ok("AUTH LOGIN").await.map_err(auth_error)?;

        Ok(())
    }

    /// `AUTH CRAM-MD5` (RFC 2195).
    pub async fn login_cram(&mut self, username: &str, password: &str) -> Result<(), MailboxError> {
        self.send("AUTH CRAM-MD5", "AUTH CRAM-MD5").await?;
        let challenge = STANDARD
            .decode(self.expect_continue("AUTH CRAM-MD5").await?)
            .map_err(|e| MailboxError::Protocol(format!("invalid CRAM-MD5 challenge: {e}")))?;

        let response = cram_response(username, password, &challenge)?;
        self.send(&response, "AUTH CRAM-MD5 response").await?;
        self.expect_ok("AUTH CRAM-MD5").await.map_err(auth_error)?;

        Ok(())
    }

    /// Number of messages and total size in octets.
    pub async fn stat(&mut self) -> Result<(usize, u64), MailboxError> {
        let text = self.command("STAT", "STAT").await?;
        let mut fields = text.split_whitespace();

        let count = fields.next().and_then(|n| n.parse().ok());
        let size = fields.next().and_then(|n| n.parse().ok());
        match (count, size) {
            (Some(count), Some(size)) => Ok((count, size)),
            _ => Err(MailboxError::Protocol(format!("malformed STAT reply: {text}"))),
        }
    }

    /// Headers and the first `lines` body lines of message `id`.
    pub async fn top(&mut self, id: usize, lines: usize) -> Result<Vec<u8>, MailboxError> {
        self.command(&format!("TOP {id} {lines}"), "TOP").await?;
        self.read_multiline().await
    }

    pub async fn dele(&mut self, id: usize) -> Result<(), MailboxError> {
        self.command(&format!("DELE {id}"), "DELE").await.map(|_| ())
    }

    /// Ends the session. Deletions only take effect once this succeeds.
    pub async fn quit(&mut self) -> Result<(), MailboxError> {
        self.command("QUIT", "QUIT").await?;
        self.connection = None;
        Ok(())
    }

    /// Sends `line`, logging only `name` so credentials never reach the logs.
    async fn send(&mut self, line: &str, name: &str) -> Result<(), MailboxError> {
        outgoing!("POP3 {name}");

        let data = format!("{line}\r\n");
        self.connection
            .as_mut()
            .ok_or(MailboxError::ConnectionClosed)?
            .send(data.as_bytes())
            .await
    }

    async fn command(&mut self, line: &str, name: &str) -> Result<String, MailboxError> {
        self.send(line, name).await?;
        self.expect_ok(name).await
    }

    async fn expect_ok(&mut self, command: &str) -> Result<String, MailboxError> {
        let line = self.read_text_line().await?;
        match parse_reply(command, &line)? {
            Reply::Ok(text) => Ok(text),
            Reply::Continue(_) => Err(MailboxError::Protocol(format!(
                "unexpected continuation after {command}"
            ))),
        }
    }

    async fn expect_continue(&mut self, command: &str) -> Result<String, MailboxError> {
        let line = self.read_text_line().await?;
        match parse_reply(command, &line).map_err(auth_error)? {
            Reply::Continue(challenge) => Ok(challenge),
            Reply::Ok(_) => Err(MailboxError::Protocol(format!(
                "expected a continuation after {command}"
            ))),
        }
    }

    async fn read_text_line(&mut self) -> Result<String, MailboxError> {
        let line = self.read_line().await?;
        let line = String::from_utf8_lossy(&line).into_owned();
        incoming!("POP3 {line}");
        Ok(line)
    }

    /// Reads a dot-terminated multi-line body, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, MailboxError> {
        let mut body = Vec::new();

        loop {
            let line = self.read_line().await?;
            if line == b"." {
                break;
            }

            let line = line.strip_prefix(b".").unwrap_or(&line);
            body.extend_from_slice(line);
            body.extend_from_slice(b"\r\n");
        }

        Ok(body)
    }

    /// Reads one line without its terminator.
    async fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        loop {
            if let Some(end) = self.buffer[..self.buffer_pos]
                .iter()
                .position(|&b| b == b'\n')
            {
                let mut line = self.buffer[..end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                self.buffer.copy_within(end + 1..self.buffer_pos, 0);
                self.buffer_pos -= end + 1;

                return Ok(line);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(MailboxError::Protocol(format!(
                        "line too long (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(MailboxError::ConnectionClosed)?;
            let n = tokio::time::timeout(
                self.timeout,
                connection.read(&mut self.buffer[self.buffer_pos..]),
            )
            .await
            .map_err(|_| MailboxError::Timeout)??;
            self.buffer_pos += n;
        }
    }
}

fn auth_error(error: MailboxError) -> MailboxError {
    match error {
        MailboxError::Server { message, .. } => MailboxError::Auth(message),
        other => other,
    }
}

/// `base64("<username> <hex hmac-md5(password, challenge)>")`
fn cram_response(username: &str, password: &str, challenge: &[u8]) -> Result<String, MailboxError> {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|e| MailboxError::Auth(e.to_string()))?;
    mac.update(challenge);
    let digest = hex::encode(mac.finalize().into_bytes());

    Ok(STANDARD.encode(format!("{username} {digest}")))
}
