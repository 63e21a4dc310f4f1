//! Scripted POP3 server for mailbox scanner tests.
//!
//! Serves a fixed set of messages, checks credentials for every supported
//! login mechanism and records the commands it receives. Deletions are only
//! committed when the client ends the session with `QUIT`, as on a real
//! server.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md5::Md5;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

const CHALLENGE: &str = "<1896.697170952@mock.example.com>";

/// POP3 command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3Command {
    User(String),
    Pass,
    Auth(String),
    Stat,
    Top(usize, usize),
    Dele(usize),
    Quit,
    Other(String),
}

#[derive(Clone)]
struct MockServerConfig {
    messages: Vec<Vec<u8>>,
    username: String,
    password: String,
    /// Reply `-ERR` to this command instead of executing it.
    fail_command: Option<String>,
    /// Close the connection instead of answering the Nth command.
    drop_after_commands: Option<usize>,
}

#[derive(Default)]
struct MockState {
    commands: Vec<Pop3Command>,
    /// Message numbers deleted by completed sessions.
    deleted: Vec<usize>,
    sessions: usize,
}

pub struct MockPop3Server {
    addr: SocketAddr,
    state: Arc<Mutex<MockState>>,
}

impl MockPop3Server {
    #[must_use]
    pub fn builder() -> MockPop3ServerBuilder {
        MockPop3ServerBuilder {
            config: MockServerConfig {
                messages: Vec::new(),
                username: "bounces".to_string(),
                password: "secret".to_string(),
                fail_command: None,
                drop_after_commands: None,
            },
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn commands(&self) -> Vec<Pop3Command> {
        self.state.lock().commands.clone()
    }

    /// Messages deleted by sessions that ended with `QUIT`.
    pub fn deleted(&self) -> Vec<usize> {
        self.state.lock().deleted.clone()
    }

    pub fn sessions(&self) -> usize {
        self.state.lock().sessions
    }

    pub fn count(&self, predicate: impl Fn(&Pop3Command) -> bool) -> usize {
        self.state.lock().commands.iter().filter(|c| predicate(c)).count()
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        state: Arc<Mutex<MockState>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        state.lock().sessions += 1;

        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut handled = 0;
        let mut pending_deletes = Vec::new();

        writer.write_all(b"+OK POP3 mock server ready\r\n").await?;

        loop {
            if config.drop_after_commands.is_some_and(|limit| handled >= limit) {
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            handled += 1;

            let cmd_line = line.trim_end().to_string();
            let mut parts = cmd_line.split_whitespace();
            let name = parts.next().unwrap_or_default().to_uppercase();
            let args: Vec<String> = parts.map(str::to_string).collect();

            let command = match name.as_str() {
                "USER" => Pop3Command::User(args.first().cloned().unwrap_or_default()),
                "PASS" => Pop3Command::Pass,
                "AUTH" => Pop3Command::Auth(args.first().cloned().unwrap_or_default()),
                "STAT" => Pop3Command::Stat,
                "TOP" => Pop3Command::Top(
                    args.first().and_then(|a| a.parse().ok()).unwrap_or_default(),
                    args.get(1).and_then(|a| a.parse().ok()).unwrap_or_default(),
                ),
                "DELE" => Pop3Command::Dele(
                    args.first().and_then(|a| a.parse().ok()).unwrap_or_default(),
                ),
                "QUIT" => Pop3Command::Quit,
                _ => Pop3Command::Other(cmd_line.clone()),
            };
            state.lock().commands.push(command.clone());

            if config.fail_command.as_deref() == Some(name.as_str()) {
                writer.write_all(b"-ERR injected failure\r\n").await?;
                continue;
            }

            match command {
                Pop3Command::User(user) => {
                    let reply: &[u8] = if user == config.username {
                        b"+OK\r\n"
                    } else {
                        b"-ERR unknown user\r\n"
                    };
                    writer.write_all(reply).await?;
                }
                Pop3Command::Pass => {
                    let reply: &[u8] = if args.join(" ") == config.password {
                        b"+OK logged in\r\n"
                    } else {
                        b"-ERR invalid password\r\n"
                    };
                    writer.write_all(reply).await?;
                }
                Pop3Command::Auth(mechanism) if mechanism.eq_ignore_ascii_case("LOGIN") => {
                    writer.write_all(b"+ VXNlcm5hbWU6\r\n").await?;
                    let user = read_base64_line(&mut reader).await?;
                    writer.write_all(b"+ UGFzc3dvcmQ6\r\n").await?;
                    let pass = read_base64_line(&mut reader).await?;

                    let reply: &[u8] = if user == config.username && pass == config.password {
                        b"+OK logged in\r\n"
                    } else {
                        b"-ERR authentication failed\r\n"
                    };
                    writer.write_all(reply).await?;
                }
                Pop3Command::Auth(mechanism) if mechanism.eq_ignore_ascii_case("CRAM-MD5") => {
                    writer
                        .write_all(format!("+ {}\r\n", STANDARD.encode(CHALLENGE)).as_bytes())
                        .await?;
                    let response = read_base64_line(&mut reader).await?;

                    let mut mac = Hmac::<Md5>::new_from_slice(config.password.as_bytes())
                        .map_err(|e| e.to_string())?;
                    mac.update(CHALLENGE.as_bytes());
                    let expected = format!(
                        "{} {}",
                        config.username,
                        hex::encode(mac.finalize().into_bytes())
                    );

                    let reply: &[u8] = if response == expected {
                        b"+OK logged in\r\n"
                    } else {
                        b"-ERR authentication failed\r\n"
                    };
                    writer.write_all(reply).await?;
                }
                Pop3Command::Stat => {
                    let size: usize = config.messages.iter().map(Vec::len).sum();
                    writer
                        .write_all(format!("+OK {} {size}\r\n", config.messages.len()).as_bytes())
                        .await?;
                }
                Pop3Command::Top(id, lines) => match config.messages.get(id.wrapping_sub(1)) {
                    Some(message) => {
                        writer.write_all(b"+OK\r\n").await?;
                        writer.write_all(&top(message, lines)).await?;
                        writer.write_all(b".\r\n").await?;
                    }
                    None => writer.write_all(b"-ERR no such message\r\n").await?,
                },
                Pop3Command::Dele(id) => {
                    if id >= 1 && id <= config.messages.len() {
                        pending_deletes.push(id);
                        writer.write_all(b"+OK deleted\r\n").await?;
                    } else {
                        writer.write_all(b"-ERR no such message\r\n").await?;
                    }
                }
                Pop3Command::Quit => {
                    state.lock().deleted.append(&mut pending_deletes);
                    writer.write_all(b"+OK bye\r\n").await?;
                    return Ok(());
                }
                Pop3Command::Auth(_) | Pop3Command::Other(_) => {
                    writer.write_all(b"-ERR unknown command\r\n").await?;
                }
            }
        }
    }
}

async fn read_base64_line<R>(reader: &mut R) -> Result<String, Box<dyn std::error::Error + Send + Sync>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    Ok(String::from_utf8(STANDARD.decode(line.trim())?)?)
}

/// Headers plus the first `lines` body lines, dot-stuffed and CRLF terminated.
fn top(message: &[u8], lines: usize) -> Vec<u8> {
    let text = String::from_utf8_lossy(message);
    let mut out = String::new();
    let mut in_body = false;
    let mut body_lines = 0;

    for line in text.lines() {
        if in_body {
            if body_lines == lines {
                break;
            }
            body_lines += 1;
        } else if line.is_empty() {
            in_body = true;
        }

        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.into_bytes()
}

pub struct MockPop3ServerBuilder {
    config: MockServerConfig,
}

impl MockPop3ServerBuilder {
    #[must_use]
    pub fn with_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.config.messages.push(message.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.config.username = username.to_string();
        self.config.password = password.to_string();
        self
    }

    /// Answer every `command` (e.g. `"DELE"`) with `-ERR`.
    #[must_use]
    pub fn with_failing_command(mut self, command: &str) -> Self {
        self.config.fail_command = Some(command.to_uppercase());
        self
    }

    /// Drop the connection instead of answering the Nth command.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Binds to a random local port and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockPop3Server, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let state = Arc::new(Mutex::new(MockState::default()));

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let config = Arc::clone(&config);
                let state = Arc::clone(&server_state);

                tokio::spawn(async move {
                    if let Err(e) = MockPop3Server::handle_client(stream, config, state).await {
                        tracing::debug!("Mock server client error: {}", e);
                    }
                });
            }
        });

        Ok(MockPop3Server { addr, state })
    }
}
