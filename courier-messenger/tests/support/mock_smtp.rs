//! Mock SMTP server for messenger tests
//!
//! Answers just enough of the protocol for a client to deliver a message and
//! records every command it sees. RCPT and end-of-data replies can be
//! overridden to inject failures.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content (after DATA)
    MessageContent(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Debug, Clone)]
struct Config {
    rcpt_to: Reply,
    data_end: Reply,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rcpt_to: Reply::new(250, "OK"),
            data_end: Reply::new(250, "OK: Message accepted"),
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<SmtpCommand>>>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: Config::default(),
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.read().await.clone()
    }

    /// Bodies received so far, one entry per completed DATA.
    pub async fn messages(&self) -> Vec<String> {
        self.commands
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<Config>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"220 Mock SMTP Server\r\n").await?;
        writer.flush().await?;

        loop {
            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }

            let cmd_line = line.trim().to_string();
            let (verb, argument) = cmd_line
                .split_once(' ')
                .map_or((cmd_line.as_str(), ""), |(v, a)| (v, a));

            let (reply, command) = match verb.to_uppercase().as_str() {
                "EHLO" => (
                    b"250-localhost\r\n250 SIZE 10000\r\n".to_vec(),
                    SmtpCommand::Ehlo(argument.to_string()),
                ),
                "MAIL" => (
                    Reply::new(250, "OK").to_bytes(),
                    SmtpCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_to.to_bytes(),
                    SmtpCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (
                    Reply::new(354, "End data with <CR><LF>.<CR><LF>").to_bytes(),
                    SmtpCommand::Data,
                ),
                "NOOP" | "RSET" => (
                    Reply::new(250, "OK").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.clone()),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&reply).await?;
            writer.flush().await?;

            if is_data {
                let mut content = String::new();
                let mut data_line = String::new();
                loop {
                    data_line.clear();
                    if reader.read_line(&mut data_line).await? == 0 {
                        return Ok(());
                    }
                    if data_line.trim_end() == "." {
                        break;
                    }
                    content.push_str(&data_line);
                }

                commands
                    .write()
                    .await
                    .push(SmtpCommand::MessageContent(content));
                writer.write_all(&config.data_end.to_bytes()).await?;
                writer.flush().await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    config: Config,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end = Reply::new(code, message);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));

        let server_commands = Arc::clone(&commands);
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                let config = Arc::clone(&config);
                let commands = Arc::clone(&server_commands);
                tokio::spawn(async move {
                    let _ = MockSmtpServer::handle_client(stream, config, commands).await;
                });
            }
        });

        Ok(MockSmtpServer { addr, commands })
    }
}
