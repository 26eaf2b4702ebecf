use std::{
    io::{self, ErrorKind},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::{timeout, Instant},
};

use crate::{
    profile::{GameProfile, TransportKind},
    store::ServerDescriptor,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO({0})")]
    Io(#[from] io::Error),
    #[error("Rcon({0})")]
    Rcon(#[from] rcon::Error),
    #[error("Server rejected the RCON password")]
    AuthRejected,
    #[error("No response after {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Whether the connection can't be used any more after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::Closed | Self::AuthRejected => true,
            Self::Rcon(e) => !matches!(e, rcon::Error::CommandTooLong),
        }
    }
}

/// Why a connection could not be opened. `Unreachable` is what an offline
/// game server looks like and isn't worth more than a debug line.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Destination unreachable ({0})")]
    Unreachable(#[source] io::Error),
    #[error(transparent)]
    Other(#[from] ClientError),
}

impl ConnectionError {
    #[must_use]
    pub const fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }

    fn classify(error: ClientError) -> Self {
        match error {
            ClientError::Io(e) if is_unreachable(&e) => Self::Unreachable(e),
            ClientError::Rcon(rcon::Error::Io(e)) if is_unreachable(&e) => Self::Unreachable(e),
            ClientError::Rcon(rcon::Error::Auth) => Self::Other(ClientError::AuthRejected),
            ClientError::Timeout(d) => Self::Unreachable(io::Error::new(
                ErrorKind::TimedOut,
                format!("no answer after {d:?}"),
            )),
            other => Self::Other(other),
        }
    }
}

#[cfg(target_os = "linux")]
const UNREACHABLE_OS_ERRORS: &[i32] = &[101, 113];
#[cfg(target_os = "macos")]
const UNREACHABLE_OS_ERRORS: &[i32] = &[51, 65];
#[cfg(windows)]
const UNREACHABLE_OS_ERRORS: &[i32] = &[10051, 10065];
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const UNREACHABLE_OS_ERRORS: &[i32] = &[];

fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::AddrNotAvailable
    ) || e
        .raw_os_error()
        .is_some_and(|code| UNREACHABLE_OS_ERRORS.contains(&code))
}

/// An open connection to one game server's remote console.
pub enum Transport {
    Source(rcon::Connection<TcpStream>),
    Console(ConsoleTransport),
}

impl Transport {
    /// Opens the transport the profile asks for and authenticates.
    ///
    /// # Errors
    /// `Unreachable` if nothing answered at the address, `Other` for anything
    /// else (bad password, protocol errors, ...)
    pub async fn connect(
        server: &ServerDescriptor,
        profile: &GameProfile,
        connect_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let address = server.socket_address();
        let connecting = async {
            match profile.transport {
                TransportKind::Source { minecraft_quirks } => {
                    let connection = rcon::Connection::<TcpStream>::builder()
                        .enable_minecraft_quirks(minecraft_quirks)
                        .connect(address.as_str(), &server.password)
                        .await?;
                    Ok::<_, ClientError>(Self::Source(connection))
                }
                TransportKind::Console => {
                    let stream = TcpStream::connect(address.as_str()).await?;
                    let console = ConsoleTransport::login(stream, &server.password).await?;
                    Ok(Self::Console(console))
                }
            }
        };

        match timeout(connect_timeout, connecting).await {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(ConnectionError::classify(e)),
            Err(_) => Err(ConnectionError::classify(ClientError::Timeout(connect_timeout))),
        }
    }

    /// Next unsolicited line from the server. Source RCON never sends one so
    /// this waits forever for that transport.
    ///
    /// # Errors
    /// If reading from the socket failed
    pub async fn next_line(&mut self) -> Result<Option<String>, ClientError> {
        match self {
            Self::Source(_) => std::future::pending().await,
            Self::Console(console) => Ok(console.lines.next_line().await?),
        }
    }
}

pub struct ConsoleTransport {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl ConsoleTransport {
    async fn login(stream: TcpStream, password: &str) -> Result<Self, ClientError> {
        let (reader, writer) = stream.into_split();
        let mut console = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };

        if !password.is_empty() {
            console.write_line(password).await?;
        }

        Ok(console)
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ClientError> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    /// Writes a command and gathers whatever the console prints until it has
    /// been quiet for `quiet`, or `deadline` has passed. Lines that
    /// `unsolicited` claims (returns `true` for) are left out of the response.
    /// With `reply_required` the quiet window only starts after the first
    /// response line, and getting none by the deadline is a timeout.
    ///
    /// # Errors
    /// If the console closed, the socket failed or a required reply never came
    pub async fn exchange(
        &mut self,
        command: &str,
        quiet: Duration,
        deadline: Duration,
        reply_required: bool,
        mut unsolicited: impl FnMut(&str) -> bool,
    ) -> Result<String, ClientError> {
        self.write_line(command).await?;

        let started = Instant::now();
        let mut response = Vec::new();
        loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                break;
            }

            let wait = if reply_required && response.is_empty() {
                remaining
            } else {
                quiet.min(remaining)
            };
            match timeout(wait, self.lines.next_line()).await {
                Err(_) => break,
                Ok(Ok(Some(line))) => {
                    if !unsolicited(&line) {
                        response.push(line);
                    }
                }
                Ok(Ok(None)) => return Err(ClientError::Closed),
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        if reply_required && response.is_empty() {
            return Err(ClientError::Timeout(deadline));
        }
        Ok(response.join("\n"))
    }
}
