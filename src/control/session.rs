//! Persistent VISCA control session.
//!
//! The session owns one TCP connection to the camera and allows exactly one
//! command in flight. State moves
//! `Disconnected -> Connecting -> Ready -> (Sending -> AwaitingAck -> Ready)*`
//! and falls back to `Disconnected` on any socket failure.
//!
//! A timed-out command leaves the session `Ready`: the connection is still
//! trusted and the caller may retry on it.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use super::visca::{hex, ReplyBuffer, ViscaCommand, ViscaReply};
use crate::{ErrorKind, HeadcountError};

const READ_CHUNK: usize = 64;

/// Connection settings for the control channel.
#[derive(Clone, Debug)]
pub struct ControlConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Wait for the first reply (ack or completion) to a command.
    pub command_timeout: Duration,
    /// Wait for the completion after an ack.
    pub completion_timeout: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.100".to_string(),
            port: 5678,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(15),
            completion_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Sending,
    AwaitingAck,
}

/// How far the camera confirmed a recall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecallOutcome {
    /// Completion notice received.
    Completed,
    /// Acknowledged; completion did not arrive within the completion timeout.
    Acknowledged,
}

pub struct ControlSession {
    config: ControlConfig,
    stream: Option<TcpStream>,
    state: SessionState,
    replies: ReplyBuffer,
    /// Socket of an acknowledged command whose completion is still outstanding.
    outstanding: Option<u8>,
}

impl ControlSession {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            stream: None,
            state: SessionState::Disconnected,
            replies: ReplyBuffer::new(),
            outstanding: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state != SessionState::Disconnected && self.stream.is_some()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Opens the control connection. Any previous connection is dropped first.
    pub fn connect(&mut self) -> Result<(), HeadcountError> {
        self.disconnect();
        self.state = SessionState::Connecting;
        match self.open_stream() {
            Ok(stream) => {
                log::info!("control session connected to {}", self.endpoint());
                self.stream = Some(stream);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(HeadcountError::new(
                    ErrorKind::ConnectionFailed,
                    format!("connect to {}: {}", self.endpoint(), e),
                ))
            }
        }
    }

    fn open_stream(&self) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()?
            .collect();
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("control session to {} closed", self.endpoint());
        }
        self.replies.clear();
        self.outstanding = None;
        self.state = SessionState::Disconnected;
    }

    /// Moves the camera to a stored preset.
    ///
    /// The acknowledgement only says the command was accepted; the caller still
    /// has to let the camera settle before trusting the view.
    pub fn recall_preset(&mut self, number: u16) -> Result<RecallOutcome, HeadcountError> {
        let command = ViscaCommand::recall_preset(number)
            .map_err(|e| HeadcountError::new(ErrorKind::ProtocolRejected, e.to_string()))?;
        self.execute(&command)
    }

    fn execute(&mut self, command: &ViscaCommand) -> Result<RecallOutcome, HeadcountError> {
        if self.state != SessionState::Ready || self.stream.is_none() {
            return Err(HeadcountError::new(
                ErrorKind::ConnectionLost,
                format!("control session not ready ({:?})", self.state),
            ));
        }
        self.discard_stale()?;

        self.state = SessionState::Sending;
        log::debug!("visca -> {} ({})", hex(command.as_bytes()), command.label());
        let written = match self.stream.as_mut() {
            Some(stream) => stream
                .write_all(command.as_bytes())
                .and_then(|_| stream.flush()),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no stream")),
        };
        if let Err(e) = written {
            return Err(self.lose(command, e));
        }

        self.state = SessionState::AwaitingAck;
        let deadline = Instant::now() + self.config.command_timeout;
        loop {
            let reply = match self.read_reply(deadline) {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    self.state = SessionState::Ready;
                    return Err(HeadcountError::new(
                        ErrorKind::ProtocolTimeout,
                        format!(
                            "no reply to {} within {:?}",
                            command.label(),
                            self.config.command_timeout
                        ),
                    ));
                }
                Err(e) => return Err(self.lose(command, e)),
            };
            match reply {
                ViscaReply::Ack { socket } => return self.await_completion(command, socket),
                ViscaReply::Completion { socket } if self.outstanding == Some(socket) => {
                    log::debug!("ignoring late completion for socket {}", socket);
                    self.outstanding = None;
                }
                ViscaReply::Completion { .. } => {
                    self.state = SessionState::Ready;
                    return Ok(RecallOutcome::Completed);
                }
                ViscaReply::Error { code, .. } => {
                    self.state = SessionState::Ready;
                    return Err(HeadcountError::new(
                        ErrorKind::ProtocolRejected,
                        format!("{} rejected: {}", command.label(), code),
                    ));
                }
                ViscaReply::Unknown(bytes) => {
                    log::debug!("ignoring unexpected visca message {}", hex(&bytes));
                }
            }
        }
    }

    fn await_completion(
        &mut self,
        command: &ViscaCommand,
        socket: u8,
    ) -> Result<RecallOutcome, HeadcountError> {
        log::debug!("{} acknowledged on socket {}", command.label(), socket);
        let deadline = Instant::now() + self.config.completion_timeout;
        loop {
            match self.read_reply(deadline) {
                Ok(Some(ViscaReply::Completion { socket: done })) if done == socket => {
                    self.state = SessionState::Ready;
                    return Ok(RecallOutcome::Completed);
                }
                Ok(Some(ViscaReply::Error { socket: failed, code })) if failed == socket => {
                    self.state = SessionState::Ready;
                    return Err(HeadcountError::new(
                        ErrorKind::ProtocolRejected,
                        format!("{} failed after ack: {}", command.label(), code),
                    ));
                }
                Ok(Some(other)) => {
                    log::debug!("ignoring {:?} while awaiting completion", other);
                }
                Ok(None) => {
                    log::warn!(
                        "{} acknowledged but no completion within {:?}",
                        command.label(),
                        self.config.completion_timeout
                    );
                    self.outstanding = Some(socket);
                    self.state = SessionState::Ready;
                    return Ok(RecallOutcome::Acknowledged);
                }
                Err(e) => return Err(self.lose(command, e)),
            }
        }
    }

    /// Reads until one message is available. `Ok(None)` when the deadline passes.
    fn read_reply(&mut self, deadline: Instant) -> io::Result<Option<ViscaReply>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.replies.next_message() {
                log::debug!("visca <- {}", hex(&message));
                return Ok(Some(ViscaReply::parse(&message)));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no stream"))?;
            stream.set_read_timeout(Some(deadline - now))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "camera closed the control connection",
                    ))
                }
                Ok(n) => self.replies.extend(&chunk[..n]),
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops notifications that arrived between commands.
    fn discard_stale(&mut self) -> Result<(), HeadcountError> {
        let mut chunk = [0u8; READ_CHUNK];
        let drained = match self.stream.as_mut() {
            Some(stream) => drain_nonblocking(stream, &mut chunk, &mut self.replies),
            None => Ok(()),
        };
        if let Err(e) = drained {
            self.disconnect();
            return Err(HeadcountError::new(
                ErrorKind::ConnectionLost,
                format!("control connection to {} lost: {}", self.endpoint(), e),
            ));
        }
        while let Some(message) = self.replies.next_message() {
            match ViscaReply::parse(&message) {
                ViscaReply::Completion { socket } if self.outstanding == Some(socket) => {
                    log::debug!("late completion for socket {} arrived", socket);
                    self.outstanding = None;
                }
                _ => log::debug!("discarding stale visca message {}", hex(&message)),
            }
        }
        Ok(())
    }

    fn lose(&mut self, command: &ViscaCommand, err: io::Error) -> HeadcountError {
        log::warn!("control connection lost during {}: {}", command.label(), err);
        self.disconnect();
        HeadcountError::new(
            ErrorKind::ConnectionLost,
            format!("{} on {}: {}", command.label(), self.endpoint(), err),
        )
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn drain_nonblocking(
    stream: &mut TcpStream,
    chunk: &mut [u8],
    replies: &mut ReplyBuffer,
) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let result = loop {
        match stream.read(chunk) {
            Ok(0) => {
                break Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "camera closed the control connection",
                ))
            }
            Ok(n) => replies.extend(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    stream.set_nonblocking(false)?;
    result
}
