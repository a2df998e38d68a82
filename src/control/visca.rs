//! VISCA command encoding and reply framing.
//!
//! Messages are short byte sequences terminated by `0xFF`. The camera answers a
//! command with an acknowledgement (`9y 4z FF`) and later a completion
//! (`9y 5z FF`), or with an error (`9y 6z ee FF`). `z` is the socket the camera
//! assigned to the command.

use anyhow::{anyhow, Result};

pub const TERMINATOR: u8 = 0xFF;

/// Longest legal VISCA message, terminator included.
pub const MAX_MESSAGE_LEN: usize = 16;

const CAMERA_ADDRESS: u8 = 0x81;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViscaCommand {
    bytes: Vec<u8>,
    label: String,
}

impl ViscaCommand {
    /// `81 01 04 3F 02 pp FF`
    pub fn recall_preset(number: u16) -> Result<Self> {
        if number == 0 || number > crate::MAX_PRESET_NUMBER {
            return Err(anyhow!(
                "preset number {} outside 1..={}",
                number,
                crate::MAX_PRESET_NUMBER
            ));
        }
        Ok(Self {
            bytes: vec![CAMERA_ADDRESS, 0x01, 0x04, 0x3F, 0x02, number as u8, TERMINATOR],
            label: format!("recall preset {}", number),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViscaErrorCode {
    MessageLength,
    Syntax,
    CommandBufferFull,
    CommandCanceled,
    NoSocket,
    NotExecutable,
    Other(u8),
}

impl ViscaErrorCode {
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => ViscaErrorCode::MessageLength,
            0x02 => ViscaErrorCode::Syntax,
            0x03 => ViscaErrorCode::CommandBufferFull,
            0x04 => ViscaErrorCode::CommandCanceled,
            0x05 => ViscaErrorCode::NoSocket,
            0x41 => ViscaErrorCode::NotExecutable,
            other => ViscaErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for ViscaErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViscaErrorCode::MessageLength => f.write_str("message length error"),
            ViscaErrorCode::Syntax => f.write_str("syntax error"),
            ViscaErrorCode::CommandBufferFull => f.write_str("command buffer full"),
            ViscaErrorCode::CommandCanceled => f.write_str("command canceled"),
            ViscaErrorCode::NoSocket => f.write_str("no socket"),
            ViscaErrorCode::NotExecutable => f.write_str("command not executable"),
            ViscaErrorCode::Other(code) => write!(f, "unknown error {:02X}", code),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViscaReply {
    Ack { socket: u8 },
    Completion { socket: u8 },
    Error { socket: u8, code: ViscaErrorCode },
    Unknown(Vec<u8>),
}

impl ViscaReply {
    /// Parses one terminated message.
    pub fn parse(message: &[u8]) -> Self {
        if message.len() < 3
            || message[0] & 0xF0 != 0x90
            || message.last() != Some(&TERMINATOR)
        {
            return ViscaReply::Unknown(message.to_vec());
        }
        let socket = message[1] & 0x0F;
        match message[1] & 0xF0 {
            0x40 => ViscaReply::Ack { socket },
            0x50 => ViscaReply::Completion { socket },
            0x60 if message.len() >= 4 => ViscaReply::Error {
                socket,
                code: ViscaErrorCode::from_byte(message[2]),
            },
            _ => ViscaReply::Unknown(message.to_vec()),
        }
    }
}

/// Reassembles terminated messages from arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    pending: Vec<u8>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Pops the next complete message, dropping runaway garbage.
    pub fn next_message(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.pending.iter().position(|b| *b == TERMINATOR) {
                Some(end) if end < MAX_MESSAGE_LEN => {
                    return Some(self.pending.drain(..=end).collect());
                }
                Some(end) => {
                    log::warn!("dropping {} bytes of oversized visca message", end + 1);
                    self.pending.drain(..=end);
                }
                None => {
                    if self.pending.len() >= MAX_MESSAGE_LEN {
                        log::warn!(
                            "dropping {} unterminated visca bytes",
                            self.pending.len()
                        );
                        self.pending.clear();
                    }
                    return None;
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recall_preset() {
        let cmd = ViscaCommand::recall_preset(12).unwrap();
        assert_eq!(cmd.as_bytes(), &[0x81, 0x01, 0x04, 0x3F, 0x02, 0x0C, 0xFF]);
        assert_eq!(hex(cmd.as_bytes()), "81 01 04 3F 02 0C FF");
    }

    #[test]
    fn rejects_out_of_range_presets() {
        assert!(ViscaCommand::recall_preset(0).is_err());
        assert!(ViscaCommand::recall_preset(256).is_err());
        assert!(ViscaCommand::recall_preset(255).is_ok());
    }

    #[test]
    fn parses_reply_types() {
        assert_eq!(
            ViscaReply::parse(&[0x90, 0x41, 0xFF]),
            ViscaReply::Ack { socket: 1 }
        );
        assert_eq!(
            ViscaReply::parse(&[0x90, 0x52, 0xFF]),
            ViscaReply::Completion { socket: 2 }
        );
        assert_eq!(
            ViscaReply::parse(&[0x90, 0x60, 0x02, 0xFF]),
            ViscaReply::Error {
                socket: 0,
                code: ViscaErrorCode::Syntax
            }
        );
        assert!(matches!(
            ViscaReply::parse(&[0x10, 0x41, 0xFF]),
            ViscaReply::Unknown(_)
        ));
    }

    #[test]
    fn reassembles_messages_across_reads() {
        let mut buf = ReplyBuffer::new();
        buf.extend(&[0x90, 0x41]);
        assert_eq!(buf.next_message(), None);
        buf.extend(&[0xFF, 0x90, 0x51, 0xFF, 0x90]);
        assert_eq!(buf.next_message(), Some(vec![0x90, 0x41, 0xFF]));
        assert_eq!(buf.next_message(), Some(vec![0x90, 0x51, 0xFF]));
        assert_eq!(buf.next_message(), None);
        assert!(!buf.is_empty());
    }

    #[test]
    fn drops_runaway_garbage() {
        let mut buf = ReplyBuffer::new();
        buf.extend(&[0x00; 20]);
        assert_eq!(buf.next_message(), None);
        assert!(buf.is_empty());

        let mut long = vec![0x01; 18];
        long.push(0xFF);
        long.extend_from_slice(&[0x90, 0x41, 0xFF]);
        buf.extend(&long);
        assert_eq!(buf.next_message(), Some(vec![0x90, 0x41, 0xFF]));
    }

    #[test]
    fn error_codes_render() {
        assert_eq!(
            ViscaErrorCode::from_byte(0x41).to_string(),
            "command not executable"
        );
        assert_eq!(ViscaErrorCode::from_byte(0x7A).to_string(), "unknown error 7A");
    }
}
