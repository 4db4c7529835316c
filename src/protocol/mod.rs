//! Wire protocol: command parsing/encoding and the framing constants.
//!
//! One TCP stream carries three payload kinds: free UTF-8 text (shell
//! commands and replies), separator-delimited control directives, and
//! magic-prefixed length-prefixed binary frames. Text forms live here;
//! the binary frame codec lives in [`wire`].

pub mod wire;

use thiserror::Error;

/// Multi-character separator for control directive arguments.
/// Chosen to be unlikely in argument content; there is no escaping,
/// so a message containing this token truncates at the first occurrence.
pub const CONTROL_SEPARATOR: &str = "|||__SEP__|||";

/// Prefix of a file-transfer header. The header uses a single `|` as its
/// field separator, distinct from the control separator.
pub const FILE_HEADER_PREFIX: &str = "__SEND_FILE__";

/// Magic prefix identifying a binary screen frame on the stream.
pub const FRAME_MAGIC: [u8; 4] = *b"IMGB";

/// Upper bound on a single frame payload.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed monitor directive: {0}")]
    BadMonitorDirective(String),
    #[error("malformed file header: {0}")]
    BadFileHeader(String),
}

/// Requested streaming parameters, exactly as sent by the controller.
/// The agent clamps these into a [`crate::session::StreamParams`] before use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u32,
    pub delay: f64,
}

/// One unit sent controller → agent, decoded once into a closed enum.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Anything that is not a recognized directive runs as a shell command.
    Shell(String),
    LockInput,
    UnlockInput,
    DisableNet,
    EnableNet,
    Exit,
    Popup(String),
    StartMonitor(MonitorRequest),
    StopMonitor,
    /// Header only; `size` raw bytes follow on the same stream.
    FileTransfer { name: String, size: u64 },
}

impl Command {
    /// Decode one received text unit. Unknown content falls through to
    /// `Shell`; only structurally broken directives are errors.
    pub fn parse(data: &str) -> Result<Command, ProtocolError> {
        match data {
            "__LOCK_INPUT__" => return Ok(Command::LockInput),
            "__UNLOCK_INPUT__" => return Ok(Command::UnlockInput),
            "__disable_INTERNET__" => return Ok(Command::DisableNet),
            "__enable_INTERNET__" => return Ok(Command::EnableNet),
            "__EXIT__" => return Ok(Command::Exit),
            "__STOP_MONITOR__" => return Ok(Command::StopMonitor),
            _ => {}
        }

        if let Some(rest) = data.strip_prefix("__START_MONITOR__") {
            if let Some(rest) = rest.strip_prefix(CONTROL_SEPARATOR) {
                let parts: Vec<&str> = rest.split(CONTROL_SEPARATOR).collect();
                if parts.len() != 5 {
                    return Err(ProtocolError::BadMonitorDirective(format!(
                        "expected 5 arguments, got {}",
                        parts.len()
                    )));
                }
                let parse_int = |s: &str| {
                    s.parse::<u32>()
                        .map_err(|e| ProtocolError::BadMonitorDirective(format!("{s:?}: {e}")))
                };
                let delay = parts[4].parse::<f64>().map_err(|e| {
                    ProtocolError::BadMonitorDirective(format!("{:?}: {e}", parts[4]))
                })?;
                return Ok(Command::StartMonitor(MonitorRequest {
                    width: parse_int(parts[0])?,
                    height: parse_int(parts[1])?,
                    fps: parse_int(parts[2])?,
                    quality: parse_int(parts[3])?,
                    delay,
                }));
            }
        }

        if let Some(rest) = data.strip_prefix("__POPUP_MESSAGE__") {
            if let Some(msg) = rest.strip_prefix(CONTROL_SEPARATOR) {
                // Everything after the first separator is the message body.
                return Ok(Command::Popup(msg.to_string()));
            }
        }

        if data.starts_with(FILE_HEADER_PREFIX) {
            let parts: Vec<&str> = data.split('|').collect();
            if parts.len() != 3 {
                return Err(ProtocolError::BadFileHeader(format!(
                    "expected 3 fields, got {}",
                    parts.len()
                )));
            }
            let size = parts[2]
                .parse::<u64>()
                .map_err(|e| ProtocolError::BadFileHeader(format!("size {:?}: {e}", parts[2])))?;
            return Ok(Command::FileTransfer {
                name: parts[1].to_string(),
                size,
            });
        }

        Ok(Command::Shell(data.to_string()))
    }

    /// Encode back to the text wire form.
    pub fn encode(&self) -> String {
        match self {
            Command::Shell(cmd) => cmd.clone(),
            Command::LockInput => "__LOCK_INPUT__".into(),
            Command::UnlockInput => "__UNLOCK_INPUT__".into(),
            Command::DisableNet => "__disable_INTERNET__".into(),
            Command::EnableNet => "__enable_INTERNET__".into(),
            Command::Exit => "__EXIT__".into(),
            Command::StopMonitor => "__STOP_MONITOR__".into(),
            Command::Popup(msg) => format!("__POPUP_MESSAGE__{CONTROL_SEPARATOR}{msg}"),
            Command::StartMonitor(req) => format!(
                "__START_MONITOR__{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
                req.width,
                req.height,
                req.fps,
                req.quality,
                req.delay,
                sep = CONTROL_SEPARATOR
            ),
            Command::FileTransfer { name, size } => {
                format!("{FILE_HEADER_PREFIX}|{name}|{size}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_monitor_round_trip() {
        let req = MonitorRequest {
            width: 1280,
            height: 720,
            fps: 10,
            quality: 50,
            delay: 0.5,
        };
        let encoded = Command::StartMonitor(req).encode();
        match Command::parse(&encoded).unwrap() {
            Command::StartMonitor(parsed) => assert_eq!(parsed, req),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_exact_directives() {
        assert_eq!(Command::parse("__LOCK_INPUT__").unwrap(), Command::LockInput);
        assert_eq!(Command::parse("__UNLOCK_INPUT__").unwrap(), Command::UnlockInput);
        assert_eq!(Command::parse("__disable_INTERNET__").unwrap(), Command::DisableNet);
        assert_eq!(Command::parse("__enable_INTERNET__").unwrap(), Command::EnableNet);
        assert_eq!(Command::parse("__EXIT__").unwrap(), Command::Exit);
        assert_eq!(Command::parse("__STOP_MONITOR__").unwrap(), Command::StopMonitor);
    }

    #[test]
    fn test_directives_are_case_sensitive() {
        // Near-miss tags run as shell commands, they are not errors.
        assert_eq!(
            Command::parse("__lock_input__").unwrap(),
            Command::Shell("__lock_input__".into())
        );
        assert_eq!(
            Command::parse("__STOP_MONITOR__ ").unwrap(),
            Command::Shell("__STOP_MONITOR__ ".into())
        );
    }

    #[test]
    fn test_popup_keeps_separator_in_body() {
        let encoded = format!("__POPUP_MESSAGE__{CONTROL_SEPARATOR}hello{CONTROL_SEPARATOR}world");
        match Command::parse(&encoded).unwrap() {
            Command::Popup(msg) => {
                assert_eq!(msg, format!("hello{CONTROL_SEPARATOR}world"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_file_header() {
        match Command::parse("__SEND_FILE__|report.pdf|4096").unwrap() {
            Command::FileTransfer { name, size } => {
                assert_eq!(name, "report.pdf");
                assert_eq!(size, 4096);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(Command::parse("__SEND_FILE__|missing-size").is_err());
        assert!(Command::parse("__SEND_FILE__|a|b|c").is_err());
    }

    #[test]
    fn test_monitor_argument_errors() {
        let bad = format!("__START_MONITOR__{CONTROL_SEPARATOR}1280{CONTROL_SEPARATOR}720");
        assert!(Command::parse(&bad).is_err());
        let bad = format!(
            "__START_MONITOR__{sep}w{sep}720{sep}10{sep}50{sep}0.5",
            sep = CONTROL_SEPARATOR
        );
        assert!(Command::parse(&bad).is_err());
    }

    #[test]
    fn test_plain_text_is_shell() {
        assert_eq!(
            Command::parse("ls -la /tmp").unwrap(),
            Command::Shell("ls -la /tmp".into())
        );
    }
}
