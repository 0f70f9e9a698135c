//! Minimal STOMP 1.2 frame codec.
//!
//! The backend broker speaks STOMP over WebSocket: every WebSocket text
//! message carries zero or more frames, each terminated by a NUL byte, and
//! bare end-of-line characters between frames are heart-beats.
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) except in `CONNECT` and
//! `CONNECTED` frames, as STOMP 1.2 requires.

use crate::MxError;

/// Frame terminator.
const NUL: char = '\0';

/// STOMP frame commands used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            // STOMP is the 1.1+ alias of CONNECT.
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    /// `CONNECT`/`CONNECTED` headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// One STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Builder-style header append.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builder-style body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name` (repeated headers: first one wins).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    // -----------------------------------------------------------------------
    // Client frames
    // -----------------------------------------------------------------------

    /// `CONNECT` frame, optionally carrying a bearer token.
    pub fn connect(host: &str, heartbeat_ms: u64, token: Option<&str>) -> Self {
        let mut frame = Self::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"));
        if let Some(token) = token {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    // -----------------------------------------------------------------------
    // Codec
    // -----------------------------------------------------------------------

    /// Serialize to wire text (NUL-terminated).
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push(NUL);
        out
    }
}

/// Decode every frame in one WebSocket text message.
///
/// Heart-beat EOLs between frames are skipped; a message consisting only of
/// heart-beats yields an empty vector.
///
/// # Errors
///
/// Returns [`MxError::Protocol`] on an unknown command, a malformed header
/// line, or a missing NUL terminator.
pub fn decode(text: &str) -> Result<Vec<Frame>, MxError> {
    let mut frames = Vec::new();
    let mut rest = text;

    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, tail) = decode_one(rest)?;
        frames.push(frame);
        rest = tail;
    }
}

fn decode_one(text: &str) -> Result<(Frame, &str), MxError> {
    let (command_line, mut rest) = split_line(text)
        .ok_or_else(|| MxError::Protocol("frame ends before command line".to_string()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| MxError::Protocol(format!("unknown command: {command_line:?}")))?;

    let mut headers = Vec::new();
    loop {
        let (line, tail) = split_line(rest)
            .ok_or_else(|| MxError::Protocol("frame ends inside headers".to_string()))?;
        rest = tail;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| MxError::Protocol(format!("malformed header line: {line:?}")))?;
        if command.escapes_headers() {
            headers.push((unescape_header(k)?, unescape_header(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.trim().parse::<usize>().ok());

    let (body, tail) = match content_length {
        Some(len) => {
            let body = rest
                .get(..len)
                .ok_or_else(|| MxError::Protocol("body shorter than content-length".to_string()))?;
            let tail = rest[len..]
                .strip_prefix(NUL)
                .ok_or_else(|| MxError::Protocol("missing NUL after body".to_string()))?;
            (body, tail)
        }
        None => {
            let end = rest
                .find(NUL)
                .ok_or_else(|| MxError::Protocol("missing NUL terminator".to_string()))?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        tail,
    ))
}

/// Split off one line, accepting `\n` or `\r\n`.
fn split_line(text: &str) -> Option<(&str, &str)> {
    let idx = text.find('\n')?;
    let line = text[..idx].strip_suffix('\r').unwrap_or(&text[..idx]);
    Some((line, &text[idx + 1..]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String, MxError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(MxError::Protocol(format!(
                    "invalid header escape: \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
