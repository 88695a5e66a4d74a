//! STOMP 1.2 framing, as spoken over the broker's WebSocket endpoint.

use std::{fmt, str::FromStr};

use crate::Error;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Command {
    // client frames
    Connect,
    Stomp,
    Subscribe,
    Unsubscribe,
    Send,
    Disconnect,

    // server frames
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    // CONNECT and CONNECTED headers are never escaped, so that 1.0 peers can read them
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Command, Error> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "SEND" => Command::Send,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return Err(Error::MalformedFrame(format!("unknown command {s:?}"))),
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: Command,

    /// Headers in wire order. Repeated headers are kept, the first one is the one that counts.
    pub headers: Vec<(String, String)>,

    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command) -> Frame {
        Frame {
            command,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Frame {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Frame {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// `heartbeat` is (what we promise to send, what we want to receive), in milliseconds
    pub fn connect(host: &str, heartbeat: (u64, u64), login: Option<(&str, &str)>) -> Frame {
        let mut f = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1));
        if let Some((login, passcode)) = login {
            f = f
                .with_header("login", login)
                .with_header("passcode", passcode);
        }
        f
    }

    pub fn connected(heartbeat: (u64, u64)) -> Frame {
        Frame::new(Command::Connected)
            .with_header("version", "1.2")
            .with_header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn subscribe(id: &str, destination: &str, receipt: &str) -> Frame {
        Frame::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
            .with_header("receipt", receipt)
    }

    pub fn unsubscribe(id: &str) -> Frame {
        Frame::new(Command::Unsubscribe).with_header("id", id)
    }

    pub fn send(destination: &str, json: Vec<u8>) -> Frame {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_header("content-length", json.len().to_string())
            .with_body(json)
    }

    pub fn disconnect() -> Frame {
        Frame::new(Command::Disconnect)
    }

    pub fn message(subscription: &str, destination: &str, message_id: &str, json: Vec<u8>) -> Frame {
        Frame::new(Command::Message)
            .with_header("subscription", subscription)
            .with_header("destination", destination)
            .with_header("message-id", message_id)
            .with_header("content-type", "application/json")
            .with_header("content-length", json.len().to_string())
            .with_body(json)
    }

    pub fn receipt(receipt_id: &str) -> Frame {
        Frame::new(Command::Receipt).with_header("receipt-id", receipt_id)
    }

    pub fn error(message: &str, receipt_id: Option<&str>) -> Frame {
        let f = Frame::new(Command::Error).with_header("message", message);
        match receipt_id {
            Some(r) => f.with_header("receipt-id", r),
            None => f,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let escape = self.command.escapes_headers();
        let mut res = Vec::with_capacity(64 + self.body.len());
        res.extend_from_slice(self.command.as_str().as_bytes());
        res.push(b'\n');
        for (name, value) in &self.headers {
            match escape {
                true => {
                    res.extend_from_slice(escape_header(name).as_bytes());
                    res.push(b':');
                    res.extend_from_slice(escape_header(value).as_bytes());
                }
                false => {
                    res.extend_from_slice(name.as_bytes());
                    res.push(b':');
                    res.extend_from_slice(value.as_bytes());
                }
            }
            res.push(b'\n');
        }
        res.push(b'\n');
        res.extend_from_slice(&self.body);
        res.push(0);
        res
    }

    fn decode(data: &[u8]) -> Result<Frame, Error> {
        let (command_line, mut rest) = split_line(data)
            .ok_or_else(|| Error::MalformedFrame(String::from("missing command line")))?;
        let command: Command = utf8(command_line)?.parse()?;
        let mut headers = Vec::new();
        loop {
            let (line, r) = split_line(rest)
                .ok_or_else(|| Error::MalformedFrame(String::from("unterminated headers")))?;
            rest = r;
            if line.is_empty() {
                break;
            }
            let (name, value) = utf8(line)?
                .split_once(':')
                .ok_or_else(|| Error::MalformedFrame(String::from("header without colon")))?;
            headers.push(match command.escapes_headers() {
                true => (unescape_header(name)?, unescape_header(value)?),
                false => (String::from(name), String::from(value)),
            });
        }
        let content_length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| v.as_str());
        let body = match content_length {
            Some(len) => {
                let len: usize = len.parse().map_err(|_| {
                    Error::MalformedFrame(format!("invalid content-length {len:?}"))
                })?;
                rest.get(..len)
                    .ok_or_else(|| {
                        Error::MalformedFrame(String::from("body shorter than content-length"))
                    })?
                    .to_vec()
            }
            None => match rest.iter().position(|b| *b == 0) {
                Some(end) => rest[..end].to_vec(),
                None => rest.to_vec(),
            },
        };
        Ok(Frame {
            command,
            headers,
            body,
        })
    }
}

/// What travels on the link: either a frame, or a bare end-of-line heart-beat
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Packet {
    Heartbeat,
    Frame(Frame),
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Heartbeat => vec![b'\n'],
            Packet::Frame(f) => f.encode(),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Packet, Error> {
        match data.iter().position(|b| *b != b'\n' && *b != b'\r') {
            None => Ok(Packet::Heartbeat),
            Some(start) => Frame::decode(&data[start..]).map(Packet::Frame),
        }
    }
}

impl From<Frame> for Packet {
    fn from(f: Frame) -> Packet {
        Packet::Frame(f)
    }
}

/// Splits off one line, without its `\n` nor an optional trailing `\r`
fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = data.iter().position(|b| *b == b'\n')?;
    let line = &data[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some((line, &data[end + 1..]))
}

fn utf8(data: &[u8]) -> Result<&str, Error> {
    std::str::from_utf8(data).map_err(|_| Error::MalformedFrame(String::from("non-utf8 header")))
}

fn escape_header(s: &str) -> String {
    let mut res = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => res.push_str("\\\\"),
            '\n' => res.push_str("\\n"),
            '\r' => res.push_str("\\r"),
            ':' => res.push_str("\\c"),
            c => res.push(c),
        }
    }
    res
}

fn unescape_header(s: &str) -> Result<String, Error> {
    let mut res = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            res.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => res.push('\\'),
            Some('n') => res.push('\n'),
            Some('r') => res.push('\r'),
            Some('c') => res.push(':'),
            other => {
                return Err(Error::MalformedFrame(format!(
                    "invalid header escape sequence \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(res)
}
