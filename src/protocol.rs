//! # Wire Protocol
//!
//! Messages are ASCII lines terminated by `\n` whose fields are separated by
//! `|`. Field 0 is a three-letter type code; the remaining fields are
//! operation-specific. Object payloads never travel inside a line: a `PUT`
//! request or a `GET` reply declares a byte count, and exactly that many raw
//! bytes follow on the stream.
//!
//! ## Requests
//! - `CON|CLI` / `CON|SER[|<listen-addr>]` - classify the connection
//! - `PUT|<key>|<n>` - store object; payload follows the server's ready ack
//! - `GET|<key>` - fetch object
//! - `DEL|<key>` - delete object
//! - `LIS|<CLI|SER>` - list keys; the originator role bounds fan-out
//! - `LSE` - list the node's known peers
//! - `DIS` - close the connection
//!
//! ## Replies
//! - `ACK|<SUC|FAI|ER1|ER2|ER3>` - one per request
//! - `GET|<n>` then n raw bytes
//! - `LIS|<n>|<key>...` and `LSE|<n>|<addr>...`
//!
//! ## Example Session
//! ```text
//! C: CON|CLI
//! S: ACK|SUC
//! C: PUT|photo|3
//! S: ACK|SUC
//! C: <3 raw bytes>
//! S: ACK|SUC
//! C: LIS|CLI
//! S: ACK|SUC
//! S: LIS|2|photo|notes
//! ```

use crate::error::{Error, Result};

/// Separator between fields of one message line.
pub const FIELD_SEPARATOR: char = '|';

/// Three-letter type codes carried in field 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Put,
    Get,
    Delete,
    List,
    ListPeers,
    Connect,
    Disconnect,
    Ack,
}

impl MessageType {
    /// The three-letter code that opens a message line.
    pub fn code(self) -> &'static str {
        match self {
            MessageType::Put => "PUT",
            MessageType::Get => "GET",
            MessageType::Delete => "DEL",
            MessageType::List => "LIS",
            MessageType::ListPeers => "LSE",
            MessageType::Connect => "CON",
            MessageType::Disconnect => "DIS",
            MessageType::Ack => "ACK",
        }
    }

    /// Look up a message type by its code.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PUT" => Some(MessageType::Put),
            "GET" => Some(MessageType::Get),
            "DEL" => Some(MessageType::Delete),
            "LIS" => Some(MessageType::List),
            "LSE" => Some(MessageType::ListPeers),
            "CON" => Some(MessageType::Connect),
            "DIS" => Some(MessageType::Disconnect),
            "ACK" => Some(MessageType::Ack),
            _ => None,
        }
    }
}

/// Which side of the federation a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Wire token for this role (`CLI` or `SER`).
    pub fn code(self) -> &'static str {
        match self {
            Role::Client => "CLI",
            Role::Server => "SER",
        }
    }

    /// Parse a role token.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "CLI" => Some(Role::Client),
            "SER" => Some(Role::Server),
            _ => None,
        }
    }
}

/// Acknowledgement status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// `SUC`
    Success,
    /// `FAI` - generic failure
    Failure,
    /// `ER1` - key does not exist
    ExistsError,
    /// `ER2` - payload could not be read
    ReadError,
    /// `ER3` - message type not legal here
    WrongTypeError,
}

impl Status {
    /// Wire token carried in an `ACK` line.
    pub fn code(self) -> &'static str {
        match self {
            Status::Success => "SUC",
            Status::Failure => "FAI",
            Status::ExistsError => "ER1",
            Status::ReadError => "ER2",
            Status::WrongTypeError => "ER3",
        }
    }

    /// Parse a status token; unknown tokens yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SUC" => Some(Status::Success),
            "FAI" => Some(Status::Failure),
            "ER1" => Some(Status::ExistsError),
            "ER2" => Some(Status::ReadError),
            "ER3" => Some(Status::WrongTypeError),
            _ => None,
        }
    }
}

/// A request as read by a connection handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Store an object; `len` raw bytes follow the ready acknowledgement
    Put {
        /// Object key
        key: String,
        /// Declared payload length
        len: usize,
    },

    /// Fetch an object
    Get {
        /// Object key
        key: String,
    },

    /// Remove an object
    Delete {
        /// Object key
        key: String,
    },

    /// List keys; `origin` decides whether the receiver fans out
    List {
        /// Role the issuer claims
        origin: Role,
    },

    /// List the receiver's known peer addresses
    ListPeers,

    /// Classify the connection
    Connect {
        /// Requested role
        role: Role,
        /// Advertised listen address of a dialing server
        listen_addr: Option<String>,
    },

    /// Close the connection
    Disconnect,

    /// An acknowledgement arriving where a request was expected
    Ack {
        /// Parsed status, if recognisable
        status: Option<Status>,
    },
}

impl Request {
    /// The type code this request is sent under.
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Put { .. } => MessageType::Put,
            Request::Get { .. } => MessageType::Get,
            Request::Delete { .. } => MessageType::Delete,
            Request::List { .. } => MessageType::List,
            Request::ListPeers => MessageType::ListPeers,
            Request::Connect { .. } => MessageType::Connect,
            Request::Disconnect => MessageType::Disconnect,
            Request::Ack { .. } => MessageType::Ack,
        }
    }

    /// Render the request as message fields.
    pub fn encode(&self) -> Vec<String> {
        let code = self.message_type().code().to_string();
        match self {
            Request::Put { key, len } => vec![code, key.clone(), len.to_string()],
            Request::Get { key } | Request::Delete { key } => vec![code, key.clone()],
            Request::List { origin } => vec![code, origin.code().to_string()],
            Request::Connect { role, listen_addr } => {
                let mut fields = vec![code, role.code().to_string()];
                if let Some(addr) = listen_addr {
                    fields.push(addr.clone());
                }
                fields
            }
            Request::Ack { status } => vec![
                code,
                status.map(Status::code).unwrap_or("FAI").to_string(),
            ],
            Request::ListPeers | Request::Disconnect => vec![code],
        }
    }
}

/// Stateless parser turning message fields into [`Request`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct Protocol;

impl Protocol {
    pub fn new() -> Self {
        Self
    }

    /// Parse the fields of one request line.
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] when the type code is unknown, a required
    /// field is missing, the byte count is not numeric or a key is illegal.
    /// The caller answers those with `ACK|FAI` and keeps the connection.
    pub fn parse(&self, fields: &[String]) -> Result<Request> {
        let code = fields
            .first()
            .map(String::as_str)
            .ok_or_else(|| Error::Protocol("empty message".to_string()))?;
        let message_type = MessageType::from_code(code)
            .ok_or_else(|| Error::Protocol(format!("unknown message type: {}", code)))?;
        let args = &fields[1..];

        match message_type {
            MessageType::Put => {
                let (key, count) = match args {
                    [key, count] => (key, count),
                    _ => return Err(Error::Protocol("PUT requires a key and a byte count".into())),
                };
                validate_key(key)?;
                Ok(Request::Put {
                    key: key.clone(),
                    len: parse_count(count)?,
                })
            }
            MessageType::Get | MessageType::Delete => {
                let key = match args {
                    [key] => key,
                    _ => return Err(Error::Protocol(format!("{} requires exactly one key", code))),
                };
                validate_key(key)?;
                if message_type == MessageType::Get {
                    Ok(Request::Get { key: key.clone() })
                } else {
                    Ok(Request::Delete { key: key.clone() })
                }
            }
            MessageType::List => {
                let origin = match args {
                    [role] => Role::from_code(role)
                        .ok_or_else(|| Error::Protocol(format!("unknown role: {}", role)))?,
                    _ => return Err(Error::Protocol("LIS requires an originator role".into())),
                };
                Ok(Request::List { origin })
            }
            MessageType::ListPeers => Ok(Request::ListPeers),
            MessageType::Connect => {
                let (role, listen_addr) = match args {
                    [role] => (role, None),
                    [role, addr] if !addr.is_empty() => (role, Some(addr.clone())),
                    _ => return Err(Error::Protocol("CON requires a role".into())),
                };
                let role = Role::from_code(role)
                    .ok_or_else(|| Error::Protocol(format!("unknown role: {}", role)))?;
                Ok(Request::Connect { role, listen_addr })
            }
            MessageType::Disconnect => Ok(Request::Disconnect),
            MessageType::Ack => Ok(Request::Ack {
                status: args.first().and_then(|s| Status::from_code(s)),
            }),
        }
    }
}

/// Reject fields that would break line framing.
pub fn validate_field(field: &str) -> Result<()> {
    if field.contains(FIELD_SEPARATOR) || field.contains('\n') || field.contains('\r') {
        return Err(Error::Protocol(format!(
            "field contains a reserved character: {:?}",
            field
        )));
    }
    Ok(())
}

/// Keys must be non-empty and framing-safe.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Protocol("key cannot be empty".to_string()));
    }
    validate_field(key)
}

fn parse_count(field: &str) -> Result<usize> {
    field
        .parse::<usize>()
        .map_err(|_| Error::Protocol(format!("invalid byte count: {}", field)))
}

/// Build a `GET|<n>` style size header.
pub fn encode_size_reply(reply: MessageType, len: usize) -> Vec<String> {
    vec![reply.code().to_string(), len.to_string()]
}

/// Parse a `<code>|<n>` size header, checking the type code.
pub fn parse_size_reply(fields: &[String], expected: MessageType) -> Result<usize> {
    check_type(fields, expected)?;
    match &fields[1..] {
        [count] => parse_count(count),
        _ => Err(Error::Protocol(format!(
            "{} reply must carry exactly one byte count",
            expected.code()
        ))),
    }
}

/// Build a `<code>|<n>|<entry>...` listing.
pub fn encode_listing(reply: MessageType, entries: &[String]) -> Vec<String> {
    let mut fields = Vec::with_capacity(entries.len() + 2);
    fields.push(reply.code().to_string());
    fields.push(entries.len().to_string());
    fields.extend(entries.iter().cloned());
    fields
}

/// Length in bytes of `fields` once joined into a line, without the newline.
pub fn line_len<S: AsRef<str>>(fields: &[S]) -> usize {
    let separators = fields.len().saturating_sub(1);
    fields.iter().map(|f| f.as_ref().len()).sum::<usize>() + separators
}

/// Parse a `<code>|<n>|<entry>...` listing; the count must match the entries.
pub fn parse_listing(fields: &[String], expected: MessageType) -> Result<Vec<String>> {
    check_type(fields, expected)?;
    let count = fields
        .get(1)
        .ok_or_else(|| Error::Protocol(format!("{} reply is missing its count", expected.code())))
        .and_then(|c| parse_count(c))?;
    let entries = &fields[2..];
    if entries.len() != count {
        return Err(Error::Protocol(format!(
            "{} reply declared {} entries but carried {}",
            expected.code(),
            count,
            entries.len()
        )));
    }
    Ok(entries.to_vec())
}

fn check_type(fields: &[String], expected: MessageType) -> Result<()> {
    let code = fields.first().map(String::as_str).unwrap_or("");
    if code != expected.code() {
        return Err(Error::WrongMessageType(format!(
            "expected {}, received {:?}",
            expected.code(),
            code
        )));
    }
    Ok(())
}
