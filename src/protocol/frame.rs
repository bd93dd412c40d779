//! Wire frames.
//!
//! A frame is `[address] head [separator args] [newline]` where the head is the
//! expanded template plus, for requests, the query marker. A template holding
//! the `<X>` placeholder takes the arguments in place instead of after the
//! separator, and sends nothing there when there are none. The empty `Custom` template sends its arguments raw.

use crate::protocol::command::{BaseCommand, Command};
use crate::protocol::profile::DeviceProfile;
use std::fmt;

/// Placeholder replaced by the arguments.
pub const PLACEHOLDER: &str = "<X>";

/// Command arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
    /// Text arguments.
    Text(String),
    /// Raw bytes, framed like text.
    Bytes(Vec<u8>),
}

impl Args {
    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Args::Text(text) => text.as_bytes(),
            Args::Bytes(bytes) => bytes,
        }
    }

    fn from_wire(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Args::Text(text.to_string()),
            Err(_) => Args::Bytes(bytes.to_vec()),
        }
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Args::Text(text) => f.write_str(text),
            Args::Bytes(bytes) => {
                let joined: Vec<String> = bytes.iter().map(u8::to_string).collect();
                write!(f, "[{}]", joined.join(","))
            }
        }
    }
}

impl From<&str> for Args {
    fn from(text: &str) -> Self {
        Args::Text(text.to_string())
    }
}

impl From<String> for Args {
    fn from(text: String) -> Self {
        Args::Text(text)
    }
}

impl From<Vec<u8>> for Args {
    fn from(bytes: Vec<u8>) -> Self {
        Args::Bytes(bytes)
    }
}

impl From<&[u8]> for Args {
    fn from(bytes: &[u8]) -> Self {
        Args::Bytes(bytes.to_vec())
    }
}

/// Encoded frame, split into the address byte and the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    address: Option<u8>,
    payload: Vec<u8>,
}

/// Frame decoded back into a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<D> {
    /// Address byte, for 9-bit profiles.
    pub address: Option<u8>,
    /// Recovered command.
    pub command: Command<D>,
    /// Recovered arguments.
    pub args: Option<Args>,
    /// Whether the query marker was present.
    pub query: bool,
}

fn head<P: DeviceProfile>(profile: &P, command: Command<P::Command>, query: bool) -> String {
    let template = profile.expand_template(profile.table().template(command));
    let mut head = template.into_owned();
    if query && !head.is_empty() {
        if let Some(marker) = profile.query_marker() {
            head.push_str(marker);
        }
    }
    head
}

impl Frame {
    /// Build the frame for `command`. `query` selects the request form.
    pub fn build<P: DeviceProfile>(
        profile: &P,
        command: Command<P::Command>,
        args: Option<&Args>,
        query: bool,
    ) -> Self {
        let head = head(profile, command, query);
        let mut payload = Vec::with_capacity(head.len() + 16);
        if let Some((before, after)) = head.split_once(PLACEHOLDER) {
            payload.extend_from_slice(before.as_bytes());
            if let Some(args) = args {
                payload.extend_from_slice(args.as_bytes());
            }
            payload.extend_from_slice(after.as_bytes());
        } else {
            match args {
                None => payload.extend_from_slice(head.as_bytes()),
                Some(args) if head.is_empty() => payload.extend_from_slice(args.as_bytes()),
                Some(args) => {
                    payload.extend_from_slice(head.as_bytes());
                    payload.extend_from_slice(profile.arg_separator().as_bytes());
                    payload.extend_from_slice(args.as_bytes());
                }
            }
        }
        if let Some(newline) = profile.newline() {
            payload.extend_from_slice(newline.as_bytes());
        }
        Self {
            address: profile.address(),
            payload,
        }
    }

    /// Address byte sent with mark parity.
    pub fn address(&self) -> Option<u8> {
        self.address
    }

    /// Bytes sent after the address.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Address and payload as one byte string.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 1);
        bytes.extend(self.address);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode recorded bytes against `profile`.
    ///
    /// Tries every non-empty template in both plain and request form and keeps
    /// the longest match. Anything else decodes as `Custom` with the bytes as
    /// arguments. Returns `None` when the address byte or terminator is missing.
    pub fn parse<P: DeviceProfile>(profile: &P, bytes: &[u8]) -> Option<ParsedFrame<P::Command>> {
        let (address, mut body) = match profile.address() {
            Some(expected) => {
                let (&first, rest) = bytes.split_first()?;
                if first != expected {
                    return None;
                }
                (Some(first), rest)
            }
            None => (None, bytes),
        };
        if let Some(newline) = profile.newline() {
            body = body.strip_suffix(newline.as_bytes())?;
        }

        let mut best: Option<(usize, ParsedFrame<P::Command>)> = None;
        for command in Command::<P::Command>::all() {
            for query in [false, true] {
                let head = head(profile, command, query);
                if head.is_empty() {
                    continue;
                }
                let Some(args) = match_head(profile, &head, body) else {
                    continue;
                };
                if best.as_ref().is_some_and(|(len, _)| *len >= head.len()) {
                    continue;
                }
                best = Some((
                    head.len(),
                    ParsedFrame {
                        address,
                        command,
                        args,
                        query,
                    },
                ));
            }
        }

        Some(match best {
            Some((_, parsed)) => parsed,
            None => ParsedFrame {
                address,
                command: Command::Base(BaseCommand::Custom),
                args: (!body.is_empty()).then(|| Args::from_wire(body)),
                query: false,
            },
        })
    }
}

/// Arguments of `body` if it was framed from `head`; `Some(None)` for no args.
fn match_head<P: DeviceProfile>(profile: &P, head: &str, body: &[u8]) -> Option<Option<Args>> {
    if let Some((before, after)) = head.split_once(PLACEHOLDER) {
        let inner = body
            .strip_prefix(before.as_bytes())?
            .strip_suffix(after.as_bytes())?;
        return Some((!inner.is_empty()).then(|| Args::from_wire(inner)));
    }
    if body == head.as_bytes() {
        return Some(None);
    }
    let rest = body
        .strip_prefix(head.as_bytes())?
        .strip_prefix(profile.arg_separator().as_bytes())?;
    Some(Some(Args::from_wire(rest)))
}
