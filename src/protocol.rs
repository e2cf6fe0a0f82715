//! Mini-FTP line protocol.
//!
//! Every message is an ASCII string followed by a single terminating NUL
//! byte, sent as one discrete unit on the transport.
//!
//! ```text
//! Request:  GET <file>\n\n
//! Response: 200 OK <n>\n\n<payload>
//!           202 Command Not Implemented\n\n
//!           550 File Unavailable\n\n
//! ```
//!
//! The `<n>` in a `200 OK` line is a fixed annotation taken from the file
//! table, not a computed length.

use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// The only command verb the server understands.
pub const VERB: &str = "GET ";

/// Commands issued by the client, in order.
pub const COMMANDS: [&str; 6] = [
    "Foobar\n\n",
    "GET UNKNOWNFILE\n\n",
    "GET little.txt\n\n",
    "GET big.txt\n\n",
    "GET huge.txt\n\n",
    "GET giant.txt\n\n",
];

/// Canned file table: request token (with line terminator), declared size, body.
const FILES: [(&str, usize, &str); 4] = [
    ("little.txt\n\n", 1, "A"),
    ("big.txt\n\n", 11, "A big file."),
    ("huge.txt\n\n", 31, "An even bigger file.\nAnd more!"),
    ("giant.txt\n\n", 12, "Jolly, Green"),
];

/// Server reply to a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// `200 OK <declared>\n\n<body>`
    Ok { declared: usize, body: &'static str },
    /// Request did not start with `GET `.
    NotImplemented,
    /// `GET` of a file that is not in the table.
    Unavailable,
}

impl Response {
    /// Status code of the reply.
    pub fn code(&self) -> u16 {
        match self {
            Response::Ok { .. } => 200,
            Response::NotImplemented => 202,
            Response::Unavailable => 550,
        }
    }

    /// Response text, without the terminating NUL.
    pub fn text(&self) -> Cow<'static, str> {
        match self {
            Response::Ok { declared, body } => Cow::Owned(format!("200 OK {declared}\n\n{body}")),
            Response::NotImplemented => Cow::Borrowed("202 Command Not Implemented\n\n"),
            Response::Unavailable => Cow::Borrowed("550 File Unavailable\n\n"),
        }
    }

    /// Wire form: the text plus one terminating NUL byte.
    pub fn encode(&self) -> Bytes {
        encode_text(&self.text())
    }
}

/// Classify a raw request payload and select the canned reply.
pub fn classify(payload: &[u8]) -> Response {
    let text = decode_text(payload);

    let Some(name) = text.strip_prefix(VERB) else {
        return Response::NotImplemented;
    };

    FILES
        .iter()
        .find(|(token, _, _)| *token == name)
        .map(|&(_, declared, body)| Response::Ok { declared, body })
        .unwrap_or(Response::Unavailable)
}

/// Encode a command or response string as a NUL-terminated wire message.
pub fn encode_text(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Wire form of the `index`th client command, if there is one.
pub fn command(index: usize) -> Option<Bytes> {
    COMMANDS.get(index).map(|cmd| encode_text(cmd))
}

/// Text content of a wire message: everything before the first NUL.
pub fn decode_text(payload: &[u8]) -> Cow<'_, str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end])
}
