//! Bilateral Transfer Protocol framing.
//!
//! A frame is one request or response on a peer session:
//!
//! ```text
//! uint32   length        // big-endian, size of the rest of the frame
//! uint8    type          // 6=Message, 1=Response, 2=Error
//! uint32   requestId     // big-endian, session-scoped
//! varuint  count         // number of protocol-data entries
//! entries: name(varOctetString) contentType(u8) content(varOctetString)
//! ```
//!
//! The outer length keeps message boundaries intact over a plain byte
//! stream. Protocol-data entries are ordered named sub-payloads; the
//! first entry's name decides how a `Message` frame is interpreted.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::{Error, oer};

/// Sub-payload names with a defined meaning on a session.
pub const PROTOCOL_AUTH: &str = "auth";
pub const PROTOCOL_AUTH_TOKEN: &str = "auth_token";
pub const PROTOCOL_AUTH_USERNAME: &str = "auth_username";
pub const PROTOCOL_ILP: &str = "ilp";
pub const PROTOCOL_ERROR: &str = "error";

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Response = 1,
    Error = 2,
    Message = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ContentType {
    OctetStream = 0,
    TextPlainUtf8 = 1,
    ApplicationJson = 2,
    ApplicationIlp = 3,
}

/// Session-level failure codes carried in `Error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    AuthenticationFailed,
    SessionReplaced,
    SessionRemoved,
    InternalError,
}

impl SessionError {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AuthenticationFailed",
            Self::SessionReplaced => "SessionReplaced",
            Self::SessionRemoved => "SessionRemoved",
            Self::InternalError => "InternalError",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        Some(match value {
            "AuthenticationFailed" => Self::AuthenticationFailed,
            "SessionReplaced" => Self::SessionReplaced,
            "SessionRemoved" => Self::SessionRemoved,
            "InternalError" => Self::InternalError,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolData {
    pub name: String,
    pub content_type: ContentType,
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameType,
    pub request_id: u32,
    pub protocol_data: Vec<ProtocolData>,
}

impl Frame {
    /// The authentication request a client sends as its first frame.
    ///
    /// # Test
    ///
    /// ```
    /// use ilp_connector_codec::btp::*;
    ///
    /// let frame = Frame::auth(1, "node-b", b"secret");
    ///
    /// assert!(frame.is_auth());
    /// assert_eq!(
    ///     frame.get(PROTOCOL_AUTH_USERNAME).unwrap().content,
    ///     &b"node-b"[..],
    /// );
    /// ```
    pub fn auth(request_id: u32, username: &str, token: &[u8]) -> Self {
        Self {
            kind: FrameType::Message,
            request_id,
            protocol_data: vec![
                ProtocolData {
                    name: PROTOCOL_AUTH.to_string(),
                    content_type: ContentType::OctetStream,
                    content: Bytes::new(),
                },
                ProtocolData {
                    name: PROTOCOL_AUTH_USERNAME.to_string(),
                    content_type: ContentType::TextPlainUtf8,
                    content: Bytes::copy_from_slice(username.as_bytes()),
                },
                ProtocolData {
                    name: PROTOCOL_AUTH_TOKEN.to_string(),
                    content_type: ContentType::OctetStream,
                    content: Bytes::copy_from_slice(token),
                },
            ],
        }
    }

    /// A `Message` frame carrying one ILP packet.
    pub fn message(request_id: u32, ilp: Bytes) -> Self {
        Self {
            kind: FrameType::Message,
            request_id,
            protocol_data: vec![ProtocolData {
                name: PROTOCOL_ILP.to_string(),
                content_type: ContentType::ApplicationIlp,
                content: ilp,
            }],
        }
    }

    /// A `Response` frame carrying one ILP packet.
    pub fn response(request_id: u32, ilp: Bytes) -> Self {
        Self {
            kind: FrameType::Response,
            request_id,
            protocol_data: vec![ProtocolData {
                name: PROTOCOL_ILP.to_string(),
                content_type: ContentType::ApplicationIlp,
                content: ilp,
            }],
        }
    }

    /// An empty `Response`, used to acknowledge authentication.
    pub fn empty_response(request_id: u32) -> Self {
        Self {
            kind: FrameType::Response,
            request_id,
            protocol_data: vec![],
        }
    }

    /// An `Error` frame with a session failure code and a short message.
    pub fn error(request_id: u32, code: SessionError, message: &str) -> Self {
        Self {
            kind: FrameType::Error,
            request_id,
            protocol_data: vec![
                ProtocolData {
                    name: PROTOCOL_ERROR.to_string(),
                    content_type: ContentType::TextPlainUtf8,
                    content: Bytes::copy_from_slice(code.as_str().as_bytes()),
                },
                ProtocolData {
                    name: "message".to_string(),
                    content_type: ContentType::TextPlainUtf8,
                    content: Bytes::copy_from_slice(message.as_bytes()),
                },
            ],
        }
    }

    /// First sub-payload with the given name.
    pub fn get(&self, name: &str) -> Option<&ProtocolData> {
        self.protocol_data.iter().find(|it| it.name == name)
    }

    /// The session error code of an `Error` frame, if present and known.
    pub fn session_error(&self) -> Option<SessionError> {
        let data = self.get(PROTOCOL_ERROR)?;
        SessionError::from_str(std::str::from_utf8(&data.content).ok()?)
    }

    /// Whether this frame is the expected first frame of a session: a
    /// `Message` carrying the `auth` sub-payload.
    pub fn is_auth(&self) -> bool {
        self.kind == FrameType::Message && self.get(PROTOCOL_AUTH).is_some()
    }

    /// Encodes the frame including its outer length delimiter, replacing
    /// the contents of `bytes`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::{Bytes, BytesMut};
    /// use ilp_connector_codec::btp::*;
    ///
    /// let frame = Frame::message(7, Bytes::from_static(b"packet"));
    ///
    /// let mut bytes = BytesMut::new();
    /// frame.encode(&mut bytes);
    ///
    /// let size = Frame::message_size(&bytes).unwrap().unwrap();
    /// assert_eq!(size, bytes.len());
    /// assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();

        let mut body = Vec::with_capacity(64);
        body.put_u8(self.kind.into());
        body.put_u32(self.request_id);
        oer::put_var_uint(&mut body, self.protocol_data.len() as u64);
        for entry in &self.protocol_data {
            oer::put_var_octet_string(&mut body, entry.name.as_bytes());
            body.put_u8(entry.content_type.into());
            oer::put_var_octet_string(&mut body, &entry.content);
        }

        bytes.put_u32(body.len() as u32);
        bytes.extend_from_slice(&body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.freeze()
    }

    /// Number of bytes of the first complete frame in `bytes`, or `None`
    /// when more data is needed.
    pub fn message_size(bytes: &[u8]) -> Result<Option<usize>, Error> {
        if bytes.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes(bytes[..4].try_into()?) as usize;
        if size > MAX_FRAME_LEN {
            return Err(Error::LengthTooLarge);
        }

        Ok(if bytes.len() >= size + 4 {
            Some(size + 4)
        } else {
            None
        })
    }

    /// Decodes one complete frame, outer length delimiter included.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let size = match Self::message_size(bytes)? {
            Some(size) => size,
            None => return Err(Error::UnexpectedEof),
        };

        let mut cursor = &bytes[4..size];
        let kind = FrameType::try_from(oer::read_u8(&mut cursor)?)
            .map_err(|_| Error::UnknownFrameType)?;
        let request_id = oer::read_u32(&mut cursor)?;

        let count = oer::read_var_uint(&mut cursor)?;
        let mut protocol_data = Vec::with_capacity(count.min(16) as usize);
        for _ in 0..count {
            let name = std::str::from_utf8(oer::read_var_octet_string(&mut cursor)?)?.to_string();
            let content_type = ContentType::try_from(oer::read_u8(&mut cursor)?)
                .map_err(|_| Error::UnknownContentType)?;
            let content = Bytes::copy_from_slice(oer::read_var_octet_string(&mut cursor)?);

            protocol_data.push(ProtocolData {
                name,
                content_type,
                content,
            });
        }

        Ok(Self {
            kind,
            request_id,
            protocol_data,
        })
    }
}
