//! ILPv4 packet types and their OER layout.
//!
//! Every packet is an envelope of one type byte followed by a
//! length-prefixed body:
//!
//! ```text
//! Prepare body:  amount(u64) expiresAt(17 bytes) executionCondition(32 bytes)
//!                destination(varOctetString) data(varOctetString)
//! Fulfill body:  fulfillment(32 bytes) data(varOctetString)
//! Reject body:   code(3 bytes) triggeredBy(varOctetString)
//!                message(varOctetString) data(varOctetString)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use super::{Error, oer};

pub const PREPARE_TYPE: u8 = 12;
pub const FULFILL_TYPE: u8 = 13;
pub const REJECT_TYPE: u8 = 14;

/// Packet data payloads are capped at 32 KiB.
pub const MAX_DATA_LEN: usize = 32 * 1024;

const MAX_ADDRESS_LEN: usize = 1023;

/// An interledger address.
///
/// Dotted-hierarchical identifier, e.g. `g.alice.sub`. The bytes are
/// opaque to the codec; routability is defined by byte-prefix ordering.
/// Addresses are never empty and never longer than 1023 bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(Bytes);

impl Address {
    /// # Test
    ///
    /// ```
    /// use ilp_connector_codec::packet::Address;
    ///
    /// let addr = Address::new("g.alice").unwrap();
    /// assert_eq!(addr.as_bytes(), b"g.alice");
    ///
    /// assert!(Address::new("").is_err());
    /// ```
    pub fn new(address: &str) -> Result<Self, Error> {
        Self::from_bytes(Bytes::copy_from_slice(address.as_bytes()))
    }

    pub fn from_bytes(bytes: Bytes) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Err(Error::EmptyAddress);
        }

        if bytes.len() > MAX_ADDRESS_LEN {
            return Err(Error::AddressTooLong);
        }

        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether `prefix` is a byte prefix of this address.
    ///
    /// # Test
    ///
    /// ```
    /// use ilp_connector_codec::packet::Address;
    ///
    /// let addr = Address::new("g.alice.sub.x").unwrap();
    /// assert!(addr.starts_with(b"g.alice"));
    /// assert!(!addr.starts_with(b"g.bob"));
    /// ```
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Error class of a reject code, from its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Do not retry.
    Final,
    /// May retry.
    Temporary,
    /// Relative to expiry or amount.
    Relative,
}

/// Three-character ILP error code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode([u8; 3]);

impl ErrorCode {
    pub const F01_INVALID_PACKET: Self = Self(*b"F01");
    pub const F02_UNREACHABLE: Self = Self(*b"F02");
    pub const F05_WRONG_CONDITION: Self = Self(*b"F05");
    pub const F06_UNEXPECTED_PAYMENT: Self = Self(*b"F06");
    pub const T00_INTERNAL_ERROR: Self = Self(*b"T00");
    pub const T01_PEER_UNREACHABLE: Self = Self(*b"T01");
    pub const T03_INTERNAL_ERROR: Self = Self(*b"T03");
    pub const T04_INSUFFICIENT_LIQUIDITY: Self = Self(*b"T04");
    pub const R00_TRANSFER_TIMED_OUT: Self = Self(*b"R00");
    pub const R01_INSUFFICIENT_SOURCE_AMOUNT: Self = Self(*b"R01");
    pub const R02_INSUFFICIENT_DESTINATION_AMOUNT: Self = Self(*b"R02");

    /// # Test
    ///
    /// ```
    /// use ilp_connector_codec::packet::{ErrorClass, ErrorCode};
    ///
    /// let code = ErrorCode::new(*b"T99").unwrap();
    /// assert_eq!(code.class(), ErrorClass::Temporary);
    ///
    /// assert!(ErrorCode::new(*b"X00").is_err());
    /// ```
    pub fn new(code: [u8; 3]) -> Result<Self, Error> {
        if !matches!(code[0], b'F' | b'T' | b'R') {
            return Err(Error::InvalidErrorCode);
        }

        if !code[1].is_ascii_digit() || !code[2].is_ascii_digit() {
            return Err(Error::InvalidErrorCode);
        }

        Ok(Self(code))
    }

    pub fn class(&self) -> ErrorClass {
        match self.0[0] {
            b'F' => ErrorClass::Final,
            b'T' => ErrorClass::Temporary,
            _ => ErrorClass::Relative,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 3] {
        &self.0
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Codes are validated ASCII on construction.
        write!(f, "{}", std::str::from_utf8(&self.0).unwrap_or("???"))
    }
}

impl std::fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prepare {
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
    pub execution_condition: [u8; 32],
    pub destination: Address,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fulfill {
    pub fulfillment: [u8; 32],
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub code: ErrorCode,
    pub triggered_by: Address,
    pub message: String,
    pub data: Bytes,
}

impl Reject {
    /// A reject with no attached data, the common case inside the router.
    pub fn new(code: ErrorCode, triggered_by: Address, message: &str) -> Self {
        Self {
            code,
            triggered_by,
            message: message.to_string(),
            data: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    /// Encodes the packet envelope into `bytes`, replacing its contents.
    ///
    /// Encoding is deterministic: the same packet always yields the same
    /// bytes, and `parse(encode(x)) == x` for canonical inputs.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::{Bytes, BytesMut};
    /// use chrono::{Duration, DurationRound, Utc};
    /// use ilp_connector_codec::packet::*;
    ///
    /// let packet = Packet::Prepare(Prepare {
    ///     amount: 1000,
    ///     expires_at: Utc::now().duration_trunc(Duration::milliseconds(1)).unwrap()
    ///         + Duration::seconds(10),
    ///     execution_condition: [7; 32],
    ///     destination: Address::new("g.alice.dest").unwrap(),
    ///     data: Bytes::from_static(b"hello"),
    /// });
    ///
    /// let mut bytes = BytesMut::new();
    /// packet.encode(&mut bytes);
    ///
    /// assert_eq!(Packet::parse(&bytes).unwrap(), packet);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();

        let mut body = Vec::with_capacity(64);
        let kind = match self {
            Self::Prepare(prepare) => {
                body.put_u64(prepare.amount);
                oer::put_timestamp(&mut body, &prepare.expires_at);
                body.put_slice(&prepare.execution_condition);
                oer::put_var_octet_string(&mut body, prepare.destination.as_bytes());
                oer::put_var_octet_string(&mut body, &prepare.data);
                PREPARE_TYPE
            }
            Self::Fulfill(fulfill) => {
                body.put_slice(&fulfill.fulfillment);
                oer::put_var_octet_string(&mut body, &fulfill.data);
                FULFILL_TYPE
            }
            Self::Reject(reject) => {
                body.put_slice(reject.code.as_bytes());
                oer::put_var_octet_string(&mut body, reject.triggered_by.as_bytes());
                oer::put_var_octet_string(&mut body, reject.message.as_bytes());
                oer::put_var_octet_string(&mut body, &reject.data);
                REJECT_TYPE
            }
        };

        bytes.put_u8(kind);
        oer::put_var_octet_string(bytes, &body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.freeze()
    }

    /// Parses one packet from `bytes`, which must contain exactly one
    /// envelope.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let mut cursor = bytes;
        let kind = oer::read_u8(&mut cursor)?;
        let mut body = oer::read_var_octet_string(&mut cursor)?;

        match kind {
            PREPARE_TYPE => {
                let amount = oer::read_u64(&mut body)?;
                let expires_at = oer::read_timestamp(&mut body)?;
                let execution_condition = oer::read_fixed(&mut body, 32)?.try_into()?;
                let destination = read_address(&mut body)?;
                let data = read_data(&mut body)?;

                Ok(Self::Prepare(Prepare {
                    amount,
                    expires_at,
                    execution_condition,
                    destination,
                    data,
                }))
            }
            FULFILL_TYPE => {
                let fulfillment = oer::read_fixed(&mut body, 32)?.try_into()?;
                let data = read_data(&mut body)?;

                Ok(Self::Fulfill(Fulfill { fulfillment, data }))
            }
            REJECT_TYPE => {
                let code = ErrorCode::new(oer::read_fixed(&mut body, 3)?.try_into()?)?;
                let triggered_by = read_address(&mut body)?;
                let message = std::str::from_utf8(oer::read_var_octet_string(&mut body)?)?.to_string();
                let data = read_data(&mut body)?;

                Ok(Self::Reject(Reject {
                    code,
                    triggered_by,
                    message,
                    data,
                }))
            }
            _ => Err(Error::UnknownPacketType),
        }
    }
}

fn read_address(cursor: &mut &[u8]) -> Result<Address, Error> {
    let data = oer::read_var_octet_string(cursor)?;
    Address::from_bytes(Bytes::copy_from_slice(data))
}

fn read_data(cursor: &mut &[u8]) -> Result<Bytes, Error> {
    let data = oer::read_var_octet_string(cursor)?;
    if data.len() > MAX_DATA_LEN {
        return Err(Error::DataTooLarge);
    }

    Ok(Bytes::copy_from_slice(data))
}
