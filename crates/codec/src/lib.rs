//! ## Interledger wire codec
//!
//! [ILPv4]: https://interledger.org/rfcs/0027-interledger-protocol-4/
//! [BTP]: https://interledger.org/rfcs/0023-bilateral-transfer-protocol/
//! [OER]: https://interledger.org/rfcs/0030-notes-on-oer-encoding/
//!
//! The Interledger Protocol ([ILPv4]) moves value through a mesh of
//! connectors with three packet types: a `Prepare` carries an amount, an
//! absolute expiry and a 32-byte SHA-256 execution condition toward a
//! destination address; a `Fulfill` answers with the 32-byte preimage of
//! that condition; a `Reject` answers with a three-character error code
//! and the address of the node that produced it. Packets are encoded with
//! a subset of the Octet Encoding Rules ([OER]): length-prefixed variable
//! octet strings and length-prefixed variable unsigned integers.
//!
//! Between two adjacent connectors the packets ride inside Bilateral
//! Transfer Protocol ([BTP]) frames, a request/response protocol over any
//! stream transport that preserves message boundaries.
//!
//! Everything in this crate is pure: no I/O, no global state.

pub mod btp;
pub mod condition;
pub mod oer;
pub mod packet;

use std::{array::TryFromSliceError, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    UnexpectedEof,
    LengthTooLarge,
    EmptyAddress,
    AddressTooLong,
    DataTooLarge,
    InvalidTimestamp,
    InvalidErrorCode,
    UnknownPacketType,
    UnknownFrameType,
    UnknownContentType,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}
