//! Octet Encoding Rules subset used by the interledger packet layout.
//!
//! Only two shapes are needed: variable-length octet strings and
//! variable-length unsigned integers, both carrying a length prefix. A
//! length below 128 is a single byte; larger lengths store `0x80 | n`
//! followed by `n` big-endian length bytes.

use bytes::BufMut;
use chrono::{DateTime, NaiveDateTime, Utc};

use super::Error;

/// Lengths of length may not exceed the size of a `u64`.
const MAX_LENGTH_OF_LENGTH: usize = 8;

/// Interledger timestamps are fixed-width UTC with millisecond precision.
const TIMESTAMP_LEN: usize = 17;
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// Reading side of the OER subset.
///
/// All functions take a cursor over a byte slice and advance it past the
/// consumed bytes, so composite structures can be read field by field.
///
/// # Test
///
/// ```
/// use ilp_connector_codec::oer;
///
/// let mut buf = Vec::new();
/// oer::put_var_octet_string(&mut buf, b"example.data");
///
/// let mut cursor = &buf[..];
/// let ret = oer::read_var_octet_string(&mut cursor).unwrap();
///
/// assert_eq!(ret, b"example.data");
/// assert!(cursor.is_empty());
/// ```
pub fn read_var_octet_string<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], Error> {
    let size = read_var_length(cursor)?;
    if size > cursor.len() {
        return Err(Error::UnexpectedEof);
    }

    let (data, rest) = cursor.split_at(size);
    *cursor = rest;
    Ok(data)
}

/// # Test
///
/// ```
/// use ilp_connector_codec::oer;
///
/// let mut buf = Vec::new();
/// oer::put_var_uint(&mut buf, 1000);
/// assert_eq!(&buf, &[2, 3, 232]);
///
/// let mut cursor = &buf[..];
/// assert_eq!(oer::read_var_uint(&mut cursor).unwrap(), 1000);
/// ```
pub fn read_var_uint(cursor: &mut &[u8]) -> Result<u64, Error> {
    let data = read_var_octet_string(cursor)?;
    if data.is_empty() || data.len() > MAX_LENGTH_OF_LENGTH {
        return Err(Error::LengthTooLarge);
    }

    Ok(data.iter().fold(0u64, |acc, it| (acc << 8) | *it as u64))
}

/// Reads the fixed-width interledger timestamp.
///
/// # Test
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use ilp_connector_codec::oer;
///
/// let ts = Utc.with_ymd_and_hms(2017, 12, 23, 1, 21, 40).unwrap();
/// let mut buf = Vec::new();
/// oer::put_timestamp(&mut buf, &ts);
/// assert_eq!(&buf, b"20171223012140000");
///
/// let mut cursor = &buf[..];
/// assert_eq!(oer::read_timestamp(&mut cursor).unwrap(), ts);
/// ```
pub fn read_timestamp(cursor: &mut &[u8]) -> Result<DateTime<Utc>, Error> {
    if cursor.len() < TIMESTAMP_LEN {
        return Err(Error::UnexpectedEof);
    }

    let (data, rest) = cursor.split_at(TIMESTAMP_LEN);
    *cursor = rest;

    let text = std::str::from_utf8(data)?;
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map(|it| it.and_utc())
        .map_err(|_| Error::InvalidTimestamp)
}

pub fn read_u8(cursor: &mut &[u8]) -> Result<u8, Error> {
    if cursor.is_empty() {
        return Err(Error::UnexpectedEof);
    }

    let value = cursor[0];
    *cursor = &cursor[1..];
    Ok(value)
}

pub fn read_u32(cursor: &mut &[u8]) -> Result<u32, Error> {
    if cursor.len() < 4 {
        return Err(Error::UnexpectedEof);
    }

    let value = u32::from_be_bytes(cursor[..4].try_into()?);
    *cursor = &cursor[4..];
    Ok(value)
}

pub fn read_u64(cursor: &mut &[u8]) -> Result<u64, Error> {
    if cursor.len() < 8 {
        return Err(Error::UnexpectedEof);
    }

    let value = u64::from_be_bytes(cursor[..8].try_into()?);
    *cursor = &cursor[8..];
    Ok(value)
}

pub fn read_fixed<'a>(cursor: &mut &'a [u8], size: usize) -> Result<&'a [u8], Error> {
    if cursor.len() < size {
        return Err(Error::UnexpectedEof);
    }

    let (data, rest) = cursor.split_at(size);
    *cursor = rest;
    Ok(data)
}

pub fn put_var_octet_string<B: BufMut>(buf: &mut B, data: &[u8]) {
    put_var_length(buf, data.len());
    buf.put_slice(data);
}

pub fn put_var_uint<B: BufMut>(buf: &mut B, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = (value.leading_zeros() / 8).min(7) as usize;
    put_var_octet_string(buf, &bytes[skip..]);
}

pub fn put_timestamp<B: BufMut>(buf: &mut B, value: &DateTime<Utc>) {
    buf.put_slice(value.format(TIMESTAMP_FORMAT).to_string().as_bytes());
}

fn read_var_length(cursor: &mut &[u8]) -> Result<usize, Error> {
    let head = read_u8(cursor)?;
    if head & 0x80 == 0 {
        return Ok(head as usize);
    }

    let count = (head & 0x7F) as usize;
    if count == 0 || count > MAX_LENGTH_OF_LENGTH {
        return Err(Error::LengthTooLarge);
    }

    if cursor.len() < count {
        return Err(Error::UnexpectedEof);
    }

    let mut size = 0u64;
    for _ in 0..count {
        size = (size << 8) | read_u8(cursor)? as u64;
    }

    usize::try_from(size).map_err(|_| Error::LengthTooLarge)
}

fn put_var_length<B: BufMut>(buf: &mut B, size: usize) {
    if size < 0x80 {
        buf.put_u8(size as u8);
        return;
    }

    let bytes = (size as u64).to_be_bytes();
    let skip = ((size as u64).leading_zeros() / 8).min(7) as usize;
    buf.put_u8(0x80 | (8 - skip) as u8);
    buf.put_slice(&bytes[skip..]);
}
