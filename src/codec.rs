//! Record value and flag encoding.
//!
//! A record's `value` attribute is one binary buffer holding every passed
//! field in schema order, rendered as upper-case hex or base64.
//!
//! Segmented attributes (ALPHA, UNICODE, BLOB) use:
//!
//! ```text
//! segment := LEN:u16be DATA[LEN & 0x7FFF] ( RUN:u16be segment )?   -- when LEN & 0x8000
//! ```
//!
//! A spanned segment is interrupted by RUN zero bytes before the
//! continuation segment. A RUN of 0 only splits segments longer than
//! 0x7FFF bytes. NUMERIC, DATE and TIME take exactly `size` bytes;
//! BOOLEAN takes one.

use crate::config::WireEncoding;
use crate::error::{Error, Result};
use crate::field::{FieldValue, NumBuf, StorageAttr};
use crate::fields::FieldDef;
use base64::Engine as _;

const SPANNED: u16 = 0x8000;
const MAX_SEGMENT: usize = 0x7FFF;

/// Append one field value to a record buffer.
pub fn encode_value(out: &mut Vec<u8>, def: &FieldDef, value: &FieldValue) {
    match def.attr() {
        StorageAttr::Alpha | StorageAttr::Unicode => {
            let bytes = value.as_str().map(str::as_bytes).unwrap_or(&[]);
            encode_segments(out, bytes);
        }
        StorageAttr::Blob => {
            let bytes = value.as_bytes().unwrap_or(&[]);
            encode_segments(out, bytes);
        }
        StorageAttr::Numeric | StorageAttr::Date | StorageAttr::Time => {
            let width = def.size();
            let bytes = match value {
                FieldValue::Numeric(n) => n.as_bytes(),
                _ => &[],
            };
            let take = bytes.len().min(width);
            out.extend_from_slice(&bytes[..take]);
            out.resize(out.len() + (width - take), 0);
        }
        StorageAttr::Boolean => {
            out.push(u8::from(value.as_bool().unwrap_or(false)));
        }
    }
}

/// Read one field value from a record buffer, advancing `pos`.
pub fn decode_value(bytes: &[u8], pos: &mut usize, def: &FieldDef) -> Result<FieldValue> {
    match def.attr() {
        StorageAttr::Alpha => Ok(FieldValue::Alpha(decode_text(bytes, pos, def)?)),
        StorageAttr::Unicode => Ok(FieldValue::Unicode(decode_text(bytes, pos, def)?)),
        StorageAttr::Blob => Ok(FieldValue::Blob(decode_segments(bytes, pos)?)),
        StorageAttr::Numeric | StorageAttr::Date | StorageAttr::Time => {
            let raw = take(bytes, pos, def.size())?;
            Ok(FieldValue::Numeric(NumBuf::from_bytes(raw.to_vec())))
        }
        StorageAttr::Boolean => {
            let raw = take(bytes, pos, 1)?;
            Ok(FieldValue::Boolean(raw[0] != 0))
        }
    }
}

fn decode_text(bytes: &[u8], pos: &mut usize, def: &FieldDef) -> Result<String> {
    let raw = decode_segments(bytes, pos)?;
    String::from_utf8(raw)
        .map_err(|_| Error::wire(format!("field '{}' is not valid UTF-8", def.name())))
}

pub fn encode_segments(out: &mut Vec<u8>, data: &[u8]) {
    let mut rest = data;
    loop {
        let run = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let seg_len = run.min(MAX_SEGMENT);
        let (segment, after) = rest.split_at(seg_len);

        if after.is_empty() {
            out.extend_from_slice(&(seg_len as u16).to_be_bytes());
            out.extend_from_slice(segment);
            return;
        }

        out.extend_from_slice(&(seg_len as u16 | SPANNED).to_be_bytes());
        out.extend_from_slice(segment);

        let zeros = after
            .iter()
            .take_while(|&&b| b == 0)
            .count()
            .min(u16::MAX as usize);
        out.extend_from_slice(&(zeros as u16).to_be_bytes());
        rest = &after[zeros..];
    }
}

pub fn decode_segments(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    loop {
        let len = read_u16(bytes, pos)?;
        let seg_len = (len & !SPANNED) as usize;
        data.extend_from_slice(take(bytes, pos, seg_len)?);

        if len & SPANNED == 0 {
            return Ok(data);
        }
        let zeros = read_u16(bytes, pos)? as usize;
        data.resize(data.len() + zeros, 0);
    }
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Result<u16> {
    let raw = take(bytes, pos, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(n)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| {
            Error::wire(format!(
                "value buffer truncated: need {} bytes at offset {}, have {}",
                n,
                pos,
                bytes.len()
            ))
        })?;
    let slice = &bytes[*pos..end];
    *pos = end;
    Ok(slice)
}

/// Render a record buffer for the wire
pub fn render(bytes: &[u8], encoding: WireEncoding) -> String {
    match encoding {
        WireEncoding::Hex => to_hex(bytes),
        WireEncoding::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

/// Inverse of `render`
pub fn parse_rendered(text: &str, encoding: WireEncoding) -> Result<Vec<u8>> {
    match encoding {
        WireEncoding::Hex => from_hex(text),
        WireEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| Error::wire(format!("bad base64 value: {}", e))),
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

pub fn from_hex(text: &str) -> Result<Vec<u8>> {
    hex::decode(text.trim()).map_err(|e| Error::wire(format!("bad hex value: {}", e)))
}

/// Two hex chars per field
pub fn encode_flags(flags: &[u8]) -> String {
    to_hex(flags)
}

/// Decode a flags attribute for `count` fields.
///
/// Resident-table rows may use the legacy one-char form: `.` for no flags
/// and `/` for NULL.
pub fn decode_flags(text: &str, count: usize, allow_legacy: bool) -> Result<Vec<u8>> {
    let text = text.trim();
    if allow_legacy && text.len() == count && text.bytes().all(|c| c == b'.' || c == b'/') {
        return Ok(text.bytes().map(|c| u8::from(c == b'/')).collect());
    }

    let flags = from_hex(text)?;
    if flags.len() != count {
        return Err(Error::wire(format!(
            "flags cover {} fields, schema has {}",
            flags.len(),
            count
        )));
    }
    Ok(flags)
}
