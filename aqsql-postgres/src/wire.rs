//! Frontend/backend message framing.
//!
//! Every PostgreSQL v3 message on the wire (after the initial untyped
//! `StartupMessage`) is a one-byte type tag followed by a four-byte
//! big-endian length (counting itself, not the tag) followed by that many
//! bytes of payload. This module only deals in that framing and in the
//! handful of message shapes the driver actually sends or expects back;
//! it is the thin wrapper `spec.md` asks for, kept deliberately narrow so
//! the FIFO/pipeline/pool machinery built on top of it isn't coupled to
//! wire minutiae.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use aqsql_core::net::BoxSocket;
use aqsql_core::{Error, Result};

/// A backend message still in its raw, type-tagged form.
#[derive(Debug)]
pub struct Backend {
    pub tag: u8,
    pub body: BytesMut,
}

pub const AUTHENTICATION: u8 = b'R';
pub const BACKEND_KEY_DATA: u8 = b'K';
pub const PARAMETER_STATUS: u8 = b'S';
pub const READY_FOR_QUERY: u8 = b'Z';
pub const ROW_DESCRIPTION: u8 = b'T';
pub const DATA_ROW: u8 = b'D';
pub const COMMAND_COMPLETE: u8 = b'C';
pub const ERROR_RESPONSE: u8 = b'E';
pub const NOTICE_RESPONSE: u8 = b'N';
pub const PARSE_COMPLETE: u8 = b'1';
pub const BIND_COMPLETE: u8 = b'2';
pub const CLOSE_COMPLETE: u8 = b'3';
pub const NO_DATA: u8 = b'n';
pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
pub const PARAMETER_DESCRIPTION: u8 = b't';
pub const PORTAL_SUSPENDED: u8 = b's';

/// Reads one framed backend message off the socket.
pub async fn read_backend(socket: &mut BoxSocket) -> Result<Backend> {
    let mut header = [0u8; 5];
    socket
        .read_exact(&mut header)
        .await
        .map_err(Error::ConnectionLost)?;

    let tag = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len < 4 {
        return Err(Error::protocol("message length shorter than its own header"));
    }

    let mut body = BytesMut::zeroed(len - 4);
    socket
        .read_exact(&mut body)
        .await
        .map_err(Error::ConnectionLost)?;

    Ok(Backend { tag, body })
}

/// Appends one framed frontend message (tag + length + payload) to `out`.
fn write_framed(out: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        out.put_u8(tag);
    }
    let len_pos = out.len();
    out.put_u32(0);
    let body_start = out.len();
    body(out);
    let len = (out.len() - body_start + 4) as u32;
    out[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

pub fn encode_startup(out: &mut BytesMut, user: &str, database: Option<&str>, params: &BTreeMap<String, String>) {
    write_framed(out, None, |out| {
        out.put_u32(196608); // protocol version 3.0
        put_cstr_pair(out, "user", user);
        if let Some(db) = database {
            put_cstr_pair(out, "database", db);
        }
        for (k, v) in params {
            put_cstr_pair(out, k, v);
        }
        out.put_u8(0);
    });
}

pub fn encode_password(out: &mut BytesMut, password: &str) {
    write_framed(out, Some(b'p'), |out| {
        put_cstr(out, password);
    });
}

pub fn encode_simple_query(out: &mut BytesMut, sql: &str) {
    write_framed(out, Some(b'Q'), |out| {
        put_cstr(out, sql);
    });
}

pub fn encode_parse(out: &mut BytesMut, statement_name: &str, sql: &str) {
    write_framed(out, Some(b'P'), |out| {
        put_cstr(out, statement_name);
        put_cstr(out, sql);
        out.put_u16(0); // infer all parameter types
    });
}

pub fn encode_bind(out: &mut BytesMut, portal: &str, statement_name: &str, params: &[Option<Vec<u8>>]) {
    write_framed(out, Some(b'B'), |out| {
        put_cstr(out, portal);
        put_cstr(out, statement_name);
        out.put_u16(1); // one parameter format code for all params
        out.put_u16(0); // text
        out.put_u16(params.len() as u16);
        for param in params {
            match param {
                Some(bytes) => {
                    out.put_u32(bytes.len() as u32);
                    out.put_slice(bytes);
                }
                None => out.put_i32(-1),
            }
        }
        out.put_u16(1); // one result format code
        out.put_u16(0); // text
    });
}

pub fn encode_describe_portal(out: &mut BytesMut, portal: &str) {
    write_framed(out, Some(b'D'), |out| {
        out.put_u8(b'P');
        put_cstr(out, portal);
    });
}

pub fn encode_execute(out: &mut BytesMut, portal: &str, max_rows: u32) {
    write_framed(out, Some(b'E'), |out| {
        put_cstr(out, portal);
        out.put_u32(max_rows);
    });
}

pub fn encode_close_statement(out: &mut BytesMut, statement_name: &str) {
    write_framed(out, Some(b'C'), |out| {
        out.put_u8(b'S');
        put_cstr(out, statement_name);
    });
}

pub fn encode_sync(out: &mut BytesMut) {
    write_framed(out, Some(b'S'), |_| {});
}

pub fn encode_terminate(out: &mut BytesMut) {
    write_framed(out, Some(b'X'), |_| {});
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn put_cstr_pair(out: &mut BytesMut, key: &str, value: &str) {
    put_cstr(out, key);
    put_cstr(out, value);
}

/// A decoded `RowDescription`: just the column names, in order. The driver
/// doesn't track per-column type OIDs; every value comes back over the
/// wire as text and is decoded on demand by [`crate::value::FromValue`].
pub fn decode_row_description(mut body: BytesMut) -> Result<Vec<String>> {
    let count = body.get_u16();
    let mut columns = Vec::with_capacity(count as usize);
    for _ in 0..count {
        columns.push(take_cstr(&mut body)?);
        body.advance(4 + 2 + 4 + 2 + 4 + 2); // table oid, attnum, type oid, typlen, typmod, format
    }
    Ok(columns)
}

pub fn decode_data_row(mut body: BytesMut) -> Result<Vec<Option<Vec<u8>>>> {
    let count = body.get_u16();
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = body.get_i32();
        if len < 0 {
            values.push(None);
        } else {
            let len = len as usize;
            values.push(Some(body.split_to(len).to_vec()));
        }
    }
    Ok(values)
}

pub fn decode_command_complete(mut body: BytesMut) -> Result<String> {
    take_cstr(&mut body)
}

/// Severity, SQLSTATE code, and message text from an `ErrorResponse` or
/// `NoticeResponse` field list (`\0`-terminated `<byte><string>` pairs,
/// terminated by a final `\0`).
pub fn decode_fields(mut body: BytesMut) -> Result<BTreeMap<u8, String>> {
    let mut fields = BTreeMap::new();
    loop {
        if body.is_empty() {
            return Err(Error::protocol("error/notice response missing terminator"));
        }
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        fields.insert(field_type, take_cstr(&mut body)?);
    }
    Ok(fields)
}

fn take_cstr(buf: &mut BytesMut) -> Result<String> {
    let nul = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::protocol("missing null terminator in message"))?;
    let bytes = buf.split_to(nul);
    buf.advance(1);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::protocol(format!("non-utf8 string: {e}")))
}
