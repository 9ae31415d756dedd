//! PostgreSQL wire protocol message encoding and decoding.
//!
//! Every message after startup travels in the same envelope: a 1-byte type
//! tag, then a 4-byte big-endian length that counts itself plus the payload.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Size of the envelope header: tag + length.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single backend message, guards against garbage lengths.
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl From<i16> for Format {
    fn from(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages.
pub trait FrontendMessage {
    /// Append the encoded message to `buf`.
    fn encode_to(&self, buf: &mut BytesMut);

    /// Encode into a fresh buffer.
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }
}

/// Write a tagged message whose body is produced by `body`.
///
/// The length is patched in after the body is written.
fn put_tagged(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start (untagged).
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        let len_at = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(buf, "user");
        put_cstr(buf, &self.user);
        if let Some(ref db) = self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }
        for (key, value) in &self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);

        let len = (buf.len() - len_at) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'p', |b| put_cstr(b, &self.password));
    }
}

/// SASL Initial Response message ('p') - first SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        });
    }
}

/// SASL Response message ('p') - subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'p', |b| b.put_slice(&self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in &self.param_types {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [PgValue],
    pub result_format: Format,
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            // One format code applies to every parameter
            b.put_i16(1);
            b.put_i16(Format::Binary as i16);

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                if param.is_null() {
                    b.put_i32(-1);
                } else {
                    let encoded = param.encode_binary();
                    b.put_i32(encoded.len() as i32);
                    b.put_slice(&encoded);
                }
            }

            b.put_i16(1);
            b.put_i16(self.result_format as i16);
        });
    }
}

/// Describe message ('D') - request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Execute message ('E') - executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Sync message ('S') - marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'S', |_| {});
    }
}

/// Terminate message ('X') - close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'X', |_| {});
    }
}

/// CopyData message ('d') - one chunk of a copy-in stream
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'd', |b| b.put_slice(self.data));
    }
}

/// CopyDone message ('c') - end of a copy-in stream
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'c', |_| {});
    }
}

/// CopyFail message ('f') - abort a copy-in stream
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode_to(&self, buf: &mut BytesMut) {
        put_tagged(buf, b'f', |b| put_cstr(b, self.reason));
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Copy-in
    CopyInResponse { format: Format, column_formats: Vec<Format> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Asynchronous notification
    NotificationResponse { process_id: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", len)));
        }
        let len = len as usize;

        if buf.remaining() < len - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let body = buf.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Ok(BackendMessage::ErrorResponse { fields: read_error_fields(body)? }),
            b'N' => Ok(BackendMessage::NoticeResponse { fields: read_error_fields(body)? }),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'G' => Self::decode_copy_in_response(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    /// Whether this message can arrive with no request outstanding.
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self,
            BackendMessage::NotificationResponse { .. }
                | BackendMessage::NoticeResponse { .. }
                | BackendMessage::ParameterStatus { .. }
        )
    }

    fn decode_auth(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 4, "authentication")?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                ensure(&body, 4, "MD5 salt")?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
            _ => Err(PgError::Protocol(format!(
                "Unknown authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 2, "row description")?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            ensure(&body, 18, "field description")?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: Format::from(body.get_i16()),
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 2, "data row")?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            ensure(&body, 4, "column length")?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                ensure(&body, len as usize, "column value")?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> PgResult<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 1, "ready for query")?;
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_parameter_status(mut body: Bytes) -> PgResult<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 8, "backend key data")?;
        Ok(BackendMessage::BackendKeyData {
            process_id: body.get_i32(),
            secret_key: body.get_i32(),
        })
    }

    fn decode_copy_in_response(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 3, "copy in response")?;
        let format = if body.get_u8() == 0 {
            Format::Text
        } else {
            Format::Binary
        };
        let num_cols = body.get_i16().max(0) as usize;
        ensure(&body, num_cols * 2, "copy column formats")?;
        let column_formats = (0..num_cols).map(|_| Format::from(body.get_i16())).collect();
        Ok(BackendMessage::CopyInResponse {
            format,
            column_formats,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 2, "parameter description")?;
        let num_params = body.get_i16().max(0) as usize;
        ensure(&body, num_params * 4, "parameter types")?;
        let type_oids = (0..num_params).map(|_| Oid::from_i32(body.get_i32())).collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> PgResult<Self> {
        ensure(&body, 4, "notification")?;
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

/// Split one complete backend message off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn decode_frame(buf: &mut BytesMut) -> PgResult<Option<BackendMessage>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if length < 4 || length as usize > MAX_MESSAGE_LEN {
        return Err(PgError::Protocol(format!("Invalid message length: {}", length)));
    }

    // type byte + length field value (includes length field itself)
    let total_len = 1 + length as usize;
    if buf.len() < total_len {
        buf.reserve(total_len - buf.len());
        return Ok(None);
    }

    let frame = buf.split_to(total_len).freeze();
    BackendMessage::decode(&mut frame.clone()).map(Some)
}

/// Build a server error from ErrorResponse fields.
pub fn error_from_fields(fields: &HashMap<u8, String>) -> PgError {
    PgError::Server {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ensure(buf: &Bytes, needed: usize, what: &str) -> PgResult<()> {
    if buf.remaining() < needed {
        return Err(PgError::Protocol(format!("Truncated {}", what)));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}
