//! PostgreSQL type identifiers and typed values.
//!
//! Values are encoded in binary format for parameters and copy tuples, and
//! decoded from either format depending on what the server sent.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use super::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    /// Microseconds since 2000-01-01
    Timestamp(i64),
    /// Days since 2000-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    Json(String),
    /// Types without a dedicated variant keep their raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Encode this value to binary format.
    ///
    /// `Null` encodes to nothing; callers write the -1 length marker themselves.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => Vec::new(),
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) | PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) | PgValue::Timestamp(v) | PgValue::Time(v) => {
                v.to_be_bytes().to_vec()
            }
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Json(v) => {
                // JSONB binary format is a version byte followed by the text
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            // Let the server infer the type of a bare NULL
            PgValue::Null => Oid(0),
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let value = match oid {
            Oid::BOOL => PgValue::Bool(fixed::<1>(oid, data)?[0] != 0),
            Oid::INT2 => PgValue::Int2(i16::from_be_bytes(fixed(oid, data)?)),
            Oid::INT4 => PgValue::Int4(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::INT8 => PgValue::Int8(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(fixed(oid, data)?)),
            Oid::DATE => PgValue::Date(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => {
                PgValue::Timestamp(i64::from_be_bytes(fixed(oid, data)?))
            }
            Oid::TIME => PgValue::Time(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::UUID => PgValue::Uuid(fixed(oid, data)?),
            Oid::BYTEA => PgValue::Bytea(data.to_vec()),
            Oid::JSON => PgValue::Json(utf8(oid, data)?),
            Oid::JSONB => PgValue::Json(utf8(oid, data.get(1..).unwrap_or_default())?),
            _ if oid.is_text_like() => PgValue::Text(utf8(oid, data)?),
            _ => PgValue::Raw {
                oid,
                data: data.to_vec(),
            },
        };
        Ok(value)
    }

    /// Decode from text format (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = utf8(oid, data)?;

        fn parse<T: std::str::FromStr>(oid: Oid, text: &str) -> PgResult<T>
        where
            T::Err: std::fmt::Display,
        {
            text.parse::<T>()
                .map_err(|e| PgError::Type(format!("Invalid value for OID {}: {}", oid.0, e)))
        }

        let value = match oid {
            Oid::BOOL => PgValue::Bool(matches!(text.as_str(), "t" | "true" | "1")),
            Oid::INT2 => PgValue::Int2(parse(oid, &text)?),
            Oid::INT4 => PgValue::Int4(parse(oid, &text)?),
            Oid::INT8 => PgValue::Int8(parse(oid, &text)?),
            Oid::FLOAT4 => PgValue::Float4(parse(oid, &text)?),
            Oid::FLOAT8 => PgValue::Float8(parse(oid, &text)?),
            Oid::JSON | Oid::JSONB => PgValue::Json(text),
            _ => PgValue::Text(text),
        };
        Ok(value)
    }

    /// Borrow the value as text, if it is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) | PgValue::Json(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any integer variant to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
    data.try_into().map_err(|_| {
        PgError::Type(format!(
            "Invalid length {} for OID {} (expected {})",
            data.len(),
            oid.0,
            N
        ))
    })
}

fn utf8(oid: Oid, data: &[u8]) -> PgResult<String> {
    String::from_utf8(data.to_vec())
        .map_err(|e| PgError::Type(format!("Invalid UTF-8 for OID {}: {}", oid.0, e)))
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}
