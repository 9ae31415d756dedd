//! `COPY ... FROM STDIN` streaming.
//!
//! The connection task writes the format header itself before the writer is
//! handed out, so caller data can never reach the socket ahead of it. Every
//! chunk is acknowledged only after it was written to the socket, which
//! suspends a producer that outruns the transport.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::sync::oneshot;

use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::types::PgValue;

/// Signature, flags field and header extension length.
pub const BINARY_HEADER: &[u8] = b"PGCOPY\n\xff\r\n\0\0\0\0\0\0\0\0\0";

/// Buffered structured rows are sent once they reach this size.
const ROW_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyFormat {
    #[default]
    Text,
    Binary,
}

impl CopyFormat {
    /// Bytes written before the first caller chunk.
    pub(crate) fn header(self) -> Option<Bytes> {
        match self {
            CopyFormat::Binary => Some(Bytes::from_static(BINARY_HEADER)),
            CopyFormat::Text => None,
        }
    }
}

/// Options for [`PgConnection::copy_from`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CopyOptions {
    pub format: CopyFormat,
    /// Column delimiter for text format (server default is tab)
    pub delimiter: Option<char>,
    /// NULL marker for text format (server default is `\N`)
    pub null: Option<String>,
}

impl CopyOptions {
    pub fn binary() -> Self {
        Self {
            format: CopyFormat::Binary,
            ..Self::default()
        }
    }

    pub fn text() -> Self {
        Self::default()
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn null(mut self, marker: impl Into<String>) -> Self {
        self.null = Some(marker.into());
        self
    }
}

/// What the server reported once the copy completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOutcome {
    /// Rows loaded, from the `COPY n` command tag
    pub rows: u64,
    /// Payload bytes sent, header and trailer included
    pub bytes: u64,
}

pub(crate) fn copy_sql(table: &str, columns: &[&str], options: &CopyOptions) -> String {
    let mut sql = format!("COPY {}", quote_qualified(table));
    if !columns.is_empty() {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(" ({})", cols.join(", ")));
    }
    sql.push_str(" FROM STDIN");

    match options.format {
        CopyFormat::Binary => sql.push_str(" (FORMAT binary)"),
        CopyFormat::Text => {
            let mut opts = vec!["FORMAT text".to_string()];
            if let Some(d) = options.delimiter {
                opts.push(format!("DELIMITER {}", quote_literal(&d.to_string())));
            }
            if let Some(ref null) = options.null {
                opts.push(format!("NULL {}", quote_literal(null)));
            }
            sql.push_str(&format!(" ({})", opts.join(", ")));
        }
    }
    sql
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `schema.table` quotes each part separately.
fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Append one binary copy tuple.
pub(crate) fn encode_binary_row(buf: &mut BytesMut, row: &[PgValue]) {
    buf.put_i16(row.len() as i16);
    for value in row {
        if value.is_null() {
            buf.put_i32(-1);
        } else {
            let encoded = value.encode_binary();
            buf.put_i32(encoded.len() as i32);
            buf.put_slice(&encoded);
        }
    }
}

/// An open copy-in stream.
///
/// The connection runs nothing else until [`finish`](Self::finish) or
/// [`fail`](Self::fail) completes. Dropping an unfinished writer aborts the
/// copy.
pub struct CopyWriter {
    conn: PgConnection,
    format: CopyFormat,
    buf: BytesMut,
    done: Option<oneshot::Receiver<PgResult<CopyOutcome>>>,
}

impl CopyWriter {
    pub(crate) fn new(
        conn: PgConnection,
        format: CopyFormat,
        done: oneshot::Receiver<PgResult<CopyOutcome>>,
    ) -> Self {
        Self {
            conn,
            format,
            buf: BytesMut::new(),
            done: Some(done),
        }
    }

    pub fn format(&self) -> CopyFormat {
        self.format
    }

    /// Send pre-formatted bytes in the stream's format.
    pub async fn write(&mut self, data: &[u8]) -> PgResult<()> {
        self.flush().await?;
        self.conn.copy_data(Bytes::copy_from_slice(data)).await
    }

    /// Serialize one tuple in binary copy format.
    ///
    /// Values must match the column types exactly; the server does not
    /// coerce binary input.
    pub async fn write_row(&mut self, row: &[PgValue]) -> PgResult<()> {
        if self.format != CopyFormat::Binary {
            return Err(PgError::State(
                "write_row requires a binary copy; use write() for text".to_string(),
            ));
        }
        encode_binary_row(&mut self.buf, row);
        if self.buf.len() >= ROW_CHUNK {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send buffered rows.
    pub async fn flush(&mut self) -> PgResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.conn.copy_data(chunk).await
    }

    /// Write the trailer, end the copy and wait for the server's verdict.
    pub async fn finish(mut self) -> PgResult<CopyOutcome> {
        if self.format == CopyFormat::Binary {
            self.buf.put_i16(-1);
        }
        let flushed = self.flush().await;
        let Some(done) = self.done.take() else {
            return Err(PgError::State("copy already finished".to_string()));
        };
        self.conn.copy_done();

        let outcome = done
            .await
            .map_err(|_| PgError::ConnectionLost("connection task ended".to_string()))?;
        // A server-side error explains a failed write better than the write error
        match (outcome, flushed) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(outcome), Ok(())) => Ok(outcome),
        }
    }

    /// Abort the copy. The server rolls back the rows sent so far.
    pub async fn fail(mut self, reason: &str) -> PgResult<()> {
        let Some(done) = self.done.take() else {
            return Ok(());
        };
        self.conn.copy_fail(reason);
        match done.await {
            Ok(Err(e)) if e.is_connection_lost() => Err(e),
            Err(_) => Err(PgError::ConnectionLost("connection task ended".to_string())),
            _ => Ok(()),
        }
    }
}

impl Drop for CopyWriter {
    fn drop(&mut self) {
        if self.done.is_some() {
            log::warn!("copy writer dropped without finish(); aborting the copy");
            self.conn.copy_fail("copy writer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_header_layout() {
        assert_eq!(BINARY_HEADER.len(), 19);
        assert_eq!(&BINARY_HEADER[..11], b"PGCOPY\n\xff\r\n\0");
        assert!(BINARY_HEADER[11..].iter().all(|b| *b == 0));
        assert!(CopyFormat::Text.header().is_none());
    }

    #[test]
    fn test_copy_sql() {
        assert_eq!(
            copy_sql("public.items", &["id", "name"], &CopyOptions::binary()),
            "COPY \"public\".\"items\" (\"id\", \"name\") FROM STDIN (FORMAT binary)"
        );
        assert_eq!(
            copy_sql("t", &[], &CopyOptions::text().delimiter(',').null("")),
            "COPY \"t\" FROM STDIN (FORMAT text, DELIMITER ',', NULL '')"
        );
    }

    #[test]
    fn test_binary_row_encoding() {
        let mut buf = BytesMut::new();
        encode_binary_row(&mut buf, &[PgValue::Int4(5), PgValue::Null]);
        assert_eq!(
            &buf[..],
            &[0, 2, 0, 0, 0, 4, 0, 0, 0, 5, 0xff, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_options_deserialize() {
        let opts: CopyOptions = serde_json::from_str(r#"{"format": "binary"}"#).unwrap();
        assert_eq!(opts.format, CopyFormat::Binary);
        assert_eq!(opts.delimiter, None);
    }
}
