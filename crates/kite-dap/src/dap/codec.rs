//! DAP wire framing: an HTTP-like header section followed by a JSON body.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use std::io::{self, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::{MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};

/// Read one framed message body. `Ok(None)` means a clean EOF before any
/// header byte.
pub async fn read_raw_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header_line = false;

    loop {
        let mut line = Vec::new();
        let read = (&mut *reader)
            .take(MAX_DAP_HEADER_LINE_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            if !saw_header_line {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF while reading DAP headers",
            ));
        }
        if line.len() > MAX_DAP_HEADER_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "DAP header line exceeds maximum size ({MAX_DAP_HEADER_LINE_BYTES} bytes)"
                ),
            ));
        }
        saw_header_line = true;

        let line = String::from_utf8(line)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "DAP header is not UTF-8"))?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|err| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid Content-Length {value:?}: {err}"),
                    )
                })?);
            }
        }
    }

    let Some(content_length) = content_length else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "DAP message missing Content-Length header",
        ));
    };

    if content_length > MAX_DAP_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "DAP message Content-Length {content_length} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            ),
        ));
    }

    let mut buf = vec![0u8; content_length];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub fn write_raw_message<W: Write>(writer: &mut W, json_bytes: &[u8]) -> io::Result<()> {
    write!(writer, "Content-Length: {}\r\n\r\n", json_bytes.len())?;
    writer.write_all(json_bytes)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[tokio::test]
    async fn roundtrips_a_framed_message() {
        let msg = json!({ "seq": 1, "type": "request", "command": "initialize" });
        let payload = serde_json::to_vec(&msg).unwrap();

        let mut framed = Vec::new();
        write_raw_message(&mut framed, &payload).unwrap();
        assert!(framed.starts_with(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes()));

        let mut cursor = Cursor::new(framed);
        let body = read_raw_message(&mut cursor).await.unwrap().unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn accepts_additional_headers() {
        let payload = br#"{"seq":1,"type":"request","command":"threads"}"#;
        let framed = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );
        let mut cursor = Cursor::new(framed.into_bytes());
        let body = read_raw_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(body, payload);
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_raw_message(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_headers_is_an_error() {
        let mut cursor = Cursor::new(b"Content-Length: 2\r\n".to_vec());
        let err = read_raw_message(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rejects_oversized_content_length_without_allocating() {
        let framed = format!("Content-Length: {}\r\n\r\n", MAX_DAP_MESSAGE_BYTES + 1);
        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_raw_message(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("exceeds maximum allowed size"));
    }

    #[tokio::test]
    async fn rejects_overlong_header_lines() {
        let long = "A".repeat(MAX_DAP_HEADER_LINE_BYTES + 1);
        let framed = format!("{long}\r\n\r\n");
        let mut cursor = Cursor::new(framed.into_bytes());
        let err = read_raw_message(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
