use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Largest frame accepted by default, newline included.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024;

/// Reads the next frame with its line ending stripped.
///
/// Returns `Ok(None)` once the peer has closed its side. A frame longer than
/// `max_bytes` without a newline is rejected with `InvalidData`, and bytes that
/// are not valid UTF-8 are replaced rather than refused.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    // An unterminated tail shorter than the limit is the last frame before EOF.
    if buf.last() != Some(&b'\n') && bytes >= max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {max_bytes} bytes"),
        ));
    }

    let decoded = String::from_utf8_lossy(&buf);
    Ok(Some(decoded.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes `text` followed by a newline and flushes so peers see it promptly.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(text.len() + 1);
    encoded.extend_from_slice(text.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
