use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Message, NetworkError, Result};

/// Writes one protocol line and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut line = message.to_string();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Longest protocol line accepted, terminator included.
pub const MAX_LINE_BYTES: u64 = 1024 * 1024;

/// Reads the next non-empty line with the terminator stripped. `None` means
/// the peer closed the stream. A line longer than [`MAX_LINE_BYTES`] is a
/// protocol error and leaves the stream unusable.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    read_bounded_line(reader, MAX_LINE_BYTES).await
}

async fn read_bounded_line<R>(reader: &mut R, limit: u64) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader).take(limit).read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if read as u64 == limit && !line.ends_with('\n') {
            return Err(NetworkError::Protocol(format!(
                "line longer than {} bytes",
                limit
            )));
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn lines_round_trip_over_a_pipe() {
        let (client, server) = tokio::io::duplex(256);
        let (_, mut writer) = tokio::io::split(client);
        let (reader, _) = tokio::io::split(server);
        let mut reader = BufReader::new(reader);

        write_message(&mut writer, &Message::StoreAck("a.txt".into())).await.unwrap();
        writer.write_all(b"\n\nACK\r\n").await.unwrap();
        drop(writer);

        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("STORE_ACK a.txt"));
        assert_eq!(read_line(&mut reader).await.unwrap().as_deref(), Some("ACK"));
    }

    #[tokio::test]
    async fn overlong_line_is_a_protocol_error() {
        let (client, server) = tokio::io::duplex(256);
        let (_, mut writer) = tokio::io::split(client);
        let (reader, _) = tokio::io::split(server);
        let mut reader = BufReader::new(reader);

        writer.write_all(b"LIST a\n").await.unwrap();
        writer.write_all(&[b'x'; 40]).await.unwrap();
        drop(writer);

        assert_eq!(
            read_bounded_line(&mut reader, 16).await.unwrap().as_deref(),
            Some("LIST a")
        );
        assert!(matches!(
            read_bounded_line(&mut reader, 16).await,
            Err(NetworkError::Protocol(_))
        ));
    }
}
