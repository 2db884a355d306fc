use byteordered::byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Result, Write};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt as TokioAsyncReadExt, AsyncWriteExt as TokioAsyncWriteExt};

use crate::opcodes::{OP_ERROR, OP_EMPTY};

/// Wire protocol format:
/// 1. code (u16)
/// 2. queue_length (u32)
/// 3. body_length (u32)
/// 4. queue (bytes)
/// 5. body (bytes)

const HEADER_SIZE: usize = 2 + 4 + 4; // code + queue_len + body_len
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024; // 64 MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub queue: String,
    pub body: String,
}

fn check_size(queue_length: u32, body_length: u32) -> Result<()> {
    let total_size = queue_length as u64 + body_length as u64;
    if total_size > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message too large: {} bytes (max: {} bytes)", total_size, MAX_MESSAGE_SIZE),
        ));
    }
    Ok(())
}

impl Message {
    pub fn new(code: u16, queue: impl Into<String>, body: impl Into<String>) -> Self {
        Message {
            code,
            queue: queue.into(),
            body: body.into(),
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Message::new(OP_ERROR, String::new(), reason)
    }

    pub fn empty(queue: &str) -> Self {
        Message::new(OP_EMPTY, queue, String::new())
    }

    /// Synchronous send for std::io::Write
    pub fn send<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_u16::<BigEndian>(self.code)?;
        stream.write_u32::<BigEndian>(self.queue.len() as u32)?;
        stream.write_u32::<BigEndian>(self.body.len() as u32)?;

        stream.write_all(self.queue.as_bytes())?;
        stream.write_all(self.body.as_bytes())?;

        stream.flush()?;
        Ok(())
    }

    /// Synchronous receive for std::io::Read
    pub fn receive<R: Read>(stream: &mut R) -> Result<Message> {
        let code = stream.read_u16::<BigEndian>()?;
        let queue_length = stream.read_u32::<BigEndian>()?;
        let body_length = stream.read_u32::<BigEndian>()?;
        check_size(queue_length, body_length)?;

        let mut queue = vec![0u8; queue_length as usize];
        stream.read_exact(&mut queue)?;
        let mut body = vec![0u8; body_length as usize];
        stream.read_exact(&mut body)?;

        Ok(Message {
            code,
            queue: String::from_utf8_lossy(&queue).to_string(),
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    /// Async send for tokio::io::AsyncWrite
    pub async fn send_async<W: AsyncWrite + Unpin + Send>(&self, stream: &mut W) -> Result<()> {
        // Build header in buffer using byteorder (synchronous)
        let mut header = [0u8; HEADER_SIZE];
        {
            let mut cursor = Cursor::new(&mut header[..]);
            WriteBytesExt::write_u16::<BigEndian>(&mut cursor, self.code)?;
            WriteBytesExt::write_u32::<BigEndian>(&mut cursor, self.queue.len() as u32)?;
            WriteBytesExt::write_u32::<BigEndian>(&mut cursor, self.body.len() as u32)?;
        }

        TokioAsyncWriteExt::write_all(stream, &header).await?;
        TokioAsyncWriteExt::write_all(stream, self.queue.as_bytes()).await?;
        TokioAsyncWriteExt::write_all(stream, self.body.as_bytes()).await?;

        TokioAsyncWriteExt::flush(stream).await?;
        Ok(())
    }

    /// Async receive for tokio::io::AsyncRead
    pub async fn receive_async<R: AsyncRead + Unpin + Send>(stream: &mut R) -> Result<Message> {
        let mut header = [0u8; HEADER_SIZE];
        TokioAsyncReadExt::read_exact(stream, &mut header).await?;

        let (code, queue_length, body_length) = {
            let mut cursor = Cursor::new(&header[..]);
            let code = ReadBytesExt::read_u16::<BigEndian>(&mut cursor)?;
            let queue_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
            let body_length = ReadBytesExt::read_u32::<BigEndian>(&mut cursor)?;
            (code, queue_length, body_length)
        };
        check_size(queue_length, body_length)?;

        let mut queue = vec![0u8; queue_length as usize];
        TokioAsyncReadExt::read_exact(stream, &mut queue).await?;
        let mut body = vec![0u8; body_length as usize];
        TokioAsyncReadExt::read_exact(stream, &mut body).await?;

        Ok(Message {
            code,
            queue: String::from_utf8_lossy(&queue).to_string(),
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::OP_ENQUEUE;

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        Message::new(OP_ENQUEUE, "q", "hello").send(&mut buf).unwrap();
        assert_eq!(&buf[..2], &OP_ENQUEUE.to_be_bytes());
        assert_eq!(&buf[2..6], &1u32.to_be_bytes());
        assert_eq!(&buf[6..10], &5u32.to_be_bytes());
        assert_eq!(&buf[10..], b"qhello");
    }

    #[test]
    fn test_rejects_oversized_message() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&OP_ENQUEUE.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = Message::receive(&mut Cursor::new(buf)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let message = Message::new(OP_ENQUEUE, "orders", "ünïcode body");
        let mut buf = Vec::new();
        message.send_async(&mut buf).await.unwrap();

        let mut sync_buf = Vec::new();
        message.send(&mut sync_buf).unwrap();
        assert_eq!(buf, sync_buf);

        let mut reader = &buf[..];
        assert_eq!(Message::receive_async(&mut reader).await.unwrap(), message);
    }
}
