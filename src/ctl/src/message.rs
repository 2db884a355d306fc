use std::io::{Read, Write, Result};
use byteordered::byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crate::opcodes::*;

const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024; // 64 MB

/// Wire protocol format (same as server):
/// 1. code (u16)
/// 2. queue_length (u32)
/// 3. body_length (u32)
/// 4. queue (bytes)
/// 5. body (bytes)

#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub code: u16,
    pub queue: String,
    pub body: String,
}

impl Message {
    fn new(code: u16, queue: &str, body: &str) -> Self {
        Message {
            code,
            queue: queue.to_string(),
            body: body.to_string(),
        }
    }

    pub fn connect(kind: &str) -> Self {
        Message::new(OP_CONNECT, "", kind)
    }

    pub fn manage(method: &str, argument: &str) -> Self {
        Message::new(OP_MANAGE, method, argument)
    }

    pub fn status() -> Self {
        Message::new(OP_STATUS, "", "")
    }

    pub fn metrics() -> Self {
        Message::new(OP_METRICS, "", "")
    }

    pub fn ping() -> Self {
        Message::new(OP_PING, "", "")
    }

    pub fn declare(queue: &str) -> Self {
        Message::new(OP_DECLARE, queue, "")
    }

    pub fn delete(queue: &str) -> Self {
        Message::new(OP_DELETE, queue, "")
    }

    pub fn enqueue(queue: &str, body: &str) -> Self {
        Message::new(OP_ENQUEUE, queue, body)
    }

    pub fn dequeue(queue: &str) -> Self {
        Message::new(OP_DEQUEUE, queue, "")
    }

    pub fn send<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_u16::<BigEndian>(self.code)?;
        stream.write_u32::<BigEndian>(self.queue.len() as u32)?;
        stream.write_u32::<BigEndian>(self.body.len() as u32)?;

        stream.write_all(self.queue.as_bytes())?;
        stream.write_all(self.body.as_bytes())?;

        stream.flush()?;
        Ok(())
    }

    pub fn receive<R: Read>(stream: &mut R) -> Result<Message> {
        let code = stream.read_u16::<BigEndian>()?;
        let queue_length = stream.read_u32::<BigEndian>()?;
        let body_length = stream.read_u32::<BigEndian>()?;

        // Validate total message size to prevent OOM
        let total_size = queue_length as u64 + body_length as u64;
        if total_size > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message too large: {} bytes (max: {} bytes)", total_size, MAX_MESSAGE_SIZE),
            ));
        }

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
}
