use byteorder::{BigEndian, ByteOrder as _, WriteBytesExt as _};
use std::io::{Read, Write};

// An internal struct to make it easier to read from and write into a socket.
#[derive(Debug)]
pub struct Socket<T> {
    inner: T,
}

impl<T> Socket<T>
where
    T: Read + Write,
{
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn message_writer(&mut self) -> MessageWriter<T> {
        MessageWriter {
            socket: self,
            buf: Vec::new(),
        }
    }

    pub fn message_reader(&mut self) -> std::io::Result<MessageReader<T>> {
        let size = usize::from(self.read_u16()?);
        Ok(MessageReader { socket: self, size })
    }

    pub fn write_u16(&mut self, v: u16) -> std::io::Result<()> {
        let mut buf = [0; 2];
        BigEndian::write_u16(&mut buf, v);
        self.inner.write_all(&buf)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        let mut buf = [0; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> std::io::Result<u16> {
        let mut buf = [0; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(BigEndian::read_u16(&buf))
    }

    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        let mut buf = [0; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(BigEndian::read_u32(&buf))
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf)
    }

    pub fn read_string(&mut self) -> std::io::Result<String> {
        let mut buf = String::new();
        self.inner.read_to_string(&mut buf)?;
        Ok(buf)
    }

    pub fn read_stringn(&mut self, size: usize) -> std::io::Result<String> {
        let mut buf = vec![0; size];
        self.inner.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )
        })
    }

    pub fn read_u16_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0; usize::from(self.read_u16()?)];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_u16_string(&mut self) -> std::io::Result<String> {
        let buf = self.read_u16_bytes()?;
        String::from_utf8(buf).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "stream did not contain valid UTF-8",
            )
        })
    }
}

// Accumulates one request or handshake message and prefixes it with the
// two-byte big-endian length on `finish()`.
#[derive(Debug)]
pub struct MessageWriter<'a, T> {
    socket: &'a mut Socket<T>,
    buf: Vec<u8>,
}

impl<'a, T> MessageWriter<'a, T>
where
    T: Read + Write,
{
    pub fn finish(self) -> std::io::Result<()> {
        if self.buf.len() > usize::from(u16::MAX) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "too large message: expected less than {} bytes, but got {} bytes",
                    usize::from(u16::MAX) + 1,
                    self.buf.len()
                ),
            ));
        }
        self.socket.write_u16(self.buf.len() as u16)?;
        self.socket.write_all(&self.buf)?;
        self.socket.flush()?;
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> std::io::Result<()> {
        self.buf.write_u8(v)
    }

    pub fn write_u16(&mut self, v: u16) -> std::io::Result<()> {
        self.buf.write_u16::<BigEndian>(v)
    }

    pub fn write_u32(&mut self, v: u32) -> std::io::Result<()> {
        self.buf.write_u32::<BigEndian>(v)
    }

    pub fn write_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.buf.write_u64::<BigEndian>(v)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

// Reads one length-delimited message, refusing to read past its end.
#[derive(Debug)]
pub struct MessageReader<'a, T> {
    socket: &'a mut Socket<T>,
    size: usize,
}

impl<'a, T> MessageReader<'a, T>
where
    T: Read + Write,
{
    pub fn remaining(&self) -> usize {
        self.size
    }

    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        self.size = self.size.checked_sub(1).ok_or_else(unexpected_eof)?;
        self.socket.read_u8()
    }

    pub fn read_u16(&mut self) -> std::io::Result<u16> {
        self.size = self.size.checked_sub(2).ok_or_else(unexpected_eof)?;
        self.socket.read_u16()
    }

    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        self.size = self.size.checked_sub(4).ok_or_else(unexpected_eof)?;
        self.socket.read_u32()
    }

    pub fn read_u64(&mut self) -> std::io::Result<u64> {
        let high = u64::from(self.read_u32()?);
        let low = u64::from(self.read_u32()?);
        Ok((high << 32) | low)
    }

    pub fn read_string(&mut self) -> std::io::Result<String> {
        let n = self.size;
        self.size = 0;
        self.socket.read_stringn(n)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.size = self.size.checked_sub(buf.len()).ok_or_else(unexpected_eof)?;
        self.socket.read_exact(buf)
    }

    pub fn read_u16_string(&mut self) -> std::io::Result<String> {
        let n = usize::from(self.read_u16()?);
        self.size = self.size.checked_sub(n).ok_or_else(unexpected_eof)?;
        self.socket.read_stringn(n)
    }

    pub fn consume_remaining_bytes(&mut self) -> std::io::Result<()> {
        let mut buf = vec![0; self.size];
        self.size = 0;
        self.socket.read_exact(&mut buf)?;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<()> {
        self.consume_remaining_bytes()
    }
}

fn unexpected_eof() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "unexpected eof")
}
