use bytes::Buf;
use std::io;

fn unexpected_eof(expected: usize, remaining: usize) -> io::Error {
  io::Error::new(
    io::ErrorKind::UnexpectedEof,
    format!("expected {} more bytes, {} remaining", expected, remaining),
  )
}

/// MySQL wire primitives on top of `bytes::Buf`, with bounds-checked reads.
pub trait BufExt: Buf {
  fn mysql_get_u8(&mut self) -> io::Result<u8> {
    if self.remaining() < 1 {
      return Err(unexpected_eof(1, self.remaining()));
    }
    Ok(self.get_u8())
  }

  fn mysql_get_uint_le(&mut self, nbytes: usize) -> io::Result<u64> {
    if self.remaining() < nbytes {
      return Err(unexpected_eof(nbytes, self.remaining()));
    }
    Ok(self.get_uint_le(nbytes))
  }

  fn mysql_get_uint_be(&mut self, nbytes: usize) -> io::Result<u64> {
    if self.remaining() < nbytes {
      return Err(unexpected_eof(nbytes, self.remaining()));
    }
    Ok(self.get_uint(nbytes))
  }

  fn mysql_get_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
    if self.remaining() < len {
      return Err(unexpected_eof(len, self.remaining()));
    }
    let mut buffer = vec![0; len];
    self.copy_to_slice(&mut buffer);
    Ok(buffer)
  }

  // https://dev.mysql.com/doc/internals/en/integer.html#packet-Protocol::LengthEncodedInteger
  fn mysql_get_lenc_uint(&mut self) -> io::Result<u64> {
    match self.mysql_get_u8()? {
      0xfc => self.mysql_get_uint_le(2),
      0xfd => self.mysql_get_uint_le(3),
      0xfe => self.mysql_get_uint_le(8),
      0xff => Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "invalid length-encoded integer prefix 0xff",
      )),
      byte => Ok(byte as u64),
    }
  }

  fn mysql_get_lenc_bytes(&mut self) -> io::Result<Vec<u8>> {
    let len = self.mysql_get_lenc_uint()?;
    self.mysql_get_bytes(len as usize)
  }

  fn mysql_get_lenc_string(&mut self) -> io::Result<String> {
    let buffer = self.mysql_get_lenc_bytes()?;
    String::from_utf8(buffer).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
  }

  fn mysql_get_fixed_length_string(&mut self, len: usize) -> io::Result<String> {
    let buffer = self.mysql_get_bytes(len)?;
    String::from_utf8(buffer).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
  }
}

impl<T: Buf> BufExt for T {}
