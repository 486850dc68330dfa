//! Read and write extension traits for the big-endian primitive encoding shared by the
//! wire protocol and the region file format.

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use std::io::{self, Read, Write};


/// Extension trait for reading big-endian protocol primitives.
pub trait ReadWireExt: Read {

    #[inline]
    fn read_byte(&mut self) -> io::Result<i8> {
        ReadBytesExt::read_i8(self)
    }

    #[inline]
    fn read_ubyte(&mut self) -> io::Result<u8> {
        ReadBytesExt::read_u8(self)
    }

    #[inline]
    fn read_short(&mut self) -> io::Result<i16> {
        ReadBytesExt::read_i16::<BE>(self)
    }

    #[inline]
    fn read_int(&mut self) -> io::Result<i32> {
        ReadBytesExt::read_i32::<BE>(self)
    }

    #[inline]
    fn read_long(&mut self) -> io::Result<i64> {
        ReadBytesExt::read_i64::<BE>(self)
    }

    #[inline]
    fn read_float(&mut self) -> io::Result<f32> {
        ReadBytesExt::read_f32::<BE>(self)
    }

    #[inline]
    fn read_double(&mut self) -> io::Result<f64> {
        ReadBytesExt::read_f64::<BE>(self)
    }

    #[inline]
    fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_ubyte()? != 0)
    }

    /// Read a string prefixed by its length in UTF-16 code units, the string is rejected
    /// if its length is negative or greater than `max_len`.
    fn read_string16(&mut self, max_len: usize) -> io::Result<String> {

        let len = self.read_short()?;
        if len < 0 {
            return Err(new_invalid_data_err("negative string length"));
        } else if len as usize > max_len {
            return Err(new_invalid_data_err("string exceeds its maximum length"));
        }

        let mut units = Vec::with_capacity(len as usize);
        for _ in 0..len {
            units.push(ReadBytesExt::read_u16::<BE>(self)?);
        }

        Ok(char::decode_utf16(units)
            .map(|res| res.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())

    }

}

/// Extension trait for writing big-endian protocol primitives.
pub trait WriteWireExt: Write {

    #[inline]
    fn write_byte(&mut self, b: i8) -> io::Result<()> {
        WriteBytesExt::write_i8(self, b)
    }

    #[inline]
    fn write_ubyte(&mut self, b: u8) -> io::Result<()> {
        WriteBytesExt::write_u8(self, b)
    }

    #[inline]
    fn write_short(&mut self, s: i16) -> io::Result<()> {
        WriteBytesExt::write_i16::<BE>(self, s)
    }

    #[inline]
    fn write_int(&mut self, i: i32) -> io::Result<()> {
        WriteBytesExt::write_i32::<BE>(self, i)
    }

    #[inline]
    fn write_long(&mut self, l: i64) -> io::Result<()> {
        WriteBytesExt::write_i64::<BE>(self, l)
    }

    #[inline]
    fn write_float(&mut self, f: f32) -> io::Result<()> {
        WriteBytesExt::write_f32::<BE>(self, f)
    }

    #[inline]
    fn write_double(&mut self, d: f64) -> io::Result<()> {
        WriteBytesExt::write_f64::<BE>(self, d)
    }

    #[inline]
    fn write_bool(&mut self, b: bool) -> io::Result<()> {
        self.write_ubyte(b as u8)
    }

    /// Write a string prefixed by its length in UTF-16 code units. The string is 
    /// rejected if longer than `max_len` code units, so that whatever is written can
    /// be read back by the peer with the same limit.
    fn write_string16(&mut self, s: &str, max_len: usize) -> io::Result<()> {
        
        let len = s.encode_utf16().count();
        if len > max_len || len > i16::MAX as usize {
            return Err(new_invalid_data_err("string exceeds its maximum length"));
        }
        
        self.write_short(len as i16)?;
        for unit in s.encode_utf16() {
            WriteBytesExt::write_u16::<BE>(self, unit)?;
        }

        Ok(())

    }

}

impl<R: Read + ?Sized> ReadWireExt for R {}
impl<W: Write + ?Sized> WriteWireExt for W {}


/// Return an invalid data io error with specific message.
fn new_invalid_data_err(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
