use bytes::{Bytes, BytesMut, BufMut};
use uuid::Uuid;

use crate::Error;

/// Tag byte stored in a field's `type` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Null,
    Dword,
    Data,
    Wstring,
    Guid,
}

impl FieldType {
    const NULL: u32 = 0;
    const DWORD: u32 = 1;
    const DATA: u32 = 2;
    const WSTRING: u32 = 3;
    const GUID: u32 = 4;

    fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            Self::NULL => Self::Null,
            Self::DWORD => Self::Dword,
            Self::DATA => Self::Data,
            Self::WSTRING => Self::Wstring,
            Self::GUID => Self::Guid,
            _ => return None,
        })
    }

    fn raw(self) -> u32 {
        match self {
            Self::Null => Self::NULL,
            Self::Dword => Self::DWORD,
            Self::Data => Self::DATA,
            Self::Wstring => Self::WSTRING,
            Self::Guid => Self::GUID,
        }
    }
}

const HEADER_LEN: u32 = 8;

/// Builds a packet one field at a time.
///
/// The outer `{type, value_length}` header is written up front with a
/// placeholder length and patched in place as fields are appended, mirroring
/// the running-length-update approach of the format this codec replaces.
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new(packet_type: u32) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32_le(packet_type);
        buf.put_u32_le(0);
        Self { buf }
    }

    fn bump_value_length(&mut self, n: u32) {
        let current = u32::from_le_bytes(self.buf[4..8].try_into().unwrap());
        self.buf[4..8].copy_from_slice(&(current + n).to_le_bytes());
    }

    fn push_header(&mut self, field_type: FieldType, value_len: u32) {
        self.buf.put_u32_le(field_type.raw());
        self.buf.put_u32_le(value_len);
        self.bump_value_length(HEADER_LEN + value_len);
    }

    pub fn append_null(&mut self) -> &mut Self {
        self.push_header(FieldType::Null, 0);
        self
    }

    pub fn append_dword(&mut self, value: u32) -> &mut Self {
        self.push_header(FieldType::Dword, 4);
        self.buf.put_u32_le(value);
        self
    }

    pub fn append_data(&mut self, data: &[u8]) -> &mut Self {
        self.push_header(FieldType::Data, data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    pub fn append_wstring(&mut self, value: &str) -> &mut Self {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.push_header(FieldType::Wstring, (units.len() * 2) as u32);
        for unit in units {
            self.buf.put_u16_le(unit);
        }
        self
    }

    pub fn append_guid(&mut self, value: &Uuid) -> &mut Self {
        self.push_header(FieldType::Guid, 16);
        self.buf.put_slice(value.as_bytes());
        self
    }

    pub fn append_guid_opt(&mut self, value: Option<&Uuid>) -> &mut Self {
        match value {
            Some(guid) => self.append_guid(guid),
            None => self.append_null(),
        }
    }

    pub fn append_data_opt(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(data) => self.append_data(data),
            None => self.append_null(),
        }
    }

    pub fn append_wstring_opt(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(s) => self.append_wstring(s),
            None => self.append_null(),
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

struct Field<'a> {
    field_type: FieldType,
    value: &'a [u8],
}

/// Reads fields out of a previously-serialised packet by 0-based index.
///
/// Borrows from the input buffer rather than copying it; `get_data` and
/// `get_wstring` hand back slices/strings sized from the wire, not from
/// any caller-provided buffer.
pub struct PacketReader<'a> {
    packet_type: u32,
    fields: Vec<Field<'a>>,
}

impl<'a> PacketReader<'a> {
    /// # Test
    ///
    /// ```
    /// use peer8_codec::{PacketReader, PacketWriter};
    ///
    /// let mut w = PacketWriter::new(6);
    /// w.append_dword(42).append_data(b"hello");
    /// let bytes = w.finish();
    ///
    /// let r = PacketReader::new(&bytes).unwrap();
    /// assert_eq!(r.packet_type(), 6);
    /// assert_eq!(r.num_fields(), 2);
    /// assert_eq!(r.get_dword(0).unwrap(), 42);
    /// assert_eq!(r.get_data(1).unwrap(), b"hello");
    /// ```
    pub fn new(bytes: &'a [u8]) -> Result<Self, Error> {
        if (bytes.len() as u32) < HEADER_LEN {
            return Err(Error::Incomplete);
        }

        let packet_type = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let value_length = u32::from_le_bytes(bytes[4..8].try_into().unwrap());

        if (bytes.len() as u32) < HEADER_LEN + value_length {
            return Err(Error::Incomplete);
        }

        let mut at = &bytes[8..8 + value_length as usize];
        let mut fields = Vec::new();

        while !at.is_empty() {
            if (at.len() as u32) < HEADER_LEN {
                return Err(Error::Malformed);
            }

            let raw_type = u32::from_le_bytes(at[0..4].try_into().unwrap());
            let field_len = u32::from_le_bytes(at[4..8].try_into().unwrap());
            let field_type = FieldType::from_raw(raw_type).ok_or(Error::Malformed)?;

            if (at.len() as u32) < HEADER_LEN + field_len {
                return Err(Error::Malformed);
            }

            let (_, rest) = at.split_at(8);
            let (value, rest) = rest.split_at(field_len as usize);

            fields.push(Field { field_type, value });
            at = rest;
        }

        Ok(Self {
            packet_type,
            fields,
        })
    }

    pub fn packet_type(&self) -> u32 {
        self.packet_type
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    fn field(&self, index: usize) -> Result<&Field<'a>, Error> {
        self.fields.get(index).ok_or(Error::MissingField)
    }

    pub fn is_null(&self, index: usize) -> Result<bool, Error> {
        Ok(self.field(index)?.field_type == FieldType::Null)
    }

    pub fn get_dword(&self, index: usize) -> Result<u32, Error> {
        let field = self.field(index)?;

        if field.field_type != FieldType::Dword {
            return Err(Error::TypeMismatch);
        }

        if field.value.len() != 4 {
            return Err(Error::Malformed);
        }

        Ok(u32::from_le_bytes(field.value.try_into().unwrap()))
    }

    pub fn get_data(&self, index: usize) -> Result<&'a [u8], Error> {
        let field = self.field(index)?;

        if field.field_type != FieldType::Data {
            return Err(Error::TypeMismatch);
        }

        Ok(field.value)
    }

    pub fn get_wstring(&self, index: usize) -> Result<String, Error> {
        let field = self.field(index)?;

        if field.field_type != FieldType::Wstring {
            return Err(Error::TypeMismatch);
        }

        if field.value.len() % 2 != 0 {
            return Err(Error::Malformed);
        }

        let units: Vec<u16> = field
            .value
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();

        Ok(String::from_utf16_lossy(&units))
    }

    pub fn get_guid(&self, index: usize) -> Result<Uuid, Error> {
        let field = self.field(index)?;

        if field.field_type != FieldType::Guid {
            return Err(Error::TypeMismatch);
        }

        if field.value.len() != 16 {
            return Err(Error::Malformed);
        }

        Ok(Uuid::from_slice(field.value).expect("length checked above"))
    }

    pub fn get_guid_opt(&self, index: usize) -> Result<Option<Uuid>, Error> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.get_guid(index)?))
        }
    }

    pub fn get_data_opt(&self, index: usize) -> Result<Option<&'a [u8]>, Error> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.get_data(index)?))
        }
    }

    pub fn get_wstring_opt(&self, index: usize) -> Result<Option<String>, Error> {
        if self.is_null(index)? {
            Ok(None)
        } else {
            Ok(Some(self.get_wstring(index)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_field_types() {
        let guid = Uuid::new_v4();

        let mut w = PacketWriter::new(99);
        w.append_null()
            .append_dword(7)
            .append_data(b"payload")
            .append_wstring("hello")
            .append_guid(&guid);
        let bytes = w.finish();

        let r = PacketReader::new(&bytes).unwrap();
        assert_eq!(r.packet_type(), 99);
        assert_eq!(r.num_fields(), 5);
        assert!(r.is_null(0).unwrap());
        assert_eq!(r.get_dword(1).unwrap(), 7);
        assert_eq!(r.get_data(2).unwrap(), b"payload");
        assert_eq!(r.get_wstring(3).unwrap(), "hello");
        assert_eq!(r.get_guid(4).unwrap(), guid);
    }

    #[test]
    fn extra_trailing_bytes_are_ignored() {
        let mut w = PacketWriter::new(1);
        w.append_dword(1);
        let mut bytes = w.finish().to_vec();
        bytes.extend_from_slice(b"garbage-after-the-declared-value");

        let r = PacketReader::new(&bytes).unwrap();
        assert_eq!(r.num_fields(), 1);
        assert_eq!(r.get_dword(0).unwrap(), 1);
    }

    #[test]
    fn zero_length_data_and_wstring_are_valid() {
        let mut w = PacketWriter::new(1);
        w.append_data(b"").append_wstring("");
        let bytes = w.finish();

        let r = PacketReader::new(&bytes).unwrap();
        assert_eq!(r.get_data(0).unwrap(), b"");
        assert_eq!(r.get_wstring(1).unwrap(), "");
    }

    #[test]
    fn dword_with_wrong_length_is_malformed() {
        // Hand-craft a DWORD field whose declared length is 3, not 4.
        let mut raw = Vec::new();
        raw.extend_from_slice(&1u32.to_le_bytes()); // packet type
        raw.extend_from_slice(&11u32.to_le_bytes()); // value_length
        raw.extend_from_slice(&FieldType::Dword.raw().to_le_bytes());
        raw.extend_from_slice(&3u32.to_le_bytes());
        raw.extend_from_slice(&[0u8; 3]);

        let r = PacketReader::new(&raw).unwrap();
        assert!(matches!(r.get_dword(0), Err(Error::Malformed)));
    }

    #[test]
    fn incomplete_header_is_rejected() {
        assert!(matches!(
            PacketReader::new(&[0u8; 4]),
            Err(Error::Incomplete)
        ));
    }

    #[test]
    fn missing_field_index_is_rejected() {
        let mut w = PacketWriter::new(1);
        w.append_dword(1);
        let bytes = w.finish();

        let r = PacketReader::new(&bytes).unwrap();
        assert!(matches!(r.get_dword(5), Err(Error::MissingField)));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut w = PacketWriter::new(1);
        w.append_dword(1);
        let bytes = w.finish();

        let r = PacketReader::new(&bytes).unwrap();
        assert!(matches!(r.get_data(0), Err(Error::TypeMismatch)));
    }
}
