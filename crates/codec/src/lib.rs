//! ## Packet codec
//!
//! A self-describing, type-tagged record format shared by the TCP and UDP
//! transports of a peer-to-peer session. Every packet is an outer TLV chunk
//! whose value is itself a concatenation of field-shaped TLV chunks; this
//! lets old fields keep their index while letting readers skip fields they
//! don't recognise, and keeps decoding free of version negotiation.

pub mod message;
pub mod packet;

pub use message::Message;
pub use packet::{FieldType, PacketReader, PacketWriter};

/// Maximum size, in bytes, of any single packet accepted from the wire.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Debug)]
pub enum Error {
    /// The header or the declared value bytes are not fully present yet.
    Incomplete,
    /// A field doesn't fit inside the outer value, or its length
    /// contradicts its declared type.
    Malformed,
    /// The requested field index is beyond the number of fields present.
    MissingField,
    /// The getter used doesn't match the field's declared type tag.
    TypeMismatch,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
