//! Helpers for explicit network byte-order conversions.
//!
//! The default codec writes its type tag and length prefix big-endian. These
//! helpers keep the Clippy expectations for that scoped to one place.

/// Size in bytes of a `u32` header field on the wire.
pub const HEADER_FIELD_SIZE: usize = 4;

/// Serialise a `u32` in network byte order (big-endian).
///
/// # Examples
///
/// ```
/// use wirelink::byte_order::write_network_u32;
///
/// assert_eq!(write_network_u32(0x1234_5678), [0x12, 0x34, 0x56, 0x78]);
/// ```
#[must_use]
pub fn write_network_u32(value: u32) -> [u8; HEADER_FIELD_SIZE] {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    value.to_be_bytes()
}

/// Parse a network-order `u32` from its on-wire representation.
///
/// # Examples
///
/// ```
/// use wirelink::byte_order::read_network_u32;
///
/// assert_eq!(read_network_u32([0x12, 0x34, 0x56, 0x78]), 0x1234_5678);
/// ```
#[must_use]
pub fn read_network_u32(bytes: [u8; HEADER_FIELD_SIZE]) -> u32 {
    #[expect(
        clippy::big_endian_bytes,
        reason = "Network byte order requires big-endian bytes."
    )]
    u32::from_be_bytes(bytes)
}

/// Read the network-order `u32` starting at `offset`, if enough bytes exist.
///
/// # Examples
///
/// ```
/// use wirelink::byte_order::peek_network_u32;
///
/// let buf = [0, 0, 0, 7, 0, 0, 0, 2];
/// assert_eq!(peek_network_u32(&buf, 0), Some(7));
/// assert_eq!(peek_network_u32(&buf, 4), Some(2));
/// assert_eq!(peek_network_u32(&buf, 6), None);
/// ```
#[must_use]
pub fn peek_network_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(HEADER_FIELD_SIZE)?;
    buf.get(offset..end)
        .and_then(|slice| <[u8; HEADER_FIELD_SIZE]>::try_from(slice).ok())
        .map(read_network_u32)
}
