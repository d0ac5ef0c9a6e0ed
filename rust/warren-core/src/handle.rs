//! Service handles and textual service addresses.
//!
//! A [`Handle`] is the stable 32-bit identity of a service: the upper 8
//! bits carry the node id (for cross-node routing), the lower 24 bits
//! address a service within the node. Handle `0` is invalid and doubles
//! as the "system" source on runtime-generated messages.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Number of bits addressing a service within one node.
pub const HANDLE_BITS: u32 = 24;

/// Mask selecting the within-node part of a handle.
pub const HANDLE_MASK: u32 = (1 << HANDLE_BITS) - 1;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A 32-bit service identifier: `node_id << 24 | service_index`.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    /// The invalid handle. Never names a live service.
    pub const INVALID: Handle = Handle(0);

    /// Build a handle from its raw 32-bit value.
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    /// Combine a node id with a within-node service index.
    pub const fn assemble(node: u8, index: u32) -> Self {
        Handle((node as u32) << HANDLE_BITS | (index & HANDLE_MASK))
    }

    /// The raw 32-bit value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The node id (upper 8 bits).
    pub const fn node(self) -> u8 {
        (self.0 >> HANDLE_BITS) as u8
    }

    /// The within-node service index (lower 24 bits).
    pub const fn index(self) -> u32 {
        self.0 & HANDLE_MASK
    }

    /// `true` unless this is [`Handle::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Handle {
    /// Renders in the canonical `:xxxxxxxx` address form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{:08x}", self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle(:{:08x})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A textual service address: `:xxxxxxxx` (handle) or `.name` (global name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A raw handle, written as `:` followed by hex digits.
    Handle(Handle),
    /// A global name, written as `.` followed by the name.
    Name(String),
}

/// Error produced when parsing a service address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("empty service address")]
    Empty,
    #[error("invalid handle hex in {0:?}")]
    BadHex(String),
    #[error("address must start with ':' or '.', got {0:?}")]
    BadPrefix(String),
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes().first() {
            None => Err(AddressParseError::Empty),
            Some(b':') => {
                let raw = u32::from_str_radix(&s[1..], 16)
                    .map_err(|_| AddressParseError::BadHex(s.to_string()))?;
                Ok(Address::Handle(Handle::from_raw(raw)))
            }
            Some(b'.') => Ok(Address::Name(s[1..].to_string())),
            Some(_) => Err(AddressParseError::BadPrefix(s.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Handle(h) => write!(f, "{}", h),
            Address::Name(n) => write!(f, ".{}", n),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_and_index_round_trip() {
        let h = Handle::assemble(7, 0x00ab_cdef);
        assert_eq!(h.node(), 7);
        assert_eq!(h.index(), 0x00ab_cdef);
        assert_eq!(h.raw(), 0x07ab_cdef);
    }

    #[test]
    fn index_is_masked_to_24_bits() {
        let h = Handle::assemble(1, 0xff00_0001);
        assert_eq!(h.node(), 1);
        assert_eq!(h.index(), 1);
    }

    #[test]
    fn display_matches_command_channel_form() {
        assert_eq!(Handle::from_raw(0x0100_002a).to_string(), ":0100002a");
    }

    #[test]
    fn parse_hex_address() {
        let addr: Address = ":0100002a".parse().unwrap();
        assert_eq!(addr, Address::Handle(Handle::from_raw(0x0100_002a)));
    }

    #[test]
    fn parse_name_address() {
        let addr: Address = ".launcher".parse().unwrap();
        assert_eq!(addr, Address::Name("launcher".to_string()));
    }

    #[test]
    fn parse_rejects_bare_words() {
        assert!(matches!(
            "launcher".parse::<Address>(),
            Err(AddressParseError::BadPrefix(_))
        ));
        assert!(matches!("".parse::<Address>(), Err(AddressParseError::Empty)));
        assert!(matches!(
            ":zzz".parse::<Address>(),
            Err(AddressParseError::BadHex(_))
        ));
    }
}
