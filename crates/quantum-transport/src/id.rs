//! Connection identifiers.
//!
//! A 128-bit, time-ordered identifier assigned once per connection and
//! carried in every packet's header. Backed by a real UUIDv7 (RFC 9562)
//! generator rather than hand-rolled timestamp bit-packing.

use std::fmt;

use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ConnectionId(u128);

impl ConnectionId {
    /// Generate a new, time-ordered connection identifier.
    pub fn generate() -> Self {
        ConnectionId(Uuid::now_v7().as_u128())
    }

    pub fn as_u128(self) -> u128 {
        self.0
    }

    pub fn from_u128(v: u128) -> Self {
        ConnectionId(v)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_nonzero_and_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a.as_u128(), 0);
        assert_ne!(b.as_u128(), 0);
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_time_ordered() {
        let a = ConnectionId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = ConnectionId::generate();
        assert!(b.as_u128() > a.as_u128());
    }

    #[test]
    fn roundtrip_through_u128() {
        let a = ConnectionId::generate();
        let raw = a.as_u128();
        assert_eq!(ConnectionId::from_u128(raw), a);
    }
}
