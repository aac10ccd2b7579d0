use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::BitXor;

use ethereum_types::H160;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of bits in an identifier; also the number of routing table buckets.
pub const ID_LENGTH: usize = 160;

/// Number of bytes backing an identifier.
pub const ID_BYTES: usize = ID_LENGTH / 8;

/// A 160-bit identifier naming both nodes and content keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KadId(pub H160);

impl KadId {
    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        let bytes: [u8; ID_BYTES] = rand::rng().random();
        KadId(H160::from(bytes))
    }

    pub fn zero() -> Self {
        KadId(H160::zero())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(H160::from_slice(bytes))
    }

    /// Build an identifier from the raw bytes of a string.
    ///
    /// Input shorter than 20 bytes is zero-padded on the right; longer input
    /// is truncated to the first 20 bytes.
    pub fn from_text<S: AsRef<[u8]>>(text: S) -> Self {
        let input = text.as_ref();
        let mut bytes = [0u8; ID_BYTES];
        let n = input.len().min(ID_BYTES);
        bytes[..n].copy_from_slice(&input[..n]);
        KadId(H160::from(bytes))
    }

    /// Hash arbitrary bytes onto the key space with SHA-1.
    pub fn from_hashed<S: AsRef<[u8]>>(input: &S) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(input.as_ref());
        let digest = hasher.finalize();
        Self(H160::from_slice(&digest))
    }

    /// Parse the 40-character hex text form.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self(H160::from_slice(&bytes)))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        self.0.as_fixed_bytes()
    }

    pub fn get_bit_at(&self, bit_index: usize) -> u8 {
        let bytes = self.0.as_bytes();
        let byte_index = bit_index / 8;
        let shift_amount = 7 - (bit_index % 8);
        (bytes[byte_index] >> shift_amount) & 1u8
    }

    pub fn with_bit(&self, bit_index: usize, bit: u8) -> Self {
        let mut bytes: [u8; ID_BYTES] = *self.0.as_fixed_bytes();

        let byte_index = bit_index / 8;
        let shift_amount = 7 - (bit_index % 8);

        if bit == 1 {
            bytes[byte_index] |= 1 << shift_amount;
        } else {
            bytes[byte_index] &= !(1 << shift_amount);
        }

        KadId(H160::from(bytes))
    }

    /// Count of leading zero bits, 0..=160.
    pub fn prefix_length(&self) -> usize {
        let mut count = 0;
        for b in self.0.as_bytes() {
            if *b == 0 {
                count += 8;
            } else {
                count += b.leading_zeros() as usize;
                break;
            }
        }
        count
    }

    /// The bucket-index form of the distance to `other`:
    /// `160 - prefix_length(self XOR other)`. Equal ids yield 0.
    pub fn bucket_distance(&self, other: &KadId) -> usize {
        ID_LENGTH - (*self ^ *other).prefix_length()
    }

    /// Raw XOR distance to `other`, ordered as a big-endian unsigned integer.
    /// Finer than [`bucket_distance`](Self::bucket_distance); breaks ties
    /// between contacts in the same bucket.
    pub fn distance(&self, other: &KadId) -> Distance {
        Distance(self.0 ^ other.0)
    }

    /// Short, human-friendly hex for logging, like ab12cd34…ef90a1b2
    pub fn short_hex(&self) -> String {
        let b = self.0.to_fixed_bytes();
        format!(
            "{:02x}{:02x}{:02x}{:02x}…{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[16], b[17], b[18], b[19]
        )
    }
}

impl BitXor for KadId {
    type Output = KadId;

    fn bitxor(self, rhs: Self) -> Self::Output {
        KadId(self.0 ^ rhs.0)
    }
}

/// The text form: a zero-padded uppercase hex string of 40 characters.
impl fmt::Display for KadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.as_bytes() {
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Content keys live in the same space as node identifiers.
pub type Key = KadId;

/// XOR of two identifiers, compared as a 160-bit big-endian unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(H160);

/// An identifier paired with a reachable (IPv4, UDP port) endpoint.
///
/// Cheap value type; copied freely. The wire format is fixed at 4-byte
/// addresses, so the endpoint is IPv4 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: KadId,
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Contact {
    pub fn new(id: KadId, address: Ipv4Addr, port: u16) -> Self {
        Self { id, address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn xor_is_an_involution() {
        let a = KadId::random();
        let b = KadId::random();
        assert_eq!((a ^ b) ^ b, a);
    }

    #[test]
    fn bucket_distance_laws() {
        let a = KadId::random();
        let b = KadId::random();
        assert_eq!(a.bucket_distance(&a), 0);
        assert_eq!(a.bucket_distance(&b), b.bucket_distance(&a));
    }

    #[test]
    fn prefix_length_counts_leading_zero_bits() {
        assert_eq!(KadId::zero().prefix_length(), 160);

        let mut bytes = [0u8; ID_BYTES];
        bytes[0] = 0x01; // 7 leading zeros in the first byte
        assert_eq!(KadId(H160::from(bytes)).prefix_length(), 7);

        bytes[0] = 0x00;
        bytes[19] = 0x80;
        assert_eq!(KadId(H160::from(bytes)).prefix_length(), 152);
    }

    #[test]
    fn from_text_pads_and_truncates() {
        let short = KadId::from_text("abc");
        assert_eq!(&short.as_bytes()[..3], b"abc");
        assert!(short.as_bytes()[3..].iter().all(|b| *b == 0));

        let exact = KadId::from_text("ASF45678947584567467");
        assert_eq!(exact.as_bytes(), b"ASF45678947584567467");

        let long = KadId::from_text("ASF45678947584567467EXTRA");
        assert_eq!(long, exact);
    }

    #[test]
    fn display_round_trips_through_hex() {
        let id = KadId::from_text("ASF45678947584567467");
        let text = id.to_string();
        assert_eq!(text.len(), 40);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!text.chars().any(|c| c.is_ascii_lowercase()));
        assert_eq!(KadId::from_hex(&text).unwrap(), id);
    }

    #[test]
    fn distance_orders_big_endian() {
        let origin = KadId::zero();
        let mut near_bytes = [0u8; ID_BYTES];
        near_bytes[19] = 0x01;
        let near = KadId(H160::from(near_bytes));
        let mut far_bytes = [0u8; ID_BYTES];
        far_bytes[0] = 0x80;
        let far = KadId(H160::from(far_bytes));
        assert!(origin.distance(&near) < origin.distance(&far));
    }

    #[test]
    fn bit_helpers_round_trip() {
        let id = KadId::zero().with_bit(3, 1);
        assert_eq!(id.get_bit_at(3), 1);
        assert_eq!(id.get_bit_at(4), 0);
        assert_eq!(id.with_bit(3, 0), KadId::zero());
    }
}
