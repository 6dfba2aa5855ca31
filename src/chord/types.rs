use crate::chord::hash::{hash_key, HashFunction};
use crate::chord::RING_SIZE;
use crate::error::ChordError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Digest represents a position on the identifier ring, always in `[0, RING_SIZE)`.
///
/// Ordering is the plain numeric order; anything that has to respect the
/// wraparound of the ring must go through [`in_open_closed`] / [`in_open_open`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Digest(u32);

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Digest {
    /// Wraps `value` onto the ring.
    pub const fn new(value: u32) -> Self {
        Digest(value % RING_SIZE)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Hashes a node name or key onto the ring with the default hash function
    pub fn from_key(key: &str) -> Self {
        hash_key(key, HashFunction::default())
    }

    /// Start of the k-th finger interval: `(self + 2^k) mod 2^m`.
    /// k is 0-based here, 1-based in the paper
    pub fn add_power_of_two(&self, k: usize) -> Self {
        Digest::new(self.0.wrapping_add(1 << k))
    }

    /// True if `self` lies in `(start, end]` walking clockwise
    pub fn in_open_closed(&self, start: Digest, end: Digest) -> bool {
        in_open_closed(start, end, *self)
    }

    /// True if `self` lies in `(start, end)` walking clockwise
    pub fn in_open_open(&self, start: Digest, end: Digest) -> bool {
        in_open_open(start, end, *self)
    }
}

impl TryFrom<u32> for Digest {
    type Error = ChordError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value < RING_SIZE {
            Ok(Digest(value))
        } else {
            Err(ChordError::InvalidNodeId(format!(
                "{} is outside the ring [0, {})",
                value, RING_SIZE
            )))
        }
    }
}

impl From<Digest> for u32 {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl FromStr for Digest {
    type Err = ChordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|_| ChordError::InvalidNodeId(format!("'{}' is not a number", s)))?;
        Digest::try_from(value)
    }
}

/// `x` in `(a, b]` clockwise. When `a == b` the interval is the whole ring.
pub fn in_open_closed(a: Digest, b: Digest, x: Digest) -> bool {
    if a < b {
        a < x && x <= b
    } else {
        x > a || x <= b
    }
}

/// `x` in `(a, b)` clockwise. When `a == b` the interval is the whole ring minus `a`.
pub fn in_open_open(a: Digest, b: Digest, x: Digest) -> bool {
    if a < b {
        a < x && x < b
    } else {
        x > a || x < b
    }
}

/// Identifies a ring identity and how to reach it.
///
/// `owner_digest` is the physical node listening at `address`; virtual
/// identities share their owner's address and are told apart at the
/// application layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub digest: Digest,
    pub owner_digest: Digest,
    pub address: String,
}

impl RoutingInfo {
    pub fn new(digest: Digest, owner_digest: Digest, address: impl Into<String>) -> Self {
        Self {
            digest,
            owner_digest,
            address: address.into(),
        }
    }
}

impl fmt::Display for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}@{}]", self.digest, self.owner_digest, self.address)
    }
}

/// `name:digest` description of an extra identity hosted by a physical node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualNodeSpec {
    pub name: String,
    pub digest: Digest,
}

impl FromStr for VirtualNodeSpec {
    type Err = ChordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, digest) = s.rsplit_once(':').ok_or_else(|| {
            ChordError::InvalidNodeId(format!("expected name:digest, got '{}'", s))
        })?;
        if name.is_empty() {
            return Err(ChordError::InvalidNodeId(format!("missing name in '{}'", s)));
        }
        Ok(VirtualNodeSpec {
            name: name.to_string(),
            digest: digest.parse()?,
        })
    }
}
