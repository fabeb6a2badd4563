//! Record identity
//!
//! A [`Rid`] names a stored record by the cluster it lives in and its
//! position inside that cluster. Rids order by cluster first, then by
//! position, which is the order class and cluster scans deliver rows in.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Cluster identifier
pub type ClusterId = i32;

/// Persistent identity of a record: `#<cluster>:<position>`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    cluster: ClusterId,
    position: i64,
}

impl Rid {
    /// Create a rid from its parts
    pub const fn new(cluster: ClusterId, position: i64) -> Self {
        Self { cluster, position }
    }

    /// Placeholder identity for records not yet assigned a position
    pub const fn temporary() -> Self {
        Self {
            cluster: -1,
            position: -1,
        }
    }

    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    /// True once the record has been assigned a cluster position
    pub fn is_persistent(&self) -> bool {
        self.cluster >= 0 && self.position >= 0
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rid(#{}:{})", self.cluster, self.position)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

impl FromStr for Rid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let body = s.strip_prefix('#').unwrap_or(s);
        let (cluster, position) = body
            .split_once(':')
            .ok_or_else(|| Error::Deserialization(format!("Invalid rid: {}", s)))?;
        let cluster = cluster
            .parse()
            .map_err(|_| Error::Deserialization(format!("Invalid rid cluster: {}", s)))?;
        let position = position
            .parse()
            .map_err(|_| Error::Deserialization(format!("Invalid rid position: {}", s)))?;
        Ok(Self::new(cluster, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rid_display() {
        let rid = Rid::new(9, 42);
        assert_eq!(rid.to_string(), "#9:42");
        assert_eq!(format!("{:?}", rid), "Rid(#9:42)");
    }

    #[test]
    fn test_rid_parse() {
        let rid: Rid = "#3:7".parse().unwrap();
        assert_eq!(rid, Rid::new(3, 7));
        let rid: Rid = "3:7".parse().unwrap();
        assert_eq!(rid, Rid::new(3, 7));
        assert!("#3".parse::<Rid>().is_err());
        assert!("#a:7".parse::<Rid>().is_err());
    }

    #[test]
    fn test_rid_ordering() {
        let mut rids = vec![Rid::new(2, 0), Rid::new(1, 5), Rid::new(1, 2)];
        rids.sort();
        assert_eq!(rids, vec![Rid::new(1, 2), Rid::new(1, 5), Rid::new(2, 0)]);
    }

    #[test]
    fn test_temporary_rid() {
        assert!(!Rid::temporary().is_persistent());
        assert!(Rid::new(0, 0).is_persistent());
    }
}
