use std::{fmt, str::FromStr};

use crate::{ChatError, UserId};

/// Two-party conversation key, rendered as `"<low>_<high>"`.
///
/// Both orders of the same pair produce the same key, and a key always names
/// two distinct users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomKey {
    low: UserId,
    high: UserId,
}

impl RoomKey {
    pub fn between(a: UserId, b: UserId) -> Result<Self, ChatError> {
        if a == b {
            return Err(ChatError::InvalidRoom(format!("{a}_{b}")));
        }

        Ok(RoomKey {
            low: a.min(b),
            high: a.max(b),
        })
    }

    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    /// The participant that is not `user`.
    pub fn peer_of(&self, user: UserId) -> Result<UserId, ChatError> {
        if user == self.low {
            Ok(self.high)
        } else if user == self.high {
            Ok(self.low)
        } else {
            Err(ChatError::RecipientResolution {
                author: user,
                room: self.to_string(),
            })
        }
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.low, self.high)
    }
}

impl FromStr for RoomKey {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChatError::InvalidRoom(s.to_owned());

        let (a, b) = s.split_once('_').ok_or_else(invalid)?;
        let a = a.parse().map_err(|_| invalid())?;
        let b = b.parse().map_err(|_| invalid())?;

        RoomKey::between(a, b).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric() {
        for (a, b) in [(3, 7), (7, 3), (1, 1000), (-4, 2), (0, 9)] {
            let ab = RoomKey::between(a, b).unwrap();
            let ba = RoomKey::between(b, a).unwrap();
            assert_eq!(ab, ba);
            assert_eq!(ab.to_string(), ba.to_string());

            let decoded: RoomKey = ab.to_string().parse().unwrap();
            let (low, high) = decoded.participants();
            assert_eq!((low, high), (a.min(b), a.max(b)));
        }
    }

    #[test]
    fn renders_sorted() {
        assert_eq!(RoomKey::between(7, 3).unwrap().to_string(), "3_7");
    }

    #[test]
    fn decodes_either_order() {
        let key: RoomKey = "7_3".parse().unwrap();
        assert_eq!(key.to_string(), "3_7");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "3", "3_", "_7", "a_b", "3_7_9", "3-7", "3 _7", "5_5"] {
            assert!(
                matches!(bad.parse::<RoomKey>(), Err(ChatError::InvalidRoom(_))),
                "{bad:?} should not decode"
            );
        }
    }

    #[test]
    fn peer_resolution() {
        let key = RoomKey::between(3, 7).unwrap();
        assert_eq!(key.peer_of(3).unwrap(), 7);
        assert_eq!(key.peer_of(7).unwrap(), 3);
        assert!(key.contains(3));
        assert!(!key.contains(4));
        assert!(matches!(
            key.peer_of(4),
            Err(ChatError::RecipientResolution { author: 4, .. })
        ));
    }
}
