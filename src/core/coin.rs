//! Coin sides.

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};

/// One face of the coin. Used both for player choices and flip outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinSide {
    /// Heads.
    #[serde(alias = "Heads", alias = "HEADS")]
    Heads,
    /// Tails.
    #[serde(alias = "Tails", alias = "TAILS")]
    Tails,
}

impl CoinSide {
    /// The other face.
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            CoinSide::Heads => CoinSide::Tails,
            CoinSide::Tails => CoinSide::Heads,
        }
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            CoinSide::Heads => "heads",
            CoinSide::Tails => "tails",
        }
    }
}

impl fmt::Display for CoinSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a coin side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid coin side: {0}")]
pub struct ParseCoinSideError(String);

impl FromStr for CoinSide {
    type Err = ParseCoinSideError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "heads" => Ok(CoinSide::Heads),
            "tails" => Ok(CoinSide::Tails),
            _ => Err(ParseCoinSideError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite() {
        assert_eq!(CoinSide::Heads.opposite(), CoinSide::Tails);
        assert_eq!(CoinSide::Tails.opposite().opposite(), CoinSide::Tails);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&CoinSide::Heads).unwrap(), "\"heads\"");
        let side: CoinSide = serde_json::from_str("\"Tails\"").unwrap();
        assert_eq!(side, CoinSide::Tails);
        assert!(serde_json::from_str::<CoinSide>("\"edge\"").is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!("HEADS".parse::<CoinSide>(), Ok(CoinSide::Heads));
        assert!("sideways".parse::<CoinSide>().is_err());
    }
}
