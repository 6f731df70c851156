//! Core wire and domain types shared across the engine.
//!
//! The key objects are [`StellarAddress`] (56-char strkey shape used for both
//! `G…` account IDs and `C…` contract IDs), [`TxHash`], [`Network`], and the
//! stroop amount canonicalization helpers. Parsing is strict on input:
//! newtypes validate shape inside `Deserialize` so malformed identifiers are
//! rejected at the HTTP boundary instead of deep inside a handler.

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Stroops per XLM.
pub const STROOPS_PER_XLM: i128 = 10_000_000;

/// Inputs numerically below this threshold are interpreted as XLM and scaled
/// to stroops; at or above it they are taken as stroops already.
pub const STROOP_INTERPRETATION_THRESHOLD: i128 = 1_000_000;

static ADDRESS_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9]{56}$").expect("valid address regex"));

static TX_HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").expect("valid tx hash regex"));

/// The Stellar network a contract lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Testnet,
    Mainnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Testnet => "testnet",
            Network::Mainnet => "mainnet",
        }
    }

    /// Contract address of the native XLM Stellar Asset Contract on this network.
    pub fn native_sac(&self) -> StellarAddress {
        let address = match self {
            Network::Testnet => "CDLZFC3SYJYDZT7K67VZ75HPJVIEUVNIXF47ZG2FB2RMQQVU2HHGCYSC",
            Network::Mainnet => "CAS3J7GYLGXMF6TDJBBYYSE3HQ6BBSMLNUQ34T6TZMYMW2EVH34XOWMA",
        };
        StellarAddress(address.to_string())
    }

    /// Base URL of the public stellar.expert explorer for this network.
    pub fn explorer_base(&self) -> &'static str {
        match self {
            Network::Testnet => "https://stellar.expert/explorer/testnet",
            Network::Mainnet => "https://stellar.expert/explorer/public",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown network: {0}")]
pub struct NetworkParseError(String);

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "testnet" => Ok(Network::Testnet),
            "mainnet" | "public" => Ok(Network::Mainnet),
            other => Err(NetworkParseError(other.to_string())),
        }
    }
}

/// A 56-character Stellar strkey: a `G…` account public key or a `C…`
/// contract ID. Shape-validated on construction; checksum validation is
/// deferred to the chain layer where a full strkey parse is needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StellarAddress(String);

#[derive(Debug, thiserror::Error)]
#[error("Invalid Stellar address: expected 56 uppercase base32 characters, got {0:?}")]
pub struct StellarAddressError(String);

impl StellarAddress {
    pub fn parse(s: &str) -> Result<Self, StellarAddressError> {
        if ADDRESS_REGEX.is_match(s) {
            Ok(StellarAddress(s.to_string()))
        } else {
            Err(StellarAddressError(truncate_for_error(s)))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_contract(&self) -> bool {
        self.0.starts_with('C')
    }

    pub fn is_account(&self) -> bool {
        self.0.starts_with('G')
    }

    /// Full strkey decode, used where a checksum-valid key is required.
    pub fn decode_strkey(&self) -> Result<stellar_strkey::Strkey, StellarAddressError> {
        stellar_strkey::Strkey::from_string(&self.0)
            .map_err(|_| StellarAddressError(truncate_for_error(&self.0)))
    }
}

fn truncate_for_error(s: &str) -> String {
    if s.len() > 60 {
        format!("{}…", &s[..60])
    } else {
        s.to_string()
    }
}

impl Display for StellarAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StellarAddress {
    type Err = StellarAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StellarAddress::parse(s)
    }
}

impl Serialize for StellarAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StellarAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        StellarAddress::parse(&s).map_err(Error::custom)
    }
}

/// A transaction hash as returned by Soroban RPC: 64 lowercase hex characters.
/// Hashes are public identifiers and safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(String);

#[derive(Debug, thiserror::Error)]
#[error("Invalid transaction hash: expected 64 hex characters")]
pub struct TxHashError;

impl TxHash {
    pub fn parse(s: &str) -> Result<Self, TxHashError> {
        if TX_HASH_REGEX.is_match(s) {
            Ok(TxHash(s.to_lowercase()))
        } else {
            Err(TxHashError)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxHash {
    type Err = TxHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxHash::parse(s)
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TxHash::parse(&s).map_err(Error::custom)
    }
}

/// An amount in stroops (10^-7 XLM), the on-chain integer unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StroopAmount(pub i128);

#[derive(Debug, thiserror::Error)]
pub enum AmountError {
    #[error("Amount is not a valid number: {0}")]
    Unparseable(String),
    #[error("Amount must be positive, got {0}")]
    NonPositive(String),
    #[error("Amount exceeds the representable range")]
    Overflow,
}

impl StroopAmount {
    /// Canonicalizes a raw JSON amount into stroops.
    ///
    /// Inputs carrying a decimal point, or integer inputs below
    /// [`STROOP_INTERPRETATION_THRESHOLD`], are read as XLM and multiplied by
    /// 10^7. Larger integers are taken as stroops verbatim, so feeding a
    /// canonical stroop value back through this function leaves it unchanged.
    pub fn canonicalize(raw: &serde_json::Value) -> Result<StroopAmount, AmountError> {
        let text = match raw {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            other => return Err(AmountError::Unparseable(other.to_string())),
        };
        let decimal =
            Decimal::from_str(&text).map_err(|_| AmountError::Unparseable(text.clone()))?;
        if decimal.is_sign_negative() || decimal.is_zero() {
            return Err(AmountError::NonPositive(text));
        }

        let has_decimal_point = text.contains('.');
        let is_small_integer = !has_decimal_point
            && decimal
                .trunc()
                .to_string()
                .parse::<i128>()
                .map(|v| v < STROOP_INTERPRETATION_THRESHOLD)
                .unwrap_or(false);

        if has_decimal_point || is_small_integer {
            let scaled = decimal
                .checked_mul(Decimal::from(STROOPS_PER_XLM as i64))
                .ok_or(AmountError::Overflow)?;
            let stroops = scaled
                .trunc()
                .to_string()
                .parse::<i128>()
                .map_err(|_| AmountError::Overflow)?;
            if stroops <= 0 {
                return Err(AmountError::NonPositive(text));
            }
            Ok(StroopAmount(stroops))
        } else {
            let stroops = text.parse::<i128>().map_err(|_| AmountError::Overflow)?;
            Ok(StroopAmount(stroops))
        }
    }

    /// Renders the amount as the decimal string used inside signature
    /// payloads.
    pub fn as_payload_string(&self) -> String {
        self.0.to_string()
    }
}

impl Display for StroopAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_shape_validation() {
        let ok = "GDRXE2BQUC3AZNPVFSCEZ76NJ3WWL25FYFK6RGZGIEKWE4SOOHSUJUJ6";
        assert!(StellarAddress::parse(ok).is_ok());
        assert!(StellarAddress::parse(ok).unwrap().is_account());

        let contract = "CDLZFC3SYJYDZT7K67VZ75HPJVIEUVNIXF47ZG2FB2RMQQVU2HHGCYSC";
        assert!(StellarAddress::parse(contract).unwrap().is_contract());

        assert!(StellarAddress::parse("too-short").is_err());
        assert!(StellarAddress::parse(&"g".repeat(56)).is_err());
        assert!(StellarAddress::parse(&format!("{ok}X")).is_err());
    }

    #[test]
    fn test_tx_hash_normalizes_to_lowercase() {
        let upper = "AB".repeat(32);
        let hash = TxHash::parse(&upper).unwrap();
        assert_eq!(hash.as_str(), "ab".repeat(32));
        assert!(TxHash::parse("0xabc").is_err());
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert_eq!("public".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("goerli".parse::<Network>().is_err());
    }

    #[test]
    fn test_xlm_amounts_scale_to_stroops() {
        assert_eq!(
            StroopAmount::canonicalize(&json!(1)).unwrap(),
            StroopAmount(10_000_000)
        );
        assert_eq!(
            StroopAmount::canonicalize(&json!("2.5")).unwrap(),
            StroopAmount(25_000_000)
        );
        // Decimal point always means XLM, even for large values.
        assert_eq!(
            StroopAmount::canonicalize(&json!("1000000.0")).unwrap(),
            StroopAmount(10_000_000_000_000)
        );
    }

    #[test]
    fn test_stroop_amounts_pass_through() {
        assert_eq!(
            StroopAmount::canonicalize(&json!(10_000_000)).unwrap(),
            StroopAmount(10_000_000)
        );
        assert_eq!(
            StroopAmount::canonicalize(&json!("25000000")).unwrap(),
            StroopAmount(25_000_000)
        );
    }

    #[test]
    fn test_canonicalization_is_stable_on_canonical_values() {
        for input in [json!(1), json!("0.5"), json!(42), json!(98_765_432)] {
            let once = StroopAmount::canonicalize(&input).unwrap();
            let twice = StroopAmount::canonicalize(&json!(once.0.to_string())).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_rejects_non_positive_amounts() {
        assert!(StroopAmount::canonicalize(&json!(0)).is_err());
        assert!(StroopAmount::canonicalize(&json!("-3")).is_err());
        assert!(StroopAmount::canonicalize(&json!(null)).is_err());
    }
}
