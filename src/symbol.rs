use std::fmt;

use error_stack::Report;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SymbolError;
use crate::model::ExchangeId;

const QUOTE: &str = "USDT";
const MAX_BASE_LEN: usize = 10;

/// Canonical perpetual symbol: upper-case `BASEUSDT`, no separator.
///
/// Per-exchange native forms derive deterministically via [`exchange_form`]
/// and parse back via [`from_exchange_form`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    /// Validate `input` against `^[A-Z0-9]{1,10}USDT$`.
    pub fn parse(input: &str) -> Result<Self, Report<SymbolError>> {
        let invalid = || {
            Report::new(SymbolError::FormatInvalid {
                input: input.to_owned(),
            })
        };

        let base = input.strip_suffix(QUOTE).ok_or_else(invalid)?;
        if base.is_empty() || base.len() > MAX_BASE_LEN {
            return Err(invalid());
        }
        if !base
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        {
            return Err(invalid());
        }

        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The base asset, i.e. the symbol with the quote suffix removed.
    pub fn base(&self) -> &str {
        self.0.strip_suffix(QUOTE).unwrap_or(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Symbol::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Render the canonical symbol in `exchange`'s native market id.
pub fn exchange_form(symbol: &Symbol, exchange: ExchangeId) -> String {
    match exchange {
        ExchangeId::Binance => symbol.as_str().to_owned(),
        ExchangeId::Okx => format!("{}-{}-SWAP", symbol.base(), QUOTE),
        ExchangeId::Gateio | ExchangeId::Mexc => format!("{}_{}", symbol.base(), QUOTE),
        ExchangeId::Bingx => format!("{}-{}", symbol.base(), QUOTE),
    }
}

/// Parse an exchange-native market id back into the canonical symbol.
pub fn from_exchange_form(raw: &str, exchange: ExchangeId) -> Result<Symbol, Report<SymbolError>> {
    let invalid = || {
        Report::new(SymbolError::FormatInvalid {
            input: raw.to_owned(),
        })
    };

    let base = match exchange {
        ExchangeId::Binance => raw.strip_suffix(QUOTE).ok_or_else(invalid)?,
        ExchangeId::Okx => raw
            .strip_suffix("-SWAP")
            .and_then(|s| s.strip_suffix(QUOTE))
            .and_then(|s| s.strip_suffix('-'))
            .ok_or_else(invalid)?,
        ExchangeId::Gateio | ExchangeId::Mexc => raw
            .strip_suffix(QUOTE)
            .and_then(|s| s.strip_suffix('_'))
            .ok_or_else(invalid)?,
        ExchangeId::Bingx => raw
            .strip_suffix(QUOTE)
            .and_then(|s| s.strip_suffix('-'))
            .ok_or_else(invalid)?,
    };

    Symbol::parse(&format!("{base}{QUOTE}"))
}
