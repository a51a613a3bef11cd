use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// External services consulted for address data, in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Correios,
    #[serde(rename = "ViaCEP")]
    ViaCep,
    #[serde(rename = "BrasilAPI")]
    BrasilApi,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Correios => write!(f, "Correios"),
            Source::ViaCep => write!(f, "ViaCEP"),
            Source::BrasilApi => write!(f, "BrasilAPI"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid address source")]
pub struct ParseSourceError(pub String);

impl FromStr for Source {
    type Err = ParseSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Correios" => Ok(Source::Correios),
            "ViaCEP" => Ok(Source::ViaCep),
            "BrasilAPI" => Ok(Source::BrasilApi),
            other => Err(ParseSourceError(other.to_owned())),
        }
    }
}

/// Address data as returned by a single provider, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAddress {
    pub street: Option<String>,
    pub city: String,
    pub state: String,
    pub is_single_address: bool,
    pub source: Source,
}

/// Enumeration of failure modes for a single provider lookup.
///
/// Every variant advances the fallback chain; none of them abort it. `Auth`
/// is only surfaced after the one permitted re-authentication retry failed.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("provider reported no address for this code")]
    NotFound,
    #[error("provider request failed: {0}")]
    Network(String),
    #[error("provider rejected our credentials")]
    Auth,
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Network(format!("request timed out: {error}"))
        } else {
            ProviderError::Network(error.to_string())
        }
    }
}

/// One external address-lookup service behind a uniform capability interface.
#[async_trait]
pub trait AddressProvider: Send + Sync {
    /// Which provider this is, for provenance and failure reporting.
    fn source(&self) -> Source;

    /// Resolve one canonical 8-digit code against this provider.
    async fn lookup(&self, code: &str) -> Result<ResolvedAddress, ProviderError>;
}
