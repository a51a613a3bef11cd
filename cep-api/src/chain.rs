use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::warn;

use crate::provider::{AddressProvider, ProviderError, ResolvedAddress, Source};

/// Every provider in the chain was tried and none produced an address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no provider could resolve this code (tried {})", .attempted.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" + "))]
pub struct ChainExhausted {
    pub attempted: Vec<Source>,
}

/// Sequential fallback across providers for a single code.
///
/// Providers are tried in priority order and the first success
/// short-circuits; both `NotFound` and transport failures advance to the
/// next provider, so one provider's outage never blocks the rest. The
/// sequential walk keeps outbound call volume minimal at the cost of extra
/// latency for codes the first provider cannot answer.
pub struct ResolutionChain {
    providers: Vec<Arc<dyn AddressProvider>>,
}

impl ResolutionChain {
    pub fn new(providers: Vec<Arc<dyn AddressProvider>>) -> Self {
        Self { providers }
    }

    pub async fn resolve(&self, code: &str) -> Result<ResolvedAddress, ChainExhausted> {
        let mut attempted = Vec::with_capacity(self.providers.len());

        for provider in &self.providers {
            let source = provider.source();
            match provider.lookup(code).await {
                Ok(address) => {
                    counter!(
                        "cep_provider_lookups_total",
                        &[("provider", source.to_string()), ("outcome", "hit".to_owned())]
                    )
                    .increment(1);
                    return Ok(address);
                }
                Err(error) => {
                    let outcome = match error {
                        ProviderError::NotFound => "not_found",
                        ProviderError::Network(_) => "network_failure",
                        ProviderError::Auth => "auth_failure",
                    };
                    counter!(
                        "cep_provider_lookups_total",
                        &[("provider", source.to_string()), ("outcome", outcome.to_owned())]
                    )
                    .increment(1);
                    warn!(code, provider = %source, %error, "provider lookup failed, trying next");
                    attempted.push(source);
                }
            }
        }

        Err(ChainExhausted { attempted })
    }
}
