use async_trait::async_trait;
use serde::Deserialize;

use crate::provider::{AddressProvider, ProviderError, ResolvedAddress, Source};

/// ViaCEP public API, second in the fallback chain. No authentication.
pub struct ViaCepClient {
    client: reqwest::Client,
    base_url: String,
}

impl ViaCepClient {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct ViaCepPayload {
    // ViaCEP signals an unknown code with {"erro": true} (or "true") on an
    // otherwise successful response instead of a non-2xx status.
    erro: Option<serde_json::Value>,
    logradouro: Option<String>,
    localidade: Option<String>,
    uf: Option<String>,
}

#[async_trait]
impl AddressProvider for ViaCepClient {
    fn source(&self) -> Source {
        Source::ViaCep
    }

    async fn lookup(&self, code: &str) -> Result<ResolvedAddress, ProviderError> {
        let url = format!("{}/{}/json/", self.base_url, code);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ProviderError::Network(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let payload: ViaCepPayload = response
            .json()
            .await
            .map_err(|e| ProviderError::Network(format!("malformed payload: {e}")))?;

        if payload.erro.is_some() {
            return Err(ProviderError::NotFound);
        }

        let city = payload
            .localidade
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::Network("payload is missing the city".to_owned()))?;
        let state = payload
            .uf
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Network("payload is missing the state".to_owned()))?;

        Ok(ResolvedAddress {
            street: payload.logradouro.filter(|s| !s.is_empty()),
            city,
            state,
            is_single_address: false,
            source: Source::ViaCep,
        })
    }
}
