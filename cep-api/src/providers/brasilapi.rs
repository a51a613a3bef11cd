use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;

use crate::provider::{AddressProvider, ProviderError, ResolvedAddress, Source};

/// BrasilAPI public CEP endpoint, last in the fallback chain.
pub struct BrasilApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrasilApiClient {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[derive(Deserialize)]
struct BrasilApiPayload {
    street: Option<String>,
    city: String,
    state: String,
}

#[async_trait]
impl AddressProvider for BrasilApiClient {
    fn source(&self) -> Source {
        Source::BrasilApi
    }

    async fn lookup(&self, code: &str) -> Result<ResolvedAddress, ProviderError> {
        let url = format!("{}/{}", self.base_url, code);
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ProviderError::NotFound),
            status if status.is_success() => {
                let payload: BrasilApiPayload = response
                    .json()
                    .await
                    .map_err(|e| ProviderError::Network(format!("malformed payload: {e}")))?;

                Ok(ResolvedAddress {
                    street: payload.street.filter(|s| !s.is_empty()),
                    city: payload.city,
                    state: payload.state,
                    is_single_address: false,
                    source: Source::BrasilApi,
                })
            }
            status => Err(ProviderError::Network(format!("unexpected status {status}"))),
        }
    }
}
