#![cfg(feature = "http-directory")]

use async_trait::async_trait;
use medc_crypto::PeerKeys;
use reqwest::StatusCode;

use crate::directory::{DirectoryError, FetchResponse, KeyDirectory, PublishRequest};

/// `KeyDirectory` over the application's REST API.
#[derive(Clone)]
pub struct HttpKeyDirectory {
    base_url: String,
    client: reqwest::Client,
}

impl HttpKeyDirectory {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| DirectoryError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn publish_url(&self) -> String {
        format!("{}/public-keys", self.base_url)
    }

    fn user_url(&self, user_id: &str) -> String {
        format!("{}/public-keys/{}", self.base_url, user_id)
    }
}

#[async_trait]
impl KeyDirectory for HttpKeyDirectory {
    /// PUT the local bundle set.
    async fn publish(&self, user_id: &str, keys: &PeerKeys) -> Result<(), DirectoryError> {
        let body = PublishRequest {
            user_id: user_id.to_string(),
            public_keys: keys.clone(),
        };
        let resp = self
            .client
            .put(self.publish_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| DirectoryError::Http(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DirectoryError::BadResponse(format!(
                "status={} body={:?}",
                status,
                resp.text().await.ok()
            )))
        }
    }

    /// GET a user's bundle set. Returns None on 404.
    async fn fetch(&self, user_id: &str) -> Result<Option<PeerKeys>, DirectoryError> {
        let resp = self
            .client
            .get(self.user_url(user_id))
            .send()
            .await
            .map_err(|e| DirectoryError::Http(e.to_string()))?;

        match resp.status() {
            StatusCode::OK => {
                let body: FetchResponse = resp
                    .json()
                    .await
                    .map_err(|e| DirectoryError::BadResponse(e.to_string()))?;
                let keys = body.into_keys();
                keys.validate().map_err(|e| DirectoryError::InvalidKeys {
                    user: user_id.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(keys))
            }
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(DirectoryError::BadResponse(format!(
                "status={} body={:?}",
                other,
                resp.text().await.ok()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_trim_trailing_slash() {
        let dir = HttpKeyDirectory::new("https://api.example.test/api/").unwrap();
        assert_eq!(dir.publish_url(), "https://api.example.test/api/public-keys");
        assert_eq!(
            dir.user_url("dr-lee"),
            "https://api.example.test/api/public-keys/dr-lee"
        );
    }
}
