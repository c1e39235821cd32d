//! reqwest-backed [`OtaBackend`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;

use super::{FirmwareStream, OtaBackend};
use crate::error::OtaError;

pub struct HttpBackend {
    client: Client,
}

impl HttpBackend {
    pub fn new(timeout: Duration) -> Result<Self, OtaError> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| OtaError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl OtaBackend for HttpBackend {
    async fn fetch_manifest(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<String, OtaError> {
        log::info!("Checking version via HTTP: {}", url);

        // 有请求体用 POST，否则 GET
        let mut request = match body {
            Some(body) if !body.is_empty() => self.client.post(url).body(body),
            _ => self.client.get(url),
        };
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| OtaError::Network(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(OtaError::Network(format!("HTTP error: {}", response.status())));
        }
        response
            .text()
            .await
            .map_err(|e| OtaError::Network(format!("failed to read body: {}", e)))
    }

    async fn open_firmware(&self, url: &str) -> Result<Box<dyn FirmwareStream>, OtaError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| OtaError::Network(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(OtaError::Network(format!("HTTP error: {}", response.status())));
        }
        Ok(Box::new(HttpFirmwareStream {
            content_length: response.content_length(),
            response,
            pending: Bytes::new(),
        }))
    }
}

struct HttpFirmwareStream {
    response: reqwest::Response,
    content_length: Option<u64>,
    /// Unconsumed tail of the last chunk.
    pending: Bytes,
}

#[async_trait]
impl FirmwareStream for HttpFirmwareStream {
    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, OtaError> {
        while self.pending.is_empty() {
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => return Ok(0),
                Err(e) => return Err(OtaError::Network(format!("failed to read data: {}", e))),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }
}
