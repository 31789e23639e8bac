//! HTTP forwarding to a local engine subprocess.
//!
//! Intentionally transparent: request and response JSON pass through
//! unmodified (adapters that need to rewrite a field do it before calling
//! in), and streaming responses are relayed chunk by chunk without
//! re-framing, so engine SSE reaches the client byte for byte.

use std::time::Duration;

use serde_json::Value;

use lmn_domain::{Error, Result};

use crate::adapter::ByteStream;

/// Client for one engine's private localhost port. Cheap to clone.
#[derive(Clone)]
pub struct EngineHttp {
    client: reqwest::Client,
    base: String,
}

impl EngineHttp {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(format!("building engine client: {e}")))?;
        Ok(Self {
            client,
            base: format!("http://127.0.0.1:{port}"),
        })
    }

    pub fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.base)
    }

    /// GET that only cares about reachability (health polling).
    pub async fn is_healthy(&self, endpoint: &str) -> bool {
        match self.client.get(self.url(endpoint)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Forward a JSON request and return the engine's JSON reply. Engine
    /// error bodies are surfaced in the error message.
    pub async fn post_json(&self, endpoint: &str, body: &Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Engine(format!("POST {endpoint}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Engine(format!("reading {endpoint} response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Engine(format!(
                "engine returned HTTP {status} for {endpoint}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Engine(format!("engine sent non-JSON for {endpoint}: {e}")))
    }

    /// Forward a raw request body and stream the raw response back.
    pub async fn post_stream(&self, endpoint: &str, body: Vec<u8>) -> Result<ByteStream> {
        let resp = self
            .client
            .post(self.url(endpoint))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Engine(format!("POST {endpoint}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Engine(format!(
                "engine returned HTTP {status} for {endpoint}: {text}"
            )));
        }

        let stream = async_stream::stream! {
            let mut resp = resp;
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => yield Ok(bytes.to_vec()),
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Engine(format!("engine stream broke: {e}")));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Re-post a staged audio file as multipart, with extra form fields.
    pub async fn post_multipart_file(
        &self,
        endpoint: &str,
        file_path: &std::path::Path,
        fields: &std::collections::HashMap<String, String>,
    ) -> Result<Value> {
        let bytes = tokio::fs::read(file_path).await?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".into());

        let mut form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));
        for (key, value) in fields {
            form = form.text(key.clone(), value.clone());
        }

        let resp = self
            .client
            .post(self.url(endpoint))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Engine(format!("POST {endpoint}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Engine(format!("reading {endpoint} response: {e}")))?;
        if !status.is_success() {
            return Err(Error::Engine(format!(
                "engine returned HTTP {status} for {endpoint}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Engine(format!("engine sent non-JSON for {endpoint}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_base_and_endpoint() {
        let http = EngineHttp::new(8123).unwrap();
        assert_eq!(
            http.url("/v1/chat/completions"),
            "http://127.0.0.1:8123/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn health_check_on_closed_port_is_false() {
        // Port 9 (discard) is almost certainly not serving HTTP.
        let http = EngineHttp::new(9).unwrap();
        assert!(!http.is_healthy("/health").await);
    }
}
