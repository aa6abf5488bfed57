//! HTTP transport: JSON-RPC over POST with configured auth injection.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::header;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{
    call_params, parse_tool_list, JsonRpcRequest, JsonRpcResponse, ToolTransport,
    METHOD_CALL_TOOL, METHOD_LIST_TOOLS,
};
use crate::{
    catalog::ToolDescriptor,
    config::AuthConfig,
    error::{GatewayError, GatewayResult},
};

#[derive(Debug)]
pub struct HttpTransport {
    server_name: String,
    url: Url,
    auth: AuthConfig,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(server_name: &str, url: &str, auth: AuthConfig) -> GatewayResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            GatewayError::ConfigValidation(format!(
                "server '{}': invalid url '{}': {}",
                server_name, url, e
            ))
        })?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            server_name: server_name.to_string(),
            url,
            auth,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
        bearer_override: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match &self.auth {
            AuthConfig::None => req,
            AuthConfig::Bearer { secret } => {
                let token = bearer_override.unwrap_or(secret.as_str());
                req.header(header::AUTHORIZATION, format!("Bearer {}", token))
            }
            AuthConfig::Basic { secret } => {
                req.header(header::AUTHORIZATION, format!("Basic {}", secret))
            }
            AuthConfig::Header { name, secret } => req.header(name.as_str(), secret.as_str()),
        }
    }

    fn classify_send_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout {
                server: self.server_name.clone(),
            }
        } else {
            GatewayError::UpstreamUnreachable {
                server: self.server_name.clone(),
                message: err.to_string(),
            }
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        bearer_override: Option<&str>,
    ) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = JsonRpcRequest::new(id, method, params);
        debug!("-> {} '{}' (id {})", method, self.server_name, id);

        let req = self.apply_auth(self.client.post(self.url.clone()).json(&body), bearer_override);
        let resp = req.send().await.map_err(|e| self.classify_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                code: i64::from(status.as_u16()),
                message,
            });
        }

        let envelope: JsonRpcResponse =
            resp.json()
                .await
                .map_err(|e| GatewayError::UpstreamProtocol {
                    server: self.server_name.clone(),
                    message: format!("malformed JSON-RPC envelope: {}", e),
                })?;

        if envelope.id != Some(id) {
            return Err(GatewayError::UpstreamProtocol {
                server: self.server_name.clone(),
                message: format!("response id {:?} does not match request id {}", envelope.id, id),
            });
        }

        envelope.into_result(&self.server_name)
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn list_tools(&self) -> GatewayResult<Vec<ToolDescriptor>> {
        let result = self.request(METHOD_LIST_TOOLS, None, None).await?;
        parse_tool_list(&self.server_name, result)
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        bearer_override: Option<&str>,
    ) -> GatewayResult<Value> {
        self.request(
            METHOD_CALL_TOOL,
            Some(call_params(name, args)),
            bearer_override,
        )
        .await
    }

    async fn close(&self) {
        // Pooled connections are released when the reqwest client drops.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unparseable_url() {
        let err = HttpTransport::new("pms", "not a url", AuthConfig::None).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigValidation(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_surfaces_as_unreachable() {
        // Port 9 (discard) is not listening in the test environment.
        let transport = HttpTransport::new("pms", "http://127.0.0.1:9/rpc", AuthConfig::None)
            .expect("transport");
        let err = transport.list_tools().await.unwrap_err();
        assert!(
            matches!(err, GatewayError::UpstreamUnreachable { ref server, .. } if server == "pms"),
            "got: {:?}",
            err
        );
    }
}
