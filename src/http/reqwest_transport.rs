use super::{HttpRequest, HttpResponse, HttpTransport, Method, RequestContext};
use crate::error::VersionError;
use reqwest::{Client, Proxy};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// 基于 reqwest 的传输层实现
///
/// reqwest 的代理与证书校验是客户端级别的设置，因此按 (proxy, verify_cert) 缓存客户端。
#[derive(Debug)]
pub struct ReqwestTransport {
    timeout: Duration,
    clients: Mutex<HashMap<(Option<String>, bool), Client>>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, ctx: &RequestContext) -> Result<Client, VersionError> {
        let key = (ctx.proxy.clone(), ctx.verify_cert);
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().timeout(self.timeout);
        if let Some(proxy) = &ctx.proxy {
            let proxy = Proxy::all(proxy)
                .map_err(|e| VersionError::config(format!("代理地址无效 {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        if !ctx.verify_cert {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| VersionError::unexpected(format!("创建HTTP客户端失败: {}", e)))?;

        debug!(proxy = ?ctx.proxy, verify_cert = ctx.verify_cert, "创建HTTP客户端");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        request: &HttpRequest,
        ctx: &RequestContext,
    ) -> Result<HttpResponse, VersionError> {
        let client = self.client_for(ctx)?;

        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Post => client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!(url = %request.url, "发送HTTP请求");
        let response = builder.send().await.map_err(classify_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(classify_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// 将 reqwest 错误映射到错误分类
fn classify_error(e: reqwest::Error) -> VersionError {
    if e.is_builder() {
        return VersionError::config(format!("请求构造失败: {}", e));
    }
    if let Some(status) = e.status() {
        let status = status.as_u16();
        if (400..500).contains(&status) {
            return VersionError::PermanentHttp {
                status,
                message: e.to_string(),
                retry_after: None,
            };
        }
        return VersionError::temporary(Some(status), e.to_string());
    }
    // 连接失败、超时、读取响应体失败都视为临时错误
    VersionError::temporary(None, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clients_are_reused_per_proxy_and_cert_setting() {
        let transport = ReqwestTransport::new(Duration::from_secs(5));
        let ctx = RequestContext::default();
        transport.client_for(&ctx).unwrap();
        transport.client_for(&ctx).unwrap();

        let insecure = RequestContext {
            verify_cert: false,
            ..Default::default()
        };
        transport.client_for(&insecure).unwrap();

        assert_eq!(transport.clients.lock().unwrap().len(), 2);
    }
}
