use std::collections::HashMap;

use super::BatchSource;
use crate::error::VersionError;
use crate::http::{HttpRequest, HttpSession, RequestContext};
use crate::models::{Entry, RichResult, VersionResult};

const AUR_URL: &str = "https://aur.archlinux.org/rpc/";

/// AUR 接口每次查询的上限
const AUR_BATCH_SIZE: usize = 100;

/// Arch User Repository：一次请求查询一批软件包
#[derive(Debug, Clone)]
pub struct AurSource {
    url: String,
}

impl Default for AurSource {
    fn default() -> Self {
        Self {
            url: AUR_URL.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl BatchSource for AurSource {
    fn configure(&mut self, config: &toml::Table) -> Result<(), VersionError> {
        if let Some(url) = config.get("url") {
            self.url = url
                .as_str()
                .ok_or_else(|| VersionError::config("aur url 必须是字符串"))?
                .to_string();
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        AUR_BATCH_SIZE
    }

    fn lookup_key(&self, entry: &Entry) -> String {
        entry.get_str("aur").unwrap_or(&entry.name).to_string()
    }

    async fn fetch_batch(
        &self,
        keys: &[String],
        session: &HttpSession,
        ctx: &RequestContext,
    ) -> Result<HashMap<String, serde_json::Value>, VersionError> {
        let request = keys.iter().fold(
            HttpRequest::get(self.url.as_str())
                .query("v", "5")
                .query("type", "info"),
            |req, key| req.query("arg[]", key.as_str()),
        );
        let data: serde_json::Value = session.request(request, ctx).await?.json()?;
        let results = data
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| VersionError::plugin("AUR 响应中缺少 results"))?;

        Ok(results
            .iter()
            .filter_map(|r| {
                let name = r.get("Name")?.as_str()?;
                Some((name.to_string(), r.clone()))
            })
            .collect())
    }

    fn extract(
        &self,
        entry: &Entry,
        found: Option<&serde_json::Value>,
    ) -> Result<VersionResult, VersionError> {
        let found = found.ok_or_else(|| VersionError::plugin("AUR upstream not found"))?;
        let mut version = found
            .get("Version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| VersionError::plugin("AUR 结果中缺少 Version"))?
            .to_string();

        if entry.flag("use_last_modified") {
            let ts = found
                .get("LastModified")
                .and_then(|v| v.as_i64())
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .ok_or_else(|| VersionError::plugin("AUR 结果中缺少 LastModified"))?;
            version = format!("{}-{}", version, ts.format("%Y%m%d%H%M%S"));
        }
        if entry.flag("strip_release") {
            if let Some((base, _)) = version.rsplit_once('-') {
                version = base.to_string();
            }
        }

        let package = self.lookup_key(entry);
        Ok(RichResult::new(version)
            .with_url(format!("https://aur.archlinux.org/packages/{}", package))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::MockTransport;
    use crate::sources::testing::entry;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_batch_sends_all_keys() {
        let transport = MockTransport::new();
        transport.push_json(
            AUR_URL,
            json!({"results": [{"Name": "yay", "Version": "12.3.5-1"}]}),
        );
        let keys = vec!["yay".to_string(), "paru".to_string()];
        let found = AurSource::default()
            .fetch_batch(&keys, &transport.session(), &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("yay"));

        let requests = transport.requests.lock().unwrap();
        let args: Vec<_> = requests[0]
            .query
            .iter()
            .filter(|(k, _)| k == "arg[]")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(args, vec!["yay", "paru"]);
    }

    #[test]
    fn test_extract_options() {
        let source = AurSource::default();
        let data = json!({"Name": "yay", "Version": "12.3.5-1", "LastModified": 1700000000});

        let plain = source.extract(&entry("yay", ""), Some(&data)).unwrap();
        assert!(matches!(plain, VersionResult::Rich(ref r) if r.version == "12.3.5-1"));

        let stripped = source
            .extract(&entry("yay", "strip_release = true"), Some(&data))
            .unwrap();
        assert!(matches!(stripped, VersionResult::Rich(ref r) if r.version == "12.3.5"));

        let modified = source
            .extract(&entry("yay", "use_last_modified = true"), Some(&data))
            .unwrap();
        assert!(
            matches!(modified, VersionResult::Rich(ref r) if r.version == "12.3.5-1-20231114221320")
        );

        let missing = source.extract(&entry("nope", ""), None).unwrap_err();
        assert_eq!(missing, VersionError::plugin("AUR upstream not found"));
    }
}
