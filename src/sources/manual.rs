use super::{FetchContext, VersionSource};
use crate::error::VersionError;
use crate::models::{Entry, VersionResult};

/// 手动指定的版本（`manual = "1.2.3"`）
pub struct ManualSource;

#[async_trait::async_trait]
impl VersionSource for ManualSource {
    async fn fetch(
        &self,
        entry: &Entry,
        _ctx: &FetchContext,
    ) -> Result<VersionResult, VersionError> {
        entry
            .get_scalar("manual")
            .map(VersionResult::Single)
            .ok_or_else(|| VersionError::config("缺少配置项 `manual`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::MockTransport;
    use crate::sources::testing::{entry, fetch_context};

    #[tokio::test]
    async fn test_manual_accepts_numbers() {
        let ctx = fetch_context(&MockTransport::new());
        let result = ManualSource
            .fetch(&entry("a", "manual = 42"), &ctx)
            .await
            .unwrap();
        assert_eq!(result, VersionResult::Single("42".into()));

        let err = ManualSource.fetch(&entry("b", ""), &ctx).await.unwrap_err();
        assert!(matches!(err, VersionError::Config(_)));
    }
}
