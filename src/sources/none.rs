use super::{FetchContext, VersionSource};
use crate::error::VersionError;
use crate::models::{Entry, VersionResult};

/// 未指定来源的条目：总是失败
pub struct NoneSource;

#[async_trait::async_trait]
impl VersionSource for NoneSource {
    async fn fetch(
        &self,
        _entry: &Entry,
        _ctx: &FetchContext,
    ) -> Result<VersionResult, VersionError> {
        Err(VersionError::plugin("no source specified"))
    }
}
