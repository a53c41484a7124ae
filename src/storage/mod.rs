pub mod verfile;

pub use verfile::VerFile;

use crate::error::AppResult;
use crate::models::ResultRecord;

/// 版本记录存储抽象
#[async_trait::async_trait]
pub trait VersionStore: Send + Sync {
    /// 读取全部记录；存储不存在时返回空集
    async fn load(&self) -> AppResult<ResultRecord>;

    /// 整体覆盖写入
    async fn save(&self, records: &ResultRecord) -> AppResult<()>;
}
