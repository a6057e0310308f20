//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 参数校验失败（空 key、非法 channel 名等）
    #[error("校验错误: {0}")]
    Validation(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// Postgres 错误
    #[cfg(feature = "postgres")]
    #[error("Postgres 错误: {0}")]
    Postgres(#[from] sqlx::Error),

    /// 存储/发布基础设施错误
    #[error("存储错误: {0}")]
    Store(String),

    /// 订阅连接丢失或无法建立
    #[error("订阅错误: {0}")]
    Subscription(String),

    /// 通知载荷解码失败
    #[error("解码错误: {0}")]
    Decode(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 错误分类
///
/// 决定错误的传播方式：写路径把 `Store` 返回给调用方，发布路径只记日志；
/// `Subscription` 以终止帧的形式送达会话；`Decode` 在订阅池边界丢弃。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Store,
    Subscription,
    Decode,
}

impl Error {
    /// 错误所属分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::Validation,
            Error::Subscription(_) => ErrorKind::Subscription,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Database(_)
            | Error::Store(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Other(_) => ErrorKind::Store,
            #[cfg(feature = "postgres")]
            Error::Postgres(_) => ErrorKind::Store,
        }
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::Validation("empty key".into()).kind(), ErrorKind::Validation);
        assert_eq!(Error::Store("gone".into()).kind(), ErrorKind::Store);
        assert_eq!(
            Error::Database(rusqlite::Error::QueryReturnedNoRows).kind(),
            ErrorKind::Store
        );
        assert_eq!(Error::Subscription("reset".into()).kind(), ErrorKind::Subscription);
        assert_eq!(Error::Decode("bad json".into()).kind(), ErrorKind::Decode);
    }
}
