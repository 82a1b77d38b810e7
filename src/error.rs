use std::io;

use thiserror::Error;

/// 代理单个请求时可能出现的错误
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 无法连到选中的 worker 端口（worker 还在启动，或刚崩溃还没补位）
    #[error("upstream on port {port} unavailable: {source}")]
    UpstreamUnavailable { port: u16, source: io::Error },

    /// 与 worker 之间的读写失败
    #[error("upstream i/o error: {0}")]
    Upstream(#[source] io::Error),

    /// 与客户端之间的读写失败
    #[error("client i/o error: {0}")]
    Client(#[source] io::Error),
}
