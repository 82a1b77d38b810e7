use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::api::UserStore;
use crate::config::WorkerConfig;
use crate::http;
use crate::listener::create_listener;

/// worker 进程：在私有端口上跑一份独立的 Handler。
/// 每个 worker 的代码完全一样，只有 WORKER_PORT 不同
pub async fn run_worker_process() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env()?;
    // 每个 worker 各有一份易失存储，互不共享
    let store = Arc::new(UserStore::new());

    let listener = create_listener(Ipv4Addr::LOCALHOST.into(), config.port)?;

    let id = std::process::id();
    info!("Worker [{}] started on port {}", id, config.port);

    // 主循环：接受连接并交给异步任务处理
    loop {
        let (stream, _) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            serve_connection(stream, store).await;
        });
    }
}

/// 处理一条连接上的请求序列，按 HTTP/1.1 保活语义复用连接
pub async fn serve_connection<S>(mut stream: S, store: Arc<UserStore>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head = match http::read_request_head(&mut stream).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                debug!("connection read error: {}", e);
                return;
            }
        };

        let body = match http::read_request_body(&mut stream, &head).await {
            Ok(body) => body,
            Err(e) => {
                debug!("body read error: {}", e);
                return;
            }
        };

        let response = store.handle(&head.method, &head.path, &body);
        if http::write_json_response(&mut stream, response.status, &response.body, head.keep_alive)
            .await
            .is_err()
        {
            return;
        }
        if !head.keep_alive {
            return;
        }
    }
}
