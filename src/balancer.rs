use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::http;

/// 轮转游标：下一个要分到请求的槽位，取值 [1, pool_size]。
/// tokio 运行时是多线程的，"读 + 前进" 必须是一次原子操作
pub struct RotationCursor {
    pool_size: usize,
    current: AtomicUsize,
}

impl RotationCursor {
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            current: AtomicUsize::new(1),
        }
    }

    /// 取出当前槽位并前进一格，模 pool_size 回绕
    pub fn next(&self) -> usize {
        self.current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current % self.pool_size + 1)
            })
            .unwrap_or_else(|current| current)
    }
}

/// 负载均衡器主循环：接收公共连接并逐个交给代理任务。
/// 收到停机信号后跳出循环，监听 socket 随之关闭，不再接受新连接
pub async fn run_balancer(
    listener: TcpListener,
    base_port: u16,
    pool_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let cursor = Arc::new(RotationCursor::new(pool_size));
    info!("Balancer [{}] accepting on port {}", std::process::id(), base_port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let cursor = cursor.clone();
                        tokio::spawn(async move {
                            proxy_connection(stream, base_port, cursor).await;
                        });
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("Balancer draining: no longer accepting connections");
}

/// 代理一条客户端连接。保活连接上的每个请求单独轮转，
/// 同一条连接的后续请求会落到下一个槽位
pub async fn proxy_connection<S>(mut client: S, base_port: u16, cursor: Arc<RotationCursor>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head = match http::read_request_head(&mut client).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                debug!("client read error: {}", e);
                return;
            }
        };

        let slot = cursor.next();
        let target_port = base_port + slot as u16;

        let keep_alive = match proxy_request(&mut client, target_port, &head).await {
            Ok(keep_alive) => keep_alive,
            Err(ProxyError::UpstreamUnavailable { port, source }) => {
                warn!("upstream on port {} unavailable: {}", port, source);
                // 请求 body 可能还没读完，应答完错误就关连接
                let _ = http::write_json_response(
                    &mut client,
                    502,
                    "{\"message\":\"Upstream unavailable\"}",
                    false,
                )
                .await;
                return;
            }
            Err(e) => {
                debug!("proxy transfer error: {}", e);
                return;
            }
        };

        if !head.keep_alive || !keep_alive {
            return;
        }
    }
}

/// 把一个请求转给 target_port 的 worker 并把响应搬回来。
/// 返回上游响应是否允许继续保活
async fn proxy_request<S>(
    client: &mut S,
    target_port: u16,
    head: &http::RequestHead,
) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 每个请求一条全新的上游短连接
    let mut upstream = TcpStream::connect(("127.0.0.1", target_port))
        .await
        .map_err(|source| ProxyError::UpstreamUnavailable {
            port: target_port,
            source,
        })?;

    // 请求头原样转发，body 按自身的帧格式搬运
    upstream
        .write_all(&head.buf[..head.header_end])
        .await
        .map_err(ProxyError::Upstream)?;
    let body_prefix = head.body_prefix().to_vec();
    if head.chunked {
        http::relay_chunked(&mut *client, &mut upstream, body_prefix)
            .await
            .map_err(ProxyError::Upstream)?;
    } else {
        if !body_prefix.is_empty() {
            upstream.write_all(&body_prefix).await.map_err(ProxyError::Upstream)?;
        }
        if head.content_length > body_prefix.len() {
            http::relay_content_length(&mut *client, &mut upstream, head.content_length, body_prefix.len())
                .await
                .map_err(ProxyError::Upstream)?;
        }
    }
    upstream.flush().await.map_err(ProxyError::Upstream)?;

    let response = http::read_response_head(&mut upstream)
        .await
        .map_err(ProxyError::Upstream)?;

    client
        .write_all(&response.header)
        .await
        .map_err(ProxyError::Client)?;

    if response.info.chunked {
        http::relay_chunked(&mut upstream, &mut *client, response.body_prefix)
            .await
            .map_err(ProxyError::Upstream)?;
        Ok(response.info.keep_alive)
    } else if let Some(content_length) = response.info.content_length {
        if !response.body_prefix.is_empty() {
            client
                .write_all(&response.body_prefix)
                .await
                .map_err(ProxyError::Client)?;
        }
        http::relay_content_length(
            &mut upstream,
            &mut *client,
            content_length,
            response.body_prefix.len(),
        )
        .await
        .map_err(ProxyError::Upstream)?;
        Ok(response.info.keep_alive)
    } else {
        // 没有长度信息，搬到上游 EOF；这种响应之后连接无法复用
        if !response.body_prefix.is_empty() {
            client
                .write_all(&response.body_prefix)
                .await
                .map_err(ProxyError::Client)?;
        }
        http::relay_until_eof(&mut upstream, &mut *client)
            .await
            .map_err(ProxyError::Upstream)?;
        Ok(false)
    }
}
