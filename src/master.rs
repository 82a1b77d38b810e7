use std::env;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use tokio::process::Command;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{error, info, warn};

use crate::balancer::run_balancer;
use crate::config::ClusterConfig;
use crate::listener::create_listener;
use crate::pool::{WorkerCommand, WorkerPool};

/// master 进程：拉起 worker 池、运行负载均衡器并监督子进程
pub async fn run_master_process() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClusterConfig::from_env();
    let self_exe = env::current_exe()?;

    let mut pool = WorkerPool::spawn(config.base_port, config.worker_count, worker_command(self_exe))?;

    // 公共端口不等 worker 全部就绪就开始收请求；窗口期内按上游不可用应答
    let listener = create_listener(Ipv4Addr::UNSPECIFIED.into(), config.base_port)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let balancer = tokio::spawn(run_balancer(listener, config.base_port, pool.size(), shutdown_rx));

    supervise(&mut pool, async {
        let _ = signal::ctrl_c().await;
        info!("Master: shutdown signal received");
    })
    .await;

    terminate(pool, shutdown_tx, balancer).await;
    Ok(())
}

/// 监督循环：崩溃补位和停机信号是同一个 select 的两个分支，
/// 停机一旦开始就不可能再触发补位。shutdown 完成后返回
async fn supervise(pool: &mut WorkerPool, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    'supervise: loop {
        tokio::select! {
            _ = &mut shutdown => break,
            (slot, status) = pool.wait_any_exit() => {
                let port = pool.handle(slot).map(|h| h.port).unwrap_or(0);
                match status {
                    Ok(status) => warn!("Worker at slot {} (port {}) died ({})", slot, port, status),
                    Err(e) => warn!("Worker at slot {} (port {}) lost: {}", slot, port, e),
                }
                // 补位失败就地退避重试；退避也在 select 里，停机不用等它
                while let Err(e) = pool.respawn(slot) {
                    error!("Master: failed to respawn slot {}: {}", slot, e);
                    tokio::select! {
                        _ = &mut shutdown => break 'supervise,
                        _ = time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }
}

/// 停机序列 Running → Draining → Stopped，进程生命周期内只走一次
pub async fn terminate(
    mut pool: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    balancer: JoinHandle<()>,
) {
    // Draining：均衡器跳出 accept 循环，公共监听 socket 关闭
    let _ = shutdown_tx.send(true);
    let _ = balancer.await;

    // Stopped：每个 worker 都被杀掉并回收之后才返回
    pool.shutdown().await;
    info!("Master: pool stopped");
}

fn worker_command(exe: PathBuf) -> WorkerCommand {
    Box::new(move |port| {
        let mut command = Command::new(&exe);
        command.arg("--worker").env("WORKER_PORT", port.to_string());
        command
    })
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    fn sleep_command() -> WorkerCommand {
        Box::new(|_port| {
            let mut command = Command::new("sleep");
            command.arg("30");
            command
        })
    }

    #[tokio::test]
    async fn respawn_backoff_does_not_delay_shutdown() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        // 第一个进程立刻退出，之后的补位命令永远起不来
        let calls = Arc::new(AtomicUsize::new(0));
        let command: WorkerCommand = {
            let calls = calls.clone();
            Box::new(move |_port| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Command::new("true")
                } else {
                    Command::new("/nonexistent-worker-binary")
                }
            })
        };

        let mut pool = WorkerPool::spawn(15100, 1, command).unwrap();
        let started = tokio::time::Instant::now();
        supervise(&mut pool, time::sleep(Duration::from_millis(200))).await;
        // 补位退避期间停机信号也要立即生效，不能等满一整秒
        assert!(started.elapsed() < Duration::from_millis(900));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn terminate_closes_listener_and_reaps_workers() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = listener.local_addr().unwrap().port();

        let pool = WorkerPool::spawn(15000, 2, sleep_command()).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let balancer = tokio::spawn(run_balancer(listener, base, 2, shutdown_rx));

        timeout(Duration::from_secs(5), terminate(pool, shutdown_tx, balancer))
            .await
            .unwrap();

        // Draining 之后公共端口不再接受连接
        assert!(TcpStream::connect(("127.0.0.1", base)).await.is_err());
    }
}
