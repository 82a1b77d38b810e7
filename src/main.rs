use std::env;

use tracing_subscriber::EnvFilter;

mod api;
mod balancer;
mod config;
mod error;
mod http;
mod listener;
mod master;
mod pool;
mod worker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 日志级别由 RUST_LOG 控制，默认 info；worker 子进程继承同样的环境
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 获取命令行参数
    let args: Vec<String> = env::args().collect();

    // 简单的参数路由
    if args.len() > 1 && args[1] == "--worker" {
        // 如果有 --worker 参数，就当员工
        worker::run_worker_process().await?;
    } else {
        // 否则就当老板
        master::run_master_process().await?;
    }

    Ok(())
}
