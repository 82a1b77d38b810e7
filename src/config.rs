use std::env;
use std::thread;

/// 公共端口的默认值，与 PORT 环境变量对应
const DEFAULT_BASE_PORT: u16 = 4000;

/// master 进程的集群配置：公共端口与 worker 数量
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// 负载均衡器监听的公共端口
    pub base_port: u16,
    /// worker 进程数量，固定为 max(1, 核心数 - 1)
    pub worker_count: usize,
}

impl ClusterConfig {
    /// 按 "留一个核心给均衡器" 的规则计算 worker 数量
    pub fn new(base_port: u16, parallelism: usize) -> Self {
        Self {
            base_port,
            worker_count: parallelism.saturating_sub(1).max(1),
        }
    }

    /// 从环境读取配置：PORT 指定公共端口，可用核心数决定 worker 数量
    pub fn from_env() -> Self {
        let base_port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_BASE_PORT);
        let parallelism = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::new(base_port, parallelism)
    }
}

/// worker 进程的配置，启动时从环境读取一次
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// 本 worker 监听的私有端口
    pub port: u16,
}

impl WorkerConfig {
    /// WORKER_PORT 由 master 在创建子进程时显式写入环境
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let port = env::var("WORKER_PORT")?.parse()?;
        Ok(Self { port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_reserves_one_core() {
        assert_eq!(ClusterConfig::new(4000, 4).worker_count, 3);
        assert_eq!(ClusterConfig::new(4000, 2).worker_count, 1);
    }

    #[test]
    fn worker_count_has_floor_of_one() {
        assert_eq!(ClusterConfig::new(4000, 1).worker_count, 1);
        assert_eq!(ClusterConfig::new(4000, 0).worker_count, 1);
    }
}
