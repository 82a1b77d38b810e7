use std::io;
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::info;

/// 生成一个槽位的启动命令，spawn 和补位重启共用
pub type WorkerCommand = Box<dyn Fn(u16) -> Command + Send>;

/// 占据一个槽位的 worker 进程
pub struct WorkerHandle {
    /// 槽位端口，进程换了也不变
    pub port: u16,
    child: Child,
}

/// master 独占的 worker 进程表。槽位数量在创建后固定，
/// 崩溃只做原槽位替换
pub struct WorkerPool {
    base_port: u16,
    slots: Vec<WorkerHandle>,
    command: WorkerCommand,
}

impl WorkerPool {
    /// 拉起 count 个 worker，槽位 i 监听 base_port + 1 + i
    pub fn spawn(base_port: u16, count: usize, command: WorkerCommand) -> io::Result<Self> {
        let mut pool = Self {
            base_port,
            slots: Vec::with_capacity(count),
            command,
        };
        info!("Master [{}] starting {} workers...", std::process::id(), count);
        for slot in 0..count {
            let handle = pool.spawn_slot(slot)?;
            pool.slots.push(handle);
        }
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn handle(&self, slot: usize) -> Option<&WorkerHandle> {
        self.slots.get(slot)
    }

    fn spawn_slot(&self, slot: usize) -> io::Result<WorkerHandle> {
        let port = self.base_port + 1 + slot as u16;
        let mut command = (self.command)(port);
        command.kill_on_drop(true);
        let child = command.spawn()?;
        info!(
            "Worker [{}] spawned for slot {} on port {}",
            child.id().unwrap_or(0),
            slot,
            port
        );
        Ok(WorkerHandle { port, child })
    }

    /// 等下一个退出的 worker，返回槽位号和退出状态。
    /// 由监督任务独占消费，退出 → 补位的顺序因此有保证
    pub async fn wait_any_exit(&mut self) -> (usize, io::Result<ExitStatus>) {
        if self.slots.is_empty() {
            return std::future::pending().await;
        }
        let waits = self
            .slots
            .iter_mut()
            .enumerate()
            .map(|(slot, handle)| Box::pin(async move { (slot, handle.child.wait().await) }));
        let (result, _, _) = futures::future::select_all(waits).await;
        result
    }

    /// 原槽位补一个新进程，端口复用死掉那个的
    pub fn respawn(&mut self, slot: usize) -> io::Result<()> {
        let handle = self.spawn_slot(slot)?;
        self.slots[slot] = handle;
        Ok(())
    }

    /// 杀掉并等待全部 worker。所有进程都被回收后才返回
    pub async fn shutdown(&mut self) {
        for handle in &mut self.slots {
            // 已经退出的进程 start_kill 会报错，忽略即可
            let _ = handle.child.start_kill();
        }
        for mut handle in self.slots.drain(..) {
            if let Ok(status) = handle.child.wait().await {
                info!("Worker on port {} stopped ({})", handle.port, status);
            }
        }
    }
}
