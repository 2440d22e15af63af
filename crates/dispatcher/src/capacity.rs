//! 并发容量估算
//!
//! 根据 CPU 核数和可用内存推导同时运行的任务上限，周期刷新。
//! 运行中的派发单元不受容量下调影响，只有新的准入受限。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use webtask_config::CapacityConfig;

/// 系统资源探测接口，便于测试时注入固定值
pub trait ResourceProbe: Send + Sync {
    fn cpu_count(&self) -> Option<usize>;
    fn available_memory_mb(&self) -> Option<u64>;
}

/// 读取真实系统资源
pub struct SystemResourceProbe;

impl ResourceProbe for SystemResourceProbe {
    fn cpu_count(&self) -> Option<usize> {
        std::thread::available_parallelism().ok().map(|n| n.get())
    }

    fn available_memory_mb(&self) -> Option<u64> {
        // MemAvailable 行形如 "MemAvailable:    8123456 kB"
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemAvailable:") {
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb / 1024);
            }
        }
        None
    }
}

/// 固定返回值的探测器
pub struct StaticResourceProbe {
    pub cpus: Option<usize>,
    pub memory_mb: Option<u64>,
}

impl ResourceProbe for StaticResourceProbe {
    fn cpu_count(&self) -> Option<usize> {
        self.cpus
    }

    fn available_memory_mb(&self) -> Option<u64> {
        self.memory_mb
    }
}

pub struct CapacityEstimator {
    config: CapacityConfig,
    probe: Box<dyn ResourceProbe>,
    current: AtomicUsize,
}

impl CapacityEstimator {
    pub fn new(config: CapacityConfig, probe: Box<dyn ResourceProbe>) -> Self {
        let estimator = Self {
            config,
            probe,
            current: AtomicUsize::new(1),
        };
        estimator.refresh();
        estimator
    }

    /// 当前生效的并发上限
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// 底层资源探测器，指标上报用它读取原始读数
    pub fn probe(&self) -> &dyn ResourceProbe {
        self.probe.as_ref()
    }

    /// 重新探测并更新容量，返回新值
    pub fn refresh(&self) -> usize {
        let new_limit = self.estimate();
        let old = self.current.swap(new_limit, Ordering::SeqCst);
        if old != new_limit {
            info!("并发容量从 {} 调整为 {}", old, new_limit);
        } else {
            debug!("并发容量保持 {}", new_limit);
        }
        new_limit
    }

    fn estimate(&self) -> usize {
        if let Some(fixed) = self.config.static_limit {
            return fixed.max(1);
        }

        let by_cpu = match self.probe.cpu_count() {
            Some(cpus) => cpus * self.config.tasks_per_cpu,
            None => {
                warn!("CPU 探测失败，容量回退为 1");
                return 1;
            }
        };
        let by_memory = match self.probe.available_memory_mb() {
            Some(mb) => (mb / self.config.memory_per_task_mb) as usize,
            None => {
                warn!("内存探测失败，容量回退为 1");
                return 1;
            }
        };

        by_cpu.min(by_memory).min(self.config.absolute_cap).max(1)
    }

    /// 周期刷新循环，收到关停信号后退出
    pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        info!("容量刷新循环启动，间隔 {:?}", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.refresh();
                }
                _ = shutdown_rx.recv() => {
                    info!("容量刷新循环退出");
                    return;
                }
            }
        }
    }
}
