use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub capacity: CapacityConfig,
    pub session_pool: SessionPoolConfig,
    pub executor: ExecutorConfig,
    pub agent: AgentConfig,
    pub webhooks: WebhookConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// 准入循环轮询间隔（毫秒），决定最坏情况的调度延迟
    pub poll_interval_ms: u64,
    /// 每次轮询从存储读取的 pending 任务上限
    pub batch_size: u32,
    /// 持久化写失败的最大重试次数
    pub persistence_retry_attempts: u32,
    /// 持久化重试的基础退避间隔（毫秒）
    pub persistence_retry_base_ms: u64,
    /// 关停时直接中止在途任务；为 false 时等待在途任务收尾
    pub abort_on_shutdown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapacityConfig {
    /// 每个 CPU 允许的并发任务数
    pub tasks_per_cpu: usize,
    /// 单任务预估内存占用（MB）
    pub memory_per_task_mb: u64,
    /// 并发上限的绝对封顶
    pub absolute_cap: usize,
    /// 容量重估间隔（秒）
    pub refresh_interval_seconds: u64,
    /// 静态并发上限，设置后不再做系统资源探测
    pub static_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPoolConfig {
    pub max_sessions: usize,
    /// 空闲超过该时长的会话会被回收（秒）
    pub idle_timeout_seconds: u64,
    /// 池满时等待会话释放的轮询间隔（毫秒）
    pub acquire_poll_interval_ms: u64,
    /// 回收循环的运行间隔（秒）
    pub reclaim_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// 任务未指定时的默认执行截止时间（秒）
    pub default_timeout_seconds: u64,
    pub cache_enabled: bool,
    /// 结果缓存有效期（秒）
    pub cache_ttl_seconds: u64,
    pub headless: bool,
}

/// 外部浏览器代理进程的桥接配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// 代理可执行程序，任务请求经 stdin 传入，结果从 stdout 读出
    pub command: String,
    pub args: Vec<String>,
    /// 会话对应的浏览器进程
    pub browser_command: String,
    pub browser_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub run_url: String,
    pub error_url: String,
    pub status_url: String,
    /// 单次投递的发送超时（毫秒），超时后放弃而不是阻塞派发路径
    pub send_timeout_ms: u64,
    /// 指标事件的上报间隔（秒）
    pub metrics_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://webtask.db".to_string(),
                max_connections: 10,
                connection_timeout_seconds: 30,
            },
            scheduler: SchedulerConfig {
                poll_interval_ms: 1000,
                batch_size: 10,
                persistence_retry_attempts: 3,
                persistence_retry_base_ms: 100,
                abort_on_shutdown: true,
            },
            capacity: CapacityConfig {
                tasks_per_cpu: 2,
                memory_per_task_mb: 400,
                absolute_cap: 32,
                refresh_interval_seconds: 30,
                static_limit: None,
            },
            session_pool: SessionPoolConfig {
                max_sessions: 5,
                idle_timeout_seconds: 300,
                acquire_poll_interval_ms: 100,
                reclaim_interval_seconds: 60,
            },
            executor: ExecutorConfig {
                default_timeout_seconds: 300,
                cache_enabled: true,
                cache_ttl_seconds: 300,
                headless: true,
            },
            agent: AgentConfig {
                command: "webtask-agent".to_string(),
                args: Vec::new(),
                browser_command: "chromium".to_string(),
                browser_args: vec!["--headless=new".to_string()],
            },
            webhooks: WebhookConfig {
                run_url: String::new(),
                error_url: String::new(),
                status_url: String::new(),
                send_timeout_ms: 5000,
                metrics_interval_seconds: 30,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/webtask.toml", "webtask.toml", "/etc/webtask/config.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = Self::set_defaults(builder)?;

        // 环境变量覆盖，如 WEBTASK_DATABASE__URL
        builder = builder.add_source(
            Environment::with_prefix("WEBTASK")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("构建配置失败")?;
        let app_config: AppConfig = config.try_deserialize().context("解析配置失败")?;
        Ok(app_config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(builder
            .set_default("database.url", "sqlite://webtask.db")?
            .set_default("database.max_connections", 10)?
            .set_default("database.connection_timeout_seconds", 30)?
            .set_default("scheduler.poll_interval_ms", 1000)?
            .set_default("scheduler.batch_size", 10)?
            .set_default("scheduler.persistence_retry_attempts", 3)?
            .set_default("scheduler.persistence_retry_base_ms", 100)?
            .set_default("scheduler.abort_on_shutdown", true)?
            .set_default("capacity.tasks_per_cpu", 2)?
            .set_default("capacity.memory_per_task_mb", 400)?
            .set_default("capacity.absolute_cap", 32)?
            .set_default("capacity.refresh_interval_seconds", 30)?
            .set_default("capacity.static_limit", None::<i64>)?
            .set_default("session_pool.max_sessions", 5)?
            .set_default("session_pool.idle_timeout_seconds", 300)?
            .set_default("session_pool.acquire_poll_interval_ms", 100)?
            .set_default("session_pool.reclaim_interval_seconds", 60)?
            .set_default("executor.default_timeout_seconds", 300)?
            .set_default("executor.cache_enabled", true)?
            .set_default("executor.cache_ttl_seconds", 300)?
            .set_default("executor.headless", true)?
            .set_default("agent.command", "webtask-agent")?
            .set_default("agent.args", Vec::<String>::new())?
            .set_default("agent.browser_command", "chromium")?
            .set_default("agent.browser_args", vec!["--headless=new".to_string()])?
            .set_default("webhooks.run_url", "")?
            .set_default("webhooks.error_url", "")?
            .set_default("webhooks.status_url", "")?
            .set_default("webhooks.send_timeout_ms", 5000)?
            .set_default("webhooks.metrics_interval_seconds", 30)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "pretty")?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("数据库连接串不能为空");
        }
        if self.scheduler.poll_interval_ms == 0 {
            anyhow::bail!("调度轮询间隔必须大于 0");
        }
        if self.scheduler.batch_size == 0 {
            anyhow::bail!("调度批量大小必须大于 0");
        }
        if self.capacity.tasks_per_cpu == 0 {
            anyhow::bail!("每 CPU 任务数必须大于 0");
        }
        if self.capacity.absolute_cap == 0 {
            anyhow::bail!("并发上限封顶必须大于 0");
        }
        if self.session_pool.max_sessions == 0 {
            anyhow::bail!("会话池容量必须大于 0");
        }
        if self.executor.default_timeout_seconds == 0 {
            anyhow::bail!("默认执行超时必须大于 0");
        }
        if self.agent.command.is_empty() {
            anyhow::bail!("代理命令不能为空");
        }
        if let Some(limit) = self.capacity.static_limit {
            if limit == 0 {
                anyhow::bail!("静态并发上限必须大于 0");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity.tasks_per_cpu, 2);
        assert_eq!(config.capacity.memory_per_task_mb, 400);
        assert_eq!(config.capacity.absolute_cap, 32);
        assert_eq!(config.executor.cache_ttl_seconds, 300);
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.session_pool.max_sessions, 5);
        assert_eq!(config.session_pool.idle_timeout_seconds, 300);
        assert!(config.capacity.static_limit.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[scheduler]
poll_interval_ms = 250
batch_size = 5

[capacity]
static_limit = 4
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.scheduler.poll_interval_ms, 250);
        assert_eq!(config.scheduler.batch_size, 5);
        assert_eq!(config.capacity.static_limit, Some(4));
        // 未覆盖的 section 保持默认
        assert_eq!(config.executor.default_timeout_seconds, 300);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/webtask.toml")).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = AppConfig::default();
        config.scheduler.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session_pool.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.capacity.static_limit = Some(0);
        assert!(config.validate().is_err());
    }
}
