//! 外部代理进程桥接
//!
//! 浏览器会话是一个带远程调试端口的浏览器进程；代理是一个按任务
//! 启动的子进程，任务请求从 stdin 传入，结构化结果从 stdout 最后
//! 一行 JSON 读出。取消通过保留的子进程句柄直接终止。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use webtask_config::AgentConfig;
use webtask_domain::{AgentExecutor, AgentRunResult, BrowserHandle, ExecutionConfig, SessionFactory};
use webtask_errors::{WebTaskError, WebTaskResult};

/// 一个独占的浏览器进程会话
pub struct ProcessBrowserSession {
    child: Mutex<Option<Child>>,
    cdp_port: u16,
}

#[async_trait]
impl BrowserHandle for ProcessBrowserSession {
    fn endpoint(&self) -> Option<String> {
        Some(format!("http://127.0.0.1:{}", self.cdp_port))
    }

    async fn close(&self) -> WebTaskResult<()> {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                return Err(WebTaskError::execution_error(format!("关闭浏览器进程失败: {e}")));
            }
            let _ = child.wait().await;
            debug!("浏览器进程已关闭，端口 {}", self.cdp_port);
        }
        Ok(())
    }
}

/// 启动浏览器进程的会话工厂
pub struct ProcessSessionFactory {
    config: AgentConfig,
}

impl ProcessSessionFactory {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    fn pick_free_port() -> WebTaskResult<u16> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| WebTaskError::SessionCreation(format!("分配调试端口失败: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| WebTaskError::SessionCreation(format!("读取调试端口失败: {e}")))?
            .port();
        Ok(port)
    }
}

#[async_trait]
impl SessionFactory for ProcessSessionFactory {
    async fn create(&self) -> WebTaskResult<Box<dyn BrowserHandle>> {
        let cdp_port = Self::pick_free_port()?;

        let mut cmd = Command::new(&self.config.browser_command);
        cmd.args(&self.config.browser_args)
            .arg(format!("--remote-debugging-port={cdp_port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            WebTaskError::SessionCreation(format!(
                "启动浏览器进程 {} 失败: {e}",
                self.config.browser_command
            ))
        })?;

        info!("浏览器进程已启动，调试端口 {}", cdp_port);
        Ok(Box::new(ProcessBrowserSession {
            child: Mutex::new(Some(child)),
            cdp_port,
        }))
    }
}

/// 以子进程方式运行外部浏览器代理
pub struct ProcessAgentExecutor {
    config: AgentConfig,
    /// 在途代理进程的句柄，供取消方直接终止
    running: Arc<RwLock<HashMap<i64, Arc<Mutex<Option<Child>>>>>>,
}

impl ProcessAgentExecutor {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 喂入请求、读完输出、回收进程。取消方先取走句柄时视为已取消。
    async fn drive(
        request: serde_json::Value,
        mut stdin: ChildStdin,
        mut stdout: ChildStdout,
        mut stderr: ChildStderr,
        slot: &Mutex<Option<Child>>,
    ) -> WebTaskResult<AgentRunResult> {
        stdin
            .write_all(request.to_string().as_bytes())
            .await
            .map_err(|e| WebTaskError::execution_error(format!("写入任务请求失败: {e}")))?;
        drop(stdin);

        // 两个管道并发读，避免任一缓冲区写满后互相卡死
        let mut out = String::new();
        let mut err_out = String::new();
        tokio::try_join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err_out))
            .map_err(|e| WebTaskError::execution_error(format!("读取代理输出失败: {e}")))?;

        let child = slot.lock().await.take();
        let Some(mut child) = child else {
            return Err(WebTaskError::execution_error("代理进程已被取消"));
        };
        let status = child
            .wait()
            .await
            .map_err(|e| WebTaskError::execution_error(format!("等待代理进程失败: {e}")))?;

        if !status.success() {
            return Err(WebTaskError::execution_error(format!(
                "代理进程退出码 {:?}: {}",
                status.code(),
                err_out.trim()
            )));
        }

        Self::parse_result(&out)
    }

    fn parse_result(stdout: &str) -> WebTaskResult<AgentRunResult> {
        // 代理可能先打印日志，结果约定在最后一行非空 JSON
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| WebTaskError::execution_error("代理没有输出结果"))?;
        serde_json::from_str(line.trim())
            .map_err(|e| WebTaskError::execution_error(format!("解析代理结果失败: {e}")))
    }
}

#[async_trait]
impl AgentExecutor for ProcessAgentExecutor {
    async fn run(
        &self,
        task_id: i64,
        session: &dyn BrowserHandle,
        instruction: &str,
        config: &ExecutionConfig,
    ) -> WebTaskResult<AgentRunResult> {
        let request = json!({
            "task_id": task_id,
            "instruction": instruction,
            "config": config,
            "browser_endpoint": session.endpoint(),
        });

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(endpoint) = session.endpoint() {
            cmd.env("WEBTASK_BROWSER_ENDPOINT", endpoint);
        }

        let mut child = cmd.spawn().map_err(|e| {
            WebTaskError::execution_error(format!("启动代理进程 {} 失败: {e}", self.config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WebTaskError::execution_error("无法获取代理进程 stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WebTaskError::execution_error("无法获取代理进程 stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WebTaskError::execution_error("无法获取代理进程 stderr"))?;

        let slot = Arc::new(Mutex::new(Some(child)));
        self.running.write().await.insert(task_id, Arc::clone(&slot));

        let outcome = Self::drive(request, stdin, stdout, stderr, &slot).await;
        self.running.write().await.remove(&task_id);
        outcome
    }

    async fn cancel(&self, task_id: i64) -> WebTaskResult<()> {
        let slot = self.running.write().await.remove(&task_id);
        let Some(slot) = slot else {
            debug!("任务 {} 没有在途代理进程，无需取消", task_id);
            return Ok(());
        };

        let child = slot.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };
        child
            .kill()
            .await
            .map_err(|e| WebTaskError::execution_error(format!("终止代理进程失败: {e}")))?;
        info!("任务 {} 的代理进程已终止", task_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn agent_config(command: &str, args: &[&str]) -> AgentConfig {
        AgentConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            browser_command: "sleep".to_string(),
            browser_args: vec!["30".to_string()],
        }
    }

    struct NoEndpointSession;

    #[async_trait]
    impl BrowserHandle for NoEndpointSession {
        async fn close(&self) -> WebTaskResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_parses_last_json_line() {
        let executor = ProcessAgentExecutor::new(agent_config(
            "sh",
            &[
                "-c",
                r#"cat > /dev/null; echo "正在执行"; echo '{"success":true,"result":"完成","steps_executed":2,"videopath":null}'"#,
            ],
        ));

        let result = executor
            .run(1, &NoEndpointSession, "打开首页", &ExecutionConfig::default())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.result, "完成");
        assert_eq!(result.steps_executed, 2);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let executor = ProcessAgentExecutor::new(agent_config(
            "sh",
            &["-c", "cat > /dev/null; echo '浏览器崩溃' >&2; exit 3"],
        ));

        let err = executor
            .run(1, &NoEndpointSession, "打开首页", &ExecutionConfig::default())
            .await
            .unwrap_err();
        match err {
            WebTaskError::TaskExecution(msg) => {
                assert!(msg.contains("3"));
                assert!(msg.contains("浏览器崩溃"));
            }
            other => panic!("意外的错误类型: {other}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_output_is_execution_error() {
        let executor = ProcessAgentExecutor::new(agent_config(
            "sh",
            &["-c", "cat > /dev/null; echo '不是 JSON'"],
        ));

        let err = executor
            .run(1, &NoEndpointSession, "打开首页", &ExecutionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebTaskError::TaskExecution(_)));
    }

    #[tokio::test]
    async fn test_missing_command_fails_to_spawn() {
        let executor =
            ProcessAgentExecutor::new(agent_config("/nonexistent/webtask-agent", &[]));
        let err = executor
            .run(1, &NoEndpointSession, "打开首页", &ExecutionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WebTaskError::TaskExecution(_)));
    }

    #[tokio::test]
    async fn test_session_factory_spawns_and_closes_process() {
        let factory = ProcessSessionFactory::new(agent_config("sh", &[]));
        let session = factory.create().await.unwrap();
        assert!(session.endpoint().unwrap().starts_with("http://127.0.0.1:"));
        session.close().await.unwrap();
        // 重复 close 幂等
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_factory_spawn_failure() {
        let mut config = agent_config("sh", &[]);
        config.browser_command = "/nonexistent/browser".to_string();
        let factory = ProcessSessionFactory::new(config);
        let err = factory.create().await.unwrap_err();
        assert!(matches!(err, WebTaskError::SessionCreation(_)));
    }

    #[tokio::test]
    async fn test_cancel_without_running_process_is_noop() {
        let executor = ProcessAgentExecutor::new(agent_config("sh", &[]));
        executor.cancel(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_kills_running_agent_process() {
        // exec 让挂起的进程本体持有输出管道
        let executor = Arc::new(ProcessAgentExecutor::new(agent_config(
            "sh",
            &["-c", "cat > /dev/null; exec sleep 30"],
        )));

        let runner = Arc::clone(&executor);
        let handle = tokio::spawn(async move {
            let session = NoEndpointSession;
            runner
                .run(7, &session, "打开首页", &ExecutionConfig::default())
                .await
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !executor.running.read().await.contains_key(&7) {
            assert!(tokio::time::Instant::now() < deadline, "代理进程未登记为在途");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        executor.cancel(7).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
        assert!(!executor.running.read().await.contains_key(&7));
    }
}
