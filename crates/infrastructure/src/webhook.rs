//! Webhook 事件通知
//!
//! 按事件类型路由到三条 webhook 地址：生命周期事件走 run 地址，
//! 失败走 error 地址，指标走 status 地址。投递是尽力而为的异步
//! 发送，失败只记录日志，从不回压任务执行路径。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use webtask_config::WebhookConfig;
use webtask_domain::{EventKind, Notifier, TaskEvent};
use webtask_errors::{WebTaskError, WebTaskResult};

pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// 事件类型到目标地址的路由；地址留空表示该类事件不投递
    fn url_for(&self, kind: EventKind) -> Option<&str> {
        let url = match kind {
            EventKind::Failed => &self.config.error_url,
            EventKind::Metrics => &self.config.status_url,
            EventKind::Queued | EventKind::Started | EventKind::Completed => &self.config.run_url,
        };
        if url.is_empty() {
            None
        } else {
            Some(url)
        }
    }

    /// 同步投递一次，供后台发送任务和测试使用
    pub async fn deliver(&self, url: &str, event: &TaskEvent) -> WebTaskResult<()> {
        let response = self
            .client
            .post(url)
            .timeout(Duration::from_millis(self.config.send_timeout_ms))
            .json(event)
            .send()
            .await
            .map_err(|e| WebTaskError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(WebTaskError::Notification(format!(
                "webhook 返回 {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TaskEvent) {
        let Some(url) = self.url_for(event.kind) else {
            debug!("事件 {} 未配置 webhook 地址，跳过", event.kind);
            return;
        };

        let client = self.client.clone();
        let url = url.to_string();
        let timeout = Duration::from_millis(self.config.send_timeout_ms);
        let kind = event.kind;
        let body = match serde_json::to_value(event) {
            Ok(body) => body,
            Err(e) => {
                warn!("事件 {} 序列化失败: {}", kind, e);
                return;
            }
        };

        // 发送放到独立任务里，执行路径不等待 webhook
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(timeout)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("事件 {} 已投递到 {}", kind, url);
                }
                Ok(response) => {
                    warn!("事件 {} 投递到 {} 被拒绝: {}", kind, url, response.status());
                }
                Err(e) => {
                    warn!("事件 {} 投递到 {} 失败: {}", kind, url, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// 极简 HTTP 服务器，记录收到的请求体
    async fn spawn_capture_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        let text = String::from_utf8_lossy(&buf);
                        if let Some(header_end) = text.find("\r\n\r\n") {
                            let content_length = text
                                .lines()
                                .find_map(|l| {
                                    let (name, value) = l.split_once(':')?;
                                    name.eq_ignore_ascii_case("content-length")
                                        .then(|| value.trim().parse::<usize>().ok())?
                                })
                                .unwrap_or(0);
                            let body_start = header_end + 4;
                            if buf.len() >= body_start + content_length {
                                let body = String::from_utf8_lossy(
                                    &buf[body_start..body_start + content_length],
                                )
                                .to_string();
                                captured.lock().unwrap().push(body);
                                let _ = stream
                                    .write_all(
                                        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
                                    )
                                    .await;
                                break;
                            }
                        }
                    }
                });
            }
        });

        (format!("http://{addr}"), received)
    }

    fn webhook_config(run: &str, error: &str, status: &str) -> WebhookConfig {
        WebhookConfig {
            run_url: run.to_string(),
            error_url: error.to_string(),
            status_url: status.to_string(),
            send_timeout_ms: 2000,
            metrics_interval_seconds: 30,
        }
    }

    async fn wait_for_bodies(received: &Arc<Mutex<Vec<String>>>, n: usize) -> Vec<String> {
        for _ in 0..200 {
            if received.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        received.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_deliver_posts_event_json() {
        let (url, received) = spawn_capture_server().await;
        let notifier = WebhookNotifier::new(webhook_config(&url, "", ""));

        let event = TaskEvent::completed(7, json!({"success": true}));
        notifier.deliver(&url, &event).await.unwrap();

        let bodies = wait_for_bodies(&received, 1).await;
        let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(body["kind"], "completed");
        assert_eq!(body["task_id"], 7);
        assert_eq!(body["payload"]["success"], true);
    }

    #[tokio::test]
    async fn test_notify_routes_by_event_kind() {
        let (run_url, run_received) = spawn_capture_server().await;
        let (error_url, error_received) = spawn_capture_server().await;
        let notifier = WebhookNotifier::new(webhook_config(&run_url, &error_url, ""));

        notifier.notify(&TaskEvent::started(1, json!({}))).await;
        notifier
            .notify(&TaskEvent::failed(1, "执行失败", json!(null)))
            .await;

        let run_bodies = wait_for_bodies(&run_received, 1).await;
        let error_bodies = wait_for_bodies(&error_received, 1).await;
        assert_eq!(run_bodies.len(), 1);
        assert_eq!(error_bodies.len(), 1);

        let error_body: serde_json::Value = serde_json::from_str(&error_bodies[0]).unwrap();
        assert_eq!(error_body["kind"], "failed");
        assert_eq!(error_body["payload"]["error"], "执行失败");
    }

    #[tokio::test]
    async fn test_missing_url_skips_silently() {
        // 指标地址未配置，notify 不发送也不报错
        let notifier = WebhookNotifier::new(webhook_config("", "", ""));
        notifier.notify(&TaskEvent::metrics(json!({}))).await;
    }

    #[tokio::test]
    async fn test_unreachable_target_does_not_propagate() {
        let notifier =
            WebhookNotifier::new(webhook_config("http://127.0.0.1:9/unreachable", "", ""));
        notifier.notify(&TaskEvent::started(1, json!({}))).await;
        // 后台发送失败只留日志
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_deliver_rejects_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n")
                    .await;
            }
        });

        let url = format!("http://{addr}");
        let notifier = WebhookNotifier::new(webhook_config(&url, "", ""));
        let err = notifier
            .deliver(&url, &TaskEvent::started(1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, WebTaskError::Notification(_)));
    }
}
