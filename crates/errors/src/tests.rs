#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_error_display() {
        let db_op_error = WebTaskError::DatabaseOperation("Connection failed".to_string());
        assert_eq!(db_op_error.to_string(), "数据库操作错误: Connection failed");

        let task_error = WebTaskError::TaskNotFound { id: 123 };
        assert_eq!(task_error.to_string(), "任务未找到: 123");

        let timeout_error = WebTaskError::ExecutionTimeout;
        assert_eq!(timeout_error.to_string(), "任务执行超时");

        let session_error = WebTaskError::SessionCreation("browser launch failed".to_string());
        assert_eq!(session_error.to_string(), "会话创建失败: browser launch failed");

        let exec_error = WebTaskError::TaskExecution("navigation refused".to_string());
        assert_eq!(exec_error.to_string(), "任务执行错误: navigation refused");

        let notify_error = WebTaskError::Notification("webhook 500".to_string());
        assert_eq!(notify_error.to_string(), "通知发送失败: webhook 500");
    }

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(
            WebTaskError::task_not_found(7),
            WebTaskError::TaskNotFound { id: 7 }
        ));
        assert!(matches!(
            WebTaskError::session_unavailable("pool closed"),
            WebTaskError::SessionUnavailable(_)
        ));
        assert!(matches!(
            WebTaskError::execution_error("agent failed"),
            WebTaskError::TaskExecution(_)
        ));
        assert!(matches!(
            WebTaskError::invalid_params("missing instruction"),
            WebTaskError::InvalidTaskParams(_)
        ));
    }

    #[test]
    fn test_retryable_classification() {
        // 只有持久化类错误允许调度器重试写入
        assert!(WebTaskError::DatabaseOperation("x".into()).is_retryable());
        assert!(!WebTaskError::ExecutionTimeout.is_retryable());
        assert!(!WebTaskError::TaskExecution("x".into()).is_retryable());
        assert!(!WebTaskError::SessionUnavailable("x".into()).is_retryable());
        assert!(!WebTaskError::Notification("x".into()).is_retryable());
    }

    #[test]
    fn test_timeout_classification() {
        assert!(WebTaskError::ExecutionTimeout.is_timeout());
        assert!(!WebTaskError::TaskExecution("slow".into()).is_timeout());
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(WebTaskError::ExecutionTimeout.kind(), "timeout");
        assert_eq!(
            WebTaskError::SessionUnavailable("x".into()).kind(),
            "resource_unavailable"
        );
        assert_eq!(
            WebTaskError::SessionCreation("x".into()).kind(),
            "resource_unavailable"
        );
        assert_eq!(WebTaskError::TaskExecution("x".into()).kind(), "execution");
        assert_eq!(
            WebTaskError::DatabaseOperation("x".into()).kind(),
            "persistence"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: WebTaskError = json_err.into();
        assert!(matches!(err, WebTaskError::Serialization(_)));
    }

    #[test]
    fn test_from_anyhow_error() {
        let err: WebTaskError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, WebTaskError::Internal(_)));
        assert!(err.is_fatal());
    }
}
