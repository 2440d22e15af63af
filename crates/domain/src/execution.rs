use serde::{Deserialize, Serialize};

/// 浏览器视口尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// 页面加载等待策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    Load,
    DomContentLoaded,
    NetworkIdle,
}

/// LLM 代理配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model_name: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model_name: "gpt-4o".to_string(),
            temperature: 0.0,
        }
    }
}

/// 回放模式配置：按历史步骤重放，不走代理推理
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplayConfig {
    /// 录制的步骤序列
    pub history: Vec<serde_json::Value>,
    /// 单个步骤的最大重试次数
    pub max_retries: u32,
    /// 步骤之间的固定延迟（毫秒）
    pub delay_between_actions_ms: u64,
    /// 步骤重试耗尽后跳过而不是终止整次运行
    pub skip_failures: bool,
}

/// 解析后的执行配置，所有字段都有确定值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// 单次页面操作超时（毫秒）
    pub navigation_timeout_ms: u64,
    pub wait_strategy: WaitStrategy,
    pub viewport: Viewport,
    pub headless: bool,
    pub max_steps: u32,
    pub use_vision: bool,
    pub llm: LlmConfig,
    pub replay: Option<ReplayConfig>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            navigation_timeout_ms: 30_000,
            wait_strategy: WaitStrategy::NetworkIdle,
            viewport: Viewport::default(),
            headless: true,
            max_steps: 25,
            use_vision: false,
            llm: LlmConfig::default(),
            replay: None,
        }
    }
}

impl ExecutionConfig {
    /// 叠加任务级覆盖，任务指定的字段优先于默认值
    pub fn overlay(&self, overrides: &ExecutionOverrides) -> ExecutionConfig {
        ExecutionConfig {
            navigation_timeout_ms: overrides
                .navigation_timeout_ms
                .unwrap_or(self.navigation_timeout_ms),
            wait_strategy: overrides.wait_strategy.unwrap_or(self.wait_strategy),
            viewport: overrides.viewport.unwrap_or(self.viewport),
            headless: overrides.headless.unwrap_or(self.headless),
            max_steps: overrides.max_steps.unwrap_or(self.max_steps),
            use_vision: overrides.use_vision.unwrap_or(self.use_vision),
            llm: overrides.llm.clone().unwrap_or_else(|| self.llm.clone()),
            replay: overrides.replay.clone().or_else(|| self.replay.clone()),
        }
    }
}

/// 任务级执行配置，全部字段可选，未指定的字段落回默认配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_strategy: Option<WaitStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headless: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_vision: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayConfig>,
}

impl ExecutionOverrides {
    pub fn is_empty(&self) -> bool {
        *self == ExecutionOverrides::default()
    }
}
