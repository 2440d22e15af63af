use crate::model::AppConfig;
use anyhow::{Context, Result};
use std::env;

/// 配置加载器，提供便捷的配置加载方法
pub struct ConfigLoader;

impl ConfigLoader {
    /// 根据环境加载配置
    ///
    /// 优先级：
    /// 1. 环境变量 WEBTASK_CONFIG_PATH 指定的配置文件
    /// 2. 环境变量 WEBTASK_ENV 指定的环境配置文件
    /// 3. 默认配置文件
    pub fn load() -> Result<AppConfig> {
        if let Ok(config_path) = env::var("WEBTASK_CONFIG_PATH") {
            return AppConfig::load(Some(&config_path))
                .with_context(|| format!("加载指定配置文件失败: {config_path}"));
        }

        let env_name = env::var("WEBTASK_ENV").unwrap_or_else(|_| "development".to_string());
        let config_file = format!("config/{env_name}.toml");

        if std::path::Path::new(&config_file).exists() {
            AppConfig::load(Some(&config_file))
                .with_context(|| format!("加载环境配置文件失败: {config_file}"))
        } else {
            AppConfig::load(None).context("加载默认配置失败")
        }
    }

    /// 加载并校验配置
    pub fn load_and_validate() -> Result<AppConfig> {
        let config = Self::load()?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    /// 获取数据库连接串，支持环境变量覆盖
    pub fn get_database_url(config: &AppConfig) -> String {
        env::var("DATABASE_URL").unwrap_or_else(|_| config.database.url.clone())
    }

    pub fn current_env() -> String {
        env::var("WEBTASK_ENV").unwrap_or_else(|_| "development".to_string())
    }
}
