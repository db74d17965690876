//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKPILOT__*` 覆盖（双下划线表示嵌套，如 `TASKPILOT__OBSERVER__ENABLED=true`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub observer: ObserverSection,
    pub llm: LlmSection,
}

/// [engine] 段：每步调用次数上限与各类超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 每个步骤的调用次数上限（含首次调用；默认 2 = 首次 + 一次恢复重试）
    pub max_attempts_per_step: u32,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 单次诊断服务调用超时（秒），超时等同诊断不可用
    pub diagnosis_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_attempts_per_step: 2,
            tool_timeout_secs: 30,
            diagnosis_timeout_secs: 60,
        }
    }
}

/// [observer] 段：观察循环开关、周期与上下文窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObserverSection {
    pub enabled: bool,
    /// 观察周期（秒，可为小数）
    pub interval_secs: f64,
    /// 观察历史上限，超出时淘汰最旧
    pub history_limit: usize,
    /// 构建屏幕理解请求时带入的最近观察条数
    pub context_observations: usize,
    /// 构建屏幕理解请求时带入的检测元素上限
    pub context_elements: usize,
    /// 观察事件广播通道容量
    pub event_buffer: usize,
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 2.0,
            history_limit: 100,
            context_observations: 3,
            context_elements: 10,
            event_buffer: 64,
        }
    }
}

/// [llm] 段：诊断服务使用的后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 TASKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.max_attempts_per_step, 2);
        assert!(!cfg.observer.enabled);
        assert_eq!(cfg.observer.context_observations, 3);
        assert_eq!(cfg.observer.context_elements, 10);
    }

    #[test]
    fn test_load_from_file_keeps_unset_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_attempts_per_step = 4\n\n[observer]\nenabled = true\ninterval_secs = 0.5"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.max_attempts_per_step, 4);
        assert_eq!(cfg.engine.tool_timeout_secs, 30);
        assert!(cfg.observer.enabled);
        assert!((cfg.observer.interval_secs - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.observer.history_limit, 100);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let cfg = load_config(Some(PathBuf::from("/nonexistent/taskpilot.toml"))).unwrap();
        assert_eq!(cfg.engine.diagnosis_timeout_secs, 60);
    }
}
