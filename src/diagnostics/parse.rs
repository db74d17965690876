//! 诊断回复解析
//!
//! 从 LLM 文本中提取 JSON（```json 块 / ``` 块 / 首个 `{` 到末个 `}`），再解析为 Diagnosis 或 ScreenUnderstanding。
//! 诊断同时接受排序列表格式 `{root_cause, fixes: [...]}` 与单修复格式 `{diagnosis, fix_strategy, new_args, alternative_tool}`。

use serde::Deserialize;

use crate::core::{Args, EngineError};
use crate::diagnostics::{Diagnosis, Fix, FixStrategy, ScreenUnderstanding};

/// 提取 JSON 片段；找不到对象时返回 None
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let inner = rest[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

#[derive(Debug, Deserialize)]
struct RawFix {
    strategy: String,
    #[serde(default)]
    likelihood: Option<f64>,
    #[serde(default)]
    implementation: Option<String>,
    #[serde(default)]
    new_args: Option<Args>,
    #[serde(default)]
    replacement_args: Option<Args>,
    #[serde(default)]
    alternative_tool: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDiagnosis {
    #[serde(default)]
    root_cause: Option<String>,
    #[serde(default)]
    diagnosis: Option<String>,
    #[serde(default)]
    fixes: Option<Vec<RawFix>>,
    #[serde(default)]
    fix_strategy: Option<String>,
    #[serde(default)]
    new_args: Option<Args>,
    #[serde(default)]
    alternative_tool: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
}

fn unavailable(msg: impl Into<String>) -> EngineError {
    EngineError::DiagnosisUnavailable(msg.into())
}

fn likelihood(raw: Option<f64>) -> u8 {
    match raw {
        Some(v) if v.is_finite() => v.round().clamp(0.0, 100.0) as u8,
        _ => 0,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl TryFrom<RawFix> for Fix {
    type Error = EngineError;

    fn try_from(raw: RawFix) -> Result<Self, Self::Error> {
        Ok(Fix {
            strategy: raw.strategy.parse::<FixStrategy>()?,
            likelihood: likelihood(raw.likelihood),
            implementation: raw.implementation.unwrap_or_default(),
            replacement_args: raw
                .new_args
                .filter(|a| !a.is_empty())
                .or(raw.replacement_args.filter(|a| !a.is_empty())),
            alternative_tool: non_empty(raw.alternative_tool),
        })
    }
}

/// 解析失败诊断；无法解析、策略未知或没有修复时返回 DiagnosisUnavailable
pub fn parse_diagnosis(output: &str) -> Result<Diagnosis, EngineError> {
    let json = extract_json_block(output).ok_or_else(|| unavailable("no JSON object in response"))?;
    let raw: RawDiagnosis =
        serde_json::from_str(json).map_err(|e| unavailable(format!("{e}: {json}")))?;

    let root_cause = non_empty(raw.root_cause)
        .or_else(|| non_empty(raw.diagnosis))
        .unwrap_or_default();

    let fixes = match (raw.fixes, raw.fix_strategy) {
        (Some(list), _) if !list.is_empty() => list
            .into_iter()
            .map(Fix::try_from)
            .collect::<Result<Vec<_>, _>>()?,
        (_, Some(tag)) => vec![Fix {
            strategy: tag.parse::<FixStrategy>()?,
            likelihood: 100,
            implementation: raw.explanation.unwrap_or_default(),
            replacement_args: raw.new_args.filter(|a| !a.is_empty()),
            alternative_tool: non_empty(raw.alternative_tool),
        }],
        _ => return Err(unavailable("diagnosis contains no fixes")),
    };

    Ok(Diagnosis { root_cause, fixes })
}

#[derive(Debug, Deserialize)]
struct RawUnderstanding {
    #[serde(default)]
    understanding: Option<String>,
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    next_action: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    issues_detected: Vec<String>,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    debug_suggestions: Vec<String>,
    #[serde(default)]
    patterns_observed: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

/// 解析屏幕理解；同义键并存时合并，issues 另并入 debug_suggestions（去重、保序）
pub fn parse_understanding(output: &str) -> Result<ScreenUnderstanding, EngineError> {
    let json = extract_json_block(output).ok_or_else(|| unavailable("no JSON object in response"))?;
    let raw: RawUnderstanding =
        serde_json::from_str(json).map_err(|e| unavailable(format!("{e}: {json}")))?;

    let analysis = non_empty(raw.understanding)
        .or_else(|| non_empty(raw.analysis))
        .ok_or_else(|| unavailable("screen understanding has no analysis"))?;

    let issues = dedup_trimmed(
        raw.issues_detected
            .into_iter()
            .chain(raw.issues)
            .chain(raw.debug_suggestions),
    );

    let next_action = non_empty(raw.next_action).filter(|a| !a.eq_ignore_ascii_case("null"));
    let confidence = raw
        .confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0) as f32)
        .unwrap_or(0.0);

    Ok(ScreenUnderstanding {
        analysis,
        state: non_empty(raw.state).unwrap_or_else(|| "unknown".to_string()),
        next_action,
        confidence,
        issues,
        patterns: dedup_trimmed(raw.patterns_observed.into_iter().chain(raw.patterns)),
    })
}

fn dedup_trimmed(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}
