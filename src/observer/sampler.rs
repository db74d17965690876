//! 状态采样与元素检测
//!
//! 两者都是尽力而为：失败时由调用方降级为「无快照 / 无元素」，不影响步骤执行。
//! ToolStateSampler 借助已注册的截图与检测工具实现两个 trait。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Args, EngineError};
use crate::tools::ToolInvoker;

/// 快照引用截断长度
const REFERENCE_PREVIEW_CHARS: usize = 200;

/// 一次屏幕/界面状态采样；reference 为截图路径或其它可供诊断服务引用的标识
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub captured_at: DateTime<Utc>,
    pub reference: String,
}

impl Snapshot {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            captured_at: Utc::now(),
            reference: reference.into(),
        }
    }
}

/// 元素包围盒（左上角 + 宽高）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Region {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 由 [x1, y1, x2, y2] 构造；坐标顺序颠倒时自动纠正
    pub fn from_corners(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self::new(x1.min(x2), y1.min(y2), (x2 - x1).abs(), (y2 - y1).abs())
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    pub label: String,
    pub region: Region,
    pub confidence: f32,
}

#[async_trait]
pub trait StateSampler: Send + Sync {
    async fn capture(&self) -> Result<Snapshot, EngineError>;
}

#[async_trait]
pub trait ElementDetector: Send + Sync {
    async fn detect(&self, snapshot: &Snapshot) -> Result<Vec<DetectedElement>, EngineError>;
}

/// 通过工具调用实现采样与检测
pub struct ToolStateSampler {
    invoker: Arc<dyn ToolInvoker>,
    screenshot_tool: String,
    detect_tool: String,
}

impl ToolStateSampler {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self {
            invoker,
            screenshot_tool: "take_screenshot".to_string(),
            detect_tool: "detect_elements".to_string(),
        }
    }

    pub fn with_tools(mut self, screenshot: impl Into<String>, detect: impl Into<String>) -> Self {
        self.screenshot_tool = screenshot.into();
        self.detect_tool = detect.into();
        self
    }
}

fn reference_of(result: &Value) -> String {
    for key in ["path", "image", "screenshot", "reference"] {
        if let Some(s) = result.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }
    if let Some(s) = result.as_str() {
        return s.to_string();
    }
    let raw = result.to_string();
    if raw.chars().count() > REFERENCE_PREVIEW_CHARS {
        format!("{}...", raw.chars().take(REFERENCE_PREVIEW_CHARS).collect::<String>())
    } else {
        raw
    }
}

/// 宽松解析单个检测结果：`{type|label, bbox: [x1,y1,x2,y2], confidence}`，缺字段的条目丢弃
fn parse_element(item: &Value) -> Option<DetectedElement> {
    let label = item
        .get("type")
        .or_else(|| item.get("label"))
        .and_then(Value::as_str)?
        .to_string();
    let bbox: Vec<f64> = item
        .get("bbox")?
        .as_array()?
        .iter()
        .filter_map(Value::as_f64)
        .collect();
    if bbox.len() != 4 {
        return None;
    }
    let confidence = item
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .clamp(0.0, 1.0) as f32;
    Some(DetectedElement {
        label,
        region: Region::from_corners(bbox[0], bbox[1], bbox[2], bbox[3]),
        confidence,
    })
}

pub(crate) fn parse_elements(result: &Value) -> Vec<DetectedElement> {
    let items = result
        .get("elements")
        .or_else(|| result.get("detections"))
        .unwrap_or(result);
    items
        .as_array()
        .map(|arr| arr.iter().filter_map(parse_element).collect())
        .unwrap_or_default()
}

#[async_trait]
impl StateSampler for ToolStateSampler {
    async fn capture(&self) -> Result<Snapshot, EngineError> {
        let result = self
            .invoker
            .invoke(&self.screenshot_tool, &Args::new())
            .await
            .map_err(|e| EngineError::Sampler(e.to_string()))?;
        Ok(Snapshot::new(reference_of(&result)))
    }
}

#[async_trait]
impl ElementDetector for ToolStateSampler {
    async fn detect(&self, snapshot: &Snapshot) -> Result<Vec<DetectedElement>, EngineError> {
        let mut args = Args::new();
        args.insert("image".to_string(), Value::String(snapshot.reference.clone()));
        let result = self
            .invoker
            .invoke(&self.detect_tool, &args)
            .await
            .map_err(|e| EngineError::Sampler(e.to_string()))?;
        Ok(parse_elements(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeInvoker;

    #[async_trait]
    impl ToolInvoker for FakeInvoker {
        async fn invoke(&self, tool: &str, args: &Args) -> Result<Value, EngineError> {
            match tool {
                "take_screenshot" => Ok(json!({"path": "/tmp/shot-1.png"})),
                "detect_elements" => Ok(json!({"elements": [
                    {"type": "button", "bbox": [10, 20, 50, 60], "confidence": 0.87},
                    {"type": "broken"},
                    {"label": "text_field", "bbox": [100.0, 100.0, 0.0, 80.0], "confidence": 1.7}
                ], "image": args.get("image")})),
                other => Err(EngineError::UnknownTool(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_capture_and_detect_via_tools() {
        let sampler = ToolStateSampler::new(Arc::new(FakeInvoker));
        let snap = sampler.capture().await.unwrap();
        assert_eq!(snap.reference, "/tmp/shot-1.png");

        let elements = sampler.detect(&snap).await.unwrap();
        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].label, "button");
        assert_eq!(elements[0].region.center(), (30.0, 40.0));
        assert_eq!(elements[1].region, Region::new(0.0, 80.0, 100.0, 20.0));
        assert_eq!(elements[1].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_capture_failure_is_sampler_error() {
        let sampler = ToolStateSampler::new(Arc::new(FakeInvoker)).with_tools("missing", "missing");
        assert!(matches!(sampler.capture().await, Err(EngineError::Sampler(_))));
    }

    #[test]
    fn test_reference_falls_back_to_truncated_json() {
        let big = json!({"blob": "x".repeat(500)});
        let r = reference_of(&big);
        assert!(r.ends_with("..."));
        assert_eq!(r.chars().count(), REFERENCE_PREVIEW_CHARS + 3);
    }

    #[test]
    fn test_parse_bare_array() {
        let elements = parse_elements(&json!([{"type": "icon", "bbox": [0, 0, 4, 4]}]));
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].confidence, 0.0);
    }
}
