//! 基于 LLM 的诊断服务
//!
//! 把失败步骤 / 屏幕上下文拼成提示词，调用 LlmClient，再用 parse 模块解析回复。
//! LLM 调用失败与解析失败都映射为 DiagnosisUnavailable。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::EngineError;
use crate::diagnostics::parse::{parse_diagnosis, parse_understanding};
use crate::diagnostics::{
    Diagnosis, DiagnosisRequest, DiagnosticService, ScreenUnderstanding, UnderstandRequest,
};
use crate::llm::{LlmClient, Message};

/// 历史观察摘要截断长度
const DIGEST_PREVIEW_CHARS: usize = 100;

const DIAGNOSIS_SYSTEM_PROMPT: &str = "You are the self-debugging component of a GUI/browser automation engine. \
You diagnose why a step failed and propose ranked fixes. Always answer with a single JSON object.";

const OBSERVER_SYSTEM_PROMPT: &str = "You observe a computer screen in real time while an automation runs. \
Always answer with a single JSON object.";

pub struct LlmDiagnostics {
    llm: Arc<dyn LlmClient>,
}

impl LlmDiagnostics {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    async fn ask(&self, system: &str, prompt: String) -> Result<String, EngineError> {
        let messages = vec![Message::system(system), Message::user(prompt)];
        self.llm
            .complete(&messages)
            .await
            .map_err(EngineError::DiagnosisUnavailable)
    }
}

fn to_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 失败诊断提示词：失败步骤、此前成功结果、完整计划，以及可用的快照与最近观察
pub fn build_diagnosis_prompt(request: &DiagnosisRequest) -> String {
    let mut prompt = format!(
        "DEBUGGING MODE: An automation step failed.\n\n**Failed Step:**\n{}\n\n**Previous Successful Steps:**\n{}\n\n**Original Plan:**\n{}\n",
        to_pretty(&request.failed_step),
        to_pretty(&request.prior_results),
        to_pretty(&request.plan),
    );
    if let Some(snapshot) = &request.snapshot {
        prompt.push_str(&format!(
            "\n**Screen snapshot:** {} (captured {})\n",
            snapshot.reference,
            snapshot.captured_at.format("%H:%M:%S")
        ));
    }
    if let Some(obs) = &request.latest_observation {
        prompt.push_str(&format!(
            "\n**Latest observation ({}):** {} [state: {}]\n",
            obs.timestamp.format("%H:%M:%S"),
            preview(&obs.analysis, DIGEST_PREVIEW_CHARS * 3),
            obs.state
        ));
    }
    prompt.push_str(
        r#"
Diagnose the failure and suggest up to 3 fixes ranked by likelihood of success (0-100).
Allowed strategies: "retry", "modify_args", "alternative_approach", "skip".
Return JSON:
{
  "root_cause": "why it happened",
  "fixes": [
    {
      "strategy": "modify_args",
      "likelihood": 90,
      "implementation": "how this fix works",
      "new_args": {},
      "alternative_tool": null
    }
  ]
}"#,
    );
    prompt
}

/// 屏幕理解提示词：最近观察摘要与检测到的元素
pub fn build_understand_prompt(request: &UnderstandRequest) -> String {
    let mut elements_context = String::new();
    if !request.elements.is_empty() {
        elements_context.push_str("\n\nDetected UI elements:\n");
        for elem in &request.elements {
            let (cx, cy) = elem.region.center();
            elements_context.push_str(&format!(
                "- {} at ({:.0}, {:.0}) [confidence: {:.2}]\n",
                elem.label, cx, cy, elem.confidence
            ));
        }
    }

    let mut history_context = String::new();
    if !request.recent.is_empty() {
        history_context.push_str(&format!(
            "\n\nRecent observations (last {}):\n",
            request.recent.len()
        ));
        for digest in &request.recent {
            history_context.push_str(&format!(
                "- {}: {}\n",
                digest.timestamp.format("%H:%M:%S"),
                preview(&digest.analysis, DIGEST_PREVIEW_CHARS)
            ));
        }
    }

    let snapshot_line = request
        .snapshot
        .as_ref()
        .map(|s| format!("\n\nScreen snapshot: {}", s.reference))
        .unwrap_or_else(|| "\n\nScreen snapshot: unavailable".to_string());

    format!(
        r#"Your job is to:
1. Understand what's currently happening
2. Detect if anything looks wrong (errors, unexpected states)
3. Suggest the next logical action
4. Provide debugging advice if needed
{snapshot_line}{elements_context}{history_context}

Return JSON:
{{
  "understanding": "What's currently happening on screen",
  "state": "idle|working|error|loading|complete",
  "next_action": "Suggested next action (or null if none needed)",
  "confidence": 0.95,
  "issues_detected": ["list of potential problems"],
  "debug_suggestions": ["suggestions if error detected"],
  "patterns_observed": ["recurring patterns you notice"]
}}"#
    )
}

#[async_trait]
impl DiagnosticService for LlmDiagnostics {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, EngineError> {
        let output = self
            .ask(DIAGNOSIS_SYSTEM_PROMPT, build_diagnosis_prompt(request))
            .await?;
        let diagnosis = parse_diagnosis(&output)?;
        tracing::info!(
            llm = self.llm.name(),
            step = request.failed_step.index,
            root_cause = %diagnosis.root_cause,
            fixes = diagnosis.fixes.len(),
            "diagnosis received"
        );
        Ok(diagnosis)
    }

    async fn understand(
        &self,
        request: &UnderstandRequest,
    ) -> Result<ScreenUnderstanding, EngineError> {
        let output = self
            .ask(OBSERVER_SYSTEM_PROMPT, build_understand_prompt(request))
            .await?;
        parse_understanding(&output)
    }
}
