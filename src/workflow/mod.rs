//! 工作流导出
//!
//! 把一次执行结果中真正完成的步骤（Completed / Recovered，跳过的除外）转换为线性节点图，
//! 供外部工作流编辑器复用。导出后的节点参数为最终实际生效的参数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{Step, TaskResult};

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Image,
    Input,
    Action,
}

impl NodeType {
    /// 由工具名推断节点类型，未知工具视为 action
    pub fn for_tool(tool: &str) -> Self {
        match tool {
            "take_screenshot" | "ocr_text" => Self::Image,
            "type_text" => Self::Input,
            _ => Self::Action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub step_count: usize,
}

/// 线性工作流：节点按执行顺序相连
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<Connection>,
    pub metadata: WorkflowMetadata,
}

fn exportable(step: &Step) -> bool {
    step.status.is_success() && !step.was_skipped()
}

impl Workflow {
    pub fn from_result(name: impl Into<String>, result: &TaskResult) -> Self {
        let name = name.into();
        let nodes: Vec<WorkflowNode> = result
            .steps
            .iter()
            .filter(|s| exportable(s))
            .enumerate()
            .map(|(i, step)| WorkflowNode {
                id: format!("node_{i}"),
                name: step.description.clone(),
                node_type: NodeType::for_tool(&step.tool),
                data: json!({
                    "tool": step.tool,
                    "args": step.args,
                }),
            })
            .collect();

        let connections = nodes
            .windows(2)
            .map(|pair| Connection {
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
            })
            .collect();

        Self {
            metadata: WorkflowMetadata {
                name: name.clone(),
                created_at: Utc::now(),
                step_count: nodes.len(),
            },
            name,
            nodes,
            connections,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
