use std::num::NonZeroU16;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::templates::TemplateInfo;

/**
 * \brief 模型引用：Provider 标识 + 该 Provider 下的模型名。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    /** \brief Provider 标识，如 openai / anthropic / groq */
    #[serde(rename = "providerId")]
    pub provider_id: String,
    /** \brief 模型名 */
    pub id: String,
}

/**
 * \brief 生成参数；所有字段可选，缺省即使用 Provider 默认值。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, rename = "baseURL", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 消息内容片段：对象形式按 type 区分，裸字符串按文本处理。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentPart {
    Plain(String),
    Typed {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /** \brief 无法识别的片段，归一化时忽略 */
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /**
     * \brief 归一化为纯文本：仅保留 text 片段并以换行拼接，其余片段丢弃。
     */
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Plain(text) => Some(text.as_str()),
                    ContentPart::Typed { kind, text } if kind == "text" => {
                        Some(text.as_deref().unwrap_or(""))
                    }
                    ContentPart::Typed { .. } | ContentPart::Other(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/**
 * \brief 聊天消息，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    #[serde(default)]
    pub role: Role,
    /** \brief 内容：字符串或片段列表 */
    #[serde(default)]
    pub content: MessageContent,
}

/**
 * \brief 归一化后的消息，content 总是纯文本。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

pub fn normalize_messages(messages: &[ChatMessage]) -> Vec<Message> {
    messages
        .iter()
        .map(|m| Message {
            role: m.role,
            content: m.content.to_text(),
        })
        .collect()
}

/**
 * \brief LLM 生成的代码片段及其执行元数据。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    #[serde(default)]
    pub commentary: String,
    pub template: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub additional_dependencies: Vec<String>,
    #[serde(default)]
    pub has_additional_dependencies: bool,
    #[serde(default)]
    pub install_dependencies_command: String,
    /** \brief 监听端口；为 0 的值在反序列化阶段即被拒绝 */
    #[serde(default)]
    pub port: Option<NonZeroU16>,
    pub file_path: String,
    pub code: String,
}

/**
 * \brief Morph 风格的编辑指令，edit 中以占位标记表示未变更区域。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditInstruction {
    #[serde(default)]
    pub commentary: String,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub edit: String,
    #[serde(default)]
    pub file_path: String,
}

/**
 * \brief 请求中的模板选择：注册表中的单个模板 ID，或调用方自带的模板目录。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateSelection {
    Id(String),
    Catalog(IndexMap<String, TemplateInfo>),
}

/**
 * \brief /api/chat 与 /api/morph-chat 共用的请求体。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "userID", default)]
    pub user_id: Option<String>,
    #[serde(rename = "teamID", default)]
    pub team_id: Option<String>,
    pub model: ModelRef,
    #[serde(default)]
    pub config: ModelConfig,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub template: Option<TemplateSelection>,
    #[serde(rename = "currentFragment", default)]
    pub current_fragment: Option<Fragment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub fragment: Fragment,
    #[serde(rename = "userID", default)]
    pub user_id: Option<String>,
    #[serde(rename = "teamID", default)]
    pub team_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub name: String,
    pub value: String,
    pub traceback: String,
}

/**
 * \brief 单个 cell 的富输出，只保留存在的格式。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub png: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterResult {
    pub sbx_id: String,
    pub template: String,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub runtime_error: Option<RuntimeError>,
    pub cell_results: Vec<CellResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebResult {
    pub sbx_id: String,
    pub template: String,
    pub url: String,
}

/**
 * \brief 沙箱执行结果：解释器模板返回执行输出，其余模板返回可访问 URL。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Interpreter(InterpreterResult),
    Web(WebResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_drops_non_text_parts() {
        let msg: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "image", "image": "data:image/png;base64,AAAA"},
                {"type": "text", "text": "second"}
            ]
        }))
        .expect("parse message");
        let out = normalize_messages(&[msg]);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[0].content, "first\nsecond");
    }

    #[test]
    fn test_normalize_keeps_plain_string_content_and_parts() {
        let msgs: Vec<ChatMessage> = serde_json::from_value(serde_json::json!([
            {"role": "assistant", "content": "hello"},
            {"content": ["a", {"type": "text", "text": "b"}]}
        ]))
        .expect("parse messages");
        let out = normalize_messages(&msgs);
        assert_eq!(out[0].content, "hello");
        assert_eq!(out[0].role, Role::Assistant);
        assert_eq!(out[1].role, Role::User);
        assert_eq!(out[1].content, "a\nb");
    }

    #[test]
    fn test_fragment_port_zero_rejected() {
        let bad = serde_json::json!({
            "template": "nextjs-developer",
            "file_path": "pages/index.tsx",
            "code": "x",
            "port": 0
        });
        assert!(serde_json::from_value::<Fragment>(bad).is_err());

        let ok = serde_json::json!({
            "template": "nextjs-developer",
            "file_path": "pages/index.tsx",
            "code": "x",
            "port": null
        });
        let frag: Fragment = serde_json::from_value(ok).expect("parse fragment");
        assert!(frag.port.is_none());
        assert!(!frag.has_additional_dependencies);
    }

    #[test]
    fn test_model_config_omits_unset_fields() {
        let cfg: ModelConfig =
            serde_json::from_str(r#"{"baseURL":"http://x","maxTokens":10}"#).expect("parse");
        assert_eq!(cfg.base_url.as_deref(), Some("http://x"));
        assert_eq!(cfg.max_tokens, Some(10));
        let v = serde_json::to_value(&cfg).expect("serialize");
        assert!(v.get("temperature").is_none());
        assert!(v.get("apiKey").is_none());
    }

    #[test]
    fn test_execution_result_shapes() {
        let web = ExecutionResult::Web(WebResult {
            sbx_id: "s1".into(),
            template: "nextjs-developer".into(),
            url: "https://3000-s1.e2b.app".into(),
        });
        let v = serde_json::to_value(&web).expect("serialize");
        assert_eq!(v["sbxId"], "s1");
        assert_eq!(v["url"], "https://3000-s1.e2b.app");

        let interp = ExecutionResult::Interpreter(InterpreterResult {
            sbx_id: "s2".into(),
            template: "code-interpreter-v1".into(),
            stdout: vec!["hi\n".into()],
            stderr: vec![],
            runtime_error: None,
            cell_results: vec![CellResult {
                text: Some("42".into()),
                ..CellResult::default()
            }],
        });
        let v = serde_json::to_value(&interp).expect("serialize");
        assert_eq!(v["runtimeError"], serde_json::Value::Null);
        assert_eq!(v["cellResults"][0], serde_json::json!({"text": "42"}));
    }

    #[test]
    fn test_untyped_parts_are_skipped() {
        let msg: ChatMessage = serde_json::from_value(serde_json::json!({
            "role": "user",
            "content": [
                {"text": "no type key"},
                {"type": "text", "text": "kept"},
                42,
                {"type": "text", "text": "also kept"}
            ]
        }))
        .expect("message with odd parts");
        assert_eq!(msg.content.to_text(), "kept\nalso kept");
    }

    #[test]
    fn test_chat_request_defaults() {
        let req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": {"providerId": "openai", "id": "gpt-4o"},
            "messages": [{"role": "user", "content": "hi"}],
            "template": "nextjs-developer"
        }))
        .expect("chat request");
        assert_eq!(req.config, ModelConfig::default());
        assert!(req.user_id.is_none());
        assert!(req.current_fragment.is_none());
        assert!(matches!(req.template, Some(TemplateSelection::Id(ref id)) if id == "nextjs-developer"));
    }
}
