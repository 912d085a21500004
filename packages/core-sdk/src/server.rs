use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::edit::apply_edit;
use crate::llm::{HttpGenerator, LlmError, StructuredGenerator, TokenStream};
use crate::models::{
    ChatRequest, EditInstruction, ExecutionResult, Fragment, SandboxRequest, TemplateSelection,
};
use crate::sandbox::{self, E2bSandboxService, SandboxError, SandboxService};
use crate::{schema, telemetry, templates};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const STREAM_BUFFER: usize = 32;

/**
 * \brief 请求处理共享的依赖；每个请求之间没有可变共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub generator: Arc<dyn StructuredGenerator>,
    pub sandbox: Arc<dyn SandboxService>,
}

impl AppState {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            generator: Arc::new(HttpGenerator::new(config.keys.clone())),
            sandbox: Arc::new(E2bSandboxService::new(config.sandbox.clone())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    MissingInput(String),
    #[error("Failed to parse LLM response as JSON")]
    MalformedResponse,
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/chat", post(chat))
        .route("/api/sandbox", post(run_sandbox))
        .route("/api/morph-chat", post(morph_chat))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/**
 * \brief 启动 HTTP 服务，Ctrl-C 时优雅退出。
 * \param addr 监听地址，如 "0.0.0.0:8000"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    telemetry::log_event("server", &format!("listening on http://{}", addr));
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            telemetry::log_event("server", "shutting down");
        })
        .await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "message": "Fragment Relay backend"}))
}

/**
 * \brief 系统提示词：请求指定的模板目录 / 模板 ID，缺省为全部注册模板。
 */
fn build_system_prompt(selection: Option<&TemplateSelection>) -> Result<String, ApiError> {
    match selection {
        Some(TemplateSelection::Catalog(catalog)) if !catalog.is_empty() => {
            Ok(templates::to_prompt(catalog))
        }
        Some(TemplateSelection::Id(id)) if !id.is_empty() => {
            let only = templates::single(id)
                .ok_or_else(|| ApiError::MissingInput(format!("unknown template: {}", id)))?;
            Ok(templates::to_prompt(&only))
        }
        _ => Ok(templates::to_prompt(templates::registry())),
    }
}

/**
 * \brief 流式通道中的一帧：正常增量，或流开始后的终止性错误。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Chunk(String),
    Failed(String),
}

impl StreamFrame {
    pub fn into_text(self) -> String {
        match self {
            StreamFrame::Chunk(text) => text,
            StreamFrame::Failed(message) => json!({ "error": message }).to_string(),
        }
    }
}

/**
 * \brief 生产者：把上游增量搬运到通道；客户端断开（通道关闭）时停止拉取上游。
 */
async fn pump(first: Option<String>, mut tokens: TokenStream, tx: mpsc::Sender<StreamFrame>) {
    if let Some(first) = first {
        if tx.send(StreamFrame::Chunk(first)).await.is_err() {
            return;
        }
    }
    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                telemetry::log_event("server.chat", "client disconnected, dropping upstream stream");
                return;
            }
            item = tokens.next() => item,
        };
        match next {
            None => break,
            Some(Ok(delta)) => {
                if tx.send(StreamFrame::Chunk(delta)).await.is_err() {
                    return;
                }
            }
            Some(Err(e)) => {
                telemetry::log_error("server.chat", &format!("stream error: {}", e));
                let _ = tx.send(StreamFrame::Failed(e.to_string())).await;
                break;
            }
        }
    }
}

fn text_response(body: Body) -> Response {
    ([(CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

/**
 * \brief POST /api/chat：流式返回片段 JSON 的增量文本。
 *
 * 第一个增量到达前的失败走普通 HTTP 错误；之后的失败以 `{"error": ...}` 作为最后一块。
 */
async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    telemetry::log_event(
        "server.chat",
        &format!(
            "userID={} teamID={} provider={} model={} msgs={}",
            req.user_id.as_deref().unwrap_or(""),
            req.team_id.as_deref().unwrap_or(""),
            req.model.provider_id,
            req.model.id,
            req.messages.len()
        ),
    );

    let system_prompt = build_system_prompt(req.template.as_ref())?;
    let mut tokens = state
        .generator
        .generate_structured(
            &req.model,
            &req.config,
            &system_prompt,
            &req.messages,
            schema::fragment_schema(),
        )
        .await
        .inspect_err(|e| telemetry::log_error("server.chat", &format!("stream failed: {}", e)))?;

    let first = match tokens.next().await {
        Some(Ok(delta)) => Some(delta),
        Some(Err(e)) => {
            telemetry::log_error("server.chat", &format!("stream failed: {}", e));
            return Err(e.into());
        }
        None => None,
    };

    let (tx, rx) = mpsc::channel::<StreamFrame>(STREAM_BUFFER);
    tokio::spawn(pump(first, tokens, tx));

    let stream = ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_text()));
    Ok(text_response(Body::from_stream(stream)))
}

async fn run_sandbox(
    State(state): State<AppState>,
    Json(req): Json<SandboxRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    telemetry::log_event(
        "server.sandbox",
        &format!(
            "template={} file={} userID={}",
            req.fragment.template,
            req.fragment.file_path,
            req.user_id.as_deref().unwrap_or("")
        ),
    );
    let result = sandbox::run_fragment(
        state.sandbox.as_ref(),
        &req.fragment,
        req.user_id.as_deref(),
        req.team_id.as_deref(),
    )
    .await
    .inspect_err(|e| telemetry::log_error("server.sandbox", &e.to_string()))?;
    Ok(Json(result))
}

fn edit_system_prompt(current: &Fragment) -> String {
    format!(
        "You are a code editor. Generate a JSON response with exactly these fields:\n\
         \n\
         {{\n  \
         \"commentary\": \"Explain what changes you are making\",\n  \
         \"instruction\": \"One line description of the change\",\n  \
         \"edit\": \"The code changes with // ... existing code ... for unchanged parts\",\n  \
         \"file_path\": \"{path}\"\n\
         }}\n\
         \n\
         Current file: {path}\n\
         Current code:\n\
         ```\n\
         {code}\n\
         ```\n",
        path = current.file_path,
        code = current.code
    )
}

/**
 * \brief POST /api/morph-chat：生成编辑指令并应用到当前片段，以单块流返回。
 */
async fn morph_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let current = req.current_fragment.ok_or_else(|| {
        ApiError::MissingInput("currentFragment is required for morph-chat".to_string())
    })?;
    telemetry::log_event(
        "server.morph",
        &format!("morph edit for file: {}", current.file_path),
    );

    let system_prompt = edit_system_prompt(&current);
    let mut tokens = state
        .generator
        .generate_structured(
            &req.model,
            &req.config,
            &system_prompt,
            &req.messages,
            schema::edit_schema(),
        )
        .await?;

    let mut full = String::new();
    while let Some(delta) = tokens.next().await {
        full.push_str(&delta?);
    }

    let edit: EditInstruction = serde_json::from_str(&full).map_err(|e| {
        telemetry::log_error("server.morph", &format!("invalid edit JSON: {}", e));
        ApiError::MalformedResponse
    })?;

    let updated = Fragment {
        code: apply_edit(&current.code, &edit.edit),
        commentary: edit.commentary,
        ..current
    };
    let payload = serde_json::to_string(&updated).map_err(|_| ApiError::MalformedResponse)?;
    let once = futures_util::stream::once(async move { Ok::<_, Infallible>(payload) });
    Ok(text_response(Body::from_stream(once)))
}
