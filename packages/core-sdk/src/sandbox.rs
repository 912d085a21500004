use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SandboxConfig;
use crate::models::{
    CellResult, ExecutionResult, Fragment, InterpreterResult, RuntimeError, WebResult,
};
use crate::telemetry;
use crate::templates::CODE_INTERPRETER_TEMPLATE;

/** \brief 沙箱存活时间，由沙箱服务端强制。 */
pub const SANDBOX_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_WEB_PORT: u16 = 80;

const ENVD_PORT: u16 = 49983;
const INTERPRETER_PORT: u16 = 49999;
const ENVD_USER: &str = "user";

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("E2B_API_KEY is not configured")]
    MissingApiKey,
    #[error("sandbox creation failed: {0}")]
    Create(String),
    #[error("dependency install failed: {0}")]
    Install(String),
    #[error("file write failed: {0}")]
    Write(String),
    #[error("code execution failed: {0}")]
    Execute(String),
}

/**
 * \brief 命令执行结果。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/**
 * \brief 解释器执行结果。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Execution {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub error: Option<RuntimeError>,
    pub results: Vec<CellResult>,
}

/**
 * \brief 已创建的沙箱会话。
 */
#[async_trait]
pub trait SandboxSession: Send + Sync {
    fn id(&self) -> &str;
    /** \brief `{port}-{id}.{domain}`，不带协议 */
    fn host(&self, port: u16) -> String;
    async fn run_command(&self, cmd: &str) -> Result<CommandOutput, SandboxError>;
    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError>;
    async fn run_code(&self, code: &str) -> Result<Execution, SandboxError>;
}

/**
 * \brief 沙箱服务：按模板创建会话。
 */
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn create(
        &self,
        template: &str,
        metadata: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Box<dyn SandboxSession>, SandboxError>;
}

/**
 * \brief 把片段交给沙箱：创建、按需安装依赖、写入文件，然后执行或返回 URL。
 */
pub async fn run_fragment(
    service: &dyn SandboxService,
    fragment: &Fragment,
    user_id: Option<&str>,
    team_id: Option<&str>,
) -> Result<ExecutionResult, SandboxError> {
    let metadata = HashMap::from([
        ("template".to_string(), fragment.template.clone()),
        ("userID".to_string(), user_id.unwrap_or_default().to_string()),
        ("teamID".to_string(), team_id.unwrap_or_default().to_string()),
    ]);
    let sbx = service
        .create(&fragment.template, &metadata, SANDBOX_TIMEOUT)
        .await?;
    telemetry::log_event(
        "sandbox",
        &format!("created sandbox {} template={}", sbx.id(), fragment.template),
    );

    let install = fragment.install_dependencies_command.trim();
    if fragment.has_additional_dependencies && !install.is_empty() {
        sbx.run_command(install).await?;
        telemetry::log_event(
            "sandbox",
            &format!(
                "installed dependencies: {} in sandbox {}",
                fragment.additional_dependencies.join(", "),
                sbx.id()
            ),
        );
    }

    sbx.write_file(&fragment.file_path, &fragment.code).await?;
    telemetry::log_event(
        "sandbox",
        &format!("copied file to {} in {}", fragment.file_path, sbx.id()),
    );

    if fragment.template == CODE_INTERPRETER_TEMPLATE {
        let execution = sbx.run_code(&fragment.code).await?;
        return Ok(ExecutionResult::Interpreter(InterpreterResult {
            sbx_id: sbx.id().to_string(),
            template: fragment.template.clone(),
            stdout: execution.stdout,
            stderr: execution.stderr,
            runtime_error: execution.error,
            cell_results: execution.results,
        }));
    }

    let port = fragment.port.map(|p| p.get()).unwrap_or(DEFAULT_WEB_PORT);
    Ok(ExecutionResult::Web(WebResult {
        sbx_id: sbx.id().to_string(),
        template: fragment.template.clone(),
        url: format!("https://{}", sbx.host(port)),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

/**
 * \brief E2B 控制面客户端。
 */
#[derive(Debug, Clone)]
pub struct E2bSandboxService {
    config: SandboxConfig,
    http: reqwest::Client,
}

impl E2bSandboxService {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SandboxService for E2bSandboxService {
    async fn create(
        &self,
        template: &str,
        metadata: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(SandboxError::MissingApiKey)?;
        let url = format!("{}/sandboxes", self.config.api_url.trim_end_matches('/'));
        let body = json!({
            "templateID": template,
            "timeout": timeout.as_secs(),
            "metadata": metadata,
        });
        let resp = self
            .http
            .post(url)
            .header("X-API-Key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Create(format!("{} -> {}", status, text)));
        }
        let created: CreatedSandbox = resp
            .json()
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;
        Ok(Box::new(E2bSession {
            http: self.http.clone(),
            id: created.sandbox_id,
            domain: created
                .domain
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| self.config.domain.clone()),
            access_token: created.envd_access_token,
        }))
    }
}

struct E2bSession {
    http: reqwest::Client,
    id: String,
    domain: String,
    access_token: Option<String>,
}

impl E2bSession {
    fn base(&self, port: u16) -> String {
        format!("https://{}", self.host(port))
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.header("X-Access-Token", token),
            None => req,
        }
    }
}

#[async_trait]
impl SandboxSession for E2bSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self, port: u16) -> String {
        format!("{}-{}.{}", port, self.id, self.domain)
    }

    async fn run_command(&self, cmd: &str) -> Result<CommandOutput, SandboxError> {
        let url = format!("{}/process.Process/Start", self.base(ENVD_PORT));
        let request = json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", cmd],
                "envs": {},
            }
        });
        let auth = BASE64.encode(format!("{}:", ENVD_USER));
        let resp = self
            .authed(self.http.post(url))
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .header("Authorization", format!("Basic {}", auth))
            .body(connect_envelope(&request))
            .send()
            .await
            .map_err(|e| SandboxError::Install(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Install(format!("{} -> {}", status, text)));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| SandboxError::Install(e.to_string()))?;
        let output = parse_process_stream(&bytes).map_err(SandboxError::Install)?;
        if output.exit_code != 0 {
            return Err(SandboxError::Install(format!(
                "command exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        let url = format!("{}/files", self.base(ENVD_PORT));
        let part = Part::bytes(content.as_bytes().to_vec()).file_name(path.to_string());
        let form = Form::new().part("file", part);
        let resp = self
            .authed(self.http.post(url))
            .query(&[("path", path), ("username", ENVD_USER)])
            .multipart(form)
            .send()
            .await
            .map_err(|e| SandboxError::Write(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Write(format!("{} -> {}", status, text)));
        }
        Ok(())
    }

    async fn run_code(&self, code: &str) -> Result<Execution, SandboxError> {
        let url = format!("{}/execute", self.base(INTERPRETER_PORT));
        let resp = self
            .authed(self.http.post(url))
            .json(&json!({ "code": code }))
            .send()
            .await
            .map_err(|e| SandboxError::Execute(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SandboxError::Execute(format!("{} -> {}", status, text)));
        }
        let text = resp
            .text()
            .await
            .map_err(|e| SandboxError::Execute(e.to_string()))?;
        Ok(parse_execution(&text))
    }
}

/**
 * \brief Connect 协议的流式帧：1 字节 flag + 4 字节大端长度 + JSON。
 */
fn connect_envelope(message: &Value) -> Vec<u8> {
    let payload = message.to_string().into_bytes();
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(0u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

const CONNECT_END_STREAM: u8 = 0x02;

fn decode_envelopes(mut buf: &[u8]) -> Result<Vec<(u8, Value)>, String> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 5 {
            return Err("truncated frame header".to_string());
        }
        let flags = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let rest = &buf[5..];
        if rest.len() < len {
            return Err("truncated frame body".to_string());
        }
        let value = if len == 0 {
            Value::Null
        } else {
            serde_json::from_slice(&rest[..len]).map_err(|e| e.to_string())?
        };
        frames.push((flags, value));
        buf = &rest[len..];
    }
    Ok(frames)
}

fn decode_output(v: Option<&Value>) -> String {
    v.and_then(|s| s.as_str())
        .and_then(|s| BASE64.decode(s).ok())
        .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        .unwrap_or_default()
}

fn parse_process_stream(body: &[u8]) -> Result<CommandOutput, String> {
    let mut output = CommandOutput::default();
    for (flags, frame) in decode_envelopes(body)? {
        if flags & CONNECT_END_STREAM != 0 {
            if let Some(err) = frame.get("error") {
                let message = err
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| err.to_string());
                return Err(message);
            }
            continue;
        }
        let Some(event) = frame.get("event") else {
            continue;
        };
        if let Some(data) = event.get("data") {
            output.stdout.push_str(&decode_output(data.get("stdout")));
            output.stderr.push_str(&decode_output(data.get("stderr")));
        }
        if let Some(end) = event.get("end") {
            output.exit_code = end.get("exitCode").and_then(|c| c.as_i64()).unwrap_or(0) as i32;
            if let Some(err) = end.get("error").and_then(|e| e.as_str()) {
                if !err.is_empty() && output.stderr.is_empty() {
                    output.stderr = err.to_string();
                }
            }
        }
    }
    Ok(output)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/**
 * \brief 解析解释器返回的 NDJSON 输出。
 */
fn parse_execution(body: &str) -> Execution {
    let mut execution = Execution::default();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(msg) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        match msg.get("type").and_then(|t| t.as_str()) {
            Some("stdout") => execution.stdout.extend(str_field(&msg, "text")),
            Some("stderr") => execution.stderr.extend(str_field(&msg, "text")),
            Some("result") => execution.results.push(CellResult {
                png: str_field(&msg, "png"),
                text: str_field(&msg, "text"),
                html: str_field(&msg, "html"),
            }),
            Some("error") => {
                execution.error = Some(RuntimeError {
                    name: str_field(&msg, "name").unwrap_or_default(),
                    value: str_field(&msg, "value").unwrap_or_default(),
                    traceback: str_field(&msg, "traceback").unwrap_or_default(),
                })
            }
            _ => {}
        }
    }
    execution
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU16;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        created: Vec<(String, HashMap<String, String>, Duration)>,
        commands: Vec<String>,
        files: Vec<(String, String)>,
        executed: Vec<String>,
    }

    struct FakeService {
        calls: Arc<Mutex<Calls>>,
    }

    struct FakeSession {
        calls: Arc<Mutex<Calls>>,
    }

    #[async_trait]
    impl SandboxService for FakeService {
        async fn create(
            &self,
            template: &str,
            metadata: &HashMap<String, String>,
            timeout: Duration,
        ) -> Result<Box<dyn SandboxSession>, SandboxError> {
            self.calls
                .lock()
                .unwrap()
                .created
                .push((template.to_string(), metadata.clone(), timeout));
            Ok(Box::new(FakeSession {
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait]
    impl SandboxSession for FakeSession {
        fn id(&self) -> &str {
            "sbx-1"
        }

        fn host(&self, port: u16) -> String {
            format!("{}-sbx-1.e2b.test", port)
        }

        async fn run_command(&self, cmd: &str) -> Result<CommandOutput, SandboxError> {
            self.calls.lock().unwrap().commands.push(cmd.to_string());
            Ok(CommandOutput::default())
        }

        async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
            self.calls
                .lock()
                .unwrap()
                .files
                .push((path.to_string(), content.to_string()));
            Ok(())
        }

        async fn run_code(&self, code: &str) -> Result<Execution, SandboxError> {
            self.calls.lock().unwrap().executed.push(code.to_string());
            Ok(Execution {
                stdout: vec!["3\n".into()],
                ..Execution::default()
            })
        }
    }

    fn fragment(template: &str, port: Option<u16>) -> Fragment {
        Fragment {
            commentary: String::new(),
            template: template.to_string(),
            title: "t".into(),
            description: "d".into(),
            additional_dependencies: vec![],
            has_additional_dependencies: false,
            install_dependencies_command: String::new(),
            port: port.and_then(NonZeroU16::new),
            file_path: "app.py".into(),
            code: "print(1 + 2)".into(),
        }
    }

    fn service() -> (FakeService, Arc<Mutex<Calls>>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        (
            FakeService {
                calls: calls.clone(),
            },
            calls,
        )
    }

    #[tokio::test]
    async fn test_web_fragment_defaults_to_port_80() {
        let (svc, calls) = service();
        let result = run_fragment(&svc, &fragment("nextjs-developer", None), Some("u1"), None)
            .await
            .expect("run fragment");
        match result {
            ExecutionResult::Web(web) => {
                assert_eq!(web.url, "https://80-sbx-1.e2b.test");
                assert_eq!(web.sbx_id, "sbx-1");
            }
            other => panic!("expected web result, got {:?}", other),
        }
        let calls = calls.lock().unwrap();
        let (template, metadata, timeout) = &calls.created[0];
        assert_eq!(template, "nextjs-developer");
        assert_eq!(metadata["userID"], "u1");
        assert_eq!(metadata["teamID"], "");
        assert_eq!(*timeout, SANDBOX_TIMEOUT);
        assert!(calls.commands.is_empty());
        assert_eq!(calls.files, vec![("app.py".to_string(), "print(1 + 2)".to_string())]);
        assert!(calls.executed.is_empty());
    }

    #[tokio::test]
    async fn test_web_fragment_uses_declared_port_and_installs() {
        let (svc, calls) = service();
        let mut frag = fragment("streamlit-developer", Some(8501));
        frag.has_additional_dependencies = true;
        frag.additional_dependencies = vec!["polars".into()];
        frag.install_dependencies_command = "pip install polars".into();
        let result = run_fragment(&svc, &frag, None, Some("team"))
            .await
            .expect("run fragment");
        assert!(matches!(result, ExecutionResult::Web(ref w) if w.url == "https://8501-sbx-1.e2b.test"));
        assert_eq!(calls.lock().unwrap().commands, vec!["pip install polars".to_string()]);
    }

    #[tokio::test]
    async fn test_install_skipped_when_command_blank() {
        let (svc, calls) = service();
        let mut frag = fragment("nextjs-developer", Some(3000));
        frag.has_additional_dependencies = true;
        frag.install_dependencies_command = "   ".into();
        run_fragment(&svc, &frag, None, None).await.expect("run fragment");
        assert!(calls.lock().unwrap().commands.is_empty());
    }

    #[tokio::test]
    async fn test_interpreter_fragment_executes_code() {
        let (svc, calls) = service();
        let result = run_fragment(&svc, &fragment(CODE_INTERPRETER_TEMPLATE, None), None, None)
            .await
            .expect("run fragment");
        match result {
            ExecutionResult::Interpreter(r) => {
                assert_eq!(r.stdout, vec!["3\n".to_string()]);
                assert_eq!(r.template, CODE_INTERPRETER_TEMPLATE);
            }
            other => panic!("expected interpreter result, got {:?}", other),
        }
        assert_eq!(calls.lock().unwrap().executed, vec!["print(1 + 2)".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_api_key() {
        let svc = E2bSandboxService::new(SandboxConfig::default());
        let err = run_fragment(&svc, &fragment("nextjs-developer", None), None, None)
            .await
            .expect_err("no key configured");
        assert!(matches!(err, SandboxError::MissingApiKey));
    }

    #[test]
    fn test_parse_execution_ndjson() {
        let body = concat!(
            r#"{"type":"stdout","text":"hello\n","timestamp":1}"#,
            "\n",
            r#"{"type":"result","text":"42","html":"<b>42</b>","is_main_result":true}"#,
            "\n",
            r#"{"type":"error","name":"ZeroDivisionError","value":"division by zero","traceback":"Traceback..."}"#,
            "\n",
            r#"{"type":"end_of_execution"}"#,
            "\n"
        );
        let exec = parse_execution(body);
        assert_eq!(exec.stdout, vec!["hello\n".to_string()]);
        assert!(exec.stderr.is_empty());
        assert_eq!(exec.results.len(), 1);
        assert_eq!(exec.results[0].text.as_deref(), Some("42"));
        assert_eq!(exec.results[0].png, None);
        let err = exec.error.expect("runtime error");
        assert_eq!(err.name, "ZeroDivisionError");
    }

    #[test]
    fn test_connect_stream_roundtrip() {
        let mut body = Vec::new();
        body.extend(connect_envelope(&json!({"event": {"start": {"pid": 7}}})));
        body.extend(connect_envelope(&json!({"event": {"data": {"stdout": BASE64.encode("added 1 package\n")}}})));
        body.extend(connect_envelope(&json!({"event": {"end": {"exitCode": 0, "exited": true}}})));
        let mut end = connect_envelope(&json!({}));
        end[0] = CONNECT_END_STREAM;
        body.extend(end);
        let out = parse_process_stream(&body).expect("parse");
        assert_eq!(out.stdout, "added 1 package\n");
        assert_eq!(out.exit_code, 0);

        let mut failed = connect_envelope(&json!({"error": {"code": "unavailable", "message": "sandbox gone"}}));
        failed[0] = CONNECT_END_STREAM;
        assert_eq!(parse_process_stream(&failed), Err("sandbox gone".to_string()));
        assert!(parse_process_stream(&[0, 0, 0]).is_err());
    }
}
