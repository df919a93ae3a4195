//! Per-tool execution envelope (`spec.md` §4.5): validate, timeout,
//! output-size guard, cancellation, sandboxed subprocess execution, uniform
//! `CallToolResult` formatting. Grounded on the teacher's routing layer
//! (`examples/Epistates-turbomcp/crates/turbomcp-server/src/routing.rs`)
//! for the validate-then-invoke shape, generalized here into an explicit
//! pipeline since this spec's runtime does strictly more (timeouts,
//! output caps, subprocess sandboxing) than the teacher's in-process call.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use discovery_protocol::schema::{ParamDescriptor, ValidationError, validate_and_apply_defaults};
use discovery_protocol::types::CallToolResult;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default timeout for subprocess-backed tools (`spec.md` §4.5). The
/// "source" duplicated this constant inconsistently (30s vs 300s,
/// `spec.md` §9 open question); this workspace picks 300s for subprocess
/// tools and surfaces the discrepancy in `DESIGN.md` rather than guessing
/// which duplicate was authoritative.
pub const DEFAULT_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);
/// Default timeout for in-process tools.
pub const DEFAULT_INPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);
/// Per-stream output cap; stdout and stderr are each capped independently.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Everything a tool handler needs to do its work.
pub struct ToolInvocation {
    /// Tool name, for logging/correlation.
    pub tool_name: String,
    /// Validated, default-filled arguments.
    pub args: BTreeMap<String, Value>,
    /// Cancelled when `notifications/cancelled` arrives for this call.
    pub cancellation: CancellationToken,
}

/// A registered tool's executable behavior. In-process handlers implement
/// this directly; subprocess-backed tools use [`SubprocessHandler`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool. Implementations should respect `invocation.cancellation`
    /// for anything that can take more than a few milliseconds.
    async fn call(&self, invocation: ToolInvocation) -> CallToolResult;

    /// Override the default timeout for this tool (`spec.md` §4.5 "tool may
    /// declare override").
    fn timeout(&self) -> Duration {
        DEFAULT_INPROCESS_TIMEOUT
    }
}

/// A static resource's content producer (`spec.md` §3 "Resource" —
/// `readHandler`). Separate from [`ToolHandler`] since `resources/read`
/// takes no arguments beyond the URI already used to look the resource up.
#[async_trait]
pub trait ResourceReadHandler: Send + Sync {
    /// Produce the resource's current contents.
    async fn read(&self, uri: &str) -> Result<discovery_protocol::types::ResourceContents, crate::error::ServerError>;
}

/// A prompt template's message producer, invoked by `prompts/get` once its
/// arguments have passed schema validation.
#[async_trait]
pub trait PromptRenderHandler: Send + Sync {
    /// Render the prompt's messages for the given (already-validated)
    /// arguments.
    async fn render(
        &self,
        name: &str,
        arguments: &BTreeMap<String, Value>,
    ) -> Result<Vec<discovery_protocol::types::PromptMessage>, crate::error::ServerError>;
}

/// Deny-by-default sanitizers for the argument classes `spec.md` §4.5
/// names explicitly (hostnames, URLs, interfaces). Subprocess handlers
/// should run every untrusted argument through the matching sanitizer
/// before it reaches `argv`.
pub mod sanitize {
    /// `true` if `value` is a safe hostname/IP literal: `[A-Za-z0-9.-]`,
    /// length <= 253.
    pub fn is_valid_hostname(value: &str) -> bool {
        !value.is_empty()
            && value.len() <= 253
            && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    }

    /// `true` if `value` is an `http(s)://…` URL and nothing else.
    pub fn is_valid_url(value: &str) -> bool {
        (value.starts_with("http://") || value.starts_with("https://")) && !value.contains(' ')
    }

    /// `true` if `value` is a safe network interface name: `[A-Za-z0-9-]+`.
    pub fn is_valid_interface(value: &str) -> bool {
        !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    }
}

/// A tool backed by an external binary. `argv_builder` receives validated
/// arguments and must build argv *without* string concatenation — each
/// element becomes one `std::process::Command` arg, never shell-interpreted
/// (`spec.md` §4.5 point 5).
pub struct SubprocessHandler {
    /// Binary to execute, e.g. `"ping"`.
    pub program: String,
    /// Builds argv from validated arguments; returns `Err` if an argument
    /// fails sanitization.
    pub argv_builder: Box<dyn Fn(&BTreeMap<String, Value>) -> Result<Vec<String>, String> + Send + Sync>,
    /// Override for this tool's timeout; `None` uses
    /// [`DEFAULT_SUBPROCESS_TIMEOUT`].
    pub timeout_override: Option<Duration>,
}

#[async_trait]
impl ToolHandler for SubprocessHandler {
    fn timeout(&self) -> Duration {
        self.timeout_override.unwrap_or(DEFAULT_SUBPROCESS_TIMEOUT)
    }

    async fn call(&self, invocation: ToolInvocation) -> CallToolResult {
        let argv = match (self.argv_builder)(&invocation.args) {
            Ok(argv) => argv,
            Err(message) => return CallToolResult::error(format!("invalid arguments: {message}")),
        };

        let mut command = Command::new(&self.program);
        command.args(&argv).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                return CallToolResult::error(format!("failed to start '{}': {err}", self.program));
            }
        };

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait_result = tokio::select! {
            biased;
            _ = invocation.cancellation.cancelled() => {
                return terminate_and_report(child, "cancelled").await;
            }
            result = child.wait() => result,
        };

        let (stdout, stdout_truncated) = match stdout_pipe.as_mut() {
            Some(pipe) => read_capped(pipe).await,
            None => (Vec::new(), false),
        };
        let (stderr, stderr_truncated) = match stderr_pipe.as_mut() {
            Some(pipe) => read_capped(pipe).await,
            None => (Vec::new(), false),
        };

        let status = match wait_result {
            Ok(status) => status,
            Err(err) => return CallToolResult::error(format!("wait failed: {err}")),
        };

        format_subprocess_result(
            &String::from_utf8_lossy(&stdout),
            &String::from_utf8_lossy(&stderr),
            status.success(),
            status.code(),
            stdout_truncated || stderr_truncated,
        )
    }
}

async fn terminate_and_report(mut child: tokio::process::Child, reason: &str) -> CallToolResult {
    if let Some(pid) = child.id() {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(%err, pid, "failed to send SIGTERM");
            }
        }
        let _ = tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await;
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill().await;
        }
    } else {
        let _ = child.kill().await;
    }
    CallToolResult::error(format!("tool execution {reason}; exit code -1"))
}

async fn read_capped<R: AsyncReadExt + Unpin>(reader: &mut R) -> (Vec<u8>, bool) {
    let mut buf = vec![0u8; MAX_OUTPUT_BYTES + 1];
    let mut total = 0usize;
    loop {
        match reader.read(&mut buf[total..]).await {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if total > MAX_OUTPUT_BYTES {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    let truncated = total > MAX_OUTPUT_BYTES;
    buf.truncate(total.min(MAX_OUTPUT_BYTES));
    (buf, truncated)
}

fn format_subprocess_result(
    stdout: &str,
    stderr: &str,
    success: bool,
    exit_code: Option<i32>,
    truncated: bool,
) -> CallToolResult {
    let mut body = if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("Stdout:\n{stdout}\n\nStderr:\n{stderr}")
    };
    if truncated {
        body.push_str("\n\n[output truncated: exceeded 1 MiB cap]");
    }
    let is_error = truncated || !success;
    if is_error && exit_code.is_some() {
        body.push_str(&format!("\n\n[exit code: {}]", exit_code.unwrap()));
    }
    CallToolResult {
        content: vec![discovery_protocol::types::ContentItem::text(body)],
        is_error,
    }
}

/// Runs the validate -> timeout -> cancellation pipeline around a
/// [`ToolHandler`]. The output-size guard and subprocess sandboxing live
/// inside [`SubprocessHandler`] itself since only subprocess tools need
/// them; in-process tools are trusted to respect [`MAX_OUTPUT_BYTES`] in
/// their own formatting.
pub async fn invoke(
    tool_name: &str,
    schema: &Value,
    params: &[ParamDescriptor],
    args: BTreeMap<String, Value>,
    handler: &dyn ToolHandler,
    cancellation: CancellationToken,
) -> CallToolResult {
    let validated = match validate_and_apply_defaults(schema, params, args) {
        Ok(validated) => validated,
        Err(ValidationError::Invalid { field, message }) => {
            return CallToolResult::error(format!("validation failed at {field}: {message}"));
        }
        Err(ValidationError::InvalidSchema(message)) => {
            return CallToolResult::error(format!("tool schema is invalid: {message}"));
        }
    };

    let timeout = handler.timeout();
    let invocation = ToolInvocation {
        tool_name: tool_name.to_string(),
        args: validated,
        cancellation: cancellation.clone(),
    };

    tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            CallToolResult::error("tool call cancelled before completion")
        }
        result = tokio::time::timeout(timeout, handler.call(invocation)) => {
            match result {
                Ok(call_result) => call_result,
                Err(_) => CallToolResult::error(format!(
                    "tool '{tool_name}' exceeded its {}s timeout; exit code -1",
                    timeout.as_secs()
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }

        async fn call(&self, _invocation: ToolInvocation) -> CallToolResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            CallToolResult::text("too late")
        }
    }

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn call(&self, invocation: ToolInvocation) -> CallToolResult {
            CallToolResult::text(format!("{:?}", invocation.args.get("host")))
        }
    }

    fn host_schema_and_params() -> (Value, Vec<ParamDescriptor>) {
        let params = vec![ParamDescriptor {
            name: "host".into(),
            description: "target".into(),
            kind: discovery_protocol::schema::ParamKind::String { enum_values: None },
            required: true,
            default: None,
        }];
        (discovery_protocol::schema::build_schema(&params), params)
    }

    #[tokio::test]
    async fn invoke_rejects_invalid_args_without_calling_handler() {
        let (schema, params) = host_schema_and_params();
        let result = invoke(
            "t",
            &schema,
            &params,
            BTreeMap::new(),
            &EchoHandler,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn invoke_succeeds_with_valid_args() {
        let (schema, params) = host_schema_and_params();
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        let result = invoke(
            "t",
            &schema,
            &params,
            args,
            &EchoHandler,
            CancellationToken::new(),
        )
        .await;
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn invoke_times_out() {
        let (schema, params) = host_schema_and_params();
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        let result = invoke(
            "t",
            &schema,
            &params,
            args,
            &SlowHandler,
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_error);
        assert!(result.content.iter().any(|c| matches!(c, discovery_protocol::types::ContentItem::Text { text } if text.contains("timeout"))));
    }

    #[tokio::test]
    async fn invoke_honors_cancellation() {
        let (schema, params) = host_schema_and_params();
        let mut args = BTreeMap::new();
        args.insert("host".to_string(), json!("8.8.8.8"));
        let token = CancellationToken::new();
        token.cancel();
        let result = invoke("t", &schema, &params, args, &SlowHandler, token).await;
        assert!(result.is_error);
    }

    #[test]
    fn hostname_sanitizer_rejects_shell_metacharacters() {
        assert!(sanitize::is_valid_hostname("10.0.0.5"));
        assert!(!sanitize::is_valid_hostname("10.0.0.5; rm -rf /"));
    }

    #[test]
    fn url_sanitizer_requires_http_scheme() {
        assert!(sanitize::is_valid_url("https://example.com/path"));
        assert!(!sanitize::is_valid_url("javascript:alert(1)"));
    }
}
