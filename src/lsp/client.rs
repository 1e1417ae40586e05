//! Single language-server subprocess client.
//!
//! Speaks the LSP base protocol (Content-Length framed JSON-RPC) over the
//! child's stdio. A reader thread routes responses to waiting requests and
//! folds `publishDiagnostics` notifications into a per-path table, so
//! diagnostics queries never block on the server.

use crate::error::{Error, Result};
use crate::lsp::types::{
    Diagnostic, DiagnosticSeverity, HoverInfo, LanguageServerConfig, LspLocation, ServerHealth,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long a server gets to honor the shutdown/exit sequence.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Poll cadence while waiting out the grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Wait out the grace period for a voluntary exit, then force one.
///
/// Returns `Ok` only for a voluntary exit; a killed server is an error so
/// the pool can log which language misbehaved.
fn reap_server(child: &mut Child, grace: Duration) -> Result<()> {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
            Err(e) => {
                return Err(Error::lsp_comm(format!(
                    "could not observe language-server exit: {e}"
                )))
            }
        }
    }

    // Grace expired; the server is no longer cooperating.
    child.kill().ok();
    child.wait().ok();
    Err(Error::lsp_comm(format!(
        "language server ignored shutdown for {}ms and was killed",
        grace.as_millis()
    )))
}

/// Shared state between the client and its reader thread.
#[derive(Default)]
struct SharedState {
    /// Completed responses by request id
    responses: Mutex<HashMap<u64, Value>>,
    response_arrived: Condvar,
    /// Latest diagnostics per repository-relative path
    diagnostics: Mutex<HashMap<String, Vec<Diagnostic>>>,
}

/// One running language-server process.
pub struct LspClient {
    language: String,
    config: LanguageServerConfig,
    root_path: PathBuf,
    timeout: Duration,
    child: Child,
    stdin: ChildStdin,
    state: Arc<SharedState>,
    health: ServerHealth,
    next_id: u64,
    /// Open documents and their sync versions
    open_docs: HashMap<String, i64>,
    reader: Option<std::thread::JoinHandle<()>>,
}

impl LspClient {
    /// Spawn and initialize a language server for `language`.
    pub fn start(
        language: impl Into<String>,
        config: LanguageServerConfig,
        root_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let language = language.into();
        let root_path = root_path.into();

        let executable = config
            .executable()
            .ok_or_else(|| Error::Config(format!("empty server command for {language}")))?;

        let mut cmd = Command::new(&executable);
        cmd.args(&config.command[1..])
            .current_dir(&root_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd.spawn().map_err(|e| {
            Error::lsp_comm(format!("failed to spawn {executable} for {language}: {e}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::lsp_comm("failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::lsp_comm("failed to get stdout handle"))?;

        let state = Arc::new(SharedState::default());
        let reader = spawn_reader(stdout, Arc::clone(&state), root_path.clone(), language.clone());

        let mut client = Self {
            language,
            config,
            root_path,
            timeout,
            child,
            stdin,
            state,
            health: ServerHealth::Starting,
            next_id: 1,
            open_docs: HashMap::new(),
            reader: Some(reader),
        };

        if let Err(err) = client.initialize() {
            let _ = client.child.kill();
            let _ = client.child.wait();
            client.health = ServerHealth::Failed;
            return Err(err);
        }
        client.health = ServerHealth::Running;
        Ok(client)
    }

    /// Language this client serves.
    pub fn language(&self) -> &str {
        &self.language
    }

    /// Current health.
    pub fn health(&self) -> ServerHealth {
        self.health
    }

    /// Whether the subprocess is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn initialize(&mut self) -> Result<()> {
        let root_uri = path_to_uri(&self.root_path);
        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {
                "textDocument": {
                    "synchronization": {"didSave": false},
                    "publishDiagnostics": {"relatedInformation": false},
                    "hover": {"contentFormat": ["plaintext", "markdown"]},
                },
            },
            "workspaceFolders": [{"uri": root_uri, "name": "workspace"}],
        });
        self.send_request("initialize", params)?;
        self.send_notification("initialized", json!({}))?;
        Ok(())
    }

    fn send_request(&mut self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_message(&payload)?;

        // Wait for the reader thread to deliver our response.
        let deadline = Instant::now() + self.timeout;
        let mut responses = self
            .state
            .responses
            .lock()
            .map_err(|_| Error::lsp_comm("response table poisoned"))?;
        loop {
            if let Some(response) = responses.remove(&id) {
                if let Some(error) = response.get("error") {
                    return Err(Error::lsp_comm(format!(
                        "{method} failed: {}",
                        error.get("message").and_then(Value::as_str).unwrap_or("?")
                    )));
                }
                return Ok(response.get("result").cloned().unwrap_or(Value::Null));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(self.timeout.as_millis() as u64));
            }
            let (guard, wait) = self
                .state
                .response_arrived
                .wait_timeout(responses, remaining)
                .map_err(|_| Error::lsp_comm("response table poisoned"))?;
            responses = guard;
            if wait.timed_out() && !responses.contains_key(&id) {
                return Err(Error::timeout(self.timeout.as_millis() as u64));
            }
        }
    }

    fn send_notification(&mut self, method: &str, params: Value) -> Result<()> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&payload)
    }

    fn write_message(&mut self, payload: &Value) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        write!(self.stdin, "Content-Length: {}\r\n\r\n{}", body.len(), body)
            .map_err(|e| Error::lsp_comm(format!("failed to send message: {e}")))?;
        self.stdin
            .flush()
            .map_err(|e| Error::lsp_comm(format!("failed to flush stdin: {e}")))
    }

    fn document_uri(&self, path: &str) -> String {
        path_to_uri(&self.root_path.join(path))
    }

    /// Open a document with its content.
    pub fn did_open(&mut self, path: &str, content: &str) -> Result<()> {
        let uri = self.document_uri(path);
        let language_id = self.config.language_id.clone();
        self.open_docs.insert(path.to_string(), 1);
        self.send_notification(
            "textDocument/didOpen",
            json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": 1,
                    "text": content,
                }
            }),
        )
    }

    /// Replace a document's content (full sync).
    pub fn did_change(&mut self, path: &str, content: &str) -> Result<()> {
        if !self.open_docs.contains_key(path) {
            return self.did_open(path, content);
        }
        let version = self
            .open_docs
            .entry(path.to_string())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        let version = *version;
        let uri = self.document_uri(path);
        self.send_notification(
            "textDocument/didChange",
            json!({
                "textDocument": {"uri": uri, "version": version},
                "contentChanges": [{"text": content}],
            }),
        )
    }

    /// Close a document.
    pub fn did_close(&mut self, path: &str) -> Result<()> {
        if self.open_docs.remove(path).is_none() {
            return Ok(());
        }
        let uri = self.document_uri(path);
        self.send_notification(
            "textDocument/didClose",
            json!({"textDocument": {"uri": uri}}),
        )
    }

    /// Latest diagnostics for a path.
    ///
    /// Absent data means "no error reported", never "no errors exist":
    /// a just-started server may not have published anything yet.
    pub fn diagnostics(&self, path: &str) -> Vec<Diagnostic> {
        self.state
            .diagnostics
            .lock()
            .ok()
            .and_then(|table| table.get(path).cloned())
            .unwrap_or_default()
    }

    /// Diagnostics for every path the server has reported on.
    pub fn all_diagnostics(&self) -> HashMap<String, Vec<Diagnostic>> {
        self.state
            .diagnostics
            .lock()
            .map(|table| table.clone())
            .unwrap_or_default()
    }

    /// Go-to-definition at a 0-indexed position.
    pub fn definition(&mut self, path: &str, line: u32, column: u32) -> Result<Option<LspLocation>> {
        let uri = self.document_uri(path);
        let result = self.send_request(
            "textDocument/definition",
            position_params(&uri, line, column),
        )?;
        Ok(parse_locations(&result, &self.root_path).into_iter().next())
    }

    /// All references to the symbol at a 0-indexed position.
    pub fn references(&mut self, path: &str, line: u32, column: u32) -> Result<Vec<LspLocation>> {
        let uri = self.document_uri(path);
        let mut params = position_params(&uri, line, column);
        params["context"] = json!({"includeDeclaration": true});
        let result = self.send_request("textDocument/references", params)?;
        Ok(parse_locations(&result, &self.root_path))
    }

    /// Hover contents at a 0-indexed position.
    pub fn hover(&mut self, path: &str, line: u32, column: u32) -> Result<Option<HoverInfo>> {
        let uri = self.document_uri(path);
        let result =
            self.send_request("textDocument/hover", position_params(&uri, line, column))?;
        Ok(parse_hover(&result))
    }

    /// Shut the server down gracefully, killing it after a grace period.
    pub fn shutdown(&mut self) -> Result<()> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        // Best-effort graceful sequence; the server may already be gone.
        let id = self.next_id;
        self.next_id += 1;
        let _ = self.write_message(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "shutdown",
            "params": Value::Null,
        }));
        let _ = self.send_notification("exit", Value::Null);

        let result = reap_server(&mut self.child, SHUTDOWN_GRACE);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.health = ServerHealth::Failed;
        result
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn spawn_reader(
    stdout: ChildStdout,
    state: Arc<SharedState>,
    root_path: PathBuf,
    language: String,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        loop {
            match read_message(&mut reader) {
                Ok(Some(message)) => route_message(message, &state, &root_path),
                Ok(None) => {
                    debug!(language = %language, "language server closed stdout");
                    break;
                }
                Err(e) => {
                    warn!(language = %language, error = %e, "failed to read LSP message");
                    break;
                }
            }
        }
    })
}

/// Read one Content-Length framed message. `Ok(None)` on clean EOF.
fn read_message(reader: &mut BufReader<ChildStdout>) -> Result<Option<Value>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| Error::lsp_comm(format!("header read failed: {e}")))?;
        if read == 0 {
            return Ok(None);
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }

    let length =
        content_length.ok_or_else(|| Error::lsp_comm("message without Content-Length header"))?;
    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::lsp_comm(format!("body read failed: {e}")))?;
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

fn route_message(message: Value, state: &SharedState, root_path: &Path) {
    // Responses carry an id; notifications carry a method.
    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        if message.get("result").is_some() || message.get("error").is_some() {
            if let Ok(mut responses) = state.responses.lock() {
                responses.insert(id, message);
                state.response_arrived.notify_all();
            }
            return;
        }
        // Server-to-client request; nothing we support, ignore it.
        return;
    }

    if message.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics") {
        let Some(params) = message.get("params") else {
            return;
        };
        let Some(uri) = params.get("uri").and_then(Value::as_str) else {
            return;
        };
        let path = uri_to_relative_path(uri, root_path);
        let diagnostics = params
            .get("diagnostics")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_diagnostic).collect())
            .unwrap_or_default();
        if let Ok(mut table) = state.diagnostics.lock() {
            table.insert(path, diagnostics);
        }
    }
}

fn parse_diagnostic(value: &Value) -> Option<Diagnostic> {
    let message = value.get("message")?.as_str()?.to_string();
    let start = value.get("range")?.get("start")?;
    Some(Diagnostic {
        severity: DiagnosticSeverity::from_lsp(
            value.get("severity").and_then(Value::as_i64).unwrap_or(1),
        ),
        message,
        line: start.get("line").and_then(Value::as_u64).unwrap_or(0) as u32,
        column: start.get("character").and_then(Value::as_u64).unwrap_or(0) as u32,
        code: value.get("code").map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    })
}

fn position_params(uri: &str, line: u32, column: u32) -> Value {
    json!({
        "textDocument": {"uri": uri},
        "position": {"line": line, "character": column},
    })
}

fn parse_locations(result: &Value, root_path: &Path) -> Vec<LspLocation> {
    let items: Vec<&Value> = match result {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![result],
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| {
            // Location {uri, range} or LocationLink {targetUri, targetRange}
            let (uri, range) = if let Some(uri) = item.get("uri").and_then(Value::as_str) {
                (uri, item.get("range")?)
            } else {
                (
                    item.get("targetUri").and_then(Value::as_str)?,
                    item.get("targetRange")?,
                )
            };
            let start = range.get("start")?;
            Some(LspLocation {
                path: uri_to_relative_path(uri, root_path),
                line: start.get("line").and_then(Value::as_u64)? as u32,
                column: start.get("character").and_then(Value::as_u64)? as u32,
            })
        })
        .collect()
}

fn parse_hover(result: &Value) -> Option<HoverInfo> {
    let contents = result.get("contents")?;
    let text = match contents {
        Value::String(s) => s.clone(),
        Value::Object(map) => map.get("value")?.as_str()?.to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map.get("value").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(HoverInfo { contents: text })
    }
}

fn path_to_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

fn uri_to_relative_path(uri: &str, root_path: &Path) -> String {
    let absolute = uri.strip_prefix("file://").unwrap_or(uri);
    Path::new(absolute)
        .strip_prefix(root_path)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| absolute.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diagnostic_fields() {
        let value = json!({
            "severity": 1,
            "message": "name 'g' is not defined",
            "range": {"start": {"line": 1, "character": 11}, "end": {"line": 1, "character": 12}},
            "code": "reportUndefinedVariable",
        });
        let diagnostic = parse_diagnostic(&value).unwrap();
        assert!(diagnostic.is_error());
        assert_eq!(diagnostic.line, 1);
        assert_eq!(diagnostic.column, 11);
        assert_eq!(diagnostic.code.as_deref(), Some("reportUndefinedVariable"));
    }

    #[test]
    fn test_parse_locations_handles_links_and_plain() {
        let root = Path::new("/repo");
        let plain = json!({
            "uri": "file:///repo/src/main.py",
            "range": {"start": {"line": 3, "character": 0}},
        });
        let locations = parse_locations(&plain, root);
        assert_eq!(locations[0].path, "src/main.py");
        assert_eq!(locations[0].line, 3);

        let links = json!([{
            "targetUri": "file:///repo/lib.py",
            "targetRange": {"start": {"line": 9, "character": 4}},
        }]);
        let locations = parse_locations(&links, root);
        assert_eq!(locations[0].path, "lib.py");
        assert_eq!(locations[0].line, 9);
    }

    #[test]
    fn test_parse_hover_variants() {
        assert_eq!(
            parse_hover(&json!({"contents": "def f()"})).unwrap().contents,
            "def f()"
        );
        assert_eq!(
            parse_hover(&json!({"contents": {"kind": "markdown", "value": "**f**"}}))
                .unwrap()
                .contents,
            "**f**"
        );
        assert!(parse_hover(&json!({"contents": ""})).is_none());
        assert!(parse_hover(&json!({})).is_none());
    }

    #[test]
    fn test_uri_roundtrip_relativizes() {
        let root = Path::new("/workspace/project");
        assert_eq!(
            uri_to_relative_path("file:///workspace/project/src/a.py", root),
            "src/a.py"
        );
        assert_eq!(
            uri_to_relative_path("file:///elsewhere/b.py", root),
            "/elsewhere/b.py"
        );
    }
}
