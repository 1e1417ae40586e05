//! Language-server pool management.
//!
//! Keeps at most one running server per configured language, started lazily
//! on first request and shut down with the workspace. A failed language is
//! remembered for the session and not retried unless explicitly restarted;
//! callers degrade gracefully when no client is available.

mod client;
mod types;

pub use client::LspClient;
pub use types::{
    default_servers, Diagnostic, DiagnosticSeverity, HoverInfo, LanguageServerConfig, LspLocation,
    LspStatus, ServerHealth,
};

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Pool {
    clients: HashMap<String, Arc<Mutex<LspClient>>>,
    failed: HashSet<String>,
}

/// Per-workspace pool of language-server clients.
///
/// All pool-map mutations happen under one lock; document updates for a
/// language serialize on that client's own mutex, and queries against
/// different languages interleave freely.
pub struct LspManager {
    root_path: PathBuf,
    servers: HashMap<String, LanguageServerConfig>,
    timeout: Duration,
    pool: Mutex<Pool>,
}

impl LspManager {
    /// Create a manager for a workspace root with the default server set.
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self::with_servers(root_path, default_servers())
    }

    /// Create a manager with custom server configurations.
    pub fn with_servers(
        root_path: impl Into<PathBuf>,
        servers: HashMap<String, LanguageServerConfig>,
    ) -> Self {
        Self {
            root_path: root_path.into(),
            servers,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            pool: Mutex::new(Pool::default()),
        }
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Language identifier for a file, from its extension.
    pub fn language_for_file(&self, path: &str) -> Option<String> {
        let ext = Path::new(path).extension()?.to_string_lossy().to_lowercase();
        self.servers
            .iter()
            .find(|(_, config)| config.extensions.iter().any(|e| e == &ext))
            .map(|(language, _)| language.clone())
    }

    /// Whether a language is configured and has not failed this session.
    pub fn is_available(&self, language: &str) -> bool {
        if !self.servers.contains_key(language) {
            return false;
        }
        self.pool
            .lock()
            .map(|pool| !pool.failed.contains(language))
            .unwrap_or(false)
    }

    /// Get or lazily start the client for a language.
    ///
    /// Returns `None` for unconfigured or failed languages; callers
    /// degrade gracefully (the semantic layer emits a pass-through).
    pub fn client(&self, language: &str) -> Option<Arc<Mutex<LspClient>>> {
        let mut pool = self.pool.lock().ok()?;

        // A dead process is detected here and replaced transparently.
        if let Some(existing) = pool.clients.get(language) {
            let alive = existing.lock().map(|mut c| c.is_alive()).unwrap_or(false);
            if alive {
                return Some(Arc::clone(existing));
            }
            warn!(language, "language server died; removing from pool");
            pool.clients.remove(language);
        }

        if pool.failed.contains(language) {
            return None;
        }

        let config = match self.servers.get(language) {
            Some(config) => config.clone(),
            None => {
                debug!(language, "no LSP server configured");
                return None;
            }
        };

        // Probe for the executable before paying for a spawn attempt.
        if let Some(executable) = config.executable() {
            if which::which(&executable).is_err() {
                warn!(language, executable, "language server not installed");
                pool.failed.insert(language.to_string());
                return None;
            }
        }

        match LspClient::start(language, config, self.root_path.clone(), self.timeout) {
            Ok(client) => {
                info!(language, "started language server");
                let client = Arc::new(Mutex::new(client));
                pool.clients
                    .insert(language.to_string(), Arc::clone(&client));
                Some(client)
            }
            Err(e) => {
                warn!(language, error = %e, "failed to start language server");
                pool.failed.insert(language.to_string());
                None
            }
        }
    }

    /// Get or start the client serving a file's language.
    pub fn client_for_file(&self, path: &str) -> Option<Arc<Mutex<LspClient>>> {
        let language = self.language_for_file(path)?;
        self.client(&language)
    }

    /// Mirror a newly opened document into its server.
    pub fn open(&self, path: &str, content: &str) {
        if let Some(client) = self.client_for_file(path) {
            if let Ok(mut client) = client.lock() {
                if let Err(e) = client.did_open(path, content) {
                    warn!(path, error = %e, "didOpen failed");
                }
            }
        }
    }

    /// Mirror a document update into its server.
    pub fn update(&self, path: &str, content: &str) {
        if let Some(client) = self.client_for_file(path) {
            if let Ok(mut client) = client.lock() {
                if let Err(e) = client.did_change(path, content) {
                    warn!(path, error = %e, "didChange failed");
                }
            }
        }
    }

    /// Close a document in its server.
    pub fn close(&self, path: &str) {
        if let Some(client) = self.client_for_file(path) {
            if let Ok(mut client) = client.lock() {
                if let Err(e) = client.did_close(path) {
                    warn!(path, error = %e, "didClose failed");
                }
            }
        }
    }

    /// Latest diagnostics for a file. Empty when no client is available
    /// or the server has not reported yet.
    pub fn diagnostics(&self, path: &str) -> Vec<Diagnostic> {
        match self.client_for_file(path) {
            Some(client) => client
                .lock()
                .map(|c| c.diagnostics(path))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Error-severity diagnostics only.
    pub fn errors(&self, path: &str) -> Vec<Diagnostic> {
        self.diagnostics(path)
            .into_iter()
            .filter(Diagnostic::is_error)
            .collect()
    }

    /// Go-to-definition query.
    pub fn definition(&self, path: &str, line: u32, column: u32) -> Option<LspLocation> {
        let client = self.client_for_file(path)?;
        let mut client = client.lock().ok()?;
        match client.definition(path, line, column) {
            Ok(location) => location,
            Err(e) => {
                warn!(path, error = %e, "definition query failed");
                None
            }
        }
    }

    /// Find-references query.
    pub fn references(&self, path: &str, line: u32, column: u32) -> Vec<LspLocation> {
        let Some(client) = self.client_for_file(path) else {
            return Vec::new();
        };
        let Ok(mut client) = client.lock() else {
            return Vec::new();
        };
        match client.references(path, line, column) {
            Ok(locations) => locations,
            Err(e) => {
                warn!(path, error = %e, "references query failed");
                Vec::new()
            }
        }
    }

    /// Hover query.
    pub fn hover(&self, path: &str, line: u32, column: u32) -> Option<HoverInfo> {
        let client = self.client_for_file(path)?;
        let mut client = client.lock().ok()?;
        match client.hover(path, line, column) {
            Ok(hover) => hover,
            Err(e) => {
                warn!(path, error = %e, "hover query failed");
                None
            }
        }
    }

    /// Stop one language's server and clear its failed flag, then try to
    /// start it again. Returns whether a client is now running.
    pub fn restart_server(&self, language: &str) -> bool {
        {
            let Ok(mut pool) = self.pool.lock() else {
                return false;
            };
            if let Some(client) = pool.clients.remove(language) {
                if let Ok(mut client) = client.lock() {
                    let _ = client.shutdown();
                }
            }
            pool.failed.remove(language);
        }
        self.client(language).is_some()
    }

    /// Shut down every server. Idempotent and safe at process exit.
    pub fn shutdown_all(&self) {
        let Ok(mut pool) = self.pool.lock() else {
            return;
        };
        for (language, client) in pool.clients.drain() {
            info!(language = %language, "shutting down language server");
            if let Ok(mut client) = client.lock() {
                if let Err(e) = client.shutdown() {
                    warn!(language = %language, error = %e, "shutdown error");
                }
            }
        }
        pool.failed.clear();
    }

    /// Snapshot of pool state.
    pub fn status(&self) -> LspStatus {
        let (running, failed) = self
            .pool
            .lock()
            .map(|pool| {
                let running = pool
                    .clients
                    .iter()
                    .filter(|(_, c)| c.lock().map(|mut c| c.is_alive()).unwrap_or(false))
                    .map(|(lang, _)| lang.clone())
                    .collect();
                let failed = pool.failed.iter().cloned().collect();
                (running, failed)
            })
            .unwrap_or_default();

        let mut configured: Vec<String> = self.servers.keys().cloned().collect();
        configured.sort();

        LspStatus {
            root_path: self.root_path.display().to_string(),
            configured,
            running,
            failed,
        }
    }
}

impl Drop for LspManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
