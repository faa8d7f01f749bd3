//! Deterministic fakes and setup shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use docchat::app::{Backends, DocChat};
use docchat::config::{parse_config, Config};
use docchat::extract::{ExtractError, TextExtractor};
use docchat::llm::LanguageModel;
use docchat::objects::MemoryObjectStore;
use docchat_core::embedding::{Embedder, ProviderError};
use docchat_core::models::{DocumentStatus, StatusSnapshot};
use docchat_core::prompt::PromptMessage;
use docchat_core::store::memory::InMemoryStore;

pub const OWNER: &str = "alice";

pub const KEYWORDS: [&str; 4] = ["warranty", "battery", "screen", "price"];

pub fn config_toml(root: &str, port: u16) -> String {
    format!(
        r#"[db]
path = "{root}/data/docchat.sqlite"

[storage]
root = "{root}/objects"

[chunking]
max_tokens = 20
overlap_tokens = 4

[embedding]
batch_size = 2
workers = 2
max_retries = 3
timeout_secs = 5

[llm]
max_retries = 1
timeout_secs = 5

[retrieval]
top_k = 3
similarity_threshold = 0.5

[cache]
max_chats = 16
max_turns = 4

[ingest]
extract_timeout_secs = 10
retry_backoff_ms = 1

[server]
bind = "127.0.0.1:{port}"
"#
    )
}

pub fn test_config() -> Config {
    parse_config(&config_toml("/tmp/docchat-unused", 0)).unwrap()
}

/// Counts keyword occurrences, so texts about the same topic score 1.0.
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        KEYWORDS
            .iter()
            .map(|k| lower.matches(k).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Fails the first `transient_failures` calls with a transient error, then
/// behaves like [`KeywordEmbedder`]. `permanent` makes every call fail.
pub struct FlakyEmbedder {
    pub transient_failures: usize,
    pub permanent: AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyEmbedder {
    pub fn transient(failures: usize) -> Self {
        Self {
            transient_failures: failures,
            permanent: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn broken() -> Self {
        Self {
            transient_failures: 0,
            permanent: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn model_name(&self) -> &str {
        "flaky"
    }

    fn dims(&self) -> usize {
        KEYWORDS.len()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent.load(Ordering::SeqCst) {
            return Err(ProviderError::Permanent("401 unauthorized".into()));
        }
        if call < self.transient_failures {
            return Err(ProviderError::Transient("429 rate limited".into()));
        }
        Ok(texts.iter().map(|t| KeywordEmbedder::vector(t)).collect())
    }
}

/// Replies with a fixed answer, or fails while `failing` is set.
pub struct ScriptedLlm {
    pub reply: Mutex<String>,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(reply.to_string()),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _messages: &[PromptMessage]) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("503 service unavailable".into()));
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

/// Returns a scripted page list per run: run `n` gets `runs[min(n, last)]`.
pub struct ScriptedExtractor {
    runs: Vec<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(runs: Vec<Vec<&str>>) -> Self {
        Self {
            runs: runs
                .into_iter()
                .map(|pages| pages.into_iter().map(str::to_string).collect())
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TextExtractor for ScriptedExtractor {
    fn extract_pages(&self, _bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.runs[n.min(self.runs.len() - 1)].clone())
    }
}

/// Blocks every extraction until the test opens the gate once per run.
pub struct GatedExtractor {
    gate: Mutex<mpsc::Receiver<()>>,
    pages: Vec<String>,
}

impl GatedExtractor {
    pub fn new(pages: Vec<&str>) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let extractor = Self {
            gate: Mutex::new(rx),
            pages: pages.into_iter().map(str::to_string).collect(),
        };
        (extractor, tx)
    }
}

impl TextExtractor for GatedExtractor {
    fn extract_pages(&self, _bytes: &[u8], _content_type: &str) -> Result<Vec<String>, ExtractError> {
        self.gate
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| ExtractError::Pdf("gate never opened".into()))?;
        Ok(self.pages.clone())
    }
}

pub fn three_pages() -> Vec<&'static str> {
    vec![
        "Warranty terms. The warranty covers manufacturing defects for two years from purchase.",
        "Battery care. Charge the battery fully before first use and avoid extreme heat.",
        "Screen cleaning. Wipe the screen with a dry microfiber cloth.",
    ]
}

/// An in-memory `DocChat` plus a handle on its store for direct inspection.
pub fn build(
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    extractor: Arc<dyn TextExtractor>,
) -> (DocChat, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let backends = Backends {
        documents: store.clone(),
        index: store.clone(),
        messages: store.clone(),
        objects: Arc::new(MemoryObjectStore::new()),
        extractor,
        embedder,
        llm,
    };
    let app = DocChat::new(&test_config(), backends).unwrap();
    (app, store)
}

/// Poll the tracker until `document_id` reaches `want`, or panic.
pub async fn wait_for_status(app: &DocChat, document_id: &str, want: DocumentStatus) -> StatusSnapshot {
    for _ in 0..100 {
        let snap = app.tracker.get_status(document_id, OWNER).await.unwrap();
        if snap.status == want {
            return snap;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("document {} never reached {}", document_id, want);
}

pub fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn wait_for_server(port: u16) {
    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/health", port);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return;
            }
        }
    }
    panic!("Server did not become ready within 5 seconds");
}
