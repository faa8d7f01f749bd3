//! Implementations of the `docchat ingest`, `status` and `ask` commands.
//!
//! Each command builds the config-backed services, runs one operation
//! synchronously and prints a short human-readable report.

use anyhow::{Context, Result};
use std::path::Path;

use docchat_core::models::StatusSnapshot;

use crate::app::DocChat;
use crate::config::Config;
use crate::extract::{MIME_DOCX, MIME_MARKDOWN, MIME_PDF, MIME_PPTX, MIME_TEXT};

/// Content type implied by a file extension, if any.
pub fn content_type_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "txt" | "text" => Some(MIME_TEXT),
        "md" | "markdown" => Some(MIME_MARKDOWN),
        "docx" => Some(MIME_DOCX),
        "pptx" => Some(MIME_PPTX),
        _ => None,
    }
}

fn print_status(snap: &StatusSnapshot) {
    println!("document:  {}", snap.document_id);
    println!("status:    {}", snap.status);
    println!("pages:     {}", snap.total_pages);
    println!("chunks:    {}", snap.chunk_count);
    println!("ready:     {}", snap.is_ready);
    if let Some(err) = &snap.error_message {
        println!("error:     {}", err);
    }
}

/// Upload `path` for `owner` and ingest it before returning.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    owner: &str,
    content_type: Option<&str>,
) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    // Unknown extensions fall through to content sniffing.
    let content_type = content_type
        .or_else(|| content_type_for_path(path))
        .unwrap_or("application/octet-stream");
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let app = DocChat::from_config(config).await?;
    let doc = app
        .pipeline
        .upload(owner, &name, content_type, &bytes)
        .await?;
    println!("Uploaded {} as {}", path.display(), doc.id);

    let snap = match app.pipeline.ingest(&doc.id, &bytes, owner).await {
        Ok(snap) => snap,
        Err(err) => {
            eprintln!("Ingestion failed: {}", err.user_message());
            app.tracker.get_status(&doc.id, owner).await?
        }
    };
    print_status(&snap);
    Ok(())
}

pub async fn run_status(config: &Config, document_id: &str, owner: &str) -> Result<()> {
    let app = DocChat::from_config(config).await?;
    let snap = app.tracker.get_status(document_id, owner).await?;
    print_status(&snap);
    Ok(())
}

pub async fn run_ask(
    config: &Config,
    chat_id: &str,
    message: &str,
    owner: &str,
    document_id: Option<&str>,
) -> Result<()> {
    let app = DocChat::from_config(config).await?;
    let answer = app
        .composer
        .answer(chat_id, owner, message, document_id)
        .await?;

    println!("{}", answer.text);
    if !answer.citations.is_empty() {
        println!();
        for (i, c) in answer.citations.iter().enumerate() {
            println!(
                "{}. [page {} · chunk {} · {:.2}] {}",
                i + 1,
                c.page,
                c.chunk_index,
                c.similarity,
                c.snippet
            );
        }
    }
    Ok(())
}
