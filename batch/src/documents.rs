//! Power of attorney documents: an HTML template filled per owner and
//! printed to PDF by a headless browser.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const NAME_TOKEN: &str = "{applicant_name}";
pub const ADDRESS_TOKEN: &str = "{applicant_address}";

// A4 in inches.
const PAPER_WIDTH: f64 = 8.27;
const PAPER_HEIGHT: f64 = 11.69;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("could not read template {path}: {source}")]
    Template {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("browser error: {0}")]
    Browser(String),
    #[error("render task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Escapes the characters that would otherwise open markup.
pub fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Clone, Debug)]
pub struct Template {
    html: String,
}

impl Template {
    pub fn new(html: impl Into<String>) -> Self {
        Template { html: html.into() }
    }

    pub async fn load(path: &Path) -> Result<Self, RenderError> {
        let html = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| RenderError::Template {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Template { html })
    }

    /// Replaces every name and address token with the escaped values.
    pub fn fill(&self, name: &str, address: &str) -> String {
        self.html
            .replace(NAME_TOKEN, &escape_html(name))
            .replace(ADDRESS_TOKEN, &escape_html(address))
    }
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    /// One PDF per HTML document, in input order.
    async fn render_many(&self, documents: Vec<String>) -> Result<Vec<Vec<u8>>, RenderError>;
}

/// Prints documents with a single Chrome session per call.
pub struct ChromeRenderer {
    browser_path: Option<PathBuf>,
}

impl ChromeRenderer {
    pub fn new(browser_path: Option<PathBuf>) -> Self {
        ChromeRenderer { browser_path }
    }
}

fn browser_error(e: impl std::fmt::Display) -> RenderError {
    RenderError::Browser(e.to_string())
}

fn pdf_options() -> PrintToPdfOptions {
    PrintToPdfOptions {
        print_background: Some(true),
        paper_width: Some(PAPER_WIDTH),
        paper_height: Some(PAPER_HEIGHT),
        ..Default::default()
    }
}

fn render_blocking(
    browser_path: Option<PathBuf>,
    documents: Vec<String>,
) -> Result<Vec<Vec<u8>>, RenderError> {
    let options = LaunchOptions::default_builder()
        .headless(true)
        .path(browser_path)
        .build()
        .map_err(browser_error)?;
    let browser = Browser::new(options).map_err(browser_error)?;
    let tab = browser.new_tab().map_err(browser_error)?;

    let mut pdfs = Vec::with_capacity(documents.len());
    for html in &documents {
        let url = format!("data:text/html;base64,{}", BASE64.encode(html));
        tab.navigate_to(&url)
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(browser_error)?;
        let pdf = tab
            .print_to_pdf(Some(pdf_options()))
            .map_err(browser_error)?;
        pdfs.push(pdf);
    }

    tracing::debug!(documents = pdfs.len(), "rendered documents");
    Ok(pdfs)
}

#[async_trait]
impl DocumentRenderer for ChromeRenderer {
    async fn render_many(&self, documents: Vec<String>) -> Result<Vec<Vec<u8>>, RenderError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let browser_path = self.browser_path.clone();
        tokio::task::spawn_blocking(move || render_blocking(browser_path, documents)).await?
    }
}
