//! Interfaces to the page itself.
//!
//! Rasterization, DOM extraction, and page actions live outside this crate;
//! the executor and the HMR capturer only see these traits.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use devbridge_core::commands::{ImageFormat, ScreenshotRequest};
use serde_json::Value;

use crate::error::BrowserError;

/// What to rasterize.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    /// The whole document.
    Document,
    /// First element matching a CSS selector.
    Element(String),
}

/// Rasterization options.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureOptions {
    /// Device pixel scale.
    pub scale: f64,
    /// Output encoding.
    pub format: ImageFormat,
    /// Lossy quality 0..=1.
    pub quality: Option<f64>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            format: ImageFormat::Png,
            quality: None,
        }
    }
}

impl CaptureOptions {
    /// Split a screenshot request into target and options.
    pub fn from_request(request: &ScreenshotRequest) -> (CaptureTarget, Self) {
        let target = request
            .selector
            .clone()
            .map_or(CaptureTarget::Document, CaptureTarget::Element);
        let options = Self {
            scale: request.scale.unwrap_or(1.0),
            format: request.format.unwrap_or_default(),
            quality: request.quality,
        };
        (target, options)
    }
}

/// An encoded image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Encoding of `bytes`.
    pub format: ImageFormat,
    /// Encoded image bytes.
    pub bytes: Vec<u8>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Image {
    /// `data:<mime>;base64,<bytes>`
    pub fn data_url(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime(),
            STANDARD.encode(&self.bytes)
        )
    }
}

/// Produces images of the page.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Rasterize `target`.
    async fn capture(
        &self,
        target: &CaptureTarget,
        options: &CaptureOptions,
    ) -> Result<Image, BrowserError>;
}

/// Reads structure out of the live DOM.
pub trait DomExtractor: Send + Sync {
    /// Heading and landmark outline.
    fn outline(&self) -> Result<Value, BrowserError>;
    /// Structured data (JSON-LD, microdata).
    fn schema(&self) -> Result<Value, BrowserError>;
    /// Accessibility audit.
    fn a11y(&self) -> Result<Value, BrowserError>;
    /// Elements matching `selector`; only the first unless `all`.
    fn query(&self, selector: &str, all: bool) -> Result<Value, BrowserError>;
}

/// Acts on the page.
#[async_trait]
pub trait PageController: Send + Sync {
    /// Click the first element matching `selector`.
    async fn click(&self, selector: &str) -> Result<Value, BrowserError>;
    /// Reload the page, bypassing caches when `hard`.
    async fn refresh(&self, hard: bool) -> Result<(), BrowserError>;
    /// Recent network activity, newest last.
    fn network_log(&self, limit: Option<usize>) -> Result<Value, BrowserError>;
}

/// Evaluates scripts in the page.
#[async_trait]
pub trait ScriptEvaluator: Send + Sync {
    /// Evaluate `code` and return its JSON-serializable result.
    async fn eval(&self, code: &str) -> Result<Value, BrowserError>;
}

/// Bundle of page collaborators.
#[derive(Clone)]
pub struct Collaborators {
    /// Image capture.
    pub renderer: Arc<dyn Renderer>,
    /// DOM reads.
    pub dom: Arc<dyn DomExtractor>,
    /// Page actions.
    pub page: Arc<dyn PageController>,
    /// Script evaluation.
    pub script: Arc<dyn ScriptEvaluator>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
