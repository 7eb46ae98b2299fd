//! Site support resolution, extraction dispatch, and page extraction for pricewatch.

use std::sync::Arc;

use async_trait::async_trait;
use pricewatch_core::{ExtractedProduct, SupportTier};
use pricewatch_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::debug;

pub mod catalog;
pub mod extract;
pub mod registry;
pub mod resolver;

pub use catalog::{domain_matches, normalize_host, AdapterKind, SiteCatalog, SpecificSite};
pub use extract::{
    parse_price, ExtractionCapability, GenericCapability, ManualCapability, PageInput, SiteAdapter,
};
pub use registry::{ExtractionRegistry, RegistryError, ResolvedCapability};
pub use resolver::{
    canonical_url, domain_for_url, is_product_path, score_document, EcommerceScore,
    ExtractionHint, SiteResolver, TierClassification,
};

pub const CRATE_NAME: &str = "pricewatch-adapters";

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("no price found on {url}")]
    NoPrice { url: String },
    #[error("no extraction capability for tier {tier}")]
    Unsupported { tier: SupportTier },
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
}

/// What the sweep asks the extraction collaborator for.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub url: &'a str,
    pub domain: &'a str,
    pub tier: SupportTier,
    pub hint: Option<ExtractionHint>,
    /// Already-fetched document; fetched on demand when absent.
    pub html: Option<&'a str>,
    pub selector_hint: Option<&'a str>,
}

/// Seam between the orchestrator and page fetching + extraction.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn fetch_document(&self, url: &str, domain: &str) -> Result<String, ExtractionError>;

    async fn extract(&self, request: &ExtractionRequest<'_>) -> Result<ExtractedProduct, ExtractionError>;
}

/// Fetches over HTTP and dispatches parsing through the registry.
pub struct HttpExtractor {
    fetcher: HttpFetcher,
    registry: Arc<ExtractionRegistry>,
}

impl HttpExtractor {
    pub fn new(fetcher: HttpFetcher, registry: Arc<ExtractionRegistry>) -> Self {
        Self { fetcher, registry }
    }
}

#[async_trait]
impl PageExtractor for HttpExtractor {
    async fn fetch_document(&self, url: &str, domain: &str) -> Result<String, ExtractionError> {
        Ok(self.fetcher.fetch_page(domain, url).await?.body)
    }

    async fn extract(&self, request: &ExtractionRequest<'_>) -> Result<ExtractedProduct, ExtractionError> {
        let resolved = self.registry.resolve(request.tier, request.hint);
        let Some(capability) = resolved.capability() else {
            return Err(ExtractionError::Unsupported { tier: request.tier });
        };

        let fetched;
        let html = match request.html {
            Some(html) => html,
            None => {
                fetched = self.fetch_document(request.url, request.domain).await?;
                fetched.as_str()
            }
        };

        debug!(url = request.url, capability = capability.name(), "extracting");
        capability.extract(&PageInput {
            url: request.url,
            html,
            selector_hint: request.selector_hint,
        })
    }
}
