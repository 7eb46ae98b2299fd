//! Tier → capability dispatch. Built once, validated against the site catalog.

use std::collections::BTreeMap;

use pricewatch_core::SupportTier;
use thiserror::Error;

use crate::catalog::{AdapterKind, SiteCatalog};
use crate::extract::{ExtractionCapability, GenericCapability, ManualCapability, SiteAdapter};
use crate::resolver::ExtractionHint;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("site {site} requires adapter {adapter}, which is not registered")]
    MissingAdapter { site: String, adapter: AdapterKind },
}

#[derive(Debug, Clone, Copy)]
pub enum ResolvedCapability<'a> {
    Specific(&'a SiteAdapter),
    Generic(&'a GenericCapability),
    Manual(&'a ManualCapability),
    Unsupported,
}

impl<'a> ResolvedCapability<'a> {
    pub fn capability(&self) -> Option<&'a dyn ExtractionCapability> {
        match *self {
            ResolvedCapability::Specific(adapter) => Some(adapter),
            ResolvedCapability::Generic(generic) => Some(generic),
            ResolvedCapability::Manual(manual) => Some(manual),
            ResolvedCapability::Unsupported => None,
        }
    }

    pub fn name(&self) -> &'a str {
        self.capability().map_or("unsupported", |c| c.name())
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionRegistry {
    adapters: BTreeMap<AdapterKind, SiteAdapter>,
    generic: GenericCapability,
    manual: ManualCapability,
}

impl ExtractionRegistry {
    /// Fails if any specific site in `catalog` has no adapter among `adapters`.
    pub fn new(
        catalog: &SiteCatalog,
        adapters: impl IntoIterator<Item = SiteAdapter>,
    ) -> Result<Self, RegistryError> {
        let adapters: BTreeMap<AdapterKind, SiteAdapter> = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();

        if let Some(site) = catalog
            .specific
            .iter()
            .find(|site| !adapters.contains_key(&site.adapter))
        {
            return Err(RegistryError::MissingAdapter {
                site: site.site_name.clone(),
                adapter: site.adapter,
            });
        }

        Ok(Self {
            adapters,
            generic: GenericCapability,
            manual: ManualCapability,
        })
    }

    pub fn with_builtin_adapters(catalog: &SiteCatalog) -> Result<Self, RegistryError> {
        Self::new(catalog, AdapterKind::ALL.map(SiteAdapter::for_kind))
    }

    /// Pure lookup: identical inputs always give the same capability.
    pub fn resolve(&self, tier: SupportTier, hint: Option<ExtractionHint>) -> ResolvedCapability<'_> {
        match (tier, hint) {
            (SupportTier::Specific, Some(ExtractionHint::Adapter(kind))) => self
                .adapters
                .get(&kind)
                .map_or(ResolvedCapability::Unsupported, ResolvedCapability::Specific),
            (SupportTier::Specific, _) => ResolvedCapability::Unsupported,
            (SupportTier::Whitelist, _) => ResolvedCapability::Generic(&self.generic),
            (SupportTier::Manual, _) => ResolvedCapability::Manual(&self.manual),
            (SupportTier::None, _) => ResolvedCapability::Unsupported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_each_tier_to_one_capability() {
        let registry = ExtractionRegistry::with_builtin_adapters(&SiteCatalog::default()).unwrap();
        let amazon = registry.resolve(
            SupportTier::Specific,
            Some(ExtractionHint::Adapter(AdapterKind::Amazon)),
        );
        assert_eq!(amazon.name(), "amazon");
        assert_eq!(
            registry.resolve(SupportTier::Whitelist, Some(ExtractionHint::Generic)).name(),
            "generic"
        );
        assert_eq!(registry.resolve(SupportTier::Manual, None).name(), "manual");
        assert!(registry.resolve(SupportTier::None, None).capability().is_none());
        assert!(registry
            .resolve(SupportTier::Specific, Some(ExtractionHint::Generic))
            .capability()
            .is_none());
    }

    #[test]
    fn resolution_is_deterministic() {
        let registry = ExtractionRegistry::with_builtin_adapters(&SiteCatalog::default()).unwrap();
        let hint = Some(ExtractionHint::Adapter(AdapterKind::Etsy));
        let first = registry.resolve(SupportTier::Specific, hint).name();
        for _ in 0..10 {
            assert_eq!(registry.resolve(SupportTier::Specific, hint).name(), first);
        }
    }

    #[test]
    fn missing_adapter_fails_at_construction() {
        let err = ExtractionRegistry::new(
            &SiteCatalog::default(),
            [SiteAdapter::for_kind(AdapterKind::Amazon)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingAdapter {
                site: "ebay".to_string(),
                adapter: AdapterKind::Ebay,
            }
        );
    }
}
