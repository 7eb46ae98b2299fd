//! Static site metadata: specific adapters, generic whitelist, and the manual-tier
//! block/allow lists.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Closed set of site adapters. A catalog entry naming anything else fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Amazon,
    Ebay,
    Walmart,
    BestBuy,
    Target,
    Etsy,
    AliExpress,
}

impl AdapterKind {
    pub const ALL: [AdapterKind; 7] = [
        AdapterKind::Amazon,
        AdapterKind::Ebay,
        AdapterKind::Walmart,
        AdapterKind::BestBuy,
        AdapterKind::Target,
        AdapterKind::Etsy,
        AdapterKind::AliExpress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Amazon => "amazon",
            AdapterKind::Ebay => "ebay",
            AdapterKind::Walmart => "walmart",
            AdapterKind::BestBuy => "best_buy",
            AdapterKind::Target => "target",
            AdapterKind::Etsy => "etsy",
            AdapterKind::AliExpress => "ali_express",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        AdapterKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown site adapter: {s}"))
    }
}

/// A site served by a dedicated adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificSite {
    pub site_name: String,
    pub adapter: AdapterKind,
    /// Domain patterns; `brand.*` matches the brand under any suffix.
    pub domains: Vec<String>,
    /// Path fragments that mark an individual product page on this site.
    #[serde(default)]
    pub product_path_markers: Vec<String>,
}

impl SpecificSite {
    fn new(site_name: &str, adapter: AdapterKind, domains: &[&str], markers: &[&str]) -> Self {
        Self {
            site_name: site_name.to_string(),
            adapter,
            domains: domains.iter().map(|d| d.to_string()).collect(),
            product_path_markers: markers.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn matches_host(&self, host: &str) -> bool {
        self.domains.iter().any(|pattern| domain_matches(host, pattern))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteCatalog {
    pub specific: Vec<SpecificSite>,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub ecommerce_allowlist: Vec<String>,
}

/// On-disk catalog extension; every section is optional and appended to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
struct SiteCatalogFile {
    #[serde(default)]
    specific: Vec<SpecificSite>,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    blacklist: Vec<String>,
    #[serde(default)]
    ecommerce_allowlist: Vec<String>,
}

const DEFAULT_WHITELIST: &[&str] = &[
    "newegg.*",
    "costco.com",
    "homedepot.com",
    "lowes.com",
    "macys.com",
    "nordstrom.com",
    "kohls.com",
    "wayfair.com",
    "ikea.com",
    "zalando.*",
    "argos.co.uk",
    "currys.co.uk",
    "johnlewis.com",
    "otto.de",
    "bol.com",
    "rakuten.*",
    "mercadolibre.*",
    "flipkart.com",
    "bhphotovideo.com",
    "sephora.com",
    "asos.com",
    "chewy.com",
    "samsclub.com",
    "staples.com",
    "gamestop.com",
    "microcenter.com",
];

const DEFAULT_BLACKLIST: &[&str] = &[
    "google.*",
    "bing.com",
    "duckduckgo.com",
    "yahoo.com",
    "baidu.com",
    "yandex.*",
    "facebook.com",
    "instagram.com",
    "twitter.com",
    "x.com",
    "tiktok.com",
    "linkedin.com",
    "reddit.com",
    "pinterest.com",
    "youtube.com",
    "vimeo.com",
    "twitch.tv",
    "netflix.com",
    "github.com",
    "gitlab.com",
    "bitbucket.org",
    "stackoverflow.com",
    "npmjs.com",
    "crates.io",
    "docs.rs",
    "wikipedia.org",
];

const DEFAULT_ECOMMERCE_ALLOWLIST: &[&str] = &[
    "myshopify.com",
    "bigcartel.com",
    "storenvy.com",
    "gumroad.com",
    "square.site",
];

impl Default for SiteCatalog {
    fn default() -> Self {
        Self {
            specific: vec![
                SpecificSite::new(
                    "amazon",
                    AdapterKind::Amazon,
                    &["amazon.*", "amzn.*"],
                    &["/dp/", "/gp/product/", "/gp/aw/d/"],
                ),
                SpecificSite::new("ebay", AdapterKind::Ebay, &["ebay.*"], &["/itm/"]),
                SpecificSite::new(
                    "walmart",
                    AdapterKind::Walmart,
                    &["walmart.com", "walmart.ca"],
                    &["/ip/"],
                ),
                SpecificSite::new(
                    "bestbuy",
                    AdapterKind::BestBuy,
                    &["bestbuy.com", "bestbuy.ca"],
                    &["/product/"],
                ),
                SpecificSite::new("target", AdapterKind::Target, &["target.com"], &["/-/a-"]),
                SpecificSite::new("etsy", AdapterKind::Etsy, &["etsy.com"], &["/listing/"]),
                SpecificSite::new(
                    "aliexpress",
                    AdapterKind::AliExpress,
                    &["aliexpress.*"],
                    &["/item/"],
                ),
            ],
            whitelist: to_strings(DEFAULT_WHITELIST),
            blacklist: to_strings(DEFAULT_BLACKLIST),
            ecommerce_allowlist: to_strings(DEFAULT_ECOMMERCE_ALLOWLIST),
        }
    }
}

impl SiteCatalog {
    /// Built-in catalog extended with the sections of a YAML document.
    pub fn with_yaml_extension(yaml: &str) -> Result<Self> {
        let file: SiteCatalogFile = serde_yaml::from_str(yaml).context("parsing site catalog")?;
        let mut catalog = Self::default();
        catalog.specific.extend(file.specific);
        catalog.whitelist.extend(file.whitelist);
        catalog.blacklist.extend(file.blacklist);
        catalog.ecommerce_allowlist.extend(file.ecommerce_allowlist);
        Ok(catalog)
    }

    pub fn load_with_extension(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading site catalog {}", path.display()))?;
        Self::with_yaml_extension(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// First specific site whose domain patterns match `host`, in catalog order.
    pub fn specific_for_host(&self, host: &str) -> Option<&SpecificSite> {
        self.specific.iter().find(|site| site.matches_host(host))
    }

    pub fn whitelist_match(&self, host: &str) -> Option<&str> {
        first_match(&self.whitelist, host)
    }

    pub fn is_blacklisted(&self, host: &str) -> bool {
        first_match(&self.blacklist, host).is_some()
    }

    pub fn is_ecommerce_allowlisted(&self, host: &str) -> bool {
        first_match(&self.ecommerce_allowlist, host).is_some()
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn first_match<'a>(patterns: &'a [String], host: &str) -> Option<&'a str> {
    patterns
        .iter()
        .find(|pattern| domain_matches(host, pattern))
        .map(String::as_str)
}

/// Lowercases and strips a leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => host,
    }
}

/// `pattern` is either an exact domain (also matching its subdomains) or
/// `brand.*`, matching `brand.<any suffix>` and `<sub>.brand.<any suffix>`.
pub fn domain_matches(host: &str, pattern: &str) -> bool {
    let host = normalize_host(host);
    let pattern = pattern.trim().to_ascii_lowercase();
    if let Some(brand) = pattern.strip_suffix(".*") {
        let prefix = format!("{brand}.");
        let infix = format!(".{brand}.");
        return (host.starts_with(&prefix) && host.len() > prefix.len()) || host.contains(&infix);
    }
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_suffix_matches_any_tld_and_subdomain() {
        assert!(domain_matches("www.amazon.com", "amazon.*"));
        assert!(domain_matches("amazon.co.uk", "amazon.*"));
        assert!(domain_matches("smile.amazon.de", "amazon.*"));
        assert!(domain_matches("amazon.example", "amazon.*"));
        assert!(!domain_matches("notamazon.com", "amazon.*"));
        assert!(!domain_matches("amazon", "amazon.*"));
    }

    #[test]
    fn exact_patterns_match_subdomains_only() {
        assert!(domain_matches("shop.costco.com", "costco.com"));
        assert!(domain_matches("COSTCO.com", "costco.com"));
        assert!(!domain_matches("mycostco.com", "costco.com"));
    }

    #[test]
    fn yaml_extension_appends_to_defaults() {
        let yaml = r#"
specific:
  - site_name: shopzilla
    adapter: ebay
    domains: ["shopzilla.example"]
    product_path_markers: ["/item/"]
whitelist: ["shop.example"]
"#;
        let catalog = SiteCatalog::with_yaml_extension(yaml).unwrap();
        assert!(catalog.specific_for_host("shopzilla.example").is_some());
        assert!(catalog.whitelist_match("shop.example").is_some());
        assert!(catalog.specific_for_host("amazon.com").is_some());
    }

    #[test]
    fn unknown_adapter_in_yaml_is_a_startup_error() {
        let yaml = r#"
specific:
  - site_name: mystery
    adapter: mystery_mart
    domains: ["mystery.example"]
"#;
        assert!(SiteCatalog::with_yaml_extension(yaml).is_err());
        assert!("mystery_mart".parse::<AdapterKind>().is_err());
        assert_eq!("best_buy".parse::<AdapterKind>().unwrap(), AdapterKind::BestBuy);
    }
}
