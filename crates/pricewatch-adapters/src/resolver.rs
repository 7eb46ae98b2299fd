//! Support-tier resolution: specific adapter > generic whitelist > scored manual page > none,
//! with a product-page verdict gating the first two.

use std::fmt;

use pricewatch_core::SupportTier;
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::catalog::{normalize_host, AdapterKind, SiteCatalog, SpecificSite};

/// Which extraction strategy a classification points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionHint {
    Adapter(AdapterKind),
    Generic,
    Selector,
}

impl fmt::Display for ExtractionHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionHint::Adapter(kind) => write!(f, "{kind}"),
            ExtractionHint::Generic => f.write_str("generic"),
            ExtractionHint::Selector => f.write_str("selector"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierClassification {
    pub url: String,
    pub domain: Option<String>,
    pub tier: SupportTier,
    pub site_name: Option<String>,
    pub extraction_hint: Option<ExtractionHint>,
    pub product_page: bool,
    pub ecommerce_score: Option<EcommerceScore>,
}

impl TierClassification {
    fn none(url: &str, domain: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            domain,
            tier: SupportTier::None,
            site_name: None,
            extraction_hint: None,
            product_page: false,
            ecommerce_score: None,
        }
    }

    /// Whether this page should trigger a check. `specific`/`whitelist` tiers
    /// additionally need a product-page verdict.
    pub fn is_actionable(&self) -> bool {
        match self.tier {
            SupportTier::Specific | SupportTier::Whitelist => self.product_page,
            SupportTier::Manual => true,
            SupportTier::None => false,
        }
    }

    pub fn effective_tier(&self) -> SupportTier {
        if self.is_actionable() {
            self.tier
        } else {
            SupportTier::None
        }
    }
}

/// Breakdown of the manual-tier heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EcommerceScore {
    pub structured_data: u32,
    pub meta_tags: u32,
    pub dom_signals: u32,
    pub url_shape: u32,
    pub keywords: u32,
}

impl EcommerceScore {
    pub const STRUCTURED_DATA_POINTS: u32 = 50;
    pub const META_TAG_POINTS: u32 = 30;
    pub const DOM_SIGNAL_POINTS: u32 = 5;
    pub const DOM_SIGNAL_CAP: u32 = 25;
    pub const URL_SHAPE_POINTS: u32 = 15;
    pub const KEYWORD_POINTS: u32 = 10;
    pub const THRESHOLD: u32 = 50;

    pub fn total(&self) -> u32 {
        self.structured_data + self.meta_tags + self.dom_signals + self.url_shape + self.keywords
    }

    pub fn is_ecommerce(&self) -> bool {
        self.total() >= Self::THRESHOLD
    }
}

/// Path segments that mark utility/listing pages on any site.
const NON_PRODUCT_SEGMENTS: &[&str] = &[
    "cart",
    "basket",
    "bag",
    "checkout",
    "account",
    "my-account",
    "myaccount",
    "login",
    "signin",
    "sign-in",
    "register",
    "search",
    "s",
    "wishlist",
    "orders",
    "order-history",
    "help",
    "customer-service",
    "category",
    "categories",
    "browse",
    "deals",
];

const ECOMMERCE_KEYWORDS: &[&str] = &[
    "price",
    "cart",
    "buy",
    "shipping",
    "delivery",
    "stock",
    "checkout",
    "sale",
    "discount",
    "order",
    "returns",
    "warranty",
    "quantity",
];

const ADD_TO_CART_PHRASES: &[&str] = &["add to cart", "add to bag", "add to basket", "buy now"];

/// Built once at start-up and shared by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SiteResolver {
    catalog: SiteCatalog,
}

impl SiteResolver {
    pub fn new(catalog: SiteCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &SiteCatalog {
        &self.catalog
    }

    /// Classifies a URL without a document. Unknown domains can only reach
    /// `manual` through the allow-list here.
    pub fn classify(&self, url: &str) -> TierClassification {
        self.classify_page(url, None)
    }

    pub fn classify_page(&self, url: &str, html: Option<&str>) -> TierClassification {
        let Some(parsed) = parse_web_url(url) else {
            return TierClassification::none(url, None);
        };
        let Some(host) = parsed.host_str().map(normalize_host) else {
            return TierClassification::none(url, None);
        };
        let path = parsed.path().to_ascii_lowercase();

        if let Some(site) = self.catalog.specific_for_host(&host) {
            return TierClassification {
                url: url.to_string(),
                domain: Some(host),
                tier: SupportTier::Specific,
                site_name: Some(site.site_name.clone()),
                extraction_hint: Some(ExtractionHint::Adapter(site.adapter)),
                product_page: is_product_path(&path, Some(site)),
                ecommerce_score: None,
            };
        }

        if self.catalog.whitelist_match(&host).is_some() {
            return TierClassification {
                url: url.to_string(),
                site_name: Some(site_label(&host)),
                domain: Some(host),
                tier: SupportTier::Whitelist,
                extraction_hint: Some(ExtractionHint::Generic),
                product_page: is_product_path(&path, None),
                ecommerce_score: None,
            };
        }

        if self.catalog.is_blacklisted(&host) {
            return TierClassification::none(url, Some(host));
        }

        let product_like = is_product_path(&path, None);
        if self.catalog.is_ecommerce_allowlisted(&host) {
            return TierClassification {
                url: url.to_string(),
                site_name: Some(site_label(&host)),
                domain: Some(host),
                tier: SupportTier::Manual,
                extraction_hint: Some(ExtractionHint::Selector),
                product_page: product_like,
                ecommerce_score: None,
            };
        }

        let score = score_document(html, product_like);
        if score.is_ecommerce() {
            TierClassification {
                url: url.to_string(),
                site_name: Some(site_label(&host)),
                domain: Some(host),
                tier: SupportTier::Manual,
                extraction_hint: Some(ExtractionHint::Selector),
                product_page: product_like,
                ecommerce_score: Some(score),
            }
        } else {
            TierClassification {
                ecommerce_score: Some(score),
                ..TierClassification::none(url, Some(host))
            }
        }
    }
}

fn parse_web_url(url: &str) -> Option<Url> {
    let parsed = Url::parse(url.trim()).ok()?;
    match parsed.scheme() {
        "http" | "https" => Some(parsed),
        _ => None,
    }
}

/// Serialized http(s) URL with a lowercased host and no fragment. Tracked item
/// ids derive from this form.
pub fn canonical_url(url: &str) -> Option<String> {
    let mut parsed = parse_web_url(url)?;
    parsed.set_fragment(None);
    Some(parsed.into())
}

/// Normalized host of an http(s) URL, used as the rate-limit key.
pub fn domain_for_url(url: &str) -> Option<String> {
    parse_web_url(url)?.host_str().map(normalize_host)
}

fn site_label(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    match labels.len() {
        0 | 1 => host.to_string(),
        n if n >= 3 && labels[n - 2].len() <= 3 => labels[n - 3].to_string(),
        n => labels[n - 2].to_string(),
    }
}

/// Product-page verdict for a lowercased URL path.
///
/// Site markers win over generic utility markers; without either, the path
/// shape decides.
pub fn is_product_path(path: &str, site: Option<&SpecificSite>) -> bool {
    if let Some(site) = site {
        if site
            .product_path_markers
            .iter()
            .any(|marker| path.contains(&marker.to_ascii_lowercase()))
        {
            return true;
        }
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments
        .iter()
        .any(|segment| NON_PRODUCT_SEGMENTS.contains(segment))
    {
        return false;
    }

    path_shape_is_product_like(&segments)
}

fn path_shape_is_product_like(segments: &[&str]) -> bool {
    if segments.len() < 2 {
        return false;
    }
    let Some(last) = segments.last() else {
        return false;
    };
    let last = strip_page_extension(last);

    if longest_digit_run(last) >= 5 {
        return true;
    }

    let has_long_mixed_token = last
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| {
            token.len() >= 8
                && token.chars().any(|c| c.is_ascii_digit())
                && token.chars().any(|c| c.is_ascii_alphabetic())
        });
    if has_long_mixed_token {
        return true;
    }

    match last.rsplit_once('-') {
        Some((head, suffix)) => {
            !head.is_empty()
                && suffix.len() >= 2
                && suffix.chars().all(|c| c.is_ascii_alphanumeric())
                && suffix.chars().any(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

fn strip_page_extension(segment: &str) -> &str {
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            stem
        }
        _ => segment,
    }
}

fn longest_digit_run(text: &str) -> usize {
    let mut best = 0;
    let mut current = 0;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

/// Scores how much a document looks like a single-product shopping page.
pub fn score_document(html: Option<&str>, url_product_like: bool) -> EcommerceScore {
    let mut score = EcommerceScore {
        url_shape: if url_product_like {
            EcommerceScore::URL_SHAPE_POINTS
        } else {
            0
        },
        ..Default::default()
    };
    let Some(html) = html else {
        return score;
    };
    let document = Html::parse_document(html);

    if has_structured_product_data(&document) {
        score.structured_data = EcommerceScore::STRUCTURED_DATA_POINTS;
    }
    if has_product_meta_tags(&document) {
        score.meta_tags = EcommerceScore::META_TAG_POINTS;
    }
    score.dom_signals = (count_dom_signals(&document) * EcommerceScore::DOM_SIGNAL_POINTS)
        .min(EcommerceScore::DOM_SIGNAL_CAP);
    if keyword_density_is_high(&visible_text(&document)) {
        score.keywords = EcommerceScore::KEYWORD_POINTS;
    }
    score
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn count_matches(document: &Html, css: &str) -> usize {
    selector(css)
        .map(|sel| document.select(&sel).count())
        .unwrap_or(0)
}

pub(crate) fn json_ld_blocks(document: &Html) -> Vec<JsonValue> {
    let Some(sel) = selector(r#"script[type="application/ld+json"]"#) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|node| serde_json::from_str(&node.text().collect::<String>()).ok())
        .collect()
}

/// Walks plain objects, arrays and `@graph` containers looking for `@type: Product`.
pub(crate) fn find_json_ld_product(value: &JsonValue) -> Option<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().find_map(find_json_ld_product),
        JsonValue::Object(map) => {
            if json_ld_type_is(value, "Product") {
                return Some(value);
            }
            map.get("@graph").and_then(find_json_ld_product)
        }
        _ => None,
    }
}

pub(crate) fn json_ld_type_is(value: &JsonValue, wanted: &str) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(t)) => t == wanted,
        Some(JsonValue::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

fn has_structured_product_data(document: &Html) -> bool {
    json_ld_blocks(document)
        .iter()
        .any(|block| find_json_ld_product(block).is_some())
        || count_matches(document, r#"[itemtype*="schema.org/Product"]"#) > 0
}

fn has_product_meta_tags(document: &Html) -> bool {
    count_matches(document, r#"meta[property="og:type"][content="product"]"#) > 0
        || count_matches(document, r#"meta[property^="product:"]"#) > 0
        || count_matches(document, r#"meta[property^="og:price"]"#) > 0
        || count_matches(document, r#"meta[itemprop="price"]"#) > 0
}

fn count_dom_signals(document: &Html) -> u32 {
    let price_elements = count_matches(
        document,
        r#"[itemprop="price"], [class*="price"], [id*="price"]"#,
    );
    let cart_controls = count_matches(
        document,
        r#"[name="add-to-cart"], [id*="add-to-cart"], [class*="add-to-cart"]"#,
    ) + count_cart_buttons(document);
    let quantity_selectors = count_matches(
        document,
        r#"input[name*="quantity"], input[name="qty"], select[name*="quantity"], select[name="qty"]"#,
    );
    u32::try_from(price_elements + cart_controls + quantity_selectors).unwrap_or(u32::MAX)
}

fn count_cart_buttons(document: &Html) -> usize {
    let Some(sel) = selector(r#"button, input[type="submit"], a[role="button"]"#) else {
        return 0;
    };
    document
        .select(&sel)
        .filter(|node| {
            let label = node
                .value()
                .attr("value")
                .map(str::to_string)
                .unwrap_or_else(|| node.text().collect::<String>())
                .to_ascii_lowercase();
            ADD_TO_CART_PHRASES.iter().any(|phrase| label.contains(phrase))
        })
        .count()
}

/// Text nodes outside `script`/`style`/`noscript`.
pub(crate) fn visible_text(document: &Html) -> String {
    let mut out = String::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|el| el.name()))
            .is_some_and(|name| matches!(name, "script" | "style" | "noscript"));
        if !hidden {
            out.push_str(text);
            out.push(' ');
        }
    }
    out
}

fn keyword_density_is_high(text: &str) -> bool {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    if words.is_empty() {
        return false;
    }
    let hits = words
        .iter()
        .filter(|w| ECOMMERCE_KEYWORDS.contains(&w.as_str()))
        .count();
    hits >= 3 && (hits as f64 / words.len() as f64) >= 0.02
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SiteResolver {
        SiteResolver::new(SiteCatalog::default())
    }

    const PRODUCT_HTML: &str = r#"
<html><head>
<meta property="og:type" content="product">
<meta property="product:price:amount" content="19.99">
<script type="application/ld+json">{"@context":"https://schema.org","@type":"Product","name":"Mug","offers":{"@type":"Offer","price":"19.99","priceCurrency":"USD"}}</script>
</head><body>
<h1>Mug</h1>
<span class="price">$19.99</span>
<input name="quantity" value="1">
<button>Add to cart</button>
<p>Free shipping on every order. In stock. Buy now and check out our sale price.</p>
</body></html>"#;

    const BLOG_HTML: &str = r#"
<html><head><title>My trip</title></head>
<body><h1>What I did this summer</h1><p>We walked along the beach and read books.</p></body></html>"#;

    #[test]
    fn specific_beats_whitelist() {
        let mut catalog = SiteCatalog::default();
        catalog.whitelist.push("amazon.com".to_string());
        let resolver = SiteResolver::new(catalog);
        let c = resolver.classify("https://www.amazon.com/dp/B08N5WRWNW");
        assert_eq!(c.tier, SupportTier::Specific);
        assert_eq!(c.site_name.as_deref(), Some("amazon"));
        assert_eq!(c.extraction_hint, Some(ExtractionHint::Adapter(AdapterKind::Amazon)));
    }

    #[test]
    fn amazon_product_page_is_actionable_and_cart_is_not() {
        let product = resolver().classify("https://amazon.example/dp/ABC123");
        assert_eq!(product.tier, SupportTier::Specific);
        assert_eq!(product.site_name.as_deref(), Some("amazon"));
        assert!(product.is_actionable());

        let cart = resolver().classify("https://amazon.example/gp/cart");
        assert_eq!(cart.tier, SupportTier::Specific);
        assert!(!cart.is_actionable());
        assert_eq!(cart.effective_tier(), SupportTier::None);
    }

    #[test]
    fn specific_account_and_home_pages_are_gated() {
        for url in [
            "https://www.ebay.com/",
            "https://www.ebay.com/myaccount/summary",
            "https://www.walmart.com/search?q=tv",
            "https://www.walmart.com/checkout/review-order",
        ] {
            let c = resolver().classify(url);
            assert_eq!(c.tier, SupportTier::Specific, "{url}");
            assert!(!c.is_actionable(), "{url}");
        }
        assert!(resolver().classify("https://www.ebay.com/itm/1234").is_actionable());
    }

    #[test]
    fn strong_site_marker_overrides_generic_markers() {
        // "/gp/product/" wins even though the path also carries a utility segment.
        let c = resolver().classify("https://amazon.com/gp/product/help/B000123");
        assert!(c.product_page);
    }

    #[test]
    fn whitelist_uses_path_shape() {
        let product = resolver().classify("https://www.newegg.com/p/N82E16834725123");
        assert_eq!(product.tier, SupportTier::Whitelist);
        assert_eq!(product.extraction_hint, Some(ExtractionHint::Generic));
        assert!(product.is_actionable());

        let category = resolver().classify("https://www.costco.com/category/televisions");
        assert_eq!(category.tier, SupportTier::Whitelist);
        assert!(!category.is_actionable());

        let home = resolver().classify("https://www.costco.com/");
        assert!(!home.is_actionable());
    }

    #[test]
    fn path_shape_heuristic_variants() {
        assert!(is_product_path("/shop/widget-5551234", None));
        assert!(is_product_path("/p/ab12cd34ef", None));
        assert!(is_product_path("/mens/blue-shirt-x12", None));
        assert!(is_product_path("/site/thing/6512345.p", None));
        assert!(!is_product_path("/widget-5551234", None));
        assert!(!is_product_path("/mens/shirts", None));
        assert!(!is_product_path("/mens/blue-shirt", None));
        assert!(!is_product_path("/", None));
    }

    #[test]
    fn malformed_and_non_web_urls_resolve_to_none() {
        for url in ["not a url", "ftp://amazon.com/dp/X", "mailto:a@b.c", ""] {
            let c = resolver().classify(url);
            assert_eq!(c.tier, SupportTier::None, "{url}");
            assert!(!c.is_actionable());
        }
    }

    #[test]
    fn blacklisted_domain_short_circuits_before_scoring() {
        let c = resolver().classify_page("https://www.youtube.com/watch/abc-12345", Some(PRODUCT_HTML));
        assert_eq!(c.tier, SupportTier::None);
        assert!(c.ecommerce_score.is_none());
    }

    #[test]
    fn allowlisted_domain_is_manual_without_document() {
        let c = resolver().classify("https://cool-mugs.myshopify.com/products/mug");
        assert_eq!(c.tier, SupportTier::Manual);
        assert_eq!(c.extraction_hint, Some(ExtractionHint::Selector));
        assert!(c.is_actionable());
    }

    #[test]
    fn unknown_domain_needs_a_product_document() {
        let url = "https://tiny-shop.example/products/mug-00042";
        let bare = resolver().classify(url);
        assert_eq!(bare.tier, SupportTier::None);
        assert_eq!(bare.ecommerce_score.map(|s| s.total()), Some(15));

        let scored = resolver().classify_page(url, Some(PRODUCT_HTML));
        assert_eq!(scored.tier, SupportTier::Manual);
        let score = scored.ecommerce_score.unwrap();
        assert_eq!(score.structured_data, 50);
        assert_eq!(score.meta_tags, 30);
        assert_eq!(score.dom_signals, 15);
        assert_eq!(score.url_shape, 15);
        assert_eq!(score.keywords, 10);

        let blog = resolver().classify_page("https://blog.example/2024/trip", Some(BLOG_HTML));
        assert_eq!(blog.tier, SupportTier::None);
        assert_eq!(blog.ecommerce_score.map(|s| s.total()), Some(0));
    }

    #[test]
    fn dom_signals_are_capped() {
        let many_prices: String = (0..20)
            .map(|i| format!("<span class=\"price\">${i}.00</span>"))
            .collect();
        let html = format!("<html><body>{many_prices}</body></html>");
        let score = score_document(Some(&html), false);
        assert_eq!(score.dom_signals, EcommerceScore::DOM_SIGNAL_CAP);
        assert!(!score.is_ecommerce());
    }

    #[test]
    fn domain_key_is_normalized_host() {
        assert_eq!(
            domain_for_url("https://WWW.Shop.Example/p/1").as_deref(),
            Some("shop.example")
        );
        assert_eq!(domain_for_url("garbage"), None);
    }

    #[test]
    fn canonical_url_drops_fragment_and_host_case() {
        let canonical = "https://www.newegg.com/p/N82E16824012345";
        for variant in [
            canonical,
            "https://WWW.NEWEGG.COM/p/N82E16824012345",
            "https://www.newegg.com/p/N82E16824012345#reviews",
            " https://www.newegg.com:443/p/N82E16824012345 ",
        ] {
            assert_eq!(canonical_url(variant).as_deref(), Some(canonical));
        }
        assert_eq!(canonical_url("ftp://files.example/p/1"), None);
    }
}
