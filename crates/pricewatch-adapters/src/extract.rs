//! Extraction capabilities: per-site adapters, the generic structured-data cascade,
//! and the selector-driven manual capability.

use pricewatch_core::ExtractedProduct;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::catalog::AdapterKind;
use crate::resolver::{find_json_ld_product, json_ld_blocks, json_ld_type_is};
use crate::ExtractionError;

/// Page handed to a capability. The HTML is already fetched.
#[derive(Debug, Clone, Copy)]
pub struct PageInput<'a> {
    pub url: &'a str,
    pub html: &'a str,
    pub selector_hint: Option<&'a str>,
}

pub trait ExtractionCapability: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, page: &PageInput<'_>) -> Result<ExtractedProduct, ExtractionError>;
}

/// Partial product data produced by one extraction method.
#[derive(Debug, Clone, Default, PartialEq)]
struct Candidate {
    title: Option<String>,
    price: Option<f64>,
    currency: Option<String>,
    image_url: Option<String>,
    available: Option<bool>,
}

impl Candidate {
    fn fill_missing_from(&mut self, other: &Candidate) {
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.currency.is_none() {
            self.currency = other.currency.clone();
        }
        if self.image_url.is_none() {
            self.image_url = other.image_url.clone();
        }
        if self.available.is_none() {
            self.available = other.available;
        }
    }
}

enum Attempt {
    Found(Candidate),
    NotFound(Candidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Selectors(&'static SiteSelectors),
    JsonLd,
    Microdata,
    MetaTags,
}

impl Method {
    fn attempt(&self, document: &Html) -> Attempt {
        let candidate = match self {
            Method::Selectors(selectors) => from_site_selectors(document, selectors),
            Method::JsonLd => from_json_ld(document),
            Method::Microdata => from_microdata(document),
            Method::MetaTags => from_meta_tags(document),
        };
        if candidate.price.is_some() {
            Attempt::Found(candidate)
        } else {
            Attempt::NotFound(candidate)
        }
    }
}

const GENERIC_CASCADE: &[Method] = &[Method::JsonLd, Method::Microdata, Method::MetaTags];

/// Runs `methods` in order and stops at the first one that yields a price.
/// Fields the winner lacks are back-filled from the partial results seen so far
/// and from the page's `<title>`/`og:image`.
fn run_cascade(url: &str, document: &Html, methods: &[Method]) -> Result<ExtractedProduct, ExtractionError> {
    let mut partial = Candidate::default();
    for method in methods {
        match method.attempt(document) {
            Attempt::Found(mut found) => {
                found.fill_missing_from(&partial);
                found.fill_missing_from(&page_fallbacks(document));
                return Ok(finish(found));
            }
            Attempt::NotFound(seen) => partial.fill_missing_from(&seen),
        }
    }

    if partial.available == Some(false) {
        let mut product = ExtractedProduct::unavailable("out of stock");
        product.title = partial.title;
        product.image_url = partial.image_url;
        return Ok(product);
    }
    Err(ExtractionError::NoPrice {
        url: url.to_string(),
    })
}

fn finish(candidate: Candidate) -> ExtractedProduct {
    let available = candidate.available.unwrap_or(true);
    ExtractedProduct {
        title: candidate.title,
        price: candidate.price,
        currency: candidate.currency,
        image_url: candidate.image_url,
        available,
        error: if available {
            None
        } else {
            Some("out of stock".to_string())
        },
    }
}

/// CSS selectors for one site, tried in order within each field.
#[derive(Debug, PartialEq, Eq)]
struct SiteSelectors {
    title: &'static [&'static str],
    price: &'static [&'static str],
    image: &'static [&'static str],
    availability: &'static [&'static str],
    default_currency: Option<&'static str>,
}

static AMAZON: SiteSelectors = SiteSelectors {
    title: &["#productTitle", "#title"],
    price: &[
        "#corePrice_feature_div .a-offscreen",
        ".a-price .a-offscreen",
        "#priceblock_ourprice",
        "#priceblock_dealprice",
    ],
    image: &["#landingImage", "#imgBlkFront"],
    availability: &["#availability"],
    default_currency: None,
};

static EBAY: SiteSelectors = SiteSelectors {
    title: &[".x-item-title__mainTitle", "h1"],
    price: &[".x-price-primary", "#prcIsum"],
    image: &[".ux-image-carousel-item img"],
    availability: &[".d-quantity__availability"],
    default_currency: None,
};

static WALMART: SiteSelectors = SiteSelectors {
    title: &["h1[itemprop=\"name\"]", "h1"],
    price: &["[itemprop=\"price\"]", "[data-testid=\"price-wrap\"]"],
    image: &["[data-testid=\"hero-image\"] img"],
    availability: &["[data-testid=\"add-to-cart-section\"]"],
    default_currency: Some("USD"),
};

static BEST_BUY: SiteSelectors = SiteSelectors {
    title: &[".sku-title h1", "h1"],
    price: &[".priceView-customer-price span"],
    image: &[".primary-image"],
    availability: &[".fulfillment-add-to-cart-button"],
    default_currency: Some("USD"),
};

static TARGET: SiteSelectors = SiteSelectors {
    title: &["[data-test=\"product-title\"]", "h1"],
    price: &["[data-test=\"product-price\"]"],
    image: &["[data-test=\"product-image\"] img"],
    availability: &["[data-test=\"fulfillment-cell\"]"],
    default_currency: Some("USD"),
};

static ETSY: SiteSelectors = SiteSelectors {
    title: &["h1[data-buy-box-listing-title]", "h1"],
    price: &["[data-buy-box-region=\"price\"] .currency-value", "p.wt-text-title-larger"],
    image: &["img[data-index=\"0\"]"],
    availability: &[],
    default_currency: None,
};

static ALI_EXPRESS: SiteSelectors = SiteSelectors {
    title: &["h1[data-pl=\"product-title\"]", "h1"],
    price: &[".product-price-current", ".uniform-banner-box-price"],
    image: &[".magnifier--image--EYYoSlr", ".image-view-magnifier-wrap img"],
    availability: &[".quantity--info--jnoo_pD"],
    default_currency: None,
};

const OUT_OF_STOCK_PHRASES: &[&str] = &[
    "currently unavailable",
    "out of stock",
    "sold out",
    "no longer available",
    "not available",
];

/// Dedicated capability for one specific site.
#[derive(Debug, Clone, Copy)]
pub struct SiteAdapter {
    kind: AdapterKind,
    selectors: &'static SiteSelectors,
}

impl SiteAdapter {
    pub fn for_kind(kind: AdapterKind) -> Self {
        let selectors = match kind {
            AdapterKind::Amazon => &AMAZON,
            AdapterKind::Ebay => &EBAY,
            AdapterKind::Walmart => &WALMART,
            AdapterKind::BestBuy => &BEST_BUY,
            AdapterKind::Target => &TARGET,
            AdapterKind::Etsy => &ETSY,
            AdapterKind::AliExpress => &ALI_EXPRESS,
        };
        Self { kind, selectors }
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }
}

impl ExtractionCapability for SiteAdapter {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn extract(&self, page: &PageInput<'_>) -> Result<ExtractedProduct, ExtractionError> {
        let document = Html::parse_document(page.html);
        let methods = [
            Method::Selectors(self.selectors),
            Method::JsonLd,
            Method::Microdata,
            Method::MetaTags,
        ];
        let mut product = run_cascade(page.url, &document, &methods)?;
        if product.currency.is_none() {
            product.currency = self.selectors.default_currency.map(str::to_string);
        }
        Ok(product)
    }
}

/// Structured-data cascade shared by every whitelisted domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericCapability;

impl ExtractionCapability for GenericCapability {
    fn name(&self) -> &str {
        "generic"
    }

    fn extract(&self, page: &PageInput<'_>) -> Result<ExtractedProduct, ExtractionError> {
        let document = Html::parse_document(page.html);
        run_cascade(page.url, &document, GENERIC_CASCADE)
    }
}

/// User-supplied selector first, then the generic cascade.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualCapability;

impl ExtractionCapability for ManualCapability {
    fn name(&self) -> &str {
        "manual"
    }

    fn extract(&self, page: &PageInput<'_>) -> Result<ExtractedProduct, ExtractionError> {
        let document = Html::parse_document(page.html);
        if let Some(hint) = page.selector_hint {
            let sel = Selector::parse(hint).map_err(|e| ExtractionError::InvalidSelector {
                selector: hint.to_string(),
                reason: e.to_string(),
            })?;
            if let Some((price, currency)) = document
                .select(&sel)
                .find_map(|node| parse_price(&element_text_or_content(&node)))
            {
                let mut found = Candidate {
                    price: Some(price),
                    currency,
                    ..Default::default()
                };
                found.fill_missing_from(&page_fallbacks(&document));
                return Ok(finish(found));
            }
        }
        run_cascade(page.url, &document, GENERIC_CASCADE)
    }
}

fn element_text_or_content(node: &ElementRef<'_>) -> String {
    node.value()
        .attr("content")
        .map(str::to_string)
        .unwrap_or_else(|| node.text().collect::<String>())
}

fn select_first<'a>(document: &'a Html, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors.iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        document.select(&sel).next()
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn from_site_selectors(document: &Html, selectors: &SiteSelectors) -> Candidate {
    let title = select_first(document, selectors.title)
        .and_then(|n| text_or_none(n.text().collect::<String>()));
    let parsed_price = selectors.price.iter().find_map(|css| {
        let sel = Selector::parse(css).ok()?;
        document
            .select(&sel)
            .find_map(|node| parse_price(&element_text_or_content(&node)))
    });
    let image_url = select_first(document, selectors.image).and_then(|n| {
        n.value()
            .attr("src")
            .or_else(|| n.value().attr("data-old-hires"))
            .map(str::to_string)
    });
    let available = select_first(document, selectors.availability).map(|n| {
        let text = n.text().collect::<String>().to_ascii_lowercase();
        !OUT_OF_STOCK_PHRASES.iter().any(|phrase| text.contains(phrase))
    });

    let (price, currency) = split_price(parsed_price);
    Candidate {
        title,
        price,
        currency,
        image_url,
        available,
    }
}

fn split_price(parsed: Option<(f64, Option<String>)>) -> (Option<f64>, Option<String>) {
    match parsed {
        Some((price, currency)) => (Some(price), currency),
        None => (None, None),
    }
}

fn from_json_ld(document: &Html) -> Candidate {
    let blocks = json_ld_blocks(document);
    let Some(product) = blocks.iter().find_map(find_json_ld_product) else {
        return Candidate::default();
    };

    let offer = product.get("offers").and_then(first_offer);
    let price = offer.and_then(|o| {
        json_price(o.get("price"))
            .or_else(|| json_price(o.get("lowPrice")))
            .or_else(|| o.get("priceSpecification").and_then(|s| json_price(s.get("price"))))
    });
    let currency = offer
        .and_then(|o| {
            o.get("priceCurrency")
                .or_else(|| o.get("priceSpecification").and_then(|s| s.get("priceCurrency")))
        })
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    let available = offer
        .and_then(|o| o.get("availability"))
        .and_then(JsonValue::as_str)
        .map(availability_is_in_stock);

    Candidate {
        title: product
            .get("name")
            .and_then(JsonValue::as_str)
            .and_then(|s| text_or_none(s.to_string())),
        price,
        currency,
        image_url: product.get("image").and_then(json_image),
        available,
    }
}

fn first_offer(offers: &JsonValue) -> Option<&JsonValue> {
    match offers {
        JsonValue::Array(items) => items.first(),
        JsonValue::Object(_) if json_ld_type_is(offers, "AggregateOffer") => offers
            .get("offers")
            .and_then(|inner| match inner {
                JsonValue::Array(items) => items.first(),
                _ => None,
            })
            .filter(|inner| json_price(inner.get("price")).is_some())
            .or(Some(offers)),
        JsonValue::Object(_) => Some(offers),
        _ => None,
    }
}

fn json_price(value: Option<&JsonValue>) -> Option<f64> {
    match value? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => parse_price(s).map(|(price, _)| price),
        _ => None,
    }
}

fn json_image(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => items.first().and_then(json_image),
        JsonValue::Object(map) => map.get("url").and_then(json_image),
        _ => None,
    }
}

fn availability_is_in_stock(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    !(lower.contains("outofstock")
        || lower.contains("out of stock")
        || lower.contains("soldout")
        || lower.contains("discontinued")
        || lower == "oos")
}

fn from_microdata(document: &Html) -> Candidate {
    let (price, price_currency) = split_price(
        select_first(document, &["[itemprop=\"price\"]"])
            .and_then(|n| parse_price(&element_text_or_content(&n))),
    );
    let currency = select_first(document, &["[itemprop=\"priceCurrency\"]"])
        .and_then(|n| text_or_none(element_text_or_content(&n)));
    let title = select_first(document, &["[itemtype*=\"schema.org/Product\"] [itemprop=\"name\"]"])
        .and_then(|n| text_or_none(element_text_or_content(&n)));
    let available = select_first(document, &["[itemprop=\"availability\"]"]).and_then(|n| {
        n.value()
            .attr("href")
            .or_else(|| n.value().attr("content"))
            .map(availability_is_in_stock)
    });
    Candidate {
        title,
        price,
        currency: currency.or(price_currency),
        image_url: None,
        available,
    }
}

fn meta_content(document: &Html, properties: &[&str]) -> Option<String> {
    properties.iter().find_map(|property| {
        let css = format!("meta[property=\"{property}\"], meta[name=\"{property}\"]");
        let sel = Selector::parse(&css).ok()?;
        document
            .select(&sel)
            .find_map(|n| n.value().attr("content").and_then(|c| text_or_none(c.to_string())))
    })
}

fn from_meta_tags(document: &Html) -> Candidate {
    let (price, price_currency) = split_price(
        meta_content(document, &["product:price:amount", "og:price:amount"])
            .and_then(|s| parse_price(&s)),
    );
    Candidate {
        title: meta_content(document, &["og:title"]),
        price,
        currency: meta_content(document, &["product:price:currency", "og:price:currency"])
            .or(price_currency),
        image_url: meta_content(document, &["og:image"]),
        available: meta_content(document, &["product:availability", "og:availability"])
            .map(|s| availability_is_in_stock(&s)),
    }
}

fn page_fallbacks(document: &Html) -> Candidate {
    let title = meta_content(document, &["og:title"]).or_else(|| {
        select_first(document, &["title"]).and_then(|n| text_or_none(n.text().collect::<String>()))
    });
    Candidate {
        title,
        image_url: meta_content(document, &["og:image"]),
        ..Default::default()
    }
}

const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("US$", "USD"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("$", "USD"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₹", "INR"),
];

const CURRENCY_CODES: &[&str] = &["USD", "EUR", "GBP", "CAD", "AUD", "JPY", "INR", "CHF", "SEK", "NOK", "DKK", "PLN"];

/// Parses the first price in `text`, accepting both `1,234.56` and `1.234,56`.
pub fn parse_price(text: &str) -> Option<(f64, Option<String>)> {
    let currency = detect_currency(text);

    let mut raw = String::new();
    let mut started = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            raw.push(ch);
            started = true;
        } else if started && matches!(ch, ',' | '.' | '\'' | '\u{a0}' | ' ') {
            raw.push(ch);
        } else if started {
            break;
        }
    }
    let raw = raw.trim_end_matches(|c: char| !c.is_ascii_digit());
    if raw.is_empty() {
        return None;
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{a0}' | ' '))
        .collect();

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) => {
            let decimals = cleaned.len() - comma - 1;
            if cleaned.matches(',').count() == 1 && decimals != 3 {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        (Some(_), None) if cleaned.matches('.').count() > 1 => cleaned.replace('.', ""),
        _ => cleaned,
    };

    let price: f64 = normalized.parse().ok()?;
    if !price.is_finite() || price < 0.0 {
        return None;
    }
    Some((price, currency))
}

fn detect_currency(text: &str) -> Option<String> {
    // Codes count only as whole tokens, so "ARCADE" is not CAD.
    let upper = text.to_ascii_uppercase();
    if let Some(code) = upper
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|token| CURRENCY_CODES.iter().find(|code| **code == token))
    {
        return Some(code.to_string());
    }
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page<'a>(html: &'a str, selector_hint: Option<&'a str>) -> PageInput<'a> {
        PageInput {
            url: "https://shop.example/p/item-12345",
            html,
            selector_hint,
        }
    }

    #[test]
    fn parses_common_price_formats() {
        assert_eq!(parse_price("$1,234.56"), Some((1234.56, Some("USD".into()))));
        assert_eq!(parse_price("1.234,56 €"), Some((1234.56, Some("EUR".into()))));
        assert_eq!(parse_price("£12,99"), Some((12.99, Some("GBP".into()))));
        assert_eq!(parse_price("USD 1,299"), Some((1299.0, Some("USD".into()))));
        assert_eq!(parse_price("19.99"), Some((19.99, None)));
        assert_eq!(parse_price("Price: 1.299.000"), Some((1_299_000.0, None)));
        assert_eq!(parse_price("no price here"), None);
    }

    #[test]
    fn currency_codes_match_whole_words_only() {
        assert_eq!(parse_price("Arcade stick 49.99"), Some((49.99, None)));
        assert_eq!(parse_price("Spinrite reel 12.50"), Some((12.5, None)));
        assert_eq!(parse_price("12.50CHF"), Some((12.5, Some("CHF".into()))));
        assert_eq!(parse_price("Arcade stick $49.99"), Some((49.99, Some("USD".into()))));
    }

    #[test]
    fn amazon_adapter_reads_site_selectors() {
        let html = r#"<html><body>
            <span id="productTitle">  Noise Cancelling Headphones </span>
            <div class="a-price"><span class="a-offscreen">$249.99</span></div>
            <img id="landingImage" src="https://img.example/h.jpg">
            <div id="availability">In Stock.</div>
        </body></html>"#;
        let product = SiteAdapter::for_kind(AdapterKind::Amazon)
            .extract(&page(html, None))
            .unwrap();
        assert_eq!(product.title.as_deref(), Some("Noise Cancelling Headphones"));
        assert_eq!(product.price, Some(249.99));
        assert_eq!(product.currency.as_deref(), Some("USD"));
        assert_eq!(product.image_url.as_deref(), Some("https://img.example/h.jpg"));
        assert!(product.available);
    }

    #[test]
    fn amazon_adapter_reports_unavailable_without_price() {
        let html = r#"<html><body>
            <span id="productTitle">Old Gadget</span>
            <div id="availability">Currently unavailable.</div>
        </body></html>"#;
        let product = SiteAdapter::for_kind(AdapterKind::Amazon)
            .extract(&page(html, None))
            .unwrap();
        assert!(!product.available);
        assert_eq!(product.price, None);
        assert_eq!(product.title.as_deref(), Some("Old Gadget"));
    }

    #[test]
    fn site_adapter_falls_back_to_structured_data() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@graph":[{"@type":"WebPage"},{"@type":"Product","name":"Lamp","image":["https://img.example/l.jpg"],
              "offers":{"@type":"Offer","price":"39.50","priceCurrency":"EUR","availability":"https://schema.org/InStock"}}]}
            </script></head><body></body></html>"#;
        let product = SiteAdapter::for_kind(AdapterKind::Walmart)
            .extract(&page(html, None))
            .unwrap();
        assert_eq!(product.price, Some(39.5));
        assert_eq!(product.currency.as_deref(), Some("EUR"));
        assert_eq!(product.title.as_deref(), Some("Lamp"));
        assert_eq!(product.image_url.as_deref(), Some("https://img.example/l.jpg"));
    }

    #[test]
    fn generic_cascade_short_circuits_on_first_price() {
        let html = r#"<html><head>
            <meta property="og:title" content="Meta Title">
            <meta property="product:price:amount" content="10.00">
            <meta property="product:price:currency" content="USD">
            <script type="application/ld+json">{"@type":"Product","offers":[{"price":8.25,"priceCurrency":"GBP"}]}</script>
            </head><body></body></html>"#;
        let product = GenericCapability.extract(&page(html, None)).unwrap();
        assert_eq!(product.price, Some(8.25));
        assert_eq!(product.currency.as_deref(), Some("GBP"));
        assert_eq!(product.title.as_deref(), Some("Meta Title"));
    }

    #[test]
    fn generic_out_of_stock_structured_data() {
        let html = r#"<html><head>
            <script type="application/ld+json">{"@type":"Product","name":"Chair","offers":{"availability":"http://schema.org/OutOfStock"}}</script>
            </head></html>"#;
        let product = GenericCapability.extract(&page(html, None)).unwrap();
        assert!(!product.available);
        assert_eq!(product.title.as_deref(), Some("Chair"));
    }

    #[test]
    fn generic_without_any_price_is_an_error() {
        let html = "<html><head><title>Hello</title></head><body>nothing</body></html>";
        let err = GenericCapability.extract(&page(html, None)).unwrap_err();
        assert!(matches!(err, ExtractionError::NoPrice { .. }));
    }

    #[test]
    fn manual_capability_prefers_selector_hint() {
        let html = r#"<html><head><title>Handmade Bowl</title>
            <meta property="product:price:amount" content="99.00"></head>
            <body><div class="cost">€ 45,00</div></body></html>"#;
        let product = ManualCapability
            .extract(&page(html, Some("div.cost")))
            .unwrap();
        assert_eq!(product.price, Some(45.0));
        assert_eq!(product.currency.as_deref(), Some("EUR"));
        assert_eq!(product.title.as_deref(), Some("Handmade Bowl"));

        let fallback = ManualCapability.extract(&page(html, Some(".missing"))).unwrap();
        assert_eq!(fallback.price, Some(99.0));
    }

    #[test]
    fn manual_capability_rejects_bad_selector() {
        let err = ManualCapability
            .extract(&page("<html></html>", Some("div[[")))
            .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidSelector { .. }));
    }
}
