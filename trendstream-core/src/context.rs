//! Page context enrichment
//!
//! Everything attached to an envelope besides identity comes from a
//! [`PageContext`] snapshot of the host page. Extraction never fails: missing
//! or malformed inputs resolve to `None` or a default.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::CollectorConfig;

static TABLET_UA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)tablet|ipad|playbook|silk").expect("valid tablet pattern"));

static ANDROID_UA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)android").expect("valid pattern"));

static MOBI_UA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)mobi").expect("valid pattern"));

static MOBILE_UA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"Mobile|iP(hone|od)|Android|BlackBerry|IEMobile|Kindle|Silk-Accelerated|(hpw|web)OS|Opera M(obi|ini)",
    )
    .expect("valid mobile pattern")
});

/// Coarse device class derived from the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a user agent. Tablet patterns win over mobile ones.
pub fn classify_device(user_agent: &str) -> DeviceClass {
    let android_tablet = ANDROID_UA.is_match(user_agent) && !MOBI_UA.is_match(user_agent);
    if TABLET_UA.is_match(user_agent) || android_tablet {
        DeviceClass::Tablet
    } else if MOBILE_UA.is_match(user_agent) {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

/// Snapshot of the host page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageContext {
    /// Full URL including query string
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub user_agent: String,
    /// BCP 47 language tag, e.g. `ko-KR`
    #[serde(default)]
    pub locale: Option<String>,
}

impl PageContext {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Context attached to every envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Context {
    pub page_path: String,
    pub referrer: Option<String>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub device_type: DeviceClass,
    pub country: String,
    pub locale: Option<String>,
}

/// Build the envelope context for `page`.
pub fn build_context(page: &PageContext, config: &CollectorConfig) -> Context {
    Context {
        page_path: page_path(&page.url),
        referrer: page.referrer.clone().filter(|r| !r.is_empty()),
        utm_source: query_param(&page.url, "utm_source"),
        utm_medium: query_param(&page.url, "utm_medium"),
        utm_campaign: query_param(&page.url, "utm_campaign"),
        device_type: classify_device(&page.user_agent),
        country: config.country.clone(),
        locale: page.locale.clone().filter(|l| !l.is_empty()),
    }
}

/// Path component of a URL, `/` when there is none.
///
/// Accepts absolute URLs (`https://host/a/b?x`) as well as bare paths (`/a/b?x`).
pub fn page_path(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or("");
    let without_query = without_fragment.split('?').next().unwrap_or("");

    let path = match without_query.find("://") {
        Some(scheme_end) => {
            let rest = &without_query[scheme_end + 3..];
            rest.find('/').map(|i| &rest[i..]).unwrap_or("")
        }
        None => without_query,
    };

    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Look up a query parameter.
///
/// Returns the first occurrence, percent-decoded with `+` as space. Absent and
/// empty parameters both give `None`.
pub fn query_param(url: &str, name: &str) -> Option<String> {
    let without_fragment = url.split('#').next()?;
    let (_, query) = without_fragment.split_once('?')?;

    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if decode_component(key) == name {
                Some(decode_component(value))
            } else {
                None
            }
        })
        .filter(|value| !value.is_empty())
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IPAD: &str = "Mozilla/5.0 (iPad; CPU OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";
    const ANDROID_PHONE: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Mobile Safari/537.36";
    const ANDROID_TABLET: &str = "Mozilla/5.0 (Linux; Android 13; SM-X700) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";
    const DESKTOP: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

    #[test]
    fn test_tablet_wins_over_mobile() {
        // iPad UAs also carry "Mobile/"
        assert!(MOBILE_UA.is_match(IPAD));
        assert_eq!(classify_device(IPAD), DeviceClass::Tablet);
    }

    #[test]
    fn test_classify_devices() {
        assert_eq!(classify_device(IPHONE), DeviceClass::Mobile);
        assert_eq!(classify_device(ANDROID_PHONE), DeviceClass::Mobile);
        assert_eq!(classify_device(ANDROID_TABLET), DeviceClass::Tablet);
        assert_eq!(classify_device(DESKTOP), DeviceClass::Desktop);
        assert_eq!(classify_device(""), DeviceClass::Desktop);
    }

    #[test]
    fn test_utm_extraction() {
        let url = "https://blog.example.com/posts/1?utm_source=ads&utm_campaign=x";
        assert_eq!(query_param(url, "utm_source").as_deref(), Some("ads"));
        assert_eq!(query_param(url, "utm_medium"), None);
        assert_eq!(query_param(url, "utm_campaign").as_deref(), Some("x"));
    }

    #[test]
    fn test_query_param_edge_cases() {
        assert_eq!(query_param("/p", "q"), None);
        assert_eq!(query_param("/p?q=", "q"), None);
        assert_eq!(query_param("/p?q", "q"), None);
        assert_eq!(
            query_param("/p?q=hello+world%21&q=second", "q").as_deref(),
            Some("hello world!")
        );
        assert_eq!(
            query_param("/p?q=%ED%95%9C%EA%B8%80#frag", "q").as_deref(),
            Some("한글")
        );
        assert_eq!(query_param("/p?x=1#q=2", "q"), None);
    }

    #[test]
    fn test_page_path() {
        assert_eq!(page_path("https://example.com/a/b?x=1#top"), "/a/b");
        assert_eq!(page_path("https://example.com"), "/");
        assert_eq!(page_path("https://example.com?x=1"), "/");
        assert_eq!(page_path("/local/path?q=1"), "/local/path");
        assert_eq!(page_path(""), "/");
    }

    #[test]
    fn test_build_context() {
        let page = PageContext {
            url: "https://example.com/shop?utm_source=ads&utm_campaign=x".to_string(),
            title: "Shop".to_string(),
            referrer: Some(String::new()),
            user_agent: IPAD.to_string(),
            locale: Some("ko-KR".to_string()),
        };
        let ctx = build_context(&page, &CollectorConfig::default());

        assert_eq!(ctx.page_path, "/shop");
        assert_eq!(ctx.referrer, None);
        assert_eq!(ctx.utm_source.as_deref(), Some("ads"));
        assert_eq!(ctx.utm_medium, None);
        assert_eq!(ctx.utm_campaign.as_deref(), Some("x"));
        assert_eq!(ctx.device_type, DeviceClass::Tablet);
        assert_eq!(ctx.country, "KR");
        assert_eq!(ctx.locale.as_deref(), Some("ko-KR"));
    }
}
