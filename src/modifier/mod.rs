//! Request modifier
//!
//! Filters and rewrites captured requests before they reach the replay
//! queue. Filters either pass the request through (possibly rewritten) or
//! drop it; the hash limiters sample consistently, so the same header or
//! param value is always kept or always rejected.

use crate::capture::fnv1a32;
use crate::config::{parse_limiter, ModifierConfig};
use crate::error::{RefractError, Result};
use crate::proto;
use regex::bytes::Regex;
use tracing::trace;

struct HeaderFilter {
    name: String,
    pattern: Regex,
}

struct HashLimiter {
    name: String,
    /// Values hashing below this threshold pass; the configured percentage
    /// scaled over the full u32 range (100% admits every value).
    threshold: u64,
}

impl HashLimiter {
    fn new(name: String, percent: u8) -> Self {
        let threshold = (u32::MAX as u64 + 1) * percent as u64 / 100;
        HashLimiter { name, threshold }
    }

    fn allows(&self, value: &[u8]) -> bool {
        (fnv1a32(value) as u64) < self.threshold
    }
}

struct RewriteRule {
    pattern: Regex,
    replacement: Vec<u8>,
}

/// Applies the configured allow/deny/rewrite/sample filters to one request.
pub struct RequestModifier {
    allow_methods: Vec<Vec<u8>>,
    allow_url: Option<Regex>,
    disallow_url: Option<Regex>,
    rewrite_url: Vec<RewriteRule>,
    set_headers: Vec<(String, String)>,
    set_params: Vec<(String, String)>,
    allow_headers: Vec<HeaderFilter>,
    disallow_headers: Vec<HeaderFilter>,
    header_limiters: Vec<HashLimiter>,
    param_limiters: Vec<HashLimiter>,
}

impl RequestModifier {
    pub fn new(config: &ModifierConfig) -> Result<Self> {
        let compile = |pattern: &String| Regex::new(pattern).map_err(RefractError::from);

        let mut rewrite_url = Vec::new();
        for rule in &config.rewrite_url {
            let (pattern, replacement) = rule.split_once(':').ok_or_else(|| {
                RefractError::Modifier(format!("rewrite rule missing ':': {:?}", rule))
            })?;
            rewrite_url.push(RewriteRule {
                pattern: Regex::new(pattern)?,
                replacement: replacement.as_bytes().to_vec(),
            });
        }

        let header_filters = |rules: &[String]| -> Result<Vec<HeaderFilter>> {
            rules
                .iter()
                .map(|rule| {
                    let (name, pattern) = rule.split_once(':').ok_or_else(|| {
                        RefractError::Modifier(format!("header filter missing ':': {:?}", rule))
                    })?;
                    Ok(HeaderFilter {
                        name: name.trim().to_string(),
                        pattern: Regex::new(pattern.trim())?,
                    })
                })
                .collect()
        };

        let limiters = |rules: &[String]| -> Result<Vec<HashLimiter>> {
            rules
                .iter()
                .map(|rule| {
                    let (name, percent) = parse_limiter(rule)?;
                    Ok(HashLimiter::new(name, percent))
                })
                .collect()
        };

        let pairs = |rules: &[String], sep: char| -> Result<Vec<(String, String)>> {
            rules
                .iter()
                .map(|rule| {
                    let (key, value) = rule.split_once(sep).ok_or_else(|| {
                        RefractError::Modifier(format!("expected {:?} in {:?}", sep, rule))
                    })?;
                    Ok((key.trim().to_string(), value.trim().to_string()))
                })
                .collect()
        };

        Ok(RequestModifier {
            allow_methods: config
                .allow_methods
                .iter()
                .map(|m| m.to_ascii_uppercase().into_bytes())
                .collect(),
            allow_url: config.allow_url.as_ref().map(compile).transpose()?,
            disallow_url: config.disallow_url.as_ref().map(compile).transpose()?,
            rewrite_url,
            set_headers: pairs(&config.set_headers, ':')?,
            set_params: pairs(&config.set_params, '=')?,
            allow_headers: header_filters(&config.allow_headers)?,
            disallow_headers: header_filters(&config.disallow_headers)?,
            header_limiters: limiters(&config.header_limiters)?,
            param_limiters: limiters(&config.param_limiters)?,
        })
    }

    /// True when no filter or rewrite is configured.
    pub fn is_empty(&self) -> bool {
        self.allow_methods.is_empty()
            && self.allow_url.is_none()
            && self.disallow_url.is_none()
            && self.rewrite_url.is_empty()
            && self.set_headers.is_empty()
            && self.set_params.is_empty()
            && self.allow_headers.is_empty()
            && self.disallow_headers.is_empty()
            && self.header_limiters.is_empty()
            && self.param_limiters.is_empty()
    }

    /// Apply all filters to a raw request; `None` drops the request.
    pub fn apply(&self, req: &[u8]) -> Option<Vec<u8>> {
        if !self.allow_methods.is_empty() {
            let method = proto::method(req);
            if !self.allow_methods.iter().any(|m| m == method) {
                trace!("dropping request: method not allowed");
                return None;
            }
        }

        let url = proto::path(req);
        if let Some(pattern) = &self.allow_url {
            if !pattern.is_match(url) {
                trace!("dropping request: url not allowed");
                return None;
            }
        }
        if let Some(pattern) = &self.disallow_url {
            if pattern.is_match(url) {
                trace!("dropping request: url disallowed");
                return None;
            }
        }

        for filter in &self.allow_headers {
            match proto::header(req, &filter.name) {
                Some(value) if filter.pattern.is_match(value) => {}
                _ => {
                    trace!(header = %filter.name, "dropping request: header filter");
                    return None;
                }
            }
        }
        for filter in &self.disallow_headers {
            if let Some(value) = proto::header(req, &filter.name) {
                if filter.pattern.is_match(value) {
                    trace!(header = %filter.name, "dropping request: header disallowed");
                    return None;
                }
            }
        }

        for limiter in &self.header_limiters {
            if let Some(value) = proto::header(req, &limiter.name) {
                if !limiter.allows(value) {
                    return None;
                }
            }
        }
        for limiter in &self.param_limiters {
            if let Some(value) = query_param(url, &limiter.name) {
                if !limiter.allows(value) {
                    return None;
                }
            }
        }

        let mut out = req.to_vec();

        for rule in &self.rewrite_url {
            let path = proto::path(&out).to_vec();
            let rewritten = rule
                .pattern
                .replace(&path, &rule.replacement[..])
                .into_owned();
            if rewritten != path {
                out = proto::set_path(&out, &rewritten);
            }
        }

        for (name, value) in &self.set_headers {
            out = proto::set_header(&out, name, value);
        }
        for (key, value) in &self.set_params {
            out = proto::set_query_param(&out, key, value);
        }

        Some(out)
    }
}

/// Value of a query parameter inside a raw path, if present.
fn query_param<'a>(url: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let query_start = url.iter().position(|&b| b == b'?')? + 1;
    for pair in url[query_start..].split(|&b| b == b'&') {
        let mut halves = pair.splitn(2, |&b| b == b'=');
        let key = halves.next()?;
        if key == name.as_bytes() {
            return Some(halves.next().unwrap_or(&[]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modifier(config: ModifierConfig) -> RequestModifier {
        RequestModifier::new(&config).unwrap()
    }

    const GET: &[u8] = b"GET /v1/user/42/ping?user_id=alpha HTTP/1.1\r\nHost: h\r\nUser-Agent: curl\r\n\r\n";
    const POST: &[u8] = b"POST /submit HTTP/1.1\r\nHost: h\r\n\r\n";

    #[test]
    fn test_empty_modifier_passes_through() {
        let m = modifier(ModifierConfig::default());
        assert!(m.is_empty());
        assert_eq!(m.apply(GET).unwrap(), GET);
    }

    #[test]
    fn test_method_whitelist() {
        let m = modifier(ModifierConfig {
            allow_methods: vec!["get".into(), "OPTIONS".into()],
            ..Default::default()
        });
        assert!(m.apply(GET).is_some());
        assert!(m.apply(POST).is_none());
    }

    #[test]
    fn test_url_allow_and_disallow() {
        let allow = modifier(ModifierConfig {
            allow_url: Some("^/v1/".into()),
            ..Default::default()
        });
        assert!(allow.apply(GET).is_some());
        assert!(allow.apply(POST).is_none());

        let deny = modifier(ModifierConfig {
            disallow_url: Some("^/v1/".into()),
            ..Default::default()
        });
        assert!(deny.apply(GET).is_none());
        assert!(deny.apply(POST).is_some());
    }

    #[test]
    fn test_url_rewrite() {
        let m = modifier(ModifierConfig {
            rewrite_url: vec![r"/v1/user/([^/]+)/ping:/v2/user/$1/ping".into()],
            ..Default::default()
        });
        let out = m.apply(GET).unwrap();
        assert!(proto::path(&out).starts_with(b"/v2/user/42/ping"));
    }

    #[test]
    fn test_set_header() {
        let m = modifier(ModifierConfig {
            set_headers: vec!["User-Agent: refract".into()],
            ..Default::default()
        });
        let out = m.apply(GET).unwrap();
        assert_eq!(proto::header(&out, "User-Agent"), Some(&b"refract"[..]));
    }

    #[test]
    fn test_set_param() {
        let m = modifier(ModifierConfig {
            set_params: vec!["api_key=1".into()],
            ..Default::default()
        });
        let out = m.apply(GET).unwrap();
        assert!(proto::path(&out).ends_with(b"api_key=1"));
    }

    #[test]
    fn test_header_filters() {
        let allow = modifier(ModifierConfig {
            allow_headers: vec!["User-Agent:^curl".into()],
            ..Default::default()
        });
        assert!(allow.apply(GET).is_some());
        assert!(allow.apply(POST).is_none()); // header absent

        let deny = modifier(ModifierConfig {
            disallow_headers: vec!["User-Agent:curl".into()],
            ..Default::default()
        });
        assert!(deny.apply(GET).is_none());
        assert!(deny.apply(POST).is_some());
    }

    #[test]
    fn test_hash_limiter_is_consistent() {
        let m = modifier(ModifierConfig {
            header_limiters: vec!["User-Agent:50%".into()],
            ..Default::default()
        });
        let first = m.apply(GET).is_some();
        for _ in 0..10 {
            assert_eq!(m.apply(GET).is_some(), first);
        }
    }

    #[test]
    fn test_hash_limiter_extremes() {
        let all = modifier(ModifierConfig {
            header_limiters: vec!["User-Agent:100%".into()],
            ..Default::default()
        });
        assert!(all.apply(GET).is_some());

        let none = modifier(ModifierConfig {
            header_limiters: vec!["User-Agent:0%".into()],
            ..Default::default()
        });
        assert!(none.apply(GET).is_none());
    }

    #[test]
    fn test_param_limiter_uses_param_value() {
        let none = modifier(ModifierConfig {
            param_limiters: vec!["user_id:0%".into()],
            ..Default::default()
        });
        assert!(none.apply(GET).is_none());
        // Request without the param passes untouched
        assert!(none.apply(POST).is_some());
    }

    #[test]
    fn test_query_param_extraction() {
        assert_eq!(
            query_param(b"/x?a=1&b=two", "b"),
            Some(&b"two"[..])
        );
        assert_eq!(query_param(b"/x?a=1", "b"), None);
        assert_eq!(query_param(b"/x", "a"), None);
        assert_eq!(query_param(b"/x?flag", "flag"), Some(&b""[..]));
    }

    #[test]
    fn test_bad_rules_rejected() {
        assert!(RequestModifier::new(&ModifierConfig {
            rewrite_url: vec!["no-separator".into()],
            ..Default::default()
        })
        .is_err());
        assert!(RequestModifier::new(&ModifierConfig {
            allow_url: Some("(unclosed".into()),
            ..Default::default()
        })
        .is_err());
    }
}
