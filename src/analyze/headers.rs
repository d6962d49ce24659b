//! HTTP security-header analyzer
//!
//! Performs a HEAD request (GET fallback, body never read past the
//! configured cap) against a URL target and inspects the response
//! headers: CSP, HSTS, X-XSS-Protection, Referrer-Policy,
//! X-Frame-Options, and CORS. Header inspection itself is pure over the
//! header map, so it tests without a network.

use crate::config::HttpConfig;
use crate::engine::PatternRegistry;
use crate::error::{ErrorCode, ScanError};
use crate::finding::Finding;
use crate::limiter::{self, RateLimiter};
use crate::target::host_of;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// HSTS max-age under six months is flagged as short.
const HSTS_MIN_MAX_AGE: u64 = 15_552_000;

const DANGEROUS_METHODS: &[&str] = &["TRACE", "TRACK", "CONNECT"];

pub struct HeaderAnalyzer {
    client: reqwest::Client,
    registry: Arc<PatternRegistry>,
    limiter: Arc<RateLimiter>,
    retry: crate::config::LimiterConfig,
}

impl HeaderAnalyzer {
    pub fn new(
        http: &HttpConfig,
        retry: crate::config::LimiterConfig,
        registry: Arc<PatternRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(http.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(http.max_redirects))
            .timeout(http.header_timeout())
            .build()?;
        Ok(Self {
            client,
            registry,
            limiter,
            retry,
        })
    }

    /// Fetch the target's headers and inspect them.
    pub async fn analyze(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Finding>, ScanError> {
        let key = host_of(url).unwrap_or_else(|| url.to_string());
        let key_ref: &str = &key;
        let headers =
            limiter::retry_with_backoff(&self.retry, cancel, "header fetch", |_| async move {
                self.limiter.acquire(key_ref, cancel).await?;
                let result = self.fetch_headers(url).await;
                match &result {
                    Ok(_) => self.limiter.record_success(key_ref),
                    Err((_, status)) => self.limiter.record_failure(key_ref, *status),
                }
                result.map_err(|(error, _)| error)
            })
            .await?;
        Ok(self.inspect(url, &headers))
    }

    /// HEAD with GET fallback; the GET body is dropped unread.
    async fn fetch_headers(&self, url: &str) -> Result<HeaderMap, (ScanError, Option<u16>)> {
        match self.client.head(url).send().await {
            Ok(response) if response.status() != reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                Ok(response.headers().clone())
            }
            Ok(_) | Err(_) => match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let headers = response.headers().clone();
                    drop(response);
                    if limiter::is_retryable_status(status) {
                        return Err((
                            ScanError::new(
                                ErrorCode::NetworkError,
                                format!("header fetch got status {status}"),
                            ),
                            Some(status),
                        ));
                    }
                    Ok(headers)
                }
                Err(error) => {
                    let status = error.status().map(|s| s.as_u16());
                    let code = if limiter::is_retryable_reqwest(&error) {
                        ErrorCode::NetworkError
                    } else {
                        ErrorCode::RepositoryAccessError
                    };
                    Err((
                        ScanError::new(code, format!("header fetch failed for {url}"))
                            .with_source(error),
                        status,
                    ))
                }
            },
        }
    }

    /// Pure header inspection.
    pub fn inspect(&self, url: &str, headers: &HeaderMap) -> Vec<Finding> {
        let mut findings = Vec::new();
        self.inspect_csp(url, headers, &mut findings);
        if url.starts_with("https://") {
            self.inspect_hsts(url, headers, &mut findings);
        }
        self.inspect_xss_protection(url, headers, &mut findings);
        self.inspect_referrer_policy(url, headers, &mut findings);
        self.inspect_frame_options(url, headers, &mut findings);
        self.inspect_cors(url, headers, &mut findings);
        findings
    }

    fn emit(&self, findings: &mut Vec<Finding>, id: &str, url: &str, value: &str, header: &str) {
        findings.push(self.registry.marker_finding(
            id,
            url,
            value.to_string(),
            serde_json::json!({ "header": header }),
        ));
    }

    fn inspect_csp(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let Some(csp) = header_str(headers, "content-security-policy") else {
            self.emit(findings, "missing-csp", url, "", "content-security-policy");
            return;
        };
        let lowered = csp.to_lowercase();
        if lowered.contains("'unsafe-eval'") {
            self.emit(findings, "csp-unsafe-eval", url, &csp, "content-security-policy");
        }
        if let Some(script_src) = directive_value(&lowered, "script-src") {
            if script_src.split_whitespace().any(|token| token == "*") {
                self.emit(
                    findings,
                    "csp-wildcard-script-src",
                    url,
                    &csp,
                    "content-security-policy",
                );
            }
        }
        if directive_value(&lowered, "object-src").is_none() {
            self.emit(
                findings,
                "csp-missing-object-src",
                url,
                &csp,
                "content-security-policy",
            );
        }
    }

    fn inspect_hsts(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let Some(hsts) = header_str(headers, "strict-transport-security") else {
            self.emit(findings, "missing-hsts", url, "", "strict-transport-security");
            return;
        };
        let lowered = hsts.to_lowercase();
        match max_age_of(&lowered) {
            None => self.emit(
                findings,
                "hsts-missing-max-age",
                url,
                &hsts,
                "strict-transport-security",
            ),
            Some(age) if age < HSTS_MIN_MAX_AGE => self.emit(
                findings,
                "hsts-short-max-age",
                url,
                &hsts,
                "strict-transport-security",
            ),
            Some(_) => {}
        }
        if !lowered.contains("includesubdomains") {
            self.emit(
                findings,
                "hsts-missing-subdomains",
                url,
                &hsts,
                "strict-transport-security",
            );
        }
    }

    fn inspect_xss_protection(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let Some(xss) = header_str(headers, "x-xss-protection") else {
            self.emit(findings, "missing-xss-protection", url, "", "x-xss-protection");
            return;
        };
        let lowered = xss.to_lowercase().replace(' ', "");
        if lowered.starts_with('0') {
            self.emit(findings, "disabled-xss-protection", url, &xss, "x-xss-protection");
        } else if !lowered.contains("mode=block") {
            self.emit(findings, "weak-xss-protection", url, &xss, "x-xss-protection");
        }
    }

    fn inspect_referrer_policy(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let Some(policy) = header_str(headers, "referrer-policy") else {
            self.emit(findings, "missing-referrer-policy", url, "", "referrer-policy");
            return;
        };
        let lowered = policy.to_lowercase();
        if lowered.contains("unsafe-url") || lowered.contains("no-referrer-when-downgrade") {
            self.emit(
                findings,
                "permissive-referrer-policy",
                url,
                &policy,
                "referrer-policy",
            );
        }
    }

    fn inspect_frame_options(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let Some(xfo) = header_str(headers, "x-frame-options") else {
            self.emit(findings, "missing-x-frame-options", url, "", "x-frame-options");
            return;
        };
        let lowered = xfo.trim().to_lowercase();
        if lowered == "deny" || lowered == "sameorigin" {
            return;
        }
        if lowered.starts_with("allow-from") {
            self.emit(
                findings,
                "permissive-x-frame-options",
                url,
                &xfo,
                "x-frame-options",
            );
        } else {
            self.emit(findings, "invalid-x-frame-options", url, &xfo, "x-frame-options");
        }
    }

    fn inspect_cors(&self, url: &str, headers: &HeaderMap, findings: &mut Vec<Finding>) {
        let origin = header_str(headers, "access-control-allow-origin");
        let credentials = header_str(headers, "access-control-allow-credentials")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if let Some(origin) = origin {
            let trimmed = origin.trim();
            if trimmed == "*" && credentials {
                self.emit(
                    findings,
                    "cors-wildcard-with-credentials",
                    url,
                    &origin,
                    "access-control-allow-origin",
                );
            }
            if trimmed.eq_ignore_ascii_case("null") {
                self.emit(
                    findings,
                    "cors-null-origin",
                    url,
                    &origin,
                    "access-control-allow-origin",
                );
            }
            // One header carrying several origins is invalid per spec and
            // a sign of naive reflection.
            if trimmed.split([',', ' ']).filter(|part| !part.is_empty()).count() > 1 {
                self.emit(
                    findings,
                    "cors-multiple-origins",
                    url,
                    &origin,
                    "access-control-allow-origin",
                );
            }
        }

        if let Some(methods) = header_str(headers, "access-control-allow-methods") {
            let upper = methods.to_uppercase();
            if upper.split([',', ' ']).any(|token| token.trim() == "*") {
                self.emit(
                    findings,
                    "cors-wildcard-methods",
                    url,
                    &methods,
                    "access-control-allow-methods",
                );
            }
            if DANGEROUS_METHODS
                .iter()
                .any(|method| upper.split([',', ' ']).any(|token| token.trim() == *method))
            {
                self.emit(
                    findings,
                    "cors-dangerous-methods",
                    url,
                    &methods,
                    "access-control-allow-methods",
                );
            }
        }

        if let Some(allowed_headers) = header_str(headers, "access-control-allow-headers") {
            if allowed_headers.split([',', ' ']).any(|token| token.trim() == "*") {
                self.emit(
                    findings,
                    "cors-wildcard-headers",
                    url,
                    &allowed_headers,
                    "access-control-allow-headers",
                );
            }
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Value of one CSP directive, if present.
fn directive_value<'a>(csp: &'a str, directive: &str) -> Option<&'a str> {
    csp.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix(directive)
            .filter(|rest| rest.is_empty() || rest.starts_with(' '))
            .map(|rest| rest.trim())
    })
}

/// Parse `max-age=N` out of an HSTS value.
fn max_age_of(hsts: &str) -> Option<u64> {
    hsts.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("max-age=")
            .and_then(|value| value.trim().parse::<u64>().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::events::EventBus;
    use crate::finding::Severity;
    use reqwest::header::{HeaderName, HeaderValue};

    fn analyzer() -> HeaderAnalyzer {
        let registry = Arc::new(PatternRegistry::embedded().unwrap());
        let limiter = Arc::new(RateLimiter::new(LimiterConfig::default(), EventBus::new()));
        HeaderAnalyzer::new(
            &HttpConfig::default(),
            LimiterConfig::default(),
            registry,
            limiter,
        )
        .unwrap()
    }

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn ids(findings: &[Finding]) -> Vec<&str> {
        findings.iter().map(|f| f.pattern_id.as_str()).collect()
    }

    #[test]
    fn missing_hsts_on_https_scores_medium_090() {
        let analyzer = analyzer();
        let headers = header_map(&[("content-security-policy", "default-src 'self'")]);
        let findings = analyzer.inspect("https://example.com", &headers);

        let hsts = findings
            .iter()
            .find(|f| f.pattern_id == "missing-hsts")
            .expect("missing-hsts finding");
        assert_eq!(hsts.pattern_name, "Missing HSTS Header");
        assert_eq!(hsts.severity, Severity::Medium);
        assert!((hsts.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn hsts_not_checked_for_plain_http() {
        let analyzer = analyzer();
        let findings = analyzer.inspect("http://example.com", &header_map(&[]));
        assert!(!ids(&findings).contains(&"missing-hsts"));
    }

    #[test]
    fn short_and_incomplete_hsts() {
        let analyzer = analyzer();
        let headers = header_map(&[("strict-transport-security", "max-age=3600")]);
        let findings = analyzer.inspect("https://example.com", &headers);
        let found = ids(&findings);
        assert!(found.contains(&"hsts-short-max-age"));
        assert!(found.contains(&"hsts-missing-subdomains"));
        assert!(!found.contains(&"missing-hsts"));

        let headers = header_map(&[(
            "strict-transport-security",
            "max-age=31536000; includeSubDomains",
        )]);
        let findings = analyzer.inspect("https://example.com", &headers);
        let found = ids(&findings);
        assert!(!found.contains(&"hsts-short-max-age"));
        assert!(!found.contains(&"hsts-missing-subdomains"));
    }

    #[test]
    fn csp_weaknesses() {
        let analyzer = analyzer();
        let headers = header_map(&[(
            "content-security-policy",
            "default-src 'self'; script-src * 'unsafe-eval'",
        )]);
        let findings = analyzer.inspect("https://example.com", &headers);
        let found = ids(&findings);
        assert!(found.contains(&"csp-unsafe-eval"));
        assert!(found.contains(&"csp-wildcard-script-src"));
        assert!(found.contains(&"csp-missing-object-src"));

        let findings = analyzer.inspect("https://example.com", &header_map(&[]));
        assert!(ids(&findings).contains(&"missing-csp"));
    }

    #[test]
    fn xss_protection_states() {
        let analyzer = analyzer();
        let disabled = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-xss-protection", "0")]),
        );
        assert!(ids(&disabled).contains(&"disabled-xss-protection"));

        let weak = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-xss-protection", "1")]),
        );
        assert!(ids(&weak).contains(&"weak-xss-protection"));

        let good = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-xss-protection", "1; mode=block")]),
        );
        assert!(!ids(&good).iter().any(|id| id.contains("xss")));
    }

    #[test]
    fn frame_options_states() {
        let analyzer = analyzer();
        let missing = analyzer.inspect("https://example.com", &header_map(&[]));
        assert!(ids(&missing).contains(&"missing-x-frame-options"));

        let invalid = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-frame-options", "ALLOWALL")]),
        );
        assert!(ids(&invalid).contains(&"invalid-x-frame-options"));

        let permissive = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-frame-options", "ALLOW-FROM https://evil.test")]),
        );
        assert!(ids(&permissive).contains(&"permissive-x-frame-options"));

        let good = analyzer.inspect(
            "https://example.com",
            &header_map(&[("x-frame-options", "DENY")]),
        );
        assert!(!ids(&good).iter().any(|id| id.contains("frame")));
    }

    #[test]
    fn referrer_policy_states() {
        let analyzer = analyzer();
        let permissive = analyzer.inspect(
            "https://example.com",
            &header_map(&[("referrer-policy", "unsafe-url")]),
        );
        assert!(ids(&permissive).contains(&"permissive-referrer-policy"));

        let good = analyzer.inspect(
            "https://example.com",
            &header_map(&[("referrer-policy", "strict-origin-when-cross-origin")]),
        );
        assert!(!ids(&good).iter().any(|id| id.contains("referrer")));
    }

    #[test]
    fn dangerous_cors_configurations() {
        let analyzer = analyzer();
        let headers = header_map(&[
            ("access-control-allow-origin", "*"),
            ("access-control-allow-credentials", "true"),
            ("access-control-allow-methods", "GET, POST, TRACE"),
            ("access-control-allow-headers", "*"),
        ]);
        let findings = analyzer.inspect("https://example.com", &headers);
        let found = ids(&findings);
        assert!(found.contains(&"cors-wildcard-with-credentials"));
        assert!(found.contains(&"cors-dangerous-methods"));
        assert!(found.contains(&"cors-wildcard-headers"));

        let severity = findings
            .iter()
            .find(|f| f.pattern_id == "cors-wildcard-with-credentials")
            .unwrap()
            .severity;
        assert_eq!(severity, Severity::Critical);
    }

    #[test]
    fn cors_null_and_multiple_origins() {
        let analyzer = analyzer();
        let null = analyzer.inspect(
            "https://example.com",
            &header_map(&[("access-control-allow-origin", "null")]),
        );
        assert!(ids(&null).contains(&"cors-null-origin"));

        let multiple = analyzer.inspect(
            "https://example.com",
            &header_map(&[(
                "access-control-allow-origin",
                "https://a.test, https://b.test",
            )]),
        );
        assert!(ids(&multiple).contains(&"cors-multiple-origins"));
    }

    #[test]
    fn directive_parsing_helpers() {
        assert_eq!(
            directive_value("default-src 'self'; script-src *", "script-src"),
            Some("*")
        );
        assert_eq!(directive_value("script-src-elem *", "script-src"), None);
        assert_eq!(max_age_of("max-age=31536000; includesubdomains"), Some(31_536_000));
        assert_eq!(max_age_of("includesubdomains"), None);
    }

    #[test]
    fn clean_response_has_no_cors_findings() {
        let analyzer = analyzer();
        let headers = header_map(&[("access-control-allow-origin", "https://app.example.com")]);
        let findings = analyzer.inspect("https://example.com", &headers);
        assert!(!ids(&findings).iter().any(|id| id.starts_with("cors-")));
    }
}
