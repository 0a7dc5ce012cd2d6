//! Built-in indicator extraction from free-text security reports.
//!
//! Extraction is normally done by an upstream collaborator; this extractor
//! covers plain-text reports so the engine can be fed directly.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard};

use regex::Regex;
use vigil_core::config::ScoringConfig;
use vigil_core::{Indicator, IndicatorKind};

/// Turns a raw payload into typed, weighted indicators.
pub trait IndicatorExtractor: Send + Sync {
    /// `tags` are behavioural anomaly tags already attached by the caller.
    fn extract(&self, text: &str, tags: &[String]) -> Vec<Indicator>;

    /// Add known-bad IP addresses from a threat-intelligence feed. Returns how
    /// many were new. Extractors without a reputation set ignore the update.
    fn update_reputation(&self, _ips: &[String]) -> usize {
        0
    }
}

const SUSPICIOUS_TERMS: &[&str] = &[
    "backdoor",
    "rootkit",
    "exploit",
    "zero-day",
    "pwned",
    "botnet",
    "ransomware",
    "keylogger",
    "phishing",
    "malware",
    "trojan",
];

/// Regex families and the patterns that belong to them.
const PATTERN_FAMILIES: &[(&str, &[&str])] = &[
    (
        "sql_injection",
        &[
            r"(?i)union\s+(all\s+)?select",
            r"(?i)insert\s+into\s+\w+",
            r"(?i)delete\s+from\s+\w+",
            r"(?i)drop\s+table",
            r"(?i)'\s*or\s+'?1'?\s*=\s*'?1",
        ],
    ),
    (
        "xss",
        &[
            r"(?i)<script[^>]*>",
            r"(?i)javascript:",
            r"(?i)<iframe[^>]*>",
            r"(?i)document\.cookie",
            r"(?i)\bon(load|error|click|mouseover)\s*=",
        ],
    ),
    (
        "command_injection",
        &[
            r"[;&|]\s*(ls|dir|cat|type|more|less|whoami|id)\b",
            r"\$\(|`",
            r"(?i)\b(nc|netcat|wget|curl)\s+\S+",
        ],
    ),
    (
        "suspicious_activity",
        &[
            r"(?i)password.*brute.?force|brute.?force.*password",
            r"(?i)failed.*login.*attempts",
            r"(?i)privilege.*escalation",
            r"(?i)lateral.*movement",
            r"(?i)data.*exfiltration",
            r"(?i)backdoor.*access",
        ],
    ),
];

/// Keyword, pattern, IPv4 reputation, and behavioural-tag extraction.
pub struct PatternExtractor {
    families: Vec<(&'static str, Vec<Regex>)>,
    ipv4: Regex,
    blocklist: RwLock<HashSet<String>>,
    keyword_weight: f64,
    ip_weight: f64,
    pattern_weight: f64,
    anomaly_weight: f64,
}

impl PatternExtractor {
    pub fn new(config: &ScoringConfig) -> Result<Self, regex::Error> {
        let families = PATTERN_FAMILIES
            .iter()
            .map(|(family, patterns)| {
                let compiled = patterns
                    .iter()
                    .map(|p| Regex::new(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((*family, compiled))
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        let weights = &config.weights;
        Ok(Self {
            families,
            ipv4: Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b")?,
            blocklist: RwLock::new(config.reputation_blocklist.iter().cloned().collect()),
            keyword_weight: weights.weight_for(IndicatorKind::Keyword),
            ip_weight: weights.weight_for(IndicatorKind::IpReputation),
            pattern_weight: weights.weight_for(IndicatorKind::Pattern),
            anomaly_weight: weights.weight_for(IndicatorKind::BehavioralAnomaly),
        })
    }

    pub fn is_blocklisted(&self, ip: &str) -> bool {
        self.blocklist().contains(ip)
    }

    fn blocklist(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.blocklist.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl IndicatorExtractor for PatternExtractor {
    fn extract(&self, text: &str, tags: &[String]) -> Vec<Indicator> {
        let mut indicators = Vec::new();
        let lower = text.to_lowercase();

        for term in SUSPICIOUS_TERMS {
            if lower.contains(term) {
                indicators.push(Indicator::keyword(*term, self.keyword_weight));
            }
        }

        for (family, patterns) in &self.families {
            if patterns.iter().any(|p| p.is_match(text)) {
                indicators.push(Indicator::pattern(*family, self.pattern_weight));
            }
        }

        let blocklist = self.blocklist();
        let mut seen_ips = HashSet::new();
        for m in self.ipv4.find_iter(text) {
            let ip = m.as_str();
            if !seen_ips.insert(ip) {
                continue;
            }
            let weight = if blocklist.contains(ip) {
                self.ip_weight
            } else {
                self.ip_weight * 0.25
            };
            indicators.push(Indicator::ip_reputation(ip, weight));
        }

        for tag in tags {
            let tag = tag.trim();
            if !tag.is_empty() {
                indicators.push(Indicator::behavioral_anomaly(tag, self.anomaly_weight));
            }
        }

        indicators
    }

    fn update_reputation(&self, ips: &[String]) -> usize {
        let mut blocklist = self.blocklist.write().unwrap_or_else(|e| e.into_inner());
        ips.iter()
            .map(|ip| ip.trim())
            .filter(|ip| self.ipv4.find(ip).is_some_and(|m| m.as_str() == *ip))
            .filter(|ip| blocklist.insert(ip.to_string()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor(blocklist: &[&str]) -> PatternExtractor {
        let config = ScoringConfig {
            reputation_blocklist: blocklist.iter().map(|s| s.to_string()).collect(),
            ..ScoringConfig::default()
        };
        PatternExtractor::new(&config).unwrap()
    }

    fn find<'a>(indicators: &'a [Indicator], kind: IndicatorKind, value: &str) -> Option<&'a Indicator> {
        indicators.iter().find(|i| i.kind == kind && i.value == value)
    }

    #[test]
    fn test_sql_injection_and_blocklisted_ip() {
        let text = "GET /items?id=1 UNION SELECT password FROM users from 203.0.113.7";
        let indicators = extractor(&["203.0.113.7"]).extract(text, &[]);

        let pattern = find(&indicators, IndicatorKind::Pattern, "sql_injection").unwrap();
        assert_eq!(pattern.weight, 0.9);
        let ip = find(&indicators, IndicatorKind::IpReputation, "203.0.113.7").unwrap();
        assert_eq!(ip.weight, 1.2);
    }

    #[test]
    fn test_unknown_ip_gets_reduced_weight() {
        let indicators = extractor(&[]).extract("login from 198.51.100.23", &[]);
        let ip = find(&indicators, IndicatorKind::IpReputation, "198.51.100.23").unwrap();
        assert!((ip.weight - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_reputation_update_applies_to_later_reports() {
        let extractor = extractor(&["203.0.113.7"]);
        let before = extractor.extract("login from 198.51.100.23", &[]);
        let ip = find(&before, IndicatorKind::IpReputation, "198.51.100.23").unwrap();
        assert!((ip.weight - 0.3).abs() < 1e-12);

        let feed = vec![
            "198.51.100.23".to_string(),
            " 203.0.113.7 ".to_string(),
            "not-an-ip".to_string(),
        ];
        assert_eq!(extractor.update_reputation(&feed), 1);
        assert!(extractor.is_blocklisted("198.51.100.23"));
        assert!(!extractor.is_blocklisted("not-an-ip"));

        let after = extractor.extract("login from 198.51.100.23", &[]);
        let ip = find(&after, IndicatorKind::IpReputation, "198.51.100.23").unwrap();
        assert_eq!(ip.weight, 1.2);
    }

    #[test]
    fn test_keywords_and_activity() {
        let text = "Ransomware dropped after privilege escalation via a rootkit";
        let indicators = extractor(&[]).extract(text, &[]);
        assert!(find(&indicators, IndicatorKind::Keyword, "ransomware").is_some());
        assert!(find(&indicators, IndicatorKind::Keyword, "rootkit").is_some());
        assert!(find(&indicators, IndicatorKind::Pattern, "suspicious_activity").is_some());
    }

    #[test]
    fn test_xss_and_command_injection() {
        let xss = extractor(&[]).extract("<script>alert(document.cookie)</script>", &[]);
        assert!(find(&xss, IndicatorKind::Pattern, "xss").is_some());

        let cmd = extractor(&[]).extract("name=x; cat /etc/passwd", &[]);
        assert!(find(&cmd, IndicatorKind::Pattern, "command_injection").is_some());
    }

    #[test]
    fn test_behavioral_tags() {
        let tags = vec!["off_hours_access".to_string(), "  ".to_string()];
        let indicators = extractor(&[]).extract("routine report", &tags);
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].kind, IndicatorKind::BehavioralAnomaly);
        assert_eq!(indicators[0].weight, 0.8);
    }

    #[test]
    fn test_benign_text_yields_nothing() {
        assert!(extractor(&[]).extract("Quarterly backup completed successfully", &[]).is_empty());
    }

    #[test]
    fn test_invalid_ip_octets_ignored() {
        let indicators = extractor(&[]).extract("version 999.1.2.3 released", &[]);
        assert!(indicators.iter().all(|i| i.kind != IndicatorKind::IpReputation));
    }
}
