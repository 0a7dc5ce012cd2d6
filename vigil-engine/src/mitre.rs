//! MITRE ATT&CK technique tagging and response recommendations.
//!
//! A read-only projection over an incident: every keyword, pattern, and
//! behavioural tag correlated into it is matched against a fixed table of
//! technique hints, and the incident's peak level picks the baseline
//! response checklist.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vigil_core::{Incident, Indicator, IndicatorKind, ThreatLevel};

/// Lowercase fragments of an indicator value and the techniques they suggest.
const TECHNIQUE_HINTS: &[(&str, &[&str])] = &[
    ("powershell", &["T1059.001"]),
    ("cmd", &["T1059.003"]),
    ("command_injection", &["T1059"]),
    ("sql_injection", &["T1190"]),
    ("xss", &["T1189"]),
    ("process_injection", &["T1055"]),
    ("discovery", &["T1083"]),
    ("lateral", &["T1021"]),
    ("persistence", &["T1053", "T1547"]),
    ("backdoor", &["T1547"]),
    ("privilege", &["T1068", "T1055"]),
    ("credential", &["T1003", "T1110"]),
    ("brute", &["T1110"]),
    ("exfiltration", &["T1041", "T1567"]),
    ("phishing", &["T1566"]),
    ("keylogger", &["T1056.001"]),
    ("ransomware", &["T1486"]),
];

const CRITICAL_RESPONSE: &[&str] = &[
    "Isolate the affected systems immediately",
    "Activate the incident response procedure",
    "Notify the security response team",
    "Run a full forensic analysis",
];

const ELEVATED_RESPONSE: &[&str] = &[
    "Put the entity under heightened surveillance",
    "Review the security logs for the entity",
    "Examine suspicious network connections",
    "Update detection signatures",
];

const MODERATE_RESPONSE: &[&str] = &[
    "Monitor how the indicators evolve",
    "Verify the security configuration",
    "Raise user awareness of the observed activity",
];

/// Technique-specific follow-ups, keyed by technique id prefix.
const TECHNIQUE_RESPONSE: &[(&str, &str)] = &[
    ("T1059", "Monitor suspicious script execution"),
    ("T1055", "Enable process injection monitoring"),
    ("T1083", "Monitor system file access"),
    ("T1110", "Enforce account lockout and review authentication failures"),
];

/// Techniques suggested by one indicator. IP reputation hits carry no
/// technique.
pub fn techniques_for(indicator: &Indicator) -> Vec<&'static str> {
    if indicator.kind == IndicatorKind::IpReputation {
        return Vec::new();
    }
    let value = indicator.value.to_lowercase();
    TECHNIQUE_HINTS
        .iter()
        .filter(|(fragment, _)| value.contains(fragment))
        .flat_map(|(_, techniques)| techniques.iter().copied())
        .collect()
}

/// Baseline checklist for `level` followed by one line per matched technique
/// family.
pub fn recommendations(level: ThreatLevel, techniques: &BTreeSet<String>) -> Vec<String> {
    let baseline = match level {
        ThreatLevel::Catastrophic | ThreatLevel::Critical => CRITICAL_RESPONSE,
        ThreatLevel::High => ELEVATED_RESPONSE,
        ThreatLevel::Medium => MODERATE_RESPONSE,
        ThreatLevel::Low => &[],
    };
    let mut lines: Vec<String> = baseline.iter().map(|line| line.to_string()).collect();
    for (prefix, line) in TECHNIQUE_RESPONSE {
        if techniques.iter().any(|t| t.starts_with(prefix)) {
            lines.push(line.to_string());
        }
    }
    lines
}

/// ATT&CK view of one incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentAssessment {
    pub incident_id: Uuid,
    pub entity_key: String,
    pub peak_level: ThreatLevel,
    pub techniques: BTreeSet<String>,
    pub recommendations: Vec<String>,
}

pub fn assess(incident: &Incident) -> IncidentAssessment {
    let techniques: BTreeSet<String> = incident
        .observations
        .iter()
        .flat_map(|o| o.indicators.iter())
        .flat_map(techniques_for)
        .map(str::to_string)
        .collect();
    let recommendations = recommendations(incident.peak_level, &techniques);
    IncidentAssessment {
        incident_id: incident.id,
        entity_key: incident.entity_key.clone(),
        peak_level: incident.peak_level,
        techniques,
        recommendations,
    }
}
