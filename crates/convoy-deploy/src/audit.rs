//! Security audit
//!
//! Scans the active environment configuration for the classic production
//! foot-guns: weak or default secrets, plain-text credentials in service
//! env maps, missing TLS enforcement, permissive CORS, and debug left on.

use chrono::{DateTime, Utc};
use convoy_core::{Environment, PlatformConfig};
use serde::Serialize;
use thiserror::Error;

/// Audit could not complete
#[derive(Debug, Error)]
#[error("security audit failed: {0}")]
pub struct AuditError(pub String);

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// One audit finding
#[derive(Debug, Clone, Serialize)]
pub struct AuditFinding {
    pub severity: AuditSeverity,
    /// What the finding is about (variable, service, setting)
    pub subject: String,
    pub message: String,
}

/// Scored audit outcome
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    /// 100 minus severity-weighted deductions, floored at 0
    pub score: u8,
    pub passed: bool,
    pub findings: Vec<AuditFinding>,
    pub audited_at: DateTime<Utc>,
}

const WEAK_SECRETS: &[&str] = &[
    "secret",
    "changeme",
    "password",
    "development-secret",
    "test-secret",
];

/// Audit a configuration snapshot
pub fn audit_config(config: &PlatformConfig) -> Result<AuditReport, AuditError> {
    let production = config.environment == Environment::Production;
    let mut findings = Vec::new();

    // signing secret strength
    let secret = config.jwt_secret.trim();
    if WEAK_SECRETS.contains(&secret.to_lowercase().as_str()) {
        findings.push(AuditFinding {
            severity: if production { AuditSeverity::Critical } else { AuditSeverity::Medium },
            subject: "JWT_SECRET".into(),
            message: "signing secret is a well-known default".into(),
        });
    } else if secret.len() < 16 {
        findings.push(AuditFinding {
            severity: if production { AuditSeverity::High } else { AuditSeverity::Low },
            subject: "JWT_SECRET".into(),
            message: format!("signing secret is only {} characters", secret.len()),
        });
    }

    // plain-text credentials in service env overrides
    let secret_key = regex::Regex::new(r"(?i)(password|secret|token|api[_-]?key)")
        .map_err(|e| AuditError(e.to_string()))?;
    for (service, env) in &config.service_env_overrides {
        for (key, value) in env {
            let is_reference = value.starts_with("${") || value.starts_with("vault:");
            if secret_key.is_match(key) && !value.is_empty() && !is_reference {
                findings.push(AuditFinding {
                    severity: AuditSeverity::High,
                    subject: format!("{service}/{key}"),
                    message: "plain-text secret in service environment".into(),
                });
            }
        }
    }

    if production {
        if !config.force_ssl {
            findings.push(AuditFinding {
                severity: AuditSeverity::High,
                subject: "FORCE_SSL".into(),
                message: "TLS is not enforced in production".into(),
            });
        }
        if config.cors_allow_all {
            findings.push(AuditFinding {
                severity: AuditSeverity::Medium,
                subject: "CORS_ALLOW_ALL".into(),
                message: "permissive CORS in production".into(),
            });
        }
        if config.debug {
            findings.push(AuditFinding {
                severity: AuditSeverity::Medium,
                subject: "DEBUG".into(),
                message: "debug diagnostics enabled in production".into(),
            });
        }
    }

    let deduction: u32 = findings
        .iter()
        .map(|f| match f.severity {
            AuditSeverity::Low => 5u32,
            AuditSeverity::Medium => 10,
            AuditSeverity::High => 20,
            AuditSeverity::Critical => 40,
        })
        .sum();
    let score = 100u32.saturating_sub(deduction) as u8;
    let passed = !findings
        .iter()
        .any(|f| f.severity >= AuditSeverity::High);

    Ok(AuditReport {
        score,
        passed,
        findings,
        audited_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::MapSecrets;

    fn production_config(extra: &[(&str, &str)]) -> PlatformConfig {
        let mut pairs = vec![
            ("DATABASE_URL", "postgres://convoy:pw@db.internal:5432/convoy"),
            ("REDIS_URL", "redis://cache.internal:6379"),
            ("JWT_SECRET", "a-long-and-random-signing-secret"),
        ];
        pairs.extend_from_slice(extra);
        PlatformConfig::load(Environment::Production, &MapSecrets::new(&pairs)).unwrap()
    }

    #[test]
    fn test_clean_production_config_passes() {
        let mut config = production_config(&[]);
        config.force_ssl = true;
        config.ssl_cert_path = Some("/etc/ssl/convoy.crt".into());
        config.ssl_key_path = Some("/etc/ssl/convoy.key".into());
        let report = audit_config(&config).unwrap();
        assert!(report.passed, "findings: {:?}", report.findings);
        assert!(report.score >= 90);
    }

    #[test]
    fn test_default_secret_is_critical_in_production() {
        let mut config = production_config(&[]);
        config.jwt_secret = "changeme".into();
        let report = audit_config(&config).unwrap();
        assert!(!report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == AuditSeverity::Critical && f.subject == "JWT_SECRET"));
    }

    #[test]
    fn test_missing_tls_flagged() {
        let config = production_config(&[]);
        let report = audit_config(&config).unwrap();
        assert!(report
            .findings
            .iter()
            .any(|f| f.subject == "FORCE_SSL" && f.severity == AuditSeverity::High));
    }

    #[test]
    fn test_plaintext_service_secret_flagged() {
        let mut config = production_config(&[]);
        config.force_ssl = true;
        config
            .service_env_overrides
            .entry("tokens".into())
            .or_default()
            .insert("STRIPE_API_KEY".into(), "sk_live_abc123".into());
        let report = audit_config(&config).unwrap();
        assert!(!report.passed);
        assert!(report.findings.iter().any(|f| f.subject == "tokens/STRIPE_API_KEY"));
    }

    #[test]
    fn test_development_defaults_are_tolerated() {
        let config =
            PlatformConfig::load(Environment::Development, &MapSecrets::default()).unwrap();
        let report = audit_config(&config).unwrap();
        // known-default secret is only medium outside production
        assert!(report.findings.iter().all(|f| f.severity < AuditSeverity::High));
    }
}
