use crate::config::{Config, PlatformCredentials, UpdateMode};
use crate::session::{FileSessionStore, SessionStore};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub subject: String,
    pub message: String,
}

impl Finding {
    fn new(severity: Severity, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Static checks over the configuration plus the persisted sessions that
/// unattended reconnects depend on.
pub async fn diagnose(config: &Config, sessions: &dyn SessionStore) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Err(e) = config.validate() {
        findings.push(Finding::new(Severity::Error, "config", e.to_string()));
    }
    if config.accounts.is_empty() {
        findings.push(Finding::new(Severity::Warn, "config", "no accounts configured"));
    }

    for account in &config.accounts {
        let subject = format!("{} ({})", account.id, account.platform());
        if !account.enabled {
            findings.push(Finding::new(Severity::Ok, subject, "disabled"));
            continue;
        }
        let before = findings.len();
        match &account.platform {
            PlatformCredentials::WhatsappWeb(_) => findings.push(Finding::new(
                Severity::Warn,
                &subject,
                "needs a WhatsApp Web driver from the embedding application",
            )),
            PlatformCredentials::WhatsappBusiness(c) => {
                if c.app_secret.is_none() {
                    findings.push(Finding::new(
                        Severity::Warn,
                        &subject,
                        "no app_secret: webhook signatures are not checked",
                    ));
                }
            }
            PlatformCredentials::TelegramBot(c) => {
                if c.mode == UpdateMode::Webhook && c.webhook_secret.is_none() {
                    findings.push(Finding::new(
                        Severity::Warn,
                        &subject,
                        "webhook mode without webhook_secret accepts any caller",
                    ));
                }
            }
            PlatformCredentials::TelegramUser(_) => {
                findings.push(Finding::new(
                    Severity::Warn,
                    &subject,
                    "needs an MTProto driver from the embedding application",
                ));
                match sessions.load(&account.id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => findings.push(Finding::new(
                        Severity::Warn,
                        &subject,
                        "no saved session; first connect needs interactive login",
                    )),
                    Err(e) => findings.push(Finding::new(Severity::Error, &subject, format!("{e:#}"))),
                }
            }
            PlatformCredentials::Email(c) => {
                if !c.smtp_tls {
                    findings.push(Finding::new(Severity::Warn, &subject, "SMTP without TLS"));
                }
            }
        }
        if findings.len() == before {
            findings.push(Finding::new(Severity::Ok, subject, "ok"));
        }
    }
    findings
}

pub async fn run(config: &Config) -> Result<()> {
    let sessions = FileSessionStore::new(config.sessions_dir());
    let findings = diagnose(config, &sessions).await;

    println!("🩺 channelbridge doctor");
    println!("  Config: {}", config.config_path.display());
    for finding in &findings {
        let icon = match finding.severity {
            Severity::Ok => "✅",
            Severity::Warn => "⚠️ ",
            Severity::Error => "❌",
        };
        println!("  {icon} {}: {}", finding.subject, finding.message);
    }

    let errors = findings.iter().filter(|f| f.severity == Severity::Error).count();
    if errors > 0 {
        anyhow::bail!("{errors} problem(s) found");
    }
    Ok(())
}
