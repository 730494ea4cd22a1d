//! Grant reconciliation engine and the run pipeline around it.
//!
//! [`reconcile`] folds one record batch into Funder / Person / Grant writes against the
//! repository. [`SyncPipeline`] wraps it with configuration, the source connector, reports,
//! watermark persistence and the completion hook.

use std::fmt;
use std::fs as std_fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use grantloader_adapters::SourceConnector;
use grantloader_core::{EntityKind, RepoId, SourceProfile, TimestampError};
use grantloader_storage::{
    DirectoryError, DirectoryLookup, HttpClientConfig, HttpDirectoryLookup, HttpRepository,
    NoDirectory, RepositoryClient, RepositoryError, WatermarkFile,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub mod aggregate;
pub mod batch;
pub mod policy;
pub mod reconcile;

pub use batch::{BatchContext, DedupCache, EntityCounts, Outcome, Statistics, Watermark};
pub use policy::{policy_for, MergePolicy, PartialPolicy, SourceField, StrictPolicy};
pub use reconcile::{
    first_match, reconcile, EntityReconciler, ReconcileOutcome, SyncServices, WritePolicy,
};

pub const CRATE_NAME: &str = "grantloader-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("repository unavailable: {0}")]
    Connectivity(#[from] RepositoryError),
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("malformed {field}: {source}")]
    DataFormat {
        field: &'static str,
        source: TimestampError,
    },
    #[error("{kind} {id} was found by lookup but could not be loaded: {source}")]
    Integrity {
        kind: EntityKind,
        id: RepoId,
        source: RepositoryError,
    },
}

/// Which entities a run reconciles and whether unknown ones may be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    Grant,
    ExistingGrant,
    User,
    ExistingUser,
    Funder,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Grant => "grant",
            SyncMode::ExistingGrant => "existing-grant",
            SyncMode::User => "user",
            SyncMode::ExistingUser => "existing-user",
            SyncMode::Funder => "funder",
        }
    }

    pub fn write_policy(self) -> WritePolicy {
        match self {
            SyncMode::ExistingGrant | SyncMode::ExistingUser => WritePolicy::UpdateOnly,
            SyncMode::Grant | SyncMode::User | SyncMode::Funder => WritePolicy::CreateOrUpdate,
        }
    }

    /// Property name under which this mode's watermark is persisted.
    pub fn watermark_key(self) -> String {
        format!("{}.last.updated", self.as_str())
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grant" => Ok(SyncMode::Grant),
            "existing-grant" => Ok(SyncMode::ExistingGrant),
            "user" => Ok(SyncMode::User),
            "existing-user" => Ok(SyncMode::ExistingUser),
            "funder" => Ok(SyncMode::Funder),
            other => Err(format!(
                "unknown sync mode {other:?}; expected grant, existing-grant, user, existing-user or funder"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub repository_url: String,
    pub repository_user: Option<String>,
    pub repository_password: Option<String>,
    pub directory_url: Option<String>,
    pub domain: String,
    pub profile: SourceProfile,
    pub watermark_file: PathBuf,
    pub reports_dir: PathBuf,
    pub mail_spool_dir: Option<PathBuf>,
    pub mail_recipient: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            repository_url: "http://localhost:8080".to_string(),
            repository_user: None,
            repository_password: None,
            directory_url: None,
            domain: "johnshopkins.edu".to_string(),
            profile: SourceProfile::Coeus,
            watermark_file: PathBuf::from("./grantloader.properties"),
            reports_dir: PathBuf::from("./reports"),
            mail_spool_dir: None,
            mail_recipient: None,
            http_timeout_secs: 30,
            user_agent: "grantloader/0.1".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::default().apply_env()
    }

    /// Reads a YAML file; keys it leaves out keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std_fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Overrides fields from `GRANTLOADER_*` environment variables.
    pub fn apply_env(self) -> Result<Self, SyncError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SyncError> {
        let var = |name: &str| lookup(&format!("GRANTLOADER_{name}")).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("REPOSITORY_URL") {
            self.repository_url = v;
        }
        if let Some(v) = var("REPOSITORY_USER") {
            self.repository_user = Some(v);
        }
        if let Some(v) = var("REPOSITORY_PASSWORD") {
            self.repository_password = Some(v);
        }
        if let Some(v) = var("DIRECTORY_URL") {
            self.directory_url = Some(v);
        }
        if let Some(v) = var("DOMAIN") {
            self.domain = v;
        }
        if let Some(v) = var("PROFILE") {
            self.profile = v.parse().map_err(SyncError::Configuration)?;
        }
        if let Some(v) = var("WATERMARK_FILE") {
            self.watermark_file = PathBuf::from(v);
        }
        if let Some(v) = var("REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = var("MAIL_SPOOL_DIR") {
            self.mail_spool_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("MAIL_RECIPIENT") {
            self.mail_recipient = Some(v);
        }
        if let Some(v) = var("HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v.trim().parse().map_err(|_| {
                SyncError::Configuration(format!("GRANTLOADER_HTTP_TIMEOUT_SECS={v:?} is not a number"))
            })?;
        }
        if let Some(v) = var("USER_AGENT") {
            self.user_agent = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        fn check_url(name: &str, url: &str) -> Result<(), SyncError> {
            if url.starts_with("http://") || url.starts_with("https://") {
                Ok(())
            } else {
                Err(SyncError::Configuration(format!(
                    "{name} must be an http(s) url, got {url:?}"
                )))
            }
        }

        check_url("repository url", &self.repository_url)?;
        if let Some(url) = &self.directory_url {
            check_url("directory url", url)?;
        }
        if self.domain.trim().is_empty() {
            return Err(SyncError::Configuration("domain must not be empty".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(SyncError::Configuration(
                "http timeout must be at least one second".into(),
            ));
        }
        Ok(())
    }

    fn http_config(&self, base_url: &str) -> HttpClientConfig {
        HttpClientConfig {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            username: self.repository_user.clone(),
            password: self.repository_password.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start_bound: Option<String>,
    pub statistics: Statistics,
    pub watermark: Option<String>,
    pub reports_dir: String,
}

/// Called once after a successful run.
pub trait CompletionHook: Send + Sync {
    fn on_complete(&self, summary: &SyncRunSummary, report: &str) -> Result<()>;
}

#[derive(Default)]
pub struct NoopCompletionHook;

impl CompletionHook for NoopCompletionHook {
    fn on_complete(&self, _summary: &SyncRunSummary, _report: &str) -> Result<()> {
        Ok(())
    }
}

/// Drops the run report as an RFC 5322 message into a spool directory picked up by the
/// system mailer.
#[derive(Debug, Clone)]
pub struct MailSpoolNotifier {
    spool_dir: PathBuf,
    recipient: String,
    sender: String,
}

impl MailSpoolNotifier {
    pub fn new(spool_dir: impl Into<PathBuf>, recipient: impl Into<String>) -> Self {
        Self {
            spool_dir: spool_dir.into(),
            recipient: recipient.into(),
            sender: "grantloader@localhost".to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        let spool_dir = config.mail_spool_dir.clone().ok_or_else(|| {
            SyncError::Configuration("email requested but GRANTLOADER_MAIL_SPOOL_DIR is not set".into())
        })?;
        let recipient = config.mail_recipient.clone().ok_or_else(|| {
            SyncError::Configuration("email requested but GRANTLOADER_MAIL_RECIPIENT is not set".into())
        })?;
        Ok(Self::new(spool_dir, recipient).with_sender(format!("grantloader@{}", config.domain)))
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    fn render(&self, summary: &SyncRunSummary, report: &str) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {} load finished ({})\r\nDate: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            self.sender,
            self.recipient,
            summary.mode,
            summary.source_id,
            summary.finished_at.to_rfc2822(),
            report.replace('\n', "\r\n"),
        )
    }
}

impl CompletionHook for MailSpoolNotifier {
    fn on_complete(&self, summary: &SyncRunSummary, report: &str) -> Result<()> {
        std_fs::create_dir_all(&self.spool_dir)
            .with_context(|| format!("creating {}", self.spool_dir.display()))?;
        let path = self.spool_dir.join(format!("{}.eml", summary.run_id));
        std_fs::write(&path, self.render(summary, report))
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), to = %self.recipient, "queued completion mail");
        Ok(())
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    repository: Arc<dyn RepositoryClient>,
    directory: Arc<dyn DirectoryLookup>,
    watermarks: WatermarkFile,
    hook: Box<dyn CompletionHook>,
    persist_watermark: bool,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let repository = HttpRepository::new(config.http_config(&config.repository_url))?;
        let directory: Arc<dyn DirectoryLookup> = match &config.directory_url {
            Some(url) => Arc::new(HttpDirectoryLookup::new(config.http_config(url))?),
            None => Arc::new(NoDirectory),
        };
        Ok(Self::with_clients(config, Arc::new(repository), directory))
    }

    pub fn with_clients(
        config: SyncConfig,
        repository: Arc<dyn RepositoryClient>,
        directory: Arc<dyn DirectoryLookup>,
    ) -> Self {
        let watermarks = WatermarkFile::new(config.watermark_file.clone());
        Self {
            config,
            repository,
            directory,
            watermarks,
            hook: Box::<NoopCompletionHook>::default(),
            persist_watermark: true,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn CompletionHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Runs still write reports but leave the stored watermark alone.
    pub fn without_watermark_persistence(mut self) -> Self {
        self.persist_watermark = false;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn stored_watermark(&self, mode: SyncMode) -> Result<Option<String>> {
        self.watermarks.read(&mode.watermark_key()).await
    }

    /// Retrieves one batch, reconciles it, then writes reports, the watermark and notifies.
    /// Nothing after reconciliation happens if reconciliation fails.
    pub async fn run_once(
        &self,
        mode: SyncMode,
        connector: &dyn SourceConnector,
        start: Option<String>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let start_bound = match start {
            Some(start) => Some(start),
            None => self.stored_watermark(mode).await?,
        };
        info!(
            %run_id,
            %mode,
            source = connector.source_id(),
            start = start_bound.as_deref().unwrap_or("(none)"),
            "starting sync run"
        );

        let records = connector
            .retrieve(start_bound.as_deref())
            .await
            .with_context(|| format!("retrieving records from {}", connector.source_id()))?;

        let policy = policy_for(self.config.profile, mode);
        let services = SyncServices {
            repository: self.repository.as_ref(),
            directory: self.directory.as_ref(),
            policy: policy.as_ref(),
            domain: &self.config.domain,
        };
        let outcome = reconcile(services, &records, mode)
            .await
            .with_context(|| format!("{mode} run {run_id} aborted"))?;

        let report = outcome.stats.report(mode);
        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let summary = SyncRunSummary {
            run_id,
            mode,
            source_id: connector.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            start_bound,
            statistics: outcome.stats.clone(),
            watermark: outcome.watermark.clone(),
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary, &report, &outcome)
            .await?;

        match (&outcome.watermark, self.persist_watermark) {
            (Some(watermark), true) => {
                self.watermarks
                    .write(&mode.watermark_key(), watermark)
                    .await?;
            }
            (Some(_), false) => info!("watermark persistence disabled for this run"),
            (None, _) => warn!(%mode, "batch carried no timestamps; stored watermark unchanged"),
        }

        self.hook.on_complete(&summary, &report)?;
        Ok(summary)
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &SyncRunSummary,
        report: &str,
        outcome: &ReconcileOutcome,
    ) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        fs::write(reports_dir.join("report.txt"), report)
            .await
            .context("writing report.txt")?;

        let summary_json =
            serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("summary.json"), summary_json)
            .await
            .context("writing summary.json")?;

        let grants_json =
            serde_json::to_vec_pretty(&outcome.grants).context("serializing grants")?;
        fs::write(reports_dir.join("grants.json"), grants_json)
            .await
            .context("writing grants.json")?;
        Ok(())
    }
}

/// Markdown digest of the most recent `runs` report directories, newest first.
pub fn recent_reports(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std_fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Grant Loader Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("summary.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std_fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let field = |name: &str| {
            summary
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or("(none)")
                .to_string()
        };

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!("- mode: {}", field("mode")));
        lines.push(format!("- source: {}", field("source_id")));
        lines.push(format!("- finished: {}", field("finished_at")));
        lines.push(format!("- watermark: {}", field("watermark")));
        let report_path = dir.path().join("report.txt");
        if let Ok(report) = std_fs::read_to_string(&report_path) {
            lines.push(String::new());
            lines.extend(report.lines().map(|l| format!("    {l}")));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn modes_parse_and_name_their_watermarks() {
        for mode in [
            SyncMode::Grant,
            SyncMode::ExistingGrant,
            SyncMode::User,
            SyncMode::ExistingUser,
            SyncMode::Funder,
        ] {
            assert_eq!(mode.as_str().parse::<SyncMode>(), Ok(mode));
        }
        assert_eq!(SyncMode::ExistingUser.watermark_key(), "existing-user.last.updated");
        assert_eq!(SyncMode::ExistingGrant.write_policy(), WritePolicy::UpdateOnly);
        assert_eq!(SyncMode::Funder.write_policy(), WritePolicy::CreateOrUpdate);
        assert!("grants".parse::<SyncMode>().is_err());
    }

    #[test]
    fn env_vars_override_defaults() {
        let vars: HashMap<&str, &str> = [
            ("GRANTLOADER_REPOSITORY_URL", "https://pass.example.edu/data"),
            ("GRANTLOADER_DOMAIN", "example.edu"),
            ("GRANTLOADER_PROFILE", "spreadsheet"),
            ("GRANTLOADER_HTTP_TIMEOUT_SECS", "5"),
            ("GRANTLOADER_MAIL_SPOOL_DIR", "   "),
        ]
        .into_iter()
        .collect();
        let config = SyncConfig::default()
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.repository_url, "https://pass.example.edu/data");
        assert_eq!(config.domain, "example.edu");
        assert_eq!(config.profile, SourceProfile::Spreadsheet);
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.mail_spool_dir, None);
        config.validate().unwrap();
    }

    #[test]
    fn bad_env_values_are_configuration_errors() {
        let err = SyncConfig::default()
            .apply_vars(|name| (name == "GRANTLOADER_PROFILE").then(|| "ldap".to_string()))
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        let err = SyncConfig::default()
            .apply_vars(|name| (name == "GRANTLOADER_HTTP_TIMEOUT_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn validation_rejects_bad_urls_and_empty_domain() {
        let config = SyncConfig {
            repository_url: "pass.example.edu".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let config = SyncConfig {
            domain: " ".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let config = SyncConfig {
            directory_url: Some("ldap://directory".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(SyncPipeline::new(config).is_err());
    }

    #[test]
    fn yaml_config_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grantloader.yaml");
        std_fs::write(
            &path,
            "repository_url: https://pass.example.edu\nprofile: spreadsheet\nreports_dir: /var/lib/grantloader/reports\n",
        )
        .unwrap();
        let config = SyncConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.repository_url, "https://pass.example.edu");
        assert_eq!(config.profile, SourceProfile::Spreadsheet);
        assert_eq!(config.reports_dir, PathBuf::from("/var/lib/grantloader/reports"));
        assert_eq!(config.domain, "johnshopkins.edu");
        assert_eq!(config.http_timeout_secs, 30);
    }

    #[test]
    fn mail_notifier_needs_spool_dir_and_recipient() {
        let config = SyncConfig::default();
        assert!(MailSpoolNotifier::from_config(&config).is_err());
        let config = SyncConfig {
            mail_spool_dir: Some("/tmp/spool".into()),
            mail_recipient: Some("grants-admin@example.edu".into()),
            ..Default::default()
        };
        assert!(MailSpoolNotifier::from_config(&config).is_ok());
    }
}
