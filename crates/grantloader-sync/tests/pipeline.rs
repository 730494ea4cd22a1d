use std::path::{Path, PathBuf};
use std::sync::Arc;

use grantloader_adapters::{connector_for_file, CsvConnector};
use grantloader_core::{EntityKind, SourceProfile};
use grantloader_storage::{InMemoryRepository, NoDirectory, WatermarkFile};
use grantloader_sync::{recent_reports, MailSpoolNotifier, SyncConfig, SyncMode, SyncPipeline};
use tempfile::TempDir;

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn config_in(dir: &TempDir, profile: SourceProfile) -> SyncConfig {
    SyncConfig {
        profile,
        domain: "jhu.edu".into(),
        watermark_file: dir.path().join("state/grantloader.properties"),
        reports_dir: dir.path().join("reports"),
        ..Default::default()
    }
}

#[tokio::test]
async fn coeus_batch_runs_end_to_end_and_resumes_from_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(InMemoryRepository::new());
    let pipeline = SyncPipeline::with_clients(
        config_in(&dir, SourceProfile::Coeus),
        repo.clone(),
        Arc::new(NoDirectory),
    );
    let connector = connector_for_file(
        workspace_root().join("fixtures/coeus/sample/batch.json"),
        SourceProfile::Coeus,
    );

    let first = pipeline
        .run_once(SyncMode::Grant, connector.as_ref(), None)
        .await
        .unwrap();
    assert_eq!(first.start_bound, None);
    assert_eq!(first.statistics.records_processed, 3);
    assert_eq!(first.statistics.grants.created, 2);
    assert_eq!(first.statistics.funders.created, 2);
    assert_eq!(first.statistics.persons.created, 2);
    assert_eq!(first.statistics.pi_assignments, 2);
    assert_eq!(first.statistics.co_pi_assignments, 1);
    assert_eq!(first.watermark.as_deref(), Some("2018-09-05 16:40:00.0"));

    let reports = PathBuf::from(&first.reports_dir);
    let report = std::fs::read_to_string(reports.join("report.txt")).unwrap();
    assert!(report.starts_with(
        "3 grant records processed; the most recent update in this batch has timestamp 2018-09-05 16:40:00.0"
    ));
    assert!(reports.join("summary.json").exists());
    let grants: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(reports.join("grants.json")).unwrap()).unwrap();
    assert_eq!(grants["jhu.edu:grant:130823"]["awardNumber"], "R01MH104125");
    assert_eq!(grants["jhu.edu:grant:131477"]["awardStatus"], "pre-award");

    let stored = WatermarkFile::new(dir.path().join("state/grantloader.properties"));
    assert_eq!(
        stored.read("grant.last.updated").await.unwrap().as_deref(),
        Some("2018-09-05 16:40:00.0")
    );
    assert_eq!(
        pipeline.stored_watermark(SyncMode::Grant).await.unwrap().as_deref(),
        Some("2018-09-05 16:40:00.0")
    );

    // Only the Co-PI row is at or after the stored bound; it matches what is stored.
    repo.clear_log().await;
    let second = pipeline
        .run_once(SyncMode::Grant, connector.as_ref(), None)
        .await
        .unwrap();
    assert_eq!(second.start_bound.as_deref(), Some("2018-09-05 16:40:00.0"));
    assert_eq!(second.statistics.records_processed, 1);
    assert_eq!(second.statistics.total_writes(), 0);
    assert!(repo.writes().await.is_empty());

    let digest = recent_reports(5, &dir.path().join("reports")).unwrap();
    assert!(digest.contains(&format!("## Run `{}`", first.run_id)));
    assert!(digest.contains(&format!("## Run `{}`", second.run_id)));
    assert!(digest.contains("- mode: grant"));
}

#[tokio::test]
async fn spreadsheet_run_without_timestamps_keeps_watermark_and_sends_mail() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(InMemoryRepository::new());
    let spool = dir.path().join("spool");
    let pipeline = SyncPipeline::with_clients(
        config_in(&dir, SourceProfile::Spreadsheet),
        repo.clone(),
        Arc::new(NoDirectory),
    )
    .with_hook(Box::new(MailSpoolNotifier::new(&spool, "grants-admin@example.edu")));
    let connector = CsvConnector::new(
        workspace_root().join("fixtures/spreadsheet/sample/grants.csv"),
        SourceProfile::Spreadsheet,
    );

    let summary = pipeline
        .run_once(SyncMode::Grant, &connector, None)
        .await
        .unwrap();
    assert_eq!(summary.source_id, "spreadsheet-csv");
    assert_eq!(summary.watermark, None);
    assert_eq!(summary.statistics.grants.created, 2);
    assert_eq!(summary.statistics.funders.created, 3);
    assert_eq!(summary.statistics.persons.created, 3);
    assert_eq!(repo.resources_of(EntityKind::Person).await.len(), 3);
    assert!(!dir.path().join("state/grantloader.properties").exists());

    let mail = std::fs::read_to_string(spool.join(format!("{}.eml", summary.run_id))).unwrap();
    assert!(mail.contains("To: grants-admin@example.edu\r\n"));
    assert!(mail.contains("Subject: grant load finished (spreadsheet-csv)"));
    assert!(mail.contains("2 Grants were created; 0 Grants were updated"));
}

#[tokio::test]
async fn failed_run_leaves_no_watermark_and_no_report() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("bad.json");
    std::fs::write(
        &input,
        r#"[{"GRANT_NUMBER": "1", "SPONSOR_CODE": "300865", "UPDATE_TIMESTAMP": "sometime in May"}]"#,
    )
    .unwrap();
    let pipeline = SyncPipeline::with_clients(
        config_in(&dir, SourceProfile::Coeus),
        Arc::new(InMemoryRepository::new()),
        Arc::new(NoDirectory),
    );
    let connector = connector_for_file(&input, SourceProfile::Coeus);

    let err = pipeline
        .run_once(SyncMode::Grant, connector.as_ref(), None)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("UPDATE_TIMESTAMP"));
    assert!(!dir.path().join("state/grantloader.properties").exists());
    assert!(!dir.path().join("reports").exists());
}
