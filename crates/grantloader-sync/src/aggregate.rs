//! Folds flat records into one grant per natural key, and the per-record passes used by the
//! person-only and funder-only modes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use grantloader_core::{
    fields, grant_local_key, parse_timestamp, record_value, AwardStatus, Grant, InvestigatorRole,
    Record, RepoId,
};
use tracing::{debug, warn};

use crate::batch::BatchContext;
use crate::reconcile::EntityReconciler;
use crate::SyncError;

/// Rolls a last-updated field into the batch watermark. Unparsable values abort the run.
fn observe_timestamp(
    ctx: &mut BatchContext,
    record: &Record,
    field: &'static str,
) -> Result<(), SyncError> {
    if let Some(raw) = record_value(record, field) {
        ctx.watermark
            .observe(raw)
            .map_err(|source| SyncError::DataFormat { field, source })?;
    }
    Ok(())
}

/// Grant dates are informational; a bad one is dropped rather than failing the record.
fn grant_date(record: &Record, field: &str) -> Option<DateTime<Utc>> {
    let raw = record_value(record, field)?;
    match parse_timestamp(raw) {
        Ok(instant) => Some(instant),
        Err(err) => {
            warn!(field, %err, "leaving grant date unset");
            None
        }
    }
}

fn award_status(record: &Record) -> AwardStatus {
    let Some(raw) = record_value(record, fields::GRANT_AWARD_STATUS) else {
        return AwardStatus::Unknown;
    };
    let status = AwardStatus::parse(raw);
    if status.is_unknown() {
        warn!(status = raw, "unrecognized award status");
    }
    status
}

async fn init_grant(
    reconciler: &EntityReconciler<'_>,
    key: &str,
    record: &Record,
    ctx: &mut BatchContext,
) -> Result<Grant, SyncError> {
    let direct_funder = match record_value(record, fields::DIRECT_FUNDER_LOCAL_KEY) {
        Some(funder_key) => {
            reconciler
                .resolve_funder(
                    funder_key,
                    record_value(record, fields::DIRECT_FUNDER_NAME),
                    record_value(record, fields::DIRECT_FUNDER_POLICY),
                    ctx,
                )
                .await?
        }
        None => {
            warn!(grant = key, "grant has no direct funder");
            None
        }
    };
    let primary_funder = match record_value(record, fields::PRIMARY_FUNDER_LOCAL_KEY) {
        Some(funder_key) => {
            reconciler
                .resolve_funder(
                    funder_key,
                    record_value(record, fields::PRIMARY_FUNDER_NAME),
                    record_value(record, fields::PRIMARY_FUNDER_POLICY),
                    ctx,
                )
                .await?
        }
        None => direct_funder.clone(),
    };

    Ok(Grant {
        id: None,
        local_key: Some(grant_local_key(reconciler.domain(), key)),
        award_number: record_value(record, fields::GRANT_AWARD_NUMBER).map(str::to_string),
        award_status: award_status(record),
        project_name: record_value(record, fields::GRANT_PROJECT_NAME).map(str::to_string),
        award_date: grant_date(record, fields::GRANT_AWARD_DATE),
        start_date: grant_date(record, fields::GRANT_START_DATE),
        end_date: grant_date(record, fields::GRANT_END_DATE),
        direct_funder,
        primary_funder,
        pi: None,
        co_pis: Vec::new(),
    })
}

fn assign_investigator(
    grant: &mut Grant,
    role: InvestigatorRole,
    person: RepoId,
    ctx: &mut BatchContext,
) {
    match role {
        InvestigatorRole::Primary => {
            if grant.assign_pi(person) {
                ctx.stats.pi_assignments += 1;
            }
        }
        InvestigatorRole::Secondary => {
            if grant.add_co_pi(person) {
                ctx.stats.co_pi_assignments += 1;
            }
        }
        InvestigatorRole::Unknown => {}
    }
}

/// One grant per distinct natural key, in first-seen order, with funders and investigators
/// resolved. Records are processed in batch order, so the first primary row wins the PI slot.
pub async fn aggregate_grants(
    reconciler: &EntityReconciler<'_>,
    records: &[Record],
    ctx: &mut BatchContext,
) -> Result<Vec<Grant>, SyncError> {
    let mut grants: Vec<Grant> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        observe_timestamp(ctx, record, fields::GRANT_UPDATE_TIMESTAMP)?;
        observe_timestamp(ctx, record, fields::USER_UPDATE_TIMESTAMP)?;

        let Some(key) = record_value(record, fields::GRANT_LOCAL_KEY) else {
            warn!("record has no grant number; skipping");
            continue;
        };
        let position = match index.get(key) {
            Some(position) => *position,
            None => {
                let grant = init_grant(reconciler, key, record, ctx).await?;
                grants.push(grant);
                index.insert(key.to_string(), grants.len() - 1);
                grants.len() - 1
            }
        };

        let role = record_value(record, fields::ABBREVIATED_ROLE)
            .map(InvestigatorRole::parse)
            .unwrap_or(InvestigatorRole::Unknown);
        match role {
            InvestigatorRole::Unknown => {
                warn!(
                    grant = key,
                    role = record_value(record, fields::ABBREVIATED_ROLE),
                    "unrecognized investigator role"
                );
                continue;
            }
            InvestigatorRole::Primary if grants[position].pi.is_some() => {
                debug!(grant = key, "PI already assigned; later primary row ignored");
                continue;
            }
            _ => {}
        }

        if let Some(person) = reconciler.resolve_person(record, ctx).await? {
            assign_investigator(&mut grants[position], role, person, ctx);
        }
    }
    Ok(grants)
}

/// Person-only pass: one reconciliation per distinct person.
pub async fn sync_users(
    reconciler: &EntityReconciler<'_>,
    records: &[Record],
    ctx: &mut BatchContext,
) -> Result<(), SyncError> {
    for record in records {
        observe_timestamp(ctx, record, fields::USER_UPDATE_TIMESTAMP)?;
        reconciler.resolve_person(record, ctx).await?;
    }
    Ok(())
}

/// Funder-only pass over a key/policy feed. Each row may describe a direct and a primary
/// funder.
pub async fn sync_funders(
    reconciler: &EntityReconciler<'_>,
    records: &[Record],
    ctx: &mut BatchContext,
) -> Result<(), SyncError> {
    let columns = [
        (
            fields::DIRECT_FUNDER_LOCAL_KEY,
            fields::DIRECT_FUNDER_NAME,
            fields::DIRECT_FUNDER_POLICY,
        ),
        (
            fields::PRIMARY_FUNDER_LOCAL_KEY,
            fields::PRIMARY_FUNDER_NAME,
            fields::PRIMARY_FUNDER_POLICY,
        ),
    ];
    for record in records {
        for (key_field, name_field, policy_field) in columns {
            if let Some(key) = record_value(record, key_field) {
                reconciler
                    .resolve_funder(
                        key,
                        record_value(record, name_field),
                        record_value(record, policy_field),
                        ctx,
                    )
                    .await?;
            }
        }
    }
    Ok(())
}
