//! Lookup → compare → merge → write, one entity at a time.

use std::collections::BTreeMap;
use std::future::Future;

use grantloader_core::{
    fields, funder_local_key, locator_id, record_value, EntityKind, Funder, Grant, IdentifierType,
    Person, PersonRole, Record, RepoId, Resource,
};
use grantloader_storage::{DirectoryLookup, RepositoryClient, RepositoryError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregate;
use crate::batch::{BatchContext, Outcome, Statistics};
use crate::policy::MergePolicy;
use crate::{SyncError, SyncMode};

/// Collaborators shared by every reconciliation step of one run.
#[derive(Clone, Copy)]
pub struct SyncServices<'a> {
    pub repository: &'a dyn RepositoryClient,
    pub directory: &'a dyn DirectoryLookup,
    pub policy: &'a dyn MergePolicy,
    /// Namespace prefix for local keys and locator ids.
    pub domain: &'a str,
}

/// Whether entities with no stored match may be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePolicy {
    CreateOrUpdate,
    /// Persons and grants without a stored match are skipped. Funders are still created.
    UpdateOnly,
}

/// Priority-ordered person identifier fields and the namespace each one lands in.
const PERSON_IDENTIFIERS: [(&str, IdentifierType); 3] = [
    (fields::USER_EMPLOYEE_ID, IdentifierType::EmployeeId),
    (fields::USER_INSTITUTION_ID, IdentifierType::UniqueId),
    (fields::USER_LOGIN, IdentifierType::Eppn),
];

/// Returns the id of the first candidate `lookup` finds, without querying the rest.
pub async fn first_match<'c, F, Fut, E>(
    candidates: &'c [String],
    mut lookup: F,
) -> Result<Option<RepoId>, E>
where
    F: FnMut(&'c str) -> Fut,
    Fut: Future<Output = Result<Option<RepoId>, E>>,
{
    for candidate in candidates {
        if let Some(id) = lookup(candidate.as_str()).await? {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

pub struct EntityReconciler<'a> {
    services: SyncServices<'a>,
    write: WritePolicy,
}

impl<'a> EntityReconciler<'a> {
    pub fn new(services: SyncServices<'a>, write: WritePolicy) -> Self {
        Self { services, write }
    }

    pub fn domain(&self) -> &'a str {
        self.services.domain
    }

    async fn find_existing(&self, source: &Resource) -> Result<Option<RepoId>, RepositoryError> {
        let repository = self.services.repository;
        match source {
            Resource::Funder(Funder {
                local_key: Some(key),
                ..
            }) => repository.find_by_attribute(EntityKind::Funder, "localKey", key).await,
            Resource::Grant(Grant {
                local_key: Some(key),
                ..
            }) => repository.find_by_attribute(EntityKind::Grant, "localKey", key).await,
            Resource::Person(person) => {
                first_match(&person.locator_ids, |id| {
                    repository.find_by_attribute(EntityKind::Person, "locatorIds", id)
                })
                .await
            }
            _ => Ok(None),
        }
    }

    /// Reads the resource a lookup pointed at. Anything but a well-formed resource of the
    /// expected kind means the repository contradicts itself, and the run must stop.
    async fn read_stored(&self, id: &RepoId, kind: EntityKind) -> Result<Resource, SyncError> {
        let integrity = |source| SyncError::Integrity {
            kind,
            id: id.clone(),
            source,
        };
        match self.services.repository.read_resource(id, kind).await {
            Ok(resource) if resource.kind() == kind => Ok(resource),
            Ok(other) => Err(integrity(RepositoryError::Decode(format!(
                "expected a {kind}, found a {}",
                other.kind()
            )))),
            Err(
                err @ (RepositoryError::NotFound { .. }
                | RepositoryError::Decode(_)
                | RepositoryError::Serialization(_)),
            ) => Err(integrity(err)),
            Err(err) => Err(err.into()),
        }
    }

    /// Returns `true` when `stored` already matches `source`; otherwise merges into `stored`.
    fn converge(&self, id: &RepoId, source: &Resource, stored: &mut Resource) -> Result<bool, SyncError> {
        let policy = self.services.policy;
        let equal = match (source, stored) {
            (Resource::Funder(source), Resource::Funder(stored)) => {
                policy.funder_equals(source, stored) || {
                    policy.merge_funder(source, stored);
                    false
                }
            }
            (Resource::Person(source), Resource::Person(stored)) => {
                policy.person_equals(source, stored) || {
                    policy.merge_person(source, stored);
                    false
                }
            }
            (Resource::Grant(source), Resource::Grant(stored)) => {
                policy.grant_equals(source, stored) || {
                    policy.merge_grant(source, stored);
                    false
                }
            }
            (source, stored) => {
                return Err(SyncError::Integrity {
                    kind: source.kind(),
                    id: id.clone(),
                    source: RepositoryError::Decode(format!(
                        "cannot merge a {} into a {}",
                        source.kind(),
                        stored.kind()
                    )),
                })
            }
        };
        Ok(equal)
    }

    /// Reconciles one source entity and records the outcome. Returns the repository id,
    /// or `None` when an update-only run skipped it.
    pub async fn reconcile_one(
        &self,
        source: &Resource,
        ctx: &mut BatchContext,
    ) -> Result<(Option<RepoId>, Outcome), SyncError> {
        let kind = source.kind();
        let repository = self.services.repository;

        let (id, outcome) = match self.find_existing(source).await? {
            None if self.write == WritePolicy::UpdateOnly && kind != EntityKind::Funder => {
                debug!(%kind, "no stored match in update-only run");
                (None, Outcome::Skipped)
            }
            None => {
                let id = repository.create_resource(source).await?;
                info!(%kind, %id, "created");
                (Some(id), Outcome::Created)
            }
            Some(id) => {
                let mut stored = self.read_stored(&id, kind).await?;
                if self.converge(&id, source, &mut stored)? {
                    debug!(%kind, %id, "unchanged");
                    (Some(id), Outcome::Unchanged)
                } else {
                    stored.set_id(id.clone());
                    repository.update_resource(&stored).await?;
                    info!(%kind, %id, "updated");
                    (Some(id), Outcome::Updated)
                }
            }
        };
        ctx.stats.record(kind, outcome);
        Ok((id, outcome))
    }

    /// Resolves a funder by its raw source key, reusing this run's earlier resolution.
    pub async fn resolve_funder(
        &self,
        key: &str,
        name: Option<&str>,
        policy: Option<&str>,
        ctx: &mut BatchContext,
    ) -> Result<Option<RepoId>, SyncError> {
        if let Some(id) = ctx.cache.funder(key) {
            return Ok(Some(id.clone()));
        }
        let funder = Funder {
            id: None,
            local_key: Some(funder_local_key(self.services.domain, key)),
            name: name.map(str::to_string),
            policy: policy.map(RepoId::new),
        };
        let (id, _) = self.reconcile_one(&Resource::Funder(funder), ctx).await?;
        if let Some(id) = &id {
            ctx.cache.remember_funder(key, id.clone());
        }
        Ok(id)
    }

    /// Dedup keys for the person a record describes: every namespaced identifier it
    /// carries, most reliable first.
    pub fn person_cache_keys(&self, record: &Record) -> Vec<String> {
        PERSON_IDENTIFIERS
            .iter()
            .filter_map(|(field, id_type)| {
                record_value(record, field).map(|value| locator_id(self.services.domain, *id_type, value))
            })
            .collect()
    }

    /// Builds the person a record describes. Returns `None` when the record carries no
    /// identifier at all.
    pub async fn build_person(&self, record: &Record) -> Result<Option<Person>, SyncError> {
        let domain = self.services.domain;
        let employee_id = record_value(record, fields::USER_EMPLOYEE_ID);
        let unique_id = match (record_value(record, fields::USER_INSTITUTION_ID), employee_id) {
            (Some(unique_id), _) => Some(unique_id.to_string()),
            (None, Some(employee_id)) => {
                self.services
                    .directory
                    .resolve_identifier(IdentifierType::EmployeeId, employee_id)
                    .await?
            }
            (None, None) => None,
        };
        let login = record_value(record, fields::USER_LOGIN);

        let locator_ids: Vec<String> = [
            (IdentifierType::EmployeeId, employee_id),
            (IdentifierType::UniqueId, unique_id.as_deref()),
            (IdentifierType::Eppn, login),
        ]
        .into_iter()
        .filter_map(|(id_type, value)| value.map(|v| locator_id(domain, id_type, v)))
        .collect();
        if locator_ids.is_empty() {
            warn!(
                last_name = record_value(record, fields::USER_LAST_NAME),
                "record has no person identifiers"
            );
            return Ok(None);
        }

        let first_name = record_value(record, fields::USER_FIRST_NAME).map(str::to_string);
        let last_name = record_value(record, fields::USER_LAST_NAME).map(str::to_string);
        let display_name = match (&first_name, &last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(name), None) | (None, Some(name)) => Some(name.clone()),
            (None, None) => None,
        };

        Ok(Some(Person {
            id: None,
            first_name,
            middle_name: record_value(record, fields::USER_MIDDLE_NAME).map(str::to_string),
            last_name,
            display_name,
            email: record_value(record, fields::USER_EMAIL).map(str::to_string),
            locator_ids,
            roles: [PersonRole::Submitter].into_iter().collect(),
        }))
    }

    /// Resolves the person a record describes, at most once per run.
    pub async fn resolve_person(
        &self,
        record: &Record,
        ctx: &mut BatchContext,
    ) -> Result<Option<RepoId>, SyncError> {
        let keys = self.person_cache_keys(record);
        if keys.is_empty() {
            warn!("record has no person identifiers");
            return Ok(None);
        }
        if let Some(id) = keys.iter().find_map(|key| ctx.cache.person(key)) {
            return Ok(Some(id.clone()));
        }
        if keys.iter().any(|key| ctx.cache.is_person_skipped(key)) {
            return Ok(None);
        }
        let Some(person) = self.build_person(record).await? else {
            return Ok(None);
        };
        let (id, _) = self
            .reconcile_one(&Resource::Person(person.clone()), ctx)
            .await?;
        // Later rows may reach the same person through any of its identifiers,
        // including a directory-backfilled one.
        for key in keys.into_iter().chain(person.locator_ids) {
            match &id {
                Some(id) => ctx.cache.remember_person(key, id.clone()),
                None => ctx.cache.mark_person_skipped(key),
            }
        }
        Ok(id)
    }
}

/// What one run did: statistics, the next start bound, and the reconciled grants.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    pub stats: Statistics,
    pub watermark: Option<String>,
    /// Keyed by namespaced grant local key. Grants skipped by an update-only run have no id.
    pub grants: BTreeMap<String, Grant>,
}

/// Reconciles one batch. All state lives in a fresh [`BatchContext`] dropped on return.
pub async fn reconcile(
    services: SyncServices<'_>,
    batch: &[Record],
    mode: SyncMode,
) -> Result<ReconcileOutcome, SyncError> {
    let span = info_span!("reconcile", mode = mode.as_str(), policy = services.policy.name());
    reconcile_batch(services, batch, mode).instrument(span).await
}

async fn reconcile_batch(
    services: SyncServices<'_>,
    batch: &[Record],
    mode: SyncMode,
) -> Result<ReconcileOutcome, SyncError> {
    let reconciler = EntityReconciler::new(services, mode.write_policy());
    let mut ctx = BatchContext::new();
    ctx.stats.records_processed = batch.len();

    let mut grants = BTreeMap::new();
    match mode {
        SyncMode::Grant | SyncMode::ExistingGrant => {
            let aggregated = aggregate::aggregate_grants(&reconciler, batch, &mut ctx).await?;
            ctx.stats.grants_processed = aggregated.len();
            for mut grant in aggregated {
                let (id, _) = reconciler
                    .reconcile_one(&Resource::Grant(grant.clone()), &mut ctx)
                    .await?;
                grant.id = id;
                if let Some(key) = grant.local_key.clone() {
                    grants.insert(key, grant);
                }
            }
        }
        SyncMode::User | SyncMode::ExistingUser => {
            aggregate::sync_users(&reconciler, batch, &mut ctx).await?;
        }
        SyncMode::Funder => {
            aggregate::sync_funders(&reconciler, batch, &mut ctx).await?;
        }
    }

    let watermark = ctx.watermark.value().map(str::to_string);
    ctx.stats.latest_update = watermark.clone();
    info!(
        records = ctx.stats.records_processed,
        writes = ctx.stats.total_writes(),
        watermark = watermark.as_deref().unwrap_or("(none)"),
        "batch reconciled"
    );
    Ok(ReconcileOutcome {
        stats: ctx.stats,
        watermark,
        grants,
    })
}
