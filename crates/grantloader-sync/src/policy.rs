//! Equality and merge rules applied when a source entity meets its stored counterpart.
//!
//! Each field follows one of four rules:
//!
//! - strict: the source is authoritative even when it has no value (natural keys, names,
//!   award number, funder references);
//! - tolerant: a missing source value carries no information and never overwrites;
//! - fill: the source only populates a stored field that is still empty (email, display name);
//! - collection: locator ids and roles are unioned, Co-PIs are replaced by this batch's view.
//!
//! Equality is written so that `equals(source, stored)` implies `merge` leaves `stored`
//! unchanged.

use std::collections::HashSet;

use grantloader_core::{Funder, Grant, Person, RepoId, SourceProfile};

use crate::SyncMode;

/// Source fields a profile may be unable to supply. Natural keys and the direct funder are
/// always authoritative and are not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceField {
    FunderName,
    FunderPolicy,
    PersonFirstName,
    PersonMiddleName,
    PersonLastName,
    PersonEmail,
    PersonDisplayName,
    GrantAwardNumber,
    GrantAwardStatus,
    GrantProjectName,
    GrantAwardDate,
    GrantStartDate,
    GrantEndDate,
    GrantPrimaryFunder,
    GrantPi,
    GrantCoPis,
}

fn strict_eq<T: PartialEq>(source: &Option<T>, stored: &Option<T>) -> bool {
    source == stored
}

fn tolerant_eq<T: PartialEq>(source: &Option<T>, stored: &Option<T>) -> bool {
    source.is_none() || source == stored
}

fn fill_eq<T>(source: &Option<T>, stored: &Option<T>) -> bool {
    source.is_none() || stored.is_some()
}

fn merge_strict<T: Clone>(source: &Option<T>, stored: &mut Option<T>) {
    stored.clone_from(source);
}

fn merge_tolerant<T: Clone>(source: &Option<T>, stored: &mut Option<T>) {
    if source.is_some() {
        stored.clone_from(source);
    }
}

fn merge_fill<T: Clone>(source: &Option<T>, stored: &mut Option<T>) {
    if stored.is_none() {
        stored.clone_from(source);
    }
}

/// Co-PIs the stored grant would end up with: the batch's list minus whoever is PI after merge.
fn effective_co_pis<P: MergePolicy + ?Sized>(policy: &P, source: &Grant, stored: &Grant) -> Vec<RepoId> {
    let pi = if policy.is_authoritative(SourceField::GrantPi) && source.pi.is_some() {
        source.pi.as_ref()
    } else {
        stored.pi.as_ref()
    };
    source
        .co_pis
        .iter()
        .filter(|id| Some(*id) != pi)
        .cloned()
        .collect()
}

fn same_members(a: &[RepoId], b: &[RepoId]) -> bool {
    a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}

/// Strategy deciding which source fields count, per source profile.
pub trait MergePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_authoritative(&self, field: SourceField) -> bool;

    fn funder_equals(&self, source: &Funder, stored: &Funder) -> bool {
        strict_eq(&source.local_key, &stored.local_key)
            && (!self.is_authoritative(SourceField::FunderName)
                || tolerant_eq(&source.name, &stored.name))
            && (!self.is_authoritative(SourceField::FunderPolicy)
                || tolerant_eq(&source.policy, &stored.policy))
    }

    fn merge_funder(&self, source: &Funder, stored: &mut Funder) {
        merge_strict(&source.local_key, &mut stored.local_key);
        if self.is_authoritative(SourceField::FunderName) {
            merge_tolerant(&source.name, &mut stored.name);
        }
        if self.is_authoritative(SourceField::FunderPolicy) {
            merge_tolerant(&source.policy, &mut stored.policy);
        }
    }

    fn person_equals(&self, source: &Person, stored: &Person) -> bool {
        let on = |field| self.is_authoritative(field);
        (!on(SourceField::PersonFirstName) || strict_eq(&source.first_name, &stored.first_name))
            && (!on(SourceField::PersonMiddleName)
                || strict_eq(&source.middle_name, &stored.middle_name))
            && (!on(SourceField::PersonLastName) || strict_eq(&source.last_name, &stored.last_name))
            && (!on(SourceField::PersonEmail) || fill_eq(&source.email, &stored.email))
            && (!on(SourceField::PersonDisplayName)
                || fill_eq(&source.display_name, &stored.display_name))
            && source
                .locator_ids
                .iter()
                .all(|id| stored.locator_ids.contains(id))
            && source.roles.is_subset(&stored.roles)
    }

    fn merge_person(&self, source: &Person, stored: &mut Person) {
        let on = |field| self.is_authoritative(field);
        if on(SourceField::PersonFirstName) {
            merge_strict(&source.first_name, &mut stored.first_name);
        }
        if on(SourceField::PersonMiddleName) {
            merge_strict(&source.middle_name, &mut stored.middle_name);
        }
        if on(SourceField::PersonLastName) {
            merge_strict(&source.last_name, &mut stored.last_name);
        }
        if on(SourceField::PersonEmail) {
            merge_fill(&source.email, &mut stored.email);
        }
        if on(SourceField::PersonDisplayName) {
            merge_fill(&source.display_name, &mut stored.display_name);
        }
        for id in &source.locator_ids {
            stored.push_locator_id(id.clone());
        }
        stored.roles.extend(source.roles.iter().copied());
    }

    fn grant_equals(&self, source: &Grant, stored: &Grant) -> bool {
        let on = |field| self.is_authoritative(field);
        strict_eq(&source.local_key, &stored.local_key)
            && (!on(SourceField::GrantAwardNumber)
                || strict_eq(&source.award_number, &stored.award_number))
            && (!on(SourceField::GrantAwardStatus)
                || source.award_status.is_unknown()
                || source.award_status == stored.award_status)
            && (!on(SourceField::GrantProjectName)
                || tolerant_eq(&source.project_name, &stored.project_name))
            && (!on(SourceField::GrantAwardDate) || tolerant_eq(&source.award_date, &stored.award_date))
            && (!on(SourceField::GrantStartDate) || tolerant_eq(&source.start_date, &stored.start_date))
            && (!on(SourceField::GrantEndDate) || tolerant_eq(&source.end_date, &stored.end_date))
            && strict_eq(&source.direct_funder, &stored.direct_funder)
            && (!on(SourceField::GrantPrimaryFunder)
                || strict_eq(&source.primary_funder, &stored.primary_funder))
            && (!on(SourceField::GrantPi) || tolerant_eq(&source.pi, &stored.pi))
            && (!on(SourceField::GrantCoPis)
                || same_members(&effective_co_pis(self, source, stored), &stored.co_pis))
    }

    fn merge_grant(&self, source: &Grant, stored: &mut Grant) {
        let on = |field| self.is_authoritative(field);
        // computed against the pre-merge PI
        let co_pis = effective_co_pis(self, source, stored);

        merge_strict(&source.local_key, &mut stored.local_key);
        if on(SourceField::GrantAwardNumber) {
            merge_strict(&source.award_number, &mut stored.award_number);
        }
        if on(SourceField::GrantAwardStatus) && !source.award_status.is_unknown() {
            stored.award_status = source.award_status;
        }
        if on(SourceField::GrantProjectName) {
            merge_tolerant(&source.project_name, &mut stored.project_name);
        }
        if on(SourceField::GrantAwardDate) {
            merge_tolerant(&source.award_date, &mut stored.award_date);
        }
        if on(SourceField::GrantStartDate) {
            merge_tolerant(&source.start_date, &mut stored.start_date);
        }
        if on(SourceField::GrantEndDate) {
            merge_tolerant(&source.end_date, &mut stored.end_date);
        }
        merge_strict(&source.direct_funder, &mut stored.direct_funder);
        if on(SourceField::GrantPrimaryFunder) {
            merge_strict(&source.primary_funder, &mut stored.primary_funder);
        }
        if on(SourceField::GrantPi) {
            merge_tolerant(&source.pi, &mut stored.pi);
        }
        if on(SourceField::GrantCoPis) {
            stored.co_pis = co_pis;
        }
    }
}

/// Every field participates.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictPolicy;

impl MergePolicy for StrictPolicy {
    fn name(&self) -> &'static str {
        "strict"
    }

    fn is_authoritative(&self, _field: SourceField) -> bool {
        true
    }
}

/// Fields the source cannot supply are left out of equality and merge entirely.
#[derive(Debug, Default, Clone)]
pub struct PartialPolicy {
    unsupplied: HashSet<SourceField>,
}

impl PartialPolicy {
    pub fn new(unsupplied: impl IntoIterator<Item = SourceField>) -> Self {
        Self {
            unsupplied: unsupplied.into_iter().collect(),
        }
    }

    /// Funder feed carrying only keys and policies.
    pub fn policy_only_funders() -> Self {
        Self::new([SourceField::FunderName])
    }

    pub fn spreadsheet() -> Self {
        Self::new([
            SourceField::PersonMiddleName,
            SourceField::GrantAwardStatus,
            SourceField::FunderPolicy,
        ])
    }
}

impl MergePolicy for PartialPolicy {
    fn name(&self) -> &'static str {
        "partial"
    }

    fn is_authoritative(&self, field: SourceField) -> bool {
        !self.unsupplied.contains(&field)
    }
}

pub fn policy_for(profile: SourceProfile, mode: SyncMode) -> Box<dyn MergePolicy> {
    match (mode, profile) {
        (SyncMode::Funder, _) => Box::new(PartialPolicy::policy_only_funders()),
        (_, SourceProfile::Coeus) => Box::new(StrictPolicy),
        (_, SourceProfile::Spreadsheet) => Box::new(PartialPolicy::spreadsheet()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use grantloader_core::{AwardStatus, PersonRole};

    fn id(s: &str) -> RepoId {
        RepoId::new(s)
    }

    fn stored_funder() -> Funder {
        Funder {
            id: Some(id("f1")),
            local_key: Some("jhu.edu:funder:300484".into()),
            name: Some("National Eye Institute".into()),
            policy: Some(id("policy-nih")),
        }
    }

    fn stored_person() -> Person {
        Person {
            id: Some(id("p1")),
            first_name: Some("Ada".into()),
            middle_name: None,
            last_name: Some("Lovelace".into()),
            display_name: Some("Countess Lovelace".into()),
            email: Some("ada@old.example.edu".into()),
            locator_ids: vec!["jhu.edu:employeeid:1".into(), "jhu.edu:eppn:alovela1".into()],
            roles: [PersonRole::Submitter].into_iter().collect(),
        }
    }

    fn stored_grant() -> Grant {
        Grant {
            id: Some(id("g1")),
            local_key: Some("jhu.edu:grant:130823".into()),
            award_number: Some("R01MH104125".into()),
            award_status: AwardStatus::Active,
            project_name: Some("Working Memory".into()),
            award_date: Some(Utc.with_ymd_and_hms(2018, 5, 20, 0, 0, 0).unwrap()),
            start_date: None,
            end_date: None,
            direct_funder: Some(id("f1")),
            primary_funder: Some(id("f2")),
            pi: Some(id("p1")),
            co_pis: vec![id("p2"), id("p3")],
        }
    }

    fn assert_symmetric<T: Clone + PartialEq + std::fmt::Debug>(
        equals: impl Fn(&T, &T) -> bool,
        merge: impl Fn(&T, &mut T),
        source: &T,
        stored: &T,
    ) {
        if equals(source, stored) {
            let mut merged = stored.clone();
            merge(source, &mut merged);
            assert_eq!(&merged, stored, "equal entities must merge to a no-op");
        }
    }

    #[test]
    fn funder_absent_name_and_policy_are_tolerated() {
        let source = Funder {
            id: None,
            local_key: Some("jhu.edu:funder:300484".into()),
            name: None,
            policy: None,
        };
        assert!(StrictPolicy.funder_equals(&source, &stored_funder()));

        let renamed = Funder {
            name: Some("NEI".into()),
            ..source.clone()
        };
        assert!(!StrictPolicy.funder_equals(&renamed, &stored_funder()));
        let mut merged = stored_funder();
        StrictPolicy.merge_funder(&renamed, &mut merged);
        assert_eq!(merged.name.as_deref(), Some("NEI"));
        assert_eq!(merged.policy, Some(id("policy-nih")));
    }

    #[test]
    fn policy_only_feed_ignores_funder_names() {
        let policy = PartialPolicy::policy_only_funders();
        let source = Funder {
            id: None,
            local_key: Some("jhu.edu:funder:300484".into()),
            name: Some("Some Other Name".into()),
            policy: Some(id("policy-nih")),
        };
        assert!(policy.funder_equals(&source, &stored_funder()));
        assert!(!StrictPolicy.funder_equals(&source, &stored_funder()));

        let new_policy = Funder {
            policy: Some(id("policy-doe")),
            ..source
        };
        let mut merged = stored_funder();
        policy.merge_funder(&new_policy, &mut merged);
        assert_eq!(merged.name.as_deref(), Some("National Eye Institute"));
        assert_eq!(merged.policy, Some(id("policy-doe")));
    }

    #[test]
    fn person_names_are_strict_but_email_only_fills_gaps() {
        let mut source = stored_person();
        source.id = None;
        source.email = Some("ada@new.example.edu".into());
        source.display_name = Some("Ada Lovelace".into());
        assert!(StrictPolicy.person_equals(&source, &stored_person()));

        source.middle_name = Some("K".into());
        assert!(!StrictPolicy.person_equals(&source, &stored_person()));
        assert!(PartialPolicy::spreadsheet().person_equals(&source, &stored_person()));

        let mut merged = stored_person();
        StrictPolicy.merge_person(&source, &mut merged);
        assert_eq!(merged.middle_name.as_deref(), Some("K"));
        assert_eq!(merged.email.as_deref(), Some("ada@old.example.edu"));
        assert_eq!(merged.display_name.as_deref(), Some("Countess Lovelace"));
    }

    #[test]
    fn person_locator_ids_grow_by_union_in_priority_order() {
        let source = Person {
            locator_ids: vec!["jhu.edu:employeeid:1".into(), "jhu.edu:unique-id:QX1".into()],
            roles: [PersonRole::Submitter].into_iter().collect(),
            ..stored_person()
        };
        assert!(!StrictPolicy.person_equals(&source, &stored_person()));

        let mut merged = stored_person();
        StrictPolicy.merge_person(&source, &mut merged);
        assert_eq!(
            merged.locator_ids,
            vec![
                "jhu.edu:employeeid:1".to_string(),
                "jhu.edu:eppn:alovela1".to_string(),
                "jhu.edu:unique-id:QX1".to_string(),
            ]
        );
        assert!(StrictPolicy.person_equals(&source, &merged));
    }

    #[test]
    fn missing_submitter_role_forces_update() {
        let mut stored = stored_person();
        stored.roles.clear();
        let source = Person {
            id: None,
            ..stored_person()
        };
        assert!(!StrictPolicy.person_equals(&source, &stored));
        StrictPolicy.merge_person(&source, &mut stored);
        assert!(stored.roles.contains(&PersonRole::Submitter));
    }

    #[test]
    fn grant_co_pis_are_replaced_and_compared_as_sets() {
        let mut source = stored_grant();
        source.id = None;
        source.co_pis = vec![id("p3"), id("p2")];
        assert!(StrictPolicy.grant_equals(&source, &stored_grant()));

        source.co_pis = vec![id("p4")];
        assert!(!StrictPolicy.grant_equals(&source, &stored_grant()));
        let mut merged = stored_grant();
        StrictPolicy.merge_grant(&source, &mut merged);
        assert_eq!(merged.co_pis, vec![id("p4")]);
    }

    #[test]
    fn grant_unknown_status_and_absent_dates_keep_stored_values() {
        let mut source = stored_grant();
        source.id = None;
        source.award_status = AwardStatus::Unknown;
        source.award_date = None;
        source.project_name = None;
        assert!(StrictPolicy.grant_equals(&source, &stored_grant()));

        source.award_number = None;
        assert!(!StrictPolicy.grant_equals(&source, &stored_grant()));
        let mut merged = stored_grant();
        StrictPolicy.merge_grant(&source, &mut merged);
        assert_eq!(merged.award_number, None);
        assert_eq!(merged.award_status, AwardStatus::Active);
        assert_eq!(merged.project_name.as_deref(), Some("Working Memory"));
    }

    #[test]
    fn stored_pi_never_lands_in_co_pis_after_merge() {
        let mut source = stored_grant();
        source.id = None;
        source.pi = None;
        source.co_pis = vec![id("p1"), id("p2")];

        let mut merged = stored_grant();
        StrictPolicy.merge_grant(&source, &mut merged);
        assert_eq!(merged.pi, Some(id("p1")));
        assert_eq!(merged.co_pis, vec![id("p2")]);
        assert!(StrictPolicy.grant_equals(&source, &merged));
    }

    #[test]
    fn equality_implies_merge_is_a_no_op() {
        let policies: Vec<Box<dyn MergePolicy>> = vec![
            Box::new(StrictPolicy),
            Box::new(PartialPolicy::spreadsheet()),
            Box::new(PartialPolicy::policy_only_funders()),
        ];
        let mut grant_variant = stored_grant();
        grant_variant.id = None;
        grant_variant.start_date = None;
        grant_variant.co_pis = vec![id("p2"), id("p3"), id("p1")];
        let person_variant = Person {
            id: None,
            email: None,
            display_name: Some("anything".into()),
            ..stored_person()
        };
        let funder_variant = Funder {
            id: None,
            name: None,
            ..stored_funder()
        };

        for policy in &policies {
            assert_symmetric(
                |a, b| policy.grant_equals(a, b),
                |a, b| policy.merge_grant(a, b),
                &grant_variant,
                &stored_grant(),
            );
            assert_symmetric(
                |a, b| policy.person_equals(a, b),
                |a, b| policy.merge_person(a, b),
                &person_variant,
                &stored_person(),
            );
            assert_symmetric(
                |a, b| policy.funder_equals(a, b),
                |a, b| policy.merge_funder(a, b),
                &funder_variant,
                &stored_funder(),
            );
        }
    }

    #[test]
    fn profiles_select_policies() {
        assert_eq!(policy_for(SourceProfile::Coeus, SyncMode::Grant).name(), "strict");
        assert_eq!(
            policy_for(SourceProfile::Spreadsheet, SyncMode::User).name(),
            "partial"
        );
        assert_eq!(policy_for(SourceProfile::Coeus, SyncMode::Funder).name(), "partial");
    }
}
