//! Identity reconciliation steps.
//!
//! # Responsibility
//! - Resolve every contact connected to an incoming identifier pair.
//! - Collapse the connected contacts into one two-level cluster.
//! - Persist genuinely new information as a secondary contact.
//! - Build the consolidated view from the persisted cluster.
//!
//! # Invariants
//! - After [`reconcile`], the touched cluster has exactly one primary with no
//!   link, and every other active member links directly to it.
//! - The primary is the member with the smallest `(created_at, id)`.
//! - Resubmitting a pair already stored by a member performs no write.
//!
//! All steps run against whatever connection or transaction backs the
//! repository; atomicity is the caller's responsibility.

use crate::model::contact::{Contact, ContactId, ContactLinkUpdate, LinkPrecedence, NewContact};
use crate::model::identify::{ContactView, IdentifyRequest};
use crate::repo::contact_repo::{ContactRepository, RepoError, RepoResult};
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub view: ContactView,
    /// Id of the contact inserted by this pass, if any.
    pub created: Option<ContactId>,
    /// Contacts whose linkage was rewritten by the merge.
    pub relinked: Vec<ContactId>,
}

/// Runs match, closure, merge, new-information detection and view assembly.
///
/// `request` must already be normalized (see [`IdentifyRequest::normalized`]).
/// `now` is the epoch-millisecond timestamp used for every write of this pass.
pub fn reconcile<R: ContactRepository>(
    repo: &R,
    request: &IdentifyRequest,
    now: i64,
) -> RepoResult<ReconcileOutcome> {
    let email = request.email.as_deref();
    let phone_number = request.phone_number.as_deref();

    let seeds = repo.find_by_identifiers(email, phone_number)?;
    if seeds.is_empty() {
        let created = repo.create_contact(&NewContact::primary(
            request.email.clone(),
            request.phone_number.clone(),
            now,
        ))?;
        debug!(
            "event=reconcile module=service status=ok outcome=new_primary primary_id={}",
            created.id
        );
        return Ok(ReconcileOutcome {
            view: new_primary_view(&created),
            created: Some(created.id),
            relinked: Vec::new(),
        });
    }

    let members = resolve_chain(repo, &seeds)?;
    let primary_id = select_primary(&members)
        .map(|primary| primary.id)
        .ok_or_else(|| RepoError::InvalidData("matched contacts vanished during closure".into()))?;
    let relinked = merge_into_primary(repo, &members, primary_id, now)?;

    let mut component = repo.find_component(primary_id)?;
    let mut created = None;
    if needs_new_secondary(&component, request) {
        let secondary = repo.create_contact(&NewContact::secondary(
            request.email.clone(),
            request.phone_number.clone(),
            primary_id,
            now,
        ))?;
        created = Some(secondary.id);
        component = repo.find_component(primary_id)?;
    }

    let primary = component
        .iter()
        .find(|contact| contact.id == primary_id)
        .ok_or(RepoError::NotFound(primary_id))?;
    let view = build_view(primary, &component);
    debug!(
        "event=reconcile module=service status=ok outcome=linked primary_id={} members={} relinked={} created={}",
        primary_id,
        component.len(),
        relinked.len(),
        created.is_some()
    );

    Ok(ReconcileOutcome {
        view,
        created,
        relinked,
    })
}

/// Expands `seeds` to every active contact reachable through `linked_id` edges.
///
/// Worklist over ids: each round hydrates the frontier, follows the parent link
/// of every active frontier member and the child links of every frontier id.
/// Soft-deleted contacts are never returned. Output is ordered by id.
pub fn resolve_chain<R: ContactRepository>(repo: &R, seeds: &[Contact]) -> RepoResult<Vec<Contact>> {
    let mut visited: BTreeSet<ContactId> = seeds.iter().map(|contact| contact.id).collect();
    let mut members: BTreeMap<ContactId, Contact> = BTreeMap::new();
    let mut frontier: Vec<ContactId> = visited.iter().copied().collect();
    let mut rounds = 0usize;

    while !frontier.is_empty() {
        rounds += 1;
        let active = repo.find_by_ids(&frontier)?;

        let mut discovered = BTreeSet::new();
        for contact in &active {
            if let Some(parent_id) = contact.linked_id {
                discovered.insert(parent_id);
            }
        }
        // Children are looked up for deleted ids too, so live siblings under a
        // soft-deleted primary stay in the same cluster.
        for child in repo.find_by_linked_ids(&frontier)? {
            discovered.insert(child.id);
        }

        members.extend(active.into_iter().map(|contact| (contact.id, contact)));
        frontier = discovered
            .into_iter()
            .filter(|id| visited.insert(*id))
            .collect();
    }

    debug!(
        "event=resolve_chain module=service status=ok seeds={} members={} rounds={}",
        seeds.len(),
        members.len(),
        rounds
    );
    Ok(members.into_values().collect())
}

/// Picks the oldest member, breaking `created_at` ties by the smallest id.
pub fn select_primary(members: &[Contact]) -> Option<&Contact> {
    members.iter().min_by_key(|contact| contact.seniority_key())
}

/// Rewrites linkage so that `members` form one cluster rooted at `primary_id`.
///
/// The chosen primary is promoted if it is not already a linkless primary
/// (its own primary may have been soft-deleted). Every other member that is a
/// primary, or links elsewhere, becomes a secondary of `primary_id`.
/// Returns the ids rewritten, ascending.
pub fn merge_into_primary<R: ContactRepository>(
    repo: &R,
    members: &[Contact],
    primary_id: ContactId,
    now: i64,
) -> RepoResult<Vec<ContactId>> {
    let mut relinked = Vec::new();

    for contact in members {
        if contact.id == primary_id {
            if !contact.is_primary() || contact.linked_id.is_some() {
                let promote = ContactLinkUpdate {
                    link_precedence: LinkPrecedence::Primary,
                    linked_id: None,
                    updated_at: now,
                };
                repo.update_link(contact.id, &promote)?;
                info!(
                    "event=contact_promoted module=service status=ok contact_id={}",
                    contact.id
                );
                relinked.push(contact.id);
            }
            continue;
        }

        if contact.is_primary() || contact.linked_id != Some(primary_id) {
            repo.update_link(contact.id, &ContactLinkUpdate::demote_to(primary_id, now))?;
            info!(
                "event=contact_demoted module=service status=ok contact_id={} primary_id={} previous_link={}",
                contact.id,
                primary_id,
                contact
                    .linked_id
                    .map_or_else(|| "none".to_string(), |id| id.to_string())
            );
            relinked.push(contact.id);
        }
    }

    relinked.sort_unstable();
    Ok(relinked)
}

/// Decides whether `request` must be stored as an extra secondary.
///
/// True when a supplied email or phone is unknown to every member, and no
/// member already carries the exact incoming pair.
pub fn needs_new_secondary(component: &[Contact], request: &IdentifyRequest) -> bool {
    let email = request.email.as_deref();
    let phone_number = request.phone_number.as_deref();

    let unknown_email = email.is_some_and(|email| {
        !component
            .iter()
            .any(|contact| contact.email.as_deref() == Some(email))
    });
    let unknown_phone = phone_number.is_some_and(|phone_number| {
        !component
            .iter()
            .any(|contact| contact.phone_number.as_deref() == Some(phone_number))
    });
    if !unknown_email && !unknown_phone {
        return false;
    }

    !component
        .iter()
        .any(|contact| contact.has_pair(email, phone_number))
}

/// Builds the consolidated view of a persisted cluster.
///
/// Values of `primary` come first, then secondaries by `(created_at, id)`;
/// absent and repeated values are skipped.
pub fn build_view(primary: &Contact, component: &[Contact]) -> ContactView {
    let mut secondaries: Vec<&Contact> = component
        .iter()
        .filter(|contact| contact.id != primary.id && contact.is_active())
        .collect();
    secondaries.sort_by_key(|contact| contact.seniority_key());

    let ordered: Vec<&Contact> = std::iter::once(primary)
        .chain(secondaries.iter().copied())
        .collect();

    let mut secondary_contact_ids: Vec<ContactId> =
        secondaries.iter().map(|contact| contact.id).collect();
    secondary_contact_ids.sort_unstable();

    ContactView {
        primary_contact_id: primary.id,
        emails: unique_in_order(ordered.iter().map(|contact| contact.email.as_deref())),
        phone_numbers: unique_in_order(
            ordered
                .iter()
                .map(|contact| contact.phone_number.as_deref()),
        ),
        secondary_contact_ids,
    }
}

/// View for a freshly created primary with no prior matches.
pub fn new_primary_view(contact: &Contact) -> ContactView {
    ContactView {
        primary_contact_id: contact.id,
        emails: contact.email.iter().cloned().collect(),
        phone_numbers: contact.phone_number.iter().cloned().collect(),
        secondary_contact_ids: Vec::new(),
    }
}

fn unique_in_order<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .flatten()
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}
