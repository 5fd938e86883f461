use identity_core::db::{open_db, open_db_in_memory, open_db_with};
use identity_core::{
    reconcile, Contact, ContactRepository, ContactView, IdentifyError, IdentifyOptions,
    now_epoch_ms, IdentifyRequest, IdentityService, LinkPrecedence, NewContact,
    SqliteContactRepository,
};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

const LORRAINE: &str = "lorraine@hillvalley.edu";
const MCFLY: &str = "mcfly@hillvalley.edu";
const GEORGE: &str = "george@hillvalley.edu";
const BIFF: &str = "biffsucks@hillvalley.edu";

fn identify(conn: &Connection, email: Option<&str>, phone_number: Option<&str>) -> ContactView {
    IdentityService::new(conn)
        .identify(&IdentifyRequest::new(email, phone_number))
        .unwrap()
        .contact
}

fn view(
    primary_contact_id: i64,
    emails: &[&str],
    phone_numbers: &[&str],
    secondary_contact_ids: &[i64],
) -> ContactView {
    ContactView {
        primary_contact_id,
        emails: emails.iter().map(|value| value.to_string()).collect(),
        phone_numbers: phone_numbers.iter().map(|value| value.to_string()).collect(),
        secondary_contact_ids: secondary_contact_ids.to_vec(),
    }
}

fn all_contacts(conn: &Connection) -> Vec<Contact> {
    let repo = SqliteContactRepository::try_new(conn).unwrap();
    let max_id: i64 = conn
        .query_row("SELECT COALESCE(MAX(id), 0) FROM contacts;", [], |row| {
            row.get(0)
        })
        .unwrap();
    let ids: Vec<i64> = (1..=max_id).collect();
    repo.find_by_ids(&ids).unwrap()
}

/// Checks that every active cluster has one linkless primary and that every
/// secondary points at an active primary.
fn assert_cluster_invariants(conn: &Connection) {
    let contacts = all_contacts(conn);
    let by_id: BTreeMap<i64, &Contact> = contacts.iter().map(|c| (c.id, c)).collect();

    for contact in &contacts {
        match contact.link_precedence {
            LinkPrecedence::Primary => assert_eq!(contact.linked_id, None),
            LinkPrecedence::Secondary => {
                let primary_id = contact.linked_id.expect("secondary must link");
                let primary = by_id
                    .get(&primary_id)
                    .unwrap_or_else(|| panic!("contact {} links to missing {primary_id}", contact.id));
                assert!(primary.is_primary(), "contact {} links to a secondary", contact.id);
                assert!(
                    primary.seniority_key() < contact.seniority_key(),
                    "primary {primary_id} must be older than {}",
                    contact.id
                );
            }
        }
    }

    // No two primaries may share an identifier.
    let mut seen_emails = BTreeMap::new();
    let mut seen_phones = BTreeMap::new();
    for contact in &contacts {
        let root = contact.linked_id.unwrap_or(contact.id);
        if let Some(email) = &contact.email {
            let owner = *seen_emails.entry(email.clone()).or_insert(root);
            assert_eq!(owner, root, "email shared across clusters");
        }
        if let Some(phone) = &contact.phone_number {
            let owner = *seen_phones.entry(phone.clone()).or_insert(root);
            assert_eq!(owner, root, "phone shared across clusters");
        }
    }
}

fn contact_count(conn: &Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM contacts;", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn first_request_creates_primary() {
    let conn = open_db_in_memory().unwrap();

    let result = identify(&conn, Some(LORRAINE), Some("123456"));
    assert_eq!(result, view(1, &[LORRAINE], &["123456"], &[]));
    assert_cluster_invariants(&conn);
}

#[test]
fn shared_phone_attaches_new_secondary() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some(LORRAINE), Some("123456"));

    let result = identify(&conn, Some(MCFLY), Some("123456"));
    assert_eq!(result, view(1, &[LORRAINE, MCFLY], &["123456"], &[2]));
    assert_eq!(contact_count(&conn), 2);
    assert_cluster_invariants(&conn);
}

#[test]
fn known_phone_alone_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some(LORRAINE), Some("123456"));
    let expected = identify(&conn, Some(MCFLY), Some("123456"));

    assert_eq!(identify(&conn, None, Some("123456")), expected);
    assert_eq!(identify(&conn, Some(MCFLY), None), expected);
    assert_eq!(identify(&conn, Some(MCFLY), Some("123456")), expected);
    assert_eq!(identify(&conn, Some(LORRAINE), Some("")), expected);
    assert_eq!(contact_count(&conn), 2);
}

#[test]
fn shared_identifiers_merge_two_primaries() {
    let conn = open_db_in_memory().unwrap();
    assert_eq!(
        identify(&conn, Some(GEORGE), Some("919191")),
        view(1, &[GEORGE], &["919191"], &[])
    );
    assert_eq!(
        identify(&conn, Some(BIFF), Some("717171")),
        view(2, &[BIFF], &["717171"], &[])
    );

    let merged = identify(&conn, Some(GEORGE), Some("717171"));
    assert_eq!(
        merged,
        view(1, &[GEORGE, BIFF], &["919191", "717171"], &[2])
    );
    assert_eq!(contact_count(&conn), 2);

    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let demoted = repo.get_contact(2, false).unwrap().unwrap();
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(1));
    assert_cluster_invariants(&conn);
}

#[test]
fn merge_repoints_secondaries_of_demoted_primary() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some("a@x"), Some("111"));
    identify(&conn, Some("a@x"), Some("222"));
    identify(&conn, Some("b@x"), Some("333"));
    identify(&conn, Some("b@x"), Some("444"));

    let merged = identify(&conn, Some("b@x"), Some("222"));
    assert_eq!(
        merged,
        view(1, &["a@x", "b@x"], &["111", "222", "333", "444"], &[2, 3, 4])
    );
    assert_eq!(contact_count(&conn), 4);

    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    for id in [2, 3, 4] {
        assert_eq!(repo.get_contact(id, false).unwrap().unwrap().linked_id, Some(1));
    }
    assert_cluster_invariants(&conn);
}

#[test]
fn primary_is_oldest_member_regardless_of_request_order() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    // Ids are assigned in insert order, seniority comes from created_at.
    let younger = repo
        .create_contact(&NewContact::primary(Some("young@x".into()), Some("1".into()), 2_000))
        .unwrap();
    let older = repo
        .create_contact(&NewContact::primary(Some("old@x".into()), Some("2".into()), 1_000))
        .unwrap();
    assert!(younger.id < older.id);

    let merged = identify(&conn, Some("young@x"), Some("2"));
    assert_eq!(merged.primary_contact_id, older.id);
    assert_eq!(merged.emails, vec!["old@x", "young@x"]);
    assert_eq!(merged.secondary_contact_ids, vec![younger.id]);
    assert_cluster_invariants(&conn);
}

#[test]
fn created_at_ties_break_by_smallest_id() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let first = repo
        .create_contact(&NewContact::primary(Some("a@x".into()), None, 500))
        .unwrap();
    let second = repo
        .create_contact(&NewContact::primary(None, Some("9".into()), 500))
        .unwrap();

    let merged = identify(&conn, Some("a@x"), Some("9"));
    assert_eq!(merged.primary_contact_id, first.id);
    assert_eq!(merged.secondary_contact_ids, vec![second.id]);
}

#[test]
fn three_way_merge_converges_on_one_primary() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some("a@x"), Some("1"));
    identify(&conn, Some("b@x"), Some("2"));
    identify(&conn, Some("c@x"), Some("3"));

    identify(&conn, Some("b@x"), Some("3"));
    let merged = identify(&conn, Some("a@x"), Some("2"));

    assert_eq!(merged.primary_contact_id, 1);
    assert_eq!(merged.secondary_contact_ids, vec![2, 3]);
    assert_eq!(merged.emails, vec!["a@x", "b@x", "c@x"]);
    assert_eq!(merged.phone_numbers, vec!["1", "2", "3"]);
    assert_eq!(contact_count(&conn), 3);
    assert_cluster_invariants(&conn);
}

#[test]
fn repeated_requests_do_not_change_view() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some(GEORGE), Some("919191"));
    identify(&conn, Some(BIFF), Some("717171"));
    let first = identify(&conn, Some(GEORGE), Some("717171"));
    let before = contact_count(&conn);

    for _ in 0..3 {
        assert_eq!(identify(&conn, Some(GEORGE), Some("717171")), first);
        assert_eq!(identify(&conn, Some(BIFF), Some("919191")), first);
    }
    assert_eq!(contact_count(&conn), before);
}

#[test]
fn soft_deleted_contacts_are_ignored() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some("a@x"), Some("111"));
    identify(&conn, Some("b@x"), Some("111"));
    conn.execute("UPDATE contacts SET deleted_at = 1 WHERE id = 1;", [])
        .unwrap();

    // The surviving secondary is promoted to lead its cluster.
    let result = identify(&conn, Some("b@x"), None);
    assert_eq!(result, view(2, &["b@x"], &["111"], &[]));

    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let promoted = repo.get_contact(2, false).unwrap().unwrap();
    assert!(promoted.is_primary());
    assert_eq!(promoted.linked_id, None);

    // A deleted identifier no longer matches anything.
    let fresh = identify(&conn, Some("a@x"), None);
    assert_eq!(fresh, view(3, &["a@x"], &[], &[]));
    assert_cluster_invariants(&conn);
}

#[test]
fn soft_deleted_primary_keeps_live_siblings_together() {
    let conn = open_db_in_memory().unwrap();
    identify(&conn, Some("a@x"), Some("111"));
    identify(&conn, Some("a@x"), Some("222"));
    identify(&conn, Some("c@x"), Some("222"));
    conn.execute("UPDATE contacts SET deleted_at = 1 WHERE id = 1;", [])
        .unwrap();

    // Contact 3 is only reachable through the deleted primary.
    let result = identify(&conn, Some("a@x"), None);
    assert_eq!(result, view(2, &["a@x", "c@x"], &["222"], &[3]));

    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let sibling = repo.get_contact(3, false).unwrap().unwrap();
    assert_eq!(sibling.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(sibling.linked_id, Some(2));
    assert_cluster_invariants(&conn);
}

#[test]
fn created_at_never_precedes_stored_contacts() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();
    let ahead = now_epoch_ms() + 3_600_000;
    repo.create_contact(&NewContact::primary(
        Some("a@x".to_string()),
        Some("111".to_string()),
        ahead,
    ))
    .unwrap();

    identify(&conn, Some("b@x"), Some("222"));
    let later = repo.get_contact(2, false).unwrap().unwrap();
    assert!(later.created_at >= ahead);

    // The contact stored first stays primary even though the clock lags it.
    let merged = identify(&conn, Some("a@x"), Some("222"));
    assert_eq!(merged, view(1, &["a@x", "b@x"], &["111", "222"], &[2]));
    assert_cluster_invariants(&conn);
}

#[test]
fn reconcile_reports_created_and_relinked_contacts() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteContactRepository::try_new(&conn).unwrap();

    let first = reconcile(&repo, &IdentifyRequest::new(Some("a@x"), Some("1")), 10).unwrap();
    assert_eq!(first.created, Some(1));
    assert!(first.relinked.is_empty());

    reconcile(&repo, &IdentifyRequest::new(Some("b@x"), Some("2")), 20).unwrap();
    let merged = reconcile(&repo, &IdentifyRequest::new(Some("a@x"), Some("2")), 30).unwrap();
    assert_eq!(merged.created, None);
    assert_eq!(merged.relinked, vec![2]);
    assert_eq!(repo.get_contact(2, false).unwrap().unwrap().updated_at, 30);
}

#[test]
fn locked_database_exhausts_retries_without_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.sqlite3");
    let holder = open_db(&path).unwrap();
    let conn = open_db_with(&path, Duration::ZERO).unwrap();

    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let service = IdentityService::with_options(
        &conn,
        IdentifyOptions {
            max_attempts: 2,
            timeout: None,
        },
    );
    let err = service
        .identify(&IdentifyRequest::new(Some(LORRAINE), None))
        .unwrap_err();
    assert!(matches!(
        err,
        IdentifyError::ConflictRetriesExhausted { attempts: 2 }
    ));
    assert!(!err.is_client_error());
    holder.execute_batch("ROLLBACK;").unwrap();

    assert_eq!(contact_count(&conn), 0);
    assert_eq!(
        identify(&conn, Some(LORRAINE), None),
        view(1, &[LORRAINE], &[], &[])
    );
}

#[test]
fn lock_wait_is_bounded_by_request_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.sqlite3");
    let holder = open_db(&path).unwrap();
    let conn = open_db_with(&path, Duration::from_secs(2)).unwrap();

    holder.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let service = IdentityService::with_options(
        &conn,
        IdentifyOptions {
            max_attempts: 3,
            timeout: Some(Duration::from_millis(100)),
        },
    );
    let started = Instant::now();
    let err = service
        .identify(&IdentifyRequest::new(Some(LORRAINE), None))
        .unwrap_err();
    assert!(matches!(err, IdentifyError::Timeout { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    holder.execute_batch("ROLLBACK;").unwrap();

    let busy_ms: i64 = conn
        .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(busy_ms, 2_000);
    assert_eq!(contact_count(&conn), 0);
}

#[test]
fn concurrent_identical_requests_create_one_primary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.sqlite3");
    drop(open_db(&path).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                identify(&conn, Some(MCFLY), Some("555"))
            })
        })
        .collect();
    let primaries: BTreeSet<i64> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().primary_contact_id)
        .collect();

    let conn = open_db(&path).unwrap();
    assert_eq!(primaries.len(), 1);
    assert_eq!(contact_count(&conn), 1);
}
