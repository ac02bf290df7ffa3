use time::OffsetDateTime;

use super::*;

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap()
}

#[test]
fn timestamps_round_trip() {
    let now = ts(1_700_000_000);
    let s = format_ts(now);
    assert_eq!(parse_ts(&s).unwrap(), now);
}

#[test]
fn parse_ts_rejects_junk() {
    assert!(parse_ts("yesterday").is_err());
    assert!(parse_ts("").is_err());
}

#[test]
fn record_ids_are_stable_and_distinct() {
    let a = compute_token_id("issuer", "hash", "2024-01-01T00:00:00Z");
    let b = compute_token_id("issuer", "hash", "2024-01-01T00:00:00Z");
    let c = compute_token_id("issuer", "hash", "2024-01-01T00:00:01Z");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.len(), 64);
}

#[test]
fn membership_implicit_view_flips_at_deadline() {
    let record = MembershipRecord {
        id: "m".to_string(),
        subject_id: "alice".to_string(),
        source_token: None,
        activated_at: format_ts(ts(1_000)),
        expires_at: format_ts(ts(2_000)),
        status: MembershipStatus::Active,
        expired_at: None,
    };

    assert!(record.is_active_at(ts(1_999)).unwrap());
    assert!(!record.is_active_at(ts(2_000)).unwrap());
    assert!(!record.is_active_at(ts(2_001)).unwrap());
}

#[test]
fn expired_status_reads_inactive_even_before_deadline() {
    let record = MembershipRecord {
        id: "m".to_string(),
        subject_id: "alice".to_string(),
        source_token: None,
        activated_at: format_ts(ts(1_000)),
        expires_at: format_ts(ts(2_000)),
        status: MembershipStatus::Expired,
        expired_at: Some(format_ts(ts(1_500))),
    };

    assert!(!record.is_active_at(ts(1_500)).unwrap());
}

#[test]
fn token_expiry_is_inclusive_at_deadline() {
    let token = TokenRecord {
        id: "t".to_string(),
        token_hash: "h".to_string(),
        issued_by: "admin".to_string(),
        issued_at: format_ts(ts(0)),
        valid_for_secs: 100,
        expires_at: format_ts(ts(100)),
        plan: None,
        redeemed: false,
        redeemed_by: None,
        redeemed_at: None,
    };

    assert!(!token.is_expired_at(ts(99)).unwrap());
    assert!(token.is_expired_at(ts(100)).unwrap());
}
