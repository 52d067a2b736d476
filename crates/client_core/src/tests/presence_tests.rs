use shared::domain::GroupId;

use super::*;
use crate::test_support::{friend, group, member};

const EXPIRY: Duration = Duration::from_secs(5);

fn resolver() -> IdentityResolver {
    IdentityResolver::from_summaries(
        &[friend(2, "Bo"), friend(3, "Cy")],
        &[group(10, "Team", vec![member(7, "Gus")])],
    )
}

fn direct(id: i64) -> ConversationRef {
    ConversationRef::Direct(UserId(id))
}

#[test]
fn snapshot_replaces_and_deltas_toggle() {
    let mut tracker = PresenceTracker::new(EXPIRY);
    tracker.apply_online_delta(UserId(9), true);

    tracker.apply_snapshot([(UserId(2), true), (UserId(3), false)]);

    assert_eq!(tracker.online(), vec![UserId(2)]);
    assert!(!tracker.is_online(UserId(9)));

    assert!(tracker.apply_online_delta(UserId(3), true));
    assert!(!tracker.apply_online_delta(UserId(3), true));
    assert!(tracker.apply_online_delta(UserId(2), false));
    assert_eq!(tracker.online(), vec![UserId(3)]);
}

#[test]
fn directory_hints_yield_to_the_snapshot() {
    let mut tracker = PresenceTracker::new(EXPIRY);
    assert!(tracker.apply_directory_hint(UserId(2), true));
    assert!(tracker.is_online(UserId(2)));

    tracker.apply_snapshot([(UserId(2), false), (UserId(3), true)]);

    assert!(!tracker.apply_directory_hint(UserId(2), true));
    assert!(!tracker.apply_directory_hint(UserId(3), false));
    assert_eq!(tracker.online(), vec![UserId(3)]);

    tracker.clear();
    assert!(tracker.apply_directory_hint(UserId(2), true));
}

#[test]
fn typing_from_unknown_participant_is_ignored() {
    let resolver = resolver();
    let mut tracker = PresenceTracker::new(EXPIRY);
    let now = Instant::now();

    assert!(!tracker.apply_typing_start(UserId(99), direct(99), now, &resolver));
    assert!(tracker.typing_in(direct(99), now).is_empty());

    assert!(tracker.apply_typing_start(UserId(7), direct(7), now, &resolver));
}

#[test]
fn start_then_stop_round_trip() {
    let resolver = resolver();
    let mut tracker = PresenceTracker::new(EXPIRY);
    let now = Instant::now();

    assert!(tracker.apply_typing_start(UserId(2), direct(2), now, &resolver));
    assert!(!tracker.apply_typing_start(UserId(2), direct(2), now, &resolver));
    assert_eq!(tracker.typing_in(direct(2), now), vec![UserId(2)]);

    assert!(tracker.apply_typing_stop(UserId(2), direct(2)));
    assert!(!tracker.apply_typing_stop(UserId(2), direct(2)));
    assert!(tracker.typing_in(direct(2), now).is_empty());
}

#[test]
fn stale_entries_expire_without_a_stop() {
    let resolver = resolver();
    let mut tracker = PresenceTracker::new(EXPIRY);
    let start = Instant::now();
    tracker.apply_typing_start(UserId(2), direct(2), start, &resolver);
    tracker.apply_typing_start(UserId(3), direct(3), start + Duration::from_secs(3), &resolver);

    let later = start + Duration::from_secs(5);
    assert!(tracker.typing_in(direct(2), later).is_empty());
    assert_eq!(tracker.typing_in(direct(3), later), vec![UserId(3)]);

    let changed = tracker.prune_typing(start + Duration::from_secs(9));
    assert_eq!(changed, vec![direct(3)]);
}

#[test]
fn refreshed_start_extends_the_deadline() {
    let resolver = resolver();
    let mut tracker = PresenceTracker::new(EXPIRY);
    let start = Instant::now();
    tracker.apply_typing_start(UserId(2), direct(2), start, &resolver);
    tracker.apply_typing_start(UserId(2), direct(2), start + Duration::from_secs(4), &resolver);

    assert_eq!(
        tracker.typing_in(direct(2), start + Duration::from_secs(6)),
        vec![UserId(2)]
    );
}

#[test]
fn typing_sets_never_hold_entries_past_the_ceiling() {
    let resolver = resolver();
    let mut tracker = PresenceTracker::new(EXPIRY);
    let start = Instant::now();
    for (offset, user) in [(0u64, 2i64), (2, 3), (4, 7)] {
        tracker.apply_typing_start(
            UserId(user),
            ConversationRef::Group(GroupId(10)),
            start + Duration::from_secs(offset),
            &resolver,
        );
    }

    for probe in 0..12u64 {
        let now = start + Duration::from_secs(probe);
        let typing = tracker.typing_in(ConversationRef::Group(GroupId(10)), now);
        for user in typing {
            let started = match user.0 {
                2 => 0,
                3 => 2,
                _ => 4,
            };
            assert!(probe.saturating_sub(started) < EXPIRY.as_secs());
        }
    }
}
