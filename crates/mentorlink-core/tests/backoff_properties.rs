//! Property tests for reconnect backoff policies and room selection.

use std::time::Duration;

use mentorlink_core::{
    BackoffPolicy, ExponentialBackoff, LeavePolicy, RoomCommand, RoomSession, TieredBackoff,
};
use proptest::prelude::*;

fn tiers_strategy() -> impl Strategy<Value = Vec<Duration>> {
    prop::collection::vec(0u64..60_000, 1..8).prop_map(|mut ms| {
        ms.sort_unstable();
        ms.into_iter().map(Duration::from_millis).collect()
    })
}

proptest! {
    /// Tiered delays never shrink and stop exactly after the last tier.
    #[test]
    fn tiered_delays_are_monotonic_and_bounded(tiers in tiers_strategy()) {
        let policy = TieredBackoff::new(tiers.clone()).unwrap();
        let delays: Vec<_> = (1..=policy.max_attempts()).map(|n| policy.delay(n).unwrap()).collect();

        prop_assert_eq!(&delays, &tiers);
        prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        prop_assert_eq!(policy.delay(policy.max_attempts() + 1), None);
    }

    /// Exponential delays never shrink and never exceed the cap.
    #[test]
    fn exponential_delays_are_monotonic_and_capped(
        initial_ms in 1u64..5_000,
        multiplier in 1u32..5,
        cap_factor in 1u64..20,
        max_attempts in 1u32..40,
    ) {
        let initial = Duration::from_millis(initial_ms);
        let cap = initial * cap_factor as u32;
        let policy = ExponentialBackoff::new(initial, multiplier, cap, max_attempts).unwrap();

        let delays: Vec<_> = (1..=max_attempts).map(|n| policy.delay(n).unwrap()).collect();
        prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(delays.iter().all(|d| *d <= cap));
        prop_assert_eq!(policy.delay(max_attempts + 1), None);
    }

    /// Selections made while disconnected collapse to a single join.
    #[test]
    fn offline_selections_collapse_to_last(
        explicit in any::<bool>(),
        selections in prop::collection::vec(prop::option::of(1u64..10), 1..12),
    ) {
        let policy = if explicit { LeavePolicy::Explicit } else { LeavePolicy::Implicit };
        let mut session = RoomSession::new(policy, 2);

        for room in &selections {
            prop_assert!(session.set_active(*room, false).is_empty());
        }

        let commands = session.on_connected();
        match selections.last().copied().flatten() {
            Some(room) => {
                let joins_room = matches!(
                    commands.as_slice(),
                    [RoomCommand::Join { room_id, .. }] if *room_id == room
                );
                prop_assert!(joins_room);
            },
            None => prop_assert!(commands.is_empty()),
        }
    }
}
