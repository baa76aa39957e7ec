// tests/property_dispatch_order.rs

//! Property test: however the due set looks, dispatch ordering never places
//! a lower-priority task before a higher-priority one, and ties break on
//! the earlier `next_run_time`.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use taskforge::sched::order_due_tasks;
use taskforge::types::Priority;
use taskforge_test_utils::builders::TaskBuilder;

fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
    ]
}

proptest! {
    #[test]
    fn ordering_is_priority_then_due_time(
        specs in proptest::collection::vec((priority_strategy(), 0i64..86_400), 0..32)
    ) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut tasks: Vec<_> = specs
            .iter()
            .enumerate()
            .map(|(i, (priority, offset))| {
                TaskBuilder::new(i as i64 + 1, &format!("task_{i}"))
                    .priority(*priority)
                    .next_run_at(base + Duration::seconds(*offset))
                    .build()
            })
            .collect();

        order_due_tasks(&mut tasks);

        for pair in tasks.windows(2) {
            // Never a lower priority before a higher one.
            prop_assert!(pair[0].priority >= pair[1].priority);
            // Within one priority class, earlier firings first.
            if pair[0].priority == pair[1].priority {
                prop_assert!(pair[0].next_run_time <= pair[1].next_run_time);
            }
        }
    }

    #[test]
    fn ordering_preserves_the_task_set(
        specs in proptest::collection::vec((priority_strategy(), 0i64..86_400), 0..32)
    ) {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut tasks: Vec<_> = specs
            .iter()
            .enumerate()
            .map(|(i, (priority, offset))| {
                TaskBuilder::new(i as i64 + 1, &format!("task_{i}"))
                    .priority(*priority)
                    .next_run_at(base + Duration::seconds(*offset))
                    .build()
            })
            .collect();

        let mut before: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();
        order_due_tasks(&mut tasks);
        let mut after: Vec<i64> = tasks.iter().map(|t| t.task_id).collect();

        before.sort_unstable();
        after.sort_unstable();
        prop_assert_eq!(before, after);
    }
}
