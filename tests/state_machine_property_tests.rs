//! Property-based tests for the submission lifecycle
//!
//! Random sequences of transitions are thrown at a fresh submission. Whatever
//! the sequence, the machine must only ever follow the transition table, keep
//! its timestamps ordered and end up with at most one terminal marker.

use proptest::prelude::*;
use recycle_rewards::pricing::Tariff;
use recycle_rewards::submission::TRANSITIONS;
use recycle_rewards::{NewSubmission, PickupDetails, Submission, SubmissionStatus, Transition};
use rust_decimal::Decimal;

const STATUSES: [SubmissionStatus; 7] = [
    SubmissionStatus::Pending,
    SubmissionStatus::Confirmed,
    SubmissionStatus::PickedUp,
    SubmissionStatus::Processed,
    SubmissionStatus::Completed,
    SubmissionStatus::Cancelled,
    SubmissionStatus::Rejected,
];

fn fresh() -> Submission {
    Submission::new(
        "sub_prop".into(),
        "SUB202501010001".into(),
        NewSubmission {
            user_id: "user_prop".into(),
            bank_id: "bank_prop".into(),
            waste_type_id: "pet".into(),
            declared_weight: Decimal::new(25, 1),
            photos: vec![],
            description: None,
        },
        Decimal::from(3000).into(),
        Decimal::from(7500).into(),
    )
}

fn status_strategy() -> impl Strategy<Value = SubmissionStatus> {
    prop::sample::select(STATUSES.to_vec())
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop_oneof![
        Just(Transition::Confirm { note: None }),
        "[a-z ]{0,12}".prop_map(|address| Transition::PickUp(PickupDetails::new(address))),
        (1u32..50_000u32).prop_map(|grams| Transition::Process {
            actual_weight: Decimal::new(grams.into(), 3),
            notes: None,
        }),
        Just(Transition::Complete),
        Just(Transition::Cancel { reason: None }),
        Just(Transition::Reject {
            reason: "contaminated".into()
        }),
    ]
}

proptest! {
    #[test]
    fn only_table_pairs_are_legal(from in status_strategy(), to in status_strategy()) {
        let listed = TRANSITIONS.contains(&(from, to));
        prop_assert_eq!(from.can_transition_to(to), listed);
        if from == to || from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn random_walks_respect_the_machine(transitions in prop::collection::vec(transition_strategy(), 0..12)) {
        let tariff = Tariff::new(Decimal::from(3000), Decimal::new(10, 2), 2);
        let mut submission = fresh();

        for transition in &transitions {
            let before = submission.clone();
            let legal = before.status.can_transition_to(transition.target());

            match submission.apply(transition, "operator", Some(&tariff)) {
                Ok(()) => {
                    prop_assert!(legal);
                    prop_assert_eq!(submission.status, transition.target());
                    prop_assert_eq!(submission.version, before.version + 1);
                    prop_assert_eq!(submission.history.len(), before.history.len() + 1);
                }
                Err(_) => prop_assert_eq!(&submission, &before),
            }
        }

        let stamps = submission.transition_stamps();
        prop_assert!(stamps.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert!(stamps.iter().all(|stamp| **stamp > submission.created_at));
        prop_assert_eq!(submission.terminal_markers(), usize::from(submission.status.is_terminal()));

        if let (Some(gross), Some(fee), Some(payout)) =
            (submission.actual_value, submission.platform_fee, submission.net_payout)
        {
            prop_assert_eq!(fee.value() + payout.value(), gross.value());
        }
    }

    #[test]
    fn terminal_submissions_stay_put(transition in transition_strategy()) {
        let tariff = Tariff::new(Decimal::from(3000), Decimal::new(10, 2), 2);
        for terminal in [Transition::Cancel { reason: None }, Transition::Reject { reason: "spam".into() }] {
            let mut submission = fresh();
            submission.apply(&terminal, "admin", None).unwrap();
            let frozen = submission.clone();

            prop_assert!(submission.apply(&transition, "admin", Some(&tariff)).is_err());
            prop_assert_eq!(&submission, &frozen);
        }
    }
}
