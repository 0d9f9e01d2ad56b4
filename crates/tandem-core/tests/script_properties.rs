//! Property-based tests for script validation and execution order.
//!
//! Scripts are generated at random and the recorded order must always match
//! the declaration order, even when operations sleep for random amounts to
//! perturb real thread scheduling.

#![allow(clippy::disallowed_types, reason = "Test log shared between party threads")]

use std::{sync::Mutex, thread, time::Duration};

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tandem_core::{Party, SequenceViolation, SequencedActionList, StepError};

fn party_strategy() -> impl Strategy<Value = Party> {
    prop_oneof![Just(Party::A), Just(Party::B)]
}

fn alternating(len: usize) -> Vec<Party> {
    (0..len).map(|i| if i % 2 == 0 { Party::A } else { Party::B }).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a declaration sequence is accepted iff it opens with A and
    /// never repeats a party back to back. The first violation is reported
    /// with its position.
    #[test]
    fn prop_builder_accepts_only_alternating_scripts(
        parties in prop::collection::vec(party_strategy(), 0..12)
    ) {
        let mut list = Some(SequencedActionList::new());
        let mut first_error = None;

        for (position, party) in parties.iter().copied().enumerate() {
            let Some(current) = list.take() else { break };
            match current.add(party, || -> Result<(), StepError> { Ok(()) }) {
                Ok(next) => list = Some(next),
                Err(err) => {
                    first_error = Some((position, err));
                    break;
                },
            }
        }

        let expected = parties.iter().copied().enumerate().find_map(|(i, party)| {
            if i == 0 && party == Party::B {
                Some((i, SequenceViolation::OpeningParty { party }))
            } else if i > 0 && parties[i - 1] == party {
                Some((i, SequenceViolation::ConsecutiveSteps { party, position: i }))
            } else {
                None
            }
        });

        prop_assert_eq!(first_error, expected);
    }

    /// Property: an alternating script of any length runs exactly its
    /// operations, in declaration order.
    #[test]
    fn prop_execution_follows_declaration_order(len in 0usize..16) {
        let log = Mutex::new(Vec::new());
        let mut list = SequencedActionList::new();

        for (i, party) in alternating(len).into_iter().enumerate() {
            let log = &log;
            list = list
                .add(party, move || -> Result<(), StepError> {
                    log.lock().unwrap().push((party, i));
                    Ok(())
                })
                .unwrap();
        }

        let report = list.execute(|steps, _| steps.run_all(), |steps, _| steps.run_all()).unwrap();

        let log = log.into_inner().unwrap();
        let expected: Vec<_> = alternating(len).into_iter().enumerate().map(|(i, p)| (p, i)).collect();
        prop_assert_eq!(log, expected);
        prop_assert_eq!(report.total_operations(), len);
    }

    /// Property: random per-operation sleeps never change the recorded
    /// order.
    #[test]
    #[allow(clippy::disallowed_methods)]
    fn prop_order_survives_scheduling_jitter(seed in any::<u64>(), len in 2usize..8) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let log = Mutex::new(Vec::new());
        let mut list = SequencedActionList::new();

        for (i, party) in alternating(len).into_iter().enumerate() {
            let log = &log;
            let pause = Duration::from_micros(rng.gen_range(0..2_000));
            list = list
                .add(party, move || -> Result<(), StepError> {
                    thread::sleep(pause);
                    log.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }

        list.execute(|steps, _| steps.run_all(), |steps, _| steps.run_all()).unwrap();

        let log = log.into_inner().unwrap();
        prop_assert_eq!(log, (0..len).collect::<Vec<_>>());
    }
}
