//! End-to-end runs of the scenario catalogue.

use std::time::Duration;

use proptest::prelude::*;
use tandem_core::{HarnessConfig, PartyState};
use tandem_harness::{
    Isolation, Scenario,
    scenarios::{count_while_inserting, ping_pong, read_twice},
};

fn fast() -> HarnessConfig {
    HarnessConfig::default().with_probe_delay(Duration::from_millis(30))
}

#[test]
fn every_scenario_passes() {
    for scenario in Scenario::ALL {
        let outcome = scenario.run(&fast()).unwrap();
        assert!(outcome.passed(), "{outcome}");
        assert_eq!(outcome.scenario, scenario);
        assert_eq!(outcome.report.final_states, [PartyState::Completed; 2]);
    }
}

#[test]
fn blocking_scenarios_schedule_one_probe_for_b() {
    for scenario in
        [Scenario::ParallelUpdate, Scenario::ShareThenUpdate, Scenario::UpdateThenShare, Scenario::DuplicateInsert]
    {
        let outcome = scenario.run(&fast()).unwrap();
        assert_eq!(outcome.report.probes_scheduled, [0, 1], "{scenario}");
    }
}

#[test]
fn read_committed_count_hides_pending_insert() {
    let (counts, _) = count_while_inserting(Isolation::ReadCommitted, &fast()).unwrap();
    assert_eq!(counts, vec![0, 0]);
}

#[test]
fn read_uncommitted_count_sees_pending_insert() {
    let (counts, report) = count_while_inserting(Isolation::ReadUncommitted, &fast()).unwrap();
    assert_eq!(counts, vec![0, 1]);
    assert_eq!(report.operations_run, [2, 2]);
}

#[test]
fn isolation_decides_second_read() {
    let (committed, _) = read_twice(Isolation::ReadCommitted, &fast()).unwrap();
    let (repeatable, _) = read_twice(Isolation::RepeatableRead, &fast()).unwrap();

    assert_eq!(committed, vec!["COMPANY 1", "ENTERPRISE"]);
    assert_eq!(repeatable, vec!["COMPANY 1", "COMPANY 1"]);
}

#[test]
fn outcome_renders_every_expectation() {
    let outcome = Scenario::ParallelUpdate.run(&fast()).unwrap();
    let rendered = outcome.to_string();

    assert!(rendered.starts_with("parallel-update: passed"));
    assert_eq!(rendered.lines().count(), 1 + outcome.expectations.len());
    assert!(rendered.contains("[ok] both increments applied (observed Some(5400))"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Property: ping-pong holds for any number of rounds.
    #[test]
    fn prop_ping_pong_alternates(rounds in 0usize..12) {
        let outcome = ping_pong(rounds, &fast()).unwrap();

        prop_assert!(outcome.passed(), "{}", outcome);
        prop_assert_eq!(outcome.report.operations_run, [rounds, rounds]);
    }
}
