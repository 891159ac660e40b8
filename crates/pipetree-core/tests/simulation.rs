use pipetree_core::{
    Event, Generation, Pid, ProcessKind, Sampler, Simulation, SimulationConfig, StepOutcome,
};
use std::collections::VecDeque;

/// Replays queued draws; once the script is exhausted every kind draw
/// yields a lover and every brood draw takes the range minimum.
struct ScriptedSampler {
    kinds: VecDeque<ProcessKind>,
    broods: VecDeque<u32>,
}

impl ScriptedSampler {
    fn new(kinds: &[ProcessKind], broods: &[u32]) -> Self {
        Self {
            kinds: kinds.iter().copied().collect(),
            broods: broods.iter().copied().collect(),
        }
    }
}

impl Sampler for ScriptedSampler {
    fn draw_kind(&mut self, _lover_probability: f64) -> ProcessKind {
        self.kinds.pop_front().unwrap_or(ProcessKind::Lover)
    }

    fn draw_brood(&mut self, min: u32, _max: u32) -> u32 {
        self.broods.pop_front().unwrap_or(min)
    }
}

fn scripted(kinds: &[ProcessKind], broods: &[u32]) -> Simulation {
    Simulation::with_sampler(
        SimulationConfig::default(),
        Box::new(ScriptedSampler::new(kinds, broods)),
    )
    .expect("simulation")
}

#[test]
fn hater_root_with_two_lover_children_converges_in_order() {
    use ProcessKind::{Hater, Lover};
    let mut sim = scripted(&[Hater, Lover, Lover], &[2]);
    let depth = sim.run();

    let lines: Vec<String> = sim.lines().collect();
    let expected = [
        "Root process 1 created as hater, generation 0",
        "Process 1 (hater) creating 2 children",
        "Child 2 created as lover, generation 1",
        "Child 3 created as lover, generation 1",
        "Process 2 (lover) sent love (831) to parent 1",
        "Process 3 (lover) sent love (831) to parent 1",
        "Process 1 received love (831) from child 2",
        "Process 1 received love (831) from child 3",
        "Process 1 (hater) received love from child, becoming lover",
        "Process 1 sent love (831) to child 2",
        "Process 1 sent love (831) to child 3",
        "Simulation complete. All 3 processes are lovers.",
        "Maximum generation reached: 1",
    ];
    assert_eq!(lines, expected);

    assert_eq!(depth, Generation(1));
    assert_eq!(sim.lover_count(), 3);
    assert!(!sim.was_capped());
}

#[test]
fn lover_root_retires_without_sending() {
    let mut sim = scripted(&[ProcessKind::Lover], &[]);
    let depth = sim.run();

    let lines: Vec<String> = sim.lines().collect();
    let expected = [
        "Root process 1 created as lover, generation 0",
        "Simulation complete. All 1 processes are lovers.",
        "Maximum generation reached: 0",
    ];
    assert_eq!(lines, expected);

    assert_eq!(depth, Generation(0));
    assert_eq!(sim.process_count(), 1);
    // No parent pipe exists for the root, so nothing was ever written.
    assert!(
        !sim.events()
            .iter()
            .any(|e| matches!(e, Event::LoveSentToParent { .. }))
    );
}

#[test]
fn lovers_send_to_parent_exactly_once_despite_rescheduling() {
    use ProcessKind::{Hater, Lover};
    // Three-level chain: root hater -> hater -> lover. The middle process
    // converges on the child path and is later re-queued as a lover, so
    // its send-once check is exercised across multiple turns.
    let mut sim = scripted(&[Hater, Hater, Lover], &[1, 1]);
    let depth = sim.run();

    let sends: Vec<(Pid, Pid)> = sim
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::LoveSentToParent { pid, ppid } => Some((*pid, *ppid)),
            _ => None,
        })
        .collect();
    assert_eq!(
        sends.iter().filter(|&&(pid, _)| pid == Pid(2)).count(),
        1,
        "middle process must report exactly once"
    );
    assert_eq!(sends.iter().filter(|&&(pid, _)| pid == Pid(3)).count(), 1);

    assert_eq!(depth, Generation(2));
    assert_eq!(sim.lover_count(), 3);
    assert_eq!(sim.process_count(), 3);
}

#[test]
fn forwards_to_every_child_not_only_signalers() {
    use ProcessKind::{Hater, Lover};
    // Root spawns one lover and one hater; only the lover ever signals,
    // but the root forwards love to both on conversion.
    let mut sim = scripted(&[Hater, Lover, Hater, Lover], &[2, 1]);
    let depth = sim.run();

    let forwards: Vec<(Pid, Pid)> = sim
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::LoveForwarded { pid, child } => Some((*pid, *child)),
            _ => None,
        })
        .collect();
    assert!(forwards.contains(&(Pid(1), Pid(2))));
    assert!(
        forwards.contains(&(Pid(1), Pid(3))),
        "silent hater child must receive the forward too"
    );

    let received: Vec<(Pid, Pid)> = sim
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::LoveReceivedFromChild { pid, child } => Some((*pid, *child)),
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![(Pid(1), Pid(2))]);

    assert_eq!(depth, Generation(2));
    assert_eq!(sim.lover_count(), 4);
}

#[test]
fn journal_cap_forces_termination_with_distinct_notice() {
    /// Never draws a lover, so the tree grows until the cap trips.
    struct AllHaters;
    impl Sampler for AllHaters {
        fn draw_kind(&mut self, _p: f64) -> ProcessKind {
            ProcessKind::Hater
        }
        fn draw_brood(&mut self, _min: u32, max: u32) -> u32 {
            max
        }
    }

    let config = SimulationConfig {
        max_events: 50,
        ..SimulationConfig::default()
    };
    let mut sim = Simulation::with_sampler(config, Box::new(AllHaters)).expect("simulation");
    sim.run();

    assert!(sim.was_capped());
    assert!(sim.is_finished());
    let events = sim.events();
    let len = events.len();
    assert_eq!(events[len - 3], Event::StepCapReached);
    assert!(matches!(events[len - 2], Event::Summary { lovers: 0 }));
    assert!(matches!(events[len - 1], Event::MaxGeneration { .. }));
    assert!(
        sim.lines()
            .any(|line| line == "Simulation terminated: too many steps")
    );
}

#[test]
fn turn_reports_rotation_and_retirement() {
    use ProcessKind::{Hater, Lover};
    let mut sim = scripted(&[Hater, Lover], &[1]);

    // First turn: the root spawns its brood and stays in rotation.
    let first = sim.turn().expect("first turn");
    assert_eq!(first.pid, Pid::ROOT);
    assert_eq!(first.kind, Hater);
    assert_eq!(first.outcome, StepOutcome::Continue);
    assert_eq!(sim.process_count(), 2);
    assert_eq!(sim.active_count(), 2);

    // Second turn: still nothing to hear, keep rotating.
    let second = sim.turn().expect("second turn");
    assert_eq!(second.pid, Pid::ROOT);
    assert_eq!(second.outcome, StepOutcome::Continue);

    // Third turn: the lover child reports and retires.
    let third = sim.turn().expect("third turn");
    assert_eq!(third.pid, Pid(2));
    assert_eq!(third.kind, Lover);
    assert_eq!(third.outcome, StepOutcome::Retire);

    // Fourth turn: the root hears it, converges, and retires.
    let fourth = sim.turn().expect("fourth turn");
    assert_eq!(fourth.pid, Pid::ROOT);
    assert_eq!(fourth.kind, Lover);
    assert_eq!(fourth.outcome, StepOutcome::Retire);
}
