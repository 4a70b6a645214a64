//! Run state and the transition function
//!
//! `transition` is pure: it maps (phase, trigger, counters, policy) to the
//! next phase and the counter to bump. `RunState` is the single-owner record
//! that applies those decisions; nothing else writes counters or status.

use crate::classify::ErrorCategory;
use crate::patch::unified_diff;
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const REPRODUCTION_CEILING: u32 = 2;
pub const FIX_CEILING: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    Success,
    Failed,
    InfraStop,
    NotReproducible,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Running => "RUNNING",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
            Status::InfraStop => "INFRA_STOP",
            Status::NotReproducible => "NOT_REPRODUCIBLE",
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Failed | Status::Running => 1,
            Status::InfraStop => 2,
            Status::NotReproducible => 3,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the machine is. `Done` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Reproduce,
    Classify,
    Fix,
    Done(Status),
}

/// Facts reported by the stage handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    TargetMissing,
    TargetPresent,
    VerdictCaptured,
    Classified {
        category: ErrorCategory,
        /// The reproduction run exited non-zero or timed out.
        failed: bool,
        /// An exception signature was found in the failure output.
        exception: bool,
    },
    FixPassed,
    /// Any gate in the fix pipeline rejected the attempt.
    FixRejected,
    /// The sandbox backend could not create an environment.
    BackendUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Reproduction,
    Fix,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub reproduction: u32,
    pub fix: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policy {
    /// A clean reproduction run (exit 0, nothing on stderr) ends the run
    /// instead of retrying.
    pub stop_on_clean_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    pub bump: Option<Counter>,
}

impl Transition {
    fn to(next: Phase) -> Self {
        Self { next, bump: None }
    }

    fn bumping(next: Phase, counter: Counter) -> Self {
        Self {
            next,
            bump: Some(counter),
        }
    }
}

/// Decide the next phase. Triggers that make no sense in `phase` leave it
/// unchanged.
pub fn transition(phase: Phase, trigger: Trigger, counters: Counters, policy: Policy) -> Transition {
    use Phase::*;

    match (phase, trigger) {
        (Done(status), _) => Transition::to(Done(status)),

        (Setup, Trigger::TargetMissing) => Transition::to(Done(Status::Failed)),
        (Setup, Trigger::TargetPresent) => Transition::to(Reproduce),

        (Reproduce | Fix, Trigger::BackendUnavailable) => Transition::to(Done(Status::InfraStop)),
        (Reproduce, Trigger::VerdictCaptured) => Transition::to(Classify),

        (Classify, Trigger::Classified { category, failed, exception }) => {
            if category == ErrorCategory::Infra {
                return Transition::to(Done(Status::InfraStop));
            }
            if failed && exception && category == ErrorCategory::Code {
                return Transition::to(Fix);
            }
            let clean_run = !failed && category == ErrorCategory::None;
            let exhausted = counters.reproduction + 1 >= REPRODUCTION_CEILING;
            if exhausted || (clean_run && policy.stop_on_clean_run) {
                Transition::bumping(Done(Status::NotReproducible), Counter::Reproduction)
            } else {
                Transition::bumping(Reproduce, Counter::Reproduction)
            }
        }

        (Fix, Trigger::FixPassed) => Transition::bumping(Done(Status::Success), Counter::Fix),
        (Fix, Trigger::FixRejected) => {
            if counters.fix + 1 >= FIX_CEILING {
                Transition::bumping(Done(Status::Failed), Counter::Fix)
            } else {
                Transition::bumping(Fix, Counter::Fix)
            }
        }

        (phase, _) => Transition::to(phase),
    }
}

/// Names used in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Setup,
    Reproduce,
    Classify,
    Fix,
    Generate,
    Preflight,
    Apply,
    Verify,
    PrDescription,
    InfraStop,
    NotReproducible,
    Success,
    Failed,
    Teardown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Setup => "SETUP",
            Stage::Reproduce => "REPRODUCE",
            Stage::Classify => "CLASSIFY",
            Stage::Fix => "FIX",
            Stage::Generate => "GENERATE",
            Stage::Preflight => "PREFLIGHT",
            Stage::Apply => "APPLY",
            Stage::Verify => "VERIFY",
            Stage::PrDescription => "PR_DESCRIPTION",
            Stage::InfraStop => "INFRA_STOP",
            Stage::NotReproducible => "NOT_REPRODUCIBLE",
            Stage::Success => "SUCCESS",
            Stage::Failed => "FAILED",
            Stage::Teardown => "TEARDOWN",
        }
    }

    fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Setup => Stage::Setup,
            Phase::Reproduce => Stage::Reproduce,
            Phase::Classify => Stage::Classify,
            Phase::Fix => Stage::Fix,
            Phase::Done(Status::Success) => Stage::Success,
            Phase::Done(Status::InfraStop) => Stage::InfraStop,
            Phase::Done(Status::NotReproducible) => Stage::NotReproducible,
            Phase::Done(_) => Stage::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub ordinal: u64,
    pub stage: Stage,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    pub at: DateTime<Utc>,
}

/// Append-only structured trail of the run.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<RunEvent>,
}

impl EventLog {
    pub fn record(&mut self, stage: Stage, message: impl Into<String>, verdict: Option<String>) {
        let event = RunEvent {
            ordinal: self.entries.len() as u64 + 1,
            stage,
            message: message.into(),
            verdict,
            at: Utc::now(),
        };
        match &event.verdict {
            Some(verdict) => tracing::info!(
                stage = event.stage.as_str(),
                ordinal = event.ordinal,
                verdict = %verdict,
                "{}",
                event.message
            ),
            None => tracing::info!(
                stage = event.stage.as_str(),
                ordinal = event.ordinal,
                "{}",
                event.message
            ),
        }
        self.entries.push(event);
    }

    pub fn entries(&self) -> &[RunEvent] {
        &self.entries
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.entries.iter().filter(|e| e.stage == stage).count()
    }
}

/// Mutable record of one run. Owned by the orchestrator, never shared.
#[derive(Debug)]
pub struct RunState {
    pub run_id: String,
    pub target_file: PathBuf,
    pub error_descriptor: String,
    pub error_category: ErrorCategory,
    workspace: Option<Workspace>,
    torn_down: bool,
    counters: Counters,
    policy: Policy,
    phase: Phase,
    reason: String,
    baseline: Option<String>,
    latest_patch: Option<String>,
    pub events: EventLog,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: String, target_file: PathBuf, error_descriptor: String, policy: Policy) -> Self {
        Self {
            run_id,
            target_file,
            error_descriptor,
            error_category: ErrorCategory::Unclassified,
            workspace: None,
            torn_down: false,
            counters: Counters::default(),
            policy,
            phase: Phase::Setup,
            reason: String::new(),
            baseline: None,
            latest_patch: None,
            events: EventLog::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self) -> Status {
        match self.phase {
            Phase::Done(status) => status,
            _ => Status::Running,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Why the run ended. Empty while running.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Feed a trigger through the transition function and apply the result.
    /// `note` becomes the terminal reason if this step ends the run.
    pub fn advance(&mut self, trigger: Trigger, note: &str) -> Phase {
        let before = self.phase;
        if before.is_done() {
            return before;
        }
        let step = transition(before, trigger, self.counters, self.policy);

        match step.bump {
            Some(Counter::Reproduction) => self.counters.reproduction += 1,
            Some(Counter::Fix) => self.counters.fix += 1,
            None => {}
        }
        self.phase = step.next;

        if step.next != before || step.bump.is_some() {
            let message = if note.is_empty() {
                format!("{:?} -> {:?}", before, step.next)
            } else {
                note.to_string()
            };
            self.events.record(Stage::for_phase(step.next), message, None);
        }

        if let Phase::Done(_) = step.next {
            self.reason = note.to_string();
            self.finished_at = Some(Utc::now());
        }
        self.phase
    }

    pub fn attach_workspace(&mut self, workspace: Workspace) {
        self.workspace = Some(workspace);
    }

    /// Destroy the workspace, if one was created. Runs once per run; later
    /// calls are no-ops.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let message = match self.workspace.take() {
            None => "No workspace was created".to_string(),
            Some(workspace) => match workspace.destroy() {
                Ok(()) => "Workspace destroyed".to_string(),
                Err(e) => {
                    tracing::warn!(error = %e, "Workspace cleanup failed");
                    format!("Workspace cleanup failed: {}", e)
                }
            },
        };
        self.events.record(Stage::Teardown, message, None);
    }

    pub fn set_baseline(&mut self, content: String) {
        self.baseline = Some(content);
    }

    pub fn baseline(&self) -> Option<&str> {
        self.baseline.as_deref()
    }

    pub fn set_latest_patch(&mut self, content: String) {
        self.latest_patch = Some(content);
    }

    pub fn latest_patch(&self) -> Option<&str> {
        self.latest_patch.as_deref()
    }

    fn label(&self) -> String {
        self.target_file
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Always recomputed from the baseline and the latest patch.
    pub fn latest_diff(&self) -> String {
        match (self.baseline.as_deref(), self.latest_patch.as_deref()) {
            (Some(baseline), Some(patch)) => unified_diff(baseline, patch, &self.label()),
            _ => String::new(),
        }
    }
}

impl Phase {
    pub fn is_done(&self) -> bool {
        matches!(self, Phase::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(category: ErrorCategory, failed: bool) -> Trigger {
        Trigger::Classified {
            category,
            failed,
            exception: category == ErrorCategory::Code,
        }
    }

    fn state() -> RunState {
        RunState::new(
            "run".to_string(),
            PathBuf::from("app.py"),
            "crash".to_string(),
            Policy::default(),
        )
    }

    #[test]
    fn test_setup_edges() {
        let c = Counters::default();
        let p = Policy::default();
        assert_eq!(
            transition(Phase::Setup, Trigger::TargetMissing, c, p).next,
            Phase::Done(Status::Failed)
        );
        assert_eq!(
            transition(Phase::Setup, Trigger::TargetPresent, c, p).next,
            Phase::Reproduce
        );
    }

    #[test]
    fn test_infra_beats_everything_in_classify() {
        let step = transition(
            Phase::Classify,
            classified(ErrorCategory::Infra, true),
            Counters::default(),
            Policy::default(),
        );
        assert_eq!(step.next, Phase::Done(Status::InfraStop));
        assert_eq!(step.bump, None);
    }

    #[test]
    fn test_confirmed_reproduction_goes_to_fix() {
        let step = transition(
            Phase::Classify,
            classified(ErrorCategory::Code, true),
            Counters::default(),
            Policy::default(),
        );
        assert_eq!(step, Transition::to(Phase::Fix));
    }

    #[test]
    fn test_failure_without_exception_is_not_confirmed() {
        let step = transition(
            Phase::Classify,
            Trigger::Classified {
                category: ErrorCategory::Code,
                failed: true,
                exception: false,
            },
            Counters::default(),
            Policy::default(),
        );
        assert_eq!(step, Transition::bumping(Phase::Reproduce, Counter::Reproduction));
    }

    #[test]
    fn test_code_with_zero_exit_is_not_confirmed() {
        let step = transition(
            Phase::Classify,
            classified(ErrorCategory::Code, false),
            Counters::default(),
            Policy::default(),
        );
        assert_eq!(step, Transition::bumping(Phase::Reproduce, Counter::Reproduction));
    }

    #[test]
    fn test_reproduction_ceiling() {
        let p = Policy::default();
        let first = transition(
            Phase::Classify,
            classified(ErrorCategory::None, false),
            Counters { reproduction: 0, fix: 0 },
            p,
        );
        assert_eq!(first.next, Phase::Reproduce);
        let second = transition(
            Phase::Classify,
            classified(ErrorCategory::None, true),
            Counters { reproduction: 1, fix: 0 },
            p,
        );
        assert_eq!(second.next, Phase::Done(Status::NotReproducible));
        assert_eq!(second.bump, Some(Counter::Reproduction));
    }

    #[test]
    fn test_stop_on_clean_run_policy() {
        let p = Policy {
            stop_on_clean_run: true,
        };
        let clean = transition(
            Phase::Classify,
            classified(ErrorCategory::None, false),
            Counters::default(),
            p,
        );
        assert_eq!(clean.next, Phase::Done(Status::NotReproducible));
        // A silent crash is not a clean run.
        let silent_crash = transition(
            Phase::Classify,
            classified(ErrorCategory::None, true),
            Counters::default(),
            p,
        );
        assert_eq!(silent_crash.next, Phase::Reproduce);
    }

    #[test]
    fn test_fix_ceiling() {
        let p = Policy::default();
        for fix in 0..FIX_CEILING - 1 {
            let step = transition(Phase::Fix, Trigger::FixRejected, Counters { reproduction: 0, fix }, p);
            assert_eq!(step.next, Phase::Fix);
        }
        let last = transition(
            Phase::Fix,
            Trigger::FixRejected,
            Counters {
                reproduction: 0,
                fix: FIX_CEILING - 1,
            },
            p,
        );
        assert_eq!(last.next, Phase::Done(Status::Failed));
        assert_eq!(
            transition(Phase::Fix, Trigger::FixPassed, Counters::default(), p),
            Transition::bumping(Phase::Done(Status::Success), Counter::Fix)
        );
    }

    #[test]
    fn test_backend_unavailable_in_both_phases() {
        for phase in [Phase::Reproduce, Phase::Fix] {
            assert_eq!(
                transition(phase, Trigger::BackendUnavailable, Counters::default(), Policy::default()).next,
                Phase::Done(Status::InfraStop)
            );
        }
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let triggers = [
            Trigger::TargetMissing,
            Trigger::TargetPresent,
            Trigger::VerdictCaptured,
            classified(ErrorCategory::Infra, true),
            Trigger::FixPassed,
            Trigger::FixRejected,
            Trigger::BackendUnavailable,
        ];
        for status in [Status::Success, Status::Failed, Status::InfraStop, Status::NotReproducible] {
            for trigger in triggers {
                let step = transition(Phase::Done(status), trigger, Counters::default(), Policy::default());
                assert_eq!(step, Transition::to(Phase::Done(status)));
            }
        }
    }

    #[test]
    fn test_nonsense_trigger_is_ignored() {
        let step = transition(Phase::Setup, Trigger::FixPassed, Counters::default(), Policy::default());
        assert_eq!(step, Transition::to(Phase::Setup));
    }

    #[test]
    fn test_run_state_counters_never_exceed_ceilings() {
        let mut run = state();
        run.advance(Trigger::TargetPresent, "");
        run.advance(Trigger::VerdictCaptured, "");
        run.advance(classified(ErrorCategory::Code, true), "");
        for _ in 0..10 {
            run.advance(Trigger::FixRejected, "verification failed");
        }
        assert_eq!(run.status(), Status::Failed);
        assert_eq!(run.counters().fix, FIX_CEILING);
        assert_eq!(run.reason(), "verification failed");
    }

    #[test]
    fn test_status_is_write_once() {
        let mut run = state();
        run.advance(Trigger::TargetMissing, "app.py not found");
        assert_eq!(run.status(), Status::Failed);
        run.advance(Trigger::TargetPresent, "ignored");
        run.advance(Trigger::FixPassed, "ignored");
        assert_eq!(run.status(), Status::Failed);
        assert_eq!(run.reason(), "app.py not found");
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_latest_diff_is_derived() {
        let mut run = state();
        assert_eq!(run.latest_diff(), "");
        run.set_baseline("x = 1\n".to_string());
        assert_eq!(run.latest_diff(), "");
        run.set_latest_patch("x = 2\n".to_string());
        let first = run.latest_diff();
        assert!(first.contains("+x = 2"));
        run.set_latest_patch("x = 3\n".to_string());
        let second = run.latest_diff();
        assert!(second.contains("+x = 3"));
        assert!(!second.contains("x = 2"));
    }

    #[test]
    fn test_event_ordinals_are_sequential() {
        let mut log = EventLog::default();
        log.record(Stage::Setup, "a", None);
        log.record(Stage::Reproduce, "b", Some("exit=1".to_string()));
        let ordinals: Vec<u64> = log.entries().iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert_eq!(log.count(Stage::Reproduce), 1);
    }

    #[test]
    fn test_teardown_runs_once() {
        let repo = tempfile::TempDir::new().unwrap();
        std::fs::write(repo.path().join("app.py"), "x = 1\n").unwrap();
        let mut run = state();
        let workspace = Workspace::create(repo.path()).unwrap();
        let path = workspace.path().to_path_buf();
        run.attach_workspace(workspace);

        run.teardown();
        run.teardown();
        assert!(!path.exists());
        assert_eq!(run.events.count(Stage::Teardown), 1);
    }

    #[test]
    fn test_teardown_without_workspace_is_recorded_once() {
        let mut run = state();
        run.teardown();
        run.teardown();
        assert_eq!(run.events.count(Stage::Teardown), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Status::Success.exit_code(), 0);
        assert_eq!(Status::Failed.exit_code(), 1);
        assert_eq!(Status::InfraStop.exit_code(), 2);
        assert_eq!(Status::NotReproducible.exit_code(), 3);
    }
}
