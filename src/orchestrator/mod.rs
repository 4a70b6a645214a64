//! Remediation orchestrator
//!
//! Drives one run through SETUP, REPRODUCE, CLASSIFY and FIX until a
//! terminal status is reached. Every recoverable failure is turned into a
//! retry-or-terminate decision here; `run` never returns an error.
//!
//! Gate order inside FIX is fixed: generate, validate, preflight, apply,
//! verify. A failed gate skips the rest and consumes one fix attempt.

pub mod state;


pub use state::{
    Counters, EventLog, Phase, Policy, RunEvent, RunState, Stage, Status, Trigger, FIX_CEILING,
    REPRODUCTION_CEILING,
};

use crate::classify::{classify_detailed, ErrorCategory};
use crate::config::{Config, ReproductionConfig, ReproductionStrategy};
use crate::gateway::{Gateway, GenerationContext, PromptKind};
use crate::patch::{changed_blocks, normalize_trailing_newline, ChangedBlock, DiffSummary, ParseResult, PatchEngine};
use crate::sandbox::{python_command, ExecutionVerdict, Sandbox, SandboxSpec, VerificationMode};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File name for generated reproduction scripts inside the workspace.
pub const REPRODUCTION_SCRIPT: &str = "opsguard_repro.py";

/// Failure text kept between fix attempts.
const MAX_FAILURE_CHARS: usize = 8000;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub repo: PathBuf,
    pub error_description: String,
    /// Relative to `repo`. Also the file being fixed.
    pub entry: PathBuf,
    pub mode: VerificationMode,
}

impl RunRequest {
    pub fn new(repo: impl Into<PathBuf>, error_description: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            error_description: error_description.into(),
            entry: PathBuf::from("app.py"),
            mode: VerificationMode::Entry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub sandbox_timeout: Duration,
    /// Network inside the sandbox even when no setup step needs it.
    pub allow_network: bool,
    pub reproduction: ReproductionConfig,
    pub pr_description: bool,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sandbox_timeout: Duration::from_secs(config.sandbox.timeout_secs),
            allow_network: !config.sandbox.disable_network,
            reproduction: config.reproduction.clone(),
            pr_description: config.artifacts.pr_description,
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Everything the caller learns about a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: Status,
    pub reason: String,
    pub error_category: ErrorCategory,
    pub target_file: PathBuf,
    pub counters: Counters,
    pub latest_patch: Option<String>,
    pub diff: String,
    pub diff_summary: DiffSummary,
    pub changed_blocks: Vec<ChangedBlock>,
    pub pr_description: Option<String>,
    pub events: Vec<RunEvent>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    fn from_state(state: RunState, pr_description: Option<String>) -> Self {
        let diff = state.latest_diff();
        let (diff_summary, blocks) = match (state.baseline(), state.latest_patch()) {
            (Some(baseline), Some(patch)) => (
                DiffSummary::between(baseline, patch),
                changed_blocks(baseline, patch),
            ),
            _ => (DiffSummary::default(), Vec::new()),
        };
        Self {
            status: state.status(),
            reason: state.reason().to_string(),
            error_category: state.error_category,
            counters: state.counters(),
            latest_patch: state.latest_patch().map(str::to_string),
            diff,
            diff_summary,
            changed_blocks: blocks,
            pr_description,
            events: state.events.entries().to_vec(),
            started_at: state.started_at,
            finished_at: state.finished_at.unwrap_or_else(Utc::now),
            run_id: state.run_id,
            target_file: state.target_file,
        }
    }
}

enum FixAttempt {
    Passed(ExecutionVerdict),
    Rejected(String),
    BackendUnavailable(String),
}

pub struct Orchestrator {
    sandbox: Arc<dyn Sandbox>,
    gateway: Gateway,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(sandbox: Arc<dyn Sandbox>, gateway: Gateway, options: OrchestratorOptions) -> Self {
        Self {
            sandbox,
            gateway,
            options,
        }
    }

    /// Run to a terminal status. The workspace is destroyed before this
    /// returns, whatever the outcome.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let run_id = uuid::Uuid::new_v4().to_string();
        let policy = Policy {
            stop_on_clean_run: self.options.reproduction.stop_on_clean_run,
        };
        let mut state = RunState::new(
            run_id,
            request.entry.clone(),
            request.error_description.clone(),
            policy,
        );
        tracing::info!(
            run_id = %state.run_id,
            repo = %request.repo.display(),
            entry = %request.entry.display(),
            mode = request.mode.label(),
            sandbox = self.sandbox.name(),
            "Run started"
        );

        self.drive(&mut state, &request).await;

        let pr_description = if state.status() == Status::Success && self.options.pr_description {
            self.describe(&mut state).await
        } else {
            None
        };

        state.teardown();
        tracing::info!(
            run_id = %state.run_id,
            status = state.status().as_str(),
            reproduction_attempts = state.counters().reproduction,
            fix_attempts = state.counters().fix,
            "Run finished"
        );
        RunOutcome::from_state(state, pr_description)
    }

    async fn drive(&self, state: &mut RunState, request: &RunRequest) {
        if let Err(reason) = check_inputs(request) {
            state.advance(Trigger::TargetMissing, &reason);
            return;
        }

        let workspace = match Workspace::create(&request.repo) {
            Ok(workspace) => workspace,
            Err(e) => {
                state.advance(Trigger::TargetMissing, &format!("Workspace setup failed: {}", e));
                return;
            }
        };
        let workspace_path = workspace.path().to_path_buf();
        let engine = PatchEngine::new(&workspace_path, &request.entry);
        state.attach_workspace(workspace);

        let baseline = match engine.read_target() {
            Ok(content) => content,
            Err(e) => {
                state.advance(Trigger::TargetMissing, &e.to_string());
                return;
            }
        };
        state.set_baseline(baseline.clone());
        state.advance(Trigger::TargetPresent, "Workspace ready");

        let Some(failure) = self
            .reproduce(state, request, &engine, &baseline, &workspace_path)
            .await
        else {
            return;
        };
        self.fix(state, request, &engine, &baseline, &workspace_path, failure)
            .await;
    }

    /// Loop until the failure is confirmed (returns its diagnostics) or the
    /// run ends.
    async fn reproduce(
        &self,
        state: &mut RunState,
        request: &RunRequest,
        engine: &PatchEngine,
        baseline: &str,
        workspace: &Path,
    ) -> Option<String> {

        while state.phase() == Phase::Reproduce {
            let attempt = state.counters().reproduction + 1;
            let spec = self
                .reproduction_spec(state, request, engine, baseline, workspace)
                .await;
            let result = self.sandbox.execute(&spec).await;
            remove_reproduction_script(workspace);

            let verdict = match result {
                Ok(verdict) => verdict,
                Err(e) if e.is_infrastructure() => {
                    state.advance(
                        Trigger::BackendUnavailable,
                        &format!("Sandbox unavailable during reproduction: {}", e),
                    );
                    return None;
                }
                Err(e) => {
                    // Local staging trouble says nothing about the code.
                    // Counted as a failed, unclassifiable attempt.
                    tracing::warn!(error = %e, "Reproduction run could not be staged");
                    ExecutionVerdict {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: String::new(),
                        timed_out: false,
                    }
                }
            };

            state.events.record(
                Stage::Reproduce,
                format!("Reproduction attempt {}", attempt),
                Some(verdict.summary()),
            );
            state.advance(Trigger::VerdictCaptured, "Verdict captured");

            let failure_output = request.mode.failure_output(&verdict);
            let classification = classify_detailed(&failure_output);
            state.error_category = classification.category;
            state.events.record(
                Stage::Classify,
                format!(
                    "{}: {}",
                    classification.category.as_str(),
                    classification.reason
                ),
                None,
            );

            let confirmed = !verdict.passed() && classification.signature.is_some();
            let note = match classification.category {
                ErrorCategory::Infra => format!(
                    "Infrastructure failure during reproduction: {}",
                    classification.reason
                ),
                ErrorCategory::Code if confirmed => {
                    format!("Failure reproduced: {}", classification.reason)
                }
                _ => format!(
                    "Failure not reproduced on attempt {} of {} ({})",
                    attempt,
                    REPRODUCTION_CEILING,
                    verdict.summary()
                ),
            };
            let next = state.advance(
                Trigger::Classified {
                    category: classification.category,
                    failed: !verdict.passed(),
                    exception: classification.signature.is_some(),
                },
                &note,
            );
            if next == Phase::Fix {
                return Some(crate::util::tail_chars(&failure_output, MAX_FAILURE_CHARS));
            }
        }
        None
    }

    async fn reproduction_spec(
        &self,
        state: &mut RunState,
        request: &RunRequest,
        engine: &PatchEngine,
        baseline: &str,
        workspace: &Path,
    ) -> SandboxSpec {
        if self.options.reproduction.strategy == ReproductionStrategy::Generated {
            let ctx = GenerationContext {
                error_description: request.error_description.clone(),
                target_file: engine.label(),
                original_content: baseline.to_string(),
                ..GenerationContext::default()
            };
            match self.gateway.generate(PromptKind::ReproductionScript, &ctx).await {
                Ok(script) => match std::fs::write(workspace.join(REPRODUCTION_SCRIPT), script) {
                    Ok(()) => {
                        state.events.record(Stage::Reproduce, "Generated reproduction script", None);
                        return SandboxSpec::new(
                            workspace,
                            python_command(Path::new(REPRODUCTION_SCRIPT)),
                            self.options.sandbox_timeout,
                        )
                        .with_network(self.options.allow_network);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not write reproduction script");
                    }
                },
                Err(e) => {
                    state.events.record(
                        Stage::Reproduce,
                        format!("Reproduction script generation failed, using entry: {}", e),
                        None,
                    );
                }
            }
        }
        self.verification_spec(request, workspace)
    }

    fn verification_spec(&self, request: &RunRequest, workspace: &Path) -> SandboxSpec {
        SandboxSpec::new(
            workspace,
            request.mode.command(&request.entry),
            self.options.sandbox_timeout,
        )
        .with_setup(request.mode.setup_commands())
        .with_network(self.options.allow_network || request.mode.needs_network())
    }

    async fn fix(
        &self,
        state: &mut RunState,
        request: &RunRequest,
        engine: &PatchEngine,
        baseline: &str,
        workspace: &Path,
        mut failure: String,
    ) {

        while state.phase() == Phase::Fix {
            let attempt = state.counters().fix + 1;
            let ctx = GenerationContext {
                error_description: request.error_description.clone(),
                target_file: engine.label(),
                original_content: baseline.to_string(),
                failure_output: Some(failure.clone()),
                attempt,
                diff: None,
            };

            match self
                .fix_attempt(state, request, engine, baseline, &ctx, workspace)
                .await
            {
                FixAttempt::Passed(verdict) => {
                    state.events.record(
                        Stage::Verify,
                        format!("Fix attempt {} verified", attempt),
                        Some(verdict.summary()),
                    );
                    state.advance(
                        Trigger::FixPassed,
                        &format!("Fix verified on attempt {}", attempt),
                    );
                }
                FixAttempt::Rejected(reason) => {
                    restore_baseline(engine, baseline);
                    let note = format!(
                        "Fix attempt {} of {} rejected: {}",
                        attempt,
                        FIX_CEILING,
                        crate::util::truncate(crate::util::last_line(&reason), 200)
                    );
                    failure = crate::util::tail_chars(&reason, MAX_FAILURE_CHARS);
                    state.advance(Trigger::FixRejected, &note);
                }
                FixAttempt::BackendUnavailable(reason) => {
                    restore_baseline(engine, baseline);
                    state.advance(
                        Trigger::BackendUnavailable,
                        &format!("Sandbox unavailable during verification: {}", reason),
                    );
                }
            }
        }
    }

    async fn fix_attempt(
        &self,
        state: &mut RunState,
        request: &RunRequest,
        engine: &PatchEngine,
        baseline: &str,
        ctx: &GenerationContext,
        workspace: &Path,
    ) -> FixAttempt {
        // Generation and validation.
        let candidate = match self.gateway.generate(PromptKind::FixContent, ctx).await {
            Ok(text) => normalize_trailing_newline(baseline, text),
            Err(e) => {
                let reason = format!("Generation failed: {}", e);
                state.events.record(Stage::Generate, reason.clone(), None);
                return FixAttempt::Rejected(reason);
            }
        };
        state.set_latest_patch(candidate.clone());
        state.events.record(
            Stage::Generate,
            format!("Fix attempt {}: candidate accepted by gateway", ctx.attempt),
            None,
        );

        if let ParseResult::SyntaxInvalid(issue) = engine.preflight(&candidate) {
            let reason = format!("Preflight rejected candidate: syntax error at {}", issue);
            state.events.record(Stage::Preflight, reason.clone(), None);
            return FixAttempt::Rejected(reason);
        }

        let applied = match engine.apply(baseline, &candidate) {
            Ok(applied) => applied,
            Err(e) => {
                let reason = format!("Patch could not be applied: {}", e);
                state.events.record(Stage::Apply, reason.clone(), None);
                return FixAttempt::Rejected(reason);
            }
        };
        let summary = DiffSummary::between(baseline, &candidate);
        state.events.record(
            Stage::Apply,
            format!(
                "Applied to {} (+{} -{})",
                engine.label(),
                summary.lines_added,
                summary.lines_removed
            ),
            None,
        );
        tracing::debug!(diff = %applied.unified_diff, "Candidate diff");

        let spec = self.verification_spec(request, workspace);
        match self.sandbox.execute(&spec).await {
            Ok(verdict) if verdict.passed() => FixAttempt::Passed(verdict),
            Ok(verdict) => {
                state.events.record(
                    Stage::Verify,
                    format!("Fix attempt {} failed verification", ctx.attempt),
                    Some(verdict.summary()),
                );
                let failure_output = request.mode.failure_output(&verdict);
                let reason = if failure_output.trim().is_empty() {
                    format!("Verification failed with {}", verdict.summary())
                } else {
                    failure_output
                };
                FixAttempt::Rejected(reason)
            }
            Err(e) if e.is_infrastructure() => FixAttempt::BackendUnavailable(e.to_string()),
            Err(e) => {
                let reason = format!("Verification run could not be staged: {}", e);
                state.events.record(Stage::Verify, reason.clone(), None);
                FixAttempt::Rejected(reason)
            }
        }
    }

    /// Optional PR text for a verified fix. Never affects the status.
    async fn describe(&self, state: &mut RunState) -> Option<String> {
        let ctx = GenerationContext {
            error_description: state.error_descriptor.clone(),
            target_file: state.target_file.display().to_string(),
            original_content: state.baseline().unwrap_or_default().to_string(),
            diff: Some(state.latest_diff()),
            ..GenerationContext::default()
        };
        match self.gateway.generate(PromptKind::PrDescription, &ctx).await {
            Ok(text) => {
                state.events.record(Stage::PrDescription, "PR description generated", None);
                Some(text)
            }
            Err(e) => {
                state.events.record(
                    Stage::PrDescription,
                    format!("PR description skipped: {}", e),
                    None,
                );
                None
            }
        }
    }
}

/// Input checks against the source repository, before any copy is made.
fn check_inputs(request: &RunRequest) -> Result<(), String> {
    if !request.repo.is_dir() {
        return Err(format!("Repository not found: {}", request.repo.display()));
    }
    let entry = request.repo.join(&request.entry);
    if !entry.is_file() {
        return Err(format!("Entry file not found: {}", entry.display()));
    }
    if let VerificationMode::Pytest { tests_dir } = &request.mode {
        let tests = request.repo.join(tests_dir);
        if !tests.is_dir() {
            return Err(format!("Test directory not found: {}", tests.display()));
        }
    }
    Ok(())
}

fn restore_baseline(engine: &PatchEngine, baseline: &str) {
    if let Err(e) = engine.restore(baseline) {
        tracing::warn!(error = %e, "Failed to restore baseline");
    }
}

fn remove_reproduction_script(workspace: &Path) {
    let script = workspace.join(REPRODUCTION_SCRIPT);
    if script.exists() {
        if let Err(e) = std::fs::remove_file(&script) {
            tracing::warn!(error = %e, "Failed to remove reproduction script");
        }
    }
}
