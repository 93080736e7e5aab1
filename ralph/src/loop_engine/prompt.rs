//! Prompt construction (§4.7): three templates, one shared completion-marker
//! contract. Every function that reads `pending_prompt` clears it in the
//! same call — injection is consumed exactly once (P5).

use crate::domain::{LoopConfig, LoopState, ModelConfig};

const PLANNING_FOLDER_INSTRUCTIONS: &str = "Maintain ./.planning/plan.md and ./.planning/status.md as you work.";
const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
const PLAN_READY_MARKER: &str = "<promise>PLAN_READY</promise>";

pub fn build_chat_prompt(config: &LoopConfig, state: &mut LoopState) -> String {
    let message = state.pending_prompt.take().unwrap_or_else(|| config.prompt.clone());
    format!("You are working in directory: {}\n\n{}", config.directory.display(), message)
}

pub fn build_execution_prompt(config: &LoopConfig, state: &mut LoopState) -> String {
    let mut sections = vec![format!("- Original Goal: {}", config.prompt)];

    if let Some(pending) = state.pending_prompt.take() {
        sections.push(format!("**User Message**\n{pending}"));
    }
    if let Some(errors) = &state.consecutive_errors {
        sections.push(format!(
            "**Previous Iteration Error**\n{} (repeated {} time(s))",
            errors.last_error_message, errors.count
        ));
    }

    sections.push(PLANNING_FOLDER_INSTRUCTIONS.to_string());
    sections.push(format!("When the task is fully complete, end your response with {COMPLETION_MARKER}"));
    sections.join("\n\n")
}

pub fn build_plan_prompt(config: &LoopConfig, state: &mut LoopState) -> String {
    let feedback_rounds = state.plan_mode.as_ref().map(|p| p.feedback_rounds).unwrap_or(0);
    let mut sections = vec![format!("- Original Goal: {}", config.prompt)];

    if feedback_rounds == 0 {
        sections.push("Write a plan to ./.planning/plan.md and a status summary to ./.planning/status.md.".to_string());
    } else {
        if let Some(feedback) = state.pending_prompt.take() {
            sections.push(format!("**User Feedback**\n{feedback}"));
        }
        if let Some(errors) = &state.consecutive_errors {
            sections.push(format!("**Previous Iteration Error**\n{}", errors.last_error_message));
        }
        sections.push("Refresh ./.planning/plan.md to reflect the feedback above.".to_string());
    }

    sections.push(format!("When the plan is ready, end your response with {PLAN_READY_MARKER}"));
    sections.join("\n\n")
}

/// If `pending_model` is set, promotes it into `config.model` (so the
/// override persists past this iteration) and clears it in the same step.
pub fn resolve_model(config: &mut LoopConfig, state: &mut LoopState) -> ModelConfig {
    if let Some(pending) = state.pending_model.take() {
        config.model = pending.clone();
        pending
    } else {
        config.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConsecutiveErrors, GitConfig, Mode, PlanModeState};
    use std::path::PathBuf;

    fn config() -> LoopConfig {
        LoopConfig {
            id: "loop-1".to_string(),
            name: "demo".to_string(),
            workspace_id: "ws-1".to_string(),
            directory: PathBuf::from("/work/repo"),
            prompt: "Fix the bug".to_string(),
            model: ModelConfig { provider_id: "anthropic".to_string(), model_id: "claude".to_string(), variant: None },
            stop_pattern: crate::domain::DEFAULT_STOP_PATTERN.to_string(),
            git: GitConfig::default(),
            max_iterations: Some(5),
            max_consecutive_errors: Some(3),
            activity_timeout_seconds: 120,
            clear_planning_folder: false,
            plan_mode: false,
            mode: Mode::Loop,
        }
    }

    #[test]
    fn chat_prompt_uses_pending_message_and_clears_it() {
        let cfg = config();
        let mut state = crate::domain::LoopState::new(crate::state_machine::LoopStatus::Idle);
        state.pending_prompt = Some("new goal".to_string());
        let prompt = build_chat_prompt(&cfg, &mut state);
        assert!(prompt.contains("new goal"));
        assert!(state.pending_prompt.is_none());
    }

    #[test]
    fn execution_prompt_includes_user_message_and_error_blocks() {
        let cfg = config();
        let mut state = crate::domain::LoopState::new(crate::state_machine::LoopStatus::Running);
        state.pending_prompt = Some("New goal".to_string());
        state.consecutive_errors = Some(ConsecutiveErrors { last_error_message: "boom".to_string(), count: 2 });
        let prompt = build_execution_prompt(&cfg, &mut state);
        assert!(prompt.contains("Original Goal: Fix the bug"));
        assert!(prompt.contains("**User Message**\nNew goal"));
        assert!(prompt.contains("boom"));
        assert!(prompt.contains(COMPLETION_MARKER));
        assert!(state.pending_prompt.is_none());
    }

    #[test]
    fn plan_prompt_first_round_asks_for_initial_plan() {
        let cfg = config();
        let mut state = crate::domain::LoopState::new(crate::state_machine::LoopStatus::Planning);
        state.plan_mode = Some(PlanModeState::default());
        let prompt = build_plan_prompt(&cfg, &mut state);
        assert!(prompt.contains(".planning/plan.md"));
        assert!(prompt.contains(PLAN_READY_MARKER));
    }

    #[test]
    fn plan_prompt_later_round_includes_feedback() {
        let cfg = config();
        let mut state = crate::domain::LoopState::new(crate::state_machine::LoopStatus::Planning);
        state.plan_mode = Some(PlanModeState { feedback_rounds: 1, ..Default::default() });
        state.pending_prompt = Some("Add logging".to_string());
        let prompt = build_plan_prompt(&cfg, &mut state);
        assert!(prompt.contains("**User Feedback**\nAdd logging"));
        assert!(state.pending_prompt.is_none());
    }

    #[test]
    fn resolve_model_promotes_and_clears_pending() {
        let mut cfg = config();
        let mut state = crate::domain::LoopState::new(crate::state_machine::LoopStatus::Idle);
        state.pending_model = Some(ModelConfig { provider_id: "openai".to_string(), model_id: "gpt".to_string(), variant: None });
        let resolved = resolve_model(&mut cfg, &mut state);
        assert_eq!(resolved.provider_id, "openai");
        assert_eq!(cfg.model.provider_id, "openai");
        assert!(state.pending_model.is_none());
    }
}
