//! Per-phase prompt assembly.
//!
//! Templates are embedded at build time and can be overridden per phase by a
//! `<phase>.md` file in the prompts directory.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::signals::{COMPLETION_MARKER, NO_WORK_MARKER};
use crate::core::types::{PhaseName, ValidateScope, WorkItem};

const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const COMMIT_TEMPLATE: &str = include_str!("prompts/commit.md");
const VALIDATE_TEMPLATE: &str = include_str!("prompts/validate.md");

#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    id: String,
    title: String,
}

impl TaskContext {
    fn from_item(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
        }
    }
}

/// Everything a phase prompt can reference.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub phase: PhaseName,
    pub task: &'a WorkItem,
    pub iteration: u32,
    pub round: u32,
    /// Review output from the previous round, fed back into `implement`.
    pub feedback: Option<&'a str>,
    /// Scope of a `validate` phase.
    pub validate: Option<(ValidateScope, &'a str)>,
}

/// Template engine wrapper around minijinja.
pub struct PromptBuilder {
    env: Environment<'static>,
    overrides_dir: Option<PathBuf>,
}

impl PromptBuilder {
    pub fn new(overrides_dir: Option<PathBuf>) -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        for (name, source) in [
            ("implement", IMPLEMENT_TEMPLATE),
            ("review", REVIEW_TEMPLATE),
            ("commit", COMMIT_TEMPLATE),
            ("validate", VALIDATE_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("embedded prompt templates should be valid");
        }
        Self { env, overrides_dir }
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let ctx = context! {
            phase => input.phase.as_str(),
            task => TaskContext::from_item(input.task),
            iteration => input.iteration,
            round => input.round,
            feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
            scope => input.validate.map(|(scope, _)| scope.as_str()),
            scope_id => input.validate.map(|(_, id)| id),
            completion_marker => COMPLETION_MARKER,
            no_work_marker => NO_WORK_MARKER,
        };

        if let Some(source) = self.load_override(input.phase)? {
            debug!(phase = %input.phase, "rendering prompt override");
            return self
                .env
                .render_str(&source, ctx)
                .with_context(|| format!("render {} prompt override", input.phase));
        }
        let template = self.env.get_template(input.phase.as_str())?;
        template
            .render(ctx)
            .with_context(|| format!("render {} prompt", input.phase))
    }

    fn load_override(&self, phase: PhaseName) -> Result<Option<String>> {
        let Some(dir) = &self.overrides_dir else {
            return Ok(None);
        };
        let path = override_path(dir, phase);
        match fs::read_to_string(&path) {
            Ok(source) => Ok(Some(source)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read prompt override {}", path.display())),
        }
    }
}

fn override_path(dir: &Path, phase: PhaseName) -> PathBuf {
    dir.join(format!("{phase}.md"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::item;

    fn inputs<'a>(phase: PhaseName, task: &'a WorkItem) -> PromptInputs<'a> {
        PromptInputs {
            phase,
            task,
            iteration: 4,
            round: 1,
            feedback: None,
            validate: None,
        }
    }

    #[test]
    fn implement_prompt_names_task_and_markers() {
        let mut task = item("2.3");
        task.title = "Parse headers".to_string();
        let prompt = PromptBuilder::new(None)
            .render(&inputs(PhaseName::Implement, &task))
            .expect("render");
        assert!(prompt.contains("id: 2.3"));
        assert!(prompt.contains("title: Parse headers"));
        assert!(prompt.contains(COMPLETION_MARKER));
        assert!(prompt.contains(NO_WORK_MARKER));
        assert!(!prompt.contains("Review feedback"));
    }

    #[test]
    fn retry_round_includes_feedback() {
        let task = item("2.3");
        let mut input = inputs(PhaseName::Implement, &task);
        input.round = 2;
        input.feedback = Some("missing error handling in parse()");
        let prompt = PromptBuilder::new(None).render(&input).expect("render");
        assert!(prompt.contains("implementation round 2"));
        assert!(prompt.contains("missing error handling in parse()"));
    }

    #[test]
    fn review_prompt_documents_verdict_block() {
        let task = item("2.3");
        let prompt = PromptBuilder::new(None)
            .render(&inputs(PhaseName::Review, &task))
            .expect("render");
        assert!(prompt.contains("<review-verdict>"));
        assert!(prompt.contains("blocking_issues"));
    }

    #[test]
    fn validate_prompt_names_scope() {
        let task = item("2.3");
        let mut input = inputs(PhaseName::Validate, &task);
        input.validate = Some((ValidateScope::Group, "2"));
        let prompt = PromptBuilder::new(None).render(&input).expect("render");
        assert!(prompt.contains("group 2"));
    }

    /// An override file replaces only its own phase.
    #[test]
    fn override_file_wins_for_its_phase() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            override_path(temp.path(), PhaseName::Commit),
            "custom commit for {{ task.id }}",
        )
        .expect("write override");
        let builder = PromptBuilder::new(Some(temp.path().to_path_buf()));
        let task = item("7.1");
        assert_eq!(
            builder
                .render(&inputs(PhaseName::Commit, &task))
                .expect("render"),
            "custom commit for 7.1"
        );
        let review = builder
            .render(&inputs(PhaseName::Review, &task))
            .expect("render");
        assert!(review.contains("<review-verdict>"));
    }
}
