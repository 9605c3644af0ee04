//! Prompt assembler (§4.I).
//!
//! Role templates are embedded at compile time — prompts are part of the
//! orchestrator, not the target project, so the assembler never reads
//! from the filesystem. A project-local `prompts/*.md` copy exists
//! purely for humans to read (seeded by `rasen init`); it is not re-read
//! here.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initializer,
    Coder,
    Reviewer,
    Qa,
}

impl Role {
    fn template(self) -> &'static str {
        match self {
            Role::Initializer => include_str!("prompt_templates/initializer.md"),
            Role::Coder => include_str!("prompt_templates/coder.md"),
            Role::Reviewer => include_str!("prompt_templates/reviewer.md"),
            Role::Qa => include_str!("prompt_templates/qa.md"),
        }
    }

    pub fn file_name(self) -> &'static str {
        match self {
            Role::Initializer => "initializer.md",
            Role::Coder => "coder.md",
            Role::Reviewer => "reviewer.md",
            Role::Qa => "qa.md",
        }
    }
}

pub const ROLES: [Role; 4] = [Role::Initializer, Role::Coder, Role::Reviewer, Role::Qa];

/// Assembles a role's prompt by substituting `{name}` placeholders with
/// values from `substitutions`. Unknown placeholders are left intact so a
/// missing key surfaces as visibly malformed output rather than silently
/// vanishing.
pub fn assemble(role: Role, substitutions: &HashMap<&str, String>) -> String {
    let mut output = role.template().to_string();
    for (key, value) in substitutions {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}
