//! Instruction management commands.
//!
//! The grammar is an ordered table: the first rule whose pattern matches the
//! leading whitespace-separated tokens wins, so longer patterns sharing a
//! prefix with shorter ones must come first.

use crate::ScopeKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SetDefaultInstruction(String),
    SetInstruction(String),
    GetInstruction,
}

pub struct Rule {
    pub pattern: &'static [&'static str],
    pub group_only: bool,
    build: fn(&str) -> Command,
}

pub const RULES: &[Rule] = &[
    Rule {
        pattern: &["set", "default", "instruction"],
        group_only: true,
        build: set_default_instruction,
    },
    Rule {
        pattern: &["set", "instruction"],
        group_only: false,
        build: set_instruction,
    },
    Rule {
        pattern: &["get", "instruction"],
        group_only: false,
        build: get_instruction,
    },
];

impl Rule {
    pub fn applies_to(&self, scope: ScopeKind) -> bool {
        !self.group_only || scope == ScopeKind::Group
    }

    fn apply(&self, text: &str) -> Option<Command> {
        strip_tokens(text, self.pattern).map(self.build)
    }
}

/// Returns `None` when the text is not a command and should go to generation.
pub fn parse(text: &str, scope: ScopeKind) -> Option<Command> {
    RULES
        .iter()
        .filter(|rule| rule.applies_to(scope))
        .find_map(|rule| rule.apply(text))
}

fn set_default_instruction(rest: &str) -> Command {
    Command::SetDefaultInstruction(rest.to_string())
}

fn set_instruction(rest: &str) -> Command {
    Command::SetInstruction(rest.to_string())
}

fn get_instruction(_rest: &str) -> Command {
    Command::GetInstruction
}

/// Strips `pattern` token by token and returns the trimmed remainder.
fn strip_tokens<'a>(text: &'a str, pattern: &[&str]) -> Option<&'a str> {
    let mut rest = text.trim_start();
    for expected in pattern {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        if &rest[..end] != *expected {
            return None;
        }
        rest = rest[end..].trim_start();
    }
    Some(rest.trim_end())
}
