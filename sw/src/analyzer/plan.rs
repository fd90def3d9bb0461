//! Devplan parsing and write-back
//!
//! The recognized grammar is a markdown checklist: bullet items carrying a
//! checkbox (`[ ]` pending, `[x]`/`[X]`/`[✅]` done, `[⏳]`/`[🔄]` in
//! progress), optionally grouped under headings. Surrounding prose and YAML
//! front-matter are tolerated. Each task keeps its 1-based source line so a
//! finished run can mark it done in place.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

/// Checklist state of a parsed plan item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecklistState {
    Pending,
    Done,
    InProgress,
}

/// One checklist item from a plan
#[derive(Debug, Clone)]
pub struct PlanTask {
    /// Task text, verbatim from the plan
    pub text: String,

    pub state: ChecklistState,

    /// 1-based line number in the source document
    pub line: usize,

    /// Heading section ordinal; tasks before any heading share section 1
    pub section: usize,
}

impl PlanTask {
    /// Scheduling priority: the section ordinal (lower runs earlier)
    pub fn priority(&self) -> i64 {
        self.section as i64
    }
}

/// A parsed plan document
#[derive(Debug, Clone, Default)]
pub struct PlanDocument {
    pub tasks: Vec<PlanTask>,
}

impl PlanDocument {
    /// Only tasks that still need work
    pub fn pending_tasks(&self) -> impl Iterator<Item = &PlanTask> {
        self.tasks.iter().filter(|task| task.state == ChecklistState::Pending)
    }
}

fn checkbox_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\s*[-*]\s*)\[([^\]]*)\]\s+(.*)$").expect("checkbox pattern is valid"))
}

fn parse_state(marker: &str) -> Option<ChecklistState> {
    match marker.trim() {
        "" => Some(ChecklistState::Pending),
        "x" | "X" | "✅" => Some(ChecklistState::Done),
        "⏳" | "🔄" => Some(ChecklistState::InProgress),
        _ => None,
    }
}

/// Parse a plan document into its checklist items
pub fn parse_plan(content: &str) -> PlanDocument {
    debug!(bytes = content.len(), "parse_plan: called");
    let mut tasks = Vec::new();
    let mut section = 0usize;
    let mut in_front_matter = false;

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;

        // YAML front-matter fences: everything between the opening and
        // closing --- at the top of the document is ignored
        if line.trim_end() == "---" && (line_no == 1 || in_front_matter) {
            in_front_matter = !in_front_matter;
            continue;
        }
        if in_front_matter {
            continue;
        }

        if line.trim_start().starts_with('#') {
            section += 1;
            continue;
        }

        if let Some(captures) = checkbox_regex().captures(line) {
            let marker = &captures[2];
            let Some(state) = parse_state(marker) else {
                continue;
            };
            tasks.push(PlanTask {
                text: captures[3].trim_end().to_string(),
                state,
                line: line_no,
                section: section.max(1),
            });
        }
    }

    debug!(task_count = tasks.len(), sections = section, "parse_plan: complete");
    PlanDocument { tasks }
}

/// Rewrite the checkboxes on the given source lines to done, leaving the
/// task text and everything else in the document byte-identical.
pub fn update_plan(content: &str, completed_lines: &HashSet<usize>) -> String {
    let mut out = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if completed_lines.contains(&line_no)
            && let Some(captures) = checkbox_regex().captures(line)
            && parse_state(&captures[2]).is_some_and(|state| state != ChecklistState::Done)
        {
            out.push(format!("{}[x] {}", &captures[1], &captures[3]));
            continue;
        }
        out.push(line.to_string());
    }

    let mut result = out.join("\n");
    if content.ends_with('\n') {
        result.push('\n');
    }
    result
}
