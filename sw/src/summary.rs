//! Final run summary rendering

use colored::Colorize;

use swarmstore::TaskStatus;

use crate::orchestrator::RunSummary;

/// Print the human-readable end-of-run summary
pub fn print_summary(summary: &RunSummary) {
    let run = &summary.run;

    println!();
    println!("{} {}", "Run".bold(), run.run_id);
    println!(
        "  status={}  total={}  completed={}  failed={}  skipped={}",
        colorize_status(&run.status.to_string()),
        run.total_tasks,
        run.completed_tasks,
        run.failed_tasks,
        run.skipped_tasks
    );

    let completed: Vec<_> = summary
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .collect();
    if !completed.is_empty() {
        println!("\n{}", "Completed".green().bold());
        for task in completed {
            let commit = task.commit_id.as_deref().unwrap_or("no commit");
            println!("  [{}] {}  ({})", task.task_id, truncate(&task.text, 60), &commit[..commit.len().min(12)]);
        }
    }

    let skipped: Vec<_> = summary
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Skipped)
        .collect();
    if !skipped.is_empty() {
        println!("\n{}", "Skipped (already committed)".blue().bold());
        for task in skipped {
            let commit = task.skipped_commit.as_deref().unwrap_or("?");
            println!("  [{}] {}  ({})", task.task_id, truncate(&task.text, 60), &commit[..commit.len().min(12)]);
        }
    }

    let failed: Vec<_> = summary
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .collect();
    if !failed.is_empty() {
        println!("\n{}", "Failed".red().bold());
        for task in failed {
            println!("  [{}] {}", task.task_id, truncate(&task.text, 60));
            if let Some(error) = &task.last_error {
                println!("      after {} attempts: {}", task.attempt_count, truncate(error, 70));
            }
        }
    }

    if !summary.conflicts.is_empty() {
        println!("\n{}", "Merge conflicts (markers kept in-file)".yellow().bold());
        for conflict in &summary.conflicts {
            println!("  {}  (from {})", conflict.file, conflict.branch);
        }
    }

    let tokens_in: i64 = summary.tasks.iter().map(|task| task.tokens_in).sum();
    let tokens_out: i64 = summary.tasks.iter().map(|task| task.tokens_out).sum();
    if tokens_in + tokens_out > 0 {
        println!("\nTokens: {} in / {} out", tokens_in, tokens_out);
    }

    if let Some(path) = &summary.extracted_to {
        println!("\nPublished to {}", path.display().to_string().bold());
    }
    println!();
}

fn colorize_status(status: &str) -> String {
    match status {
        "completed" => status.green().to_string(),
        "failed" => status.red().to_string(),
        "stopped" => status.yellow().to_string(),
        _ => status.normal().to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer piece of text", 8), "a longer…");
    }
}
