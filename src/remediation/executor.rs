//! Execution of approved remediation actions: apply edits per file, then
//! branch, commit, and open a merge request for each touched file.

use std::collections::BTreeMap;

use tracing::{info, warn};
use uuid::Uuid;

use super::RemediationWorkflow;
use crate::errors::{ApprovalError, StoreError};
use crate::models::{ActionOutcome, AnalysisJob, ProposedAction};

/// Convert a path or title to a branch-safe slug, limited to `max_len` bytes.
pub fn slugify(input: &str, max_len: usize) -> String {
    let slug: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Apply one action to a file's content.
///
/// When the action carries a line number and that line still matches the
/// recorded original code, the line is replaced in place. Otherwise the first
/// occurrence of the original snippet is replaced as plain text. Callers
/// apply a file's edits from highest to lowest line so earlier replacements
/// cannot shift the line numbers of the ones still pending.
pub fn apply_edit(content: &str, action: &ProposedAction) -> Result<String, String> {
    let had_trailing_newline = content.ends_with('\n');
    if let Some(line) = action.line {
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let idx = line.saturating_sub(1) as usize;
        if idx < lines.len() && lines[idx] == action.original_code {
            lines[idx] = action.proposed_code.clone();
            let mut out = lines.join("\n");
            if had_trailing_newline {
                out.push('\n');
            }
            return Ok(out);
        }
        // The file drifted since analysis; fall through to snippet matching.
    }
    if action.original_code.is_empty() {
        return Err("action has no original code to match".to_string());
    }
    if !content.contains(&action.original_code) {
        return Err(format!("original code not found in {}", action.file));
    }
    Ok(content.replacen(&action.original_code, &action.proposed_code, 1))
}

fn commit_message(file: &str, actions: &[&ProposedAction]) -> String {
    let mut message = format!("Apply {} automated security fix(es) to {}\n", actions.len(), file);
    for action in actions {
        message.push_str(&format!(
            "\n- [{}] {}",
            action.severity,
            location(action)
        ));
    }
    message
}

fn merge_request_description(actions: &[&ProposedAction]) -> String {
    let mut description =
        String::from("Automated security remediation, approved by a reviewer.\n");
    for action in actions {
        description.push_str(&format!(
            "\n- **{}** at {} (confidence {}%): {}",
            action.severity,
            location(action),
            action.confidence,
            action.description
        ));
    }
    description
}

fn location(action: &ProposedAction) -> String {
    match action.line {
        Some(line) => format!("{}:{}", action.file, line),
        None => action.file.clone(),
    }
}

fn failed(action_id: &str, error: String) -> ActionOutcome {
    ActionOutcome {
        action_id: action_id.to_string(),
        success: false,
        error: Some(error),
        commit_ref: None,
        merge_request_ref: None,
    }
}

impl RemediationWorkflow {
    /// Execute approved actions against the repository. Outcomes are
    /// per-action; a branch or commit failure fails only that file's batch.
    pub async fn execute(
        &self,
        job: &AnalysisJob,
        approved_action_ids: &[String],
    ) -> Result<Vec<ActionOutcome>, ApprovalError> {
        let project = self
            .store
            .get_project(&job.project_id)
            .await?
            .ok_or_else(|| {
                ApprovalError::Store(StoreError::ProjectNotFound {
                    id: job.project_id.clone(),
                })
            })?;

        let mut by_file: BTreeMap<&str, Vec<&ProposedAction>> = BTreeMap::new();
        for action in &job.proposed_actions {
            if approved_action_ids.contains(&action.id) {
                by_file.entry(action.file.as_str()).or_default().push(action);
            }
        }

        let mut outcomes = Vec::new();
        for (file, mut actions) in by_file {
            // Highest line first, line-less actions last.
            actions.sort_by_key(|a| std::cmp::Reverse(a.line.unwrap_or(0)));

            let mut content = match self.repo.get_file_content(file, &job.commit_ref).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(file, error = %e, "could not fetch file for remediation");
                    outcomes.extend(actions.iter().map(|a| failed(&a.id, e.to_string())));
                    continue;
                }
            };

            let mut applied: Vec<&ProposedAction> = Vec::new();
            for action in &actions {
                match apply_edit(&content, action) {
                    Ok(updated) => {
                        content = updated;
                        applied.push(action);
                    }
                    Err(e) => {
                        warn!(file, action = %action.id, error = %e, "edit did not apply");
                        outcomes.push(failed(&action.id, e));
                    }
                }
            }
            if applied.is_empty() {
                continue;
            }

            let branch = format!(
                "vigil/fix-{}-{}",
                slugify(file, 24),
                &Uuid::new_v4().to_string()[..8]
            );
            if let Err(e) = self.repo.create_branch(&branch, &job.commit_ref).await {
                warn!(file, branch = %branch, error = %e, "branch creation failed");
                outcomes.extend(applied.iter().map(|a| failed(&a.id, e.to_string())));
                continue;
            }

            let commit_ref = match self
                .repo
                .commit_file(file, &content, &commit_message(file, &applied), &branch)
                .await
            {
                Ok(commit_ref) => commit_ref,
                Err(e) => {
                    warn!(file, branch = %branch, error = %e, "commit failed");
                    outcomes.extend(applied.iter().map(|a| failed(&a.id, e.to_string())));
                    continue;
                }
            };

            let title = format!("Security fixes for {}", file);
            match self
                .repo
                .open_merge_request(
                    &branch,
                    &project.default_branch,
                    &title,
                    &merge_request_description(&applied),
                )
                .await
            {
                Ok(mr_ref) => {
                    info!(file, branch = %branch, mr = %mr_ref, "remediation merge request opened");
                    outcomes.extend(applied.iter().map(|a| ActionOutcome {
                        action_id: a.id.clone(),
                        success: true,
                        error: None,
                        commit_ref: Some(commit_ref.clone()),
                        merge_request_ref: Some(mr_ref.clone()),
                    }));
                }
                Err(e) => {
                    warn!(file, branch = %branch, error = %e, "merge request failed");
                    // The commit landed; surface it so an operator can open
                    // the merge request by hand.
                    outcomes.extend(applied.iter().map(|a| ActionOutcome {
                        action_id: a.id.clone(),
                        success: false,
                        error: Some(e.to_string()),
                        commit_ref: Some(commit_ref.clone()),
                        merge_request_ref: None,
                    }));
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EstimatedRisk, Severity};

    fn action(file: &str, line: Option<u32>, original: &str, proposed: &str) -> ProposedAction {
        ProposedAction {
            id: Uuid::new_v4().to_string(),
            vulnerability_id: "v1".to_string(),
            file: file.to_string(),
            line,
            severity: Severity::Medium,
            original_code: original.to_string(),
            proposed_code: proposed.to_string(),
            description: "fix".to_string(),
            confidence: 85,
            automated: true,
            estimated_risk: EstimatedRisk::Low,
        }
    }

    #[test]
    fn test_slugify_paths() {
        assert_eq!(slugify("src/auth/login.rs", 40), "src-auth-login-rs");
        assert_eq!(slugify("Weird  Name!!", 40), "weird-name");
        assert_eq!(slugify("abcdefghij", 6), "abcdef");
    }

    #[test]
    fn test_apply_edit_replaces_matching_line() {
        let content = "fn a() {}\nlet q = raw_sql(input);\nfn b() {}\n";
        let action = action("x.rs", Some(2), "let q = raw_sql(input);", "let q = bind(input);");
        let updated = apply_edit(content, &action).unwrap();
        assert_eq!(updated, "fn a() {}\nlet q = bind(input);\nfn b() {}\n");
    }

    #[test]
    fn test_apply_edit_falls_back_to_text_match_when_line_drifted() {
        let content = "// new header\nfn a() {}\nlet q = raw_sql(input);\n";
        // Line 2 no longer matches; the snippet still exists further down.
        let action = action("x.rs", Some(2), "let q = raw_sql(input);", "let q = bind(input);");
        let updated = apply_edit(content, &action).unwrap();
        assert!(updated.contains("bind(input)"));
        assert!(!updated.contains("raw_sql"));
    }

    #[test]
    fn test_apply_edit_without_line_uses_plain_replacement() {
        let content = "alpha\nbeta\ngamma\n";
        let action = action("x.rs", None, "beta", "BETA");
        assert_eq!(apply_edit(content, &action).unwrap(), "alpha\nBETA\ngamma\n");
    }

    #[test]
    fn test_apply_edit_errors_when_snippet_missing() {
        let content = "alpha\n";
        let action = action("x.rs", Some(5), "beta", "BETA");
        assert!(apply_edit(content, &action).is_err());
    }

    #[test]
    fn test_high_to_low_ordering_keeps_earlier_lines_stable() {
        let content = "l1\nl2\nl3\nl4\n";
        // Replacing line 4 with two lines first, then line 2, must leave the
        // line-2 edit anchored where analysis saw it.
        let late = action("x.rs", Some(4), "l4", "l4a\nl4b");
        let early = action("x.rs", Some(2), "l2", "L2");
        let step1 = apply_edit(content, &late).unwrap();
        let step2 = apply_edit(&step1, &early).unwrap();
        assert_eq!(step2, "l1\nL2\nl3\nl4a\nl4b\n");
    }

    #[test]
    fn test_commit_message_enumerates_fixes() {
        let a1 = action("x.rs", Some(3), "a", "b");
        let a2 = action("x.rs", None, "c", "d");
        let message = commit_message("x.rs", &[&a1, &a2]);
        assert!(message.contains("2 automated security fix(es)"));
        assert!(message.contains("x.rs:3"));
        assert!(message.contains("[medium]"));
    }
}
