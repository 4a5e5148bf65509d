//! Task identity: fingerprint (exact) and semantic key (coarse).
//!
//! Normalization rules, pinned by the tests below:
//! - fingerprint: trim and collapse internal whitespace; case is preserved.
//! - semantic key: lowercase, punctuation becomes whitespace, whitespace
//!   collapsed. It is keyed on the title; a task without a title falls back to
//!   the first `SEMANTIC_PROMPT_WORDS` words of the prompt. Scheduled
//!   requests also carry the exact schedule, so two crons for one title
//!   stay separate intents.
//!
//! Both keys hash a canonical `field=value` record with SHA-256, so the
//! result does not depend on the order callers assemble the parts in.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::schedule::TaskSchedule;
use super::task::TaskProfile;

const SEMANTIC_PROMPT_WORDS: usize = 8;

/// Trim and collapse whitespace runs to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_text(text: &str) -> String {
    let folded: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    normalize_text(&folded)
}

fn digest(fields: &BTreeMap<&'static str, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in fields {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn schedule_text(schedule: Option<&TaskSchedule>) -> String {
    schedule.map(TaskSchedule::identity_text).unwrap_or_default()
}

/// Exact identity of a task request. Equal fingerprints mean the same work item.
pub fn fingerprint(
    prompt: &str,
    title: &str,
    profile: TaskProfile,
    schedule: Option<&TaskSchedule>,
) -> String {
    let mut fields = BTreeMap::new();
    fields.insert("prompt", normalize_text(prompt));
    fields.insert("title", normalize_text(title));
    fields.insert("profile", profile.as_str().to_string());
    fields.insert("schedule", schedule_text(schedule));
    digest(&fields)
}

/// Coarse identity used to find the active task serving the same intent.
///
/// Never used on its own to deduplicate creation.
pub fn semantic_key(
    prompt: &str,
    title: &str,
    profile: TaskProfile,
    schedule: Option<&TaskSchedule>,
) -> String {
    let folded_title = fold_text(title);
    let subject = if folded_title.is_empty() {
        fold_text(prompt)
            .split(' ')
            .take(SEMANTIC_PROMPT_WORDS)
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        folded_title
    };
    let schedule = match schedule {
        None => "now".to_string(),
        Some(schedule) => schedule.identity_text(),
    };

    let mut fields = BTreeMap::new();
    fields.insert("subject", subject);
    fields.insert("profile", profile.as_str().to_string());
    fields.insert("schedule", schedule);
    digest(&fields)
}

/// Exact request content key used for in-round batch deduplication.
pub fn content_key(
    prompt: &str,
    title: &str,
    profile: TaskProfile,
    schedule: Option<&TaskSchedule>,
) -> String {
    format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        normalize_text(prompt),
        normalize_text(title),
        profile.as_str(),
        schedule_text(schedule)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = fingerprint("p", "t", TaskProfile::Standard, None);
        let b = fingerprint("p", "t", TaskProfile::Standard, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_ignores_whitespace_layout() {
        let a = fingerprint("  write   the\nreport ", "Weekly  report", TaskProfile::Standard, None);
        let b = fingerprint("write the report", "Weekly report", TaskProfile::Standard, None);
        assert_eq!(a, b);
    }

    #[rstest]
    #[case::prompt("p2", "t", TaskProfile::Standard, None)]
    #[case::title("p", "t2", TaskProfile::Standard, None)]
    #[case::case_sensitive("P", "t", TaskProfile::Standard, None)]
    #[case::profile("p", "t", TaskProfile::Specialist, None)]
    #[case::schedule("p", "t", TaskProfile::Standard, Some(TaskSchedule::Cron("0 9 * * *".into())))]
    fn fingerprint_differs_when_any_part_differs(
        #[case] prompt: &str,
        #[case] title: &str,
        #[case] profile: TaskProfile,
        #[case] schedule: Option<TaskSchedule>,
    ) {
        let base = fingerprint("p", "t", TaskProfile::Standard, None);
        assert_ne!(base, fingerprint(prompt, title, profile, schedule.as_ref()));
    }

    #[test]
    fn semantic_key_survives_prompt_rewording() {
        let a = semantic_key("Summarize the logs", "Daily digest", TaskProfile::Standard, None);
        let b = semantic_key(
            "Summarize yesterday's logs briefly",
            "daily digest!",
            TaskProfile::Standard,
            None,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn semantic_key_separates_profiles_and_schedule_kinds() {
        let base = semantic_key("p", "Digest", TaskProfile::Standard, None);
        assert_ne!(base, semantic_key("p", "Digest", TaskProfile::Specialist, None));
        let cron = TaskSchedule::Cron("0 9 * * *".into());
        assert_ne!(base, semantic_key("p", "Digest", TaskProfile::Standard, Some(&cron)));
    }

    #[test]
    fn semantic_key_separates_schedules_of_one_title() {
        let morning = TaskSchedule::Cron("0 9 * * *".into());
        let evening = TaskSchedule::Cron("0 17 * * *".into());
        let a = semantic_key("send report", "Report", TaskProfile::Standard, Some(&morning));
        let b = semantic_key("send report", "Report", TaskProfile::Standard, Some(&evening));
        assert_ne!(a, b);
        assert_eq!(
            a,
            semantic_key("send the report", "report", TaskProfile::Standard, Some(&morning))
        );
    }

    #[test]
    fn semantic_key_falls_back_to_leading_prompt_words() {
        let a = semantic_key(
            "check the build status of main and report back to me please now",
            "",
            TaskProfile::Standard,
            None,
        );
        let b = semantic_key(
            "Check the build status of main and report back, thanks",
            "  ",
            TaskProfile::Standard,
            None,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn content_key_distinguishes_schedule() {
        let cron = TaskSchedule::Cron("0 9 * * *".into());
        assert_ne!(
            content_key("p", "t", TaskProfile::Standard, None),
            content_key("p", "t", TaskProfile::Standard, Some(&cron))
        );
    }
}
