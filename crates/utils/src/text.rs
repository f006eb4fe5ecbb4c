use std::sync::LazyLock;

use regex::Regex;

static NON_ALNUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

const MAX_SLUG_LEN: usize = 50;

/// Derive a filesystem slug from an entity title: lowercase, runs of
/// non-alphanumerics collapsed to `_`, trimmed, truncated to 50 chars.
/// Falls back to the lowercased id when the title yields nothing.
pub fn file_slug(title: &str, id: &str) -> String {
    let lower = title.to_lowercase();
    let slug = NON_ALNUM.replace_all(&lower, "_");
    let trimmed = slug.trim_matches('_');
    let cut: String = trimmed.chars().take(MAX_SLUG_LEN).collect();
    let cut = cut.trim_end_matches('_');
    if cut.is_empty() {
        id.to_lowercase()
    } else {
        cut.to_string()
    }
}

/// Branch-safe identifier for stream and execution branches: lowercase,
/// hyphen-separated, capped short so refs stay readable.
pub fn git_branch_id(input: &str) -> String {
    let lower = input.to_lowercase();
    let slug = Regex::new(r"[^a-z0-9]+").unwrap().replace_all(&lower, "-");
    let trimmed = slug.trim_matches('-');
    let cut: String = trimmed.chars().take(16).collect();
    cut.trim_end_matches('-').to_string()
}
