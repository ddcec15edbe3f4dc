//! Append-only auto-merge for the shared knowledge section.
//!
//! The common conflict class on `CLAUDE.md` is two executors appending rows
//! to the same markdown table inside the delimited knowledge section. That
//! narrow case merges mechanically: union the rows, sort by the task id in
//! the source column. Any other divergence (edits outside the section,
//! changed or removed rows, different headers) falls back to manual
//! resolution.

use tracing::info;

use crate::ops::{Result, Vcs, VcsError};

pub const KNOWLEDGE_BEGIN: &str = "<!-- orc:knowledge:begin -->";
pub const KNOWLEDGE_END: &str = "<!-- orc:knowledge:end -->";

// ---------------------------------------------------------------------------
// Pure merge
// ---------------------------------------------------------------------------

struct Section<'a> {
    before: &'a str,
    body: &'a str,
    after: &'a str,
}

fn split_section(content: &str) -> Option<Section<'_>> {
    let begin = content.find(KNOWLEDGE_BEGIN)?;
    let body_start = begin + KNOWLEDGE_BEGIN.len();
    let end_rel = content[body_start..].find(KNOWLEDGE_END)?;
    let end = body_start + end_rel;
    Some(Section {
        before: &content[..body_start],
        body: &content[body_start..end],
        after: &content[end..],
    })
}

/// Table rows (excluding header and separator) of the section body.
fn table_rows(body: &str) -> Vec<&str> {
    body.lines()
        .map(str::trim_end)
        .filter(|l| l.trim_start().starts_with('|'))
        .skip(2) // header + separator
        .filter(|l| !l.is_empty())
        .collect()
}

/// Header + separator lines of the section body's table.
fn table_header(body: &str) -> Vec<&str> {
    body.lines()
        .map(str::trim_end)
        .filter(|l| l.trim_start().starts_with('|'))
        .take(2)
        .collect()
}

/// Sort key: the task id found in the row's first (source) column.
fn row_sort_key(row: &str) -> String {
    let first_cell = row.trim_start_matches('|').split('|').next().unwrap_or("");
    match first_cell.find("TASK-") {
        Some(start) => first_cell[start..]
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or("")
            .to_string(),
        None => first_cell.trim().to_string(),
    }
}

/// Merge the knowledge sections of two divergent versions against their
/// common base. Returns the merged file content when both sides only added
/// rows to the same table, `None` otherwise.
pub fn merge_knowledge(base: &str, ours: &str, theirs: &str) -> Option<String> {
    let base_s = split_section(base)?;
    let ours_s = split_section(ours)?;
    let theirs_s = split_section(theirs)?;

    // Only the section may differ.
    if ours_s.before != theirs_s.before || ours_s.after != theirs_s.after {
        return None;
    }

    let header = table_header(base_s.body);
    if header.len() != 2
        || table_header(ours_s.body) != header
        || table_header(theirs_s.body) != header
    {
        return None;
    }

    let base_rows = table_rows(base_s.body);
    let ours_rows = table_rows(ours_s.body);
    let theirs_rows = table_rows(theirs_s.body);

    // Additive only: every base row must survive verbatim on both sides.
    if !base_rows.iter().all(|r| ours_rows.contains(r))
        || !base_rows.iter().all(|r| theirs_rows.contains(r))
    {
        return None;
    }

    let mut merged: Vec<&str> = ours_rows.clone();
    for row in &theirs_rows {
        if !merged.contains(row) {
            merged.push(row);
        }
    }
    merged.sort_by_key(|r| row_sort_key(r));
    merged.dedup();

    let mut body = String::from("\n\n");
    for line in &header {
        body.push_str(line);
        body.push('\n');
    }
    for row in &merged {
        body.push_str(row);
        body.push('\n');
    }
    body.push('\n');

    Some(format!("{}{}{}", ours_s.before, body, ours_s.after))
}

// ---------------------------------------------------------------------------
// Vcs integration
// ---------------------------------------------------------------------------

impl Vcs {
    /// During an unresolved merge, try the append-only table merge for the
    /// given conflicted file. On success the merged content is written and
    /// staged; returns whether the conflict was resolved.
    pub async fn auto_merge_knowledge(&self, file: &str) -> Result<bool> {
        let base = self.show_stage(1, file).await?;
        let ours = self.show_stage(2, file).await?;
        let theirs = self.show_stage(3, file).await?;

        let Some(merged) = merge_knowledge(&base, &ours, &theirs) else {
            return Ok(false);
        };

        tokio::fs::write(self.workdir().join(file), merged)
            .await
            .map_err(VcsError::Io)?;
        self.stage(file).await?;
        info!(file = %file, "auto-merged append-only knowledge table");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(rows: &[&str]) -> String {
        let mut s = String::from("# Project\n\nintro\n\n");
        s.push_str(KNOWLEDGE_BEGIN);
        s.push_str("\n\n| Source | Insight |\n|---|---|\n");
        for row in rows {
            s.push_str(row);
            s.push('\n');
        }
        s.push('\n');
        s.push_str(KNOWLEDGE_END);
        s.push_str("\n\nfooter\n");
        s
    }

    const R1: &str = "| TASK-001 | prefer flume channels |";
    const R2: &str = "| TASK-002 | sqlite wants WAL |";
    const R3: &str = "| TASK-003 | worktrees are cheap |";

    #[test]
    fn both_sides_adding_rows_merges_sorted() {
        let base = doc(&[R1]);
        let ours = doc(&[R1, R3]);
        let theirs = doc(&[R1, R2]);

        let merged = merge_knowledge(&base, &ours, &theirs).unwrap();
        let pos1 = merged.find(R1).unwrap();
        let pos2 = merged.find(R2).unwrap();
        let pos3 = merged.find(R3).unwrap();
        assert!(pos1 < pos2 && pos2 < pos3, "rows sorted by task id");
        assert!(merged.contains("footer"));
    }

    #[test]
    fn duplicate_addition_dedupes() {
        let base = doc(&[R1]);
        let ours = doc(&[R1, R2]);
        let theirs = doc(&[R1, R2]);
        let merged = merge_knowledge(&base, &ours, &theirs).unwrap();
        assert_eq!(merged.matches(R2).count(), 1);
    }

    #[test]
    fn removed_row_falls_back_to_manual() {
        let base = doc(&[R1, R2]);
        let ours = doc(&[R1]); // removed R2
        let theirs = doc(&[R1, R2, R3]);
        assert!(merge_knowledge(&base, &ours, &theirs).is_none());
    }

    #[test]
    fn edit_outside_section_falls_back() {
        let base = doc(&[R1]);
        let ours = doc(&[R1, R2]).replace("intro", "rewritten intro");
        let theirs = doc(&[R1, R3]);
        assert!(merge_knowledge(&base, &ours, &theirs).is_none());
    }

    #[test]
    fn missing_markers_fall_back() {
        let base = doc(&[R1]);
        let ours = "no markers here".to_string();
        let theirs = doc(&[R1]);
        assert!(merge_knowledge(&base, &ours, &theirs).is_none());
    }

    #[test]
    fn changed_header_falls_back() {
        let base = doc(&[R1]);
        let ours = doc(&[R1, R2]).replace("| Source | Insight |", "| Src | Note |");
        let theirs = doc(&[R1, R3]);
        assert!(merge_knowledge(&base, &ours, &theirs).is_none());
    }
}
