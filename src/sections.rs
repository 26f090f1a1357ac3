//! Section header detection for Terms-of-Reference documents.
//!
//! All structural knowledge lives in [`SECTION_TABLE`]: one row per
//! language-tagged keyword stem and the canonical section it announces.
//! Adding a language or a section is a new row, not a new pattern.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Longest line still considered a heading.
pub const MAX_HEADER_LEN: usize = 100;

/// Language a keyword belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// English
    English,
    /// Spanish
    Spanish,
}

/// One row of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SectionKeyword {
    /// Language of the keyword
    pub language: Language,
    /// Lowercase keyword stem; any word continuation is accepted
    pub keyword: &'static str,
    /// Canonical section name
    pub section: &'static str,
}

const fn row(language: Language, keyword: &'static str, section: &'static str) -> SectionKeyword {
    SectionKeyword {
        language,
        keyword,
        section,
    }
}

use Language::{English as En, Spanish as Es};

/// Keyword stems for common proposal sections.
///
/// Row order is irrelevant: lookup picks the longest stem that prefixes
/// the matched keyword.
pub static SECTION_TABLE: &[SectionKeyword] = &[
    row(En, "background", "background"),
    row(En, "context", "background"),
    row(Es, "antecedentes", "background"),
    row(Es, "contexto", "background"),
    row(Es, "justificaci", "background"),
    row(En, "objective", "objectives"),
    row(En, "purpose", "objectives"),
    row(En, "goal", "objectives"),
    row(Es, "objetivo", "objectives"),
    row(Es, "propósito", "objectives"),
    row(En, "scope", "scope"),
    row(Es, "alcance", "scope"),
    row(Es, "ámbito", "scope"),
    row(En, "methodolog", "methodology"),
    row(En, "approach", "methodology"),
    row(Es, "metodolog", "methodology"),
    row(Es, "enfoque", "methodology"),
    row(En, "activit", "activities"),
    row(Es, "actividad", "activities"),
    row(Es, "acciones", "activities"),
    row(En, "deliverable", "deliverables"),
    row(Es, "entregable", "deliverables"),
    row(Es, "producto", "deliverables"),
    row(En, "work plan", "timeline"),
    row(En, "timeline", "timeline"),
    row(En, "schedule", "timeline"),
    row(Es, "plan de trabajo", "timeline"),
    row(Es, "cronograma", "timeline"),
    row(Es, "calendario", "timeline"),
    row(En, "budget", "budget"),
    row(En, "cost", "budget"),
    row(Es, "presupuesto", "budget"),
    row(Es, "costo", "budget"),
    row(En, "qualification", "qualifications"),
    row(En, "expertise", "qualifications"),
    row(Es, "calificaci", "qualifications"),
    row(Es, "perfil", "qualifications"),
    row(Es, "requisito", "qualifications"),
    row(En, "evaluation", "evaluation"),
    row(En, "assessment", "evaluation"),
    row(Es, "evaluaci", "evaluation"),
    row(En, "monitoring", "monitoring"),
    row(Es, "monitoreo", "monitoring"),
    row(Es, "seguimiento", "monitoring"),
    row(En, "sustainab", "sustainability"),
    row(Es, "sostenibilidad", "sustainability"),
    row(En, "risk", "risk"),
    row(Es, "riesgo", "risk"),
];

/// Optional markdown marker and list numbering in front of a heading.
const NUMBERING: &str = r"(?:#{1,6}[ \t]*)?(?:(?:\d+(?:\.\d+)*[.)]?|[ivxlc]+[.)]|[a-z][.)])[ \t]+)?";

static HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    let keywords = SECTION_TABLE
        .iter()
        .map(|row| regex::escape(row.keyword).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|");

    Regex::new(&format!(r"(?i)^[ \t]*{NUMBERING}(?P<kw>{keywords})\w*\b"))
        .expect("section table compiles to a valid regex")
});

static SUB_HEADER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)^[\x20\t]*
        (?:
            \d+(?:\.\d+)+[.)]?      # 2.1 / 2.1.3
          | \d+[.)]                 # 3. / 3)
          | [ivxlc]+[.)]            # iv.
          | [a-z][.)]               # b)
          | [-*•▪◦]                 # bullets
        )
        [\x20\t]+\S",
    )
    .expect("valid sub-header regex")
});

/// Returns the canonical section name when `line` is a section heading.
///
/// A heading starts (after optional `#` markers and numbering) with a
/// keyword from [`SECTION_TABLE`], is at most [`MAX_HEADER_LEN`]
/// characters long and does not end like a sentence.
#[must_use]
pub fn detect_header(line: &str) -> Option<&'static str> {
    let trimmed = line.trim();
    if !looks_like_heading(trimmed) {
        return None;
    }

    let captures = HEADER_PATTERN.captures(trimmed)?;
    let matched = normalize_keyword(captures.name("kw")?.as_str());

    SECTION_TABLE
        .iter()
        .filter(|row| matched.starts_with(row.keyword))
        .max_by_key(|row| row.keyword.len())
        .map(|row| row.section)
}

/// Returns true when `line` opens a finer-grained item: numbered
/// sub-items, lettered items, roman numerals or bullets.
#[must_use]
pub fn detect_sub_header(line: &str) -> bool {
    SUB_HEADER_PATTERN.is_match(line)
}

fn looks_like_heading(line: &str) -> bool {
    !line.is_empty()
        && line.chars().count() <= MAX_HEADER_LEN
        && !line.ends_with(['.', ';', ','])
}

fn normalize_keyword(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
