//! Curriculum Map
//!
//! Each academic track exposes a small catalogue of concepts grouped by
//! category. Picking a concept starts a deep-dive lesson through the
//! conversation orchestrator.

use crate::models::AcademicMode;
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concept {
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurriculumSection {
    pub category: &'static str,
    pub concepts: &'static [Concept],
}

const fn concept(name: &'static str, description: &'static str) -> Concept {
    Concept { name, description }
}

const ELEVENTH: &[CurriculumSection] = &[
    CurriculumSection {
        category: "Business Foundations",
        concepts: &[
            concept(
                "Nature and Purpose of Business",
                "Understand economic activities and business objectives.",
            ),
            concept(
                "Forms of Business Organizations",
                "Sole proprietorship, partnership, and companies.",
            ),
        ],
    },
    CurriculumSection {
        category: "Accounting Principles",
        concepts: &[
            concept(
                "Introduction to Accounting",
                "The language of business and basic terminology.",
            ),
            concept(
                "Journal & Ledger Posting",
                "Mastering the double-entry bookkeeping system.",
            ),
        ],
    },
];

const TWELFTH: &[CurriculumSection] = &[
    CurriculumSection {
        category: "Management Theory",
        concepts: &[
            concept(
                "Principles of Management",
                "Fayol and Taylor's scientific management.",
            ),
            concept(
                "Business Environment",
                "Analyzing macro and micro economic factors.",
            ),
        ],
    },
    CurriculumSection {
        category: "Business Functions",
        concepts: &[
            concept(
                "Marketing Management",
                "The 4 Ps and customer-centric strategies.",
            ),
            concept(
                "Financial Markets",
                "Understanding stock exchanges and instruments.",
            ),
        ],
    },
];

const BBA: &[CurriculumSection] = &[
    CurriculumSection {
        category: "Professional Management",
        concepts: &[
            concept(
                "Organizational Behavior",
                "Individual and group dynamics in corporate settings.",
            ),
            concept(
                "Human Resource Management",
                "Talent acquisition and performance appraisal.",
            ),
        ],
    },
    CurriculumSection {
        category: "Strategic Operations",
        concepts: &[
            concept(
                "Supply Chain Management",
                "Logistics and value chain optimization.",
            ),
            concept(
                "Business Communication",
                "Mastering corporate correspondence.",
            ),
        ],
    },
];

const MBA: &[CurriculumSection] = &[
    CurriculumSection {
        category: "Executive Strategy",
        concepts: &[
            concept(
                "Disruptive Innovation",
                "Strategies for changing industry paradigms.",
            ),
            concept(
                "Mergers & Acquisitions",
                "Strategic corporate restructuring and valuation.",
            ),
        ],
    },
    CurriculumSection {
        category: "Advanced Finance & Ethics",
        concepts: &[
            concept(
                "Strategic Financial Modeling",
                "Projecting corporate performance for decision-making.",
            ),
            concept(
                "Global Leadership & Ethics",
                "Leading multicultural teams with integrity.",
            ),
        ],
    },
];

/// Returns the curriculum sections of a track.
pub fn sections(mode: AcademicMode) -> &'static [CurriculumSection] {
    match mode {
        AcademicMode::Eleventh => ELEVENTH,
        AcademicMode::Twelfth => TWELFTH,
        AcademicMode::Bba => BBA,
        AcademicMode::Mba => MBA,
    }
}

/// Sections of a track filtered by category; `None` or `"All"` keeps everything.
pub fn filter_by_category(
    mode: AcademicMode,
    category: Option<&str>,
) -> Vec<&'static CurriculumSection> {
    sections(mode)
        .iter()
        .filter(|section| match category {
            None => true,
            Some(c) if c.eq_ignore_ascii_case("all") => true,
            Some(c) => section.category.eq_ignore_ascii_case(c),
        })
        .collect()
}

/// Finds the concept of a track that best matches a loosely typed query.
pub fn find_concept(mode: AcademicMode, query: &str) -> Option<&'static Concept> {
    let query = query.trim();
    if query.is_empty() {
        return None;
    }
    let matcher = SkimMatcherV2::default().ignore_case();
    sections(mode)
        .iter()
        .flat_map(|section| section.concepts.iter())
        .filter_map(|c| matcher.fuzzy_match(c.name, query).map(|score| (score, c)))
        .max_by_key(|(score, _)| *score)
        .map(|(_, c)| c)
}
