use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Half-up 1-decimal rounding used for every derived figure
/// (subject marks, totals, averages): `floor(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Pass threshold applied uniformly to subject marks and the aggregate
/// average. 35.0 itself passes.
pub const PASS_MARK: f64 = 35.0;

pub fn letter_grade(mark: f64) -> &'static str {
    if mark >= 90.0 {
        "A+"
    } else if mark >= 80.0 {
        "A"
    } else if mark >= 70.0 {
        "B+"
    } else if mark >= 60.0 {
        "B"
    } else if mark >= 50.0 {
        "C+"
    } else if mark >= 45.0 {
        "C"
    } else if mark >= PASS_MARK {
        "D"
    } else {
        "F"
    }
}

pub fn pass_status(average: f64) -> crate::model::Verdict {
    if average >= PASS_MARK {
        crate::model::Verdict::Pass
    } else {
        crate::model::Verdict::Fail
    }
}

pub fn promotion_status(passed: bool) -> crate::model::Promotion {
    if passed {
        crate::model::Promotion::Promoted
    } else {
        crate::model::Promotion::Detained
    }
}

/// Default conduct band for an average. Only used when the submission did
/// not carry an explicit conduct remark.
pub fn conduct_for_average(average: f64) -> &'static str {
    if average >= 90.0 {
        "Excellent"
    } else if average >= 80.0 {
        "Very Good"
    } else if average >= 70.0 {
        "Good"
    } else if average >= 50.0 {
        "Satisfactory"
    } else {
        "Needs Improvement"
    }
}

/// Spreadsheet-style sum: empty input is 0, never an error.
pub fn excel_sum(marks: &[f64]) -> f64 {
    marks.iter().sum()
}

/// Spreadsheet-style average: empty input is 0, never NaN.
pub fn excel_average(marks: &[f64]) -> f64 {
    if marks.is_empty() {
        0.0
    } else {
        excel_sum(marks) / marks.len() as f64
    }
}

/// A weighted sub-component of a subject mark (e.g. midterm, final).
/// Weights are percentages and are expected to sum to 100 across types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentType {
    pub id: String,
    pub label: String,
    pub weight: f64,
    pub max_marks: f64,
}

/// Combine raw per-assessment scores into one subject mark:
/// `Σ (raw_i / max_marks_i) × weight_i`, rounded to one decimal.
/// Types with no raw score, or with a non-positive max, contribute 0.
pub fn derived_mark(types: &[AssessmentType], raw_scores: &HashMap<String, f64>) -> f64 {
    let mut mark = 0.0;
    for t in types {
        if t.max_marks <= 0.0 {
            continue;
        }
        if let Some(raw) = raw_scores.get(&t.id) {
            mark += (raw / t.max_marks) * t.weight;
        }
    }
    round_off_1_decimal(mark)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    pub student_id: String,
    pub total: f64,
    pub average: f64,
}

/// Class-wide rank assignment: order by average descending, ties broken by
/// total descending. Standard competition ranking: entries with equal
/// (average, total) share a rank and the next distinct entry skips the
/// occupied positions (1, 1, 3).
pub fn calculate_ranks(entries: &[RankEntry]) -> HashMap<String, i64> {
    let mut ordered: Vec<&RankEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        b.average
            .partial_cmp(&a.average)
            .unwrap_or(Ordering::Equal)
            .then(b.total.partial_cmp(&a.total).unwrap_or(Ordering::Equal))
    });

    let mut ranks = HashMap::with_capacity(ordered.len());
    let mut current_rank: i64 = 0;
    let mut prev: Option<(f64, f64)> = None;
    for (i, e) in ordered.iter().enumerate() {
        let key = (e.average, e.total);
        if prev != Some(key) {
            current_rank = i as i64 + 1;
            prev = Some(key);
        }
        ranks.insert(e.student_id.clone(), current_rank);
    }
    ranks
}
