use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::calc;

/// Lifecycle state of a single subject inside a result row. Unknown strings
/// are rejected at the boundary rather than treated as draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "pending_admin")]
    PendingAdmin,
    #[serde(rename = "pending_roster_final")]
    PendingRosterFinal,
    #[serde(rename = "published")]
    Published,
}

impl SubjectStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "pending_admin" => Some(Self::PendingAdmin),
            "pending_roster_final" => Some(Self::PendingRosterFinal),
            "published" => Some(Self::Published),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingAdmin => "pending_admin",
            Self::PendingRosterFinal => "pending_roster_final",
            Self::Published => "published",
        }
    }

    /// Transition table. `pending_roster_final` reviews like `pending_admin`;
    /// the only route back out of `published` is an admin unlock.
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::PendingAdmin)
                | (Self::Draft, Self::PendingRosterFinal)
                | (Self::PendingAdmin, Self::Published)
                | (Self::PendingRosterFinal, Self::Published)
                | (Self::PendingAdmin, Self::Draft)
                | (Self::PendingRosterFinal, Self::Draft)
                | (Self::Published, Self::Draft)
        )
    }

    /// Students only ever see reviewed marks.
    pub fn visible_to_student(self) -> bool {
        matches!(self, Self::Published)
    }
}

/// Row-level state. `Draft` and `Pending` live in the pending table;
/// `Published` only ever appears on rows in the published table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "published")]
    Published,
}

impl RowStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "pending" => Some(Self::Pending),
            "published" => Some(Self::Published),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Published => "published",
        }
    }
}

/// How a teacher submission was made. Roster is the homeroom-only,
/// class-finalizing level that triggers ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionLevel {
    #[serde(rename = "subject")]
    Subject,
    #[serde(rename = "subject-pending")]
    SubjectPending,
    #[serde(rename = "roster")]
    Roster,
}

impl SubmissionLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subject" => Some(Self::Subject),
            "subject-pending" => Some(Self::SubjectPending),
            "roster" => Some(Self::Roster),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Subject => "subject",
            Self::SubjectPending => "subject-pending",
            Self::Roster => "roster",
        }
    }

    /// Status stamped onto incoming subjects for this level, if any.
    pub fn stamp(self) -> Option<SubjectStatus> {
        match self {
            Self::Subject => None,
            Self::SubjectPending => Some(SubjectStatus::PendingAdmin),
            Self::Roster => Some(SubjectStatus::PendingRosterFinal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Promotion {
    #[serde(rename = "PROMOTED")]
    Promoted,
    #[serde(rename = "DETAINED")]
    Detained,
}

impl Promotion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promoted => "PROMOTED",
            Self::Detained => "DETAINED",
        }
    }
}

/// One subject inside a result row. `assessments` holds raw per-component
/// scores when assessment types are configured; `marks` is then derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub name: String,
    pub marks: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessments: Option<HashMap<String, f64>>,
    pub status: SubjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_letter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

/// A student's result row, shared shape between the pending and published
/// tables. Publish-only fields stay `None` while the row is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    pub student_id: String,
    pub student_name: String,
    pub grade: String,
    pub section: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roll_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    pub subjects: Vec<Subject>,
    pub total: f64,
    pub average: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conduct: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_or_detained: Option<Promotion>,
    pub status: RowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_level: Option<SubmissionLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

impl ResultRow {
    /// Recompute every figure derived from the subject list: per-subject
    /// letter grades, total, average, pass verdict, promotion, and the
    /// default conduct band (an explicit conduct remark is left alone).
    pub fn recompute_derived(&mut self) {
        for s in &mut self.subjects {
            s.grade_letter = Some(calc::letter_grade(s.marks).to_string());
        }
        let marks: Vec<f64> = self.subjects.iter().map(|s| s.marks).collect();
        self.total = calc::round_off_1_decimal(calc::excel_sum(&marks));
        self.average = calc::round_off_1_decimal(calc::excel_average(&marks));
        let verdict = calc::pass_status(self.average);
        self.result = Some(verdict);
        self.promoted_or_detained = Some(calc::promotion_status(verdict == Verdict::Pass));
        if self.conduct.as_deref().map(str::is_empty).unwrap_or(true) {
            self.conduct = Some(calc::conduct_for_average(self.average).to_string());
        }
    }

    /// Clear the publish-only stamps, e.g. when a published row is unlocked
    /// back into the pending table.
    pub fn strip_publish_fields(&mut self) {
        self.published_at = None;
        self.approved_by = None;
        self.approved_at = None;
        for s in &mut self.subjects {
            s.approved_by = None;
            s.approved_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(name: &str, marks: f64) -> Subject {
        Subject {
            name: name.to_string(),
            marks,
            assessments: None,
            status: SubjectStatus::Draft,
            grade_letter: None,
            submitted_at: None,
            submitted_by: None,
            approved_by: None,
            approved_at: None,
        }
    }

    fn row(subjects: Vec<Subject>) -> ResultRow {
        ResultRow {
            student_id: "stu-1".into(),
            student_name: "Asha Rao".into(),
            grade: "10".into(),
            section: "A".into(),
            roll_number: None,
            gender: None,
            subjects,
            total: 0.0,
            average: 0.0,
            rank: None,
            conduct: None,
            result: None,
            promoted_or_detained: None,
            status: RowStatus::Draft,
            submission_level: None,
            submitted_by: None,
            submitted_at: None,
            updated_at: None,
            published_at: None,
            approved_by: None,
            approved_at: None,
        }
    }

    #[test]
    fn status_parse_rejects_unknown() {
        assert_eq!(SubjectStatus::parse("published"), Some(SubjectStatus::Published));
        assert_eq!(SubjectStatus::parse("approved-ish"), None);
        assert_eq!(RowStatus::parse("pending"), Some(RowStatus::Pending));
        assert_eq!(RowStatus::parse(""), None);
        assert_eq!(SubmissionLevel::parse("roster"), Some(SubmissionLevel::Roster));
        assert_eq!(SubmissionLevel::parse("final"), None);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use SubjectStatus::*;
        assert!(Draft.can_transition(PendingAdmin));
        assert!(PendingAdmin.can_transition(Published));
        assert!(PendingRosterFinal.can_transition(Published));
        assert!(PendingAdmin.can_transition(Draft));
        assert!(Published.can_transition(Draft));
        assert!(!Draft.can_transition(Published));
        assert!(!Published.can_transition(PendingAdmin));
        assert!(!Draft.can_transition(Draft));
    }

    #[test]
    fn recompute_derives_totals_and_default_conduct() {
        let mut r = row(vec![subject("Math", 80.0), subject("Science", 90.0)]);
        r.recompute_derived();
        assert_eq!(r.total, 170.0);
        assert_eq!(r.average, 85.0);
        assert_eq!(r.result, Some(Verdict::Pass));
        assert_eq!(r.promoted_or_detained, Some(Promotion::Promoted));
        assert_eq!(r.conduct.as_deref(), Some("Very Good"));
        assert_eq!(r.subjects[0].grade_letter.as_deref(), Some("A"));
        assert_eq!(r.subjects[1].grade_letter.as_deref(), Some("A+"));
    }

    #[test]
    fn recompute_keeps_explicit_conduct() {
        let mut r = row(vec![subject("Math", 40.0)]);
        r.conduct = Some("Disruptive in class".into());
        r.recompute_derived();
        assert_eq!(r.conduct.as_deref(), Some("Disruptive in class"));
    }

    #[test]
    fn recompute_on_empty_subjects_is_zero_and_fail() {
        let mut r = row(vec![]);
        r.recompute_derived();
        assert_eq!(r.total, 0.0);
        assert_eq!(r.average, 0.0);
        assert_eq!(r.result, Some(Verdict::Fail));
        assert_eq!(r.promoted_or_detained, Some(Promotion::Detained));
    }
}
