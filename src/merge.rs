use std::collections::HashMap;

use serde_json::Value;

use crate::calc::{self, AssessmentType};
use crate::model::{Subject, SubjectStatus, SubmissionLevel};

/// One canonical submission entry after boundary normalization. Payloads
/// arrive loosely keyed (`studentId` / `student_id` / `student`, etc.);
/// aliases are resolved here and nowhere else.
#[derive(Debug, Clone)]
pub struct IncomingResult {
    pub student_key: String,
    pub student_name: Option<String>,
    pub grade: Option<String>,
    pub section: Option<String>,
    pub roll_number: Option<String>,
    pub gender: Option<String>,
    pub conduct: Option<String>,
    pub submission_level: Option<SubmissionLevel>,
    pub subjects: Vec<IncomingSubject>,
}

#[derive(Debug, Clone)]
pub struct IncomingSubject {
    pub name: String,
    pub marks: f64,
    pub assessments: Option<HashMap<String, f64>>,
    pub status: Option<SubjectStatus>,
}

fn first_str(obj: &Value, keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Some(s) = obj.get(*k).and_then(|v| v.as_str()) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn first_f64(obj: &Value, keys: &[&str]) -> Option<f64> {
    for k in keys {
        if let Some(n) = obj.get(*k).and_then(|v| v.as_f64()) {
            return Some(n);
        }
    }
    None
}

/// Normalize one `{ key -> payload }` entry. The payload's own id aliases
/// win over the map key; the map key is the fallback so batches keyed by
/// student number still resolve. Unknown subject statuses are rejected.
pub fn normalize_entry(key: &str, payload: &Value) -> Result<IncomingResult, String> {
    if !payload.is_object() {
        return Err(format!("entry '{}' is not an object", key));
    }

    let student_key = first_str(payload, &["studentId", "student_id", "student"])
        .or_else(|| {
            let k = key.trim();
            if k.is_empty() {
                None
            } else {
                Some(k.to_string())
            }
        })
        .ok_or_else(|| "entry has no student key".to_string())?;

    let mut subjects = Vec::new();
    if let Some(list) = payload.get("subjects").and_then(|v| v.as_array()) {
        for (i, item) in list.iter().enumerate() {
            let name = first_str(item, &["name", "subject", "subjectName"])
                .ok_or_else(|| format!("subject {} has no name", i))?;
            let marks = first_f64(item, &["marks", "mark", "score"]).unwrap_or(0.0);

            let assessments = item.get("assessments").and_then(|v| v.as_object()).map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|n| (k.clone(), n)))
                    .collect::<HashMap<String, f64>>()
            });

            let status = match item.get("status").and_then(|v| v.as_str()) {
                None => None,
                Some(raw) => Some(
                    SubjectStatus::parse(raw)
                        .ok_or_else(|| format!("unknown subject status '{}'", raw))?,
                ),
            };

            subjects.push(IncomingSubject {
                name,
                marks,
                assessments,
                status,
            });
        }
    }

    let submission_level = match first_str(payload, &["submissionLevel", "submission_level"]) {
        None => None,
        Some(raw) => Some(
            SubmissionLevel::parse(&raw)
                .ok_or_else(|| format!("unknown submission level '{}'", raw))?,
        ),
    };

    Ok(IncomingResult {
        student_key,
        student_name: first_str(payload, &["studentName", "student_name", "name"]),
        grade: first_str(payload, &["grade"]),
        section: first_str(payload, &["section"]),
        roll_number: first_str(payload, &["rollNumber", "roll_number"]),
        gender: first_str(payload, &["gender"]),
        conduct: first_str(payload, &["conduct"]),
        submission_level,
        subjects,
    })
}

/// Materialize incoming subjects: derive marks from assessment weights when
/// both are present, validate the 0-100 range, apply the level's status
/// stamp, and record who submitted when.
pub fn build_subjects(
    incoming: &[IncomingSubject],
    types: &[AssessmentType],
    stamp: Option<SubjectStatus>,
    submitted_by: &str,
    now: &str,
) -> Result<Vec<Subject>, String> {
    let mut out = Vec::with_capacity(incoming.len());
    for s in incoming {
        let marks = match (&s.assessments, types.is_empty()) {
            (Some(raw), false) => calc::derived_mark(types, raw),
            _ => calc::round_off_1_decimal(s.marks),
        };
        if !(0.0..=100.0).contains(&marks) {
            return Err(format!("subject '{}' marks {} out of range", s.name, marks));
        }
        let status = stamp.or(s.status).unwrap_or(SubjectStatus::Draft);
        out.push(Subject {
            name: s.name.clone(),
            marks,
            assessments: s.assessments.clone(),
            status,
            grade_letter: None,
            submitted_at: Some(now.to_string()),
            submitted_by: Some(submitted_by.to_string()),
            approved_by: None,
            approved_at: None,
        });
    }
    Ok(out)
}

/// Per-subject last-write-wins merge. The map is seeded with the existing
/// pending subjects and overwritten by the incoming ones, so two subject
/// teachers submitting different subjects never clobber each other while a
/// re-submission of the same subject replaces the old value. Existing order
/// is preserved; new subjects append in submission order.
pub fn merge_subject_lists(existing: Vec<Subject>, incoming: Vec<Subject>) -> Vec<Subject> {
    let mut incoming_by_name: HashMap<String, Subject> = incoming
        .iter()
        .map(|s| (s.name.trim().to_ascii_lowercase(), s.clone()))
        .collect();

    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    for s in existing {
        let key = s.name.trim().to_ascii_lowercase();
        match incoming_by_name.remove(&key) {
            Some(newer) => merged.push(newer),
            None => merged.push(s),
        }
    }
    for s in incoming {
        let key = s.name.trim().to_ascii_lowercase();
        // The map holds the last occurrence, so a duplicate within one
        // batch also resolves last-write-wins.
        if let Some(newest) = incoming_by_name.remove(&key) {
            merged.push(newest);
        }
    }
    merged
}
