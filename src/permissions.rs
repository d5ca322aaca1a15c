use crate::model::SubmissionLevel;

/// Teacher identity as stored: a teacher whose own grade/section equals a
/// class's grade/section is that class's homeroom teacher by convention.
#[derive(Debug, Clone)]
pub struct TeacherIdentity {
    pub id: String,
    pub teacher_no: String,
    pub name: String,
    pub grade: Option<String>,
    pub section: Option<String>,
}

/// A write grant for one class a subject teacher is not homeroom of.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub teacher_id: String,
    pub grade: String,
    pub section: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionDenied {
    pub grade: String,
    pub section: String,
    pub reason: &'static str,
}

fn class_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Homeroom status comes only from the teacher's stored grade/section;
/// allocations never grant it.
pub fn is_homeroom(teacher: &TeacherIdentity, grade: &str, section: &str) -> bool {
    match (&teacher.grade, &teacher.section) {
        (Some(g), Some(s)) => class_eq(g, grade) && class_eq(s, section),
        _ => false,
    }
}

/// Allocation match, or homeroom (homeroom implies allocation).
pub fn is_allocated(
    teacher: &TeacherIdentity,
    allocations: &[Allocation],
    grade: &str,
    section: &str,
) -> bool {
    if is_homeroom(teacher, grade, section) {
        return true;
    }
    allocations
        .iter()
        .any(|a| class_eq(&a.grade, grade) && class_eq(&a.section, section))
}

/// Gate for any teacher write. A roster submission finalizes and ranks the
/// whole class, so it must come from one consistent source: the homeroom
/// teacher.
pub fn authorize_submission(
    teacher: &TeacherIdentity,
    allocations: &[Allocation],
    grade: &str,
    section: &str,
    level: SubmissionLevel,
) -> Result<(), PermissionDenied> {
    if !is_allocated(teacher, allocations, grade, section) {
        return Err(PermissionDenied {
            grade: grade.to_string(),
            section: section.to_string(),
            reason: "teacher has no allocation for this class",
        });
    }
    if level == SubmissionLevel::Roster && !is_homeroom(teacher, grade, section) {
        return Err(PermissionDenied {
            grade: grade.to_string(),
            section: section.to_string(),
            reason: "roster submissions require the homeroom teacher",
        });
    }
    Ok(())
}

/// All (grade, section) pairs the teacher may read: allocations plus their
/// homeroom class. Normalized for case/whitespace so membership tests match
/// the write-path comparisons.
pub fn visible_classes(teacher: &TeacherIdentity, allocations: &[Allocation]) -> Vec<(String, String)> {
    let mut classes: Vec<(String, String)> = Vec::new();
    let mut push = |g: &str, s: &str| {
        let key = (
            g.trim().to_ascii_lowercase(),
            s.trim().to_ascii_lowercase(),
        );
        if !classes.contains(&key) {
            classes.push(key);
        }
    };
    for a in allocations {
        push(&a.grade, &a.section);
    }
    if let (Some(g), Some(s)) = (&teacher.grade, &teacher.section) {
        if !g.trim().is_empty() && !s.trim().is_empty() {
            push(g, s);
        }
    }
    classes
}

pub fn class_key(grade: &str, section: &str) -> (String, String) {
    (
        grade.trim().to_ascii_lowercase(),
        section.trim().to_ascii_lowercase(),
    )
}
