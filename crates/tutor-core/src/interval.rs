//! Interval overlap checking
//!
//! Pure functions; the caller loads the teacher's sessions and decides what
//! to do with the result. Any conflict fails the whole batch.

use chrono::{DateTime, Utc};
use tutor_api::{Session, SlotConflict};
use tutor_util::{SessionId, TimeSpan};

/// Which existing sessions count as commitments
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitmentFilter<'a> {
    /// Session being moved; its current slot does not block its new one
    pub exclude: Option<&'a SessionId>,
    /// Whether USER_ABSENT / TEACHER_ABSENT sessions still hold their slot
    pub absences_block: bool,
}

impl CommitmentFilter<'_> {
    fn holds_slot(&self, session: &Session) -> bool {
        if self.exclude.is_some_and(|id| *id == session.id) {
            return false;
        }
        self.absences_block || !session.status.is_absence()
    }
}

/// Check every candidate start against the committed sessions and against
/// the other candidates of the same batch.
pub fn find_conflicts(
    candidates: &[DateTime<Utc>],
    duration_minutes: u32,
    existing: &[Session],
    filter: CommitmentFilter<'_>,
) -> Vec<SlotConflict> {
    let committed: Vec<&Session> = existing.iter().filter(|s| filter.holds_slot(s)).collect();
    let mut conflicts = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        let span = TimeSpan::from_minutes(*candidate, duration_minutes);

        for session in &committed {
            let existing_span = session.span();
            if span.overlaps(&existing_span) {
                conflicts.push(SlotConflict {
                    candidate: *candidate,
                    session_id: Some(session.id.clone()),
                    existing: existing_span,
                });
            }
        }

        for earlier in &candidates[..i] {
            let earlier_span = TimeSpan::from_minutes(*earlier, duration_minutes);
            if span.overlaps(&earlier_span) {
                conflicts.push(SlotConflict {
                    candidate: *candidate,
                    session_id: None,
                    existing: earlier_span,
                });
            }
        }
    }

    conflicts
}
