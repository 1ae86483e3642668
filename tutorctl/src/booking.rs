//! Booking engine: one student, one lesson.
//!
//! Creating a booking checks, in this order: the lesson exists, the student never cancelled it
//! before, it has a free seat, the student is not booked on it already, the student has no
//! overlapping booking, and finally that the student can pay for it. The first failing check
//! decides the error, and nothing is written unless all of them pass.
//!
//! Cancelling refunds exactly what was charged when the cancellation comes more than
//! `scheduling.cancellation_window` before the lesson starts, and leaves a permanent marker
//! that blocks the student from booking that lesson again.
//!
//! The per-lesson steps ([`book_student`], [`cancel_active_booking`]) are shared with template
//! application and bulk edits, which run them inside their own units of work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::calendar::refund_allowed;
use crate::db::models::{
    bookings::{BookingCreateDBRequest, BookingDBResponse, BookingFilter},
    credits::CreditReason,
    lessons::LessonDBResponse,
};
use crate::errors::{Error, Result};
use crate::ledger::CreditLedger;
use crate::scheduler::{require_role, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, Actor, ApplicationId, BookingId, IsolationLevel, LessonId, Role, UserId};

/// Knobs that differ between the callers of [`book_student`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct BookingRules {
    /// Template application skips the cross-lesson overlap check
    pub check_schedule_conflicts: bool,
    pub application_id: Option<ApplicationId>,
    pub booked_by: Option<UserId>,
}

/// Book `student_id` onto an already locked, live lesson. Updates `lesson.current_students`.
pub(crate) async fn book_student<T: StoreTx>(
    tx: &mut T,
    now: DateTime<Utc>,
    student_id: UserId,
    lesson: &mut LessonDBResponse,
    rules: BookingRules,
) -> Result<BookingDBResponse> {
    // The balance row doubles as the per-student lock: two bookings of the same student on
    // different lessons queue here, so the overlap check below sees the other's commit.
    tx.lock_balance(student_id, now).await?;

    if tx.has_cancellation_marker(student_id, lesson.id).await? {
        return Err(Error::LessonPreviouslyCancelled {
            student_id,
            lesson_id: lesson.id,
        });
    }

    if lesson.is_full() {
        return Err(Error::LessonFull { lesson_id: lesson.id });
    }

    if tx.find_active_booking(student_id, lesson.id).await?.is_some() {
        return Err(Error::DuplicateBooking {
            student_id,
            lesson_id: lesson.id,
        });
    }

    if rules.check_schedule_conflicts {
        if let Some(conflicting_lesson_id) = tx
            .find_overlapping_booked_lesson(student_id, lesson.start_time, lesson.end_time, lesson.id)
            .await?
        {
            return Err(Error::ScheduleConflict {
                lesson_id: lesson.id,
                conflicting_lesson_id,
            });
        }
    }

    let booking_id = Uuid::new_v4();
    let credits = i64::from(lesson.credits_cost);
    let reason = match rules.application_id {
        Some(application_id) => CreditReason::TemplateBooking { application_id, booking_id },
        None => CreditReason::Booking { booking_id },
    };
    CreditLedger::new(&mut *tx, now, rules.booked_by).deduct(student_id, credits, reason).await?;

    let booking = tx
        .insert_booking(&BookingCreateDBRequest {
            id: booking_id,
            student_id,
            lesson_id: lesson.id,
            credits_charged: credits,
            template_application_id: rules.application_id,
            booked_by: rules.booked_by,
            booked_at: now,
        })
        .await?;

    lesson.current_students += 1;
    tx.set_current_students(lesson.id, lesson.current_students).await?;

    debug!(
        booking_id = %abbrev_uuid(&booking.id),
        lesson_id = %abbrev_uuid(&lesson.id),
        current_students = lesson.current_students,
        "Student booked"
    );
    Ok(booking)
}

/// Cancel an active booking on a locked lesson, refunding it when the cancellation window
/// allows. Returns the refunded amount.
pub(crate) async fn cancel_active_booking<T: StoreTx>(
    tx: &mut T,
    now: DateTime<Utc>,
    booking: &BookingDBResponse,
    lesson: &mut LessonDBResponse,
    window: Duration,
    performed_by: Option<UserId>,
    write_marker: bool,
) -> Result<i64> {
    let refunded = if booking.credits_charged > 0 && refund_allowed(now, lesson.start_time, window) {
        CreditLedger::new(&mut *tx, now, performed_by)
            .refund(
                booking.student_id,
                booking.credits_charged,
                CreditReason::Cancellation { booking_id: booking.id },
            )
            .await?;
        booking.credits_charged
    } else {
        0
    };

    tx.mark_booking_cancelled(booking.id, now).await?;
    if write_marker {
        tx.insert_cancellation_marker(booking.student_id, lesson.id, now).await?;
    }

    lesson.current_students = (lesson.current_students - 1).max(0);
    tx.set_current_students(lesson.id, lesson.current_students).await?;

    Ok(refunded)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    Success,
    AlreadyCancelled,
}

#[derive(Debug, Clone)]
pub struct CancelResult {
    pub status: CancelStatus,
    pub refunded_credits: i64,
    pub booking: BookingDBResponse,
}

#[derive(Clone, Debug)]
pub struct BookingEngine<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> BookingEngine<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    /// Book a student onto a lesson and charge them its cost.
    ///
    /// Non-admin actors may only book themselves, and only before the lesson starts.
    #[instrument(skip(self), fields(actor = %abbrev_uuid(&actor.user_id), student_id = %abbrev_uuid(&student_id), lesson_id = %abbrev_uuid(&lesson_id)), err)]
    pub async fn create_booking(&self, actor: Actor, student_id: UserId, lesson_id: LessonId) -> Result<BookingDBResponse> {
        if !actor.is_admin && actor.user_id != student_id {
            return Err(Error::Unauthorized {
                user_id: actor.user_id,
                action: "book another student",
            });
        }

        let ctx = &self.ctx;
        ctx.with_deadline("create_booking", async {
            let now = ctx.now();
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            require_role(&mut tx, student_id, Role::Student).await?;

            let mut lesson = match tx.lock_lesson(lesson_id).await? {
                Some(lesson) if !lesson.is_deleted() => lesson,
                _ => return Err(Error::LessonNotFound { lesson_id }),
            };
            if !actor.is_admin && lesson.start_time <= now {
                return Err(Error::LessonStarted { lesson_id });
            }

            let rules = BookingRules {
                check_schedule_conflicts: true,
                application_id: None,
                booked_by: Some(actor.user_id),
            };
            let booking = match book_student(&mut tx, now, student_id, &mut lesson, rules).await {
                Ok(booking) => booking,
                Err(e) => {
                    warn!(error = %e, "Booking rejected");
                    return Err(e);
                }
            };
            tx.commit().await?;

            crate::metrics::record_booking_created("direct");
            crate::metrics::record_credits("deduct", booking.credits_charged);
            info!(
                booking_id = %abbrev_uuid(&booking.id),
                credits = booking.credits_charged,
                "Booking created"
            );
            Ok(booking)
        })
        .await
    }

    /// Cancel a booking. Cancelling twice is not an error: the second call reports
    /// `AlreadyCancelled` and refunds nothing.
    #[instrument(skip(self), fields(actor = %abbrev_uuid(&actor.user_id), booking_id = %abbrev_uuid(&booking_id)), err)]
    pub async fn cancel_booking(&self, actor: Actor, booking_id: BookingId) -> Result<CancelResult> {
        let ctx = &self.ctx;
        ctx.with_deadline("cancel_booking", async {
            let now = ctx.now();
            let window = ctx.settings.cancellation_window()?;
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;

            let booking = tx.lock_booking(booking_id).await?.ok_or(Error::BookingNotFound { booking_id })?;
            if !actor.is_admin && booking.student_id != actor.user_id {
                return Err(Error::Unauthorized {
                    user_id: actor.user_id,
                    action: "cancel another student's booking",
                });
            }

            if !booking.is_active() {
                tx.rollback().await?;
                debug!("Booking already cancelled");
                return Ok(CancelResult {
                    status: CancelStatus::AlreadyCancelled,
                    refunded_credits: 0,
                    booking,
                });
            }

            let mut lesson = tx.lock_lesson(booking.lesson_id).await?.ok_or(Error::LessonNotFound {
                lesson_id: booking.lesson_id,
            })?;
            let refunded =
                cancel_active_booking(&mut tx, now, &booking, &mut lesson, window, Some(actor.user_id), true).await?;
            let booking = tx.get_booking(booking_id).await?.ok_or(Error::BookingNotFound { booking_id })?;
            tx.commit().await?;

            crate::metrics::record_booking_cancelled(refunded > 0);
            if refunded > 0 {
                crate::metrics::record_credits("refund", refunded);
            }
            info!(refunded, "Booking cancelled");
            Ok(CancelResult {
                status: CancelStatus::Success,
                refunded_credits: refunded,
                booking,
            })
        })
        .await
    }

    #[instrument(skip(self), fields(booking_id = %abbrev_uuid(&booking_id)), err)]
    pub async fn get_booking(&self, booking_id: BookingId) -> Result<BookingDBResponse> {
        let ctx = &self.ctx;
        ctx.with_deadline("get_booking", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let booking = tx.get_booking(booking_id).await?.ok_or(Error::BookingNotFound { booking_id })?;
            tx.rollback().await?;
            Ok(booking)
        })
        .await
    }

    #[instrument(skip(self, filter), err)]
    pub async fn list_bookings(&self, filter: BookingFilter) -> Result<Vec<BookingDBResponse>> {
        if filter.skip < 0 || filter.limit < 0 {
            return Err(Error::invalid("limit", "skip and limit must not be negative"));
        }
        let ctx = &self.ctx;
        ctx.with_deadline("list_bookings", async {
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            let bookings = tx.list_bookings(&filter).await?;
            tx.rollback().await?;
            Ok(bookings)
        })
        .await
    }
}
