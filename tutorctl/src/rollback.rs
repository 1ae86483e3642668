//! Undo a template application.
//!
//! Rolling back a week refunds every active booking on the lessons the application created,
//! in full and regardless of the cancellation window, then soft-deletes those lessons and
//! marks the application `rolled_back`. Once rolled back the same template can be applied to
//! that week again. No cancellation markers are written, so re-applying can rebook the same
//! students.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, instrument};

use crate::db::models::credits::CreditReason;
use crate::errors::{Error, Result};
use crate::ledger::CreditLedger;
use crate::scheduler::{require_schedule_manager, EngineContext};
use crate::store::{Store, StoreTx};
use crate::types::{abbrev_uuid, IsolationLevel, TemplateId, UserId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollbackResult {
    pub deleted_lessons: u32,
    pub refunded_credits: i64,
    pub cancelled_bookings: u32,
}

#[derive(Clone, Debug)]
pub struct RollbackEngine<S: Store> {
    ctx: EngineContext<S>,
}

impl<S: Store> RollbackEngine<S> {
    pub fn new(ctx: EngineContext<S>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self), fields(actor_id = %abbrev_uuid(&actor_id), template_id = %abbrev_uuid(&template_id), %week_start), err)]
    pub async fn rollback_week_to_template(&self, actor_id: UserId, week_start: NaiveDate, template_id: TemplateId) -> Result<RollbackResult> {
        let ctx = &self.ctx;
        ctx.with_deadline("rollback_week_to_template", async {
            let now = ctx.now();
            let mut tx = ctx.begin(IsolationLevel::ReadCommitted).await?;
            require_schedule_manager(&mut tx, actor_id, "roll back template applications").await?;

            let application = tx
                .lock_applied_application(template_id, week_start)
                .await?
                .ok_or(Error::NothingToRollback { template_id, week_start })?;

            let mut result = RollbackResult::default();
            let lessons = tx.lock_application_lessons(application.id).await?;
            for lesson in lessons {
                let bookings = tx.lock_active_bookings_for_lesson(lesson.id).await?;
                for booking in bookings {
                    if booking.credits_charged > 0 {
                        // Bookings made directly on these lessons were never charged to the application
                        let reason = if booking.template_application_id == Some(application.id) {
                            CreditReason::TemplateRollback {
                                application_id: application.id,
                                booking_id: booking.id,
                            }
                        } else {
                            CreditReason::Cancellation { booking_id: booking.id }
                        };
                        CreditLedger::new(&mut tx, now, Some(actor_id))
                            .refund(booking.student_id, booking.credits_charged, reason)
                            .await?;
                        result.refunded_credits += booking.credits_charged;
                    }
                    tx.mark_booking_cancelled(booking.id, now).await?;
                    result.cancelled_bookings += 1;
                }

                if lesson.current_students != 0 {
                    tx.set_current_students(lesson.id, 0).await?;
                }
                if !lesson.is_deleted() {
                    tx.soft_delete_lesson(lesson.id, now).await?;
                    result.deleted_lessons += 1;
                }
            }

            tx.mark_application_rolled_back(application.id, now).await?;
            tx.commit().await?;

            crate::metrics::record_rollback();
            if result.refunded_credits > 0 {
                crate::metrics::record_credits("refund", result.refunded_credits);
            }
            info!(
                application_id = %abbrev_uuid(&application.id),
                deleted_lessons = result.deleted_lessons,
                cancelled_bookings = result.cancelled_bookings,
                refunded_credits = result.refunded_credits,
                "Template application rolled back"
            );
            Ok(result)
        })
        .await
    }
}
