//! Helpers for tests that drive the engines against the in-memory store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::config::SchedulingConfig;
use crate::db::models::{
    lessons::{LessonCreateDBRequest, LessonDBResponse},
    users::UserCreateDBRequest,
};
use crate::scheduler::Scheduler;
use crate::store::{InMemoryStore, Store, StoreTx};
use crate::types::{Actor, IsolationLevel, LessonId, Role, UserId};

/// Sunday 2026-10-18 12:00 UTC. The next Monday is 2026-10-19.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

pub struct TestEnv {
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub scheduler: Scheduler<InMemoryStore>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(SchedulingConfig::default())
    }

    pub fn with_settings(settings: SchedulingConfig) -> Self {
        let store = InMemoryStore::new();
        let clock = ManualClock::new(test_epoch());
        let scheduler = Scheduler::new(store.clone(), Arc::new(clock.clone()), settings);
        Self { store, clock, scheduler }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn user(&self, role: Role) -> UserId {
        self.scheduler
            .create_user(UserCreateDBRequest::new(format!("{role} user"), role))
            .await
            .unwrap()
            .id
    }

    pub async fn grant(&self, user: UserId, credits: i64) {
        let admin = self.user(Role::Admin).await;
        self.scheduler
            .ledger()
            .grant_credits(Actor::admin(admin), user, credits, "test top-up")
            .await
            .unwrap();
    }

    pub async fn student_with_credits(&self, credits: i64) -> UserId {
        let student = self.user(Role::Student).await;
        if credits > 0 {
            self.grant(student, credits).await;
        }
        student
    }

    pub async fn balance(&self, user: UserId) -> i64 {
        self.scheduler.ledger().get_balance(user).await.unwrap()
    }

    /// One-hour lesson inserted straight into the store, bypassing validation.
    pub async fn lesson(&self, teacher: UserId, start: DateTime<Utc>, max_students: i32, credits_cost: i32) -> LessonDBResponse {
        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let lesson = tx
            .insert_lesson(&LessonCreateDBRequest {
                teacher_id: teacher,
                start_time: start,
                end_time: start + Duration::hours(1),
                max_students,
                credits_cost,
                recurring_group_id: None,
                template_application_id: None,
                created_at: self.now(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        lesson
    }

    /// Current row, including soft-deleted lessons.
    pub async fn get_lesson(&self, id: LessonId) -> LessonDBResponse {
        let mut tx = self.store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.get_lesson(id).await.unwrap().unwrap()
    }
}
