use ulid::Ulid;

use crate::model::*;

use super::availability::{free_spans, is_available};
use super::conflict::{now_ms, validate_window};
use super::{Engine, EngineError};

impl Engine {
    // ── Users ───────────────────────────────────────────────────

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let id = self.emails.get(email).map(|e| *e.value())?;
        self.get_user(&id)
    }

    /// Identity for a session login. Unknown logins are anonymous.
    /// Requester for a session pinned to `user_id` at login. Roles are read
    /// on every call so grants and revocations reach open sessions.
    pub fn requester_for(&self, user_id: Option<Ulid>) -> Requester {
        match user_id.and_then(|id| self.get_user(&id)) {
            Some(user) => Requester::for_user(&user),
            None => Requester::anonymous(),
        }
    }

    pub fn profile(&self, requester: &Requester) -> Result<User, EngineError> {
        let id = requester
            .user_id
            .ok_or(EngineError::Forbidden("login as a registered user first"))?;
        self.get_user(&id).ok_or(EngineError::NotFound(id))
    }

    // ── Space Catalog ───────────────────────────────────────────

    /// Inactive spaces are visible to administrators only.
    pub async fn get_space(&self, requester: &Requester, id: Ulid) -> Result<Space, EngineError> {
        let ss = self.get_space_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ss.read().await;
        if !guard.space.is_active && !requester.is_admin() {
            return Err(EngineError::Forbidden("space is not active"));
        }
        Ok(guard.space.clone())
    }

    /// Active spaces for everyone, all spaces for administrators; by name.
    pub async fn list_spaces(&self, requester: &Requester) -> Vec<Space> {
        let mut spaces = Vec::new();
        for ss in self.space_handles() {
            let guard = ss.read().await;
            if guard.space.is_active || requester.is_admin() {
                spaces.push(guard.space.clone());
            }
        }
        spaces.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        spaces
    }

    // ── Availability ────────────────────────────────────────────

    pub async fn check_availability(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        let query = validate_window(start, end)?;
        let ss = self.get_space_state(&space_id).ok_or(EngineError::NotFound(space_id))?;
        let guard = ss.read().await;
        Ok(is_available(&guard, &query, exclude))
    }

    pub async fn free_slots(&self, space_id: Ulid, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let query = validate_window(start, end)?;
        let ss = self.get_space_state(&space_id).ok_or(EngineError::NotFound(space_id))?;
        let guard = ss.read().await;
        Ok(free_spans(&guard, &query))
    }

    // ── Reservations ────────────────────────────────────────────

    pub async fn get_reservation(&self, requester: &Requester, id: Ulid) -> Result<Reservation, EngineError> {
        let guard = self.resolve_reservation_read(&id).await?;
        let reservation = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !requester.is_admin() && !requester.owns(&reservation) {
            return Err(EngineError::Forbidden("not the owner of this reservation"));
        }
        Ok(reservation)
    }

    async fn collect_reservations(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut out = Vec::new();
        for ss in self.space_handles() {
            let guard = ss.read().await;
            out.extend(guard.reservations.iter().filter(|r| keep(r)).cloned());
        }
        out
    }

    /// Everything for administrators, otherwise the requester's own; newest start first.
    pub async fn list_reservations(&self, requester: &Requester) -> Vec<Reservation> {
        let admin = requester.is_admin();
        let mut out = self
            .collect_reservations(|r| admin || requester.owns(r))
            .await;
        out.sort_by(|a, b| b.span.start.cmp(&a.span.start).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn upcoming_reservations(&self, requester: &Requester) -> Vec<Reservation> {
        self.upcoming_reservations_at(requester, now_ms()).await
    }

    /// The requester's non-canceled reservations starting after `now`, soonest first.
    pub(crate) async fn upcoming_reservations_at(&self, requester: &Requester, now: Ms) -> Vec<Reservation> {
        let mut out = self
            .collect_reservations(|r| {
                requester.owns(r) && r.span.start > now && r.status != ReservationStatus::Canceled
            })
            .await;
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        out
    }

    /// Non-canceled reservations with start or end inside the inclusive
    /// window `[start, end]`. Administrators only.
    pub async fn calendar(&self, requester: &Requester, start: Ms, end: Ms) -> Result<Vec<Reservation>, EngineError> {
        if !requester.is_admin() {
            return Err(EngineError::Forbidden("administrator role required"));
        }
        validate_window(start, end)?;
        let within = |t: Ms| start <= t && t <= end;
        let mut out = self
            .collect_reservations(|r| {
                r.status != ReservationStatus::Canceled && (within(r.span.start) || within(r.span.end))
            })
            .await;
        out.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}
