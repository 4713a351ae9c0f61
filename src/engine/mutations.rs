use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::lifecycle::{check_cancel, plan_create, plan_update};
use super::{Engine, EngineError, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn require_admin(requester: &Requester) -> Result<(), EngineError> {
    if !requester.is_admin() {
        return Err(EngineError::Forbidden("administrator role required"));
    }
    Ok(())
}

fn validate_space(space: &Space) -> Result<(), EngineError> {
    if space.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("space name is required".into()));
    }
    check_len(&space.name, MAX_NAME_LEN, "space name too long")?;
    check_len(&space.description, MAX_DESCRIPTION_LEN, "description too long")?;
    if space.price.is_negative() {
        return Err(EngineError::InvalidInput("price must not be negative".into()));
    }
    if space.capacity == 0 {
        return Err(EngineError::InvalidInput("capacity must be at least 1".into()));
    }
    if let Some(ref l) = space.location {
        check_len(l, MAX_NAME_LEN, "location too long")?;
    }
    if let Some(ref u) = space.image_url {
        check_len(u, MAX_URL_LEN, "image url too long")?;
    }
    if space.amenities.len() > MAX_AMENITIES {
        return Err(EngineError::LimitExceeded("too many amenities"));
    }
    for a in &space.amenities {
        check_len(a, MAX_NAME_LEN, "amenity too long")?;
    }
    Ok(())
}

fn validate_name(value: &str, what: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} is required")));
    }
    check_len(value, MAX_NAME_LEN, "name too long")
}

fn validate_password(value: &str) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(EngineError::InvalidInput("password is required".into()));
    }
    check_len(value, MAX_PASSWORD_LEN, "password too long")
}

fn validate_email(value: &str) -> Result<(), EngineError> {
    check_len(value, MAX_EMAIL_LEN, "email too long")?;
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !value.contains(char::is_whitespace) => {
            Ok(())
        }
        _ => Err(EngineError::InvalidInput(format!("invalid email: {value}"))),
    }
}

impl Engine {
    /// Hash off the runtime threads; Argon2 is deliberately slow.
    async fn hash_password(&self, password: String) -> Result<String, EngineError> {
        let auth = self.auth.clone();
        tokio::task::spawn_blocking(move || auth.hash(&password))
            .await
            .map_err(|e| EngineError::HashError(e.to_string()))?
    }

    async fn verify_password(&self, password: String, hash: String) -> Result<bool, EngineError> {
        let auth = self.auth.clone();
        tokio::task::spawn_blocking(move || auth.verify(&password, &hash))
            .await
            .map_err(|e| EngineError::HashError(e.to_string()))
    }

    // ── Users ───────────────────────────────────────────────────

    /// Register a user with the `user` role.
    pub async fn register_user(&self, new: NewUser) -> Result<User, EngineError> {
        let _gate = self.write_gate.read().await;
        self.register_with_roles(new, BTreeSet::from([Role::User])).await
    }

    async fn register_with_roles(&self, new: NewUser, roles: BTreeSet<Role>) -> Result<User, EngineError> {
        validate_email(&new.email)?;
        validate_name(&new.first_name, "first name")?;
        validate_name(&new.last_name, "last name")?;
        validate_password(&new.password)?;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }

        let password_hash = self.hash_password(new.password).await?;

        let _guard = self.user_write.lock().await;
        if self.users.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if self.emails.contains_key(&new.email) {
            return Err(EngineError::EmailTaken(new.email));
        }

        let user = User {
            id: new.id,
            email: new.email,
            first_name: new.first_name,
            last_name: new.last_name,
            password_hash,
            roles,
        };
        self.wal_append(&Event::UserRegistered { user: user.clone() }).await?;
        self.apply_user(user.clone());
        info!("registered user {} <{}>", user.id, user.email);
        Ok(user)
    }

    /// Make sure an administrator with this email exists. Registers one if
    /// the email is free, otherwise grants the admin role to that user.
    pub async fn bootstrap_admin(&self, email: &str, password: &str) -> Result<User, EngineError> {
        let _gate = self.write_gate.read().await;
        let existing = self.emails.get(email).map(|e| *e.value());
        match existing {
            None => {
                let new = NewUser {
                    id: Ulid::new(),
                    email: email.to_string(),
                    first_name: "Admin".into(),
                    last_name: "User".into(),
                    password: password.to_string(),
                };
                self.register_with_roles(new, BTreeSet::from([Role::Admin, Role::User]))
                    .await
            }
            Some(id) => {
                let _guard = self.user_write.lock().await;
                let mut user = self
                    .users
                    .get(&id)
                    .map(|u| u.value().clone())
                    .ok_or(EngineError::NotFound(id))?;
                if user.is_admin() {
                    return Ok(user);
                }
                user.roles.insert(Role::Admin);
                self.wal_append(&Event::UserUpdated { user: user.clone() }).await?;
                self.apply_user(user.clone());
                info!("granted admin role to existing user {}", user.email);
                Ok(user)
            }
        }
    }

    /// Check a login against the account registered under that email.
    /// `Ok(None)` means no account uses the login.
    pub async fn authenticate(&self, login: &str, password: &str) -> Result<Option<User>, EngineError> {
        let Some(user) = self.user_by_email(login) else {
            return Ok(None);
        };
        if self
            .verify_password(password.to_string(), user.password_hash.clone())
            .await?
        {
            Ok(Some(user))
        } else {
            Err(EngineError::WrongPassword)
        }
    }

    /// Update the requester's own names and password. Changing the password
    /// requires the current one.
    pub async fn update_profile(
        &self,
        requester: &Requester,
        user_id: Ulid,
        patch: ProfilePatch,
    ) -> Result<User, EngineError> {
        let _gate = self.write_gate.read().await;
        if requester.user_id != Some(user_id) {
            return Err(EngineError::Forbidden("can only update your own profile"));
        }
        if let Some(first) = &patch.first_name {
            validate_name(first, "first name")?;
        }
        if let Some(last) = &patch.last_name {
            validate_name(last, "last name")?;
        }

        // Hashing is slow, so it runs before the lock against a snapshot of
        // the stored hash. The hash must still be current once locked.
        let mut password_change = None;
        if let Some(new_password) = patch.new_password {
            validate_password(&new_password)?;
            let supplied = patch.current_password.ok_or(EngineError::WrongPassword)?;
            let verified_hash = self
                .users
                .get(&user_id)
                .map(|u| u.password_hash.clone())
                .ok_or(EngineError::NotFound(user_id))?;
            if !self.verify_password(supplied, verified_hash.clone()).await? {
                return Err(EngineError::WrongPassword);
            }
            let new_hash = self.hash_password(new_password).await?;
            password_change = Some((verified_hash, new_hash));
        }

        let _guard = self.user_write.lock().await;
        let current = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(user_id))?;

        let mut updated = current.clone();
        if let Some(first) = patch.first_name {
            updated.first_name = first;
        }
        if let Some(last) = patch.last_name {
            updated.last_name = last;
        }
        if let Some((verified_hash, new_hash)) = password_change {
            if current.password_hash != verified_hash {
                return Err(EngineError::WrongPassword);
            }
            updated.password_hash = new_hash;
        }
        if updated == current {
            return Ok(current);
        }

        self.wal_append(&Event::UserUpdated { user: updated.clone() }).await?;
        self.apply_user(updated.clone());
        Ok(updated)
    }

    /// Replace a user's roles. Administrators only.
    pub async fn set_roles(
        &self,
        requester: &Requester,
        user_id: Ulid,
        roles: BTreeSet<Role>,
    ) -> Result<User, EngineError> {
        let _gate = self.write_gate.read().await;
        require_admin(requester)?;
        if roles.is_empty() {
            return Err(EngineError::InvalidInput("at least one role is required".into()));
        }
        let _guard = self.user_write.lock().await;
        let mut user = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(user_id))?;
        user.roles = roles;
        self.wal_append(&Event::UserUpdated { user: user.clone() }).await?;
        self.apply_user(user.clone());
        Ok(user)
    }

    // ── Space Catalog ───────────────────────────────────────────

    pub async fn create_space(&self, requester: &Requester, space: Space) -> Result<Space, EngineError> {
        let _gate = self.write_gate.read().await;
        require_admin(requester)?;
        validate_space(&space)?;

        let _guard = self.catalog_write.lock().await;
        if self.spaces.len() >= MAX_SPACES {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }
        if self.spaces.contains_key(&space.id) {
            return Err(EngineError::AlreadyExists(space.id));
        }

        self.wal_append(&Event::SpaceCreated { space: space.clone() }).await?;
        self.spaces
            .insert(space.id, Arc::new(RwLock::new(SpaceState::new(space.clone()))));
        info!("created space {} ({})", space.id, space.name);
        Ok(space)
    }

    /// Partial update. Existing reservations keep their attendees and price.
    pub async fn update_space(
        &self,
        requester: &Requester,
        id: Ulid,
        patch: SpacePatch,
    ) -> Result<Space, EngineError> {
        let _gate = self.write_gate.read().await;
        require_admin(requester)?;
        let ss = self.get_space_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;

        let mut space = guard.space.clone();
        patch.apply(&mut space);
        validate_space(&space)?;
        if space == guard.space {
            return Ok(space);
        }

        let event = Event::SpaceUpdated { space: space.clone() };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(space)
    }

    /// Remove a space, or only deactivate it when any reservation (of any
    /// status) references it.
    pub async fn delete_space(&self, requester: &Requester, id: Ulid) -> Result<SpaceRemoval, EngineError> {
        let _gate = self.write_gate.read().await;
        require_admin(requester)?;
        let _catalog = self.catalog_write.lock().await;
        let ss = self.get_space_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ss.write().await;

        if !guard.reservations.is_empty() {
            let event = Event::SpaceDeactivated { id };
            self.persist_and_apply(&mut guard, &event).await?;
            info!("space {id} disabled ({} reservations kept)", guard.reservations.len());
            return Ok(SpaceRemoval::Disabled);
        }

        self.wal_append(&Event::SpaceDeleted { id }).await?;
        self.spaces.remove(&id);
        info!("space {id} deleted");
        Ok(SpaceRemoval::Deleted)
    }

    // ── Reservation Lifecycle ───────────────────────────────────

    pub async fn create_reservation(
        &self,
        requester: &Requester,
        req: NewReservation,
    ) -> Result<Reservation, EngineError> {
        self.create_reservation_at(requester, req, now_ms()).await
    }

    /// The space's write lock is held from validation through the WAL append
    /// and insert, so two overlapping requests can never both pass the check.
    pub(crate) async fn create_reservation_at(
        &self,
        requester: &Requester,
        req: NewReservation,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate.read().await;
        let ss = self
            .get_space_state(&req.space_id)
            .ok_or(EngineError::NotFound(req.space_id))?;
        let mut guard = ss.write().await;
        // Deleted while we waited for the lock.
        if !self.spaces.contains_key(&req.space_id) {
            return Err(EngineError::NotFound(req.space_id));
        }
        if self.reservation_to_space.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let outcome = plan_create(&guard, requester, &req, now);
        let reservation = match outcome {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!(
                    crate::observability::RESERVATIONS_REJECTED_TOTAL,
                    "reason" => crate::observability::rejection_label(&e)
                )
                .increment(1);
                debug!("reservation {} on space {} rejected: {e}", req.id, req.space_id);
                return Err(e);
            }
        };

        // Ids are global but the lock above is per space: claim the id in the
        // index before the append so a create on another space cannot take it.
        match self.reservation_to_space.entry(req.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(req.id)),
            Entry::Vacant(slot) => {
                slot.insert(req.space_id);
            }
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
            self.reservation_to_space.remove(&req.id);
            return Err(e);
        }
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
        Ok(reservation)
    }

    pub async fn update_reservation(
        &self,
        requester: &Requester,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        self.update_reservation_at(requester, id, patch, now_ms()).await
    }

    pub(crate) async fn update_reservation_at(
        &self,
        requester: &Requester,
        id: Ulid,
        patch: ReservationPatch,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;

        let Some(planned) = plan_update(&current, requester, &patch)? else {
            return Ok(current);
        };

        let event = Event::ReservationUpdated {
            id,
            space_id: current.space_id,
            status: planned.status,
            notes: planned.notes,
            updated_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if planned.status != current.status {
            info!("reservation {id}: {} -> {}", current.status, planned.status);
        }
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_reservation(&self, requester: &Requester, id: Ulid) -> Result<Reservation, EngineError> {
        self.cancel_reservation_at(requester, id, now_ms()).await
    }

    pub(crate) async fn cancel_reservation_at(
        &self,
        requester: &Requester,
        id: Ulid,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))?;

        check_cancel(&current, requester, now)?;

        let event = Event::ReservationCanceled {
            id,
            space_id: current.space_id,
            updated_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CANCELED_TOTAL).increment(1);
        guard.reservation(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── WAL compaction ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set recreating the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        let users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        for user in users {
            events.push(Event::UserRegistered { user });
        }

        for ss in self.space_handles() {
            let guard = ss.read().await;
            events.push(Event::SpaceCreated {
                space: guard.space.clone(),
            });
            for reservation in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
