//! Command dispatch.
//!
//! [`App::handle`] runs the guard pipeline against the command's
//! [`Capability`] and then executes it against the engine and collaborators.

use std::sync::Arc;

use tracing::{info, warn};
use ulid::Ulid;

use crate::config::BootstrapAdmin;
use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::guard::{Capability, Pipeline, RequestContext};
use crate::kv::KvStore;
use crate::limits::{MAX_PASSWORD_LEN, MIN_PASSWORD_LEN};
use crate::mail::{Mail, Mailer};
use crate::model::*;
use crate::password::{hash_password, verify_password};
use crate::sql::Command;
use crate::throttle::{Decision, Throttle};
use crate::token::{Claims, TokenPair, TokenService};

const ADMIN_EMAIL_KEY: &str = "admin_email";
pub const URGE_SUPPRESSED_MESSAGE: &str = "an urge was already sent for this booking recently, please wait";

impl Command {
    pub fn capability(&self) -> Capability {
        match self {
            Command::SetAccessToken { .. }
            | Command::ResetAccessToken
            | Command::Login { .. }
            | Command::Refresh { .. }
            | Command::Register { .. }
            | Command::GetRoom { .. }
            | Command::ListRooms { .. }
            | Command::Availability { .. } => Capability::public(),
            Command::Me
            | Command::RequestBooking { .. }
            | Command::Reschedule { .. }
            | Command::ListBookings { .. }
            | Command::Urge { .. } => Capability::login(),
            Command::SetBookingStatus {
                status: BookingStatus::Released,
                ..
            } => Capability::login(),
            Command::SetBookingStatus { .. } => Capability::permissions(&[PERM_BOOKING_REVIEW]),
            Command::ListAccounts { .. } | Command::FreezeAccount { .. } | Command::GrantRole { .. } => {
                Capability::permissions(&[PERM_ACCOUNT_MANAGE])
            }
            Command::CreateRoom { .. } | Command::UpdateRoom { .. } | Command::DeleteRoom { .. } => {
                Capability::permissions(&[PERM_ROOM_MANAGE])
            }
        }
    }
}

/// Result of a successfully handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// New session token; `None` clears it.
    Session(Option<String>),
    Tokens {
        pair: TokenPair,
        account: AccountInfo,
        permissions: Vec<PermissionGrant>,
    },
    Identity(Identity),
    Account(AccountInfo),
    Accounts(Page<AccountInfo>),
    Room(RoomInfo),
    Rooms(Page<RoomInfo>),
    Spans { room_id: Ulid, spans: Vec<Span> },
    Booking(BookingInfo),
    Bookings(Page<BookingInfo>),
    Executed { tag: &'static str, rows: usize },
    Message { status: &'static str, message: String },
}

pub struct App {
    engine: Arc<Engine>,
    tokens: Arc<TokenService>,
    pipeline: Pipeline,
    throttle: Throttle,
    kv: Arc<dyn KvStore>,
    mailer: Arc<dyn Mailer>,
    urge_window_secs: u64,
}

async fn hash_blocking(password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| AppError::Upstream(format!("password task failed: {e}")))?
        .map_err(AppError::from)
}

async fn verify_blocking(password: String, hash: String) -> AppResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::Upstream(format!("password task failed: {e}")))?
        .map_err(AppError::from)
}

fn caller(ctx: &RequestContext) -> AppResult<&Claims> {
    ctx.claims
        .as_ref()
        .ok_or_else(|| AppError::Unauthenticated("login required".into()))
}

impl App {
    pub fn new(
        engine: Arc<Engine>,
        tokens: Arc<TokenService>,
        kv: Arc<dyn KvStore>,
        mailer: Arc<dyn Mailer>,
        urge_window_secs: u64,
    ) -> Self {
        Self {
            pipeline: Pipeline::standard(tokens.clone()),
            throttle: Throttle::new(kv.clone()),
            engine,
            tokens,
            kv,
            mailer,
            urge_window_secs,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Create the configured admin account unless the username is taken.
    /// Returns whether an account was created.
    pub async fn bootstrap_admin(&self, admin: &BootstrapAdmin) -> AppResult<bool> {
        if self.engine.account_by_username(&admin.username).is_some() {
            return Ok(false);
        }
        let hash = hash_blocking(admin.password.clone()).await?;
        let account = self
            .engine
            .register_account(&admin.username, hash, &admin.email, true)
            .await?;
        info!("created admin account {} ({})", account.username, account.id);
        Ok(true)
    }

    pub async fn handle(&self, cmd: Command, bearer: Option<String>) -> AppResult<Outcome> {
        let mut ctx = RequestContext::new(bearer);
        self.pipeline.run(&cmd.capability(), &mut ctx)?;

        match cmd {
            Command::SetAccessToken { token } => Ok(Outcome::Session(Some(token))),
            Command::ResetAccessToken => Ok(Outcome::Session(None)),
            Command::Login {
                username,
                password,
                admin_only,
            } => self.login(&username, password, admin_only).await,
            Command::Refresh { refresh_token } => self.refresh(&refresh_token),
            Command::Register {
                username,
                password,
                email,
            } => self.register(&username, password, &email).await,
            Command::Me => Ok(Outcome::Identity(caller(&ctx)?.identity())),
            Command::ListAccounts { username, page } => Ok(Outcome::Accounts(
                self.engine.list_accounts(username.as_deref(), page),
            )),
            Command::FreezeAccount { id, frozen } => {
                let account = self.engine.set_account_frozen(id, frozen).await?;
                info!("account {} frozen={frozen}", account.username);
                Ok(Outcome::Account(self.engine.account_info(&account)))
            }
            Command::GrantRole { account_id, role } => {
                let granted = self.engine.grant_role(account_id, &role).await?;
                Ok(Outcome::Executed {
                    tag: "INSERT",
                    rows: usize::from(granted),
                })
            }
            Command::CreateRoom { id, spec } => {
                let id = id.unwrap_or_else(Ulid::new);
                self.engine.create_room(id, spec.clone()).await?;
                Ok(Outcome::Room(RoomInfo {
                    id,
                    name: spec.name,
                    capacity: spec.capacity,
                    location: spec.location,
                    equipment: spec.equipment,
                    description: spec.description,
                    is_booked: false,
                }))
            }
            Command::UpdateRoom { id, patch } => Ok(Outcome::Room(self.engine.patch_room(id, patch).await?)),
            Command::DeleteRoom { id } => {
                let cascaded = self.engine.delete_room(id).await?;
                info!("deleted room {id} with {cascaded} bookings");
                Ok(Outcome::Executed { tag: "DELETE", rows: 1 })
            }
            Command::GetRoom { id } => self
                .engine
                .room(id)
                .await
                .map(Outcome::Room)
                .ok_or_else(|| AppError::NotFound(format!("room {id}"))),
            Command::ListRooms { name, location, page } => Ok(Outcome::Rooms(
                self.engine
                    .list_rooms(name.as_deref(), location.as_deref(), page)
                    .await,
            )),
            Command::Availability { room_id, start, end } => Ok(Outcome::Spans {
                room_id,
                spans: self.engine.availability(room_id, start, end).await?,
            }),
            Command::RequestBooking {
                id,
                room_id,
                start,
                end,
                note,
            } => {
                let account_id = caller(&ctx)?.id;
                let booking = self
                    .engine
                    .request_booking(id.unwrap_or_else(Ulid::new), room_id, account_id, start, end, note)
                    .await?;
                self.booking_outcome(booking.id).await
            }
            Command::Reschedule { id, start, end } => {
                self.authorize_owner(caller(&ctx)?, id).await?;
                self.engine.reschedule_booking(id, start, end).await?;
                self.booking_outcome(id).await
            }
            Command::SetBookingStatus { id, status } => {
                if status == BookingStatus::Released {
                    self.authorize_owner(caller(&ctx)?, id).await?;
                }
                self.engine.set_booking_status(id, status).await?;
                self.booking_outcome(id).await
            }
            Command::ListBookings { filter, page } => {
                Ok(Outcome::Bookings(self.engine.list_bookings(&filter, page).await))
            }
            Command::Urge { booking_id } => self.urge(booking_id).await,
        }
    }

    async fn login(&self, username: &str, password: String, admin_only: bool) -> AppResult<Outcome> {
        let account = self
            .engine
            .account_by_username(username)
            .filter(|a| !admin_only || a.is_admin)
            .ok_or_else(|| AppError::NotFound("user not found".into()))?;
        if !verify_blocking(password, account.password_hash.clone()).await? {
            return Err(AppError::Invalid("wrong password".into()));
        }
        if account.is_frozen {
            return Err(AppError::Forbidden("account is frozen".into()));
        }
        info!("login {}", account.username);
        self.issue(&account)
    }

    /// Roles and permissions are re-read, so grants and freezes apply from
    /// the next refresh on.
    fn refresh(&self, refresh_token: &str) -> AppResult<Outcome> {
        let claims = self.tokens.verify_refresh(refresh_token).map_err(|e| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL, "reason" => "refresh").increment(1);
            tracing::debug!("rejected refresh token: {e}");
            AppError::from(e)
        })?;
        let account = self
            .engine
            .account(&claims.id)
            .filter(|a| !a.is_frozen)
            .ok_or_else(|| AppError::Unauthenticated("account unavailable".into()))?;
        self.issue(&account)
    }

    fn issue(&self, account: &Account) -> AppResult<Outcome> {
        let identity = self.engine.resolve_identity(account);
        let pair = self.tokens.issue(&identity)?;
        Ok(Outcome::Tokens {
            pair,
            account: self.engine.account_info(account),
            permissions: identity.permissions,
        })
    }

    async fn register(&self, username: &str, password: String, email: &str) -> AppResult<Outcome> {
        let len = password.chars().count();
        if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&len) {
            return Err(AppError::Invalid(format!(
                "password must be {MIN_PASSWORD_LEN} to {MAX_PASSWORD_LEN} characters"
            )));
        }
        // Fail fast before hashing; the engine still enforces uniqueness.
        if self.engine.account_by_username(username).is_some() {
            return Err(AppError::Conflict(format!("username {username} is taken")));
        }
        let hash = hash_blocking(password).await?;
        let account = self.engine.register_account(username, hash, email, false).await?;
        info!("registered {} ({})", account.username, account.id);
        Ok(Outcome::Account(self.engine.account_info(&account)))
    }

    async fn booking_outcome(&self, id: Ulid) -> AppResult<Outcome> {
        self.engine
            .booking(id)
            .await
            .map(Outcome::Booking)
            .ok_or_else(|| AppError::NotFound(format!("booking {id}")))
    }

    /// Owner, reviewer or admin.
    async fn authorize_owner(&self, claims: &Claims, booking_id: Ulid) -> AppResult<()> {
        let booking = self
            .engine
            .booking(booking_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))?;
        if booking.account_id == claims.id || claims.is_admin || claims.has_permission(PERM_BOOKING_REVIEW) {
            Ok(())
        } else {
            Err(AppError::Forbidden("only the booking owner may change this booking".into()))
        }
    }

    async fn urge(&self, booking_id: Ulid) -> AppResult<Outcome> {
        let booking = self
            .engine
            .booking(booking_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id}")))?;

        let key = format!("urge_{booking_id}");
        if self.throttle.try_fire(&key, self.urge_window_secs).await? == Decision::Suppressed {
            return Err(AppError::Throttled(URGE_SUPPRESSED_MESSAGE.into()));
        }

        match self.send_urge(&booking).await {
            Ok(()) => Ok(Outcome::Message {
                status: "sent",
                message: format!("reminder sent for booking {booking_id}"),
            }),
            Err(e) => {
                if let Err(release) = self.throttle.release(&key).await {
                    warn!("could not release {key}: {release}");
                }
                Err(e)
            }
        }
    }

    async fn send_urge(&self, booking: &BookingInfo) -> AppResult<()> {
        let to = self.admin_email().await?;
        let mail = Mail {
            to,
            subject: "Booking awaiting approval".into(),
            body: format!(
                "{} is waiting for approval of booking {} in {} from {} to {}.",
                booking.username, booking.id, booking.room_name, booking.start, booking.end
            ),
        };
        self.mailer.send(mail).await?;
        info!("urge sent for booking {}", booking.id);
        Ok(())
    }

    async fn admin_email(&self) -> AppResult<String> {
        if let Some(email) = self.kv.get(ADMIN_EMAIL_KEY).await? {
            return Ok(email);
        }
        let email = self
            .engine
            .admin_email()
            .ok_or_else(|| AppError::NotFound("no administrator account".into()))?;
        self.kv.set(ADMIN_EMAIL_KEY, &email, None).await?;
        Ok(email)
    }
}
