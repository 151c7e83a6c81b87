//! Collaborators the engine consumes but does not own: identity, roles,
//! display names and stored schedules.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use ulid::Ulid;

use crate::schedule::Schedule;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("directory backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Provider,
    Admin,
}

/// Outcome of resolving the role behind a provider record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleLookup {
    UnknownProvider,
    /// The provider exists but its user's role cannot be established.
    Unverified,
    Role(Role),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn client_exists(&self, client_id: Ulid) -> Result<bool, DirectoryError>;
    /// External contact identifier used by notification channels.
    async fn client_contact(&self, client_id: Ulid) -> Result<Option<String>, DirectoryError>;
    async fn provider_role(&self, provider_id: Ulid) -> Result<RoleLookup, DirectoryError>;
    async fn provider_name(&self, provider_id: Ulid) -> Result<Option<String>, DirectoryError>;
    async fn service_name(&self, service_id: Ulid) -> Result<Option<String>, DirectoryError>;
}

#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn provider_schedules(&self, provider_id: Ulid) -> Result<Vec<Schedule>, DirectoryError>;
    async fn schedule(&self, schedule_id: Ulid) -> Result<Option<Schedule>, DirectoryError>;
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    user_id: Ulid,
    name: String,
}

/// Map-backed directory for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    roles: DashMap<Ulid, Role>,
    clients: DashMap<Ulid, Option<String>>,
    providers: DashMap<Ulid, ProviderEntry>,
    services: DashMap<Ulid, String>,
    schedules: DashMap<Ulid, Schedule>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client, which is a user holding the client role.
    pub fn add_client(&self, client_id: Ulid, contact: Option<String>) {
        self.clients.insert(client_id, contact);
        self.set_role(client_id, Role::Client);
    }

    pub fn add_provider(&self, provider_id: Ulid, user_id: Ulid, name: impl Into<String>) {
        self.providers.insert(
            provider_id,
            ProviderEntry {
                user_id,
                name: name.into(),
            },
        );
    }

    /// A user holds exactly one role; setting one replaces the previous.
    pub fn set_role(&self, user_id: Ulid, role: Role) {
        self.roles.insert(user_id, role);
    }

    pub fn clear_role(&self, user_id: Ulid) {
        self.roles.remove(&user_id);
    }

    pub fn role(&self, user_id: Ulid) -> Option<Role> {
        self.roles.get(&user_id).map(|r| *r)
    }

    pub fn add_service(&self, service_id: Ulid, name: impl Into<String>) {
        self.services.insert(service_id, name.into());
    }

    pub fn put_schedule(&self, schedule: Schedule) {
        self.schedules.insert(schedule.id, schedule);
    }

    pub fn remove_schedule(&self, schedule_id: Ulid) -> Option<Schedule> {
        self.schedules.remove(&schedule_id).map(|(_, s)| s)
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn client_exists(&self, client_id: Ulid) -> Result<bool, DirectoryError> {
        Ok(self.clients.contains_key(&client_id))
    }

    async fn client_contact(&self, client_id: Ulid) -> Result<Option<String>, DirectoryError> {
        Ok(self.clients.get(&client_id).and_then(|c| c.clone()))
    }

    async fn provider_role(&self, provider_id: Ulid) -> Result<RoleLookup, DirectoryError> {
        let Some(user_id) = self.providers.get(&provider_id).map(|p| p.user_id) else {
            return Ok(RoleLookup::UnknownProvider);
        };
        Ok(self
            .role(user_id)
            .map_or(RoleLookup::Unverified, RoleLookup::Role))
    }

    async fn provider_name(&self, provider_id: Ulid) -> Result<Option<String>, DirectoryError> {
        Ok(self.providers.get(&provider_id).map(|p| p.name.clone()))
    }

    async fn service_name(&self, service_id: Ulid) -> Result<Option<String>, DirectoryError> {
        Ok(self.services.get(&service_id).map(|s| s.clone()))
    }
}

#[async_trait]
impl ScheduleSource for InMemoryDirectory {
    async fn provider_schedules(&self, provider_id: Ulid) -> Result<Vec<Schedule>, DirectoryError> {
        let mut out: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.provider_id == provider_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.id);
        Ok(out)
    }

    async fn schedule(&self, schedule_id: Ulid) -> Result<Option<Schedule>, DirectoryError> {
        Ok(self.schedules.get(&schedule_id).map(|s| s.clone()))
    }
}
