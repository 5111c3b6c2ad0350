use chrono::{DateTime, Utc};

/// Overall health bucket reported by [`super::LocalStore::health`] (spec
/// §4.A).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Emergency,
}

#[derive(Debug, Clone)]
pub struct Health {
    pub state: HealthState,
    pub details: String,
    pub checked_at: DateTime<Utc>,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}
