use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Active,
    Cancelled,
    Absent,
}

/// Provenance of an entitlement record.
///
/// `Optimistic` records are written locally before the backend confirms;
/// `Confirmed` records come out of reconciliation and are authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Optimistic,
    Confirmed,
}

/// Whether a user holds access to a paid resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementRecord {
    pub resource_id: String,
    pub user_id: String,
    pub status: EntitlementStatus,
    pub source: RecordSource,
}

impl EntitlementRecord {
    /// An active entitlement written ahead of backend confirmation.
    pub fn optimistic(resource_id: &str, user_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            status: EntitlementStatus::Active,
            source: RecordSource::Optimistic,
        }
    }

    pub fn confirmed(resource_id: &str, user_id: &str, status: EntitlementStatus) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            status,
            source: RecordSource::Confirmed,
        }
    }

    /// Whether `incoming` may replace this record. A confirmed record is
    /// never downgraded by an optimistic write.
    pub fn superseded_by(&self, incoming: &EntitlementRecord) -> bool {
        !(self.source == RecordSource::Confirmed && incoming.source == RecordSource::Optimistic)
    }
}

/// Result of one registration attempt, possibly after reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentOutcome {
    Pending,
    Confirmed,
    Failed,
    /// The write was ambiguous and the reconciliation read failed too; the
    /// true outcome is not knowable right now.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationIntent {
    pub resource_id: String,
    pub user_id: String,
    pub payment_reference: Option<String>,
    pub outcome: IntentOutcome,
}

impl RegistrationIntent {
    pub fn new(resource_id: &str, user_id: &str, payment_reference: Option<&str>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            user_id: user_id.to_string(),
            payment_reference: payment_reference.map(str::to_string),
            outcome: IntentOutcome::Pending,
        }
    }
}

/// One entry in the backend's authoritative listing of a user's resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStanding {
    pub resource_id: String,
    pub status: ResourceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Active,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_supersedes_optimistic() {
        let optimistic = EntitlementRecord::optimistic("res-1", "user-1");
        let confirmed =
            EntitlementRecord::confirmed("res-1", "user-1", EntitlementStatus::Active);

        assert!(optimistic.superseded_by(&confirmed));
        assert!(!confirmed.superseded_by(&optimistic));
    }

    #[test]
    fn test_confirmed_replaces_confirmed() {
        let active = EntitlementRecord::confirmed("res-1", "user-1", EntitlementStatus::Active);
        let absent = EntitlementRecord::confirmed("res-1", "user-1", EntitlementStatus::Absent);
        assert!(active.superseded_by(&absent));
    }

    #[test]
    fn test_optimistic_replaces_optimistic() {
        let a = EntitlementRecord::optimistic("res-1", "user-1");
        let b = EntitlementRecord::optimistic("res-1", "user-1");
        assert!(a.superseded_by(&b));
    }
}
