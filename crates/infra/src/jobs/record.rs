use forgequeue_core::JobId;

/// What a driver hands back from `pop`: the stored payload plus the
/// bookkeeping needed to delete or release that exact reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    /// Payload exactly as stored.
    pub raw_payload: String,
    /// Reservations so far, including this one.
    pub attempts: u32,
    pub reserved_at: Option<i64>,
    pub available_at: Option<i64>,
    /// Backend handle for the reservation (reserved-set member, receipt handle).
    pub receipt: Option<String>,
}

impl JobRecord {
    pub fn new(
        id: impl Into<JobId>,
        queue: impl Into<String>,
        raw_payload: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            raw_payload: raw_payload.into(),
            attempts,
            reserved_at: None,
            available_at: None,
            receipt: None,
        }
    }

    pub fn with_reserved_at(mut self, at: i64) -> Self {
        self.reserved_at = Some(at);
        self
    }

    pub fn with_available_at(mut self, at: i64) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }
}
