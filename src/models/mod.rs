pub mod contract;
pub mod conversation;
pub mod dispute;
pub mod hire_request;
pub mod notification;
pub mod project;
pub mod proposal;
pub mod review;
pub mod settings;
pub mod support_ticket;
pub mod transaction;
pub mod user;

use serde::Deserialize;
use uuid::Uuid;

pub use bson::serde_helpers::chrono_datetime_as_bson_datetime as bson_datetime;

/// Document ids are UUID v4 strings.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// `Option<DateTime<Utc>>` stored as a BSON date so range queries work.
pub mod bson_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => bson::DateTime::from_chrono(*dt).serialize(s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(Option::<bson::DateTime>::deserialize(d)?.map(|dt| dt.to_chrono()))
    }
}

/// `?page=&limit=` query parameters shared by list endpoints.
#[derive(Debug, Deserialize, Default)]
pub struct PageQuery {
    pub page: Option<u64>,
    pub limit: Option<i64>,
}

impl PageQuery {
    pub const MAX_LIMIT: i64 = 100;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(20).clamp(1, Self::MAX_LIMIT)
    }

    pub fn skip(&self) -> u64 {
        self.page.unwrap_or(1).saturating_sub(1) * self.limit() as u64
    }
}

/// Amounts are integer minor units. Rejects zero and negatives.
pub fn ensure_positive_amount(field: &str, amount: i64) -> Result<(), crate::error::AppError> {
    if amount <= 0 {
        return Err(crate::error::AppError::bad_request(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}
