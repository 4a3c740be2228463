use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;
use crate::error::{AppError, AppResult};
use crate::models::user::Rating;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    #[serde(rename = "_id")]
    pub id: String,
    pub contract_id: String,
    pub reviewer_id: String,
    pub reviewee_id: String,
    pub rating: u8, // 1-5
    pub comment: Option<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
}

pub fn validate_rating(rating: u8) -> AppResult<()> {
    if !(1..=5).contains(&rating) {
        return Err(AppError::bad_request("Rating must be between 1 and 5"));
    }
    Ok(())
}

/// Average rounded to one decimal place.
pub fn aggregate_rating(ratings: &[u8]) -> Rating {
    if ratings.is_empty() {
        return Rating::default();
    }
    let sum: u32 = ratings.iter().map(|r| u32::from(*r)).sum();
    let average = f64::from(sum) / ratings.len() as f64;
    Rating {
        average: (average * 10.0).round() / 10.0,
        count: ratings.len() as u32,
    }
}
