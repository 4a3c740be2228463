use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Singleton document holding marketplace-wide knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformSettings {
    #[serde(rename = "_id")]
    pub id: String,
    /// Percent of each payment kept by the platform.
    pub commission_rate: f64,
    pub escrow_hold_days: u32,
    /// Cents.
    pub min_withdrawal: i64,
    pub maintenance_mode: bool,
}

impl PlatformSettings {
    pub const ID: &'static str = "platform";
    pub const MAX_COMMISSION_RATE: f64 = 50.0;
    pub const MAX_ESCROW_HOLD_DAYS: u32 = 90;

    pub fn validate(&self) -> AppResult<()> {
        if !(0.0..=Self::MAX_COMMISSION_RATE).contains(&self.commission_rate) {
            return Err(AppError::bad_request(format!(
                "Commission rate must be between 0 and {}",
                Self::MAX_COMMISSION_RATE
            )));
        }
        if self.escrow_hold_days > Self::MAX_ESCROW_HOLD_DAYS {
            return Err(AppError::bad_request(format!(
                "Escrow hold cannot exceed {} days",
                Self::MAX_ESCROW_HOLD_DAYS
            )));
        }
        if self.min_withdrawal < 0 {
            return Err(AppError::bad_request("Minimum withdrawal cannot be negative"));
        }
        Ok(())
    }
}

impl Default for PlatformSettings {
    fn default() -> Self {
        PlatformSettings {
            id: Self::ID.to_string(),
            commission_rate: 10.0,
            escrow_hold_days: 7,
            min_withdrawal: 1_000,
            maintenance_mode: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = PlatformSettings::default();
        assert_eq!(s.id, "platform");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let s = PlatformSettings { commission_rate: 75.0, ..Default::default() };
        assert!(s.validate().is_err());

        let s = PlatformSettings { commission_rate: f64::NAN, ..Default::default() };
        assert!(s.validate().is_err());

        let s = PlatformSettings { escrow_hold_days: 120, ..Default::default() };
        assert!(s.validate().is_err());
    }
}
