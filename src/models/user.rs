use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bson_datetime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Freelancer,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Freelancer => "freelancer",
            Role::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Suspended,
    Deactivated,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Profile {
    pub first_name: String,
    pub last_name: String,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioItem {
    pub title: String,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    #[default]
    Available,
    Busy,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FreelancerProfile {
    pub title: Option<String>,
    /// Cents per hour.
    pub hourly_rate: Option<i64>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub portfolio: Vec<PortfolioItem>,
    #[serde(default)]
    pub availability: Availability,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientProfile {
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminProfile {
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Rating {
    pub average: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileViewer {
    pub viewer_id: String,
    #[serde(with = "bson_datetime")]
    pub viewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Onboarding {
    pub completed: bool,
    pub step: u32,
    #[serde(default)]
    pub skipped_steps: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub password: String,
    pub role: Role,
    pub profile: Profile,
    pub freelancer_profile: Option<FreelancerProfile>,
    pub client_profile: Option<ClientProfile>,
    pub admin_profile: Option<AdminProfile>,
    #[serde(default)]
    pub rating: Rating,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub account_status: AccountStatus,
    pub profile_slug: String,
    #[serde(default)]
    pub profile_viewers: Vec<ProfileViewer>,
    #[serde(default)]
    pub onboarding: Onboarding,
    pub stripe_account_id: Option<String>,
    #[serde(with = "bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub const MAX_PROFILE_VIEWERS: usize = 50;

    /// Copy safe to send over the wire.
    pub fn public(mut self) -> Self {
        self.password.clear();
        self
    }

    pub fn can_sign_in(&self) -> bool {
        self.account_status == AccountStatus::Active
    }
}

/// What other users and anonymous visitors see of an account.
#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub id: String,
    pub role: Role,
    pub profile: Profile,
    pub freelancer_profile: Option<FreelancerProfile>,
    pub client_profile: Option<ClientProfile>,
    pub rating: Rating,
    pub profile_slug: String,
}

impl From<User> for PublicProfile {
    fn from(user: User) -> Self {
        let mut profile = user.profile;
        profile.phone = None;
        PublicProfile {
            id: user.id,
            role: user.role,
            profile,
            freelancer_profile: user.freelancer_profile,
            client_profile: user.client_profile,
            rating: user.rating,
            profile_slug: user.profile_slug,
        }
    }
}

/// Lowercase, ascii-alphanumeric runs joined by `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            slug.push(c.to_ascii_lowercase());
            pending_dash = false;
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("user");
    }
    slug
}

/// `base`, `base-2`, `base-3`, ... for the n-th collision.
pub fn slug_candidate(base: &str, attempt: u32) -> String {
    if attempt <= 1 {
        base.to_string()
    } else {
        format!("{base}-{attempt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_names() {
        assert_eq!(slugify("Jane Doe"), "jane-doe");
        assert_eq!(slugify("  O'Brien,  Pat!! "), "o-brien-pat");
        assert_eq!(slugify("Zoë 2"), "zo-2");
        assert_eq!(slugify("!!!"), "user");
    }

    #[test]
    fn slug_candidates_number_from_two() {
        assert_eq!(slug_candidate("jane-doe", 1), "jane-doe");
        assert_eq!(slug_candidate("jane-doe", 2), "jane-doe-2");
        assert_eq!(slug_candidate("jane-doe", 7), "jane-doe-7");
    }

    #[test]
    fn role_round_trips_as_snake_case() {
        let json = serde_json::to_string(&Role::Freelancer).unwrap();
        assert_eq!(json, "\"freelancer\"");
        assert_eq!(Role::Client.as_str(), "client");
    }

    #[test]
    fn public_profile_hides_account_details() {
        let now = Utc::now();
        let user = User {
            id: "u1".into(),
            email: "jane@example.com".into(),
            password: "$2b$12$hash".into(),
            role: Role::Freelancer,
            profile: Profile {
                first_name: "Jane".into(),
                last_name: "Doe".into(),
                phone: Some("+1 555 0100".into()),
                ..Default::default()
            },
            freelancer_profile: Some(FreelancerProfile::default()),
            client_profile: None,
            admin_profile: Some(AdminProfile::default()),
            rating: Rating { average: 4.5, count: 2 },
            is_verified: true,
            account_status: AccountStatus::Active,
            profile_slug: "jane-doe".into(),
            profile_viewers: vec![ProfileViewer { viewer_id: "u2".into(), viewed_at: now }],
            onboarding: Onboarding::default(),
            stripe_account_id: Some("acct_123".into()),
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(PublicProfile::from(user)).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        for hidden in [
            "email",
            "password",
            "stripe_account_id",
            "onboarding",
            "admin_profile",
            "is_verified",
            "profile_viewers",
            "account_status",
        ] {
            assert!(!keys.contains(&hidden), "{hidden} leaked");
        }
        assert_eq!(json["profile_slug"], "jane-doe");
        assert_eq!(json["profile"]["first_name"], "Jane");
        assert!(json["profile"]["phone"].is_null());
        assert_eq!(json["rating"]["count"], 2);
    }
}
