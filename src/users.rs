use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::{debug, info};
use mongodb::bson::{doc, to_bson, Document};
use regex::escape;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::{
    user::{Availability, PortfolioItem, PublicProfile, Role, User},
    PageQuery,
};

#[derive(Debug, Deserialize, Default)]
pub struct UpdateProfileRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub phone: Option<String>,
    // freelancer
    pub title: Option<String>,
    pub hourly_rate: Option<i64>,
    pub skills: Option<Vec<String>>,
    pub portfolio: Option<Vec<PortfolioItem>>,
    pub availability: Option<Availability>,
    // client
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub website: Option<String>,
    // connected payout account
    pub stripe_account_id: Option<String>,
}

impl UpdateProfileRequest {
    /// Builds the `$set` document for the caller's role. Fields belonging to
    /// another role are rejected rather than silently dropped.
    pub fn to_set_doc(&self, role: Role) -> AppResult<Document> {
        let mut set = Document::new();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                set.insert(key, v.trim());
            }
        };
        put("profile.first_name", &self.first_name);
        put("profile.last_name", &self.last_name);
        put("profile.avatar", &self.avatar);
        put("profile.bio", &self.bio);
        put("profile.location", &self.location);
        put("profile.phone", &self.phone);

        let freelancer_fields = self.title.is_some()
            || self.hourly_rate.is_some()
            || self.skills.is_some()
            || self.portfolio.is_some()
            || self.availability.is_some()
            || self.stripe_account_id.is_some();
        let client_fields =
            self.company_name.is_some() || self.industry.is_some() || self.website.is_some();

        if freelancer_fields && role != Role::Freelancer {
            return Err(AppError::bad_request("Freelancer profile fields require a freelancer account"));
        }
        if client_fields && role != Role::Client {
            return Err(AppError::bad_request("Client profile fields require a client account"));
        }

        if let Some(title) = &self.title {
            set.insert("freelancer_profile.title", title.trim());
        }
        if let Some(rate) = self.hourly_rate {
            if rate <= 0 {
                return Err(AppError::bad_request("Hourly rate must be greater than zero"));
            }
            set.insert("freelancer_profile.hourly_rate", rate);
        }
        if let Some(skills) = &self.skills {
            set.insert("freelancer_profile.skills", normalize_skills(skills));
        }
        if let Some(portfolio) = &self.portfolio {
            set.insert("freelancer_profile.portfolio", to_bson(portfolio)?);
        }
        if let Some(availability) = &self.availability {
            set.insert("freelancer_profile.availability", to_bson(availability)?);
        }
        if let Some(account) = &self.stripe_account_id {
            set.insert("stripe_account_id", account.trim());
        }
        if let Some(company) = &self.company_name {
            set.insert("client_profile.company_name", company.trim());
        }
        if let Some(industry) = &self.industry {
            set.insert("client_profile.industry", industry.trim());
        }
        if let Some(website) = &self.website {
            set.insert("client_profile.website", website.trim());
        }

        if set.is_empty() {
            return Err(AppError::bad_request("No fields to update"));
        }
        set.insert("updated_at", bson::DateTime::from_chrono(Utc::now()));
        Ok(set)
    }
}

/// Trimmed, lowercased, deduplicated, order preserved.
pub fn normalize_skills(skills: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(skills.len());
    for s in skills {
        let s = s.trim().to_lowercase();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

pub async fn find_user(data: &AppState, user_id: &str) -> AppResult<User> {
    data.mongodb
        .users()
        .find_one(doc! { "_id": user_id })
        .await?
        .ok_or_else(|| AppError::not_found("User"))
}

/// GET /api/v1/users/me
pub async fn get_me(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(find_user(&data, &auth.id).await?.public()))
}

/// PUT /api/v1/users/me/profile
pub async fn update_profile(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<UpdateProfileRequest>,
) -> AppResult<HttpResponse> {
    debug!("update_profile for {}: {:?}", auth.id, info);
    let set = info.to_set_doc(auth.role)?;
    data.mongodb
        .users()
        .update_one(doc! { "_id": &auth.id }, doc! { "$set": set })
        .await?;
    info!("Profile updated for {}", auth.id);
    Ok(HttpResponse::Ok().json(find_user(&data, &auth.id).await?.public()))
}

#[derive(Debug, Deserialize)]
pub struct OnboardingRequest {
    pub step: u32,
    #[serde(default)]
    pub completed: bool,
    pub skipped_step: Option<u32>,
}

/// PUT /api/v1/users/me/onboarding
pub async fn update_onboarding(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<OnboardingRequest>,
) -> AppResult<HttpResponse> {
    let mut update = doc! {
        "$set": {
            "onboarding.step": info.step,
            "onboarding.completed": info.completed,
            "updated_at": bson::DateTime::from_chrono(Utc::now()),
        }
    };
    if let Some(skipped) = info.skipped_step {
        update.insert("$addToSet", doc! { "onboarding.skipped_steps": skipped });
    }
    data.mongodb
        .users()
        .update_one(doc! { "_id": &auth.id }, update)
        .await?;
    let user = find_user(&data, &auth.id).await?;
    Ok(HttpResponse::Ok().json(user.onboarding))
}

/// GET /api/v1/users/slug/{slug}
/// Records the caller as a viewer when they look at someone else's profile.
pub async fn get_by_slug(
    data: web::Data<AppState>,
    viewer: Option<AuthUser>,
    slug: web::Path<String>,
) -> AppResult<HttpResponse> {
    let users = data.mongodb.users();
    let user = users
        .find_one(doc! { "profile_slug": slug.as_str(), "account_status": "active" })
        .await?
        .ok_or_else(|| AppError::not_found("Profile"))?;

    if let Some(viewer) = viewer.filter(|v| v.id != user.id) {
        users
            .update_one(
                doc! { "_id": &user.id },
                doc! { "$push": { "profile_viewers": {
                    "$each": [{
                        "viewer_id": &viewer.id,
                        "viewed_at": bson::DateTime::from_chrono(Utc::now()),
                    }],
                    "$slice": -(User::MAX_PROFILE_VIEWERS as i64),
                } } },
            )
            .await?;
    }

    Ok(HttpResponse::Ok().json(PublicProfile::from(user)))
}

/// GET /api/v1/users/{id}
pub async fn get_user_by_id(
    data: web::Data<AppState>,
    _auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let user = find_user(&data, &id).await?;
    Ok(HttpResponse::Ok().json(PublicProfile::from(user)))
}

#[derive(Debug, Deserialize)]
pub struct FreelancerSearch {
    pub skill: Option<String>,
    pub q: Option<String>,
}

/// GET /api/v1/users/freelancers
pub async fn search_freelancers(
    data: web::Data<AppState>,
    query: web::Query<FreelancerSearch>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let mut filter = doc! {
        "role": Role::Freelancer.as_str(),
        "account_status": "active",
    };
    if let Some(skill) = query.skill.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        filter.insert("freelancer_profile.skills", skill.to_lowercase());
    }
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = escape(q);
        filter.insert(
            "$or",
            vec![
                doc! { "profile.first_name": { "$regex": &pattern, "$options": "i" } },
                doc! { "profile.last_name": { "$regex": &pattern, "$options": "i" } },
                doc! { "freelancer_profile.title": { "$regex": &pattern, "$options": "i" } },
            ],
        );
    }

    let users: Vec<User> = data
        .mongodb
        .users()
        .find(filter)
        .sort(doc! { "rating.average": -1, "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    let profiles: Vec<PublicProfile> = users.into_iter().map(PublicProfile::from).collect();
    Ok(HttpResponse::Ok().json(profiles))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skills_are_normalized() {
        let skills = vec![" Rust ".to_string(), "rust".into(), "".into(), "Actix".into()];
        assert_eq!(normalize_skills(&skills), vec!["rust", "actix"]);
    }

    #[test]
    fn profile_update_respects_role() {
        let req = UpdateProfileRequest {
            bio: Some(" Builder ".into()),
            hourly_rate: Some(5_000),
            ..Default::default()
        };
        let set = req.to_set_doc(Role::Freelancer).unwrap();
        assert_eq!(set.get_str("profile.bio").unwrap(), "Builder");
        assert_eq!(set.get_i64("freelancer_profile.hourly_rate").unwrap(), 5_000);
        assert!(set.contains_key("updated_at"));

        assert!(req.to_set_doc(Role::Client).is_err());

        let client = UpdateProfileRequest { company_name: Some("Acme".into()), ..Default::default() };
        assert!(client.to_set_doc(Role::Client).is_ok());
        assert!(client.to_set_doc(Role::Freelancer).is_err());
    }

    #[test]
    fn empty_or_invalid_updates_rejected() {
        assert!(UpdateProfileRequest::default().to_set_doc(Role::Client).is_err());
        let bad_rate = UpdateProfileRequest { hourly_rate: Some(0), ..Default::default() };
        assert!(bad_rate.to_set_doc(Role::Freelancer).is_err());
    }
}
