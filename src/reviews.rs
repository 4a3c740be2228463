use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::contracts::find_contract;
use crate::error::{is_duplicate_key, AppError, AppResult};
use crate::models::{
    contract::ContractStatus,
    new_id,
    notification::NotificationKind,
    review::{aggregate_rating, validate_rating, Review},
    PageQuery,
};
use crate::notifications::{notify_quietly, NewNotification};

const MAX_COMMENT_LEN: usize = 2_000;

#[derive(Debug, Deserialize)]
pub struct CreateReviewRequest {
    pub rating: u8,
    pub comment: Option<String>,
}

impl CreateReviewRequest {
    pub fn validate(&self) -> AppResult<()> {
        validate_rating(self.rating)?;
        if self.comment.as_ref().is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
            return Err(AppError::bad_request(format!(
                "Comment cannot exceed {MAX_COMMENT_LEN} characters"
            )));
        }
        Ok(())
    }
}

/// Recomputes the stored rating of `user_id` from all reviews about them.
async fn refresh_rating(data: &AppState, user_id: &str) -> AppResult<()> {
    let reviews: Vec<Review> = data
        .mongodb
        .reviews()
        .find(doc! { "reviewee_id": user_id })
        .await?
        .try_collect()
        .await?;
    let ratings: Vec<u8> = reviews.iter().map(|r| r.rating).collect();
    let rating = aggregate_rating(&ratings);
    data.mongodb
        .users()
        .update_one(
            doc! { "_id": user_id },
            doc! { "$set": { "rating": bson::to_bson(&rating)? } },
        )
        .await?;
    Ok(())
}

/// POST /api/v1/contracts/{id}/reviews
pub async fn create_review(
    data: web::Data<AppState>,
    auth: AuthUser,
    contract_id: web::Path<String>,
    info: web::Json<CreateReviewRequest>,
) -> AppResult<HttpResponse> {
    info.validate()?;
    let contract = find_contract(&data, &contract_id).await?;
    let reviewee_id = contract
        .counterparty(&auth.id)
        .ok_or_else(|| AppError::forbidden("You are not a party to this contract"))?
        .to_string();
    if contract.status != ContractStatus::Completed {
        return Err(AppError::bad_request("Only completed contracts can be reviewed"));
    }

    let reviews = data.mongodb.reviews();
    let already = reviews
        .count_documents(doc! { "contract_id": &contract.id, "reviewer_id": &auth.id })
        .await?;
    if already > 0 {
        return Err(AppError::conflict("You have already reviewed this contract"));
    }

    let info = info.into_inner();
    let review = Review {
        id: new_id(),
        contract_id: contract.id.clone(),
        reviewer_id: auth.id.clone(),
        reviewee_id: reviewee_id.clone(),
        rating: info.rating,
        comment: info.comment.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
        created_at: Utc::now(),
    };
    if let Err(e) = reviews.insert_one(&review).await {
        if is_duplicate_key(&e) {
            return Err(AppError::conflict("You have already reviewed this contract"));
        }
        return Err(e.into());
    }
    refresh_rating(&data, &reviewee_id).await?;
    info!("Review {} left by {} for {}", review.id, auth.id, reviewee_id);

    notify_quietly(
        &data,
        NewNotification {
            user_id: &reviewee_id,
            kind: NotificationKind::Review,
            title: "New review",
            message: format!("You received a {}-star review for \"{}\"", review.rating, contract.title),
            link: Some(format!("/contracts/{}", contract.id)),
        },
    )
    .await;
    Ok(HttpResponse::Created().json(review))
}

/// GET /api/v1/users/{id}/reviews
pub async fn user_reviews(
    data: web::Data<AppState>,
    user_id: web::Path<String>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let reviews: Vec<Review> = data
        .mongodb
        .reviews()
        .find(doc! { "reviewee_id": user_id.as_str() })
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(reviews))
}
