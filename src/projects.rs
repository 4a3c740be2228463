use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::{debug, info};
use mongodb::bson::{doc, to_bson, Document};
use regex::escape;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::models::{
    new_id,
    project::{Budget, Project, ProjectStatus},
    user::Role,
    PageQuery,
};
use crate::users::normalize_skills;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub budget: Budget,
    pub deadline: Option<DateTime<Utc>>,
}

impl CreateProjectRequest {
    pub fn validate(&self, now: DateTime<Utc>) -> AppResult<()> {
        if self.title.trim().len() < 5 {
            return Err(AppError::bad_request("Title must be at least 5 characters"));
        }
        if self.description.trim().len() < 20 {
            return Err(AppError::bad_request("Description must be at least 20 characters"));
        }
        if self.category.trim().is_empty() {
            return Err(AppError::bad_request("Category is required"));
        }
        self.budget.validate()?;
        if self.deadline.is_some_and(|d| d <= now) {
            return Err(AppError::bad_request("Deadline must be in the future"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub skills: Option<Vec<String>>,
    pub budget: Option<Budget>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
pub struct ProjectSearch {
    pub category: Option<String>,
    pub skill: Option<String>,
    pub q: Option<String>,
}

impl ProjectSearch {
    pub fn to_filter(&self) -> Document {
        let mut filter = doc! { "status": ProjectStatus::Open.as_str() };
        if let Some(category) = self.category.as_deref().filter(|c| !c.is_empty()) {
            filter.insert("category", category);
        }
        if let Some(skill) = self.skill.as_deref().filter(|s| !s.is_empty()) {
            filter.insert("skills", skill.trim().to_lowercase());
        }
        if let Some(q) = self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            filter.insert("title", doc! { "$regex": escape(q), "$options": "i" });
        }
        filter
    }
}

pub async fn find_project(data: &AppState, project_id: &str) -> AppResult<Project> {
    data.mongodb
        .projects()
        .find_one(doc! { "_id": project_id })
        .await?
        .ok_or_else(|| AppError::not_found("Project"))
}

async fn find_owned_project(data: &AppState, auth: &AuthUser, project_id: &str) -> AppResult<Project> {
    let project = find_project(data, project_id).await?;
    if project.client_id != auth.id && !auth.is_admin() {
        return Err(AppError::forbidden("Only the project owner can do this"));
    }
    Ok(project)
}

/// POST /api/v1/projects
pub async fn create_project(
    data: web::Data<AppState>,
    auth: AuthUser,
    info: web::Json<CreateProjectRequest>,
) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Client])?;
    debug!("create_project by {}: {:?}", auth.id, info);
    let now = Utc::now();
    info.validate(now)?;

    let info = info.into_inner();
    let project = Project {
        id: new_id(),
        client_id: auth.id.clone(),
        title: info.title.trim().to_string(),
        description: info.description.trim().to_string(),
        category: info.category.trim().to_string(),
        skills: normalize_skills(&info.skills),
        budget: info.budget,
        deadline: info.deadline,
        status: ProjectStatus::Open,
        proposal_count: 0,
        created_at: now,
        updated_at: now,
    };
    data.mongodb.projects().insert_one(&project).await?;
    info!("Project {} created by {}", project.id, auth.id);
    Ok(HttpResponse::Created().json(project))
}

/// GET /api/v1/projects
pub async fn list_projects(
    data: web::Data<AppState>,
    search: web::Query<ProjectSearch>,
    page: web::Query<PageQuery>,
) -> AppResult<HttpResponse> {
    let projects: Vec<Project> = data
        .mongodb
        .projects()
        .find(search.to_filter())
        .sort(doc! { "created_at": -1 })
        .skip(page.skip())
        .limit(page.limit())
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(projects))
}

/// GET /api/v1/projects/mine
pub async fn my_projects(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    auth.require_role(&[Role::Client])?;
    let projects: Vec<Project> = data
        .mongodb
        .projects()
        .find(doc! { "client_id": &auth.id })
        .sort(doc! { "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(projects))
}

/// GET /api/v1/projects/{id}
pub async fn get_project(
    data: web::Data<AppState>,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(find_project(&data, &id).await?))
}

/// PUT /api/v1/projects/{id}
/// Editable only while open or on hold.
pub async fn update_project(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<UpdateProjectRequest>,
) -> AppResult<HttpResponse> {
    let project = find_owned_project(&data, &auth, &id).await?;
    if !matches!(project.status, ProjectStatus::Open | ProjectStatus::OnHold) {
        return Err(AppError::bad_request("Only open or on-hold projects can be edited"));
    }

    let mut set = Document::new();
    if let Some(title) = &info.title {
        set.insert("title", title.trim());
    }
    if let Some(desc) = &info.description {
        set.insert("description", desc.trim());
    }
    if let Some(category) = &info.category {
        set.insert("category", category.trim());
    }
    if let Some(skills) = &info.skills {
        set.insert("skills", normalize_skills(skills));
    }
    if let Some(budget) = &info.budget {
        budget.validate()?;
        set.insert("budget", to_bson(budget)?);
    }
    if let Some(deadline) = info.deadline {
        set.insert("deadline", bson::DateTime::from_chrono(deadline));
    }
    if set.is_empty() {
        return Err(AppError::bad_request("No fields to update"));
    }
    set.insert("updated_at", bson::DateTime::from_chrono(Utc::now()));

    data.mongodb
        .projects()
        .update_one(doc! { "_id": &project.id }, doc! { "$set": set })
        .await?;
    info!("Project {} updated", project.id);
    Ok(HttpResponse::Ok().json(find_project(&data, &project.id).await?))
}

/// PATCH /api/v1/projects/{id}/status
pub async fn update_project_status(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
    info: web::Json<UpdateStatusRequest>,
) -> AppResult<HttpResponse> {
    let project = find_owned_project(&data, &auth, &id).await?;
    if !project.status.can_transition_to(info.status) {
        return Err(AppError::bad_request(format!(
            "Project cannot move from {} to {}",
            project.status.as_str(),
            info.status.as_str()
        )));
    }
    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &project.id, "status": project.status.as_str() },
            doc! { "$set": {
                "status": info.status.as_str(),
                "updated_at": bson::DateTime::from_chrono(Utc::now()),
            } },
        )
        .await?;
    info!("Project {} moved to {}", project.id, info.status.as_str());
    Ok(HttpResponse::Ok().json(find_project(&data, &project.id).await?))
}

/// DELETE /api/v1/projects/{id}
/// Projects with contracts attached are cancelled through status instead.
pub async fn delete_project(
    data: web::Data<AppState>,
    auth: AuthUser,
    id: web::Path<String>,
) -> AppResult<HttpResponse> {
    let project = find_owned_project(&data, &auth, &id).await?;
    let has_contract = data
        .mongodb
        .contracts()
        .find_one(doc! { "project_id": &project.id })
        .await?
        .is_some();
    if has_contract {
        return Err(AppError::bad_request("Projects with a contract cannot be deleted"));
    }

    data.mongodb.projects().delete_one(doc! { "_id": &project.id }).await?;
    data.mongodb
        .proposals()
        .delete_many(doc! { "project_id": &project.id })
        .await?;
    info!("Project {} deleted", project.id);
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::BudgetType;
    use chrono::Duration;

    fn request() -> CreateProjectRequest {
        CreateProjectRequest {
            title: "Build a landing page".into(),
            description: "Responsive landing page with a signup form.".into(),
            category: "web".into(),
            skills: vec!["React".into()],
            budget: Budget { budget_type: BudgetType::Fixed, min: 50_000, max: 100_000 },
            deadline: None,
        }
    }

    #[test]
    fn create_validation() {
        let now = Utc::now();
        assert!(request().validate(now).is_ok());

        let mut r = request();
        r.title = "Hi".into();
        assert!(r.validate(now).is_err());

        let mut r = request();
        r.deadline = Some(now - Duration::days(1));
        assert!(r.validate(now).is_err());

        let mut r = request();
        r.budget.min = 200_000;
        assert!(r.validate(now).is_err());
    }

    #[test]
    fn search_filter_only_lists_open_projects() {
        let search = ProjectSearch {
            category: Some("web".into()),
            skill: Some(" React ".into()),
            q: Some("landing (page)".into()),
        };
        let filter = search.to_filter();
        assert_eq!(filter.get_str("status").unwrap(), "open");
        assert_eq!(filter.get_str("category").unwrap(), "web");
        assert_eq!(filter.get_str("skills").unwrap(), "react");
        let title = filter.get_document("title").unwrap();
        assert_eq!(title.get_str("$regex").unwrap(), r"landing \(page\)");
    }
}
