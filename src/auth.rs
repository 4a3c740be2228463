use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::OnceLock;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http, web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use futures::future::{ok, ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info, warn};
use mongodb::bson::doc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::error::{duplicate_key_message, AppError, AppResult};
use crate::models::{
    new_id,
    user::{
        slug_candidate, slugify, AccountStatus, ClientProfile, FreelancerProfile, Onboarding,
        Profile, Rating, Role, User,
    },
};

pub const INVALID_CREDENTIALS: &str = "Invalid email or password";
const TOKEN_TTL_HOURS: i64 = 24;
const MIN_PASSWORD_LEN: usize = 8;
const SLUG_RETRIES: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

/// Identity attached to a request by [`Authentication`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require_role(&self, allowed: &[Role]) -> AppResult<()> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(AppError::forbidden(format!(
                "This action is not available to the {} role",
                self.role.as_str()
            )))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthUser>()
                .cloned()
                .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string())),
        )
    }
}

pub fn create_jwt(user_id: &str, role: Role, secret: &str) -> AppResult<String> {
    let expiration = Utc::now() + Duration::hours(TOKEN_TTL_HOURS);
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: expiration.timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
        .map_err(|e| AppError::Internal(format!("token encoding: {e}")))
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Decodes `Authorization: Bearer <jwt>` and stores an [`AuthUser`] in the
/// request extensions. Requests without a header pass through untouched so
/// public routes keep working; handlers that need a caller take `AuthUser`.
#[derive(Clone)]
pub struct Authentication {
    secret: Rc<String>,
}

impl Authentication {
    pub fn new(secret: impl Into<String>) -> Self {
        Authentication { secret: Rc::new(secret.into()) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware { service, secret: self.secret.clone() })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: Rc<String>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let token = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());

        if let Some(token) = token {
            match validate_jwt(&token, &self.secret) {
                Ok(claims) => {
                    req.extensions_mut().insert(AuthUser { id: claims.sub, role: claims.role });
                }
                Err(e) => {
                    debug!("Rejected bearer token: {}", e);
                    let (req_parts, _payload) = req.into_parts();
                    let resp = AppError::from(e).error_response().map_into_boxed_body();
                    let srv_resp = ServiceResponse::new(req_parts, resp);
                    return Box::pin(async move { Ok(srv_resp) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
    })
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub role: Role,
    pub first_name: String,
    pub last_name: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> AppResult<()> {
        if !email_regex().is_match(self.email.trim()) {
            return Err(AppError::bad_request("Please provide a valid email"));
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AppError::bad_request(format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }
        if self.role == Role::Admin {
            return Err(AppError::forbidden("Admin accounts cannot be self-registered"));
        }
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(AppError::bad_request("First and last name are required"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Hash checked when no account matches, so unknown emails cost a bcrypt round too.
fn dummy_hash() -> Option<&'static str> {
    static DUMMY: OnceLock<Option<String>> = OnceLock::new();
    DUMMY
        .get_or_init(|| hash("talenthive-no-such-account", DEFAULT_COST).ok())
        .as_deref()
}

/// Same error for unknown email and wrong password.
pub fn check_credentials(user: Option<User>, password: &str) -> AppResult<User> {
    let Some(user) = user else {
        if let Some(dummy) = dummy_hash() {
            let _ = verify(password, dummy);
        }
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_string()));
    };
    if !verify(password, &user.password).unwrap_or(false) {
        return Err(AppError::Unauthorized(INVALID_CREDENTIALS.to_string()));
    }
    if !user.can_sign_in() {
        return Err(AppError::forbidden("This account is not active"));
    }
    Ok(user)
}

#[derive(Debug, PartialEq, Eq)]
enum TakenField {
    Email,
    Slug,
}

/// Which unique index on `users` a duplicate-key message refers to.
fn taken_field(message: &str) -> TakenField {
    if message.contains("profile_slug") {
        TakenField::Slug
    } else {
        TakenField::Email
    }
}

async fn unique_slug(data: &AppState, base: &str) -> AppResult<String> {
    let users = data.mongodb.users();
    for attempt in 1..=50 {
        let candidate = slug_candidate(base, attempt);
        if users.find_one(doc! { "profile_slug": &candidate }).await?.is_none() {
            return Ok(candidate);
        }
    }
    Ok(format!("{base}-{}", &new_id()[..8]))
}

/// POST /api/v1/auth/register
pub async fn register(
    data: web::Data<AppState>,
    info: web::Json<RegisterRequest>,
) -> AppResult<HttpResponse> {
    let info = info.into_inner();
    info.validate()?;
    let email = info.email.trim().to_lowercase();

    let users = data.mongodb.users();
    if users.find_one(doc! { "email": &email }).await?.is_some() {
        return Err(AppError::conflict("Email already registered"));
    }

    let hashed_password = hash(&info.password, DEFAULT_COST)?;
    let base_slug = slugify(&format!("{} {}", info.first_name, info.last_name));
    let profile_slug = unique_slug(&data, &base_slug).await?;
    let now = Utc::now();

    let mut new_user = User {
        id: new_id(),
        email,
        password: hashed_password,
        role: info.role,
        profile: Profile {
            first_name: info.first_name.trim().to_string(),
            last_name: info.last_name.trim().to_string(),
            ..Default::default()
        },
        freelancer_profile: (info.role == Role::Freelancer).then(FreelancerProfile::default),
        client_profile: (info.role == Role::Client).then(ClientProfile::default),
        admin_profile: None,
        rating: Rating::default(),
        is_verified: false,
        account_status: AccountStatus::Active,
        profile_slug,
        profile_viewers: Vec::new(),
        onboarding: Onboarding::default(),
        stripe_account_id: None,
        created_at: now,
        updated_at: now,
    };

    // The slug check above can race another signup with the same name.
    let mut retries = 0;
    loop {
        let Err(e) = users.insert_one(&new_user).await else {
            break;
        };
        match duplicate_key_message(&e).map(taken_field) {
            Some(TakenField::Email) => return Err(AppError::conflict("Email already registered")),
            Some(TakenField::Slug) if retries < SLUG_RETRIES => {
                retries += 1;
                new_user.profile_slug = format!("{base_slug}-{}", &new_id()[..8]);
                debug!("Profile slug taken, retrying as {}", new_user.profile_slug);
            }
            Some(TakenField::Slug) => {
                return Err(AppError::conflict("Could not reserve a profile link, please retry"))
            }
            None => return Err(e.into()),
        }
    }
    info!("Registered {} user {}", new_user.role.as_str(), new_user.id);

    let token = create_jwt(&new_user.id, new_user.role, &data.config.jwt_secret)?;
    Ok(HttpResponse::Created().json(json!({ "token": token, "user": new_user.public() })))
}

/// POST /api/v1/auth/login
pub async fn login(
    data: web::Data<AppState>,
    info: web::Json<LoginRequest>,
) -> AppResult<HttpResponse> {
    let email = info.email.trim().to_lowercase();
    let found = data.mongodb.users().find_one(doc! { "email": &email }).await?;

    let user = check_credentials(found, &info.password).inspect_err(|_| {
        warn!("Failed login attempt");
    })?;

    let token = create_jwt(&user.id, user.role, &data.config.jwt_secret)?;
    info!("User {} logged in", user.id);
    Ok(HttpResponse::Ok().json(json!({ "token": token, "user": user.public() })))
}

/// GET /api/v1/auth/me
pub async fn me(data: web::Data<AppState>, auth: AuthUser) -> AppResult<HttpResponse> {
    let user = data
        .mongodb
        .users()
        .find_one(doc! { "_id": &auth.id })
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(HttpResponse::Ok().json(user.public()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    const SECRET: &str = "test-secret";

    fn user_with_password(password: &str, status: AccountStatus) -> User {
        let now = Utc::now();
        User {
            id: "u1".into(),
            email: "jane@example.com".into(),
            password: hash(password, 4).unwrap(),
            role: Role::Client,
            profile: Profile::default(),
            freelancer_profile: None,
            client_profile: Some(ClientProfile::default()),
            admin_profile: None,
            rating: Rating::default(),
            is_verified: false,
            account_status: status,
            profile_slug: "jane".into(),
            profile_viewers: vec![],
            onboarding: Onboarding::default(),
            stripe_account_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn register_request(email: &str, password: &str, role: Role) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            password: password.into(),
            role,
            first_name: "Jane".into(),
            last_name: "Doe".into(),
        }
    }

    #[test]
    fn wrong_password_and_unknown_email_look_identical() {
        let wrong = check_credentials(Some(user_with_password("correct horse", AccountStatus::Active)), "nope")
            .unwrap_err();
        let unknown = check_credentials(None, "nope").unwrap_err();

        assert_eq!(wrong.status_code(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.status_code(), http::StatusCode::UNAUTHORIZED);
        assert_eq!(wrong.to_string(), unknown.to_string());
        assert_eq!(wrong.to_string(), INVALID_CREDENTIALS);
    }

    #[test]
    fn unknown_email_is_checked_against_a_real_hash() {
        let dummy = dummy_hash().expect("dummy hash");
        assert_eq!(verify("whatever", dummy).ok(), Some(false));

        let err = check_credentials(None, "whatever").unwrap_err();
        assert_eq!(err.to_string(), INVALID_CREDENTIALS);
    }

    #[test]
    fn duplicate_index_names_the_taken_field() {
        assert_eq!(
            taken_field("E11000 duplicate key error collection: talenthive.users index: profile_slug_1 dup key: { profile_slug: \"jane-doe\" }"),
            TakenField::Slug
        );
        assert_eq!(
            taken_field("E11000 duplicate key error collection: talenthive.users index: email_1 dup key: { email: \"jane@example.com\" }"),
            TakenField::Email
        );
    }

    #[test]
    fn correct_password_signs_in_unless_suspended() {
        let user = check_credentials(Some(user_with_password("correct horse", AccountStatus::Active)), "correct horse")
            .unwrap();
        assert_eq!(user.id, "u1");

        let err = check_credentials(
            Some(user_with_password("correct horse", AccountStatus::Suspended)),
            "correct horse",
        )
        .unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn register_validation() {
        assert!(register_request("jane@example.com", "longenough", Role::Freelancer).validate().is_ok());
        assert!(register_request("not-an-email", "longenough", Role::Client).validate().is_err());
        assert!(register_request("jane@example.com", "short", Role::Client).validate().is_err());

        let err = register_request("jane@example.com", "longenough", Role::Admin).validate().unwrap_err();
        assert_eq!(err.status_code(), http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn jwt_round_trip_keeps_role() {
        let token = create_jwt("u42", Role::Freelancer, SECRET).unwrap();
        let claims = validate_jwt(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "u42");
        assert_eq!(claims.role, Role::Freelancer);
        assert!(validate_jwt(&token, "other-secret").is_err());
    }

    async fn whoami(auth: AuthUser) -> HttpResponse {
        HttpResponse::Ok().body(format!("{}:{}", auth.id, auth.role.as_str()))
    }

    async fn admin_only(auth: AuthUser) -> AppResult<HttpResponse> {
        auth.require_role(&[Role::Admin])?;
        Ok(HttpResponse::Ok().finish())
    }

    #[actix_web::test]
    async fn middleware_and_extractor() {
        let app = actix_test::init_service(
            App::new()
                .wrap(Authentication::new(SECRET))
                .route("/whoami", web::get().to(whoami))
                .route("/admin", web::get().to(admin_only)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/whoami").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);

        let req = actix_test::TestRequest::get()
            .uri("/whoami")
            .insert_header((http::header::AUTHORIZATION, "Bearer garbage"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);

        let token = create_jwt("u7", Role::Client, SECRET).unwrap();
        let req = actix_test::TestRequest::get()
            .uri("/whoami")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {token}")))
            .to_request();
        let body = actix_test::call_and_read_body(&app, req).await;
        assert_eq!(body, web::Bytes::from_static(b"u7:client"));

        let req = actix_test::TestRequest::get()
            .uri("/admin")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {token}")))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
    }
}
