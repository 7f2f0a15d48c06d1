use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::driver::{self, VehicleClass};
use crate::entities::user::{self, UserRole};
use crate::error::{AppError, AppResult};
use crate::utils::jwt::create_token;
use crate::AppState;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDriverRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(alias = "vehicle_class")]
    pub vehicle_class: VehicleClass,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: UserRole,
}

pub fn hash_password(password: &str) -> AppResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

fn validate_registration(email: &str, password: &str, name: &str) -> AppResult<()> {
    if !email.contains('@') || email.trim().len() < 3 {
        return Err(AppError::InvalidInput("A valid email is required".to_string()));
    }
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::InvalidInput(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    if name.trim().is_empty() {
        return Err(AppError::InvalidInput("Name is required".to_string()));
    }
    Ok(())
}

/// Insert a user account; the email must be unused.
pub async fn create_account(
    state: &AppState,
    email: &str,
    password: &str,
    name: &str,
    role: UserRole,
) -> AppResult<user::Model> {
    let email = email.trim().to_lowercase();
    if state.repo.find_user_by_email(&email).await?.is_some() {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    let user = user::Model {
        id: Uuid::new_v4(),
        email,
        password_hash: hash_password(password)?,
        name: name.trim().to_string(),
        role,
        created_at: Utc::now().into(),
    };
    state.repo.create_user(&user).await?;
    Ok(user)
}

fn auth_response(state: &AppState, user: user::Model) -> AppResult<AuthResponse> {
    let token = create_token(
        user.id,
        &user.email,
        user.role,
        &state.config.jwt_secret,
        state.config.jwt_expiration_hours,
    )?;

    Ok(AuthResponse {
        token,
        user: UserInfo {
            id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
        },
    })
}

/// Register a new rider account
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    validate_registration(&payload.email, &payload.password, &payload.name)?;

    let user = create_account(
        &state,
        &payload.email,
        &payload.password,
        &payload.name,
        UserRole::Rider,
    )
    .await?;
    tracing::info!(user_id = %user.id, "Rider registered");

    Ok((StatusCode::CREATED, Json(auth_response(&state, user)?)))
}

/// Register a driver account together with its vehicle
pub async fn register_driver(
    State(state): State<AppState>,
    Json(payload): Json<RegisterDriverRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    validate_registration(&payload.email, &payload.password, &payload.name)?;

    let user = create_account(
        &state,
        &payload.email,
        &payload.password,
        &payload.name,
        UserRole::Driver,
    )
    .await?;
    state
        .repo
        .save_driver(&driver::Model::new(user.id, payload.vehicle_class))
        .await?;
    tracing::info!(
        user_id = %user.id,
        vehicle_class = %payload.vehicle_class,
        "Driver registered"
    );

    Ok((StatusCode::CREATED, Json(auth_response(&state, user)?)))
}

/// Login with email and password
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let email = payload.email.trim().to_lowercase();
    let user = state
        .repo
        .find_user_by_email(&email)
        .await?
        .ok_or_else(|| AppError::Authentication("Invalid email or password".to_string()))?;

    let parsed_hash = PasswordHash::new(&user.password_hash)
        .map_err(|e| AppError::Internal(format!("Failed to parse password hash: {}", e)))?;

    Argon2::default()
        .verify_password(payload.password.as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Authentication("Invalid email or password".to_string()))?;

    Ok(Json(auth_response(&state, user)?))
}
