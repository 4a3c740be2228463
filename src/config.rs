use std::env;

use log::info;

#[derive(Clone, Debug)]
pub struct Config {
    pub mongo_uri: String,
    pub database_name: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub frontend_origin: String,
    pub stripe_secret_key: String,
    pub stripe_api_base: String,
    pub default_currency: String,
    pub escrow_release_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let escrow_release_interval_secs = env::var("ESCROW_RELEASE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        Self {
            mongo_uri: env::var("MONGO_URI").expect("MONGO_URI must be set"),
            database_name: var_or("DATABASE_NAME", "talenthive"),
            jwt_secret: env::var("JWT_SECRET").expect("JWT_SECRET must be set"),
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080"),
            frontend_origin: var_or("FRONTEND_ORIGIN", "http://localhost:3000"),
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .expect("STRIPE_SECRET_KEY must be set"),
            stripe_api_base: var_or("STRIPE_API_BASE", "https://api.stripe.com"),
            default_currency: var_or("DEFAULT_CURRENCY", "usd"),
            escrow_release_interval_secs,
        }
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    })
}
