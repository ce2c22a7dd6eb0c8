#[derive(Clone, Debug)]
pub struct Config {
    pub port: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub cors_origins: String,
    pub environment: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: get_env("PORT", "8080"),
            database_url: get_env("DATABASE_URL", "parlor.db"),
            jwt_secret: get_env("JWT_SECRET", "dev-secret-change-in-production"),
            cors_origins: get_env("CORS_ORIGINS", "http://localhost:5173"),
            environment: get_env("ENVIRONMENT", "development"),
        }
    }
}

fn get_env(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => fallback.to_string(),
    }
}
