use std::env;

#[derive(Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub whatsapp: Option<WhatsAppConfig>,
    pub seed_data: bool,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub username: String,
    pub password: String,
    pub server: String,
    pub port: u32,
    pub database: String,
}

#[derive(Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
}

#[derive(Clone)]
pub struct WhatsAppConfig {
    pub api_key: String,
    pub api_secret: String,
    pub from_number: String,
    pub api_url: String,
}

fn get_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database = DatabaseConfig {
            username: get_str("TABLES_USERNAME", "deskuser"),
            password: get_str("TABLES_PASSWORD", ""),
            server: get_str("TABLES_SERVER", "localhost"),
            port: env::var("TABLES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: get_str("TABLES_DATABASE", "deskserver"),
        };

        let server = ServerConfig {
            host: get_str("SERVER_HOST", "0.0.0.0"),
            port: env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5001),
        };

        let auth = AuthConfig {
            jwt_secret: get_str("JWT_SECRET", "change-me-in-production"),
            jwt_expiry_hours: 24,
        };

        // Outbound delivery is optional; without credentials the relay
        // endpoint reports transport_unavailable instead of failing startup.
        let whatsapp = match (env::var("VONAGE_API_KEY"), env::var("VONAGE_API_SECRET")) {
            (Ok(api_key), Ok(api_secret)) => Some(WhatsAppConfig {
                api_key,
                api_secret,
                from_number: get_str("VONAGE_WHATSAPP_NUMBER", ""),
                api_url: get_str("VONAGE_API_URL", "https://api.nexmo.com/v1/messages"),
            }),
            _ => None,
        };

        Self {
            server,
            database,
            auth,
            whatsapp,
            seed_data: get_str("DESKSERVER_SEED", "false") == "true",
        }
    }

    pub fn database_url(&self) -> String {
        // DATABASE_URL wins when set, matching local tooling expectations.
        if let Ok(url) = env::var("DATABASE_URL") {
            return url;
        }
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.database.username,
            self.database.password,
            self.database.server,
            self.database.port,
            self.database.database
        )
    }
}
