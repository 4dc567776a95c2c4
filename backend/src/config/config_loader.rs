use anyhow::{Context, Result};
use lms::domain::value_objects::plans::PlanPrices;

use super::config_model::{Auth, BackendServer, Billing, Database, DotEnvyConfig, Stripe};

const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;
const DEFAULT_PENDING_EPISODE_GRACE_SECS: i64 = 900;
const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

pub fn load() -> Result<DotEnvyConfig> {
    dotenvy::dotenv().ok();

    let backend_server = BackendServer {
        port: required("SERVER_PORT_BACKEND")?
            .parse()
            .context("SERVER_PORT_BACKEND is invalid")?,
        body_limit: required("SERVER_BODY_LIMIT")?
            .parse()
            .context("SERVER_BODY_LIMIT is invalid")?,
        timeout: required("SERVER_TIMEOUT")?
            .parse()
            .context("SERVER_TIMEOUT is invalid")?,
    };

    let database = Database {
        url: required("DATABASE_URL")?,
        max_connections: optional_parsed(
            "DATABASE_MAX_CONNECTIONS",
            DEFAULT_DATABASE_MAX_CONNECTIONS,
        )?,
    };

    let stripe = Stripe {
        secret_key: required("STRIPE_SECRET_KEY")?,
        webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
        webhook_tolerance_secs: optional_parsed(
            "STRIPE_WEBHOOK_TOLERANCE_SECS",
            DEFAULT_WEBHOOK_TOLERANCE_SECS,
        )?,
    };

    let plans = PlanPrices {
        daily: required("DAILY_PRICE_ID")?,
        bronze: required("BRONZE_PRICE_ID")?,
        silver: required("SILVER_PRICE_ID")?,
        gold: required("GOLD_PRICE_ID")?,
    };

    let billing = Billing {
        pending_episode_grace_secs: optional_parsed(
            "PENDING_EPISODE_GRACE_SECS",
            DEFAULT_PENDING_EPISODE_GRACE_SECS,
        )?,
    };

    Ok(DotEnvyConfig {
        backend_server,
        database,
        stripe,
        plans,
        billing,
        auth: get_auth_secret()?,
    })
}

pub fn get_auth_secret() -> Result<Auth> {
    dotenvy::dotenv().ok();

    Ok(Auth {
        jwt_secret: required("JWT_SECRET")?,
    })
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("{key} is invalid"))
}

fn optional_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} is invalid")),
        _ => Ok(default),
    }
}
