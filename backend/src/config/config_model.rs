use lms::domain::value_objects::plans::PlanPrices;

#[derive(Debug, Clone)]
pub struct DotEnvyConfig {
    pub backend_server: BackendServer,
    pub database: Database,
    pub stripe: Stripe,
    pub plans: PlanPrices,
    pub billing: Billing,
    pub auth: Auth,
}

#[derive(Debug, Clone)]
pub struct BackendServer {
    pub port: u16,
    pub body_limit: u64,
    pub timeout: u64,
}

#[derive(Debug, Clone)]
pub struct Database {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct Stripe {
    pub secret_key: String,
    pub webhook_secret: String,
    pub webhook_tolerance_secs: i64,
}

#[derive(Debug, Clone)]
pub struct Billing {
    /// Age after which a `pending` episode with no remote subscription is
    /// treated as abandoned and no longer blocks a new attempt.
    pub pending_episode_grace_secs: i64,
}

#[derive(Debug, Clone)]
pub struct Auth {
    pub jwt_secret: String,
}
