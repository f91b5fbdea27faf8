use clap::Subcommand;
use serde_json::json;
use tees_core::abuse::AbuseKind;

use crate::util::{Target, api_request, exit_error};

#[derive(Subcommand)]
pub enum AbuseCommands {
    /// Record an abuse event against an IP (and optionally a user)
    Report {
        /// Client IP address
        #[arg(long)]
        ip: String,
        /// Authenticated user ID, if the event happened in a session
        #[arg(long)]
        user: Option<String>,
        /// login_failure, auth_failure, 4xx_error, rate_limit_exceeded or generic_abuse
        #[arg(long)]
        kind: AbuseKind,
        /// Override the server's default weight for this kind
        #[arg(long)]
        weight: Option<u64>,
    },
    /// Show the current abuse score for an IP or (IP, user)
    Score {
        #[arg(long)]
        ip: String,
        #[arg(long)]
        user: Option<String>,
    },
}

pub async fn run(target: &Target<'_>, command: AbuseCommands) -> i32 {
    if target.token.is_none() {
        exit_error(
            "abuse commands require an admin token",
            Some("Set --token or TEES_API_TOKEN to a JWT with role=admin"),
        );
    }

    match command {
        AbuseCommands::Report {
            ip,
            user,
            kind,
            weight,
        } => {
            let mut body = json!({ "ip": ip, "kind": kind });
            if let Some(user) = user {
                body["user_id"] = json!(user);
            }
            if let Some(weight) = weight {
                body["weight"] = json!(weight);
            }
            api_request(
                target,
                reqwest::Method::POST,
                "/v1/admin/abuse/events",
                Some(body),
                &[],
            )
            .await
        }
        AbuseCommands::Score { ip, user } => {
            let mut query = vec![("ip", ip)];
            if let Some(user) = user {
                query.push(("user_id", user));
            }
            api_request(
                target,
                reqwest::Method::GET,
                "/v1/admin/abuse/score",
                None,
                &query,
            )
            .await
        }
    }
}
