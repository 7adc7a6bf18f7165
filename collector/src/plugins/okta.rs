//! Okta users and their enrolled MFA factors
//!
//! Users come from one `Link`-paginated listing. Factors need one request
//! per user, fanned out on a small worker pool and spaced by a minimum
//! interval to stay under Okta's per-endpoint rate limits. Okta announces
//! the end of a rate-limit window in `X-Rate-Limit-Reset` (epoch seconds).

use super::{Record, blank, decode, lenient, store};
use crate::context::EngineContext;
use crate::error::PluginError;
use crate::fetch::{Auth, BackoffPolicy, FetchRequest, Fetcher, Pagination};
use crate::gate::{GateDecision, Requirements};
use crate::pool::WorkerPool;
use crate::registry::Plugin;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

const RATE_LIMIT_RESET_HEADER: &str = "X-Rate-Limit-Reset";
const FACTOR_WORKERS: usize = 5;
const FACTOR_MIN_INTERVAL: Duration = Duration::from_millis(50);
const TRANSIENT_RETRIES: u32 = 3;
const PAGE_LIMIT: &str = "200";

pub struct Okta;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub id: Option<String>,
    pub status: Option<String>,
    pub created: Option<String>,
    pub activated: Option<String>,
    pub status_changed: Option<String>,
    pub last_login: Option<String>,
    pub last_updated: Option<String>,
    pub password_changed: Option<String>,
    #[serde(rename = "type")]
    pub user_type: Option<UserType>,
    pub profile: Option<UserProfile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UserType {
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserProfile {
    pub login: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub nick_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub second_email: Option<String>,
    pub profile_url: Option<String>,
    pub preferred_language: Option<String>,
    pub user_type: Option<String>,
    pub organization: Option<String>,
    pub title: Option<String>,
    pub division: Option<String>,
    pub department: Option<String>,
    pub cost_center: Option<String>,
    pub employee_number: Option<String>,
    pub mobile_phone: Option<String>,
    pub primary_phone: Option<String>,
    pub street_address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub country_code: Option<String>,
}

/// Profile fields in column order
const PROFILE_COLUMNS: [&str; 23] = [
    "profile_login",
    "profile_first_name",
    "profile_last_name",
    "profile_nick_name",
    "profile_display_name",
    "profile_email",
    "profile_secondEmail",
    "profile_url",
    "profile_preferred_language",
    "profile_user_type",
    "profile_organization",
    "profile_title",
    "profile_division",
    "profile_department",
    "profile_cost_center",
    "profile_employee_number",
    "profile_mobile_phone",
    "profile_primary_phone",
    "profile_street_address",
    "profile_city",
    "profile_state",
    "profile_zip_code",
    "profile_country_code",
];

impl UserProfile {
    fn values(&self) -> [&Option<String>; 23] {
        [
            &self.login,
            &self.first_name,
            &self.last_name,
            &self.nick_name,
            &self.display_name,
            &self.email,
            &self.second_email,
            &self.profile_url,
            &self.preferred_language,
            &self.user_type,
            &self.organization,
            &self.title,
            &self.division,
            &self.department,
            &self.cost_center,
            &self.employee_number,
            &self.mobile_phone,
            &self.primary_phone,
            &self.street_address,
            &self.city,
            &self.state,
            &self.zip_code,
            &self.country_code,
        ]
    }
}

impl Record for User {
    fn schema() -> Schema {
        let mut schema = Schema::new("okta_users")
            .column("id", ColumnType::Text)
            .column("status", ColumnType::Text)
            .column("created", ColumnType::Timestamp)
            .column("activated", ColumnType::Timestamp)
            .column("status_changed", ColumnType::Timestamp)
            .column("last_login", ColumnType::Timestamp)
            .column("last_updated", ColumnType::Timestamp)
            .column("password_changed", ColumnType::Timestamp)
            .column("type_id", ColumnType::Text);
        for name in PROFILE_COLUMNS {
            schema = schema.column(name, ColumnType::Text);
        }
        schema
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("id", self.id.clone())
            .with("status", self.status.clone())
            .with("created", Value::timestamp(self.created.as_deref()))
            .with("activated", Value::timestamp(self.activated.as_deref()))
            .with("status_changed", Value::timestamp(self.status_changed.as_deref()))
            .with("last_login", Value::timestamp(self.last_login.as_deref()))
            .with("last_updated", Value::timestamp(self.last_updated.as_deref()))
            .with("password_changed", Value::timestamp(self.password_changed.as_deref()))
            .with("type_id", self.user_type.as_ref().and_then(|t| t.id.clone()));

        let empty = UserProfile::default();
        let profile = self.profile.as_ref().unwrap_or(&empty);
        for (name, value) in PROFILE_COLUMNS.iter().zip(profile.values()) {
            row.set(*name, value.clone());
        }
        row
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Factor {
    /// Owning user, filled in after decoding
    #[serde(skip)]
    pub user_id: String,
    pub id: Option<String>,
    pub factor_type: Option<String>,
    pub provider: Option<String>,
    pub vendor_name: Option<String>,
    pub status: Option<String>,
    pub profile: Option<FactorProfile>,
    pub last_updated: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub verify: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FactorProfile {
    pub email: Option<String>,
    pub authenticator_name: Option<String>,
    pub phone_number: Option<String>,
    pub credential_id: Option<String>,
}

impl Record for Factor {
    fn schema() -> Schema {
        Schema::new("okta_factors")
            .column("userid", ColumnType::Text)
            .column("id", ColumnType::Text)
            .column("factor_type", ColumnType::Text)
            .column("provider", ColumnType::Text)
            .column("vendor_name", ColumnType::Text)
            .column("status", ColumnType::Text)
            .column("profile_email", ColumnType::Text)
            .column("profile_authenticator_name", ColumnType::Text)
            .column("profile_phone_number", ColumnType::Text)
            .column("profile_credential_id", ColumnType::Text)
            .column("last_updated", ColumnType::Timestamp)
            .column("verify", ColumnType::Text)
    }

    fn to_row(&self) -> Row {
        let profile = self.profile.as_ref();
        Row::new()
            .with("userid", self.user_id.as_str())
            .with("id", self.id.clone())
            .with("factor_type", self.factor_type.clone())
            .with("provider", self.provider.clone())
            .with("vendor_name", self.vendor_name.clone())
            .with("status", self.status.clone())
            .with("profile_email", profile.and_then(|p| p.email.clone()))
            .with(
                "profile_authenticator_name",
                profile.and_then(|p| p.authenticator_name.clone()),
            )
            .with("profile_phone_number", profile.and_then(|p| p.phone_number.clone()))
            .with("profile_credential_id", profile.and_then(|p| p.credential_id.clone()))
            .with("last_updated", Value::timestamp(self.last_updated.as_deref()))
            .with("verify", self.verify.clone())
    }
}

/// `https://` base URL for an Okta org, with or without a scheme
pub(crate) fn org_url(domain: &str) -> String {
    let domain = domain.trim().trim_end_matches('/');
    if domain.starts_with("http://") || domain.starts_with("https://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    }
}

async fn user_factors(
    fetcher: Fetcher,
    base: String,
    auth: Auth,
    user_id: String,
) -> Result<Vec<Factor>, PluginError> {
    let request = FetchRequest::new(format!("{base}/api/v1/users/{user_id}/factors")).auth(auth);
    let outcome = fetcher.fetch(&request).await;
    if let Some(e) = outcome.error {
        return Err(e.into());
    }
    let mut factors = decode::<Factor>(outcome.items);
    for factor in &mut factors {
        factor.user_id = user_id.clone();
    }
    Ok(factors)
}

#[async_trait]
impl Plugin for Okta {
    fn id(&self) -> &'static str {
        "okta"
    }

    async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError> {
        let requirements = Requirements::new().require("OKTA_DOMAIN").require("OKTA_TOKEN");
        let GateDecision::Open(gate) = ctx.env_check(&requirements) else {
            blank::<User>(ctx).await?;
            return blank::<Factor>(ctx).await;
        };

        let base = org_url(gate.get("OKTA_DOMAIN"));
        let auth = Auth::header("Authorization", format!("SSWS {}", gate.get("OKTA_TOKEN")));
        let fetcher = ctx
            .fetcher()
            .with_backoff(BackoffPolicy::retry_after(RATE_LIMIT_RESET_HEADER))
            .with_transient_retries(TRANSIENT_RETRIES);

        // users
        let request = FetchRequest::new(format!("{base}/api/v1/users"))
            .auth(auth.clone())
            .query("limit", PAGE_LIMIT)
            .pagination(Pagination::LinkHeader);
        let outcome = fetcher.fetch(&request).await;
        if let Some(e) = &outcome.error {
            warn!(plugin = "okta", error = %e, users = outcome.items.len(), "user listing incomplete");
        }
        let users = decode::<User>(outcome.items);
        let user_ids: Vec<String> = users.iter().filter_map(|u| u.id.clone()).collect();
        store(ctx, &users)?;
        ctx.flush("okta_users").await;
        blank::<User>(ctx).await?;
        info!(plugin = "okta", users = users.len(), "users extracted");

        // factors
        let fetcher = fetcher.with_min_interval(FACTOR_MIN_INTERVAL);
        let results = WorkerPool::new(FACTOR_WORKERS)
            .run(user_ids.clone(), move |user_id| {
                user_factors(fetcher.clone(), base.clone(), auth.clone(), user_id)
            })
            .await;

        let mut factors = Vec::new();
        for (user_id, result) in user_ids.iter().zip(results) {
            match result {
                Ok(found) => factors.extend(found),
                Err(e) => warn!(plugin = "okta", user = %user_id, error = %e, "factor extraction failed"),
            }
        }
        info!(plugin = "okta", factors = factors.len(), "factors extracted");
        store(ctx, &factors)?;
        ctx.flush("okta_factors").await;
        blank::<Factor>(ctx).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_row_flattens_profile() {
        let item = serde_json::json!({
            "id": "00u1",
            "status": "ACTIVE",
            "lastLogin": "2024-05-01T08:00:00.000Z",
            "type": {"id": "oty1"},
            "profile": {"login": "ann@acme.io", "secondEmail": "ann@home.io", "zipCode": "1000"}
        });
        let users = decode::<User>(vec![item]);
        let row = users[0].to_row();

        assert_eq!(row.value("type_id"), &Value::Text("oty1".into()));
        assert_eq!(row.value("profile_login"), &Value::Text("ann@acme.io".into()));
        assert_eq!(row.value("profile_secondEmail"), &Value::Text("ann@home.io".into()));
        assert_eq!(row.value("profile_zip_code"), &Value::Text("1000".into()));
        assert_eq!(row.value("profile_city"), &Value::Null);
        assert!(matches!(row.value("last_login"), Value::Timestamp(_)));
        assert_eq!(row.len(), User::schema().columns().len());
    }

    #[test]
    fn test_factor_row_carries_user_id() {
        let mut factors = decode::<Factor>(vec![serde_json::json!({
            "id": "f1",
            "factorType": "push",
            "profile": {"credentialId": "ann@acme.io"},
            "verify": {"factorResult": "WAITING"}
        })]);
        factors[0].user_id = "00u1".into();
        let row = factors[0].to_row();

        assert_eq!(row.value("userid"), &Value::Text("00u1".into()));
        assert_eq!(row.value("factor_type"), &Value::Text("push".into()));
        assert_eq!(row.value("profile_credential_id"), &Value::Text("ann@acme.io".into()));
        assert_eq!(row.value("verify"), &Value::Text(r#"{"factorResult":"WAITING"}"#.into()));
    }

    #[test]
    fn test_org_url() {
        assert_eq!(org_url("acme.okta.com"), "https://acme.okta.com");
        assert_eq!(org_url("https://acme.okta.com/"), "https://acme.okta.com");
        assert_eq!(org_url("http://127.0.0.1:8080"), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_sentinels_cover_schemas() {
        assert_eq!(User::default().to_row().len(), User::schema().columns().len());
        assert_eq!(Factor::default().to_row().len(), Factor::schema().columns().len());
    }
}
