//! Microsoft Entra ID (Azure AD) through Microsoft Graph
//!
//! App-only access with a client-credentials token. Graph returns lists in
//! `value` and the next page as an absolute `@odata.nextLink`.

use super::{Record, blank, decode, lenient, store};
use crate::context::EngineContext;
use crate::error::PluginError;
use crate::fetch::{Auth, FetchRequest, Fetcher, Pagination, TokenExchange};
use crate::gate::{GateDecision, Requirements};
use crate::registry::Plugin;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use chrono::{Duration as TimeDelta, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com";
/// How far back sign-ins are collected
pub const SIGNIN_LOOKBACK_DAYS: i64 = 180;

const USER_FIELDS: &str = "id,displayName,givenName,surname,userPrincipalName,mail,jobTitle,\
department,mobilePhone,businessPhones,officeLocation,preferredLanguage,accountEnabled,userType,\
createdDateTime,lastPasswordChangeDateTime";

pub struct AzureEntra;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct User {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub user_principal_name: Option<String>,
    pub mail: Option<String>,
    pub job_title: Option<String>,
    pub department: Option<String>,
    pub mobile_phone: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    pub business_phones: Option<String>,
    pub office_location: Option<String>,
    pub preferred_language: Option<String>,
    #[serde(deserialize_with = "lenient::flag")]
    pub account_enabled: bool,
    pub user_type: Option<String>,
    pub created_date_time: Option<String>,
    pub last_password_change_date_time: Option<String>,
}

impl Record for User {
    fn schema() -> Schema {
        Schema::new("azure_entra_users")
            .column("id", ColumnType::Text)
            .column("display_name", ColumnType::Text)
            .column("given_name", ColumnType::Text)
            .column("surname", ColumnType::Text)
            .column("user_principal_name", ColumnType::Text)
            .column("mail", ColumnType::Text)
            .column("job_title", ColumnType::Text)
            .column("department", ColumnType::Text)
            .column("mobile_phone", ColumnType::Text)
            .column("business_phones", ColumnType::Text)
            .column("office_location", ColumnType::Text)
            .column("preferred_language", ColumnType::Text)
            .column("account_enabled", ColumnType::Boolean)
            .column("user_type", ColumnType::Text)
            .column("created_date_time", ColumnType::Timestamp)
            .column("last_password_change_date_time", ColumnType::Timestamp)
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id.clone())
            .with("display_name", self.display_name.clone())
            .with("given_name", self.given_name.clone())
            .with("surname", self.surname.clone())
            .with("user_principal_name", self.user_principal_name.clone())
            .with("mail", self.mail.clone())
            .with("job_title", self.job_title.clone())
            .with("department", self.department.clone())
            .with("mobile_phone", self.mobile_phone.clone())
            .with("business_phones", self.business_phones.clone())
            .with("office_location", self.office_location.clone())
            .with("preferred_language", self.preferred_language.clone())
            .with("account_enabled", self.account_enabled)
            .with("user_type", self.user_type.clone())
            .with("created_date_time", Value::timestamp(self.created_date_time.as_deref()))
            .with(
                "last_password_change_date_time",
                Value::timestamp(self.last_password_change_date_time.as_deref()),
            )
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignIn {
    pub user_principal_name: Option<String>,
    pub created_date_time: Option<String>,
}

impl Record for SignIn {
    fn schema() -> Schema {
        Schema::new("azure_entra_users_signin")
            .column("user_principal_name", ColumnType::Text)
            .column("created_date_time", ColumnType::Timestamp)
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("user_principal_name", self.user_principal_name.clone())
            .with("created_date_time", Value::timestamp(self.created_date_time.as_deref()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectoryAudit {
    pub id: Option<String>,
    pub activity_display_name: Option<String>,
    pub activity_date_time: Option<String>,
    pub target_resources: Option<Vec<TargetResource>>,
    pub initiated_by: Option<InitiatedBy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetResource {
    pub user_principal_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InitiatedBy {
    pub user: Option<InitiatingUser>,
    pub app: Option<InitiatingApp>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitiatingUser {
    pub user_principal_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InitiatingApp {
    pub display_name: Option<String>,
}

impl DirectoryAudit {
    /// Initiating user's UPN, or the app's name for app-initiated changes
    fn initiator(&self) -> Option<String> {
        let by = self.initiated_by.as_ref()?;
        match &by.user {
            Some(user) => user.user_principal_name.clone(),
            None => by.app.as_ref().and_then(|a| a.display_name.clone()),
        }
    }
}

impl Record for DirectoryAudit {
    fn schema() -> Schema {
        Schema::new("azure_audit_logs")
            .column("id", ColumnType::Text)
            .column("activity_display_name", ColumnType::Text)
            .column("activity_date_time", ColumnType::Timestamp)
            .column("user_principal_name", ColumnType::Text)
            .column("initiated_by", ColumnType::Text)
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("id", self.id.clone())
            .with("activity_display_name", self.activity_display_name.clone())
            .with("activity_date_time", Value::timestamp(self.activity_date_time.as_deref()))
            .with(
                "user_principal_name",
                self.target_resources
                    .as_ref()
                    .and_then(|t| t.first())
                    .and_then(|t| t.user_principal_name.clone()),
            )
            .with("initiated_by", self.initiator())
    }
}

/// Fetch one Graph collection into its dataset, then blank it if empty
async fn collect<R: Record>(
    ctx: &EngineContext,
    fetcher: &Fetcher,
    request: FetchRequest,
) -> Result<(), PluginError> {
    let tag = R::schema().tag().to_string();
    let outcome = fetcher.fetch(&request).await;
    if let Some(e) = &outcome.error {
        warn!(plugin = "azure_entra", tag = %tag, error = %e, "graph fetch incomplete");
    }
    let records = decode::<R>(outcome.items);
    info!(plugin = "azure_entra", tag = %tag, records = records.len(), "graph collection fetched");
    store(ctx, &records)?;
    ctx.flush(&tag).await;
    blank::<R>(ctx).await
}

#[async_trait]
impl Plugin for AzureEntra {
    fn id(&self) -> &'static str {
        "azure_entra"
    }

    async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError> {
        let requirements = Requirements::new()
            .require("AZURE_TENANT_ID")
            .require("AZURE_CLIENT_ID")
            .require("AZURE_CLIENT_SECRET");
        let GateDecision::Open(gate) = ctx.env_check(&requirements) else {
            blank::<User>(ctx).await?;
            blank::<SignIn>(ctx).await?;
            return blank::<DirectoryAudit>(ctx).await;
        };

        let env = ctx.env();
        let login = env
            .setting("AZURE_LOGIN_URL")
            .unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string());
        let graph = env
            .setting("AZURE_GRAPH_URL")
            .unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string());
        let login = login.trim_end_matches('/');
        let graph = graph.trim_end_matches('/');

        let auth = Auth::ClientCredentials(TokenExchange {
            token_url: format!("{login}/{}/oauth2/v2.0/token", gate.get("AZURE_TENANT_ID")),
            client_id: gate.get("AZURE_CLIENT_ID").to_string(),
            client_secret: gate.get("AZURE_CLIENT_SECRET").to_string(),
            scope: format!("{graph}/.default"),
        });
        let graph_request = |path: &str| {
            FetchRequest::new(format!("{graph}/v1.0/{path}"))
                .auth(auth.clone())
                .items("/value")
                .pagination(Pagination::body_link("/@odata.nextLink"))
        };
        let fetcher = ctx.fetcher();

        collect::<User>(ctx, &fetcher, graph_request("users").query("$select", USER_FIELDS)).await?;

        let cutoff = (Utc::now() - TimeDelta::days(SIGNIN_LOOKBACK_DAYS))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        collect::<SignIn>(
            ctx,
            &fetcher,
            graph_request("auditLogs/signIns")
                .query("$select", "userPrincipalName,createdDateTime")
                .query("$filter", format!("createdDateTime ge {cutoff}")),
        )
        .await?;

        collect::<DirectoryAudit>(
            ctx,
            &fetcher,
            graph_request("auditLogs/directoryAudits").query(
                "$select",
                "activityDateTime,activityDisplayName,initiatedBy,targetResources",
            ),
        )
        .await
    }
}
