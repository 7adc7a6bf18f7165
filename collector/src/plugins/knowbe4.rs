//! KnowBe4 training enrollments
//!
//! Page-numbered API (`?page=N`) that signals the end with an empty page.
//! Each page is buffered as it arrives and the dataset is flushed once.

use super::{Record, blank, decode, lenient, store};
use crate::context::EngineContext;
use crate::error::PluginError;
use crate::fetch::{Auth, FetchRequest, Pagination};
use crate::gate::{GateDecision, Requirements};
use crate::registry::Plugin;
use crate::schema::{ColumnType, Row, Schema, Value};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://us.api.knowbe4.com/v1/training/enrollments";

pub struct KnowBe4;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Enrollment {
    pub campaign_name: Option<String>,
    pub completion_date: Option<String>,
    pub content_type: Option<String>,
    pub enrollment_date: Option<String>,
    #[serde(deserialize_with = "lenient::int")]
    pub enrollment_id: Option<i64>,
    pub module_name: Option<String>,
    #[serde(deserialize_with = "lenient::flag")]
    pub policy_acknowledged: bool,
    pub start_date: Option<String>,
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient::int")]
    pub time_spent: Option<i64>,
    pub user: Option<EnrolledUser>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EnrolledUser {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(deserialize_with = "lenient::int")]
    pub id: Option<i64>,
}

impl Record for Enrollment {
    fn schema() -> Schema {
        Schema::new("knowbe4_enrollments")
            .column("campaign_name", ColumnType::Text)
            .column("completion_date", ColumnType::Timestamp)
            .column("content_type", ColumnType::Text)
            .column("enrollment_date", ColumnType::Timestamp)
            .column("enrollment_id", ColumnType::Integer)
            .column("module_name", ColumnType::Text)
            .column("policy_acknowledged", ColumnType::Boolean)
            .column("start_date", ColumnType::Timestamp)
            .column("status", ColumnType::Text)
            .column("time_spent", ColumnType::Integer)
            .column("email", ColumnType::Text)
            .column("first_name", ColumnType::Text)
            .column("last_name", ColumnType::Text)
            .column("id", ColumnType::Integer)
    }

    fn to_row(&self) -> Row {
        let user = self.user.as_ref();
        Row::new()
            .with("campaign_name", self.campaign_name.clone())
            .with("completion_date", Value::timestamp(self.completion_date.as_deref()))
            .with("content_type", self.content_type.clone())
            .with("enrollment_date", Value::timestamp(self.enrollment_date.as_deref()))
            .with("enrollment_id", self.enrollment_id)
            .with("module_name", self.module_name.clone())
            .with("policy_acknowledged", self.policy_acknowledged)
            .with("start_date", Value::timestamp(self.start_date.as_deref()))
            .with("status", self.status.clone())
            .with("time_spent", self.time_spent)
            .with("email", user.and_then(|u| u.email.clone()))
            .with("first_name", user.and_then(|u| u.first_name.clone()))
            .with("last_name", user.and_then(|u| u.last_name.clone()))
            .with("id", user.and_then(|u| u.id))
    }
}

#[async_trait]
impl Plugin for KnowBe4 {
    fn id(&self) -> &'static str {
        "knowbe4"
    }

    async fn run(&self, ctx: &EngineContext) -> Result<(), PluginError> {
        let endpoint = ctx
            .env()
            .setting("KNOWBE4_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let requirements = Requirements::new()
            .require("KNOWBE4_TOKEN")
            .with_override("KNOWBE4_ENDPOINT", endpoint);

        let GateDecision::Open(gate) = ctx.env_check(&requirements) else {
            return blank::<Enrollment>(ctx).await;
        };

        let request = FetchRequest::new(gate.get("KNOWBE4_ENDPOINT"))
            .auth(Auth::bearer(gate.get("KNOWBE4_TOKEN")))
            .header("Accept", "application/json")
            .pagination(Pagination::page_number("page", 1));

        let mut stored = Ok(0);
        let outcome = ctx
            .fetcher()
            .fetch_each(&request, |page| {
                if let Ok(total) = &mut stored {
                    match store(ctx, &decode::<Enrollment>(page)) {
                        Ok(n) => *total += n,
                        Err(e) => stored = Err(e),
                    }
                }
            })
            .await;
        let stored = stored?;

        if let Some(e) = &outcome.error {
            warn!(plugin = "knowbe4", pages = outcome.pages, error = %e, "enrollment fetch incomplete");
        }
        info!(plugin = "knowbe4", enrollments = stored, pages = outcome.pages, "enrollments fetched");

        ctx.flush("knowbe4_enrollments").await;
        blank::<Enrollment>(ctx).await
    }
}
