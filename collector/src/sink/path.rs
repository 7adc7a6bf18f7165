//! Export path templates
//!
//! `$YYYY`, `$MM` and `$DD` expand to the UTC date, `$UUID` to a fresh v4
//! UUID on every render, `$TAG` to the dataset tag and `$TENANCY` to the
//! tenancy. Anything else is kept literally.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    template: String,
}

impl PathTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Expand the template for one write
    pub fn render(&self, tag: &str, tenancy: &str, now: DateTime<Utc>) -> PathBuf {
        let rendered = self
            .template
            .replace("$YYYY", &now.format("%Y").to_string())
            .replace("$MM", &now.format("%m").to_string())
            .replace("$DD", &now.format("%d").to_string())
            .replace("$TAG", tag)
            .replace("$TENANCY", tenancy);

        // each $UUID occurrence gets its own value
        let mut parts = rendered.split("$UUID");
        let mut out = parts.next().unwrap_or_default().to_string();
        for part in parts {
            out.push_str(&Uuid::new_v4().to_string());
            out.push_str(part);
        }
        PathBuf::from(out)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 5, 23, 59, 0).unwrap()
    }

    #[test]
    fn test_date_tag_and_tenancy_tokens() {
        let template = PathTemplate::new("/data/$TENANCY/$YYYY/$MM/$DD/$TAG.parquet");
        assert_eq!(
            template.render("okta_users", "acme", now()),
            PathBuf::from("/data/acme/2024/07/05/okta_users.parquet")
        );
    }

    #[test]
    fn test_uuid_is_fresh_per_render() {
        let template = PathTemplate::new("/out/$TAG-$UUID.json");
        let a = template.render("t", "x", now());
        let b = template.render("t", "x", now());
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_str().unwrap();
        let uuid = name.trim_start_matches("t-").trim_end_matches(".json");
        assert!(Uuid::parse_str(uuid).is_ok());
    }

    #[test]
    fn test_template_without_tokens_is_literal() {
        let template = PathTemplate::new("/tmp/export.json");
        assert_eq!(template.render("t", "x", now()), PathBuf::from("/tmp/export.json"));
    }
}
