use crate::models::{ApprovalStatus, User};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const DEFAULT_PER_PAGE: usize = 10;
pub const MAX_PER_PAGE: usize = 100;

const CSV_HEADER: [&str; 9] = [
    "id",
    "email",
    "full_name",
    "organization_name",
    "role_job_title",
    "approval_status",
    "approved_at",
    "created_at",
    "last_login_at",
];

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Email,
    FullName,
    OrganizationName,
    ApprovalStatus,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Query string of the members table and its CSV export.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct UserTableQuery {
    pub search: Option<String>,
    pub status: Option<ApprovalStatus>,
    pub sort_by: Option<SortKey>,
    pub order: Option<SortOrder>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Serialize, Debug, Clone)]
pub struct UserPage {
    pub items: Vec<User>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

fn text_key(value: &Option<String>) -> String {
    value.as_deref().unwrap_or_default().to_lowercase()
}

impl UserTableQuery {
    fn matches(&self, user: &User) -> bool {
        if let Some(status) = self.status {
            if user.approval_status != status {
                return false;
            }
        }

        match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(needle) => {
                let needle = needle.to_lowercase();
                user.email.to_lowercase().contains(&needle)
                    || text_key(&user.full_name).contains(&needle)
                    || text_key(&user.organization_name).contains(&needle)
            }
            None => true,
        }
    }

    fn compare(&self, a: &User, b: &User) -> Ordering {
        let ordering = match self.sort_by.unwrap_or_default() {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::Email => a.email.cmp(&b.email),
            SortKey::FullName => text_key(&a.full_name).cmp(&text_key(&b.full_name)),
            SortKey::OrganizationName => text_key(&a.organization_name).cmp(&text_key(&b.organization_name)),
            SortKey::ApprovalStatus => a.approval_status.as_str().cmp(b.approval_status.as_str()),
        }
        .then_with(|| a.id.cmp(&b.id));

        match self.order.unwrap_or_default() {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }

    /// Filtered and sorted, without paging.
    pub fn select(&self, users: Vec<User>) -> Vec<User> {
        let mut selected: Vec<User> = users.into_iter().filter(|u| self.matches(u)).collect();
        selected.sort_by(|a, b| self.compare(a, b));
        selected
    }

    pub fn page(&self, users: Vec<User>) -> UserPage {
        let per_page = self.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
        let page = self.page.unwrap_or(1).max(1);

        let selected = self.select(users);
        let total = selected.len();
        let items = selected
            .into_iter()
            .skip(page.saturating_sub(1).saturating_mul(per_page))
            .take(per_page)
            .collect();

        UserPage {
            items,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }
}

// Cells a spreadsheet would evaluate as a formula get a leading apostrophe.
fn csv_field(value: &str) -> String {
    let value = if value.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        format!("'{}", value)
    } else {
        value.to_string()
    };
    if value.contains([',', '"', '\n', '\r', '\'']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}

pub fn users_to_csv(users: &[User]) -> String {
    let mut out = CSV_HEADER.join(",");
    out.push_str("\r\n");

    for user in users {
        let row = [
            user.id.to_string(),
            user.email.clone(),
            user.full_name.clone().unwrap_or_default(),
            user.organization_name.clone().unwrap_or_default(),
            user.role_job_title.clone().unwrap_or_default(),
            user.approval_status.to_string(),
            user.approved_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            user.created_at.to_rfc3339(),
            user.last_login_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ];
        let fields: Vec<String> = row.iter().map(|v| csv_field(v)).collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn user(email: &str, name: &str, org: &str, status: ApprovalStatus, age_days: i64) -> User {
        let created = Utc::now() - Duration::days(age_days);
        User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: String::new(),
            full_name: Some(name.to_string()),
            organization_name: Some(org.to_string()),
            role_job_title: None,
            role: Role::User,
            is_approved: Some(status == ApprovalStatus::Approved),
            approval_status: status,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            created_at: created,
            updated_at: created,
            last_login_at: None,
            is_first_time: false,
        }
    }

    fn members() -> Vec<User> {
        vec![
            user("carol@example.org", "Carol", "Delta Ltd", ApprovalStatus::Pending, 1),
            user("alice@example.org", "Alice", "Acme", ApprovalStatus::Approved, 3),
            user("bob@example.org", "Bob", "Acme", ApprovalStatus::Rejected, 2),
        ]
    }

    #[test]
    fn newest_first_by_default() {
        let page = UserTableQuery::default().page(members());
        let emails: Vec<&str> = page.items.iter().map(|u| u.email.as_str()).collect();
        assert_eq!(emails, vec!["carol@example.org", "bob@example.org", "alice@example.org"]);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn search_covers_name_email_and_organization() {
        let query = UserTableQuery {
            search: Some("ACME".to_string()),
            sort_by: Some(SortKey::Email),
            order: Some(SortOrder::Asc),
            ..Default::default()
        };
        let emails: Vec<String> = query.select(members()).into_iter().map(|u| u.email).collect();
        assert_eq!(emails, vec!["alice@example.org", "bob@example.org"]);
    }

    #[test]
    fn status_filter_and_paging() {
        let query = UserTableQuery {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        };
        assert_eq!(query.page(members()).total, 1);

        let paged = UserTableQuery {
            per_page: Some(2),
            page: Some(2),
            ..Default::default()
        }
        .page(members());
        assert_eq!(paged.items.len(), 1);
        assert_eq!(paged.total_pages, 2);
    }

    #[test]
    fn huge_page_number_is_just_empty() {
        let page = UserTableQuery {
            page: Some(usize::MAX),
            ..Default::default()
        }
        .page(members());
        assert!(page.items.is_empty());
        assert_eq!(page.total, 3);
        assert_eq!(page.page, usize::MAX);
    }

    #[test]
    fn query_string_parses() {
        let query: UserTableQuery =
            parse_query("search=ann&status=rejected&sort_by=full_name&order=asc&page=2&per_page=500");
        assert_eq!(query.status, Some(ApprovalStatus::Rejected));
        assert_eq!(query.sort_by, Some(SortKey::FullName));
        assert_eq!(query.order, Some(SortOrder::Asc));
        assert_eq!(query.page(Vec::new()).per_page, MAX_PER_PAGE);
    }

    fn parse_query(qs: &str) -> UserTableQuery {
        actix_web::web::Query::<UserTableQuery>::from_query(qs)
            .unwrap()
            .into_inner()
    }

    #[test]
    fn csv_quotes_awkward_values() {
        let mut tricky = user("q@example.org", "Doe, \"JD\"", "Line\nBreak", ApprovalStatus::Pending, 0);
        tricky.role_job_title = Some("Chair".to_string());
        let csv = users_to_csv(&[tricky]);
        let mut lines = csv.split("\r\n");
        assert_eq!(lines.next().unwrap(), CSV_HEADER.join(","));
        let row = lines.next().unwrap();
        assert!(row.contains("\"Doe, \"\"JD\"\"\""));
        assert!(row.contains("\"Line\nBreak\""));
        assert!(row.contains(",Chair,pending,"));
    }

    #[test]
    fn csv_neutralizes_formula_cells() {
        let sneaky = user("f@example.org", "=HYPERLINK(\"http://x\")", "@SUM(A1)", ApprovalStatus::Pending, 0);
        let mut plus = user("p@example.org", "+1 555", "-Acme", ApprovalStatus::Pending, 0);
        plus.role_job_title = Some("Chair".to_string());
        let csv = users_to_csv(&[sneaky, plus]);
        let rows: Vec<&str> = csv.split("\r\n").collect();

        assert!(rows[1].contains(",\"'=HYPERLINK(\"\"http://x\"\")\","));
        assert!(rows[1].contains(",\"'@SUM(A1)\","));
        assert!(rows[2].contains(",\"'+1 555\",\"'-Acme\",Chair,"));
    }
}
