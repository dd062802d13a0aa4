//! Job query interface: filters, sort order, pagination.
//!
//! Raw request parameters ([`ListParams`]) are resolved into a validated
//! [`JobQuery`] by [`QueryService`], which is the only thing store
//! implementations ever see. Page caps come from the [`PaginationConfig`] the
//! service was built with.

use core::cmp::Ordering;
use core::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::instrument;

use corejobs_core::{DomainError, FieldError, JobId, JobRecord, JobStatus, JobType};

use crate::config::PaginationConfig;
use crate::store::{JobStore, JobStoreError};

/// Sortable columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Id,
    CreationDate,
    Status,
    JobType,
    ReferenceId,
    LastUpdatedDate,
}

impl SortField {
    pub const ALL: [SortField; 6] = [
        SortField::Id,
        SortField::CreationDate,
        SortField::Status,
        SortField::JobType,
        SortField::ReferenceId,
        SortField::LastUpdatedDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::CreationDate => "creationDate",
            SortField::Status => "status",
            SortField::JobType => "jobType",
            SortField::ReferenceId => "referenceId",
            SortField::LastUpdatedDate => "lastUpdatedDate",
        }
    }

    /// Column name in the `core_jobs` table.
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Id => "id",
            SortField::CreationDate => "created_at",
            SortField::Status => "status",
            SortField::JobType => "job_type",
            SortField::ReferenceId => "reference_id",
            SortField::LastUpdatedDate => "updated_at",
        }
    }

    /// Parse a sort field name (case-insensitive); `None` if not allow-listed.
    pub fn parse(s: &str) -> Option<Self> {
        let needle = s.trim();
        SortField::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(DomainError::validation(
                "sortDirection",
                format!("must be 'asc' or 'desc', got '{other}'"),
            )),
        }
    }
}

/// Validated filter criteria. All set fields must match (AND).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Exact match.
    pub reference_id: Option<String>,
    /// Case-insensitive substring.
    pub reference_id_contains: Option<String>,
    /// Case-insensitive substring.
    pub description_contains: Option<String>,
    /// Inclusive lower bound on `creationDate`.
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `creationDate`.
    pub created_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring over reference id or description.
    pub search: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRecord) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self.job_type.is_some_and(|t| t != job.job_type) {
            return false;
        }
        if self.reference_id.as_deref().is_some_and(|r| r != job.reference_id) {
            return false;
        }
        if let Some(needle) = &self.reference_id_contains {
            if !contains_ci(&job.reference_id, needle) {
                return false;
            }
        }
        if let Some(needle) = &self.description_contains {
            if !contains_ci(&job.description, needle) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| job.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| job.created_at > to) {
            return false;
        }
        if let Some(needle) = &self.search {
            if !contains_ci(&job.reference_id, needle) && !contains_ci(&job.description, needle) {
                return false;
            }
        }
        true
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// A fully resolved list request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQuery {
    pub filter: JobFilter,
    pub sort_by: SortField,
    pub direction: SortDirection,
    pub limit: u32,
    pub offset: u64,
}

impl Default for JobQuery {
    fn default() -> Self {
        Self {
            filter: JobFilter::default(),
            sort_by: SortField::Id,
            direction: SortDirection::Asc,
            limit: PaginationConfig::default().default_limit,
            offset: 0,
        }
    }
}

impl JobQuery {
    /// Total order used for listing: the sort field in the requested
    /// direction, then id ascending.
    pub fn compare(&self, a: &JobRecord, b: &JobRecord) -> Ordering {
        let primary = match self.sort_by {
            SortField::Id => a.id.cmp(&b.id),
            SortField::CreationDate => a.created_at.cmp(&b.created_at),
            SortField::Status => a.status.code().cmp(&b.status.code()),
            SortField::JobType => a.job_type.as_str().cmp(b.job_type.as_str()),
            SortField::ReferenceId => a.reference_id.cmp(&b.reference_id),
            SortField::LastUpdatedDate => a.updated_at.cmp(&b.updated_at),
        };
        let primary = match self.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

/// Raw list parameters as they arrive from a caller. Everything is a string
/// so that malformed values surface as validation errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub sort_by: Option<String>,
    pub sort_direction: Option<String>,
    /// `field=value` expression.
    pub filter: Option<String>,
    pub status: Option<String>,
    pub job_type: Option<String>,
    pub reference_id: Option<String>,
    pub created_from: Option<String>,
    pub created_to: Option<String>,
    pub search: Option<String>,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub limit: u32,
    pub offset: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(DomainError),
    #[error("invalid sort field '{field}' (allowed: {allowed})")]
    InvalidSortField { field: String, allowed: String },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for QueryError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => QueryError::NotFound(id),
            other => QueryError::Store(other),
        }
    }
}

/// Paginated, filtered, sorted read access to job records.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn JobStore>,
    pagination: PaginationConfig,
}

impl QueryService {
    pub fn new(store: Arc<dyn JobStore>, pagination: PaginationConfig) -> Self {
        Self { store, pagination }
    }

    pub fn pagination(&self) -> PaginationConfig {
        self.pagination
    }

    #[instrument(skip(self), err)]
    pub async fn list(&self, params: ListParams) -> Result<Page<JobRecord>, QueryError> {
        let query = self.resolve(&params)?;
        let (items, total_count) = self.store.list(&query).await?;
        Ok(Page {
            items,
            total_count,
            limit: query.limit,
            offset: query.offset,
        })
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn get(&self, id: JobId) -> Result<JobRecord, QueryError> {
        Ok(self.store.get(id).await?)
    }

    /// Validate and normalise raw parameters.
    ///
    /// Field errors are collected; an unknown sort field is reported on its own.
    pub fn resolve(&self, params: &ListParams) -> Result<JobQuery, QueryError> {
        let mut errors: Vec<FieldError> = Vec::new();

        let sort_by = match non_empty(&params.sort_by) {
            None => SortField::Id,
            Some(raw) => SortField::parse(raw).ok_or_else(|| QueryError::InvalidSortField {
                field: raw.to_string(),
                allowed: SortField::ALL
                    .iter()
                    .map(SortField::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?,
        };

        let direction = match non_empty(&params.sort_direction) {
            None => SortDirection::Asc,
            Some(raw) => raw.parse::<SortDirection>().unwrap_or_else(|e| {
                errors.extend(e.fields().iter().cloned());
                SortDirection::Asc
            }),
        };

        let limit = match non_empty(&params.limit).map(str::parse::<i64>) {
            None => self.pagination.default_limit,
            Some(Ok(n)) if n < 1 => self.pagination.default_limit,
            Some(Ok(n)) => n.min(i64::from(self.pagination.max_limit)) as u32,
            Some(Err(_)) => {
                errors.push(FieldError::new("limit", "must be an integer"));
                self.pagination.default_limit
            }
        };

        let offset = match non_empty(&params.offset).map(str::parse::<i64>) {
            None => 0,
            Some(Ok(n)) => n.max(0) as u64,
            Some(Err(_)) => {
                errors.push(FieldError::new("offset", "must be an integer"));
                0
            }
        };

        let mut filter = JobFilter {
            reference_id: non_empty(&params.reference_id).map(str::to_string),
            search: non_empty(&params.search).map(str::to_string),
            ..Default::default()
        };

        if let Some(raw) = non_empty(&params.status) {
            collect(&mut errors, raw.parse::<JobStatus>(), |s| filter.status = Some(s));
        }
        if let Some(raw) = non_empty(&params.job_type) {
            collect(&mut errors, raw.parse::<JobType>(), |t| filter.job_type = Some(t));
        }
        if let Some(raw) = non_empty(&params.created_from) {
            match parse_timestamp(raw, false) {
                Some(ts) => filter.created_from = Some(ts),
                None => errors.push(FieldError::new("createdFrom", "must be an RFC 3339 timestamp or YYYY-MM-DD")),
            }
        }
        if let Some(raw) = non_empty(&params.created_to) {
            match parse_timestamp(raw, true) {
                Some(ts) => filter.created_to = Some(ts),
                None => errors.push(FieldError::new("createdTo", "must be an RFC 3339 timestamp or YYYY-MM-DD")),
            }
        }
        if let Some(raw) = non_empty(&params.filter) {
            if let Err(e) = apply_filter_expression(&mut filter, raw) {
                errors.extend(e.fields().iter().cloned());
            }
        }

        if !errors.is_empty() {
            return Err(QueryError::Validation(DomainError::Validation(errors)));
        }

        Ok(JobQuery {
            filter,
            sort_by,
            direction,
            limit,
            offset,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn collect<T>(errors: &mut Vec<FieldError>, parsed: Result<T, DomainError>, apply: impl FnOnce(T)) {
    match parsed {
        Ok(value) => apply(value),
        Err(e) => errors.extend(e.fields().iter().cloned()),
    }
}

/// Accepts RFC 3339 or a bare date. A bare upper bound covers the whole day.
fn parse_timestamp(raw: &str, end_of_day: bool) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Some(time.and_utc())
}

/// Apply a `field=value` expression.
///
/// `referenceId` and `jobDescription` match as case-insensitive substrings;
/// `status` and `jobType` as equality.
fn apply_filter_expression(filter: &mut JobFilter, expr: &str) -> Result<(), DomainError> {
    let Some((field, value)) = expr.split_once('=') else {
        return Err(DomainError::validation("filter", "expected 'field=value'"));
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(DomainError::validation("filter", "value must not be empty"));
    }

    match field.trim().to_ascii_lowercase().as_str() {
        "referenceid" => filter.reference_id_contains = Some(value.to_string()),
        "jobdescription" | "description" => filter.description_contains = Some(value.to_string()),
        "status" => filter.status = Some(value.parse()?),
        "jobtype" => filter.job_type = Some(value.parse()?),
        other => {
            return Err(DomainError::validation(
                "filter",
                format!("unknown filter field '{other}' (allowed: referenceId, jobDescription, status, jobType)"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use corejobs_core::{JobSpec, NewJob};

    fn service() -> QueryService {
        QueryService::new(Arc::new(InMemoryJobStore::new()), PaginationConfig::default())
    }

    fn params() -> ListParams {
        ListParams::default()
    }

    #[test]
    fn defaults_and_clamping() {
        let svc = service();

        let q = svc.resolve(&params()).unwrap();
        assert_eq!((q.limit, q.offset), (100, 0));
        assert_eq!(q.sort_by, SortField::Id);
        assert_eq!(q.direction, SortDirection::Asc);

        let q = svc
            .resolve(&ListParams {
                limit: Some("0".into()),
                offset: Some("-7".into()),
                ..params()
            })
            .unwrap();
        assert_eq!((q.limit, q.offset), (100, 0));

        let q = svc
            .resolve(&ListParams {
                limit: Some("5000".into()),
                ..params()
            })
            .unwrap();
        assert_eq!(q.limit, 100);
    }

    #[test]
    fn unknown_sort_field_is_its_own_error() {
        let err = service()
            .resolve(&ListParams {
                sort_by: Some("password".into()),
                ..params()
            })
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidSortField { ref field, .. } if field == "password"));
    }

    #[test]
    fn sort_fields_are_case_insensitive() {
        let q = service()
            .resolve(&ListParams {
                sort_by: Some("CREATIONDATE".into()),
                sort_direction: Some("DESC".into()),
                ..params()
            })
            .unwrap();
        assert_eq!(q.sort_by, SortField::CreationDate);
        assert_eq!(q.direction, SortDirection::Desc);
    }

    #[test]
    fn bad_direction_and_status_are_collected() {
        let err = service()
            .resolve(&ListParams {
                sort_direction: Some("sideways".into()),
                status: Some("Running".into()),
                ..params()
            })
            .unwrap_err();
        let QueryError::Validation(e) = err else {
            panic!("expected validation error");
        };
        let fields: Vec<_> = e.fields().iter().map(|f| f.field).collect();
        assert_eq!(fields, vec!["sortDirection", "status"]);
    }

    #[test]
    fn filter_expression() {
        let svc = service();
        let q = svc
            .resolve(&ListParams {
                filter: Some("referenceId=test".into()),
                ..params()
            })
            .unwrap();
        assert_eq!(q.filter.reference_id_contains.as_deref(), Some("test"));

        let q = svc
            .resolve(&ListParams {
                filter: Some("status=3".into()),
                ..params()
            })
            .unwrap();
        assert_eq!(q.filter.status, Some(JobStatus::Completed));

        let err = svc
            .resolve(&ListParams {
                filter: Some("owner=bob".into()),
                ..params()
            })
            .unwrap_err();
        assert!(matches!(err, QueryError::Validation(_)));
    }

    #[test]
    fn date_bounds_accept_bare_dates() {
        let q = service()
            .resolve(&ListParams {
                created_from: Some("2024-01-01".into()),
                created_to: Some("2024-01-31".into()),
                ..params()
            })
            .unwrap();
        let from = q.filter.created_from.unwrap();
        let to = q.filter.created_to.unwrap();
        assert_eq!(from.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(to > from);
        assert_eq!(to.date_naive().to_string(), "2024-01-31");
    }

    #[test]
    fn filter_matches_search_over_reference_and_description() {
        let job = JobRecord::new(
            JobId::new(1),
            NewJob::new(&JobSpec::FileImport, "CJB3-20240101", "B3 import initialization").unwrap(),
            Utc::now(),
        );

        let by_ref = JobFilter {
            search: Some("cjb3".into()),
            ..Default::default()
        };
        let by_desc = JobFilter {
            search: Some("IMPORT".into()),
            ..Default::default()
        };
        let miss = JobFilter {
            search: Some("ledger".into()),
            ..Default::default()
        };
        assert!(by_ref.matches(&job));
        assert!(by_desc.matches(&job));
        assert!(!miss.matches(&job));
    }
}
