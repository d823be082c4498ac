//! Offset pagination for list screens.
//!
//! Raw list-query parameters are normalized into a [`PageRequest`], which is
//! encoded canonically into a cache key and resolved through the request
//! coalescer. Page metadata is derived from the fetched slice alone.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::future::Future;
use std::error::Error as StdError;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::cache::keys::{KeyBuilder, canonical_digest};
use crate::cache::{RequestCoalescer, ResolveError, ResolveOptions};

const PAGE_NAMESPACE: &str = "page";
const METRIC_LIMIT_CLAMPED: &str = "concierge_pagination_limit_clamped_total";

const DEFAULT_LIMIT: u64 = 20;
const DEFAULT_MAX_LIMIT: u64 = 100;

#[derive(Debug, Error)]
pub enum PaginationError {
    #[error("filter `{field}` cannot be encoded into a cache key: {reason}")]
    MalformedKey { field: String, reason: String },
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl PaginationError {
    fn malformed(field: &str, reason: impl Into<String>) -> Self {
        Self::MalformedKey {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    /// Parse `asc`/`desc` case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("asc") {
            Some(Self::Asc)
        } else if value.eq_ignore_ascii_case("desc") {
            Some(Self::Desc)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Static description of a paginated resource.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub name: String,
    /// Tenant the listing is scoped to, if any.
    pub tenant_id: Option<String>,
    pub default_sort_by: String,
    pub default_sort_order: SortOrder,
    /// Fields `search` is matched against. Empty means search is ignored.
    pub searchable_fields: Vec<String>,
    /// Allowed sort fields. Empty means any field is accepted.
    pub sortable_fields: Vec<String>,
    /// TTL for cached pages; the cache default applies when `None`.
    pub ttl: Option<Duration>,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, default_sort_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenant_id: None,
            default_sort_by: default_sort_by.into(),
            default_sort_order: SortOrder::Desc,
            searchable_fields: Vec::new(),
            sortable_fields: Vec::new(),
            ttl: None,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        let tenant_id = tenant_id.into();
        self.tenant_id = (!tenant_id.is_empty()).then_some(tenant_id);
        self
    }

    pub fn default_order(mut self, order: SortOrder) -> Self {
        self.default_sort_order = order;
        self
    }

    pub fn searchable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.searchable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sortable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sortable_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Prefix shared by every cached page of this resource.
    pub fn resource_prefix(&self) -> String {
        KeyBuilder::new(PAGE_NAMESPACE).segment(&self.name).prefix()
    }

    /// Prefix shared by every cached page of this resource and tenant.
    pub fn tenant_prefix(&self) -> String {
        KeyBuilder::new(PAGE_NAMESPACE)
            .segment(&self.name)
            .segment(self.tenant_id.as_deref().unwrap_or_default())
            .prefix()
    }
}

/// List-query parameters as received from a caller.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPageParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub search: Option<String>,
    pub filters: BTreeMap<String, Value>,
}

impl RawPageParams {
    pub fn page(mut self, page: i64) -> Self {
        self.page = Some(page);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort_by: impl Into<String>, sort_order: impl Into<String>) -> Self {
        self.sort_by = Some(sort_by.into());
        self.sort_order = Some(sort_order.into());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }
}

/// Normalized, immutable page request handed to fetchers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u64,
    pub limit: u64,
    pub sort_by: String,
    pub sort_order: SortOrder,
    /// Trimmed search text; empty when the resource declares no searchable
    /// fields.
    pub search: String,
    pub search_fields: Vec<String>,
    /// Equality filters on top-level fields; values are always scalars.
    pub filters: BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    page: u64,
    limit: u64,
    sort_by: &'a str,
    sort_order: SortOrder,
    search: &'a str,
    filters: &'a BTreeMap<String, Value>,
}

impl PageRequest {
    /// Zero-based offset of the first item on this page.
    pub fn offset(&self) -> u64 {
        (self.page - 1).saturating_mul(self.limit)
    }

    /// Cache key for this request against `resource`.
    ///
    /// `page:{resource}:{tenant}:{digest}`, where the digest covers every
    /// normalized field. Equal requests always produce equal keys.
    pub fn cache_key(&self, resource: &ResourceDescriptor) -> Result<String, PaginationError> {
        let material = KeyMaterial {
            page: self.page,
            limit: self.limit,
            sort_by: &self.sort_by,
            sort_order: self.sort_order,
            search: &self.search,
            filters: &self.filters,
        };
        let digest = canonical_digest(&material)
            .map_err(|err| PaginationError::malformed("*", err.to_string()))?;

        Ok(KeyBuilder::new(PAGE_NAMESPACE)
            .segment(&resource.name)
            .segment(resource.tenant_id.as_deref().unwrap_or_default())
            .segment(digest)
            .build())
    }

    /// Case-insensitive substring match of `search` against any search field.
    pub fn matches_search(&self, item: &Value) -> bool {
        if self.search.is_empty() || self.search_fields.is_empty() {
            return true;
        }
        let needle = self.search.to_lowercase();
        self.search_fields.iter().any(|field| {
            item.get(field)
                .and_then(scalar_text)
                .is_some_and(|text| text.to_lowercase().contains(&needle))
        })
    }

    /// Equality match of every filter against top-level fields of `item`.
    pub fn matches_filters(&self, item: &Value) -> bool {
        self.filters
            .iter()
            .all(|(field, expected)| item.get(field).is_some_and(|actual| actual == expected))
    }

    /// Filter, search, sort and slice an in-memory collection.
    pub fn apply(&self, items: &[Value]) -> PageSlice<Value> {
        let mut matching: Vec<&Value> = items
            .iter()
            .filter(|item| self.matches_filters(item) && self.matches_search(item))
            .collect();

        matching.sort_by(|a, b| {
            let ordering = compare_values(a.get(&self.sort_by), b.get(&self.sort_by));
            match self.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let total = matching.len() as u64;
        let offset = usize::try_from(self.offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.limit).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        PageSlice { items, total }
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> CmpOrdering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal)
        }
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// What a fetcher returns: one page of items and the size of the full
/// matching set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSlice<T> {
    pub items: Vec<T>,
    pub total: u64,
}

impl<T> PageSlice<T> {
    pub fn new(items: Vec<T>, total: u64) -> Self {
        Self { items, total }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// A page of items plus navigation metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub page_count: u64,
    pub has_next: bool,
    pub has_prev: bool,
    /// One-based index of the first item on this page, zero when empty.
    pub first_item_index: u64,
    /// One-based index of the last item on this page, zero when empty.
    pub last_item_index: u64,
}

impl<T> PageResult<T> {
    /// Build metadata from a fetched slice. Items beyond `limit` are dropped.
    pub fn from_slice(slice: PageSlice<T>, page: u64, limit: u64) -> Self {
        let PageSlice { mut items, total } = slice;
        let limit = limit.max(1);
        let page = page.max(1);
        items.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let page_count = total.div_ceil(limit);
        let (first_item_index, last_item_index) = if items.is_empty() {
            (0, 0)
        } else {
            let first = (page - 1).saturating_mul(limit).saturating_add(1);
            let span = u64::try_from(items.len()).unwrap_or(u64::MAX) - 1;
            (first, first.saturating_add(span))
        };

        Self {
            page,
            limit,
            total,
            page_count,
            has_next: page < page_count,
            has_prev: page > 1,
            first_item_index,
            last_item_index,
            items,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub default_limit: u64,
    pub max_limit: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

impl From<&crate::config::PaginationSettings> for PaginationConfig {
    fn from(settings: &crate::config::PaginationSettings) -> Self {
        Self {
            default_limit: u64::from(settings.default_limit.get()),
            max_limit: u64::from(settings.max_limit.get()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginationStats {
    pub requests: u64,
    pub limit_clamped: u64,
    pub default_limit: u64,
    pub max_limit: u64,
}

pub struct PaginationEngine {
    config: PaginationConfig,
    coalescer: Arc<RequestCoalescer>,
    requests: AtomicU64,
    limit_clamped: AtomicU64,
}

impl PaginationEngine {
    pub fn new(config: PaginationConfig, coalescer: Arc<RequestCoalescer>) -> Self {
        Self {
            config,
            coalescer,
            requests: AtomicU64::new(0),
            limit_clamped: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &PaginationConfig {
        &self.config
    }

    /// Normalize `raw` for `resource`.
    ///
    /// Out-of-range pages and limits are clamped, unknown sort fields and
    /// orders fall back to the resource defaults. Only filters that cannot be
    /// encoded canonically are rejected.
    pub fn normalize(
        &self,
        resource: &ResourceDescriptor,
        raw: &RawPageParams,
    ) -> Result<PageRequest, PaginationError> {
        let max_limit = self.config.max_limit.max(1);
        let limit = match raw.limit {
            None => self.config.default_limit.clamp(1, max_limit),
            Some(requested) => {
                let clamped = requested.clamp(1, i64::try_from(max_limit).unwrap_or(i64::MAX));
                if clamped != requested {
                    self.limit_clamped.fetch_add(1, Ordering::Relaxed);
                    counter!(METRIC_LIMIT_CLAMPED, "resource" => resource.name.clone())
                        .increment(1);
                    debug!(resource = %resource.name, requested, clamped, "page limit clamped");
                }
                clamped as u64
            }
        };
        let page = raw.page.unwrap_or(1).max(1) as u64;

        let sort_by = match raw.sort_by.as_deref().map(str::trim) {
            Some(field) if !field.is_empty() && is_sortable(resource, field) => field.to_string(),
            Some(field) if !field.is_empty() => {
                debug!(resource = %resource.name, field, "sort field not allowed, using default");
                resource.default_sort_by.clone()
            }
            _ => resource.default_sort_by.clone(),
        };
        let sort_order = raw
            .sort_order
            .as_deref()
            .and_then(SortOrder::parse)
            .unwrap_or(resource.default_sort_order);

        let search = if resource.searchable_fields.is_empty() {
            String::new()
        } else {
            raw.search.as_deref().unwrap_or_default().trim().to_string()
        };

        let mut filters = BTreeMap::new();
        for (field, value) in &raw.filters {
            validate_filter_name(field)?;
            match value {
                Value::Null => continue,
                Value::Array(_) | Value::Object(_) => {
                    return Err(PaginationError::malformed(
                        field,
                        "filter values must be scalars",
                    ));
                }
                scalar => {
                    filters.insert(field.clone(), scalar.clone());
                }
            }
        }

        Ok(PageRequest {
            page,
            limit,
            sort_by,
            sort_order,
            search,
            search_fields: resource.searchable_fields.clone(),
            filters,
        })
    }

    /// Fetch one page of `resource`, serving repeated requests from the cache.
    ///
    /// `fetch` receives the normalized request and returns the page's items
    /// together with the total matching count. It is invoked at most once per
    /// distinct cache key across concurrent callers.
    #[instrument(skip(self, raw, fetch), fields(resource = %resource.name))]
    pub async fn paginate<T, E, F, Fut>(
        &self,
        resource: &ResourceDescriptor,
        raw: &RawPageParams,
        fetch: F,
    ) -> Result<PageResult<T>, PaginationError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<Box<dyn StdError + Send + Sync>> + Send + 'static,
        F: FnOnce(PageRequest) -> Fut,
        Fut: Future<Output = Result<PageSlice<T>, E>> + Send + 'static,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let request = self.normalize(resource, raw)?;
        let key = request.cache_key(resource)?;
        let (page, limit) = (request.page, request.limit);

        let options = ResolveOptions {
            ttl: resource.ttl,
            operation: Some(format!("{PAGE_NAMESPACE}:{}", resource.name)),
        };
        let slice: PageSlice<T> = self
            .coalescer
            .resolve(&key, move || fetch(request), options)
            .await?;

        Ok(PageResult::from_slice(slice, page, limit))
    }

    /// Drop every cached page of `resource`, across tenants.
    pub async fn invalidate_resource(&self, resource: &ResourceDescriptor) -> usize {
        self.coalescer
            .cache()
            .clear_by_prefix(&resource.resource_prefix())
            .await
    }

    /// Drop the cached pages of `resource` for its tenant only.
    pub async fn invalidate_tenant(&self, resource: &ResourceDescriptor) -> usize {
        self.coalescer
            .cache()
            .clear_by_prefix(&resource.tenant_prefix())
            .await
    }

    pub fn stats(&self) -> PaginationStats {
        PaginationStats {
            requests: self.requests.load(Ordering::Relaxed),
            limit_clamped: self.limit_clamped.load(Ordering::Relaxed),
            default_limit: self.config.default_limit,
            max_limit: self.config.max_limit,
        }
    }
}

fn is_sortable(resource: &ResourceDescriptor, field: &str) -> bool {
    resource.sortable_fields.is_empty() || resource.sortable_fields.iter().any(|f| f == field)
}

fn validate_filter_name(field: &str) -> Result<(), PaginationError> {
    if field.is_empty() {
        return Err(PaginationError::malformed(field, "filter name is empty"));
    }
    if !field
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-'))
    {
        return Err(PaginationError::malformed(
            field,
            "filter names may only contain ASCII letters, digits, `_`, `.` and `-`",
        ));
    }
    Ok(())
}
