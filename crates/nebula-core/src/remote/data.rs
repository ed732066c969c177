//! Row access over the PostgREST API

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::{check, RestContext};
use crate::error::SyncResult;
use crate::provider::{DataProvider, Filter, Query, Row};

/// PostgREST client
#[derive(Debug, Clone)]
pub struct PostgrestData {
    rest: RestContext,
}

impl PostgrestData {
    pub fn new(rest: RestContext) -> Self {
        Self { rest }
    }

    fn request(&self, method: Method, table: &str) -> reqwest::RequestBuilder {
        let url = self.rest.url(&format!("/rest/v1/{}", table));
        self.rest.authorize(self.rest.http.request(method, url))
    }

    async fn rows(response: reqwest::Response) -> SyncResult<Vec<Row>> {
        let response = check(response).await?;
        Ok(response.json::<Vec<Row>>().await?)
    }
}

/// Render a value the way PostgREST expects it in a filter
fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Render a filter as `(key, value)` query parameters
///
/// `Eq("id", 5)` becomes `("id", "eq.5")`; a disjunction becomes
/// `("or", "(and(a.eq.1,b.eq.2),and(...))")`.
pub fn encode_filter(filter: &Filter) -> (String, String) {
    match filter {
        Filter::Eq(column, value) => (column.clone(), format!("eq.{}", filter_value(value))),
        Filter::IsNull(column) => (column.clone(), "is.null".to_string()),
        Filter::In(column, values) => {
            let list: Vec<String> = values.iter().map(filter_value).collect();
            (column.clone(), format!("in.({})", list.join(",")))
        }
        Filter::AnyOf(groups) => {
            let groups: Vec<String> = groups
                .iter()
                .map(|group| {
                    let terms: Vec<String> = group.iter().map(inline_filter).collect();
                    format!("and({})", terms.join(","))
                })
                .collect();
            ("or".to_string(), format!("({})", groups.join(",")))
        }
        Filter::ILike(column, pattern) => (column.clone(), format!("ilike.{}", like_value(pattern))),
    }
}

/// PostgREST takes `*` for `%` in URLs; reserved characters need quoting
fn like_value(pattern: &str) -> String {
    let pattern = pattern.replace('%', "*");
    if pattern.contains([',', '(', ')', ':', '"']) {
        format!("\"{}\"", pattern.replace('"', "\\\""))
    } else {
        pattern
    }
}

/// Total from a `Content-Range` header such as `0-24/573` or `*/0`
pub fn content_range_total(header: &str) -> Option<usize> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

/// Filter in the dotted form used inside logical operators
fn inline_filter(filter: &Filter) -> String {
    match filter {
        Filter::AnyOf(_) => {
            let (_, value) = encode_filter(filter);
            format!("or{}", value)
        }
        _ => {
            let (column, value) = encode_filter(filter);
            format!("{}.{}", column, value)
        }
    }
}

fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters.iter().map(encode_filter).collect()
}

#[async_trait]
impl DataProvider for PostgrestData {
    async fn select(&self, query: &Query) -> SyncResult<Vec<Row>> {
        let mut params = vec![("select".to_string(), query.select.clone())];
        params.extend(filter_params(&query.filters));
        if let Some(ref order) = query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
        }
        if let Some((offset, limit)) = query.range {
            params.push(("offset".to_string(), offset.to_string()));
            params.push(("limit".to_string(), limit.to_string()));
        }

        let response = self
            .request(Method::GET, &query.table)
            .query(&params)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn insert(&self, table: &str, row: Row) -> SyncResult<Row> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        single(table, Self::rows(response).await?)
    }

    async fn upsert(&self, table: &str, row: Row) -> SyncResult<Row> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&row)
            .send()
            .await?;
        single(table, Self::rows(response).await?)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Row) -> SyncResult<Vec<Row>> {
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&filter_params(filters))
            .json(&patch)
            .send()
            .await?;
        Self::rows(response).await
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> SyncResult<usize> {
        let mut params = vec![("select".to_string(), "id".to_string())];
        params.extend(filter_params(filters));
        let response = self
            .request(Method::HEAD, table)
            .header("Prefer", "count=exact")
            .query(&params)
            .send()
            .await?;
        let response = check(response).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(content_range_total)
            .ok_or_else(|| {
                crate::error::SyncError::malformed("count", format!("no total for {}", table))
            })
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> SyncResult<usize> {
        let response = self
            .request(Method::DELETE, table)
            .header("Prefer", "return=representation")
            .query(&filter_params(filters))
            .send()
            .await?;
        Ok(Self::rows(response).await?.len())
    }
}

fn single(table: &str, rows: Vec<Row>) -> SyncResult<Row> {
    rows.into_iter()
        .next()
        .ok_or_else(|| crate::error::SyncError::malformed("row", format!("empty {} response", table)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_simple_filters() {
        assert_eq!(
            encode_filter(&Filter::eq("id", 5)),
            ("id".to_string(), "eq.5".to_string())
        );
        assert_eq!(
            encode_filter(&Filter::eq("user_id", "u1")),
            ("user_id".to_string(), "eq.u1".to_string())
        );
        assert_eq!(
            encode_filter(&Filter::is_null("read_at")),
            ("read_at".to_string(), "is.null".to_string())
        );
        assert_eq!(
            encode_filter(&Filter::In("post_id".into(), vec![json!(1), json!("2")])),
            ("post_id".to_string(), "in.(1,2)".to_string())
        );
    }

    #[test]
    fn test_encode_ilike() {
        assert_eq!(
            encode_filter(&Filter::contains("content", "rust")),
            ("content".to_string(), "ilike.*rust*".to_string())
        );
        let search = Filter::AnyOf(vec![
            vec![Filter::contains("name", "a,b")],
            vec![Filter::contains("description", "rust")],
        ]);
        let (key, value) = encode_filter(&search);
        assert_eq!(key, "or");
        assert_eq!(
            value,
            "(and(name.ilike.\"*a,b*\"),and(description.ilike.*rust*))"
        );
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("0-24/573"), Some(573));
        assert_eq!(content_range_total("*/0"), Some(0));
        assert_eq!(content_range_total("0-24/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn test_encode_conversation_filter() {
        let filter = Filter::AnyOf(vec![
            vec![Filter::eq("sender_id", "a"), Filter::eq("receiver_id", "b")],
            vec![Filter::eq("sender_id", "b"), Filter::eq("receiver_id", "a")],
        ]);
        let (key, value) = encode_filter(&filter);
        assert_eq!(key, "or");
        assert_eq!(
            value,
            "(and(sender_id.eq.a,receiver_id.eq.b),and(sender_id.eq.b,receiver_id.eq.a))"
        );
    }
}
