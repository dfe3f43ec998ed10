use reqwest::{Method, Url};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{config::PaginationPolicy, errors::OAuthError, oauth::SessionManager};

/// Upstream collections the dashboard can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Lists,
    Metrics,
    Profiles,
}

impl Collection {
    pub fn path(&self) -> &'static str {
        match self {
            Collection::Lists => "/api/lists",
            Collection::Metrics => "/api/metrics",
            Collection::Profiles => "/api/profiles",
        }
    }
}

/// How many pages to read and whether to follow cursors.
#[derive(Debug, Clone, Copy)]
pub struct PageOptions {
    pub pagination: PaginationPolicy,
    pub max_pages: usize,
}

/// Fetch a collection through the session manager and return the
/// concatenated `data` arrays of every page read.
#[tracing::instrument(skip(session))]
pub async fn fetch_collection(
    session: &SessionManager,
    collection: Collection,
    options: PageOptions,
) -> Result<Vec<Value>, OAuthError> {
    let mut next = Some(session.config().api_url(collection.path()));
    let mut records = Vec::new();
    let mut pages = 0;

    while let Some(url) = next.take() {
        let page = session.authorized_request(Method::GET, &url, None).await?;
        pages += 1;
        extend_with_data(&mut records, &page);

        if options.pagination == PaginationPolicy::CursorFollow {
            next = next_page(&page).and_then(|link| {
                let followed = same_origin(&session.config().base_url, &link);
                if followed.is_none() {
                    warn!(%link, "Not following a pagination link outside the upstream origin");
                }
                followed
            });
            if next.is_some() && pages >= options.max_pages {
                warn!(pages, "Stopping pagination at the page limit");
                next = None;
            }
        }

        debug!(pages, records = records.len(), "Read upstream page");
    }

    info!(pages, records = records.len(), "Fetched {:?}", collection);
    Ok(records)
}

fn extend_with_data(records: &mut Vec<Value>, page: &Value) {
    match page.get("data") {
        Some(Value::Array(items)) => records.extend(items.iter().cloned()),
        Some(Value::Null) | None => {}
        Some(single) => records.push(single.clone()),
    }
}

fn next_page(page: &Value) -> Option<String> {
    page.pointer("/links/next")
        .and_then(Value::as_str)
        .filter(|next| !next.is_empty())
        .map(str::to_string)
}

/// Resolve `link` against `base` and keep it only if it stays on the same
/// origin, so the bearer token never leaves the upstream host.
fn same_origin(base: &str, link: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let link = base.join(link).ok()?;

    (link.origin() == base.origin()).then(|| link.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_arrays_and_single_resources_are_collected() {
        let mut records = vec![];
        extend_with_data(&mut records, &json!({"data": [{"id": "a"}, {"id": "b"}]}));
        extend_with_data(&mut records, &json!({"data": {"id": "c"}}));
        extend_with_data(&mut records, &json!({"data": null}));
        extend_with_data(&mut records, &json!({}));

        assert_eq!(
            records,
            vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})]
        );
    }

    #[test]
    fn next_cursor_is_read_from_links() {
        let page = json!({"links": {"self": "x", "next": "https://a.klaviyo.com/api/lists?page%5Bcursor%5D=2"}});
        assert_eq!(
            next_page(&page).as_deref(),
            Some("https://a.klaviyo.com/api/lists?page%5Bcursor%5D=2")
        );

        assert_eq!(next_page(&json!({"links": {"next": null}})), None);
        assert_eq!(next_page(&json!({"links": {"next": ""}})), None);
        assert_eq!(next_page(&json!({"data": []})), None);
    }

    #[test]
    fn pagination_links_must_stay_on_the_upstream_origin() {
        let base = "https://a.klaviyo.com";

        assert_eq!(
            same_origin(base, "https://a.klaviyo.com/api/lists?page%5Bcursor%5D=2").as_deref(),
            Some("https://a.klaviyo.com/api/lists?page%5Bcursor%5D=2")
        );
        assert_eq!(
            same_origin(base, "/api/lists?page%5Bcursor%5D=2").as_deref(),
            Some("https://a.klaviyo.com/api/lists?page%5Bcursor%5D=2")
        );
        assert_eq!(same_origin(base, "https://evil.example/api/lists"), None);
        assert_eq!(same_origin(base, "http://a.klaviyo.com/api/lists"), None);
        assert_eq!(same_origin(base, "https://a.klaviyo.com:8443/api/lists"), None);
        assert_eq!(
            same_origin("http://127.0.0.1:4000", "http://127.0.0.1:4000/api/lists").as_deref(),
            Some("http://127.0.0.1:4000/api/lists")
        );
    }

    #[test]
    fn collections_map_to_api_paths() {
        assert_eq!(Collection::Lists.path(), "/api/lists");
        assert_eq!(Collection::Metrics.path(), "/api/metrics");
        assert_eq!(Collection::Profiles.path(), "/api/profiles");
    }
}
