//! Handler registry: ordered (match, process) pairs with LIFO lookup.
//!
//! A match function inspects the parsed request head and, when it accepts the
//! request, returns the [`Request`] the body will be ingested into. The
//! process function then turns the completed request into a [`Response`].
//! The last-registered handler whose match accepts wins.

use crate::http::request::{BodyKind, Request, RequestHead};
use crate::http::response::Response;
use crate::http::types::{Method, StatusCode};
use futures::future::BoxFuture;
use regex::RegexBuilder;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Result of probing one handler's match function.
pub(crate) enum MatchOutcome {
    /// Accepted; the request to ingest the body into.
    Matched(Request),
    /// The URL is one this handler serves, but with a different method.
    /// Remembered so an otherwise unmatched request yields `405` over `404`.
    WrongMethod,
    NoMatch,
}

pub(crate) type MatchFn = Box<dyn Fn(&RequestHead) -> MatchOutcome + Send + Sync>;
pub(crate) type ProcessFn =
    Box<dyn Fn(Request) -> BoxFuture<'static, Option<Response>> + Send + Sync>;

pub(crate) struct Handler {
    pub(crate) match_fn: MatchFn,
    pub(crate) process_fn: Arc<ProcessFn>,
}

/// Append-only handler list owned by the server; immutable while running.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: Vec<Arc<Handler>>,
}

pub(crate) enum RegistryLookup {
    Matched(Request, Arc<ProcessFn>),
    WrongMethod,
    NoMatch,
}

impl HandlerRegistry {
    pub(crate) fn add(&mut self, match_fn: MatchFn, process_fn: ProcessFn) {
        self.handlers.push(Arc::new(Handler {
            match_fn,
            process_fn: Arc::new(process_fn),
        }));
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }

    pub(crate) fn snapshot(&self) -> Arc<[Arc<Handler>]> {
        self.handlers.clone().into()
    }
}

/// LIFO lookup over a registry snapshot.
pub(crate) fn match_request(handlers: &[Arc<Handler>], head: &RequestHead) -> RegistryLookup {
    let mut saw_wrong_method = false;

    for handler in handlers.iter().rev() {
        match (handler.match_fn)(head) {
            MatchOutcome::Matched(request) => {
                return RegistryLookup::Matched(request, handler.process_fn.clone());
            }
            MatchOutcome::WrongMethod => saw_wrong_method = true,
            MatchOutcome::NoMatch => {}
        }
    }

    match saw_wrong_method {
        true => RegistryLookup::WrongMethod,
        false => RegistryLookup::NoMatch,
    }
}

// Match builders

pub(crate) fn match_any_path(method: Method, body_kind: BodyKind) -> MatchFn {
    Box::new(move |head| match head.method == method {
        true => MatchOutcome::Matched(Request::with_body(head.clone(), body_kind.clone())),
        false => MatchOutcome::NoMatch,
    })
}

/// Case-insensitive exact path match.
pub(crate) fn match_exact_path(method: Method, path: String, body_kind: BodyKind) -> MatchFn {
    Box::new(move |head| {
        if !head.path.eq_ignore_ascii_case(&path) {
            return MatchOutcome::NoMatch;
        }
        match head.method == method {
            true => MatchOutcome::Matched(Request::with_body(head.clone(), body_kind.clone())),
            false => MatchOutcome::WrongMethod,
        }
    })
}

/// Case-insensitive regex, anchored over the whole decoded path.
pub(crate) fn match_path_regex(
    method: Method,
    pattern: &str,
    body_kind: BodyKind,
) -> Result<MatchFn, regex::Error> {
    let anchored = format!("^(?:{pattern})$");
    let regex = RegexBuilder::new(&anchored).case_insensitive(true).build()?;

    Ok(Box::new(move |head| {
        if !regex.is_match(&head.path) {
            return MatchOutcome::NoMatch;
        }
        match head.method == method {
            true => MatchOutcome::Matched(Request::with_body(head.clone(), body_kind.clone())),
            false => MatchOutcome::WrongMethod,
        }
    }))
}

/// Case-sensitive, recursive prefix match on a base path ending in `/`.
pub(crate) fn match_base_path(method: Method, base_path: String, body_kind: BodyKind) -> MatchFn {
    Box::new(move |head| {
        if !head.path.starts_with(&base_path) {
            return MatchOutcome::NoMatch;
        }
        match head.method == method {
            true => MatchOutcome::Matched(Request::with_body(head.clone(), body_kind.clone())),
            false => MatchOutcome::WrongMethod,
        }
    })
}

pub(crate) fn make_process<F, Fut>(process: F) -> ProcessFn
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Option<Response>> + Send + 'static,
{
    Box::new(move |request| Box::pin(process(request)))
}

// File serving

/// Process function serving one fixed file.
pub(crate) fn serve_file_process(
    file_path: PathBuf,
    is_attachment: bool,
    cache_age: u32,
    allow_ranges: bool,
) -> ProcessFn {
    make_process(move |_request| {
        let file_path = file_path.clone();
        async move {
            match Response::file_with_options(&file_path, None, is_attachment, allow_ranges).await
            {
                Ok(mut response) => {
                    response.set_cache_control_max_age(cache_age);
                    Some(response)
                }
                Err(error) => {
                    tracing::warn!(path = %file_path.display(), %error, "failed to open file");
                    Some(Response::with_status(StatusCode::NotFound))
                }
            }
        }
    })
}

/// Process function serving a directory tree under a base path: files, an
/// optional index file per directory, and an HTML listing fallback.
pub(crate) fn serve_directory_process(
    base_path: String,
    directory: PathBuf,
    index_filename: Option<String>,
    cache_age: u32,
    allow_ranges: bool,
) -> ProcessFn {
    make_process(move |request| {
        let base_path = base_path.clone();
        let directory = directory.clone();
        let index_filename = index_filename.clone();

        async move {
            let relative = request.path().strip_prefix(&base_path).unwrap_or("");
            let Some(target) = resolve_under_root(&directory, relative) else {
                return Some(Response::with_status(StatusCode::NotFound));
            };

            let metadata = match tokio::fs::metadata(&target).await {
                Ok(metadata) => metadata,
                Err(_) => return Some(Response::with_status(StatusCode::NotFound)),
            };

            if metadata.is_dir() {
                if let Some(index) = &index_filename {
                    let index_path = target.join(index);
                    if tokio::fs::metadata(&index_path)
                        .await
                        .map(|m| m.is_file())
                        .unwrap_or(false)
                    {
                        return match Response::file_with_options(
                            &index_path,
                            None,
                            false,
                            allow_ranges,
                        )
                        .await
                        {
                            Ok(mut response) => {
                                response.set_cache_control_max_age(cache_age);
                                Some(response)
                            }
                            Err(_) => Some(Response::with_status(StatusCode::NotFound)),
                        };
                    }
                }
                return Some(directory_listing(request.path(), &target).await);
            }

            match Response::file_with_options(&target, None, false, allow_ranges).await {
                Ok(mut response) => {
                    response.set_cache_control_max_age(cache_age);
                    Some(response)
                }
                Err(_) => Some(Response::with_status(StatusCode::NotFound)),
            }
        }
    })
}

/// Joins a decoded request path onto the served root, refusing traversal
/// outside it.
fn resolve_under_root(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = relative.trim_start_matches('/');
    let candidate = Path::new(relative);

    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => return None,
        }
    }

    Some(root.join(candidate))
}

async fn directory_listing(request_path: &str, directory: &Path) -> Response {
    let mut entries = Vec::new();
    if let Ok(mut reader) = tokio::fs::read_dir(directory).await {
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(match is_dir {
                true => format!("{name}/"),
                false => name,
            });
        }
    }
    entries.sort();

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>");
    html.push_str(&escape_html(request_path));
    html.push_str("</title></head><body>\n<ul>\n");
    for entry in entries {
        let escaped = escape_html(&entry);
        html.push_str(&format!("<li><a href=\"{escaped}\">{escaped}</a></li>\n"));
    }
    html.push_str("</ul>\n</body></html>\n");

    Response::html(html)
}

fn escape_html(src: &str) -> String {
    src.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::types::{Headers, Version};

    fn head(method: Method, path: &str) -> RequestHead {
        RequestHead {
            method,
            version: Version::Http11,
            url: format!("http://localhost{path}"),
            path: path.to_string(),
            query: None,
            headers: Headers::new(),
        }
    }

    fn noop_process() -> ProcessFn {
        make_process(|_| async { Some(Response::text("ok")) })
    }

    fn tagged_process(tag: &'static str) -> ProcessFn {
        make_process(move |_| async move { Some(Response::text(tag)) })
    }

    async fn run(process: &ProcessFn, request: Request) -> Option<Response> {
        process(request).await
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = HandlerRegistry::default();
        registry.add(
            match_any_path(Method::Get, BodyKind::None),
            tagged_process("first"),
        );
        registry.add(
            match_any_path(Method::Get, BodyKind::None),
            tagged_process("second"),
        );

        let snapshot = registry.snapshot();
        let RegistryLookup::Matched(request, process) =
            match_request(&snapshot, &head(Method::Get, "/"))
        else {
            panic!("must match");
        };

        let response = futures::executor::block_on(run(&process, request)).unwrap();
        assert_eq!(response.content_length(), Some(6)); // "second"
    }

    #[test]
    fn wrong_method_is_reported_for_known_path() {
        let mut registry = HandlerRegistry::default();
        registry.add(
            match_exact_path(Method::Get, "/only-get".to_string(), BodyKind::None),
            noop_process(),
        );
        let snapshot = registry.snapshot();

        assert!(matches!(
            match_request(&snapshot, &head(Method::Post, "/only-get")),
            RegistryLookup::WrongMethod
        ));
        assert!(matches!(
            match_request(&snapshot, &head(Method::Post, "/elsewhere")),
            RegistryLookup::NoMatch
        ));
    }

    #[test]
    fn exact_path_is_case_insensitive() {
        let matcher = match_exact_path(Method::Get, "/Files".to_string(), BodyKind::None);

        assert!(matches!(
            matcher(&head(Method::Get, "/files")),
            MatchOutcome::Matched(_)
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/FILES")),
            MatchOutcome::Matched(_)
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/files/x")),
            MatchOutcome::NoMatch
        ));
    }

    #[test]
    fn regex_is_anchored_and_case_insensitive() {
        let matcher =
            match_path_regex(Method::Get, r"/api/item/\d+", BodyKind::None).unwrap();

        assert!(matches!(
            matcher(&head(Method::Get, "/api/item/42")),
            MatchOutcome::Matched(_)
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/API/ITEM/42")),
            MatchOutcome::Matched(_)
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/api/item/42/extra")),
            MatchOutcome::NoMatch
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/prefix/api/item/42")),
            MatchOutcome::NoMatch
        ));
    }

    #[test]
    fn base_path_is_case_sensitive_and_recursive() {
        let matcher = match_base_path(Method::Get, "/static/".to_string(), BodyKind::None);

        assert!(matches!(
            matcher(&head(Method::Get, "/static/a/b/c.txt")),
            MatchOutcome::Matched(_)
        ));
        assert!(matches!(
            matcher(&head(Method::Get, "/Static/a")),
            MatchOutcome::NoMatch
        ));
    }

    #[test]
    fn traversal_is_refused() {
        let root = Path::new("/srv/files");

        assert_eq!(
            resolve_under_root(root, "a/b.txt"),
            Some(root.join("a/b.txt"))
        );
        assert_eq!(resolve_under_root(root, "../etc/passwd"), None);
        assert_eq!(resolve_under_root(root, "a/../../x"), None);
    }

    #[tokio::test]
    async fn directory_process_serves_files_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi there").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let process = serve_directory_process(
            "/files/".to_string(),
            dir.path().to_path_buf(),
            None,
            0,
            true,
        );

        // Existing file
        let request = Request::new(head(Method::Get, "/files/hello.txt"));
        let response = process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.content_length(), Some(8));
        assert_eq!(response.content_type(), Some("text/plain"));

        // Directory without index falls back to a listing
        let request = Request::new(head(Method::Get, "/files/"));
        let response = process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::Ok);
        assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));

        // Missing file
        let request = Request::new(head(Method::Get, "/files/absent.txt"));
        let response = process(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn directory_process_prefers_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"<h1>home</h1>").unwrap();

        let process = serve_directory_process(
            "/".to_string(),
            dir.path().to_path_buf(),
            Some("index.html".to_string()),
            0,
            true,
        );

        let request = Request::new(head(Method::Get, "/"));
        let response = process(request).await.unwrap();
        assert_eq!(response.content_type(), Some("text/html"));
        assert_eq!(response.content_length(), Some(13));
    }
}
