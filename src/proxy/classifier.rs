//! Request classification and filtering
//!
//! [`RequestClassifier`] derives the content type and first/third-party
//! status of a request; [`RequestFilter`] asks the [`DecisionService`] whether
//! to block it and answers blocked requests with a 403.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use http::StatusCode;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::Result;
use crate::models::{AuditRecord, ClassificationResult, ContentType, InboundRequest, RequestStats};
use crate::proxy::chain::{Flow, Handler};
use crate::proxy::wire::{dump_headers, html_escape, ClientConn};

pub const BLOCKED_REASON: &str = "Blocked by Adblock Plus";

/// The filter engine consulted for every request.
#[async_trait]
pub trait DecisionService: Send + Sync {
    /// Returns `true` when the request should be blocked
    async fn classify(
        &self,
        url: &str,
        content_type: ContentType,
        third_party: bool,
    ) -> anyhow::Result<bool>;

    /// CSS selectors of elements to hide on pages served by `domain`
    async fn selectors_for_domain(&self, _domain: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Lets everything through
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl DecisionService for AllowAll {
    async fn classify(&self, _: &str, _: ContentType, _: bool) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Blocks requests whose host is a listed domain or one of its subdomains.
#[derive(Debug, Default, Clone)]
pub struct HostBlocklist {
    domains: Vec<String>,
    selectors: Vec<String>,
}

impl HostBlocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            selectors: Vec::new(),
        }
    }

    /// Hide these elements on every HTML page
    pub fn with_selectors<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|d| {
            host == *d
                || host
                    .strip_suffix(d.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}

#[async_trait]
impl DecisionService for HostBlocklist {
    async fn classify(&self, url: &str, _: ContentType, _: bool) -> anyhow::Result<bool> {
        let url = Url::parse(url)?;
        Ok(url.host_str().is_some_and(|h| self.is_blocked_host(h)))
    }

    async fn selectors_for_domain(&self, _domain: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.selectors.clone())
    }
}

/// Content type and party inference
pub struct RequestClassifier;

impl RequestClassifier {
    /// The URL handed to the decision service
    pub fn target_url(request: &InboundRequest) -> String {
        if request.is_connect() {
            format!("https://{}/", request.url.trim())
        } else {
            request.url.clone()
        }
    }

    pub fn content_type(url: &str, accept: Option<&str>) -> ContentType {
        if let Some(accept) = accept {
            if accept.contains("text/css") {
                return ContentType::Stylesheet;
            }
            if accept.contains("image/*") {
                return ContentType::Image;
            }
            if accept.contains("text/html") {
                return ContentType::Subdocument;
            }
        }

        let path = url_path(url).to_ascii_lowercase();
        let ext = match path.rsplit_once('.') {
            Some((_, ext)) if !ext.contains('/') => ext,
            _ => return ContentType::Other,
        };

        match ext {
            "js" => ContentType::Script,
            "css" => ContentType::Stylesheet,
            "gif" | "png" | "jpg" | "jpeg" | "bmp" | "ico" => ContentType::Image,
            "ttf" | "woff" => ContentType::Font,
            "htm" | "html" => ContentType::Subdocument,
            _ => ContentType::Other,
        }
    }

    /// Whether `url` belongs to a different site than `referer`.
    ///
    /// Hosts without a known public suffix count as third-party.
    pub fn third_party(url: &str, referer: Option<&str>) -> bool {
        let Some(referer) = referer else {
            return false;
        };

        let request_domain = host_of(url).and_then(|h| registrable_domain(&h));
        let referer_domain = host_of(referer).and_then(|h| registrable_domain(&h));

        match (request_domain, referer_domain) {
            (Some(a), Some(b)) => !a.eq_ignore_ascii_case(&b),
            _ => true,
        }
    }

    pub fn classify(request: &InboundRequest) -> (String, ContentType, bool) {
        let url = Self::target_url(request);
        let content_type = Self::content_type(&url, request.header("Accept"));
        let third_party = Self::third_party(&url, request.header("Referer"));
        (url, content_type, third_party)
    }
}

/// Registrable domain of `host`, or `None` when its suffix is not a known one
pub fn registrable_domain(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let domain = psl::domain(host.as_bytes())?;
    if !domain.suffix().is_known() {
        return None;
    }
    std::str::from_utf8(domain.as_bytes()).ok().map(str::to_string)
}

fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(str::to_string)
}

fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let without_query = &url[..end];
    match without_query.find("://") {
        Some(i) => {
            let rest = &without_query[i + 3..];
            rest.find('/').map(|p| &rest[p..]).unwrap_or("/")
        }
        None => without_query,
    }
}

/// Handler that blocks requests the decision service rejects
pub struct RequestFilter {
    service: Arc<dyn DecisionService>,
    stats: Arc<RequestStats>,
    audit: Option<broadcast::Sender<AuditRecord>>,
    log_headers: bool,
}

impl RequestFilter {
    pub fn new(service: Arc<dyn DecisionService>, stats: Arc<RequestStats>) -> Self {
        Self {
            service,
            stats,
            audit: None,
            log_headers: false,
        }
    }

    pub fn with_audit(mut self, audit: broadcast::Sender<AuditRecord>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_header_logging(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    /// Classify the request and ask the decision service. Never fails.
    pub async fn evaluate(&self, request: &InboundRequest) -> (String, ClassificationResult) {
        let (url, content_type, third_party) = RequestClassifier::classify(request);

        let block = match self.service.classify(&url, content_type, third_party).await {
            Ok(block) => block,
            Err(e) => {
                warn!(url = %url, error = %e, "Filter error, allowing request");
                false
            }
        };

        (
            url,
            ClassificationResult {
                content_type,
                third_party,
                block,
            },
        )
    }

    fn publish(&self, request: &InboundRequest, url: &str, result: &ClassificationResult) {
        self.stats.record(result.block);

        if let Some(audit) = &self.audit {
            let record = AuditRecord {
                request_id: request.id,
                client: request.peer.to_string(),
                url: url.to_string(),
                content_type: result.content_type,
                third_party: result.third_party,
                blocked: result.block,
                timestamp: Utc::now(),
            };
            // No subscribers is fine.
            let _ = audit.send(record);
        }
    }
}

#[async_trait]
impl Handler for RequestFilter {
    fn name(&self) -> &'static str {
        "filter"
    }

    #[instrument(skip(self, request, conn), fields(id = request.id, method = %request.method))]
    async fn respond(&self, request: &mut InboundRequest, conn: &mut ClientConn) -> Result<Flow> {
        let (url, result) = self.evaluate(request).await;

        if result.block {
            info!(
                blocked = true,
                url = %url,
                content_type = %result.content_type,
                third_party = result.third_party,
                "Request blocked"
            );
        } else {
            debug!(
                blocked = false,
                url = %url,
                content_type = %result.content_type,
                third_party = result.third_party,
                "Request allowed"
            );
        }

        if self.log_headers {
            debug!("\n{}", dump_headers(request.id, request, &request.headers, true));
        }

        self.publish(request, &url, &result);

        if !result.block {
            return Ok(Flow::Next);
        }

        if let Err(e) = conn.drain_body(request.body).await {
            debug!(error = %e, "Failed to drain blocked request body");
            request.keep_alive = false;
        }

        let body = blocked_page(&url);
        conn.send_response(request, StatusCode::FORBIDDEN, BLOCKED_REASON, "text/html", &body)
            .await?;

        Ok(Flow::Done {
            keep_alive: request.keep_alive,
        })
    }
}

fn blocked_page(url: &str) -> String {
    format!(
        "<html>\n<head>\n<title>{}</title>\n</head>\n<body>\n<h1>{}</h1>\nThe request for <b>{}</b> matched a filter and was not forwarded.\n</body>\n</html>\n",
        BLOCKED_REASON,
        BLOCKED_REASON,
        html_escape(url)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::models::{BodyKind, Headers};

    /// Records every call and answers with a fixed verdict
    struct Recording {
        verdict: anyhow::Result<bool>,
        calls: Mutex<Vec<(String, ContentType, bool)>>,
    }

    impl Recording {
        fn new(verdict: anyhow::Result<bool>) -> Self {
            Self {
                verdict,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DecisionService for Recording {
        async fn classify(&self, url: &str, ct: ContentType, tp: bool) -> anyhow::Result<bool> {
            self.calls.lock().unwrap().push((url.to_string(), ct, tp));
            match &self.verdict {
                Ok(v) => Ok(*v),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn request(method: &str, url: &str, headers: &[(&str, &str)]) -> InboundRequest {
        let mut h = Headers::new();
        for (k, v) in headers {
            h.add(*k, *v);
        }
        InboundRequest {
            id: 3,
            method: method.into(),
            url: url.into(),
            version: http::Version::HTTP_11,
            headers: h,
            body: BodyKind::None,
            peer: "127.0.0.1:50000".parse().unwrap(),
            keep_alive: true,
            connection_header: "Connection",
        }
    }

    #[test]
    fn test_accept_header_wins_over_suffix() {
        assert_eq!(
            RequestClassifier::content_type("http://a.example/x.js", Some("text/css,*/*;q=0.1")),
            ContentType::Stylesheet
        );
        assert_eq!(
            RequestClassifier::content_type("http://a.example/x.css", Some("image/*")),
            ContentType::Image
        );
    }

    #[test]
    fn test_url_suffix_inference() {
        let ct = RequestClassifier::content_type;
        assert_eq!(ct("http://a.example/x.js", None), ContentType::Script);
        assert_eq!(ct("http://a.example/x.js", Some("*/*")), ContentType::Script);
        assert_eq!(ct("http://a.example/STYLE.CSS?v=2", None), ContentType::Stylesheet);
        assert_eq!(ct("http://a.example/p/banner.JPEG#top", None), ContentType::Image);
        assert_eq!(ct("http://a.example/favicon.ico", None), ContentType::Image);
        assert_eq!(ct("http://a.example/font.woff", None), ContentType::Font);
        assert_eq!(ct("http://a.example/frame.html", None), ContentType::Subdocument);
        assert_eq!(ct("http://a.example/api?file=x.js", None), ContentType::Other);
        assert_eq!(ct("http://cdn.js/", None), ContentType::Other);
        assert_eq!(ct("http://a.example/dir.js/index", None), ContentType::Other);
    }

    #[test]
    fn test_third_party_detection() {
        let tp = RequestClassifier::third_party;
        assert!(!tp("http://b.example/y", None));
        assert!(tp("http://b.example/y", Some("http://a.example/")));
        assert!(!tp("http://cdn.example.com/y.js", Some("http://www.example.com/")));
        assert!(!tp("http://news.bbc.co.uk/", Some("https://www.BBC.co.uk/page")));
        assert!(tp("http://ads.tracker.com/", Some("http://www.example.com/")));
        assert!(tp("http://ads.tracker.com/", Some("not a url")));
        assert!(tp("http://localhost/", Some("http://localhost/")));
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(registrable_domain("www.example.com").as_deref(), Some("example.com"));
        assert_eq!(registrable_domain("a.b.example.co.uk.").as_deref(), Some("example.co.uk"));
        assert_eq!(registrable_domain("tracker.example"), None);
        assert_eq!(registrable_domain("com"), None);
    }

    #[test]
    fn test_connect_target_url() {
        let req = request("CONNECT", "secure.example.com:443", &[]);
        assert_eq!(RequestClassifier::target_url(&req), "https://secure.example.com:443/");
    }

    #[test]
    fn test_host_blocklist_matches_subdomains() {
        let list = HostBlocklist::new(["tracker.example", ".ads.net"]);
        assert!(list.is_blocked_host("tracker.example"));
        assert!(list.is_blocked_host("cdn.Tracker.example"));
        assert!(list.is_blocked_host("ads.net"));
        assert!(!list.is_blocked_host("nottracker.example"));
        assert!(!list.is_blocked_host("example"));
    }

    #[tokio::test]
    async fn test_host_blocklist_classify() {
        let list = HostBlocklist::new(["tracker.example"]);
        assert!(list
            .classify("http://tracker.example/ad.js", ContentType::Script, true)
            .await
            .unwrap());
        assert!(!list
            .classify("http://site.example/", ContentType::Other, false)
            .await
            .unwrap());
        assert!(list.classify("::", ContentType::Other, false).await.is_err());
    }

    #[tokio::test]
    async fn test_service_error_fails_open() {
        let service = Arc::new(Recording::new(Err(anyhow::anyhow!("engine down"))));
        let stats = Arc::new(RequestStats::new());
        let filter = RequestFilter::new(service.clone(), stats.clone());

        let (_, result) = filter
            .evaluate(&request("GET", "http://a.example/x.js", &[]))
            .await;

        assert!(!result.block);
        assert_eq!(service.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_request_gets_403() {
        let service = Arc::new(Recording::new(Ok(true)));
        let stats = Arc::new(RequestStats::new());
        let (audit_tx, mut audit_rx) = broadcast::channel(8);
        let filter = RequestFilter::new(service.clone(), stats.clone()).with_audit(audit_tx);

        let (local, mut remote) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(local);
        let mut conn = ClientConn::new(Box::new(r), Box::new(w), "127.0.0.1:50000".parse().unwrap());

        let mut req = request(
            "GET",
            "http://tracker.example/ad.js",
            &[("Host", "tracker.example"), ("Referer", "http://site.example/")],
        );
        let flow = filter.respond(&mut req, &mut conn).await.unwrap();
        assert_eq!(flow, Flow::Done { keep_alive: true });

        drop(conn);
        let mut out = String::new();
        remote.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 403 Blocked by Adblock Plus\r\n"));
        assert!(out.contains("Content-Type: text/html\r\n"));

        assert_eq!(
            service.calls.lock().unwrap()[0],
            ("http://tracker.example/ad.js".to_string(), ContentType::Script, true)
        );
        assert_eq!(stats.blocked(), 1);

        let record = audit_rx.recv().await.unwrap();
        assert!(record.blocked);
        assert_eq!(record.request_id, 3);
        assert_eq!(record.content_type, ContentType::Script);
    }

    #[tokio::test]
    async fn test_blocked_post_body_is_drained() {
        let filter = RequestFilter::new(Arc::new(Recording::new(Ok(true))), Arc::new(RequestStats::new()));

        let (local, mut remote) = tokio::io::duplex(4096);
        remote.write_all(b"abcdeGET").await.unwrap();
        let (r, w) = tokio::io::split(local);
        let mut conn = ClientConn::new(Box::new(r), Box::new(w), "127.0.0.1:50000".parse().unwrap());

        let mut req = request("POST", "http://tracker.example/collect", &[]);
        req.body = BodyKind::Length(5);
        filter.respond(&mut req, &mut conn).await.unwrap();

        assert_eq!(&conn.take_buffered()[..], b"GET");
    }

    #[tokio::test]
    async fn test_allowed_request_passes_on() {
        let stats = Arc::new(RequestStats::new());
        let filter = RequestFilter::new(Arc::new(AllowAll), stats.clone());

        let (local, _remote) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(local);
        let mut conn = ClientConn::new(Box::new(r), Box::new(w), "127.0.0.1:50000".parse().unwrap());

        let mut req = request("GET", "http://a.example/", &[]);
        assert_eq!(filter.respond(&mut req, &mut conn).await.unwrap(), Flow::Next);
        assert_eq!(stats.allowed(), 1);
        assert_eq!(stats.blocked(), 0);
    }
}
