use helpdesk_core::{ArchiveRequest, ForumGateway, GatewayError, TriagePost};
use serde::Serialize;
use std::time::Duration;
use tokio::runtime::Handle;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Forwards outbound forum commands to the platform bridge as JSON over HTTP.
///
/// The trait is synchronous, so calls drive the async client on `runtime` and must come
/// from blocking threads (`spawn_blocking`), never from an async worker.
pub struct HttpForumGateway {
    client: reqwest::Client,
    base_url: String,
    runtime: Handle,
}

impl HttpForumGateway {
    pub fn new(base_url: &str, runtime: Handle) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            runtime,
        })
    }

    pub fn thread_url(&self, thread_id: &str, action: &str) -> String {
        format!("{}/threads/{thread_id}/{action}", self.base_url)
    }

    fn post_json<T: Serialize>(
        &self,
        operation: &'static str,
        url: String,
        body: &T,
    ) -> Result<(), GatewayError> {
        let request = self.client.post(url).json(body);
        self.runtime
            .block_on(async move {
                let response = request.send().await?;
                response.error_for_status().map(|_| ())
            })
            .map_err(|err| GatewayError::new(operation, err.to_string()))
    }
}

impl ForumGateway for HttpForumGateway {
    fn post_triage_template(&self, thread_id: &str, post: &TriagePost) -> Result<(), GatewayError> {
        self.post_json(
            "post_triage_template",
            self.thread_url(thread_id, "triage"),
            post,
        )
    }

    fn archive_thread(
        &self,
        thread_id: &str,
        request: &ArchiveRequest,
    ) -> Result<(), GatewayError> {
        self.post_json(
            "archive_thread",
            self.thread_url(thread_id, "archive"),
            request,
        )
    }
}
