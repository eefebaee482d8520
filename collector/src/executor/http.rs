use super::{
    AttemptFuture,
    Capability,
    Capture,
};
use crate::{
    catalog::{
        CapabilityKind,
        QueryDefinition,
        Request,
    },
    error::AttemptError,
    target::Target,
};
use cluster_diag_config::HttpConfig;
use eyre::{
    Context as _,
    Result,
};
use reqwest::{
    header::{
        HeaderMap,
        HeaderName,
        HeaderValue,
    },
    Method,
};
use std::error::Error as _;
use url::Url;

/// Management API calls over one shared client.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    user: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl HttpBackend {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).wrap_err_with(|| format!("Invalid header name {name:?}"))?;
            let value = HeaderValue::from_str(value).wrap_err_with(|| format!("Invalid value for header {name}"))?;
            headers.insert(name, value);
        }
        if config.insecure {
            warn!("TLS certificate verification is disabled");
        }

        let client = reqwest::Client::builder()
            .user_agent(concat!("cluster-diag/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .wrap_err("Failed to build the HTTP client")?;

        Ok(Self {
            client,
            user: config.user.clone(),
            password: config.password()?,
        })
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.user {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    /// GET returning the parsed JSON body. Non-2xx responses are request errors.
    pub async fn get_json(&self, url: Url) -> Result<serde_json::Value, AttemptError> {
        let response = self.request(Method::GET, url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Request(format!("HTTP {status}")));
        }
        let body = response.bytes().await.map_err(classify)?;
        serde_json::from_slice(&body).map_err(|err| AttemptError::Request(format!("response is not JSON: {err}")))
    }
}

impl Capability for HttpBackend {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Http
    }

    fn attempt<'a>(&'a self, query: &'a QueryDefinition, rendered: &'a str, target: &'a Target) -> AttemptFuture<'a> {
        Box::pin(async move {
            let Request::Http(request) = &query.request else {
                return Err(AttemptError::Request(format!("{} is not an HTTP query", query.name)));
            };
            let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| AttemptError::Request(format!("invalid HTTP method {:?}", request.method)))?;
            let url = target
                .endpoint(rendered)
                .map_err(|err| AttemptError::Request(format!("invalid request path {rendered:?}: {err}")))?;

            trace!(%method, %url, "sending request");
            let mut builder = self.request(method, url);
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let body = response.bytes().await.map_err(classify)?;

            Ok(Capture {
                body: body.to_vec(),
                http_status: Some(status.as_u16()),
                exit_code: None,
                success: status.is_success(),
                detail: (!status.is_success()).then(|| format!("HTTP {status}")),
            })
        })
    }
}

/// Anything that kept the request from producing a response is a transport failure.
fn classify(err: reqwest::Error) -> AttemptError {
    if err.is_builder() {
        return AttemptError::Request(err.to_string());
    }
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    AttemptError::Transport(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn refused_connections_are_transport_failures() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let backend = HttpBackend::new(&HttpConfig::default()).unwrap();
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        let err = backend.get_json(url).await.unwrap_err();
        assert!(err.is_transport(), "{err}");
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let config = HttpConfig {
            headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
            ..HttpConfig::default()
        };
        assert!(HttpBackend::new(&config).is_err());

        let config = HttpConfig {
            user: Some("elastic".to_string()),
            headers: BTreeMap::from([("kbn-xsrf".to_string(), "true".to_string())]),
            ..HttpConfig::default()
        };
        let backend = HttpBackend::new(&config).unwrap();
        assert_eq!(format!("{backend:?}"), "HttpBackend { user: Some(\"elastic\"), password: None }");
    }
}
