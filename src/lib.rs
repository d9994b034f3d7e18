use reqwest::header;
use std::{convert::TryFrom, sync::Arc, time::Duration};

pub mod census;
pub mod config;
pub mod identity;
mod util;

pub use census::{Census, Classification, Report};
pub use config::{Credentials, Settings};
pub use identity::IdentityApi;

const DEFAULT_KEYSTONE_URI: &str = "http://cloud.lab.fi-ware.org:4730";
const AUTH_TOKEN_HEADER: &str = "x-auth-token";

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("{0}")]
    Header(#[from] header::InvalidHeaderValue),
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("{0}")]
    Msg(std::borrow::Cow<'static, str>),
    #[error("{request_error} [{extra}]")]
    Service {
        extra: String,
        request_error: reqwest::Error,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("could not get an admin token: {0}")]
    Authentication(String),
    #[error("no endpoint group found for region {0:?}")]
    RegionNotFound(String),
    #[error("{count} endpoint groups match region {region:?}, expected exactly one")]
    AmbiguousRegion { region: String, count: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Client {
    client: reqwest::Client,
    data: Arc<ClientData>,
}

#[derive(Debug, Clone)]
struct ClientData {
    base_url: reqwest::Url,
}

#[derive(Debug)]
pub struct ClientBuilder {
    base_url: reqwest::Url,
    token: Option<String>,
    timeout: Duration,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Builds an unauthenticated client from the settings and exchanges the configured
    /// credentials for an admin token.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        Client::builder()
            .service_url(&settings.url)?
            .timeout(settings.timeout)
            .authenticate(&settings.credentials)
            .await
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.data.base_url
    }

    fn join_url(&self, segments: &[&str]) -> Result<reqwest::Url> {
        util::with_segments(self.url(), segments)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, segments: &[&str]) -> Result<T> {
        let url = self.join_url(segments)?;
        let resp = self.client.get(url).send().await?;
        util::handle(resp)
            .await?
            .json()
            .await
            .map_err(Error::Request)
    }

    async fn get_query<T, Q>(&self, segments: &[&str], query: &Q) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        Q: serde::Serialize + ?Sized,
    {
        let url = self.join_url(segments)?;
        let resp = self.client.get(url).query(query).send().await?;
        util::handle(resp)
            .await?
            .json()
            .await
            .map_err(Error::Request)
    }

    async fn post_json<T>(&self, segments: &[&str], body: &T) -> Result<reqwest::Response>
    where
        T: serde::Serialize + ?Sized,
    {
        let url = self.join_url(segments)?;
        let resp = self.client.post(url).json(body).send().await?;
        util::handle(resp).await
    }
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            base_url: reqwest::Url::parse(DEFAULT_KEYSTONE_URI)
                .expect("default keystone uri is valid"),
            timeout: Duration::from_secs(60),
            token: None,
        }
    }

    /// Sets the base url of the identity service.
    ///
    /// # Default Value
    /// `http://cloud.lab.fi-ware.org:4730`
    ///
    /// # Notes
    /// The client will set the path when making requests, as such, any path component will be
    /// overridden.
    pub fn service_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = reqwest::Url::parse(url.as_ref())?;
        Ok(self)
    }

    /// Sets the request timeout for requests issued by the client
    ///
    /// # Default Value
    /// 60 Seconds
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the `x-auth-token` header sent with every request
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Requests an admin token for `credentials` and returns a client that sends it.
    ///
    /// Any failure, including a response without `access.token.id`, is reported as
    /// [`Error::Authentication`]. There is no retry.
    pub async fn authenticate(self, credentials: &Credentials) -> Result<Client> {
        tracing::info!(tenant = %credentials.tenant_name, "getting admin token");
        let anonymous = Client {
            client: reqwest::Client::builder().timeout(self.timeout).build()?,
            data: Arc::new(ClientData {
                base_url: self.base_url.clone(),
            }),
        };
        let token = anonymous
            .issue_token(credentials)
            .await
            .map_err(|e| match e {
                Error::Authentication(msg) => Error::Authentication(msg),
                other => Error::Authentication(other.to_string()),
            })?;
        self.token(token).build()
    }

    pub fn build(self) -> Result<Client> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.token {
            let mut token = header::HeaderValue::try_from(token)?;
            token.set_sensitive(true);
            headers.insert(AUTH_TOKEN_HEADER, token);
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()?;
        Ok(Client {
            client,
            data: Arc::new(ClientData {
                base_url: self.base_url,
            }),
        })
    }
}
