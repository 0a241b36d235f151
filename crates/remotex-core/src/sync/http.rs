//! HTTP endpoint for one remote project.

use async_trait::async_trait;
use remotex_state::{FileRecord, Subdir};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode, Url};
use tracing::debug;

use super::remote::{BuildEndpoint, RemoteEndpoint};
use crate::domain::{BuildOptions, RemotexError, Result};

/// Response header carrying the driver exit status of a failed build.
pub const EXIT_CODE_HEADER: &str = "X-Remotex-Exit-Code";

/// Connection settings for [`HttpRemote`].
#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub server: String,
    pub user: String,
    pub project: String,
    pub token: Option<String>,
}

/// `RemoteEndpoint` + `BuildEndpoint` over the remotex HTTP API.
pub struct HttpRemote {
    client: Client,
    base: Url,
    user: String,
    project: String,
    token: Option<String>,
}

impl From<reqwest::Error> for RemotexError {
    fn from(err: reqwest::Error) -> Self {
        RemotexError::internal(format!("http: {err}"))
    }
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.server)
            .map_err(|e| RemotexError::internal(format!("invalid server url {}: {e}", config.server)))?;
        if base.cannot_be_a_base() {
            return Err(RemotexError::internal(format!(
                "server url {} cannot be a base",
                config.server
            )));
        }
        let client = Client::builder()
            .user_agent(concat!("remotex/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base,
            user: config.user,
            project: config.project,
            token: config.token,
        })
    }

    /// `{base}/{user}/{project}/{segments...}`, each segment escaped.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| RemotexError::internal("server url cannot be a base"))?
            .pop_if_empty()
            .push(&self.user)
            .push(&self.project)
            .extend(segments);
        Ok(url)
    }

    fn file_url(&self, subdir: Subdir, path: &str) -> Result<Url> {
        self.url(std::iter::once(subdir.as_str()).chain(path.split('/')))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Map non-success statuses onto the error taxonomy.
    async fn check(&self, resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let exit_code = resp
            .headers()
            .get(EXIT_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i32>().ok())
            .unwrap_or(1);
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => RemotexError::NotFound(what.to_string()),
            StatusCode::CONFLICT => RemotexError::Conflict {
                project: format!("{}/{}", self.user, self.project),
            },
            StatusCode::UNPROCESSABLE_ENTITY => RemotexError::Driver {
                exit_code,
                output: body,
            },
            other => RemotexError::Internal {
                reason: format!("{what}: unexpected status {other}"),
                output: body,
            },
        })
    }
}

#[async_trait]
impl RemoteEndpoint for HttpRemote {
    async fn list_files(&self, subdir: Subdir) -> Result<Vec<FileRecord>> {
        let url = self.url([subdir.as_str()])?;
        let resp = self.authorize(self.client.get(url)).send().await?;
        let resp = self.check(resp, subdir.as_str()).await?;
        // a fresh project lists as `null`
        let files: Option<Vec<FileRecord>> = resp.json().await?;
        Ok(files.unwrap_or_default())
    }

    async fn upload(&self, subdir: Subdir, path: &str, data: Vec<u8>) -> Result<()> {
        let url = self.url([subdir.as_str()])?;
        let file_name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = Form::new()
            .part("file", Part::bytes(data).file_name(file_name))
            .text("path", path.to_string());
        let resp = self
            .authorize(self.client.post(url))
            .multipart(form)
            .send()
            .await?;
        self.check(resp, path).await?;
        debug!(%subdir, path, "uploaded");
        Ok(())
    }

    async fn download(&self, subdir: Subdir, path: &str) -> Result<Vec<u8>> {
        let url = self.file_url(subdir, path)?;
        let resp = self.authorize(self.client.get(url)).send().await?;
        let resp = self.check(resp, path).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn delete(&self, subdir: Subdir, path: &str) -> Result<()> {
        let url = self.file_url(subdir, path)?;
        let resp = self.authorize(self.client.delete(url)).send().await?;
        self.check(resp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl BuildEndpoint for HttpRemote {
    async fn build(&self, options: &BuildOptions) -> Result<String> {
        let url = self.url(["build"])?;
        let resp = self
            .authorize(self.client.post(url))
            .query(&options.to_query_pairs())
            .send()
            .await?;
        let resp = self.check(resp, "build").await?;
        Ok(resp.text().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(server: &str) -> HttpRemote {
        HttpRemote::new(HttpRemoteConfig {
            server: server.to_string(),
            user: "alice".to_string(),
            project: "my thesis".to_string(),
            token: None,
        })
        .unwrap()
    }

    #[test]
    fn urls_escape_each_segment() {
        let r = remote("https://tex.example.org/api/");
        let url = r.file_url(Subdir::Src, "chapters/intro #1.tex").unwrap();
        assert_eq!(
            url.as_str(),
            "https://tex.example.org/api/alice/my%20thesis/src/chapters/intro%20%231.tex"
        );
        let url = r.url(["build"]).unwrap();
        assert_eq!(url.as_str(), "https://tex.example.org/api/alice/my%20thesis/build");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(HttpRemote::new(HttpRemoteConfig {
            server: "mailto:root@example.org".into(),
            user: "a".into(),
            project: "b".into(),
            token: None,
        })
        .is_err());
    }
}
