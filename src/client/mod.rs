//! Typed client for the Web backend's JSON API.
//!
//! Every request carries a bearer token from the shared [`token::TokenStore`];
//! a 401 triggers one transparent refresh-or-relogin followed by exactly one
//! retry. Plain API calls get a 5 second timeout; attachment and template
//! downloads are streamed to disk without a whole-body deadline.

pub mod model;
pub mod token;

use crate::config::CONFIG;
use futures::StreamExt;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use token::{TokenError, TokenStore};
use tokio::io::AsyncWriteExt;

const API_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} request to {path} failed: {source}")]
    Request {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to construct http client: {0}")]
    Init(#[source] reqwest::Error),
    #[error("failed to save download to {path}: {source}")]
    Download {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Token(#[from] TokenError),
}

#[derive(Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    tokens: TokenStore,
    base_url: String,
}

impl ApiClient {
    pub fn new(role: &str) -> Result<ApiClient, ApiError> {
        let http = reqwest::Client::builder()
            .connect_timeout(API_TIMEOUT)
            .build()
            .map_err(ApiError::Init)?;
        Ok(ApiClient {
            http,
            tokens: TokenStore::new(role),
            base_url: CONFIG.web_base_url(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .request::<()>(Method::GET, path, None, Some(API_TIMEOUT))
            .await?;
        response.json().await.map_err(|source| ApiError::Request {
            method: Method::GET,
            path: path.to_owned(),
            source,
        })
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self
            .request(Method::POST, path, Some(body), Some(API_TIMEOUT))
            .await?;
        response.json().await.map_err(|source| ApiError::Request {
            method: Method::POST,
            path: path.to_owned(),
            source,
        })
    }

    /// POST for endpoints whose response body does not matter (it may well
    /// be empty, which no typed deserialization would accept).
    pub async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ApiError> {
        self.request(Method::POST, path, Some(body), Some(API_TIMEOUT))
            .await?;
        Ok(())
    }

    /// Stream a binary endpoint (attachment or template zip) into `dest`.
    pub async fn download(&self, path: &str, dest: &Path) -> Result<(), ApiError> {
        let response = self.request::<()>(Method::GET, path, None, None).await?;
        let mut stream = response.bytes_stream();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| ApiError::Download { path: dest.to_owned(), source })?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ApiError::Request {
                method: Method::GET,
                path: path.to_owned(),
                source,
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|source| ApiError::Download { path: dest.to_owned(), source })?;
        }
        file.flush()
            .await
            .map_err(|source| ApiError::Download { path: dest.to_owned(), source })?;
        Ok(())
    }

    async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let wrap = |source: reqwest::Error| ApiError::Request {
            method: method.clone(),
            path: path.to_owned(),
            source,
        };

        let token = self.tokens.access_token().await?;
        let mut response = self
            .send_once(&method, &url, body, timeout, &token)
            .await
            .map_err(wrap)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.refresh().await?;
            let token = self.tokens.access_token().await?;
            response = self
                .send_once(&method, &url, body, timeout, &token)
                .await
                .map_err(wrap)?;
        }

        response.error_for_status().map_err(wrap)
    }

    async fn send_once<B: Serialize>(
        &self,
        method: &Method,
        url: &str,
        body: Option<&B>,
        timeout: Option<Duration>,
        token: &str,
    ) -> reqwest::Result<Response> {
        let mut request = self.http.request(method.clone(), url).bearer_auth(token);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await
    }
}
