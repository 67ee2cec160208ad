use std::borrow::Cow;

use arpc::internal::jsonrpc::Response;
use serde_json::Value;

use crate::{response_value, ClientError};

/// A plain HTTP link: one request per call.
#[derive(Debug, Clone)]
pub struct Client {
    url: Cow<'static, str>,
    client: reqwest::Client,
}

impl Client {
    pub fn new(url: impl Into<Cow<'static, str>>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::builder()
                .user_agent(concat!(
                    env!("CARGO_PKG_NAME"),
                    "/",
                    env!("CARGO_PKG_VERSION")
                ))
                .build()
                .unwrap_or_default(),
        }
    }

    pub(crate) fn endpoint(url: &str, path: &str) -> String {
        format!(
            "{}{}{}",
            url,
            if url.ends_with('/') { "" } else { "/" },
            path
        )
    }

    /// Execute a query over `GET`, the input carried in the `input` URL
    /// parameter.
    pub async fn query(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        let mut req = self.client.get(Self::endpoint(&self.url, path));
        if let Some(input) = input {
            req = req.query(&[("input", serde_json::to_string(&input)?)]);
        }

        let resp: Response = req.send().await?.json().await?;
        response_value(resp)
    }

    /// Execute a mutation over `POST`, the input as the JSON body.
    pub async fn mutation(&self, path: &str, input: Option<Value>) -> Result<Value, ClientError> {
        let mut req = self.client.post(Self::endpoint(&self.url, path));
        if let Some(input) = input {
            req = req.json(&input);
        }

        let resp: Response = req.send().await?.json().await?;
        response_value(resp)
    }
}
