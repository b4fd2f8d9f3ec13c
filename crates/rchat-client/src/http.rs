//! HTTP binding of the relay contract.

use rchat_core::{
    DownloadRequest, DownloadResponse, PollRequest, PollResponse, SendRequest, SendResponse,
    TransportError, UploadChunkRequest, UploadChunkResponse,
};
use reqwest::{Client, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub const DEFAULT_SERVER: &str = "http://localhost:8080";

#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    base: String,
}

impl RelayClient {
    pub fn new(base: &str) -> Self {
        Self {
            http: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// `POST /send-message`. A lost segment comes back as an empty 200.
    pub async fn send_message(&self, request: &SendRequest) -> Result<SendResponse, TransportError> {
        let response = self.post("/send-message", request).await?;
        read_json_or_default(response).await
    }

    /// `POST /upload-chunk`
    pub async fn upload_chunk(
        &self,
        request: &UploadChunkRequest,
    ) -> Result<UploadChunkResponse, TransportError> {
        let response = self.post("/upload-chunk", request).await?;
        read_json_or_default(response).await
    }

    /// `GET /receive?user=&lastAck=`
    pub async fn receive(&self, request: &PollRequest) -> Result<PollResponse, TransportError> {
        let url = self.url(
            "/receive",
            &[
                ("user", request.user.clone()),
                ("lastAck", request.last_ack.to_string()),
            ],
        )?;
        read_json(self.get(url).await?).await
    }

    /// `GET /download-file?fileName=&receiver=`
    pub async fn download_file(
        &self,
        request: &DownloadRequest,
    ) -> Result<DownloadResponse, TransportError> {
        let url = self.url(
            "/download-file",
            &[
                ("fileName", request.file_name.clone()),
                ("receiver", request.receiver.clone()),
            ],
        )?;
        read_json(self.get(url).await?).await
    }

    /// `GET /users`
    pub async fn users(&self) -> Result<Vec<String>, TransportError> {
        let url = self.url("/users", &[])?;
        read_json(self.get(url).await?).await
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url, TransportError> {
        let raw = format!("{}{}", self.base, path);
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|err| TransportError::Unreachable(format!("invalid relay url {raw}: {err}")))
    }

    async fn get(&self, url: Url) -> Result<Response, TransportError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        check_status(response)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Response, TransportError> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(body)
            .send()
            .await
            .map_err(|err| TransportError::Unreachable(err.to_string()))?;
        check_status(response)
    }
}

fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    response
        .json::<T>()
        .await
        .map_err(|err| TransportError::Decode(err.to_string()))
}

async fn read_json_or_default<T>(response: Response) -> Result<T, TransportError>
where
    T: DeserializeOwned + Default,
{
    let body = response
        .bytes()
        .await
        .map_err(|err| TransportError::Unreachable(err.to_string()))?;
    decode_or_default(&body)
}

/// Parse a JSON body, treating an empty one as the default value.
fn decode_or_default<T>(body: &[u8]) -> Result<T, TransportError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| TransportError::Decode(err.to_string()))
}
