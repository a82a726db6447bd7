//! Some helper functions for HTTP calls
use std::{fmt, time::Duration};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    Response, StatusCode,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::constants::{HTTP_CLIENT_TIMEOUT_SECS, MCM_CLIENT_VERSION};

const JSON_CONTENT: &str = "application/json";
const VAULT_TOKEN_HEADER: &str = "x-vault-token";

//------------ Auth ----------------------------------------------------------

/// Credentials attached to a request.
#[derive(Clone, Debug)]
pub enum Auth {
    Bearer(String),
    VaultToken(String),
}

//------------ Requests ------------------------------------------------------

/// Performs a GET request that expects a json response that can be
/// deserialized into the an owned value of the expected type. Returns an error
/// if nothing is returned.
pub async fn get_json<T: DeserializeOwned>(uri: &str, auth: Option<&Auth>) -> Result<T, Error> {
    match get_opt_json(uri, auth).await? {
        None => Err(Error::response(uri, "got empty response body")),
        Some(res) => Ok(res),
    }
}

/// Performs a GET request that expects an optional json response. A 404
/// response is treated as "nothing there" rather than an error.
pub async fn get_opt_json<T: DeserializeOwned>(uri: &str, auth: Option<&Auth>) -> Result<Option<T>, Error> {
    let headers = headers(uri, Some(JSON_CONTENT), auth)?;

    let res = client(uri)?
        .get(uri)
        .headers(headers)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    if res.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    process_opt_json_response(uri, res).await
}

/// Performs a POST of data that can be serialized into json, and expects
/// a success response. Any response body is discarded.
pub async fn post_json(uri: &str, data: impl Serialize, auth: Option<&Auth>) -> Result<(), Error> {
    let res = send_json(reqwest::Method::POST, uri, data, auth).await?;
    opt_text_response(uri, res).await.map(|_| ())
}

/// Performs a PUT of data that can be serialized into json, and expects
/// a success response. Any response body is discarded.
pub async fn put_json(uri: &str, data: impl Serialize, auth: Option<&Auth>) -> Result<(), Error> {
    let res = send_json(reqwest::Method::PUT, uri, data, auth).await?;
    opt_text_response(uri, res).await.map(|_| ())
}

/// Performs a POST of data that can be serialized into json, and expects
/// a json response that can be deserialized into the an owned value of the
/// expected type.
pub async fn post_json_with_response<T: DeserializeOwned>(
    uri: &str,
    data: impl Serialize,
    auth: Option<&Auth>,
) -> Result<T, Error> {
    let res = send_json(reqwest::Method::POST, uri, data, auth).await?;
    match process_opt_json_response(uri, res).await? {
        None => Err(Error::response(uri, "expected JSON response")),
        Some(res) => Ok(res),
    }
}

/// Performs a POST of an url encoded form, as used by OAuth token endpoints,
/// and expects a json response.
pub async fn post_form_with_response<T: DeserializeOwned>(uri: &str, form: &[(&str, &str)]) -> Result<T, Error> {
    let headers = headers(uri, None, None)?;
    let res = client(uri)?
        .post(uri)
        .headers(headers)
        .form(form)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match process_opt_json_response(uri, res).await? {
        None => Err(Error::response(uri, "expected JSON response")),
        Some(res) => Ok(res),
    }
}

/// Sends a delete request to the specified url. A 404 response counts as
/// success, there was nothing to delete.
pub async fn delete(uri: &str, auth: Option<&Auth>) -> Result<(), Error> {
    let headers = headers(uri, None, auth)?;
    let res = client(uri)?
        .delete(uri)
        .headers(headers)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))?;

    match res.status() {
        StatusCode::NOT_FOUND => Ok(()),
        status if status.is_success() => Ok(()),
        _ => Err(Error::from_res(uri, res).await),
    }
}

async fn send_json(
    method: reqwest::Method,
    uri: &str,
    data: impl Serialize,
    auth: Option<&Auth>,
) -> Result<Response, Error> {
    let body = serde_json::to_string(&data).map_err(|e| Error::request_build_json(uri, e))?;
    let headers = headers(uri, Some(JSON_CONTENT), auth)?;

    client(uri)?
        .request(method, uri)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))
}

/// Default client for all our use cases.
#[allow(clippy::result_large_err)]
pub fn client(uri: &str) -> Result<reqwest::Client, Error> {
    let builder = reqwest::ClientBuilder::new().timeout(Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS));

    if uri.starts_with("https://localhost") || uri.starts_with("https://127.0.0.1") {
        builder.danger_accept_invalid_certs(true).build()
    } else {
        builder.build()
    }
    .map_err(|e| Error::request_build(uri, e))
}

#[allow(clippy::result_large_err)]
fn headers(uri: &str, content_type: Option<&str>, auth: Option<&Auth>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    let ua = format!("mcm-client/{}", MCM_CLIENT_VERSION);
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&ua).map_err(|e| Error::request_build(uri, e))?,
    );

    if let Some(content_type) = content_type {
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(content_type).map_err(|e| Error::request_build(uri, e))?,
        );
    }
    match auth {
        Some(Auth::Bearer(token)) => {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| Error::request_build(uri, e))?,
            );
        }
        Some(Auth::VaultToken(token)) => {
            headers.insert(
                HeaderName::from_static(VAULT_TOKEN_HEADER),
                HeaderValue::from_str(token).map_err(|e| Error::request_build(uri, e))?,
            );
        }
        None => {}
    }
    Ok(headers)
}

async fn process_opt_json_response<T: DeserializeOwned>(uri: &str, res: Response) -> Result<Option<T>, Error> {
    match opt_text_response(uri, res).await? {
        None => Ok(None),
        Some(s) => {
            let res: T = serde_json::from_str(&s)
                .map_err(|e| Error::response(uri, format!("could not parse JSON response: {}", e)))?;
            Ok(Some(res))
        }
    }
}

async fn opt_text_response(uri: &str, res: Response) -> Result<Option<String>, Error> {
    match res.status() {
        StatusCode::FORBIDDEN => Err(Error::Forbidden(uri.to_string())),
        status if status.is_success() => match res.text().await.ok() {
            None => Ok(None),
            Some(s) => {
                if s.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(s))
                }
            }
        },
        _ => Err(Error::from_res(uri, res).await),
    }
}

//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type ErrorMessage = String;

#[derive(Debug)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),

    RequestExecute(ErrorUri, ErrorMessage),

    Response(ErrorUri, ErrorMessage),
    Forbidden(ErrorUri),
    UnexpectedStatus(ErrorUri, StatusCode),
    ErrorResponseWithBody(ErrorUri, StatusCode, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => write!(f, "Issue creating request for URI: {}, error: {}", uri, msg),
            Error::RequestExecute(uri, msg) => write!(f, "Issue accessing URI: {}, error: {}", uri, msg),
            Error::Response(uri, msg) => write!(f, "Issue processing response from URI: {}, error: {}", uri, msg),
            Error::Forbidden(uri) => write!(f, "Got 'Forbidden' response for URI: {}", uri),
            Error::UnexpectedStatus(uri, code) => {
                write!(f, "Issue processing response from URI: {}, unexpected status code {}", uri, code)
            }
            Error::ErrorResponseWithBody(uri, code, e) => {
                write!(f, "Error response from URI: {}, Status: {}, Error: {}", uri, code, e)
            }
        }
    }
}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_json(uri: &str, e: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), format!("could not serialize type to JSON: {}", e))
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Forbidden(_) => Some(StatusCode::FORBIDDEN),
            Error::UnexpectedStatus(_, status) | Error::ErrorResponseWithBody(_, status, _) => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    async fn from_res(uri: &str, res: Response) -> Error {
        let status = res.status();
        match res.text().await {
            Ok(body) if !body.is_empty() => Error::ErrorResponseWithBody(uri.to_string(), status, body),
            _ => Error::UnexpectedStatus(uri.to_string(), status),
        }
    }
}
