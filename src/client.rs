//! Blocking client for the remote project/task service.

use std::{
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

use reqwest::{
    StatusCode, Url,
    blocking::{Client, RequestBuilder, multipart},
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::types::{
    Launcher, LauncherDraft, LoginResponse, NewUser, Project, Resource, Scope, Task, ToggleAction,
    UploadedResource, User, UserUpdate,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication failed")]
    Unauthorized,
    #[error("permission denied")]
    Forbidden,
    #[error("{message} (status {status})")]
    Service {
        status: u16,
        message: String,
        error_code: Option<i64>,
    },
    #[error("invalid service URL {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

pub struct ApiClient {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|_| ApiError::InvalidUrl(base_url.clone()))?;
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }

    pub fn set_token(&self, token: Option<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = token;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let response = self.authorized(request).send()?;
        let status = response.status();
        let body = response.bytes()?;
        decode_response(status, &body)
    }

    /// `POST /auth/login`; keeps the returned bearer token for later calls.
    pub fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let request = self
            .http
            .post(self.url("/auth/login"))
            .timeout(LOGIN_TIMEOUT)
            .json(&json!({ "username": username, "password": password }));
        let response: LoginResponse = self.send(request)?;
        self.set_token(Some(response.token.clone()));
        debug!(username, role = ?response.role, "login succeeded");
        Ok(response)
    }

    pub fn logout(&self) {
        self.set_token(None);
    }

    /// Probes `<scheme>://<host>/ping`. Only 200 and 204 count as reachable.
    pub fn ping(&self) -> bool {
        let Some(url) = ping_url(&self.base_url) else {
            return false;
        };
        match self.http.get(url).timeout(PING_TIMEOUT).send() {
            Ok(response) => matches!(response.status(), StatusCode::OK | StatusCode::NO_CONTENT),
            Err(_) => false,
        }
    }

    pub fn get_users(&self) -> Result<Vec<User>, ApiError> {
        self.send(self.http.get(self.url("/users")))
    }

    pub fn create_user(&self, user: &NewUser) -> Result<User, ApiError> {
        self.send(self.http.post(self.url("/users")).json(user))
    }

    pub fn update_user(&self, user_id: i64, update: &UserUpdate) -> Result<User, ApiError> {
        self.send(self.http.put(self.url(&format!("/users/{user_id}"))).json(update))
    }

    pub fn delete_user(&self, user_id: i64) -> Result<Value, ApiError> {
        self.send(self.http.delete(self.url(&format!("/users/{user_id}"))))
    }

    pub fn get_projects(&self) -> Result<Vec<Project>, ApiError> {
        self.send(self.http.get(self.url("/projects")))
    }

    pub fn create_project(&self, name: &str) -> Result<Project, ApiError> {
        self.send(self.http.post(self.url("/projects")).json(&json!({ "name": name })))
    }

    pub fn update_project(&self, project_id: i64, name: &str) -> Result<Project, ApiError> {
        self.send(
            self.http
                .put(self.url(&format!("/projects/{project_id}")))
                .json(&json!({ "name": name })),
        )
    }

    pub fn delete_project(&self, project_id: i64) -> Result<Value, ApiError> {
        self.send(self.http.delete(self.url(&format!("/projects/{project_id}"))))
    }

    pub fn get_project_members(&self, project_id: i64) -> Result<Vec<User>, ApiError> {
        self.send(self.http.get(self.url(&format!("/projects/{project_id}/members"))))
    }

    pub fn update_project_members(
        &self,
        project_id: i64,
        user_ids: &[i64],
    ) -> Result<Value, ApiError> {
        self.send(
            self.http
                .put(self.url(&format!("/projects/{project_id}/members/batch")))
                .json(&json!({ "user_ids": user_ids })),
        )
    }

    pub fn get_tasks(&self, project_id: i64) -> Result<Vec<Task>, ApiError> {
        self.send(self.http.get(self.url(&format!("/projects/{project_id}/tasks"))))
    }

    pub fn create_task(
        &self,
        project_id: i64,
        title: &str,
        parent_id: Option<i64>,
    ) -> Result<Task, ApiError> {
        self.send(
            self.http
                .post(self.url(&format!("/projects/{project_id}/tasks")))
                .json(&json!({ "title": title, "parent_id": parent_id })),
        )
    }

    pub fn update_task(&self, project_id: i64, task_id: i64, title: &str) -> Result<Task, ApiError> {
        self.send(
            self.http
                .put(self.url(&format!("/projects/{project_id}/tasks/{task_id}")))
                .json(&json!({ "title": title })),
        )
    }

    pub fn delete_task(&self, project_id: i64, task_id: i64) -> Result<Value, ApiError> {
        self.send(
            self.http
                .delete(self.url(&format!("/projects/{project_id}/tasks/{task_id}"))),
        )
    }

    pub fn get_task_members(&self, project_id: i64, task_id: i64) -> Result<Vec<User>, ApiError> {
        self.send(
            self.http
                .get(self.url(&format!("/projects/{project_id}/tasks/{task_id}/members"))),
        )
    }

    pub fn update_task_members(
        &self,
        project_id: i64,
        task_id: i64,
        user_ids: &[i64],
    ) -> Result<Value, ApiError> {
        self.send(
            self.http
                .put(self.url(&format!(
                    "/projects/{project_id}/tasks/{task_id}/members/batch"
                )))
                .json(&json!({ "user_ids": user_ids })),
        )
    }

    pub fn get_launchers(&self, scope: Scope) -> Result<Vec<Launcher>, ApiError> {
        let request = self
            .http
            .get(self.url("/launchers"))
            .query(&scope_params(scope, None));
        self.send(request)
    }

    pub fn create_launcher(&self, draft: &LauncherDraft) -> Result<Launcher, ApiError> {
        self.send(self.http.post(self.url("/launchers")).json(draft))
    }

    pub fn update_launcher(
        &self,
        launcher_id: i64,
        draft: &LauncherDraft,
    ) -> Result<Launcher, ApiError> {
        self.send(
            self.http
                .put(self.url(&format!("/launchers/{launcher_id}")))
                .json(draft),
        )
    }

    pub fn delete_launcher(&self, launcher_id: i64, scope: Scope) -> Result<Value, ApiError> {
        self.send(
            self.http
                .delete(self.url(&format!("/launchers/{launcher_id}")))
                .query(&scope_params(scope, None)),
        )
    }

    pub fn toggle_launcher(
        &self,
        launcher_id: i64,
        scope: Scope,
        action: ToggleAction,
    ) -> Result<Value, ApiError> {
        self.send(
            self.http
                .post(self.url(&format!("/launchers/{launcher_id}/toggle")))
                .query(&scope_params(scope, Some(action))),
        )
    }

    /// Fetches raw resource bytes; the format comes from `X-Resource-Format`.
    pub fn get_resource(&self, resource_id: i64) -> Result<Resource, ApiError> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/resources/{resource_id}"))))
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.bytes()?;
            return decode_response(status, &body);
        }
        let format = response
            .headers()
            .get("X-Resource-Format")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("PNG")
            .to_string();
        let data = response.bytes()?.to_vec();
        Ok(Resource { data, format })
    }

    pub fn upload_resource(
        &self,
        file_path: &Path,
        resource_type: &str,
    ) -> Result<UploadedResource, ApiError> {
        let form = multipart::Form::new()
            .text("type", resource_type.to_string())
            .file("file", file_path)
            .map_err(|source| ApiError::File {
                path: file_path.to_path_buf(),
                source,
            })?;
        self.send(
            self.http
                .post(self.url("/resources/upload"))
                .multipart(form),
        )
    }
}

fn scope_params(scope: Scope, action: Option<ToggleAction>) -> Vec<(&'static str, String)> {
    let mut params = vec![("project_id", scope.project_id.to_string())];
    if let Some(task_id) = scope.task_id {
        params.push(("task_id", task_id.to_string()));
    }
    if let Some(action) = action {
        params.push(("action", action.as_str().to_string()));
    }
    params
}

/// Maps a status and body onto a value or an [`ApiError`].
pub fn decode_response<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> Result<T, ApiError> {
    match status {
        StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
        StatusCode::FORBIDDEN => return Err(ApiError::Forbidden),
        _ => {}
    }
    if status.is_client_error() || status.is_server_error() {
        let parsed = serde_json::from_slice::<ErrorBody>(body).ok();
        let (message, error_code) = match parsed {
            Some(ErrorBody { error, error_code }) => {
                (error.unwrap_or_else(|| "Unknown error".to_string()), error_code)
            }
            None => ("Unknown error".to_string(), None),
        };
        return Err(ApiError::Service {
            status: status.as_u16(),
            message,
            error_code,
        });
    }
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|err| ApiError::Service {
        status: status.as_u16(),
        message: format!("malformed response body: {err}"),
        error_code: None,
    })
}

/// Origin of `base_url` with `/ping` appended.
pub fn ping_url(base_url: &str) -> Option<String> {
    let parsed = Url::parse(base_url).ok()?;
    let host = parsed.host_str()?;
    let origin = match parsed.port() {
        Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
        None => format!("{}://{host}", parsed.scheme()),
    };
    Some(format!("{origin}/ping"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_url_uses_origin_only() {
        assert_eq!(
            ping_url("https://svc.example.com/api/v1").as_deref(),
            Some("https://svc.example.com/ping")
        );
        assert_eq!(
            ping_url("http://127.0.0.1:8765/api").as_deref(),
            Some("http://127.0.0.1:8765/ping")
        );
        assert_eq!(ping_url("not a url"), None);
    }

    #[test]
    fn status_codes_map_to_errors() {
        let err = decode_response::<Value>(StatusCode::UNAUTHORIZED, b"").unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        let err = decode_response::<Value>(StatusCode::FORBIDDEN, b"{}").unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));

        let err = decode_response::<Value>(
            StatusCode::CONFLICT,
            br#"{"error": "name taken", "error_code": 1002}"#,
        )
        .unwrap_err();
        match err {
            ApiError::Service {
                status,
                message,
                error_code,
            } => {
                assert_eq!(status, 409);
                assert_eq!(message, "name taken");
                assert_eq!(error_code, Some(1002));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_success_body_decodes_as_null() {
        let value = decode_response::<Value>(StatusCode::NO_CONTENT, b"").unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn scope_params_include_optional_fields() {
        let params = scope_params(
            Scope {
                project_id: 2,
                task_id: Some(5),
            },
            Some(ToggleAction::Enable),
        );
        assert_eq!(
            params,
            vec![
                ("project_id", "2".to_string()),
                ("task_id", "5".to_string()),
                ("action", "enable".to_string()),
            ]
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(matches!(
            ApiClient::new("::nope::"),
            Err(ApiError::InvalidUrl(_))
        ));
    }
}
