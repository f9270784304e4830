//! In-memory stand-in for the project/task service, for local development and
//! integration tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};

use crate::types::{
    Launcher, LauncherDraft, LauncherVersion, LoginResponse, NewUser, Project, Role, Task,
    ToggleAction, UploadedResource, User, UserUpdate,
};

/// Seeded administrator credentials.
pub const DEV_ADMIN: (&str, &str) = ("admin", "admin");

#[derive(Debug)]
pub struct ServiceError {
    status: StatusCode,
    message: String,
    code: Option<i64>,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Authentication required")
    }

    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Permission denied")
    }

    fn not_found(what: &str, id: i64) -> Self {
        Self {
            code: Some(404),
            ..Self::new(StatusCode::NOT_FOUND, format!("{what} {id} not found"))
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: Some(400),
            ..Self::new(StatusCode::BAD_REQUEST, message)
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "error_code": self.code }));
        (self.status, body).into_response()
    }
}

type AppResult<T> = Result<T, ServiceError>;

struct UserRecord {
    user: User,
    password: String,
}

struct StoredResource {
    format: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct Store {
    next_id: i64,
    users: BTreeMap<i64, UserRecord>,
    tokens: HashMap<String, i64>,
    projects: BTreeMap<i64, Project>,
    project_members: HashMap<i64, BTreeSet<i64>>,
    tasks: BTreeMap<i64, Task>,
    task_members: HashMap<i64, BTreeSet<i64>>,
    launchers: BTreeMap<i64, Launcher>,
    resources: BTreeMap<i64, StoredResource>,
}

impl Store {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_user(&mut self, username: &str, password: &str, email: &str, role: Role) -> User {
        let user = User {
            id: self.allocate(),
            username: username.to_string(),
            email: email.to_string(),
            role,
        };
        self.users.insert(
            user.id,
            UserRecord {
                user: user.clone(),
                password: password.to_string(),
            },
        );
        user
    }

    fn project(&self, project_id: i64) -> AppResult<&Project> {
        self.projects
            .get(&project_id)
            .ok_or_else(|| ServiceError::not_found("project", project_id))
    }

    fn task_in(&self, project_id: i64, task_id: i64) -> AppResult<&Task> {
        self.tasks
            .get(&task_id)
            .filter(|task| task.project_id == Some(project_id))
            .ok_or_else(|| ServiceError::not_found("task", task_id))
    }

    fn members(&self, ids: Option<&BTreeSet<i64>>) -> Vec<User> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.users.get(id))
            .map(|record| record.user.clone())
            .collect()
    }
}

pub struct DevState {
    store: RwLock<Store>,
    issued: AtomicU64,
}

impl DevState {
    /// An admin account, one project with a small task tree and a launcher.
    pub fn seeded() -> Self {
        let mut store = Store::default();
        let admin = store.add_user(DEV_ADMIN.0, DEV_ADMIN.1, "admin@localhost", Role::Admin);
        let artist = store.add_user("artist", "artist", "artist@localhost", Role::Member);

        let project = Project {
            id: store.allocate(),
            name: "demo".into(),
            description: Some("Seeded development project".into()),
        };
        let root = Task {
            id: store.allocate(),
            title: "layout".into(),
            project_id: Some(project.id),
            parent_id: None,
            status: Some("open".into()),
        };
        let child = Task {
            id: store.allocate(),
            title: "layout-shot010".into(),
            project_id: Some(project.id),
            parent_id: Some(root.id),
            status: Some("open".into()),
        };
        let mut vdata = BTreeMap::new();
        vdata.insert(
            "default".to_string(),
            LauncherVersion {
                command: "echo launched".into(),
                icon: None,
            },
        );
        let launcher = Launcher {
            id: store.allocate(),
            name: "echo".into(),
            vdata,
            enabled: true,
            project_id: Some(project.id),
            task_id: None,
        };

        store
            .project_members
            .insert(project.id, BTreeSet::from([admin.id, artist.id]));
        store.projects.insert(project.id, project);
        store.tasks.insert(root.id, root);
        store.tasks.insert(child.id, child);
        store.launchers.insert(launcher.id, launcher);

        Self {
            store: RwLock::new(store),
            issued: AtomicU64::new(0),
        }
    }

    fn issue_token(&self, username: &str) -> String {
        let serial = self.issued.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(serial.to_le_bytes());
        format!("dev-{}", hex::encode(&hasher.finalize()[..16]))
    }

    async fn caller(&self, headers: &HeaderMap) -> AppResult<User> {
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(ServiceError::unauthorized)?;
        let store = self.store.read().await;
        store
            .tokens
            .get(token)
            .and_then(|id| store.users.get(id))
            .map(|record| record.user.clone())
            .ok_or_else(ServiceError::unauthorized)
    }

    async fn caller_with(&self, headers: &HeaderMap, role: Role) -> AppResult<User> {
        let user = self.caller(headers).await?;
        if user.role >= role {
            Ok(user)
        } else {
            Err(ServiceError::forbidden())
        }
    }
}

pub type SharedState = Arc<DevState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/auth/login", post(login_handler))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:user_id", put(update_user).delete(delete_user))
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:project_id", put(update_project).delete(delete_project))
        .route("/projects/:project_id/members", get(project_members))
        .route("/projects/:project_id/members/batch", put(set_project_members))
        .route("/projects/:project_id/tasks", get(list_tasks).post(create_task))
        .route(
            "/projects/:project_id/tasks/:task_id",
            put(update_task).delete(delete_task),
        )
        .route("/projects/:project_id/tasks/:task_id/members", get(task_members))
        .route(
            "/projects/:project_id/tasks/:task_id/members/batch",
            put(set_task_members),
        )
        .route("/launchers", get(list_launchers).post(create_launcher))
        .route("/launchers/:launcher_id", put(update_launcher).delete(delete_launcher))
        .route("/launchers/:launcher_id/toggle", post(toggle_launcher))
        .route("/resources/upload", post(upload_resource))
        .route("/resources/:resource_id", get(get_resource))
        .with_state(state)
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: SharedState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!(%addr, "development service listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Development service crashed")
}

#[derive(Deserialize)]
struct LoginPayload {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct NamePayload {
    name: String,
}

#[derive(Deserialize)]
struct TitlePayload {
    title: String,
}

#[derive(Deserialize)]
struct NewTaskPayload {
    title: String,
    #[serde(default)]
    parent_id: Option<i64>,
}

#[derive(Deserialize)]
struct MembersPayload {
    user_ids: Vec<i64>,
}

#[derive(Deserialize)]
struct ScopeQuery {
    project_id: i64,
    #[serde(default)]
    task_id: Option<i64>,
}

#[derive(Deserialize)]
struct ToggleQuery {
    action: ToggleAction,
}

async fn ping_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn login_handler(
    State(state): State<SharedState>,
    Json(payload): Json<LoginPayload>,
) -> AppResult<Json<LoginResponse>> {
    let user = {
        let store = state.store.read().await;
        store
            .users
            .values()
            .find(|record| {
                record.user.username == payload.username && record.password == payload.password
            })
            .map(|record| record.user.clone())
            .ok_or_else(|| ServiceError::new(StatusCode::UNAUTHORIZED, "Invalid credentials"))?
    };
    let token = state.issue_token(&user.username);
    state.store.write().await.tokens.insert(token.clone(), user.id);
    debug!(username = %user.username, "issued token");
    Ok(Json(LoginResponse {
        token,
        role: user.role,
    }))
}

async fn list_users(State(state): State<SharedState>, headers: HeaderMap) -> AppResult<Json<Vec<User>>> {
    state.caller_with(&headers, Role::Manager).await?;
    let store = state.store.read().await;
    Ok(Json(store.users.values().map(|record| record.user.clone()).collect()))
}

async fn create_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<NewUser>,
) -> AppResult<Json<User>> {
    state.caller_with(&headers, Role::Admin).await?;
    let username = payload.username.trim();
    if username.is_empty() {
        return Err(ServiceError::bad_request("Username is required"));
    }
    let mut store = state.store.write().await;
    if store.users.values().any(|record| record.user.username == username) {
        return Err(ServiceError::bad_request(format!("User {username} already exists")));
    }
    Ok(Json(store.add_user(username, &payload.password, &payload.email, payload.role)))
}

async fn update_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    Json(payload): Json<UserUpdate>,
) -> AppResult<Json<User>> {
    state.caller_with(&headers, Role::Admin).await?;
    let mut store = state.store.write().await;
    let record = store
        .users
        .get_mut(&user_id)
        .ok_or_else(|| ServiceError::not_found("user", user_id))?;
    if let Some(username) = payload.username {
        record.user.username = username;
    }
    if let Some(password) = payload.password {
        record.password = password;
    }
    if let Some(email) = payload.email {
        record.user.email = email;
    }
    if let Some(role) = payload.role {
        record.user.role = role;
    }
    Ok(Json(record.user.clone()))
}

async fn delete_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Admin).await?;
    let mut guard = state.store.write().await;
    let store = &mut *guard;
    store
        .users
        .remove(&user_id)
        .ok_or_else(|| ServiceError::not_found("user", user_id))?;
    store.tokens.retain(|_, id| *id != user_id);
    for members in store
        .project_members
        .values_mut()
        .chain(store.task_members.values_mut())
    {
        members.remove(&user_id);
    }
    Ok(Json(json!({ "deleted": user_id })))
}

async fn list_projects(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> AppResult<Json<Vec<Project>>> {
    let caller = state.caller(&headers).await?;
    let store = state.store.read().await;
    let visible = store
        .projects
        .values()
        .filter(|project| {
            caller.role.can_manage()
                || store
                    .project_members
                    .get(&project.id)
                    .is_some_and(|members| members.contains(&caller.id))
        })
        .cloned()
        .collect();
    Ok(Json(visible))
}

async fn create_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<NamePayload>,
) -> AppResult<Json<Project>> {
    let caller = state.caller_with(&headers, Role::Manager).await?;
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(ServiceError::bad_request("Project name is required"));
    }
    let mut store = state.store.write().await;
    let project = Project {
        id: store.allocate(),
        name: name.to_string(),
        description: None,
    };
    store
        .project_members
        .insert(project.id, BTreeSet::from([caller.id]));
    store.projects.insert(project.id, project.clone());
    Ok(Json(project))
}

async fn update_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
    Json(payload): Json<NamePayload>,
) -> AppResult<Json<Project>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    let project = store
        .projects
        .get_mut(&project_id)
        .ok_or_else(|| ServiceError::not_found("project", project_id))?;
    project.name = payload.name;
    Ok(Json(project.clone()))
}

async fn delete_project(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store
        .projects
        .remove(&project_id)
        .ok_or_else(|| ServiceError::not_found("project", project_id))?;
    store.project_members.remove(&project_id);
    store.tasks.retain(|_, task| task.project_id != Some(project_id));
    store
        .launchers
        .retain(|_, launcher| launcher.project_id != Some(project_id));
    Ok(Json(json!({ "deleted": project_id })))
}

async fn project_members(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
) -> AppResult<Json<Vec<User>>> {
    state.caller(&headers).await?;
    let store = state.store.read().await;
    store.project(project_id)?;
    Ok(Json(store.members(store.project_members.get(&project_id))))
}

async fn set_project_members(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
    Json(payload): Json<MembersPayload>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.project(project_id)?;
    let members = payload
        .user_ids
        .into_iter()
        .filter(|id| store.users.contains_key(id))
        .collect::<BTreeSet<_>>();
    let count = members.len();
    store.project_members.insert(project_id, members);
    Ok(Json(json!({ "project_id": project_id, "members": count })))
}

async fn list_tasks(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
) -> AppResult<Json<Vec<Task>>> {
    state.caller(&headers).await?;
    let store = state.store.read().await;
    store.project(project_id)?;
    Ok(Json(
        store
            .tasks
            .values()
            .filter(|task| task.project_id == Some(project_id))
            .cloned()
            .collect(),
    ))
}

async fn create_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(project_id): Path<i64>,
    Json(payload): Json<NewTaskPayload>,
) -> AppResult<Json<Task>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.project(project_id)?;
    if let Some(parent_id) = payload.parent_id {
        store.task_in(project_id, parent_id)?;
    }
    let task = Task {
        id: store.allocate(),
        title: payload.title,
        project_id: Some(project_id),
        parent_id: payload.parent_id,
        status: Some("open".into()),
    };
    store.tasks.insert(task.id, task.clone());
    Ok(Json(task))
}

async fn update_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project_id, task_id)): Path<(i64, i64)>,
    Json(payload): Json<TitlePayload>,
) -> AppResult<Json<Task>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.task_in(project_id, task_id)?;
    let task = store
        .tasks
        .get_mut(&task_id)
        .ok_or_else(|| ServiceError::not_found("task", task_id))?;
    task.title = payload.title;
    Ok(Json(task.clone()))
}

async fn delete_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project_id, task_id)): Path<(i64, i64)>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.task_in(project_id, task_id)?;
    store.tasks.remove(&task_id);
    store.task_members.remove(&task_id);
    Ok(Json(json!({ "deleted": task_id })))
}

async fn task_members(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project_id, task_id)): Path<(i64, i64)>,
) -> AppResult<Json<Vec<User>>> {
    state.caller(&headers).await?;
    let store = state.store.read().await;
    store.task_in(project_id, task_id)?;
    Ok(Json(store.members(store.task_members.get(&task_id))))
}

async fn set_task_members(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path((project_id, task_id)): Path<(i64, i64)>,
    Json(payload): Json<MembersPayload>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.task_in(project_id, task_id)?;
    let members = payload
        .user_ids
        .into_iter()
        .filter(|id| store.users.contains_key(id))
        .collect::<BTreeSet<_>>();
    let count = members.len();
    store.task_members.insert(task_id, members);
    Ok(Json(json!({ "task_id": task_id, "members": count })))
}

async fn list_launchers(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(scope): Query<ScopeQuery>,
) -> AppResult<Json<Vec<Launcher>>> {
    state.caller(&headers).await?;
    let store = state.store.read().await;
    Ok(Json(
        store
            .launchers
            .values()
            .filter(|launcher| {
                launcher.project_id == Some(scope.project_id) && launcher.task_id == scope.task_id
            })
            .cloned()
            .collect(),
    ))
}

async fn create_launcher(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(draft): Json<LauncherDraft>,
) -> AppResult<Json<Launcher>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    store.project(draft.project_id)?;
    let launcher = Launcher {
        id: store.allocate(),
        name: draft.name,
        vdata: draft.vdata,
        enabled: true,
        project_id: Some(draft.project_id),
        task_id: draft.task_id,
    };
    store.launchers.insert(launcher.id, launcher.clone());
    Ok(Json(launcher))
}

async fn update_launcher(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(launcher_id): Path<i64>,
    Json(draft): Json<LauncherDraft>,
) -> AppResult<Json<Launcher>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    let launcher = store
        .launchers
        .get_mut(&launcher_id)
        .ok_or_else(|| ServiceError::not_found("launcher", launcher_id))?;
    launcher.name = draft.name;
    launcher.vdata = draft.vdata;
    launcher.project_id = Some(draft.project_id);
    launcher.task_id = draft.task_id;
    Ok(Json(launcher.clone()))
}

async fn delete_launcher(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(launcher_id): Path<i64>,
    Query(scope): Query<ScopeQuery>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    let in_scope = store
        .launchers
        .get(&launcher_id)
        .is_some_and(|launcher| launcher.project_id == Some(scope.project_id));
    if !in_scope {
        return Err(ServiceError::not_found("launcher", launcher_id));
    }
    store.launchers.remove(&launcher_id);
    Ok(Json(json!({ "deleted": launcher_id })))
}

async fn toggle_launcher(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(launcher_id): Path<i64>,
    Query(toggle): Query<ToggleQuery>,
) -> AppResult<Json<Value>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut store = state.store.write().await;
    let launcher = store
        .launchers
        .get_mut(&launcher_id)
        .ok_or_else(|| ServiceError::not_found("launcher", launcher_id))?;
    launcher.enabled = toggle.action == ToggleAction::Enable;
    Ok(Json(json!({ "id": launcher_id, "enabled": launcher.enabled })))
}

async fn get_resource(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(resource_id): Path<i64>,
) -> AppResult<Response> {
    state.caller(&headers).await?;
    let store = state.store.read().await;
    let resource = store
        .resources
        .get(&resource_id)
        .ok_or_else(|| ServiceError::not_found("resource", resource_id))?;
    Ok((
        StatusCode::OK,
        [("X-Resource-Format", resource.format.clone())],
        resource.data.clone(),
    )
        .into_response())
}

async fn upload_resource(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<Json<UploadedResource>> {
    state.caller_with(&headers, Role::Manager).await?;
    let mut kind = None;
    let mut file_format = None;
    let mut data = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ServiceError::bad_request(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        let file_ext = field
            .file_name()
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_uppercase());
        match name.as_deref() {
            Some("type") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ServiceError::bad_request(err.to_string()))?;
                kind = Some(text.trim().to_ascii_uppercase());
            }
            Some("file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ServiceError::bad_request(err.to_string()))?;
                data = Some(bytes.to_vec());
                file_format = file_ext;
            }
            _ => {}
        }
    }
    let data = data.ok_or_else(|| ServiceError::bad_request("Missing file field"))?;

    let mut store = state.store.write().await;
    let id = store.allocate();
    store.resources.insert(
        id,
        StoredResource {
            format: file_format.or(kind).unwrap_or_else(|| "PNG".to_string()),
            data,
        },
    );
    Ok(Json(UploadedResource {
        id,
        path: Some(format!("/resources/{id}")),
    }))
}
