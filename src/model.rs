//! Session state plus every remote operation, routed through the call
//! policies.

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::RwLock,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{Fetched, ResultCache};
use crate::client::{ApiClient, ApiError};
use crate::policy::{self, Policy, PolicyChain, PolicyError, SessionFlags};
use crate::types::{
    Launcher, LauncherDraft, LoginResponse, NewUser, Project, Resource, Role, Scope, Task,
    ToggleAction, UploadedResource, User, UserUpdate,
};

#[derive(Debug, Default)]
struct SessionState {
    online: bool,
    pinned_offline: bool,
    authenticated: bool,
    role: Option<Role>,
    username: Option<String>,
    password: Option<String>,
}

impl SessionState {
    fn flags(&self) -> SessionFlags {
        SessionFlags {
            online: self.online,
            authenticated: self.authenticated,
        }
    }
}

pub struct MainModel {
    client: Option<ApiClient>,
    cache: Option<ResultCache>,
    session: RwLock<SessionState>,
}

impl MainModel {
    pub fn new(client: Option<ApiClient>, cache: Option<ResultCache>) -> Self {
        Self {
            client,
            cache,
            session: RwLock::new(SessionState::default()),
        }
    }

    /// Keeps the session offline no matter what the connectivity probe says.
    pub fn pin_offline(&self) {
        self.with_session(|session| {
            session.pinned_offline = true;
            session.online = false;
        });
    }

    pub fn is_online(&self) -> bool {
        self.read_session(|session| session.online)
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_session(|session| session.authenticated)
    }

    pub fn role(&self) -> Option<Role> {
        self.read_session(|session| session.role)
    }

    pub fn username(&self) -> Option<String> {
        self.read_session(|session| session.username.clone())
    }

    pub fn has_credentials(&self) -> bool {
        self.read_session(|session| session.username.is_some() && session.password.is_some())
    }

    /// Records the probe result. Returns true when the online flag changed.
    pub fn set_online(&self, online: bool) -> bool {
        self.with_session(|session| {
            let next = online && !session.pinned_offline;
            let changed = session.online != next;
            session.online = next;
            changed
        })
    }

    fn flags(&self) -> SessionFlags {
        self.read_session(SessionState::flags)
    }

    fn client(&self) -> Result<&ApiClient, PolicyError> {
        self.client.as_ref().ok_or(PolicyError::NoEndpoint)
    }

    fn read<T, A, F>(&self, name: &str, args: &A, call: F) -> Result<Fetched<T>, PolicyError>
    where
        T: Serialize + DeserializeOwned,
        A: Serialize + std::fmt::Debug + ?Sized,
        F: FnOnce(&ApiClient) -> Result<T, ApiError>,
    {
        self.chain(policy::READ)
            .with_cache(self.cache.as_ref(), name, args)
            .run(|| Ok(call(self.client()?)?))
    }

    fn write<T, F>(&self, call: F) -> Result<T, PolicyError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&ApiClient) -> Result<T, ApiError>,
    {
        let fetched = self.chain(policy::WRITE).run(|| Ok(call(self.client()?)?))?;
        fetched.into_option().ok_or(PolicyError::Offline)
    }

    fn chain(&self, layers: &'static [Policy]) -> PolicyChain<'_> {
        PolicyChain::new(layers, self.flags())
    }

    /// Logs in (or, offline, replays the last successful login for these
    /// credentials) and marks the session authenticated.
    pub fn login(&self, username: &str, password: &str) -> Result<Role, PolicyError> {
        let response = self.prelogin(username, password)?;
        let role = response.role;
        if let Some(client) = &self.client {
            client.set_token(Some(response.token));
        }
        self.with_session(|session| {
            session.username = Some(username.to_string());
            session.password = Some(password.to_string());
            session.authenticated = true;
            session.role = Some(role);
        });
        info!(username, ?role, "session authenticated");
        Ok(role)
    }

    fn prelogin(&self, username: &str, password: &str) -> Result<LoginResponse, PolicyError> {
        let fetched = self
            .chain(policy::LOGIN)
            .with_cache(self.cache.as_ref(), "prelogin", &(username, password))
            .run(|| Ok(self.client()?.login(username, password)?))?;
        match fetched.into_option() {
            Some(response) if !response.token.is_empty() => Ok(response),
            _ => Err(PolicyError::NotAuthenticated),
        }
    }

    /// Logs in again with the remembered credentials, e.g. after the
    /// connection comes back.
    pub fn relogin(&self) -> Result<Option<Role>, PolicyError> {
        let credentials = self.read_session(|session| {
            session.username.clone().zip(session.password.clone())
        });
        match credentials {
            Some((username, password)) => self.login(&username, &password).map(Some),
            None => Ok(None),
        }
    }

    pub fn logout(&self) {
        if let Some(client) = &self.client {
            client.logout();
        }
        self.with_session(|session| {
            session.authenticated = false;
            session.role = None;
            session.username = None;
            session.password = None;
        });
        debug!("session cleared");
    }

    /// Reachability of the service; false without an endpoint.
    pub fn ping(&self) -> bool {
        self.client.as_ref().map(ApiClient::ping).unwrap_or(false)
    }

    pub fn get_all_users(&self) -> Result<Fetched<Vec<User>>, PolicyError> {
        self.read("get_all_users", &(), ApiClient::get_users)
    }

    pub fn add_user(&self, user: &NewUser) -> Result<User, PolicyError> {
        self.write(|client| client.create_user(user))
    }

    pub fn update_user(&self, user_id: i64, update: &UserUpdate) -> Result<User, PolicyError> {
        self.write(|client| client.update_user(user_id, update))
    }

    pub fn delete_user(&self, user_id: i64) -> Result<Value, PolicyError> {
        self.write(|client| client.delete_user(user_id))
    }

    pub fn get_all_projects(&self) -> Result<Fetched<Vec<Project>>, PolicyError> {
        self.read("get_all_projects", &(), ApiClient::get_projects)
    }

    pub fn get_project_members(&self, project_id: i64) -> Result<Fetched<Vec<User>>, PolicyError> {
        self.read("get_project_members", &(project_id,), |client| {
            client.get_project_members(project_id)
        })
    }

    pub fn add_project(&self, name: &str) -> Result<Project, PolicyError> {
        self.write(|client| client.create_project(name))
    }

    pub fn update_project(&self, project_id: i64, name: &str) -> Result<Project, PolicyError> {
        self.write(|client| client.update_project(project_id, name))
    }

    pub fn delete_project(&self, project_id: i64) -> Result<Value, PolicyError> {
        self.write(|client| client.delete_project(project_id))
    }

    pub fn assign_project(&self, project_id: i64, user_ids: &[i64]) -> Result<Value, PolicyError> {
        self.write(|client| client.update_project_members(project_id, user_ids))
    }

    pub fn get_all_tasks(&self, project_id: i64) -> Result<Fetched<Vec<Task>>, PolicyError> {
        self.read("get_all_task", &(project_id,), |client| client.get_tasks(project_id))
    }

    pub fn get_task_members(
        &self,
        project_id: i64,
        task_id: i64,
    ) -> Result<Fetched<Vec<User>>, PolicyError> {
        self.read("get_task_members", &(project_id, task_id), |client| {
            client.get_task_members(project_id, task_id)
        })
    }

    pub fn add_task(
        &self,
        project_id: i64,
        title: &str,
        parent_id: Option<i64>,
    ) -> Result<Task, PolicyError> {
        self.write(|client| client.create_task(project_id, title, parent_id))
    }

    pub fn update_task(&self, project_id: i64, task_id: i64, title: &str) -> Result<Task, PolicyError> {
        self.write(|client| client.update_task(project_id, task_id, title))
    }

    pub fn delete_task(&self, project_id: i64, task_id: i64) -> Result<Value, PolicyError> {
        self.write(|client| client.delete_task(project_id, task_id))
    }

    pub fn assign_task(
        &self,
        project_id: i64,
        task_id: i64,
        user_ids: &[i64],
    ) -> Result<Value, PolicyError> {
        self.write(|client| client.update_task_members(project_id, task_id, user_ids))
    }

    pub fn get_resource(&self, resource_id: i64) -> Result<Fetched<Resource>, PolicyError> {
        self.read("get_resource", &(resource_id,), |client| {
            client.get_resource(resource_id)
        })
    }

    pub fn upload_resource(
        &self,
        file_path: &Path,
        resource_type: &str,
    ) -> Result<UploadedResource, PolicyError> {
        self.write(|client| client.upload_resource(file_path, resource_type))
    }

    pub fn get_launchers(&self, scope: Scope) -> Result<Fetched<Vec<Launcher>>, PolicyError> {
        self.read("get_launchers", &scope, |client| client.get_launchers(scope))
    }

    pub fn create_launcher(&self, draft: &LauncherDraft) -> Result<Launcher, PolicyError> {
        self.write(|client| client.create_launcher(draft))
    }

    pub fn update_launcher(&self, launcher_id: i64, draft: &LauncherDraft) -> Result<Launcher, PolicyError> {
        self.write(|client| client.update_launcher(launcher_id, draft))
    }

    pub fn delete_launcher(&self, launcher_id: i64, scope: Scope) -> Result<Value, PolicyError> {
        self.write(|client| client.delete_launcher(launcher_id, scope))
    }

    pub fn toggle_launcher(
        &self,
        launcher_id: i64,
        scope: Scope,
        action: ToggleAction,
    ) -> Result<Value, PolicyError> {
        self.write(|client| client.toggle_launcher(launcher_id, scope, action))
    }

    fn read_session<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        match self.session.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn with_session<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        match self.session.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNode {
    pub task: Task,
    pub children: Vec<TaskNode>,
}

/// Nests a flat task list by `parent_id`. Tasks whose parent is absent, and
/// tasks caught in a parent cycle, become roots. Siblings are ordered by id.
pub fn build_task_tree(tasks: &[Task]) -> Vec<TaskNode> {
    let known = tasks.iter().map(|task| task.id).collect::<HashSet<_>>();
    let mut children: BTreeMap<Option<i64>, Vec<&Task>> = BTreeMap::new();
    for task in tasks {
        let parent = task.parent_id.filter(|id| known.contains(id) && *id != task.id);
        children.entry(parent).or_default().push(task);
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|task| task.id);
    }

    let mut visited = HashSet::new();
    let mut roots = children
        .get(&None)
        .map(|roots| {
            roots
                .iter()
                .map(|task| attach(task, &children, &mut visited))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut stranded = tasks
        .iter()
        .filter(|task| !visited.contains(&task.id))
        .collect::<Vec<_>>();
    stranded.sort_by_key(|task| task.id);
    for task in stranded {
        if !visited.contains(&task.id) {
            roots.push(attach(task, &children, &mut visited));
        }
    }
    roots
}

fn attach(
    task: &Task,
    children: &BTreeMap<Option<i64>, Vec<&Task>>,
    visited: &mut HashSet<i64>,
) -> TaskNode {
    visited.insert(task.id);
    let kids = children.get(&Some(task.id)).cloned().unwrap_or_default();
    let nested = kids
        .into_iter()
        .filter_map(|kid| (!visited.contains(&kid.id)).then(|| attach(kid, children, visited)))
        .collect();
    TaskNode {
        task: task.clone(),
        children: nested,
    }
}
