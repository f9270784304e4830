//! Headless front-end state.
//!
//! [`Shell`] is the UI-thread context: every continuation from the task
//! runner, every handoff from another launch and every console command runs
//! against it on one thread. Blocking work is always submitted to the runner.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::{Fetched, ResultCache};
use crate::checks::{self, HttpReleaseFeed, ReleaseSource, StatusTracker, UpdateNotice};
use crate::config::AppConfig;
use crate::env_state::EnvState;
use crate::instance::{Handoff, WindowControl, activate_window};
use crate::launch::{self, OutputSink, ProcessLauncher, VersionStep};
use crate::model::{MainModel, TaskNode, build_task_tree};
use crate::policy::PolicyError;
use crate::runner::{TaskRequest, TaskRunner, UiSender};
use crate::scheduler::{CheckSink, ScheduledCheck};
use crate::settings::{AppSettings, SettingsStore};
use crate::types::{
    Launcher, LauncherDraft, LauncherVersion, NewUser, Project, Role, Scope, Task, ToggleAction,
    User, UserUpdate,
};

/// Data currently shown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub projects: Vec<Project>,
    pub tasks: Vec<Task>,
    pub launchers: Vec<Launcher>,
}

/// One refresh round trip, tagged with the selection it was fetched for.
#[derive(Debug)]
pub struct ViewFetch {
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub projects: Fetched<Vec<Project>>,
    pub tasks: Fetched<Vec<Task>>,
    pub launchers: Fetched<Vec<Launcher>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub project_id: Option<i64>,
    pub task_id: Option<i64>,
    pub launcher: Option<usize>,
    versions: HashMap<i64, usize>,
}

impl Selection {
    pub fn version_of(&self, launcher_id: i64) -> usize {
        self.versions.get(&launcher_id).copied().unwrap_or(0)
    }
}

/// Window state for a terminal front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleWindow {
    pub minimized: bool,
    pub visible: bool,
    pub activations: usize,
}

impl Default for ConsoleWindow {
    fn default() -> Self {
        Self {
            minimized: false,
            visible: true,
            activations: 0,
        }
    }
}

impl WindowControl for ConsoleWindow {
    fn is_minimized(&self) -> bool {
        self.minimized
    }

    fn unminimize(&mut self) {
        self.minimized = false;
    }

    fn is_visible(&self) -> bool {
        self.visible
    }

    fn show(&mut self) {
        self.visible = true;
    }

    fn raise(&mut self) {}

    fn focus(&mut self) {
        self.activations += 1;
    }
}

pub struct Shell {
    model: Arc<MainModel>,
    env: EnvState,
    config: Arc<AppConfig>,
    settings: SettingsStore,
    prefs: AppSettings,
    runner: TaskRunner<Shell>,
    launcher: ProcessLauncher,
    view: ViewState,
    selection: Selection,
    status: StatusTracker,
    update: UpdateNotice,
    window: ConsoleWindow,
    messages: Vec<String>,
    quit: bool,
}

impl Shell {
    pub fn new(
        model: Arc<MainModel>,
        env: EnvState,
        config: Arc<AppConfig>,
        settings: SettingsStore,
        runner: TaskRunner<Shell>,
    ) -> Self {
        let prefs = settings.load().unwrap_or_else(|err| {
            warn!(error = %err, "using default settings");
            AppSettings::default()
        });
        if env.is_truthy(&config.mode_keys.offline) {
            info!(key = %config.mode_keys.offline, "offline marker set; staying offline");
            model.pin_offline();
        }
        let launcher = ProcessLauncher::new(env.clone(), config.launch_keys.clone());
        let selection = Selection {
            project_id: prefs.project_id,
            task_id: prefs.task_id,
            ..Selection::default()
        };

        Self {
            model,
            env,
            config,
            settings,
            prefs,
            runner,
            launcher,
            view: ViewState::default(),
            selection,
            status: StatusTracker::default(),
            update: UpdateNotice::default(),
            window: ConsoleWindow::default(),
            messages: Vec::new(),
            quit: false,
        }
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn env(&self) -> &EnvState {
        &self.env
    }

    pub fn window(&self) -> &ConsoleWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut ConsoleWindow {
        &mut self.window
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn notify(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn take_messages(&mut self) -> Vec<String> {
        std::mem::take(&mut self.messages)
    }

    fn save_prefs(&mut self) {
        if let Err(err) = self.settings.save(&self.prefs) {
            warn!(error = %err, "failed to save settings");
        }
    }

    /// Merges a forwarded environment and brings the window forward.
    pub fn receive_handoff(&mut self, handoff: Handoff) {
        if let Handoff::Environment(vars) = handoff {
            let report = self.env.apply_handoff(vars, &self.config.mode_keys);
            self.notify(format!(
                "another launch forwarded {} variable(s)",
                report.applied
            ));
        }
        activate_window(&mut self.window);
    }

    /// Interprets a connectivity probe result. Only a change of the online
    /// state causes work.
    pub fn apply_status(&mut self, reachable: bool) {
        self.model.set_online(reachable);
        let online = self.model.is_online();
        if !self.status.observe(online) {
            return;
        }
        self.notify(if online { "service online" } else { "service offline" });
        if !online {
            return;
        }

        if self.model.has_credentials() {
            let model = Arc::clone(&self.model);
            self.runner.submit(
                TaskRequest::new("relogin", move || Ok(model.relogin()?))
                    .on_success(|shell: &mut Shell, _role| shell.request_refresh())
                    .on_error(|shell: &mut Shell, err| {
                        shell.notify(format!("login after reconnect failed: {err}"))
                    }),
            );
        } else {
            self.request_refresh();
        }
    }

    /// Offers an update notice; shown once per process.
    pub fn offer_update(&mut self, latest: &str) {
        if let Some(message) = self.update.offer(latest) {
            self.notify(message);
        }
    }

    /// Re-fetches the view for the current selection in the background.
    pub fn request_refresh(&mut self) {
        if !self.model.is_authenticated() {
            debug!("refresh skipped; not logged in");
            return;
        }
        let model = Arc::clone(&self.model);
        let (project_id, task_id) = (self.selection.project_id, self.selection.task_id);
        self.runner.submit(
            TaskRequest::new("refresh", move || fetch_view(&model, project_id, task_id))
                .quiet()
                .on_success(|shell: &mut Shell, fetch| {
                    if shell.apply_view(fetch) {
                        shell.notify("view updated");
                    }
                })
                .on_error(|shell: &mut Shell, err| shell.notify(format!("refresh failed: {err}"))),
        );
    }

    /// Replaces view data that differs from what is shown. Missing data and
    /// results for a selection that has since changed leave the view as is.
    pub fn apply_view(&mut self, fetch: ViewFetch) -> bool {
        if fetch.project_id != self.selection.project_id || fetch.task_id != self.selection.task_id {
            debug!("discarding refresh for a stale selection");
            return false;
        }
        let projects = replace_if_changed(&mut self.view.projects, fetch.projects);
        let tasks = replace_if_changed(&mut self.view.tasks, fetch.tasks);
        let launchers = replace_if_changed(&mut self.view.launchers, fetch.launchers);
        if launchers {
            let count = self.view.launchers.len();
            self.selection.launcher = self.selection.launcher.filter(|index| *index < count);
        }
        projects || tasks || launchers
    }

    pub fn handle_command(&mut self, line: &str) {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return;
        };
        let rest = words.collect::<Vec<_>>();
        match (command, rest.as_slice()) {
            ("login", [username, password]) => self.login(username, password),
            ("logout", []) => {
                self.model.logout();
                self.view = ViewState::default();
                self.notify("logged out");
            }
            ("projects", []) => self.list_projects(),
            ("tasks", []) => self.list_tasks(),
            ("launchers", []) => self.list_launchers(),
            ("select", ["project", id]) => match id.parse() {
                Ok(id) => self.select_project(Some(id)),
                Err(_) => self.notify(format!("not a project id: {id}")),
            },
            ("select", ["task", "none"]) => self.select_task(None),
            ("select", ["task", id]) => match id.parse() {
                Ok(id) => self.select_task(Some(id)),
                Err(_) => self.notify(format!("not a task id: {id}")),
            },
            ("select", ["launcher", index]) => match index.parse() {
                Ok(index) => self.select_launcher(index),
                Err(_) => self.notify(format!("not a launcher index: {index}")),
            },
            ("next", []) => self.step_version(VersionStep::Next),
            ("prev", []) => self.step_version(VersionStep::Previous),
            ("launch", []) => self.launch_selected(),
            ("launch", [index]) => match index.parse() {
                Ok(index) => {
                    self.select_launcher(index);
                    self.launch_selected();
                }
                Err(_) => self.notify(format!("not a launcher index: {index}")),
            },
            ("exec", []) => {
                let last = self.prefs.last_command.clone();
                self.run_command(&last);
            }
            ("exec", _) => {
                let command = line.trim_start()["exec".len()..].trim().to_string();
                self.prefs.last_command = command.clone();
                self.save_prefs();
                self.run_command(&command);
            }
            ("icon", [index]) => self.show_icon(index),
            ("user" | "project" | "task" | "launcher", args) => self.admin_command(command, args),
            ("refresh", []) => self.request_refresh(),
            ("status", []) => self.show_status(),
            ("quit" | "exit", []) => self.quit = true,
            ("help", []) => self.notify(HELP),
            _ => self.notify(format!("unknown command: {}", line.trim())),
        }
    }

    fn login(&mut self, username: &str, password: &str) {
        let model = Arc::clone(&self.model);
        let (user, pass) = (username.to_string(), password.to_string());
        self.runner.submit(
            TaskRequest::new("login", move || Ok(model.login(&user, &pass)?))
                .on_success({
                    let username = username.to_string();
                    move |shell: &mut Shell, role| {
                        shell.notify(format!("logged in as {username} ({role:?})"));
                        shell.prefs.account.username = username;
                        shell.prefs.account.remember = true;
                        shell.save_prefs();
                        shell.request_refresh();
                    }
                })
                .on_error(|shell: &mut Shell, err| shell.notify(format!("login failed: {err}"))),
        );
    }

    pub fn select_project(&mut self, project_id: Option<i64>) {
        self.selection.project_id = project_id;
        self.selection.task_id = None;
        self.selection.launcher = None;
        self.view.tasks.clear();
        self.view.launchers.clear();
        self.prefs.project_id = project_id;
        self.prefs.task_id = None;
        self.save_prefs();
        self.request_refresh();
    }

    pub fn select_task(&mut self, task_id: Option<i64>) {
        if self.selection.project_id.is_none() {
            self.notify("select a project first");
            return;
        }
        self.selection.task_id = task_id;
        self.selection.launcher = None;
        self.view.launchers.clear();
        self.prefs.task_id = task_id;
        self.save_prefs();
        self.request_refresh();
    }

    pub fn select_launcher(&mut self, index: usize) {
        if index < self.view.launchers.len() {
            self.selection.launcher = Some(index);
        } else {
            self.notify(format!("no launcher at index {index}"));
        }
    }

    fn selected_launcher(&self) -> Option<&Launcher> {
        self.selection
            .launcher
            .and_then(|index| self.view.launchers.get(index))
    }

    pub fn step_version(&mut self, step: VersionStep) {
        let Some(launcher) = self.selected_launcher() else {
            self.notify("no launcher selected");
            return;
        };
        let (id, count) = (launcher.id, launcher.vdata.len());
        let next = launch::cycle_version(self.selection.version_of(id), count, step);
        let name = launcher.vdata.keys().nth(next).cloned();
        self.selection.versions.insert(id, next);
        if let Some(name) = name {
            self.notify(format!("version {name}"));
        }
    }

    pub fn launch_selected(&mut self) {
        let Some(launcher) = self.selected_launcher() else {
            self.notify("no launcher selected");
            return;
        };
        let command = launch::launcher_command(launcher, self.selection.version_of(launcher.id))
            .map(str::to_string);
        let label = launcher.name.clone();
        match command {
            Ok(command) => self.spawn(&label, &command),
            Err(err) => self.notify(err.to_string()),
        }
    }

    fn run_command(&mut self, command: &str) {
        if command.trim().is_empty() {
            self.notify("nothing to run");
            return;
        }
        self.spawn("exec", command);
    }

    fn spawn(&mut self, label: &str, command: &str) {
        let sink = Arc::new(UiOutput {
            ui: self.runner.ui(),
            label: label.to_string(),
        });
        match self.launcher.spawn(command, sink) {
            Ok(pid) => self.notify(format!("[{label}] started (pid {pid})")),
            Err(err) => self.notify(format!("[{label}] {err}")),
        }
    }

    fn list_projects(&mut self) {
        let mut out = String::new();
        for project in &self.view.projects {
            let marker = if Some(project.id) == self.selection.project_id { '*' } else { ' ' };
            let _ = writeln!(out, "{marker} {:>4}  {}", project.id, project.name);
        }
        self.notify(or_empty(out));
    }

    fn list_tasks(&mut self) {
        let mut out = String::new();
        for node in build_task_tree(&self.view.tasks) {
            render_task(&mut out, &node, 0, self.selection.task_id);
        }
        self.notify(or_empty(out));
    }

    fn list_launchers(&mut self) {
        let mut out = String::new();
        for (index, launcher) in self.view.launchers.iter().enumerate() {
            let marker = if Some(index) == self.selection.launcher { '*' } else { ' ' };
            let version = launcher
                .vdata
                .keys()
                .nth(self.selection.version_of(launcher.id))
                .map(String::as_str)
                .unwrap_or("-");
            let state = if launcher.enabled { "" } else { " (disabled)" };
            let _ = writeln!(out, "{marker} {index:>2}  {} [{version}]{state}", launcher.name);
        }
        self.notify(or_empty(out));
    }

    fn show_status(&mut self) {
        let mut out = String::new();
        let online = if self.model.is_online() { "online" } else { "offline" };
        let _ = write!(out, "{online}");
        if let Some(since) = self.status.last_change() {
            let _ = write!(out, " since {}", since.format("%H:%M:%S"));
        }
        match (self.model.username(), self.model.role()) {
            (Some(user), Some(role)) if self.model.is_authenticated() => {
                let _ = write!(out, "; {user} ({role:?})");
            }
            _ => out.push_str("; not logged in"),
        }
        if self.runner.is_loading() {
            out.push_str("; loading");
        }
        if let Some(tag) = self.update.latest() {
            let _ = write!(out, "; update {tag} available");
        }
        self.notify(out);
    }
}


/// Role-gated management commands. Each one runs in the background and
/// refreshes the view when it changes remote data.
impl Shell {
    fn admin_command(&mut self, noun: &str, args: &[&str]) {
        match (noun, args) {
            ("user", ["list"]) => self.submit_admin(
                "list users",
                Role::Manager,
                |model| model.get_all_users(),
                |shell, users| shell.notify(render_users(users.into_option())),
            ),
            ("user", ["add", username, password, email, role]) => {
                let Some(role) = parse_role(role) else {
                    return self.notify(format!("not a role: {role}"));
                };
                let user = NewUser {
                    username: username.to_string(),
                    password: password.to_string(),
                    email: email.to_string(),
                    role,
                };
                self.submit_admin(
                    "add user",
                    Role::Admin,
                    move |model| model.add_user(&user),
                    |shell, user| shell.notify(format!("user {} created ({})", user.username, user.id)),
                );
            }
            ("user", ["role", id, role]) => {
                let (Some(id), Some(role)) = (self.parse_id(id), parse_role(role)) else {
                    return self.notify("usage: user role <id> member|manager|admin");
                };
                let update = UserUpdate {
                    role: Some(role),
                    ..UserUpdate::default()
                };
                self.submit_admin(
                    "update user",
                    Role::Admin,
                    move |model| model.update_user(id, &update),
                    |shell, user| shell.notify(format!("user {} is now {:?}", user.username, user.role)),
                );
            }
            ("user", ["delete", id]) => {
                let Some(id) = self.parse_id(id) else { return };
                self.submit_admin(
                    "delete user",
                    Role::Admin,
                    move |model| model.delete_user(id),
                    move |shell, _| shell.notify(format!("user {id} deleted")),
                );
            }
            ("project", ["add", name @ ..]) if !name.is_empty() => {
                let name = name.join(" ");
                self.submit_admin(
                    "add project",
                    Role::Manager,
                    move |model| model.add_project(&name),
                    |shell, project| shell.changed(format!("project {} created ({})", project.name, project.id)),
                );
            }
            ("project", ["rename", id, name @ ..]) if !name.is_empty() => {
                let Some(id) = self.parse_id(id) else { return };
                let name = name.join(" ");
                self.submit_admin(
                    "rename project",
                    Role::Manager,
                    move |model| model.update_project(id, &name),
                    |shell, project| shell.changed(format!("project {} renamed to {}", project.id, project.name)),
                );
            }
            ("project", ["delete", id]) => {
                let Some(id) = self.parse_id(id) else { return };
                self.submit_admin(
                    "delete project",
                    Role::Manager,
                    move |model| model.delete_project(id),
                    move |shell, _| {
                        if shell.selection.project_id == Some(id) {
                            shell.select_project(None);
                        }
                        shell.changed(format!("project {id} deleted"));
                    },
                );
            }
            ("project", ["assign", id, users]) => {
                let (Some(id), Some(users)) = (self.parse_id(id), parse_ids(users)) else {
                    return self.notify("usage: project assign <id> <user,user,..|none>");
                };
                self.submit_admin(
                    "assign project",
                    Role::Manager,
                    move |model| model.assign_project(id, &users),
                    move |shell, _| shell.notify(format!("project {id} members updated")),
                );
            }
            ("project", ["members", id]) => {
                let Some(id) = self.parse_id(id) else { return };
                self.submit_admin(
                    "project members",
                    Role::Member,
                    move |model| model.get_project_members(id),
                    |shell, users| shell.notify(render_users(users.into_option())),
                );
            }
            ("task", ["add", title @ ..]) if !title.is_empty() => {
                let Some(project_id) = self.require_project() else { return };
                let (parent, title) = (self.selection.task_id, title.join(" "));
                self.submit_admin(
                    "add task",
                    Role::Manager,
                    move |model| model.add_task(project_id, &title, parent),
                    |shell, task| shell.changed(format!("task {} created ({})", task.title, task.id)),
                );
            }
            ("task", ["rename", id, title @ ..]) if !title.is_empty() => {
                let (Some(project_id), Some(id)) = (self.require_project(), self.parse_id(id)) else {
                    return;
                };
                let title = title.join(" ");
                self.submit_admin(
                    "rename task",
                    Role::Manager,
                    move |model| model.update_task(project_id, id, &title),
                    |shell, task| shell.changed(format!("task {} renamed to {}", task.id, task.title)),
                );
            }
            ("task", ["delete", id]) => {
                let (Some(project_id), Some(id)) = (self.require_project(), self.parse_id(id)) else {
                    return;
                };
                self.submit_admin(
                    "delete task",
                    Role::Manager,
                    move |model| model.delete_task(project_id, id),
                    move |shell, _| {
                        if shell.selection.task_id == Some(id) {
                            shell.select_task(None);
                        }
                        shell.changed(format!("task {id} deleted"));
                    },
                );
            }
            ("task", ["assign", id, users]) => {
                let Some(project_id) = self.require_project() else { return };
                let (Some(id), Some(users)) = (self.parse_id(id), parse_ids(users)) else {
                    return self.notify("usage: task assign <id> <user,user,..|none>");
                };
                self.submit_admin(
                    "assign task",
                    Role::Manager,
                    move |model| model.assign_task(project_id, id, &users),
                    move |shell, _| shell.notify(format!("task {id} members updated")),
                );
            }
            ("task", ["members", id]) => {
                let (Some(project_id), Some(id)) = (self.require_project(), self.parse_id(id)) else {
                    return;
                };
                self.submit_admin(
                    "task members",
                    Role::Member,
                    move |model| model.get_task_members(project_id, id),
                    |shell, users| shell.notify(render_users(users.into_option())),
                );
            }
            ("launcher", ["add", name, version, command @ ..]) if !command.is_empty() => {
                let Some(scope) = self.launcher_scope() else { return };
                let mut vdata = BTreeMap::new();
                vdata.insert(
                    version.to_string(),
                    LauncherVersion {
                        command: command.join(" "),
                        icon: None,
                    },
                );
                let draft = LauncherDraft {
                    name: name.to_string(),
                    vdata,
                    project_id: scope.project_id,
                    task_id: scope.task_id,
                };
                self.submit_admin(
                    "add launcher",
                    Role::Manager,
                    move |model| model.create_launcher(&draft),
                    |shell, launcher| shell.changed(format!("launcher {} created ({})", launcher.name, launcher.id)),
                );
            }
            ("launcher", ["version", index, version, command @ ..]) if !command.is_empty() => {
                let Some((Launcher { id, .. }, mut draft)) = self.launcher_draft(index) else {
                    return;
                };
                let icon = draft.vdata.get(*version).and_then(|v| v.icon.clone());
                draft.vdata.insert(
                    version.to_string(),
                    LauncherVersion {
                        command: command.join(" "),
                        icon,
                    },
                );
                self.submit_admin(
                    "edit launcher",
                    Role::Manager,
                    move |model| model.update_launcher(id, &draft),
                    |shell, launcher| shell.changed(format!("launcher {} updated", launcher.name)),
                );
            }
            ("launcher", ["icon", index, file]) => {
                let Some((launcher, mut draft)) = self.launcher_draft(index) else { return };
                let Some(version) = launcher
                    .vdata
                    .keys()
                    .nth(self.selection.version_of(launcher.id))
                    .cloned()
                else {
                    return self.notify(format!("{} has no versions", launcher.name));
                };
                let file = PathBuf::from(file);
                self.submit_admin(
                    "set launcher icon",
                    Role::Manager,
                    move |model| {
                        let uploaded = model.upload_resource(&file, "launcher_icon")?;
                        let icon = uploaded
                            .path
                            .unwrap_or_else(|| format!("/resources/{}", uploaded.id));
                        if let Some(entry) = draft.vdata.get_mut(&version) {
                            entry.icon = Some(icon);
                        }
                        model.update_launcher(launcher.id, &draft)
                    },
                    |shell, launcher| shell.changed(format!("launcher {} icon updated", launcher.name)),
                );
            }
            ("launcher", [action @ ("enable" | "disable"), index]) => {
                let Some(scope) = self.launcher_scope() else { return };
                let Some(Launcher { id, name, .. }) = self.launcher_at(index) else { return };
                let action = if *action == "enable" {
                    ToggleAction::Enable
                } else {
                    ToggleAction::Disable
                };
                self.submit_admin(
                    "toggle launcher",
                    Role::Manager,
                    move |model| model.toggle_launcher(id, scope, action),
                    move |shell, _| shell.changed(format!("launcher {name} {}d", action.as_str())),
                );
            }
            ("launcher", ["delete", index]) => {
                let Some(scope) = self.launcher_scope() else { return };
                let Some(Launcher { id, name, .. }) = self.launcher_at(index) else { return };
                self.submit_admin(
                    "delete launcher",
                    Role::Manager,
                    move |model| model.delete_launcher(id, scope),
                    move |shell, _| {
                        shell.selection.launcher = None;
                        shell.changed(format!("launcher {name} deleted"));
                    },
                );
            }
            _ => self.notify(format!("unknown command: {noun} {}", args.join(" "))),
        }
    }

    /// Runs `work` on the pool when the session role is at least `needs`.
    fn submit_admin<T, W, D>(&mut self, label: &'static str, needs: Role, work: W, done: D)
    where
        T: Send + 'static,
        W: FnOnce(&MainModel) -> Result<T, PolicyError> + Send + 'static,
        D: FnOnce(&mut Shell, T) + Send + 'static,
    {
        let allowed = self.model.is_authenticated() && self.model.role().is_some_and(|role| role >= needs);
        if !allowed {
            self.notify(format!("{label}: requires {needs:?} role"));
            return;
        }
        let model = Arc::clone(&self.model);
        self.runner.submit(
            TaskRequest::new(label, move || Ok(work(model.as_ref())?))
                .on_success(done)
                .on_error(move |shell: &mut Shell, err| shell.notify(format!("{label} failed: {err}"))),
        );
    }

    fn changed(&mut self, message: String) {
        self.notify(message);
        self.request_refresh();
    }

    fn show_icon(&mut self, index: &str) {
        let Some(launcher) = self.launcher_at(index) else { return };
        let version = launcher
            .vdata
            .values()
            .nth(self.selection.version_of(launcher.id));
        let Some(resource_id) = version.and_then(LauncherVersion::icon_resource) else {
            return self.notify(format!("{} has no uploaded icon", launcher.name));
        };
        let name = launcher.name;
        self.submit_admin(
            "fetch icon",
            Role::Member,
            move |model| model.get_resource(resource_id),
            move |shell, resource| match resource.into_option() {
                Some(resource) => shell.notify(format!(
                    "[{name}] icon {} ({} bytes)",
                    resource.format,
                    resource.data.len()
                )),
                None => shell.notify(format!("[{name}] icon not available offline")),
            },
        );
    }

    fn parse_id(&mut self, text: &str) -> Option<i64> {
        let id = text.parse().ok();
        if id.is_none() {
            self.notify(format!("not an id: {text}"));
        }
        id
    }

    fn require_project(&mut self) -> Option<i64> {
        if self.selection.project_id.is_none() {
            self.notify("select a project first");
        }
        self.selection.project_id
    }

    fn launcher_scope(&mut self) -> Option<Scope> {
        let project_id = self.require_project()?;
        Some(Scope {
            project_id,
            task_id: self.selection.task_id,
        })
    }

    fn launcher_at(&mut self, index: &str) -> Option<Launcher> {
        let launcher = index
            .parse::<usize>()
            .ok()
            .and_then(|index| self.view.launchers.get(index))
            .cloned();
        if launcher.is_none() {
            self.notify(format!("no launcher at index {index}"));
        }
        launcher
    }

    fn launcher_draft(&mut self, index: &str) -> Option<(Launcher, LauncherDraft)> {
        let scope = self.launcher_scope()?;
        let launcher = self.launcher_at(index)?;
        let draft = LauncherDraft {
            name: launcher.name.clone(),
            vdata: launcher.vdata.clone(),
            project_id: launcher.project_id.unwrap_or(scope.project_id),
            task_id: launcher.task_id,
        };
        Some((launcher, draft))
    }
}

fn parse_role(text: &str) -> Option<Role> {
    match text {
        "member" => Some(Role::Member),
        "manager" => Some(Role::Manager),
        "admin" => Some(Role::Admin),
        _ => None,
    }
}

/// Comma-separated ids; `none` clears the list.
fn parse_ids(text: &str) -> Option<Vec<i64>> {
    if text == "none" {
        return Some(Vec::new());
    }
    text.split(',').map(|id| id.trim().parse().ok()).collect()
}

fn render_users(users: Option<Vec<User>>) -> String {
    let Some(users) = users else {
        return "(not available offline)".to_string();
    };
    let mut out = String::new();
    for user in users {
        let _ = writeln!(out, "  {:>4}  {} <{}> {:?}", user.id, user.username, user.email, user.role);
    }
    or_empty(out)
}

const HELP: &str = "commands: login <user> <password>, logout, projects, tasks, launchers, \
select project <id> | task <id|none> | launcher <index>, next, prev, launch [index], \
exec [command], icon <index>, refresh, status, quit\n\
managers: project add|rename|delete|assign|members, task add|rename|delete|assign|members, \
launcher add|version|icon|enable|disable|delete\n\
admins: user list|add|role|delete";

fn or_empty(text: String) -> String {
    if text.is_empty() {
        "(empty)".to_string()
    } else {
        text.trim_end().to_string()
    }
}

fn render_task(out: &mut String, node: &TaskNode, depth: usize, selected: Option<i64>) {
    let marker = if Some(node.task.id) == selected { '*' } else { ' ' };
    let _ = writeln!(
        out,
        "{marker} {:indent$}{:>4}  {}",
        "",
        node.task.id,
        node.task.title,
        indent = depth * 2
    );
    for child in &node.children {
        render_task(out, child, depth + 1, selected);
    }
}

fn replace_if_changed<T: PartialEq>(current: &mut Vec<T>, fetched: Fetched<Vec<T>>) -> bool {
    match fetched.into_option() {
        Some(next) if next != *current => {
            *current = next;
            true
        }
        _ => false,
    }
}

fn fetch_view(
    model: &MainModel,
    project_id: Option<i64>,
    task_id: Option<i64>,
) -> Result<ViewFetch> {
    let projects = model.get_all_projects()?;
    let (tasks, launchers) = match project_id {
        Some(project_id) => (
            model.get_all_tasks(project_id)?,
            model.get_launchers(Scope { project_id, task_id })?,
        ),
        None => (Fetched::Live(Vec::new()), Fetched::Live(Vec::new())),
    };
    Ok(ViewFetch {
        project_id,
        task_id,
        projects,
        tasks,
        launchers,
    })
}

/// Streams launched-command output into the UI queue.
struct UiOutput {
    ui: UiSender<Shell>,
    label: String,
}

impl OutputSink for UiOutput {
    fn line(&self, line: String) {
        let label = self.label.clone();
        self.ui.post(move |shell: &mut Shell| shell.notify(format!("[{label}] {line}")));
    }

    fn exited(&self, code: Option<i32>) {
        let label = self.label.clone();
        self.ui.post(move |shell: &mut Shell| {
            let code = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
            shell.notify(format!("[{label}] exited ({code})"))
        });
    }
}

/// Turns scheduler ticks into runner submissions. Never blocks the timer
/// thread.
pub struct CheckDispatcher {
    runner: TaskRunner<Shell>,
    model: Arc<MainModel>,
    cache: Option<ResultCache>,
    retention: Duration,
    releases: Option<Arc<dyn ReleaseSource>>,
    package: Option<String>,
    current_tag: String,
}

impl CheckDispatcher {
    pub fn new(runner: TaskRunner<Shell>, model: Arc<MainModel>, config: &AppConfig) -> Self {
        let cache = ResultCache::open(&config.cache_dir)
            .map_err(|err| warn!(error = %err, "cache cleanup disabled"))
            .ok();
        let releases = config.release_feed.as_deref().and_then(|feed| {
            HttpReleaseFeed::new(feed)
                .map(|feed| Arc::new(feed) as Arc<dyn ReleaseSource>)
                .map_err(|err| warn!(error = %err, "update check disabled"))
                .ok()
        });
        Self {
            runner,
            model,
            cache,
            retention: config.cache_retention,
            releases,
            package: config.package_name.clone(),
            current_tag: config.current_tag.clone(),
        }
    }

    pub fn with_release_source(mut self, source: Arc<dyn ReleaseSource>) -> Self {
        self.releases = Some(source);
        self
    }

    fn submit_update_check(&self) {
        let (Some(source), Some(package)) = (self.releases.clone(), self.package.clone()) else {
            return;
        };
        let current = self.current_tag.clone();
        self.runner.submit(
            TaskRequest::new("update-check", move || {
                checks::check_for_update(source.as_ref(), &package, &current)
            })
            .quiet()
            .on_success(|shell: &mut Shell, latest: Option<String>| {
                if let Some(latest) = latest {
                    shell.offer_update(&latest);
                }
            })
            .on_error(|_shell: &mut Shell, err| debug!(error = %err, "update check failed")),
        );
    }
}

impl CheckSink for CheckDispatcher {
    fn dispatch(&self, check: ScheduledCheck) {
        match check {
            ScheduledCheck::StatusProbe => {
                let model = Arc::clone(&self.model);
                self.runner.submit(
                    TaskRequest::new("status", move || Ok(model.ping()))
                        .quiet()
                        .on_success(|shell: &mut Shell, reachable| shell.apply_status(reachable)),
                );
            }
            ScheduledCheck::UpdateCheck => self.submit_update_check(),
            ScheduledCheck::CacheClean => {
                if let Some(cache) = self.cache.clone() {
                    let retention = self.retention;
                    self.runner.submit(
                        TaskRequest::new("cache-clean", move || checks::clean_cache(&cache, retention))
                            .quiet(),
                    );
                }
            }
            ScheduledCheck::RefreshUi => {
                self.runner.ui().post(|shell: &mut Shell| shell.request_refresh());
            }
        }
    }
}
