mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use common::{DEMO_PROJECT, DevService};
use project_launcher::cache::ResultCache;
use project_launcher::client::ApiClient;
use project_launcher::config::AppConfig;
use project_launcher::env_state::{EnvMap, EnvState};
use project_launcher::model::MainModel;
use project_launcher::paths::AppDirs;
use project_launcher::runner::{TaskRunner, UiQueue};
use project_launcher::settings::SettingsStore;
use project_launcher::shell::Shell;

/// Pumps the UI queue until a message containing `needle` shows up.
fn pump_until(queue: &UiQueue<Shell>, shell: &mut Shell, seen: &mut Vec<String>, needle: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        queue.wait_and_pump(shell, Duration::from_millis(50));
        seen.extend(shell.take_messages());
        if seen.iter().any(|message| message.contains(needle)) {
            return;
        }
    }
    panic!("never saw {needle:?}; got {seen:?}");
}

/// Pumps the UI queue until `ready` holds for the shell.
fn pump_until_state(
    queue: &UiQueue<Shell>,
    shell: &mut Shell,
    seen: &mut Vec<String>,
    ready: impl Fn(&Shell) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        queue.wait_and_pump(shell, Duration::from_millis(50));
        seen.extend(shell.take_messages());
        if ready(shell) {
            return;
        }
    }
    panic!("shell never reached the expected state; got {seen:?}");
}

fn launcher_index(shell: &Shell, name: &str) -> Option<usize> {
    shell.view().launchers.iter().position(|l| l.name == name)
}

#[test]
fn login_select_and_launch_through_the_shell() {
    let service = DevService::start();
    let root = tempfile::tempdir().unwrap();
    let dirs = AppDirs::at(
        root.path().join("data"),
        root.path().join("config"),
        root.path().join("run"),
    )
    .unwrap();
    let config = Arc::new(AppConfig::with_dirs(&dirs));
    let model = Arc::new(MainModel::new(
        Some(ApiClient::new(&service.base_url).unwrap()),
        Some(ResultCache::open(&config.cache_dir).unwrap()),
    ));
    model.set_online(true);

    let mut vars = EnvMap::new();
    if cfg!(unix) {
        vars.insert("SHELL".into(), "/bin/sh".into());
    }
    let (runner, queue) = TaskRunner::new(2);
    let mut shell = Shell::new(
        Arc::clone(&model),
        EnvState::from_map(vars),
        Arc::clone(&config),
        SettingsStore::new(dirs.settings_file()),
        runner.clone(),
    );
    let mut seen = Vec::new();

    shell.handle_command("login admin admin");
    pump_until(&queue, &mut shell, &mut seen, "view updated");
    assert!(seen.iter().any(|m| m.contains("logged in as admin")));
    assert!(shell.view().projects.iter().any(|p| p.id == DEMO_PROJECT));

    seen.clear();
    shell.handle_command(&format!("select project {DEMO_PROJECT}"));
    pump_until(&queue, &mut shell, &mut seen, "view updated");
    assert_eq!(shell.view().tasks.len(), 2);
    assert_eq!(shell.view().launchers.len(), 1);

    shell.handle_command("tasks");
    let listing = shell.take_messages().join("\n");
    let child = listing
        .lines()
        .find(|line| line.ends_with("layout-shot010"))
        .unwrap();
    let parent = listing.lines().find(|line| line.ends_with("  layout")).unwrap();
    let indent = |line: &str| line.len() - line.trim_start().len();
    assert!(indent(child) > indent(parent));

    if cfg!(unix) {
        seen.clear();
        shell.handle_command("launch 0");
        pump_until(&queue, &mut shell, &mut seen, "exited (0)");
        assert!(seen.iter().any(|m| m == "[echo] launched"));
    }

    let saved = SettingsStore::new(dirs.settings_file()).load().unwrap();
    assert_eq!(saved.project_id, Some(DEMO_PROJECT));
    assert_eq!(saved.account.username, "admin");
    runner.shutdown();
}

#[test]
fn managers_edit_the_catalog_from_the_console() {
    let service = DevService::start();
    let root = tempfile::tempdir().unwrap();
    let dirs = AppDirs::at(
        root.path().join("data"),
        root.path().join("config"),
        root.path().join("run"),
    )
    .unwrap();
    let config = Arc::new(AppConfig::with_dirs(&dirs));
    let model = Arc::new(MainModel::new(
        Some(ApiClient::new(&service.base_url).unwrap()),
        Some(ResultCache::open(&config.cache_dir).unwrap()),
    ));
    model.set_online(true);
    let (runner, queue) = TaskRunner::new(2);
    let mut shell = Shell::new(
        Arc::clone(&model),
        EnvState::from_map(EnvMap::new()),
        Arc::clone(&config),
        SettingsStore::new(dirs.settings_file()),
        runner.clone(),
    );
    let mut seen = Vec::new();

    shell.handle_command("login admin admin");
    pump_until(&queue, &mut shell, &mut seen, "view updated");
    shell.handle_command(&format!("select project {DEMO_PROJECT}"));
    pump_until_state(&queue, &mut shell, &mut seen, |s| s.view().launchers.len() == 1);

    shell.handle_command("launcher add nuke 14.0 echo nuke");
    pump_until_state(&queue, &mut shell, &mut seen, |s| {
        launcher_index(s, "nuke").is_some()
    });
    let index = launcher_index(&shell, "nuke").unwrap();

    shell.handle_command(&format!("launcher disable {index}"));
    pump_until_state(&queue, &mut shell, &mut seen, |s| {
        s.view().launchers.iter().any(|l| l.name == "nuke" && !l.enabled)
    });

    let icon = root.path().join("nuke.png");
    std::fs::write(&icon, b"\x89PNG nuke").unwrap();
    shell.handle_command(&format!("launcher icon {index} {}", icon.display()));
    pump_until_state(&queue, &mut shell, &mut seen, |s| {
        s.view()
            .launchers
            .iter()
            .any(|l| l.name == "nuke" && l.vdata["14.0"].icon_resource().is_some())
    });
    let index = launcher_index(&shell, "nuke").unwrap();
    shell.handle_command(&format!("icon {index}"));
    pump_until(&queue, &mut shell, &mut seen, "[nuke] icon PNG (9 bytes)");

    shell.handle_command("task add comp");
    pump_until_state(&queue, &mut shell, &mut seen, |s| {
        s.view().tasks.iter().any(|t| t.title == "comp" && t.parent_id.is_none())
    });

    seen.clear();
    shell.handle_command(&format!("project members {DEMO_PROJECT}"));
    pump_until(&queue, &mut shell, &mut seen, "artist");
    seen.clear();
    shell.handle_command("user list");
    pump_until(&queue, &mut shell, &mut seen, "admin@localhost");

    shell.handle_command("logout");
    shell.handle_command("login artist artist");
    pump_until(&queue, &mut shell, &mut seen, "logged in as artist");
    seen.extend(shell.take_messages());
    shell.handle_command("project add secret");
    assert_eq!(
        shell.take_messages(),
        vec!["add project: requires Manager role"]
    );
    runner.shutdown();
}
