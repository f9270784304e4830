mod common;

use std::collections::BTreeMap;

use common::{DEMO_LAUNCHER, DEMO_PROJECT, DEMO_ROOT_TASK, DevService};
use project_launcher::cache::{Fetched, ResultCache};
use project_launcher::client::{ApiClient, ApiError};
use project_launcher::model::{MainModel, build_task_tree};
use project_launcher::policy::PolicyError;
use project_launcher::types::{
    LauncherDraft, LauncherVersion, NewUser, Role, Scope, ToggleAction, UserUpdate,
};

fn admin_client(service: &DevService) -> ApiClient {
    let client = ApiClient::new(&service.base_url).unwrap();
    client.login("admin", "admin").unwrap();
    client
}

fn demo_scope() -> Scope {
    Scope {
        project_id: DEMO_PROJECT,
        task_id: None,
    }
}

#[test]
fn login_issues_token_and_role() {
    let service = DevService::start();
    let client = ApiClient::new(&service.base_url).unwrap();
    assert!(client.token().is_none());

    let response = client.login("admin", "admin").unwrap();
    assert_eq!(response.role, Role::Admin);
    assert_eq!(client.token().as_deref(), Some(response.token.as_str()));

    assert!(matches!(
        client.login("admin", "wrong"),
        Err(ApiError::Unauthorized)
    ));
}

#[test]
fn ping_distinguishes_reachable_service() {
    let service = DevService::start();
    assert!(ApiClient::new(&service.base_url).unwrap().ping());

    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);
    assert!(!ApiClient::new(&format!("http://{addr}")).unwrap().ping());
}

#[test]
fn errors_map_to_typed_variants() {
    let service = DevService::start();
    let anonymous = ApiClient::new(&service.base_url).unwrap();
    assert!(matches!(anonymous.get_users(), Err(ApiError::Unauthorized)));

    let artist = ApiClient::new(&service.base_url).unwrap();
    artist.login("artist", "artist").unwrap();
    assert!(matches!(artist.create_project("film"), Err(ApiError::Forbidden)));

    let admin = admin_client(&service);
    match admin.get_tasks(999) {
        Err(ApiError::Service { status, error_code, .. }) => {
            assert_eq!(status, 404);
            assert_eq!(error_code, Some(404));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn project_and_task_lifecycle() {
    let service = DevService::start();
    let client = admin_client(&service);

    let project = client.create_project("film").unwrap();
    let renamed = client.update_project(project.id, "feature").unwrap();
    assert_eq!(renamed.name, "feature");

    let parent = client.create_task(project.id, "anim", None).unwrap();
    let child = client.create_task(project.id, "anim-shot010", Some(parent.id)).unwrap();
    client.update_task(project.id, child.id, "anim-sh010").unwrap();

    let tasks = client.get_tasks(project.id).unwrap();
    let tree = build_task_tree(&tasks);
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].children[0].task.title, "anim-sh010");

    client.update_task_members(project.id, parent.id, &[2]).unwrap();
    let members = client.get_task_members(project.id, parent.id).unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].username, "artist");

    client.delete_task(project.id, child.id).unwrap();
    assert_eq!(client.get_tasks(project.id).unwrap().len(), 1);

    client.delete_project(project.id).unwrap();
    assert!(
        client
            .get_projects()
            .unwrap()
            .iter()
            .all(|p| p.id != project.id)
    );
}

#[test]
fn membership_limits_member_project_list() {
    let service = DevService::start();
    let admin = admin_client(&service);
    let hidden = admin.create_project("secret").unwrap();

    let artist = ApiClient::new(&service.base_url).unwrap();
    artist.login("artist", "artist").unwrap();
    let visible = artist.get_projects().unwrap();
    assert!(visible.iter().any(|p| p.id == DEMO_PROJECT));
    assert!(visible.iter().all(|p| p.id != hidden.id));

    admin.update_project_members(hidden.id, &[2]).unwrap();
    assert!(artist.get_projects().unwrap().iter().any(|p| p.id == hidden.id));
    let members = admin.get_project_members(hidden.id).unwrap();
    assert_eq!(members.len(), 1);
}

#[test]
fn user_admin_round_trip() {
    let service = DevService::start();
    let client = admin_client(&service);
    let user = client
        .create_user(&NewUser {
            username: "lead".into(),
            password: "pw".into(),
            email: "lead@studio".into(),
            role: Role::Member,
        })
        .unwrap();
    let promoted = client
        .update_user(
            user.id,
            &UserUpdate {
                role: Some(Role::Manager),
                ..UserUpdate::default()
            },
        )
        .unwrap();
    assert_eq!(promoted.role, Role::Manager);

    let lead = ApiClient::new(&service.base_url).unwrap();
    assert_eq!(lead.login("lead", "pw").unwrap().role, Role::Manager);

    client.delete_user(user.id).unwrap();
    assert!(client.get_users().unwrap().iter().all(|u| u.id != user.id));
}

#[test]
fn launcher_lifecycle_and_toggle() {
    let service = DevService::start();
    let client = admin_client(&service);

    let launchers = client.get_launchers(demo_scope()).unwrap();
    assert_eq!(launchers.len(), 1);
    assert_eq!(launchers[0].id, DEMO_LAUNCHER);

    let mut vdata = BTreeMap::new();
    vdata.insert(
        "20.0".to_string(),
        LauncherVersion {
            command: "houdini".into(),
            icon: None,
        },
    );
    let draft = LauncherDraft {
        name: "houdini".into(),
        vdata,
        project_id: DEMO_PROJECT,
        task_id: Some(DEMO_ROOT_TASK),
    };
    let created = client.create_launcher(&draft).unwrap();
    assert!(created.enabled);

    let task_scope = Scope {
        project_id: DEMO_PROJECT,
        task_id: Some(DEMO_ROOT_TASK),
    };
    client
        .toggle_launcher(created.id, task_scope, ToggleAction::Disable)
        .unwrap();
    let scoped = client.get_launchers(task_scope).unwrap();
    assert_eq!(scoped.len(), 1);
    assert!(!scoped[0].enabled);

    let renamed = client
        .update_launcher(
            created.id,
            &LauncherDraft {
                name: "houdini-fx".into(),
                ..draft
            },
        )
        .unwrap();
    assert_eq!(renamed.name, "houdini-fx");

    client.delete_launcher(created.id, task_scope).unwrap();
    assert!(client.get_launchers(task_scope).unwrap().is_empty());
}

#[test]
fn resources_upload_and_fetch() {
    let service = DevService::start();
    let client = admin_client(&service);
    let dir = tempfile::tempdir().unwrap();
    let icon = dir.path().join("icon.png");
    std::fs::write(&icon, b"\x89PNG fake icon").unwrap();

    let uploaded = client.upload_resource(&icon, "png").unwrap();
    let resource = client.get_resource(uploaded.id).unwrap();
    assert_eq!(resource.data, b"\x89PNG fake icon");
    assert_eq!(resource.format, "PNG");

    let missing = dir.path().join("missing.png");
    assert!(matches!(
        client.upload_resource(&missing, "png"),
        Err(ApiError::File { .. })
    ));
}

#[test]
fn model_replays_cached_reads_when_offline() {
    let service = DevService::start();
    let dir = tempfile::tempdir().unwrap();

    let online = MainModel::new(
        Some(ApiClient::new(&service.base_url).unwrap()),
        Some(ResultCache::open(dir.path()).unwrap()),
    );
    online.set_online(true);
    assert_eq!(online.login("admin", "admin").unwrap(), Role::Admin);
    let live = online.get_all_projects().unwrap();
    let Fetched::Live(projects) = live else {
        panic!("expected live result");
    };
    let live_tasks = online.get_all_tasks(DEMO_PROJECT).unwrap().into_option().unwrap();

    let offline = MainModel::new(
        Some(ApiClient::new(&service.base_url).unwrap()),
        Some(ResultCache::open(dir.path()).unwrap()),
    );
    assert!(!offline.is_online());
    assert_eq!(offline.login("admin", "admin").unwrap(), Role::Admin);
    assert_eq!(offline.get_all_projects().unwrap(), Fetched::Cached(projects));
    assert_eq!(
        offline.get_all_tasks(DEMO_PROJECT).unwrap(),
        Fetched::Cached(live_tasks)
    );
    assert_eq!(offline.get_all_tasks(999).unwrap(), Fetched::Missing);
    assert!(matches!(offline.add_project("film"), Err(PolicyError::Offline)));

    assert!(matches!(
        offline.login("admin", "other"),
        Err(PolicyError::NotAuthenticated)
    ));
}

#[test]
fn model_requires_login_before_reads() {
    let service = DevService::start();
    let model = MainModel::new(Some(ApiClient::new(&service.base_url).unwrap()), None);
    model.set_online(true);
    assert!(matches!(
        model.get_all_projects(),
        Err(PolicyError::NotAuthenticated)
    ));

    model.login("admin", "admin").unwrap();
    let project = model.add_project("film").unwrap();
    assert_eq!(project.name, "film");
    assert!(matches!(model.get_all_projects().unwrap(), Fetched::Live(_)));

    model.set_online(false);
    assert!(matches!(model.add_project("other"), Err(PolicyError::Offline)));
    model.set_online(true);
    assert_eq!(model.relogin().unwrap(), Some(Role::Admin));
}

#[test]
fn model_management_calls_follow_write_policy() {
    let service = DevService::start();
    let model = MainModel::new(Some(ApiClient::new(&service.base_url).unwrap()), None);
    model.set_online(true);
    let scope = demo_scope();

    assert!(matches!(
        model.add_task(DEMO_PROJECT, "comp", None),
        Err(PolicyError::NotAuthenticated)
    ));
    assert!(matches!(
        model.toggle_launcher(DEMO_LAUNCHER, scope, ToggleAction::Disable),
        Err(PolicyError::NotAuthenticated)
    ));
    assert!(matches!(model.get_all_users(), Err(PolicyError::NotAuthenticated)));

    model.login("admin", "admin").unwrap();
    let task = model.add_task(DEMO_PROJECT, "comp", Some(DEMO_ROOT_TASK)).unwrap();
    model.update_task(DEMO_PROJECT, task.id, "comp-v2").unwrap();
    model.assign_task(DEMO_PROJECT, task.id, &[2]).unwrap();
    let members = model
        .get_task_members(DEMO_PROJECT, task.id)
        .unwrap()
        .into_option()
        .unwrap();
    assert_eq!(members[0].username, "artist");
    model.assign_project(DEMO_PROJECT, &[1]).unwrap();
    assert_eq!(
        model
            .get_project_members(DEMO_PROJECT)
            .unwrap()
            .into_option()
            .unwrap()
            .len(),
        1
    );
    model
        .toggle_launcher(DEMO_LAUNCHER, scope, ToggleAction::Disable)
        .unwrap();
    let user = model
        .add_user(&NewUser {
            username: "lead".into(),
            password: "pw".into(),
            email: "lead@studio".into(),
            role: Role::Member,
        })
        .unwrap();
    assert!(matches!(model.get_all_users().unwrap(), Fetched::Live(_)));

    model.set_online(false);
    assert!(matches!(
        model.delete_task(DEMO_PROJECT, task.id),
        Err(PolicyError::Offline)
    ));
    assert!(matches!(
        model.update_user(user.id, &UserUpdate::default()),
        Err(PolicyError::Offline)
    ));
    assert!(matches!(model.delete_user(user.id), Err(PolicyError::Offline)));
    assert!(matches!(
        model.delete_launcher(DEMO_LAUNCHER, scope),
        Err(PolicyError::Offline)
    ));

    model.set_online(true);
    model.delete_task(DEMO_PROJECT, task.id).unwrap();
    model.delete_user(user.id).unwrap();
}

#[test]
fn model_launcher_icon_round_trip_and_offline_replay() {
    let service = DevService::start();
    let dir = tempfile::tempdir().unwrap();
    let icon = dir.path().join("nuke.png");
    std::fs::write(&icon, b"\x89PNG nuke").unwrap();

    let model = MainModel::new(
        Some(ApiClient::new(&service.base_url).unwrap()),
        Some(ResultCache::open(dir.path().join("cache")).unwrap()),
    );
    model.set_online(true);
    model.login("admin", "admin").unwrap();

    let uploaded = model.upload_resource(&icon, "launcher_icon").unwrap();
    let mut vdata = BTreeMap::new();
    vdata.insert(
        "14.0".to_string(),
        LauncherVersion {
            command: "nuke".into(),
            icon: uploaded.path.clone(),
        },
    );
    let draft = LauncherDraft {
        name: "nuke".into(),
        vdata,
        project_id: DEMO_PROJECT,
        task_id: None,
    };
    let launcher = model.create_launcher(&draft).unwrap();
    let resource_id = launcher.vdata["14.0"].icon_resource().unwrap();
    assert_eq!(resource_id, uploaded.id);
    let live = model.get_resource(resource_id).unwrap();
    assert!(matches!(live, Fetched::Live(_)));

    model.set_online(false);
    let cached = model.get_resource(resource_id).unwrap().into_option().unwrap();
    assert_eq!(cached.data, b"\x89PNG nuke");
    assert_eq!(cached.format, "PNG");
    assert!(matches!(
        model.update_launcher(launcher.id, &draft),
        Err(PolicyError::Offline)
    ));
    assert!(matches!(
        model.upload_resource(&icon, "launcher_icon"),
        Err(PolicyError::Offline)
    ));
}
