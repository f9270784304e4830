use std::{
    collections::BTreeMap,
    sync::{Arc, Barrier, mpsc},
    thread,
    time::Duration,
};

use project_launcher::config::ModeKeys;
use project_launcher::env_state::{EnvMap, EnvState};
use project_launcher::instance::{Handoff, InstanceCoordinator, InstanceRole};

const TIMEOUT: Duration = Duration::from_secs(1);

fn vars(pairs: &[(&str, &str)]) -> EnvMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>()
}

#[test]
fn second_start_forwards_environment_to_primary() {
    let dir = tempfile::tempdir().unwrap();
    let first = InstanceCoordinator::new("LauncherTest", dir.path(), TIMEOUT);
    let InstanceRole::Primary(primary) = first.start(&EnvMap::new()).unwrap() else {
        panic!("first start must be primary");
    };
    let (tx, rx) = mpsc::channel();
    let _listener = primary
        .serve(move |handoff| {
            let _ = tx.send(handoff);
        })
        .unwrap();

    let second = InstanceCoordinator::new("LauncherTest", dir.path(), TIMEOUT);
    let role = second
        .start(&vars(&[("OFFLINE_MODE", "1"), ("OTHER", "x")]))
        .unwrap();
    assert!(matches!(role, InstanceRole::Secondary { forwarded: true }));

    let Handoff::Environment(incoming) = rx.recv_timeout(Duration::from_secs(5)).unwrap() else {
        panic!("expected an environment handoff");
    };
    let env = EnvState::from_map(vars(&[("OFFLINE_MODE", "0")]));
    env.apply_handoff(incoming, &ModeKeys::default());
    assert_eq!(env.get("OFFLINE_MODE").as_deref(), Some("0"));
    assert_eq!(env.get("OTHER").as_deref(), Some("x"));
}

#[test]
fn simultaneous_starts_yield_exactly_one_primary() {
    let dir = tempfile::tempdir().unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let handles = (0..2)
        .map(|_| {
            let dir = dir.path().to_path_buf();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let coordinator = InstanceCoordinator::new("LauncherRace", dir, TIMEOUT);
                barrier.wait();
                coordinator.start(&vars(&[("OTHER", "x")])).unwrap()
            })
        })
        .collect::<Vec<_>>();
    let roles = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    let primaries = roles
        .iter()
        .filter(|role| matches!(role, InstanceRole::Primary(_)))
        .count();
    assert_eq!(primaries, 1);
}

#[test]
fn closed_primary_frees_the_channel() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = InstanceCoordinator::new("LauncherRestart", dir.path(), TIMEOUT);
    let InstanceRole::Primary(primary) = coordinator.start(&EnvMap::new()).unwrap() else {
        panic!("first start must be primary");
    };
    let mut listener = primary.serve(|_| {}).unwrap();
    listener.shutdown();
    listener.shutdown();
    drop(listener);

    let role = coordinator.start(&EnvMap::new()).unwrap();
    assert!(matches!(role, InstanceRole::Primary(_)));
}

#[cfg(unix)]
#[test]
fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("LauncherStale.sock"), b"").unwrap();
    let coordinator = InstanceCoordinator::new("LauncherStale", dir.path(), TIMEOUT);
    assert!(matches!(
        coordinator.start(&EnvMap::new()).unwrap(),
        InstanceRole::Primary(_)
    ));
}

#[cfg(unix)]
#[test]
fn shutdown_returns_after_socket_file_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = InstanceCoordinator::new("LauncherSwept", dir.path(), TIMEOUT);
    let InstanceRole::Primary(primary) = coordinator.start(&EnvMap::new()).unwrap() else {
        panic!("first start must be primary");
    };
    let mut listener = primary.serve(|_| {}).unwrap();
    std::fs::remove_file(dir.path().join("LauncherSwept.sock")).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        listener.shutdown();
        let _ = done_tx.send(());
    });
    assert!(done_rx.recv_timeout(Duration::from_secs(3)).is_ok());
}

#[cfg(unix)]
#[test]
fn malformed_payload_is_reported_not_fatal() {
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    let dir = tempfile::tempdir().unwrap();
    let coordinator = InstanceCoordinator::new("LauncherJunk", dir.path(), TIMEOUT);
    let InstanceRole::Primary(primary) = coordinator.start(&EnvMap::new()).unwrap() else {
        panic!("first start must be primary");
    };
    let (tx, rx) = mpsc::channel();
    let _listener = primary
        .serve(move |handoff| {
            let _ = tx.send(handoff);
        })
        .unwrap();

    let mut stream = UnixStream::connect(dir.path().join("LauncherJunk.sock")).unwrap();
    stream.write_all(b"{not json").unwrap();
    drop(stream);
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Handoff::Malformed(_)
    ));

    let second = InstanceCoordinator::new("LauncherJunk", dir.path(), TIMEOUT);
    assert!(matches!(
        second.start(&vars(&[("A", "1")])).unwrap(),
        InstanceRole::Secondary { forwarded: true }
    ));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Handoff::Environment(vars(&[("A", "1")]))
    );
}
