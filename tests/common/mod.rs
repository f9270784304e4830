#![allow(dead_code)]

use std::{
    net::TcpListener as StdListener,
    sync::Arc,
    thread::{self, JoinHandle},
};

use project_launcher::dev_service::{self, DevState};
use tokio::sync::oneshot;

/// Development service running on a loopback port for one test.
pub struct DevService {
    pub base_url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DevService {
    pub fn start() -> Self {
        let listener = StdListener::bind("127.0.0.1:0").expect("bind loopback");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();

        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("tokio runtime");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).expect("tokio listener");
                dev_service::serve(listener, Arc::new(DevState::seeded()), async {
                    let _ = rx.await;
                })
                .await
                .expect("dev service");
            });
        });

        Self {
            base_url: format!("http://{addr}"),
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }
}

impl Drop for DevService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Ids allocated by `DevState::seeded`.
pub const DEMO_PROJECT: i64 = 3;
pub const DEMO_ROOT_TASK: i64 = 4;
pub const DEMO_LAUNCHER: i64 = 6;
