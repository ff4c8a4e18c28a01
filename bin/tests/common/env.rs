use std::{
    process::{Child, Command},
    time::{Duration, Instant},
};

/// a running `ipam` process, killed on drop
#[derive(Debug)]
pub(crate) struct IpamServerEnv {
    daemon: Child,
    addr: String,
}

impl IpamServerEnv {
    pub(crate) fn start(config: &str, port: u16) -> Self {
        let config_path = format!("{}/tests/test_configs/{config}", env!("CARGO_MANIFEST_DIR"));
        let addr = format!("127.0.0.1:{port}");
        let mut child = Command::new(env!("CARGO_BIN_EXE_ipam"))
            .arg(format!("--config-path={config_path}"))
            .arg(format!("--ipam-addr={addr}"))
            .arg("--threads=2")
            .arg("--ipam-log=debug")
            .arg("--sweep-interval=1")
            .spawn()
            .expect("Failed to start ipam server");
        std::thread::sleep(Duration::from_millis(200));
        if let Ok(Some(ret)) = child.try_wait() {
            panic!("Failed to start ipam server {:?}", ret);
        }
        Self {
            daemon: child,
            addr,
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// poll /health until it reports GOOD
    pub(crate) async fn wait_healthy(&self, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(resp) = reqwest::get(self.url("/health")).await
                && resp.status().is_success()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("ipam server never became healthy");
    }
}

impl Drop for IpamServerEnv {
    fn drop(&mut self) {
        self.daemon.kill().expect("Failed to stop ipam server");
        let _ = self.daemon.wait();
    }
}
