use std::{
    path::PathBuf,
    process::{Child, Command, Output},
    time::{Duration, Instant},
};

use reqwest::{Client, Response};
use tokio::net::TcpStream;

/// Kubeconfig pointing at a port nothing listens on.
const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: test
  cluster:
    server: http://127.0.0.1:1
contexts:
- name: test
  context:
    cluster: test
    user: test
current-context: test
users:
- name: test
  user: {}
"#;

pub fn get_free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("failed to bind to address")
        .local_addr()
        .unwrap()
        .port()
}

/// Guard that kills and waits on a child process when dropped.
pub struct KillOnDrop(pub Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        drop(self.0.kill());
        drop(self.0.wait());
    }
}

fn write_temp(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("kubeconsole_{}_{name}", std::process::id()));
    std::fs::write(&path, content).expect("failed to write temp file");
    path
}

/// Gateway invocation of `subcommand` with `config_toml` written to a temp file.
fn gateway(subcommand: &str, config_toml: &str, tag: &str) -> Command {
    let config = write_temp(&format!("{tag}.toml"), config_toml);
    let kubeconfig = write_temp(&format!("{tag}.kubeconfig"), KUBECONFIG);
    let mut command = Command::new(env!("CARGO_BIN_EXE_console-gateway"));
    command
        .env("KUBECONFIG", kubeconfig)
        .env("RUST_LOG", "warn")
        .env_remove("KUBERNETES_SERVICE_HOST")
        .env_remove("KUBERNETES_SERVICE_PORT")
        .env_remove("KUBECONSOLE_CONFIG")
        .arg(subcommand)
        .arg("--config")
        .arg(config);
    command
}

/// Runs `check-config` on the given configuration text.
pub fn check_config(config_toml: &str, tag: &str) -> Output {
    gateway("check-config", config_toml, tag)
        .output()
        .expect("failed to run gateway")
}

/// Spawns `serve` with the given configuration on `port`.
pub fn spawn_gateway(config_toml: &str, port: u16) -> Child {
    gateway("serve", config_toml, &format!("serve_{port}"))
        .args(["--port", &port.to_string(), "--bind", "127.0.0.1"])
        .spawn()
        .expect("failed to start gateway")
}

/// Block until a TCP listener is accepting on `127.0.0.1:port` or timeout.
pub async fn wait_for_listening(port: u16, timeout_secs: u64) {
    let start = Instant::now();
    while TcpStream::connect(("127.0.0.1", port)).await.is_err() {
        if start.elapsed() > Duration::from_secs(timeout_secs) {
            panic!("server did not start within timeout");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Client that reports redirects instead of following them.
pub fn http_client() -> Client {
    kubeconsole_gateway::install_crypto_provider();
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Sends a GET for `path` to the gateway on `port`.
pub async fn http_get(client: &Client, port: u16, path: &str) -> Response {
    client
        .get(format!("http://127.0.0.1:{port}{path}"))
        .send()
        .await
        .expect("failed to send request")
}
